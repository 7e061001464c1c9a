//! Review datasets: CSV reading and writing, preparation, stratified splits.

use crate::error::{MlError, Result};
use crate::labels::LabelEncoder;
use crate::text::clean_text;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub const REVIEW_COLUMN: &str = "review_text";
pub const TARGET_COLUMN: &str = "sentiment";
/// Alternate name some exports use for the review column.
const ALT_REVIEW_COLUMN: &str = "text";

/// A parsed CSV: header plus string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of one column; short rows read as empty strings.
    pub fn column(&self, name: &str) -> Option<Vec<String>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|r| r.get(idx).cloned().unwrap_or_default())
                .collect(),
        )
    }

    pub fn rename_column(&mut self, from: &str, to: &str) {
        if self.column_index(to).is_some() {
            return;
        }
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    /// Parse RFC 4180 style CSV: quoted fields may hold commas, quotes
    /// (doubled) and newlines. A leading UTF-8 BOM is ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let mut records = parse_records(input)?.into_iter();
        let columns: Vec<String> = records
            .next()
            .ok_or_else(|| MlError::dataset("Empty CSV file"))?
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        let rows = records
            .filter(|r| !(r.len() == 1 && r[0].trim().is_empty()))
            .collect();
        Ok(Self { columns, rows })
    }

    /// Parse bytes, falling back to Latin-1 when they are not valid UTF-8.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self> {
        match std::str::from_utf8(bytes) {
            Ok(s) => Self::parse(s),
            Err(_) => {
                let decoded: String = bytes.iter().map(|&b| b as char).collect();
                Self::parse(&decoded)
            }
        }
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| MlError::dataset(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse_bytes(&bytes)
    }

    /// The raw `review_text,sentiment` columns (accepting `text` for the
    /// review), uncleaned, without rows whose review or label is blank.
    pub fn labeled_columns(&self) -> Result<Table> {
        let mut table = self.clone();
        table.rename_column(ALT_REVIEW_COLUMN, REVIEW_COLUMN);
        let texts = table
            .column(REVIEW_COLUMN)
            .ok_or_else(|| MlError::dataset(format!("missing column {REVIEW_COLUMN}")))?;
        let labels = table
            .column(TARGET_COLUMN)
            .ok_or_else(|| MlError::dataset(format!("missing column {TARGET_COLUMN}")))?;
        let mut out = Table::new(vec![REVIEW_COLUMN.to_string(), TARGET_COLUMN.to_string()]);
        out.rows = texts
            .into_iter()
            .zip(labels)
            .filter(|(t, l)| !t.trim().is_empty() && !l.trim().is_empty())
            .map(|(t, l)| vec![t, l])
            .collect();
        Ok(out)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_record(&mut out, &self.columns);
        for row in &self.rows {
            write_record(&mut out, row);
        }
        out
    }
}

fn parse_records(input: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(MlError::dataset("unterminated quoted field in CSV"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn write_record(out: &mut String, fields: &[String]) {
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if f.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&f.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(f);
        }
    }
    out.push('\n');
}

/// Cleaned review texts with their string labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub texts: Vec<String>,
    pub labels: Vec<String>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn extend(&mut self, other: Dataset) {
        self.texts.extend(other.texts);
        self.labels.extend(other.labels);
    }

    /// Take `review_text` (or `text`) and `sentiment`, lowercase labels,
    /// clean texts, and drop rows where either side ends up empty.
    pub fn from_table(mut table: Table) -> Result<Self> {
        table.rename_column(ALT_REVIEW_COLUMN, REVIEW_COLUMN);
        let texts = table
            .column(REVIEW_COLUMN)
            .ok_or_else(|| MlError::dataset(format!("missing column {REVIEW_COLUMN}")))?;
        let labels = table
            .column(TARGET_COLUMN)
            .ok_or_else(|| MlError::dataset(format!("missing column {TARGET_COLUMN}")))?;

        let mut dataset = Dataset::default();
        let mut dropped = 0usize;
        for (text, label) in texts.iter().zip(&labels) {
            let label = label.trim().to_lowercase();
            let cleaned = clean_text(text);
            if label.is_empty() || cleaned.is_empty() {
                dropped += 1;
                continue;
            }
            dataset.texts.push(cleaned);
            dataset.labels.push(label);
        }
        if dropped > 0 {
            debug!(dropped, kept = dataset.len(), "Dropped empty rows");
        }
        Ok(dataset)
    }

    /// Rows per label.
    pub fn label_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for label in &self.labels {
            *counts.entry(label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

async fn csv_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let p = entry.path();
        if p.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv")) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Raw labeled rows of every `*.csv` in `dir`, merged in name order.
/// Unreadable files are skipped.
pub async fn read_labeled_dir(dir: &Path) -> Result<Table> {
    let files = csv_files(dir).await?;
    let mut merged = Table::new(vec![REVIEW_COLUMN.to_string(), TARGET_COLUMN.to_string()]);
    for file in &files {
        match Table::read(file).await.and_then(|t| t.labeled_columns()) {
            Ok(t) => merged.rows.extend(t.rows),
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable CSV"),
        }
    }
    Ok(merged)
}

/// Load one CSV file, or merge every `*.csv` in a directory (sorted by name).
pub async fn prepare_dataset(path: &Path) -> Result<Dataset> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| MlError::dataset(format!("Failed to read {}: {e}", path.display())))?;
    if !meta.is_dir() {
        return Dataset::from_table(Table::read(path).await?);
    }

    let files = csv_files(path).await?;

    let mut merged = Dataset::default();
    for file in &files {
        match Table::read(file).await.and_then(Dataset::from_table) {
            Ok(ds) => merged.extend(ds),
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable CSV"),
        }
    }
    if merged.is_empty() {
        return Err(MlError::dataset(format!(
            "no usable rows in {} ({} csv files)",
            path.display(),
            files.len()
        )));
    }
    info!(files = files.len(), rows = merged.len(), "Merged dataset directory");
    Ok(merged)
}

/// Train/validation partition with encoded labels.
#[derive(Debug, Clone)]
pub struct Split {
    pub train_texts: Vec<String>,
    pub train_labels: Vec<usize>,
    pub valid_texts: Vec<String>,
    pub valid_labels: Vec<usize>,
    pub encoder: LabelEncoder,
}

impl Split {
    pub fn n_classes(&self) -> usize {
        self.encoder.len()
    }
}

/// Stratified split: each class contributes `round(count * test_size)`
/// rows to validation, at least one to each side when it has two or more.
pub fn stratified_split(dataset: &Dataset, test_size: f64, seed: u64) -> Result<Split> {
    if dataset.is_empty() {
        return Err(MlError::dataset("cannot split an empty dataset"));
    }
    if !(0.0..1.0).contains(&test_size) || test_size == 0.0 {
        return Err(MlError::invalid_input(format!(
            "test_size must be in (0, 1), got {test_size}"
        )));
    }
    let encoder = LabelEncoder::fit(&dataset.labels)?;
    let encoded = encoder.transform(&dataset.labels)?;

    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); encoder.len()];
    for (i, &label) in encoded.iter().enumerate() {
        by_class[label].push(i);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train_idx = Vec::new();
    let mut valid_idx = Vec::new();
    for mut rows in by_class {
        rows.shuffle(&mut rng);
        let n = rows.len();
        let mut n_valid = (n as f64 * test_size).round() as usize;
        if n >= 2 {
            n_valid = n_valid.clamp(1, n - 1);
        } else {
            n_valid = 0;
        }
        valid_idx.extend_from_slice(&rows[..n_valid]);
        train_idx.extend_from_slice(&rows[n_valid..]);
    }
    train_idx.shuffle(&mut rng);
    valid_idx.shuffle(&mut rng);

    if valid_idx.is_empty() {
        return Err(MlError::dataset(
            "dataset too small for a validation split (every class has one row)",
        ));
    }

    let pick = |idx: &[usize]| -> (Vec<String>, Vec<usize>) {
        idx.iter()
            .map(|&i| (dataset.texts[i].clone(), encoded[i]))
            .unzip()
    };
    let (train_texts, train_labels) = pick(&train_idx);
    let (valid_texts, valid_labels) = pick(&valid_idx);
    Ok(Split {
        train_texts,
        train_labels,
        valid_texts,
        valid_labels,
        encoder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_quoted_fields() {
        let csv = "review_text,sentiment\n\"Good, really \"\"good\"\"\",Positive\n\"multi\nline\",negative\n";
        let table = Table::parse(csv).unwrap();
        assert_eq!(table.columns, vec!["review_text", "sentiment"]);
        assert_eq!(table.rows[0][0], "Good, really \"good\"");
        assert_eq!(table.rows[1][0], "multi\nline");
        assert_eq!(Table::parse(&table.to_csv()).unwrap(), table);
    }

    #[test]
    fn test_parse_tolerates_bom_crlf_and_missing_trailing_newline() {
        let table = Table::parse("\u{feff}a,b\r\n1,2\r\n3,4").unwrap();
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.rows, vec![vec!["1", "2"], vec!["3", "4"]]);
    }

    #[test]
    fn test_unterminated_quote_is_an_error() {
        assert!(Table::parse("a\n\"oops\n").is_err());
        assert!(Table::parse("").is_err());
    }

    #[test]
    fn test_latin1_fallback() {
        let bytes = b"review_text,sentiment\ncaf\xe9 great,Positive\n";
        let table = Table::parse_bytes(bytes).unwrap();
        assert_eq!(table.rows[0][0], "caf\u{e9} great");
    }

    #[test]
    fn test_dataset_from_table_renames_and_cleans() {
        let table = Table::parse("text,sentiment\nThe Battery is GREAT!,Positive\n!!!,negative\nok phone,\n").unwrap();
        let ds = Dataset::from_table(table).unwrap();
        assert_eq!(ds.texts, vec!["battery great"]);
        assert_eq!(ds.labels, vec!["positive"]);
    }

    #[test]
    fn test_labeled_columns_keep_raw_text() {
        let table = Table::parse(
            "brand,text,sentiment,rating\nAcme,\"The Battery is GREAT, wow!\",Positive,5\nAcme,,negative,1\nZed,fine,,3\n",
        )
        .unwrap();
        let labeled = table.labeled_columns().unwrap();
        assert_eq!(labeled.columns, vec!["review_text", "sentiment"]);
        assert_eq!(
            labeled.rows,
            vec![vec!["The Battery is GREAT, wow!".to_string(), "Positive".to_string()]]
        );
        assert!(Table::parse("comment\nhi\n").unwrap().labeled_columns().is_err());
    }

    #[test]
    fn test_missing_label_column() {
        let table = Table::parse("review_text\nhello\n").unwrap();
        assert!(Dataset::from_table(table).is_err());
    }

    #[tokio::test]
    async fn test_prepare_dataset_merges_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "review_text,sentiment\ngreat phone,positive\n").unwrap();
        std::fs::write(dir.path().join("b.csv"), "text,sentiment\nawful screen,Negative\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let ds = prepare_dataset(dir.path()).await.unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.labels, vec!["positive", "negative"]);
    }

    #[test]
    fn test_stratified_split_keeps_every_class_on_both_sides() {
        let mut ds = Dataset::default();
        for i in 0..10 {
            ds.texts.push(format!("positive review number{i}"));
            ds.labels.push("positive".into());
        }
        for i in 0..4 {
            ds.texts.push(format!("negative review number{i}"));
            ds.labels.push("negative".into());
        }
        let split = stratified_split(&ds, 0.5, 42).unwrap();
        assert_eq!(split.train_texts.len() + split.valid_texts.len(), 14);
        assert_eq!(split.valid_labels.iter().filter(|&&l| l == 0).count(), 2);
        assert_eq!(split.valid_labels.iter().filter(|&&l| l == 1).count(), 5);
        assert_eq!(split.n_classes(), 2);

        let again = stratified_split(&ds, 0.5, 42).unwrap();
        assert_eq!(again.valid_texts, split.valid_texts);
    }

    #[test]
    fn test_split_rejects_bad_test_size() {
        let ds = Dataset {
            texts: vec!["a b".into(), "c d".into()],
            labels: vec!["x".into(), "x".into()],
        };
        assert!(stratified_split(&ds, 0.0, 1).is_err());
        assert!(stratified_split(&ds, 1.0, 1).is_err());
    }
}
