//! Training-vs-validation data drift report (Jensen–Shannon distance).

use crate::text::tokenize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Distance at or above which a column counts as drifted.
pub const JS_THRESHOLD: f64 = 0.1;
const LENGTH_BINS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDrift {
    pub column: String,
    pub stattest: String,
    pub distance: f64,
    pub threshold: f64,
    pub drift_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDriftReport {
    pub reference_rows: usize,
    pub current_rows: usize,
    pub columns: Vec<ColumnDrift>,
    pub number_of_drifted_columns: usize,
    pub drift_share: f64,
}

/// Jensen–Shannon distance (base 2, so in [0, 1]) between two count vectors.
pub fn jensen_shannon(p: &[f64], q: &[f64]) -> f64 {
    let sp: f64 = p.iter().sum();
    let sq: f64 = q.iter().sum();
    if sp <= 0.0 || sq <= 0.0 {
        return if sp <= 0.0 && sq <= 0.0 { 0.0 } else { 1.0 };
    }
    let kl = |a: &[f64], sa: f64, m: &[f64]| -> f64 {
        a.iter()
            .zip(m)
            .filter(|(x, _)| **x > 0.0)
            .map(|(x, mi)| {
                let pi = x / sa;
                pi * (pi / mi).log2()
            })
            .sum()
    };
    let m: Vec<f64> = p.iter().zip(q).map(|(a, b)| 0.5 * (a / sp + b / sq)).collect();
    let js = 0.5 * kl(p, sp, &m) + 0.5 * kl(q, sq, &m);
    js.max(0.0).sqrt().min(1.0)
}

fn categorical_counts(a: &[usize], b: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let k = a.iter().chain(b).copied().max().map(|m| m + 1).unwrap_or(0);
    let mut pa = vec![0.0; k];
    let mut pb = vec![0.0; k];
    a.iter().for_each(|&v| pa[v] += 1.0);
    b.iter().for_each(|&v| pb[v] += 1.0);
    (pa, pb)
}

fn token_counts(a: &[String], b: &[String]) -> (Vec<f64>, Vec<f64>) {
    let mut index: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for t in a.iter().flat_map(|t| tokenize(t)) {
        index.entry(t).or_default().0 += 1.0;
    }
    for t in b.iter().flat_map(|t| tokenize(t)) {
        index.entry(t).or_default().1 += 1.0;
    }
    index.into_values().unzip()
}

/// Equal-width histograms over the joint range of both samples.
pub(crate) fn histograms(a: &[f64], b: &[f64], bins: usize) -> (Vec<f64>, Vec<f64>) {
    let lo = a.iter().chain(b).copied().fold(f64::INFINITY, f64::min);
    let hi = a.iter().chain(b).copied().fold(f64::NEG_INFINITY, f64::max);
    let mut ha = vec![0.0; bins];
    let mut hb = vec![0.0; bins];
    if !lo.is_finite() || !hi.is_finite() {
        return (ha, hb);
    }
    let width = ((hi - lo) / bins as f64).max(f64::EPSILON);
    let bin = |v: f64| (((v - lo) / width) as usize).min(bins - 1);
    a.iter().for_each(|&v| ha[bin(v)] += 1.0);
    b.iter().for_each(|&v| hb[bin(v)] += 1.0);
    (ha, hb)
}

fn column(name: &str, distance: f64) -> ColumnDrift {
    ColumnDrift {
        column: name.to_string(),
        stattest: "jensenshannon".to_string(),
        distance,
        threshold: JS_THRESHOLD,
        drift_detected: distance >= JS_THRESHOLD,
    }
}

/// Compare the reference split (text, target, prediction) with the current one.
pub fn data_drift_report(
    reference: (&[String], &[usize], &[usize]),
    current: (&[String], &[usize], &[usize]),
) -> DataDriftReport {
    let (ref_text, ref_target, ref_pred) = reference;
    let (cur_text, cur_target, cur_pred) = current;

    let (pt, qt) = token_counts(ref_text, cur_text);
    let lengths = |texts: &[String]| -> Vec<f64> { texts.iter().map(|t| t.chars().count() as f64).collect() };
    let (pl, ql) = histograms(&lengths(ref_text), &lengths(cur_text), LENGTH_BINS);
    let (pg, qg) = categorical_counts(ref_target, cur_target);
    let (pp, qp) = categorical_counts(ref_pred, cur_pred);

    let columns = vec![
        column("review_text", jensen_shannon(&pt, &qt)),
        column("text_length", jensen_shannon(&pl, &ql)),
        column("target", jensen_shannon(&pg, &qg)),
        column("prediction", jensen_shannon(&pp, &qp)),
    ];
    let drifted = columns.iter().filter(|c| c.drift_detected).count();
    DataDriftReport {
        reference_rows: ref_text.len(),
        current_rows: cur_text.len(),
        drift_share: drifted as f64 / columns.len() as f64,
        number_of_drifted_columns: drifted,
        columns,
    }
}

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal standalone HTML page with a summary list and one table.
pub(crate) fn render_html(
    title: &str,
    summary: &[(&str, String)],
    headers: &[&str],
    rows: &[Vec<String>],
) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{t}</title>\
         <style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #ccc;padding:4px 8px}}.drift{{color:#b00020}}</style>\
         </head><body><h1>{t}</h1><ul>",
        t = escape_html(title)
    );
    for (k, v) in summary {
        let _ = write!(html, "<li><b>{}</b>: {}</li>", escape_html(k), escape_html(v));
    }
    html.push_str("</ul><table><tr>");
    for h in headers {
        let _ = write!(html, "<th>{}</th>", escape_html(h));
    }
    html.push_str("</tr>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            let _ = write!(html, "<td>{}</td>", escape_html(cell));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table></body></html>\n");
    html
}

impl DataDriftReport {
    pub fn to_html(&self) -> String {
        let rows: Vec<Vec<String>> = self
            .columns
            .iter()
            .map(|c| {
                vec![
                    c.column.clone(),
                    c.stattest.clone(),
                    format!("{:.4}", c.distance),
                    format!("{:.2}", c.threshold),
                    c.drift_detected.to_string(),
                ]
            })
            .collect();
        render_html(
            "Data Drift Report",
            &[
                ("Reference rows", self.reference_rows.to_string()),
                ("Current rows", self.current_rows.to_string()),
                (
                    "Drifted columns",
                    format!("{} of {}", self.number_of_drifted_columns, self.columns.len()),
                ),
                ("Drift share", format!("{:.3}", self.drift_share)),
            ],
            &["column", "stattest", "distance", "threshold", "drift"],
            &rows,
        )
    }
}
