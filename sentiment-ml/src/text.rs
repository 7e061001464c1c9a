//! Text normalization shared by training, serving, EDA and drift checks.
//!
//! `clean_text` lowercases, strips punctuation, and keeps purely alphabetic
//! tokens that are not English stop words. The fitted pipeline applies it
//! as its preprocessing step, so serving always sees the same transform the
//! model was trained with.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// English stop-word list (the NLTK corpus list).
pub const ENGLISH_STOPWORDS: &[&str] = &[
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "you're", "you've",
    "you'll", "you'd", "your", "yours", "yourself", "yourselves", "he", "him", "his", "himself",
    "she", "she's", "her", "hers", "herself", "it", "it's", "its", "itself", "they", "them",
    "their", "theirs", "themselves", "what", "which", "who", "whom", "this", "that", "that'll",
    "these", "those", "am", "is", "are", "was", "were", "be", "been", "being", "have", "has",
    "had", "having", "do", "does", "did", "doing", "a", "an", "the", "and", "but", "if", "or",
    "because", "as", "until", "while", "of", "at", "by", "for", "with", "about", "against",
    "between", "into", "through", "during", "before", "after", "above", "below", "to", "from",
    "up", "down", "in", "out", "on", "off", "over", "under", "again", "further", "then", "once",
    "here", "there", "when", "where", "why", "how", "all", "any", "both", "each", "few", "more",
    "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
    "too", "very", "s", "t", "can", "will", "just", "don", "don't", "should", "should've", "now",
    "d", "ll", "m", "o", "re", "ve", "y", "ain", "aren", "aren't", "couldn", "couldn't", "didn",
    "didn't", "doesn", "doesn't", "hadn", "hadn't", "hasn", "hasn't", "haven", "haven't", "isn",
    "isn't", "ma", "mightn", "mightn't", "mustn", "mustn't", "needn", "needn't", "shan",
    "shan't", "shouldn", "shouldn't", "wasn", "wasn't", "weren", "weren't", "won", "won't",
    "wouldn", "wouldn't",
];

static STOPWORDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ENGLISH_STOPWORDS.iter().copied().collect());

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

/// Tokens that survive normalization, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    NON_WORD
        .replace_all(&lowered, "")
        .split_whitespace()
        .filter(|t| t.chars().all(char::is_alphabetic) && !is_stopword(t))
        .map(str::to_string)
        .collect()
}

/// Normalized text: surviving tokens joined by single spaces.
pub fn clean_text(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Share of characters that are neither letters nor whitespace.
pub fn non_letter_share(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let other = text
        .chars()
        .filter(|c| !c.is_alphabetic() && !c.is_whitespace())
        .count();
    other as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_strips_punctuation_and_stopwords() {
        assert_eq!(
            clean_text("The battery is GREAT!!! Screen, not so much."),
            "battery great screen much"
        );
    }

    #[test]
    fn test_apostrophes_are_removed_before_stopword_check() {
        // "don't" becomes "dont", which is not in the list.
        assert_eq!(clean_text("I don't like it"), "dont like");
    }

    #[test]
    fn test_non_alphabetic_tokens_dropped() {
        assert_eq!(clean_text("5 stars 10/10 a+ phone2 ok"), "stars ok");
    }

    #[test]
    fn test_unicode_letters_kept() {
        assert_eq!(clean_text("Très bien écran"), "très bien écran");
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(clean_text(""), "");
        assert!(tokenize("   \n\t ").is_empty());
    }

    #[test]
    fn test_non_letter_share() {
        assert_eq!(non_letter_share(""), 0.0);
        assert_eq!(non_letter_share("ab!!"), 0.5);
        assert_eq!(non_letter_share("a b"), 0.0);
    }
}
