//! Label encoding between sentiment strings and contiguous class ids.

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Sorted distinct labels; class id `i` is `classes_[i]`.
///
/// Serialized as `{"classes_": [...]}`, the layout serving reads back.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelEncoder {
    #[serde(rename = "classes_")]
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fit on the training labels.
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let classes: BTreeSet<&str> = labels.iter().map(AsRef::as_ref).collect();
        if classes.is_empty() {
            return Err(MlError::dataset("cannot fit a label encoder on zero labels"));
        }
        Ok(Self {
            classes: classes.into_iter().map(str::to_string).collect(),
        })
    }

    pub fn from_classes(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn transform_one(&self, label: &str) -> Result<usize> {
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .map_err(|_| MlError::invalid_input(format!("unseen label '{label}'")))
    }

    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>> {
        labels.iter().map(|l| self.transform_one(l.as_ref())).collect()
    }

    pub fn inverse_transform_one(&self, id: usize) -> Option<&str> {
        self.classes.get(id).map(String::as_str)
    }

    /// The label for `id`, or the id itself rendered as a string.
    pub fn decode_or_id(&self, id: usize) -> String {
        self.inverse_transform_one(id)
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    /// `{"0": "negative", ...}` as stored in run metadata.
    pub fn id_to_label(&self) -> BTreeMap<String, String> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (i.to_string(), c.clone()))
            .collect()
    }
}
