// Instance module - one row of a Matrix
//
// The row position lives in the matrix index; an Instance only carries the
// identity, its labels and the export/partial flags.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    key: String,
    labels: BTreeMap<String, String>,
    exportable: bool,
    partial: bool,
}

impl Instance {
    pub fn new(key: &str) -> Self {
        Instance {
            key: key.to_string(),
            labels: BTreeMap::new(),
            exportable: true,
            partial: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn set_labels<'a>(&mut self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (k, v) in labels {
            self.set_label(k, v);
        }
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        self.labels.remove(key)
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// True while the cluster reports an incomplete sample for this row
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    /// Same identity and labels with default flags
    pub(super) fn identity_copy(&self) -> Self {
        Instance {
            key: self.key.clone(),
            labels: self.labels.clone(),
            exportable: true,
            partial: false,
        }
    }
}
