//! Source catalogue of known topic names

use std::path::Path;

use crate::error::Result;

/// A catalogue of topic names that should exist on the cluster.
pub trait SourceCatalogue {
    fn topic_names(&self) -> Box<dyn Iterator<Item = String> + '_>;
}

/// Catalogue backed by a fixed list of names.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogue {
    names: Vec<String>,
}

impl StaticCatalogue {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Read one topic name per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        ))
    }
}

impl SourceCatalogue for StaticCatalogue {
    fn topic_names(&self) -> Box<dyn Iterator<Item = String> + '_> {
        Box::new(self.names.iter().cloned())
    }
}
