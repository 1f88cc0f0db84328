//! Read-side projection options that accompany a query.

use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind};

/// Projection options for entity reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Labels to project, in order. Empty means project all labels.
    #[serde(default)]
    pub return_labels: Vec<String>,

    /// Collapse duplicate values; valid only with exactly one return label.
    #[serde(default)]
    pub distinct: bool,
}

impl QueryFilter {
    pub fn validate(&self) -> Result<(), Error> {
        if self.distinct && self.return_labels.len() != 1 {
            return Err(Error::new(
                ErrorKind::InvalidParam,
                "distinct requires exactly one return label",
            ));
        }
        Ok(())
    }
}
