use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifies one logical cell execution: the notebook document it lives in
/// plus the cell's persisted `metadata.id`.
///
/// Derived from document state only, so a key survives worker restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub path: PathBuf,
    pub cell_id: String,
}

impl ExecutionKey {
    pub fn new(path: impl Into<PathBuf>, cell_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cell_id: cell_id.into(),
        }
    }

    /// Whether this key belongs to the document at `path`.
    pub fn in_document(&self, path: &Path) -> bool {
        self.path == path
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path.display(), self.cell_id)
    }
}

/// Terminal (or not yet terminal) state of a cell execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Success,
    Failure,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Map the `success` flag reported at completion to a terminal status.
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}
