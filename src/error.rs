use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::db::DbError;
use crate::db::models::UploadId;

/// Step of the location search that talked to a collaborator when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStage {
    VisibleUploads,
    LocalLookup,
    DeclaringUploads,
    ReferencingUploads,
    Hydrate,
    BulkLookup,
    Adjust,
    Document,
}

impl SearchStage {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchStage::VisibleUploads => "visible_uploads",
            SearchStage::LocalLookup => "local_lookup",
            SearchStage::DeclaringUploads => "declaring_uploads",
            SearchStage::ReferencingUploads => "referencing_uploads",
            SearchStage::Hydrate => "hydrate",
            SearchStage::BulkLookup => "bulk_lookup",
            SearchStage::Adjust => "adjust",
            SearchStage::Document => "document",
        }
    }
}

impl fmt::Display for SearchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CodeNavError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("malformed symbol {symbol:?}: {reason}")]
    MalformedSymbol { symbol: String, reason: String },
    #[error("{stage} failed{}: {source}", upload_suffix(.upload_id))]
    Upstream {
        stage: SearchStage,
        upload_id: Option<UploadId>,
        #[source]
        source: DbError,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode cursor: {0}")]
    CursorEncoding(String),
}

fn upload_suffix(upload_id: &Option<UploadId>) -> String {
    match upload_id {
        Some(id) => format!(" for upload {id}"),
        None => String::new(),
    }
}

impl CodeNavError {
    pub fn upstream(stage: SearchStage, upload_id: Option<UploadId>, source: DbError) -> Self {
        CodeNavError::Upstream {
            stage,
            upload_id,
            source,
        }
    }

    /// Errors caused by the request itself rather than by a collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CodeNavError::InvalidCursor(_) | CodeNavError::MalformedSymbol { .. }
        )
    }
}

pub type Result<T, E = CodeNavError> = std::result::Result<T, E>;
