pub mod adjust;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod hydrate;
pub mod local;
pub mod monikers;
pub mod remote;
pub mod service;
pub mod translate;
pub mod visible;

pub use config::CodeNavConfig;
pub use cursor::{Phase, SearchCursor};
pub use db::models::{
    AdjustedCodeIntelligenceRange, AdjustedLocation, LocationsPage, RequestArgs, UploadRecord,
};
pub use error::{CodeNavError, SearchStage};
pub use service::{CodeNavService, LocationStrategy};
pub use translate::{CommitDiffer, GitTreeTranslator};
