use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UploadId = i64;
pub type RepositoryId = i64;

/// Zero-based line and character offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start_line: u32, start_character: u32, end_line: u32, end_character: u32) -> Self {
        Self {
            start: Position::new(start_line, start_character),
            end: Position::new(end_line, end_character),
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }
}

/// Anchor of a navigation request plus the page size the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestArgs {
    pub repository_id: RepositoryId,
    pub commit: String,
    pub path: String,
    pub line: u32,
    pub character: u32,
    #[serde(default)]
    pub limit: usize,
}

impl RequestArgs {
    pub fn position(&self) -> Position {
        Position::new(self.line, self.character)
    }
}

/// Metadata of one precise index for a repository at a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub commit: String,
    /// Directory inside the repository the index was produced for; empty or ending in `/`.
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub indexer: String,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    /// Strips the upload root from a repository-relative path.
    pub fn path_within_root<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.root.as_str())
    }

    pub fn repository_path(&self, bundle_path: &str) -> String {
        format!("{}{}", self.root, bundle_path)
    }
}

/// An upload whose commit covers the requested position, with that position
/// expressed in the upload's own coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleUpload {
    #[serde(rename = "k")]
    pub upload_id: UploadId,
    #[serde(rename = "l")]
    pub target_path: String,
    #[serde(rename = "m")]
    pub target_position: Position,
    #[serde(rename = "n")]
    pub target_path_without_root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Moniker {
    pub scheme: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageInformation {
    pub manager: String,
    pub name: String,
    pub version: String,
}

impl fmt::Display for PackageInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.manager, self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedMoniker {
    pub moniker: Moniker,
    pub package: PackageInformation,
}

/// A location in bundle-local coordinates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub upload_id: UploadId,
    pub path: String,
    pub range: Range,
}

/// A location rewritten into the coordinates of the requested commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustedLocation {
    pub upload: UploadRecord,
    pub path: String,
    pub target_commit: String,
    pub target_range: Range,
    /// Set when the range no longer exists at the requested commit; the
    /// location is then reported at the upload's own commit.
    #[serde(default)]
    pub stale: bool,
}

/// Locations answered by one bundle store call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPage {
    pub locations: Vec<Location>,
    pub total: usize,
    #[serde(default)]
    pub symbol_names: Vec<String>,
}

/// One page of a paginated navigation query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationsPage {
    pub locations: Vec<AdjustedLocation>,
    pub next_cursor: Option<String>,
}

/// One range of a document with the same-bundle locations of the symbols
/// occurring there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIntelligenceRange {
    pub range: Range,
    pub definitions: Vec<Location>,
    pub references: Vec<Location>,
    pub implementations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustedCodeIntelligenceRange {
    pub upload: UploadRecord,
    pub range: Range,
    pub definitions: Vec<AdjustedLocation>,
    pub references: Vec<AdjustedLocation>,
    pub implementations: Vec<AdjustedLocation>,
}
