use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use serde::{Deserialize, Serialize};
use zstd::stream::read::Decoder;

use crate::db::models::{UploadId, VisibleUpload};
use crate::error::{CodeNavError, Result};

/// Leading byte of every encoded cursor; bump whenever the field layout changes.
pub const CURSOR_SCHEMA_VERSION: u8 = 1;

const CURSOR_COMPRESSION_LEVEL: i32 = 3;
const MAX_DECODED_CURSOR_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Local,
    Remote,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Local => "local",
            Phase::Remote => "remote",
            Phase::Done => "done",
        }
    }
}

/// Resumption state of a paginated location search.
///
/// Every transition consumes the cursor and returns the next value, so a page
/// in flight never shares a cursor with anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCursor {
    #[serde(rename = "a", default)]
    phase: Phase,
    /// Uploads covering the requested position, resolved on the first page.
    #[serde(rename = "b", default, skip_serializing_if = "Vec::is_empty")]
    visible_uploads: Vec<VisibleUpload>,
    /// Number of visible uploads fully consumed.
    #[serde(rename = "c", default)]
    local_upload_offset: usize,
    /// Offset into the locations of the current visible upload.
    #[serde(rename = "d", default)]
    local_location_offset: usize,
    #[serde(rename = "e", default, skip_serializing_if = "BTreeSet::is_empty")]
    symbol_names: BTreeSet<String>,
    /// Paths already returned by the local phase, per upload.
    #[serde(rename = "f", default, skip_serializing_if = "BTreeMap::is_empty")]
    skip_paths: BTreeMap<UploadId, String>,
    #[serde(rename = "g", default, skip_serializing_if = "Option::is_none")]
    definition_upload_ids: Option<Vec<UploadId>>,
    /// Current batch of uploads searched by moniker.
    #[serde(rename = "h", default, skip_serializing_if = "Vec::is_empty")]
    upload_ids: Vec<UploadId>,
    #[serde(rename = "i", default)]
    remote_upload_offset: usize,
    #[serde(rename = "x", default)]
    remote_uploads_exhausted: bool,
    /// Offset into the locations of the current upload batch.
    #[serde(rename = "j", default)]
    remote_location_offset: usize,
}

impl SearchCursor {
    pub fn done() -> Self {
        Self {
            phase: Phase::Done,
            ..Self::default()
        }
    }

    /// An absent or empty token starts a fresh search.
    pub fn from_token(token: Option<&str>) -> Result<Self> {
        match token.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(token) => Self::decode(token),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn visible_uploads(&self) -> &[VisibleUpload] {
        &self.visible_uploads
    }

    pub fn local_upload_offset(&self) -> usize {
        self.local_upload_offset
    }

    pub fn local_location_offset(&self) -> usize {
        self.local_location_offset
    }

    pub fn symbol_names(&self) -> &BTreeSet<String> {
        &self.symbol_names
    }

    pub fn skip_paths(&self) -> &BTreeMap<UploadId, String> {
        &self.skip_paths
    }

    pub fn definition_upload_ids(&self) -> Option<&[UploadId]> {
        self.definition_upload_ids.as_deref()
    }

    pub fn upload_ids(&self) -> &[UploadId] {
        &self.upload_ids
    }

    pub fn remote_upload_offset(&self) -> usize {
        self.remote_upload_offset
    }

    pub fn remote_uploads_exhausted(&self) -> bool {
        self.remote_uploads_exhausted
    }

    pub fn remote_location_offset(&self) -> usize {
        self.remote_location_offset
    }

    /// Moves the phase forward; a request for an earlier phase is ignored.
    pub fn advance_to(mut self, phase: Phase) -> Self {
        self.phase = self.phase.max(phase);
        self
    }

    pub fn with_visible_uploads(mut self, visible_uploads: Vec<VisibleUpload>) -> Self {
        self.visible_uploads = visible_uploads;
        self
    }

    pub fn with_symbol_names<I>(mut self, symbol_names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.symbol_names.extend(symbol_names);
        self
    }

    /// Records a path returned by the local phase. An existing entry for the
    /// upload is kept.
    pub fn with_skip_path(mut self, upload_id: UploadId, path: impl Into<String>) -> Self {
        self.skip_paths.entry(upload_id).or_insert_with(|| path.into());
        self
    }

    pub fn with_definition_upload_ids(mut self, ids: Vec<UploadId>) -> Self {
        self.definition_upload_ids = Some(ids);
        self
    }

    pub fn with_upload_batch(mut self, ids: Vec<UploadId>) -> Self {
        self.upload_ids = ids;
        self
    }

    /// Consumes `n` locations of the current visible upload, moving on to the
    /// next upload once `total` have been consumed.
    pub fn bump_local_location_offset(mut self, n: usize, total: usize) -> Self {
        self.local_location_offset += n;
        if self.local_location_offset >= total {
            self.local_upload_offset += 1;
            self.local_location_offset = 0;
        }
        self
    }

    /// Accounts for `n` more referencing uploads; without further batches the
    /// remote uploads are exhausted.
    pub fn bump_remote_upload_offset(mut self, n: usize, has_more: bool) -> Self {
        self.remote_upload_offset += n;
        if !has_more {
            self.remote_uploads_exhausted = true;
        }
        self
    }

    /// Consumes `n` locations of the current upload batch, clearing the batch
    /// once `total` have been consumed so the next batch gets fetched.
    pub fn bump_remote_location_offset(mut self, n: usize, total: usize) -> Self {
        self.remote_location_offset += n;
        if self.remote_location_offset >= total {
            self.upload_ids.clear();
            self.remote_location_offset = 0;
        }
        self
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|err| CodeNavError::CursorEncoding(err.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), CURSOR_COMPRESSION_LEVEL)
            .map_err(|err| CodeNavError::CursorEncoding(err.to_string()))?;

        let mut payload = Vec::with_capacity(compressed.len() + 1);
        payload.push(CURSOR_SCHEMA_VERSION);
        payload.extend_from_slice(&compressed);
        Ok(BASE64.encode(payload))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let payload = BASE64
            .decode(token.as_bytes())
            .map_err(|err| CodeNavError::InvalidCursor(format!("invalid base64: {err}")))?;

        let (version, compressed) = payload
            .split_first()
            .ok_or_else(|| CodeNavError::InvalidCursor("empty cursor".into()))?;
        if *version != CURSOR_SCHEMA_VERSION {
            return Err(CodeNavError::InvalidCursor(format!(
                "unsupported cursor schema version {version}"
            )));
        }

        let decoder = Decoder::new(compressed)
            .map_err(|err| CodeNavError::InvalidCursor(format!("invalid compression: {err}")))?;
        let mut json = Vec::new();
        decoder
            .take(MAX_DECODED_CURSOR_BYTES + 1)
            .read_to_end(&mut json)
            .map_err(|err| CodeNavError::InvalidCursor(format!("invalid compression: {err}")))?;
        if json.len() as u64 > MAX_DECODED_CURSOR_BYTES {
            return Err(CodeNavError::InvalidCursor("cursor is too large".into()));
        }

        serde_json::from_slice(&json)
            .map_err(|err| CodeNavError::InvalidCursor(format!("invalid payload: {err}")))
    }
}
