//! Chunk manifests for large snapshot transfers.
//!
//! A snapshot is written as independent chunks plus one manifest listing
//! each chunk's size, item count and checksum. The manifest carries its own
//! checksum over `{version, timestamp, chunks, metadata}` so a reader can
//! reject a torn or corrupted manifest before touching any chunk.
//!
//! Field names are camelCase on the wire to stay readable by existing
//! clients of the same remote store.

use crate::checksum::ChecksumValidator;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MANIFEST_VERSION: &str = "2.0";
/// Minimum encrypted chunk size in bytes.
pub const MIN_CHUNK_SIZE: usize = 16;
/// Minimum IV size in bytes.
pub const MIN_IV_SIZE: usize = 12;
pub const CLOCK_SKEW_TOLERANCE_MS: u64 = 5 * 60 * 1000;
pub const MAX_DATA_AGE_HOURS: u64 = 24;

// ---------------------------------------------------------------------------
// Manifest types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    /// Serialized JSON size in bytes.
    pub size: usize,
    pub item_count: usize,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub total_chunks: usize,
    pub total_size: usize,
    /// Caller-supplied fields (budget id, schema version, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestValidation {
    pub manifest_checksum: String,
    pub min_chunk_size: usize,
    #[serde(rename = "minIVSize")]
    pub min_iv_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    /// Creation time, ms since the Unix epoch.
    pub timestamp: u64,
    pub chunks: BTreeMap<String, ChunkInfo>,
    pub metadata: ManifestMetadata,
    pub validation: ManifestValidation,
}

/// The checksummed part of a manifest.
#[derive(Serialize)]
struct ManifestBody<'a> {
    version: &'a str,
    timestamp: u64,
    chunks: &'a BTreeMap<String, ChunkInfo>,
    metadata: &'a ManifestMetadata,
}

impl Manifest {
    fn body_checksum(&self) -> SyncResult<String> {
        let body = serde_json::to_string(&ManifestBody {
            version: &self.version,
            timestamp: self.timestamp,
            chunks: &self.chunks,
            metadata: &self.metadata,
        })?;
        Ok(ChecksumValidator::default().generate(body))
    }

    /// Fails with `ChecksumMismatch` when the manifest body was altered.
    pub fn verify_checksum(&self) -> SyncResult<()> {
        let actual = self.body_checksum()?;
        if actual == self.validation.manifest_checksum {
            Ok(())
        } else {
            Err(SyncError::ChecksumMismatch {
                subject: "manifest".into(),
                expected: self.validation.manifest_checksum.clone(),
                actual,
            })
        }
    }

    /// Checks a downloaded chunk against the checksum recorded for it.
    pub fn verify_chunk(&self, chunk_id: &str, data: &Value) -> SyncResult<()> {
        let info = self.chunks.get(chunk_id).ok_or_else(|| {
            SyncError::InvalidInput(format!("chunk {chunk_id} is not listed in the manifest"))
        })?;
        let serialized = serde_json::to_string(data)?;
        ChecksumValidator::default().verify(&format!("chunk {chunk_id}"), serialized, &info.checksum)
    }
}

/// Builds a manifest for `chunks`, checksumming every chunk and the result.
pub fn build_manifest(
    chunks: &BTreeMap<String, Value>,
    extra: Map<String, Value>,
    now_ms: u64,
) -> SyncResult<Manifest> {
    let validator = ChecksumValidator::default();
    let mut manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        timestamp: now_ms,
        chunks: BTreeMap::new(),
        metadata: ManifestMetadata {
            total_chunks: 0,
            total_size: 0,
            extra,
        },
        validation: ManifestValidation {
            manifest_checksum: String::new(),
            min_chunk_size: MIN_CHUNK_SIZE,
            min_iv_size: MIN_IV_SIZE,
        },
    };

    for (chunk_id, data) in chunks {
        let serialized = serde_json::to_string(data)?;
        let (kind, item_count) = match data {
            Value::Array(items) => (ChunkKind::Array, items.len()),
            _ => (ChunkKind::Object, 1),
        };
        manifest.metadata.total_size += serialized.len();
        manifest.metadata.total_chunks += 1;
        manifest.chunks.insert(
            chunk_id.clone(),
            ChunkInfo {
                size: serialized.len(),
                item_count,
                kind,
                checksum: validator.generate(&serialized),
            },
        );
    }

    manifest.validation.manifest_checksum = manifest.body_checksum()?;
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Result of [`validate_manifest`]. Warnings never invalidate a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestReport {
    pub operation: String,
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub chunk_count: usize,
    pub manifest_size: usize,
}

/// Structural checks on an untyped manifest, before deserializing it.
///
/// `operation` only labels the report for logging.
pub fn validate_manifest(value: &Value, operation: &str, now_ms: u64) -> ManifestReport {
    let mut report = ManifestReport {
        operation: operation.to_string(),
        is_valid: false,
        errors: Vec::new(),
        warnings: Vec::new(),
        chunk_count: 0,
        manifest_size: 0,
    };

    let Some(obj) = value.as_object() else {
        report.errors.push("Manifest is null or not an object".into());
        return report;
    };
    report.manifest_size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);

    for prop in ["version", "timestamp", "chunks"] {
        if !obj.contains_key(prop) {
            report
                .errors
                .push(format!("Missing required manifest property: {prop}"));
        }
    }

    if let Some(version) = obj.get("version") {
        if !version.is_string() {
            report.errors.push("Manifest version must be a string".into());
        }
    }

    if let Some(timestamp) = obj.get("timestamp") {
        match timestamp.as_f64() {
            None => report
                .warnings
                .push("Manifest timestamp must be a number".into()),
            Some(ts) => {
                let now = now_ms as f64;
                let max_age_ms = (MAX_DATA_AGE_HOURS * 60 * 60 * 1000) as f64;
                if ts > now + CLOCK_SKEW_TOLERANCE_MS as f64 {
                    report
                        .warnings
                        .push("Manifest timestamp is in the future".into());
                } else if now - ts > max_age_ms {
                    let hours = ((now - ts) / 3_600_000.0).round();
                    report
                        .warnings
                        .push(format!("Manifest is old: {hours} hours"));
                }
            }
        }
    }

    if let Some(chunks) = obj.get("chunks") {
        match chunks.as_object() {
            Some(map) => report.chunk_count = map.len(),
            None => report.errors.push("Manifest chunks must be an object".into()),
        }
    }

    report.is_valid = report.errors.is_empty();
    report
}
