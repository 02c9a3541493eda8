use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

pub mod etag;
pub mod translate;

/// Bound on manifest-of-manifest nesting before a cycle is declared.
pub const MAX_MANIFEST_DEPTH: usize = 10;

/// One segment of a static large object. `path` is `/container/object`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloSegment {
    #[serde(rename = "path", alias = "name")]
    pub path: String,
    #[serde(rename = "etag", alias = "hash")]
    pub etag: String,
    #[serde(rename = "size_bytes", alias = "bytes")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

impl SloSegment {
    /// `(container, object)` halves of the segment path.
    pub fn split_path(&self) -> Result<(&str, &str)> {
        self.path
            .trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| anyhow!("malformed segment path: {}", self.path))
    }
}

/// One part of an S3 multipart object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpuPart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

/// The three large-object shapes the providers understand.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    /// Ordered segment list; whole-object ETag is `md5(concat(segment etag hex))`.
    Slo(Vec<SloSegment>),
    /// Prefix-assembled; membership resolved by listing at read time.
    Dlo { container: String, prefix: String },
    /// Ordered part list; composite ETag is `md5(concat(binary etags))-N`.
    Mpu(Vec<MpuPart>),
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        match self {
            Manifest::Slo(segments) => segments.iter().map(|s| s.size).sum(),
            Manifest::Mpu(parts) => parts.iter().map(|p| p.size).sum(),
            Manifest::Dlo { .. } => 0,
        }
    }

    /// The ETag the whole object reports for this shape, when computable.
    pub fn composite_etag(&self) -> Result<Option<String>> {
        match self {
            Manifest::Slo(segments) => Ok(Some(etag::slo_etag(
                segments.iter().map(|s| s.etag.as_str()),
            ))),
            Manifest::Mpu(parts) => {
                Ok(Some(etag::mpu_etag(parts.iter().map(|p| p.etag.as_str()))?))
            }
            Manifest::Dlo { .. } => Ok(None),
        }
    }

    /// Swift SLO manifest document (`?multipart-manifest=put` body).
    pub fn to_slo_json(&self) -> Result<String> {
        match self {
            Manifest::Slo(segments) => Ok(serde_json::to_string(segments)?),
            _ => Err(anyhow!("only SLO manifests have a JSON document form")),
        }
    }

    pub fn from_slo_json(raw: &[u8]) -> Result<Self> {
        let segments: Vec<SloSegment> = serde_json::from_slice(raw)?;
        Ok(Manifest::Slo(segments))
    }
}
