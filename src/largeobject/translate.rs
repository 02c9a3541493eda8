use anyhow::{Result, anyhow};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::largeobject::etag::{mpu_etag, normalize_etag};
use crate::largeobject::{MAX_MANIFEST_DEPTH, Manifest, MpuPart, SloSegment};
use crate::provider::{BodyStream, Provider, ProviderTrait, PutOptions, PutOutcome, body_from_bytes};
use crate::types::error::SpanError;
use crate::types::{ManifestKind, MIN_PART_SIZE, ObjectRef};

/// Planned multipart part: one segment streamed through, or several small
/// adjacent segments buffered into one part.
#[derive(Debug, Clone, PartialEq)]
pub struct PartPlan {
    pub segments: Vec<SloSegment>,
}

impl PartPlan {
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }
}

/// Group segments into multipart parts. Adjacent segments below
/// `min_segment_size` coalesce; any ranged segment disables coalescing for
/// the whole manifest.
pub fn plan_parts(segments: &[SloSegment], min_segment_size: Option<u64>) -> Vec<PartPlan> {
    let coalesce = min_segment_size.filter(|_| segments.iter().all(|s| s.range.is_none()));

    match coalesce {
        None => segments
            .iter()
            .map(|s| PartPlan {
                segments: vec![s.clone()],
            })
            .collect(),
        Some(min_size) => {
            let mut plans: Vec<PartPlan> = Vec::new();
            let mut group: Vec<SloSegment> = Vec::new();
            let mut group_size = 0u64;
            for segment in segments {
                group_size += segment.size;
                group.push(segment.clone());
                if group_size >= min_size {
                    plans.push(PartPlan {
                        segments: std::mem::take(&mut group),
                    });
                    group_size = 0;
                }
            }
            if !group.is_empty() {
                plans.push(PartPlan { segments: group });
            }
            plans
        }
    }
}

/// Every non-final part must satisfy the remote's minimum part size.
fn validate_part_sizes(plans: &[PartPlan]) -> Result<()> {
    for (index, plan) in plans.iter().enumerate() {
        let is_final = index + 1 == plans.len();
        if !is_final && plan.size() < MIN_PART_SIZE {
            return Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                "part {} is {} bytes, below the {} byte multipart minimum",
                index + 1,
                plan.size(),
                MIN_PART_SIZE
            ))));
        }
    }
    Ok(())
}

fn parse_segment_range(range: &str) -> Result<(u64, u64)> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| anyhow!("malformed segment range: {range}"))?;
    Ok((start.parse()?, end.parse()?))
}

fn segment_ref(account: &str, segment: &SloSegment) -> Result<ObjectRef> {
    let (container, name) = segment.split_path()?;
    let mut object = ObjectRef::new(account, container, name);
    object.etag = Some(segment.etag.clone());
    object.size = segment.size;
    Ok(object)
}

async fn read_all(mut body: BodyStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    body.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

/// Upload a local SLO as an S3 multipart object. The composite ETag is
/// verified against `md5(concat(binary-part-etags))-N`; any mismatch aborts
/// with nothing left behind on the remote.
pub async fn sync_slo_to_mpu(
    local: &Provider,
    remote: &Provider,
    object: &ObjectRef,
    segments: &[SloSegment],
    min_segment_size: Option<u64>,
) -> Result<PutOutcome> {
    let plans = plan_parts(segments, min_segment_size);
    validate_part_sizes(&plans)?;

    let upload_id = remote.create_multipart_upload(object).await?;
    debug!(
        key = object.path(),
        parts = plans.len(),
        "multipart upload started."
    );

    let mut parts: Vec<MpuPart> = Vec::new();
    for (index, plan) in plans.iter().enumerate() {
        let part_number = (index + 1) as i32;
        let uploaded = upload_one_part(local, remote, object, &upload_id, part_number, plan).await;
        match uploaded {
            Ok(part) => parts.push(part),
            Err(e) => {
                warn!(key = object.path(), part_number, "aborting multipart upload.");
                remote.abort_multipart_upload(object, &upload_id).await.ok();
                return Err(e);
            }
        }
    }

    let expected = mpu_etag(parts.iter().map(|p| p.etag.as_str()))?;
    let outcome = match remote
        .complete_multipart_upload(object, &upload_id, &parts)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            remote.abort_multipart_upload(object, &upload_id).await.ok();
            return Err(e);
        }
    };

    if let Some(actual) = &outcome.etag {
        if normalize_etag(actual) != expected {
            remote.delete_object(object, None).await.ok();
            return Err(anyhow!(SpanError::IntegrityMismatch {
                expected,
                actual: actual.clone(),
            }));
        }
    }
    info!(key = object.path(), etag = expected, "multipart upload complete.");
    Ok(outcome)
}

async fn upload_one_part(
    local: &Provider,
    remote: &Provider,
    object: &ObjectRef,
    upload_id: &str,
    part_number: i32,
    plan: &PartPlan,
) -> Result<MpuPart> {
    let single_streamable = plan.segments.len() == 1 && plan.segments[0].range.is_none();

    let (etag, size) = if single_streamable {
        let segment = &plan.segments[0];
        let source = segment_ref(&object.account, segment)?;
        let response = local.get_object(&source, None).await?;
        let etag = remote
            .upload_part(object, upload_id, part_number, response.body, segment.size)
            .await?;
        // A streamed part must come back with the segment's own md5.
        if normalize_etag(&etag) != normalize_etag(&segment.etag) {
            return Err(anyhow!(SpanError::IntegrityMismatch {
                expected: normalize_etag(&segment.etag),
                actual: etag,
            }));
        }
        (etag, segment.size)
    } else {
        // Coalesced or ranged: buffer and verify against a locally
        // computed digest.
        let mut buffer = Vec::with_capacity(plan.size() as usize);
        for segment in &plan.segments {
            let source = segment_ref(&object.account, segment)?;
            let range = match &segment.range {
                Some(range) => Some(parse_segment_range(range)?),
                None => None,
            };
            let response = local.get_object(&source, range).await?;
            buffer.extend(read_all(response.body).await?);
        }
        let local_digest = hex::encode(md5::compute(&buffer).0);
        let size = buffer.len() as u64;
        let etag = remote
            .upload_part(object, upload_id, part_number, body_from_bytes(buffer), size)
            .await?;
        if normalize_etag(&etag) != local_digest {
            return Err(anyhow!(SpanError::IntegrityMismatch {
                expected: local_digest,
                actual: etag,
            }));
        }
        (etag, size)
    };

    Ok(MpuPart {
        part_number,
        etag,
        size,
    })
}

/// Upload a local SLO to a Swift remote: segments first (their containers
/// are preserved verbatim), then the manifest document.
pub async fn sync_slo_to_swift(
    local: &Provider,
    remote: &Provider,
    object: &ObjectRef,
    segments: &[SloSegment],
    manifest_opts: &PutOptions,
    segment_opts: &PutOptions,
) -> Result<PutOutcome> {
    for segment in segments {
        let source = segment_ref(&object.account, segment)?;
        let response = local.get_object(&source, None).await?;
        let outcome = remote
            .put_object(&source, response.body, Some(segment.size), segment_opts)
            .await?;
        if let Some(actual) = &outcome.etag {
            if normalize_etag(actual) != normalize_etag(&segment.etag) {
                return Err(anyhow!(SpanError::IntegrityMismatch {
                    expected: normalize_etag(&segment.etag),
                    actual: actual.clone(),
                }));
            }
        }
    }
    remote
        .upload_manifest(object, &Manifest::Slo(segments.to_vec()), manifest_opts)
        .await
}

/// Expand a DLO into leaf segments, following nested manifests with a
/// visited set and a depth bound. A DLO that includes itself, or any
/// manifest cycle, is a `LargeObjectPolicy` failure.
pub async fn expand_dlo_segments(
    local: &Provider,
    account: &str,
    manifest_path: &str,
    container: &str,
    prefix: &str,
) -> Result<Vec<SloSegment>> {
    let mut visited = vec![format!("{container}/{prefix}")];
    expand_dlo_inner(local, account, manifest_path, container, prefix, 0, &mut visited).await
}

fn expand_dlo_inner<'a>(
    local: &'a Provider,
    account: &'a str,
    manifest_path: &'a str,
    container: &'a str,
    prefix: &'a str,
    depth: usize,
    visited: &'a mut Vec<String>,
) -> futures::future::BoxFuture<'a, Result<Vec<SloSegment>>> {
    Box::pin(async move {
        if depth >= MAX_MANIFEST_DEPTH {
            return Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                "manifest nesting exceeds depth {MAX_MANIFEST_DEPTH}"
            ))));
        }

        let listed = crate::provider::swift::expand_dlo(&**local, container, prefix).await?;
        let mut segments = Vec::with_capacity(listed.len());
        for segment in listed {
            let path = segment.path.trim_start_matches('/').to_string();
            if path == manifest_path {
                return Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                    "dlo {manifest_path} lists itself as a segment"
                ))));
            }
            let source = segment_ref(account, &segment)?;
            let head = local
                .head_object(&source)
                .await?
                .ok_or_else(|| anyhow!(SpanError::NotFound))?;
            match head.manifest {
                None => segments.push(segment),
                Some(ManifestKind::Dlo {
                    container: nested_container,
                    prefix: nested_prefix,
                }) => {
                    let marker = format!("{nested_container}/{nested_prefix}");
                    if visited.contains(&marker) {
                        return Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                            "manifest cycle through {marker}"
                        ))));
                    }
                    visited.push(marker);
                    let nested = expand_dlo_inner(
                        local,
                        account,
                        manifest_path,
                        &nested_container,
                        &nested_prefix,
                        depth + 1,
                        visited,
                    )
                    .await?;
                    segments.extend(nested);
                }
                Some(ManifestKind::Slo) => {
                    if visited.contains(&path) {
                        return Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                            "manifest cycle through {path}"
                        ))));
                    }
                    visited.push(path);
                    let nested = local.get_manifest(&source).await?;
                    match nested {
                        Manifest::Slo(nested_segments) => segments.extend(nested_segments),
                        _ => {
                            return Err(anyhow!(SpanError::LargeObjectPolicy(
                                "unexpected manifest shape while expanding".into()
                            )));
                        }
                    }
                }
            }
        }
        Ok(segments)
    })
}

/// Restore a remote large object into the local cluster as an SLO.
///
/// With a preserved manifest the original segment paths, sizes, and etags
/// come back exactly; a native multipart object is cut at its recorded part
/// boundaries into a synthetic segment container.
pub async fn restore_large_object(
    remote: &Provider,
    local: &Provider,
    object: &ObjectRef,
    manifest: Manifest,
) -> Result<PutOutcome> {
    let segments = match manifest {
        Manifest::Slo(segments) => {
            let mut offset = 0u64;
            for segment in &segments {
                restore_segment(remote, local, object, segment, offset).await?;
                offset += segment.size;
            }
            segments
        }
        Manifest::Mpu(parts) => {
            let mut segments = Vec::with_capacity(parts.len());
            let mut offset = 0u64;
            for part in &parts {
                let synthetic = SloSegment {
                    path: format!(
                        "/{}_segments/{}/{:08}",
                        object.container, object.name, part.part_number
                    ),
                    etag: part.etag.clone(),
                    size: part.size,
                    range: None,
                };
                let outcome = restore_segment(remote, local, object, &synthetic, offset).await?;
                offset += part.size;
                segments.push(SloSegment {
                    etag: outcome.etag.unwrap_or_else(|| synthetic.etag.clone()),
                    ..synthetic
                });
            }
            segments
        }
        Manifest::Dlo { .. } => {
            return Err(anyhow!(SpanError::LargeObjectPolicy(
                "dlo restoration is resolved before this point".into()
            )));
        }
    };

    local
        .upload_manifest(object, &Manifest::Slo(segments), &PutOptions::default())
        .await
}

async fn restore_segment(
    remote: &Provider,
    local: &Provider,
    object: &ObjectRef,
    segment: &SloSegment,
    offset: u64,
) -> Result<PutOutcome> {
    let range = (offset, offset + segment.size - 1);
    let response = remote.get_object(object, Some(range)).await?;

    let (container, name) = segment.split_path()?;
    let mut target = ObjectRef::new(&object.account, container, name);
    target.size = segment.size;
    target.timestamp = object.timestamp;
    if !segment.etag.is_empty() {
        target.etag = Some(segment.etag.clone());
    }

    local.put_container(container, None, None).await.ok();
    let outcome = local
        .put_object(&target, response.body, Some(segment.size), &PutOptions::default())
        .await?;
    if !segment.etag.is_empty() {
        if let Some(actual) = &outcome.etag {
            if normalize_etag(actual) != normalize_etag(&segment.etag) {
                return Err(anyhow!(SpanError::IntegrityMismatch {
                    expected: normalize_etag(&segment.etag),
                    actual: actual.clone(),
                }));
            }
        }
    }
    Ok(outcome)
}
