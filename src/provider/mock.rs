//! In-memory provider double for engine tests. Containers are plain maps,
//! timestamps tick from a counter unless the caller supplies one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::config::Protocol;
use crate::largeobject::etag::{mpu_etag, slo_etag};
use crate::largeobject::{Manifest, MpuPart, SloSegment};
use crate::provider::{
    BodyStream, ContainerEntry, GetResponse, ListPage, ProviderTrait, PutOptions, PutOutcome,
    body_from_bytes,
};
use crate::types::error::SpanError;
use crate::types::{
    ListEntry, ManifestKind, Metadata, ObjectHead, ObjectRef, Timestamp,
};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub timestamp: Timestamp,
    pub content_type: Option<String>,
    pub metadata: Metadata,
    pub manifest: Option<Manifest>,
    pub delete_at: Option<i64>,
    pub delete_after: Option<i64>,
}

#[derive(Debug, Default)]
struct ContainerState {
    metadata: Metadata,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, ContainerState>,
    uploads: HashMap<String, BTreeMap<i32, Vec<u8>>>,
    lifecycle_rules: Vec<(String, String, i64)>,
    clock: i64,
    upload_counter: u64,
    fail_next_put: bool,
}

#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    protocol: Protocol,
    id: String,
}

impl MockProvider {
    pub fn new(id: &str, protocol: Protocol) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            protocol,
            id: id.to_string(),
        }
    }

    pub fn swift(id: &str) -> Self {
        Self::new(id, Protocol::Swift)
    }

    pub fn s3(id: &str) -> Self {
        Self::new(id, Protocol::S3)
    }

    fn next_timestamp(state: &mut MockState) -> Timestamp {
        state.clock += 1;
        Timestamp::from_micros(1_600_000_000_000_000 + state.clock * 1_000_000)
    }

    pub fn insert(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        metadata: Metadata,
    ) -> StoredObject {
        let mut state = self.state.lock().unwrap();
        let timestamp = Self::next_timestamp(&mut state);
        let object = StoredObject {
            data: data.to_vec(),
            etag: hex::encode(md5::compute(data).0),
            timestamp,
            content_type: Some("application/octet-stream".to_string()),
            metadata,
            manifest: None,
            delete_at: None,
            delete_after: None,
        };
        state
            .containers
            .entry(container.to_string())
            .or_default()
            .objects
            .insert(name.to_string(), object.clone());
        object
    }

    /// Attach a manifest to an already-stored object, keeping its data.
    pub fn set_manifest(&self, container: &str, name: &str, manifest: Manifest) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state
            .containers
            .get_mut(container)
            .and_then(|c| c.objects.get_mut(name))
        {
            object.manifest = Some(manifest);
        }
    }

    pub fn get_stored(&self, container: &str, name: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container)
            .and_then(|c| c.objects.get(name))
            .cloned()
    }

    pub fn remove(&self, container: &str, name: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
            c.objects.remove(name);
        }
    }

    pub fn object_count(&self, container: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container)
            .map(|c| c.objects.len())
            .unwrap_or(0)
    }

    pub fn lifecycle_rules(&self) -> Vec<(String, String, i64)> {
        self.state.lock().unwrap().lifecycle_rules.clone()
    }

    pub fn fail_next_put(&self) {
        self.state.lock().unwrap().fail_next_put = true;
    }

    fn head_of(object: &StoredObject) -> ObjectHead {
        let manifest_kind = match &object.manifest {
            // A completed multipart object does not advertise itself in
            // HEAD; callers detect it from the composite etag.
            Some(Manifest::Mpu(_)) => None,
            Some(Manifest::Slo(_)) => Some(ManifestKind::Slo),
            Some(Manifest::Dlo { container, prefix }) => Some(ManifestKind::Dlo {
                container: container.clone(),
                prefix: prefix.clone(),
            }),
            None => None,
        };
        ObjectHead {
            etag: Some(object.etag.clone()),
            timestamp: Some(object.timestamp),
            last_modified: object.timestamp.to_datetime(),
            size: object.data.len() as u64,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            manifest: manifest_kind,
            delete_at: object.delete_at,
        }
    }

    /// Resolve a manifest object's full byte content.
    fn resolve_data(state: &MockState, object: &StoredObject) -> Vec<u8> {
        match &object.manifest {
            Some(Manifest::Slo(segments)) => {
                let mut data = Vec::new();
                for segment in segments {
                    let Ok((container, name)) = segment.split_path() else {
                        continue;
                    };
                    if let Some(seg) = state
                        .containers
                        .get(container)
                        .and_then(|c| c.objects.get(name))
                    {
                        data.extend_from_slice(&seg.data);
                    }
                }
                data
            }
            _ => object.data.clone(),
        }
    }
}

async fn read_all(mut body: BodyStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    body.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

#[async_trait]
impl ProviderTrait for MockProvider {
    fn provider_id(&self) -> String {
        self.id.clone()
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn put_object(
        &self,
        object: &ObjectRef,
        body: BodyStream,
        _content_length: Option<u64>,
        opts: &PutOptions,
    ) -> Result<PutOutcome> {
        let data = read_all(body).await?;
        let mut state = self.state.lock().unwrap();
        if state.fail_next_put {
            state.fail_next_put = false;
            return Err(anyhow!(SpanError::Remote5xx(503)));
        }
        let timestamp = object
            .timestamp
            .unwrap_or_else(|| Self::next_timestamp(&mut state));
        let etag = hex::encode(md5::compute(&data).0);
        let stored = StoredObject {
            data,
            etag: etag.clone(),
            timestamp,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            manifest: None,
            delete_at: opts.delete_at,
            delete_after: opts.delete_after,
        };
        state
            .containers
            .entry(object.container.clone())
            .or_default()
            .objects
            .insert(object.name.clone(), stored);
        Ok(PutOutcome {
            etag: Some(etag),
            timestamp: Some(timestamp),
        })
    }

    async fn post_object(&self, object: &ObjectRef, metadata: &Metadata) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .containers
            .get_mut(&object.container)
            .and_then(|c| c.objects.get_mut(&object.name))
            .ok_or_else(|| anyhow!(SpanError::NotFound))?;
        stored.metadata = metadata.clone();
        Ok(())
    }

    async fn get_object(
        &self,
        object: &ObjectRef,
        range: Option<(u64, u64)>,
    ) -> Result<GetResponse> {
        let state = self.state.lock().unwrap();
        let stored = state
            .containers
            .get(&object.container)
            .and_then(|c| c.objects.get(&object.name))
            .ok_or_else(|| anyhow!(SpanError::NotFound))?;
        let data = Self::resolve_data(&state, stored);
        let mut head = Self::head_of(stored);
        head.size = data.len() as u64;

        let (status, body) = match range {
            Some((start, end)) => {
                let start = start as usize;
                let end = ((end + 1) as usize).min(data.len());
                if start >= data.len() {
                    return Err(anyhow!(SpanError::Remote4xxClient(416)));
                }
                (206, data[start..end].to_vec())
            }
            None => (200, data),
        };
        Ok(GetResponse {
            status,
            head,
            body: body_from_bytes(body),
        })
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<ObjectHead>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .get(&object.container)
            .and_then(|c| c.objects.get(&object.name))
            .map(Self::head_of))
    }

    async fn delete_object(
        &self,
        object: &ObjectRef,
        timestamp: Option<Timestamp>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(&object.container)
            .ok_or_else(|| anyhow!(SpanError::NotFound))?;
        let Some(stored) = container.objects.get(&object.name) else {
            return Err(anyhow!(SpanError::NotFound));
        };
        if let Some(timestamp) = timestamp {
            if stored.timestamp > timestamp {
                return Err(anyhow!(SpanError::ConflictNewer));
            }
        }
        container.objects.remove(&object.name);
        Ok(())
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: Option<&str>,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<ListPage> {
        let state = self.state.lock().unwrap();
        let Some(container_state) = state.containers.get(container) else {
            return Err(anyhow!(SpanError::NotFound));
        };
        let mut entries = Vec::new();
        for (name, object) in &container_state.objects {
            if let Some(marker) = marker {
                if name.as_str() <= marker {
                    continue;
                }
            }
            if let Some(prefix) = prefix {
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            entries.push(ListEntry {
                name: name.clone(),
                bytes: object.data.len() as u64,
                hash: Some(object.etag.clone()),
                last_modified: object.timestamp.to_datetime().map(|dt| dt.to_rfc3339()),
                content_type: object.content_type.clone(),
                content_location: None,
            });
            if entries.len() == limit {
                break;
            }
        }
        let next_marker = if entries.len() == limit {
            entries.last().map(|e| e.name.clone())
        } else {
            None
        };
        Ok(ListPage {
            entries,
            next_marker,
        })
    }

    async fn list_containers(
        &self,
        _account: &str,
        _marker: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<ContainerEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .map(|(name, c)| ContainerEntry {
                name: name.clone(),
                count: c.objects.len() as u64,
                bytes: c.objects.values().map(|o| o.data.len() as u64).sum(),
            })
            .collect())
    }

    async fn put_container(
        &self,
        container: &str,
        _policy: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.containers.entry(container.to_string()).or_default();
        if let Some(metadata) = metadata {
            entry.metadata = metadata.clone();
        }
        Ok(())
    }

    async fn head_container(&self, container: &str) -> Result<Option<Metadata>> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.get(container).map(|c| c.metadata.clone()))
    }

    async fn get_manifest(&self, object: &ObjectRef) -> Result<Manifest> {
        let state = self.state.lock().unwrap();
        if self.protocol == Protocol::S3 {
            // Preserved manifest documents win over raw part boundaries,
            // mirroring the real provider.
            let preserved = state
                .containers
                .get(crate::types::MANIFEST_NAMESPACE)
                .and_then(|c| {
                    c.objects.get(&format!(
                        "{}/{}/{}",
                        object.account, object.container, object.name
                    ))
                })
                .and_then(|o| o.manifest.clone());
            if let Some(manifest) = preserved {
                return Ok(manifest);
            }
        }
        state
            .containers
            .get(&object.container)
            .and_then(|c| c.objects.get(&object.name))
            .and_then(|o| o.manifest.clone())
            .ok_or_else(|| {
                anyhow!(SpanError::LargeObjectPolicy(format!(
                    "{} is not a large object",
                    object.path()
                )))
            })
    }

    async fn upload_manifest(
        &self,
        object: &ObjectRef,
        manifest: &Manifest,
        opts: &PutOptions,
    ) -> Result<PutOutcome> {
        let mut state = self.state.lock().unwrap();
        if self.protocol == Protocol::S3 {
            let timestamp = Self::next_timestamp(&mut state);
            state
                .containers
                .entry(crate::types::MANIFEST_NAMESPACE.to_string())
                .or_default()
                .objects
                .insert(
                    format!("{}/{}/{}", object.account, object.container, object.name),
                    StoredObject {
                        data: Vec::new(),
                        etag: String::new(),
                        timestamp,
                        content_type: Some("application/json".to_string()),
                        metadata: Metadata::new(),
                        manifest: Some(manifest.clone()),
                        delete_at: None,
                        delete_after: None,
                    },
                );
            return Ok(PutOutcome::default());
        }
        let timestamp = object
            .timestamp
            .unwrap_or_else(|| Self::next_timestamp(&mut state));
        let etag = match manifest {
            Manifest::Slo(segments) => slo_etag(segments.iter().map(|s| s.etag.as_str())),
            Manifest::Mpu(parts) => mpu_etag(parts.iter().map(|p| p.etag.as_str()))?,
            Manifest::Dlo { .. } => String::new(),
        };
        let stored = StoredObject {
            data: Vec::new(),
            etag: etag.clone(),
            timestamp,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            manifest: Some(manifest.clone()),
            delete_at: opts.delete_at,
            delete_after: opts.delete_after,
        };
        state
            .containers
            .entry(object.container.clone())
            .or_default()
            .objects
            .insert(object.name.clone(), stored);
        Ok(PutOutcome {
            etag: Some(etag),
            timestamp: Some(timestamp),
        })
    }

    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_seconds: i64,
    ) -> Result<()> {
        self.state.lock().unwrap().lifecycle_rules.push((
            container.to_string(),
            prefix.to_string(),
            delete_after_seconds,
        ));
        Ok(())
    }

    async fn create_multipart_upload(&self, object: &ObjectRef) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.upload_counter += 1;
        let upload_id = format!("upload-{}-{}", object.name, state.upload_counter);
        state.uploads.insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _object: &ObjectRef,
        upload_id: &str,
        part_number: i32,
        body: BodyStream,
        _content_length: u64,
    ) -> Result<String> {
        let data = read_all(body).await?;
        let etag = hex::encode(md5::compute(&data).0);
        let mut state = self.state.lock().unwrap();
        state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!(SpanError::NotFound))?
            .insert(part_number, data);
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        parts: &[MpuPart],
    ) -> Result<PutOutcome> {
        let mut state = self.state.lock().unwrap();
        let uploaded = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| anyhow!(SpanError::NotFound))?;

        let mut data = Vec::new();
        let mut part_etags = Vec::new();
        let mut manifest_parts = Vec::new();
        for part in parts {
            let chunk = uploaded
                .get(&part.part_number)
                .ok_or_else(|| anyhow!(SpanError::Remote4xxClient(400)))?;
            part_etags.push(hex::encode(md5::compute(chunk).0));
            manifest_parts.push(MpuPart {
                part_number: part.part_number,
                etag: part_etags.last().unwrap().clone(),
                size: chunk.len() as u64,
            });
            data.extend_from_slice(chunk);
        }
        let etag = mpu_etag(part_etags.iter().map(|e| e.as_str()))?;
        let timestamp = Self::next_timestamp(&mut state);
        let stored = StoredObject {
            data,
            etag: etag.clone(),
            timestamp,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
            manifest: Some(Manifest::Mpu(manifest_parts)),
            delete_at: None,
            delete_after: None,
        };
        state
            .containers
            .entry(object.container.clone())
            .or_default()
            .objects
            .insert(object.name.clone(), stored);
        Ok(PutOutcome {
            etag: Some(etag),
            timestamp: Some(timestamp),
        })
    }

    async fn abort_multipart_upload(&self, _object: &ObjectRef, upload_id: &str) -> Result<()> {
        self.state.lock().unwrap().uploads.remove(upload_id);
        Ok(())
    }
}

/// Store an SLO (segments plus manifest) directly into the mock.
pub fn seed_slo(
    provider: &MockProvider,
    container: &str,
    name: &str,
    segment_container: &str,
    chunks: &[&[u8]],
) -> Vec<SloSegment> {
    let mut segments = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let segment_name = format!("{name}/{index:08}");
        let stored = provider.insert(segment_container, &segment_name, chunk, Metadata::new());
        segments.push(SloSegment {
            path: format!("/{segment_container}/{segment_name}"),
            etag: stored.etag,
            size: chunk.len() as u64,
            range: None,
        });
    }
    let mut state = provider.state.lock().unwrap();
    let timestamp = MockProvider::next_timestamp(&mut state);
    let etag = slo_etag(segments.iter().map(|s| s.etag.as_str()));
    state
        .containers
        .entry(container.to_string())
        .or_default()
        .objects
        .insert(
            name.to_string(),
            StoredObject {
                data: Vec::new(),
                etag,
                timestamp,
                content_type: Some("application/octet-stream".to_string()),
                metadata: Metadata::new(),
                manifest: Some(Manifest::Slo(segments.clone())),
                delete_at: None,
                delete_after: None,
            },
        );
    segments
}
