use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dyn_clone::DynClone;
use tokio::io::AsyncRead;

use crate::config::{MigrationProfile, Protocol, Secret, SyncProfile};
use crate::largeobject::{Manifest, MpuPart};
use crate::types::error::SpanError;
use crate::types::{ListEntry, Metadata, ObjectHead, ObjectRef, Timestamp};

pub mod metadata;
#[cfg(test)]
pub mod mock;
pub mod s3;
pub mod swift;

pub type Provider = Box<dyn ProviderTrait + Send + Sync>;

/// Streaming object body. Small bodies can be wrapped with
/// [`body_from_bytes`].
pub type BodyStream = Box<dyn AsyncRead + Send + Sync + Unpin + 'static>;

pub fn body_from_bytes(bytes: Vec<u8>) -> BodyStream {
    Box::new(std::io::Cursor::new(bytes))
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Absolute expiry, unix seconds (`X-Delete-At`).
    pub delete_at: Option<i64>,
    /// Relative expiry, seconds (`X-Delete-After`).
    pub delete_after: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    pub etag: Option<String>,
    pub timestamp: Option<Timestamp>,
}

pub struct GetResponse {
    pub status: u16,
    pub head: ObjectHead,
    pub body: BodyStream,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ListEntry>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEntry {
    pub name: String,
    pub count: u64,
    pub bytes: u64,
}

/// The uniform capability surface over Swift and S3 semantics. Variant
/// differences (expiration headers, bucket lifecycle, multipart) are
/// capability probes, not downcasts.
#[async_trait]
pub trait ProviderTrait: DynClone {
    /// Stable identity recorded in migration tags.
    fn provider_id(&self) -> String;
    fn protocol(&self) -> Protocol;

    /// Swift targets take per-object `X-Delete-At`/`X-Delete-After`.
    fn supports_expiration_headers(&self) -> bool {
        self.protocol() == Protocol::Swift
    }

    /// S3 targets expire via bucket lifecycle rules on a key prefix.
    fn supports_bucket_lifecycle(&self) -> bool {
        self.protocol() == Protocol::S3
    }

    fn supports_multipart(&self) -> bool {
        self.protocol() == Protocol::S3
    }

    async fn put_object(
        &self,
        object: &ObjectRef,
        body: BodyStream,
        content_length: Option<u64>,
        opts: &PutOptions,
    ) -> Result<PutOutcome>;

    /// Metadata-only update.
    async fn post_object(&self, object: &ObjectRef, metadata: &Metadata) -> Result<()>;

    async fn get_object(
        &self,
        object: &ObjectRef,
        range: Option<(u64, u64)>,
    ) -> Result<GetResponse>;

    /// `Ok(None)` on 404.
    async fn head_object(&self, object: &ObjectRef) -> Result<Option<ObjectHead>>;

    /// With a timestamp the delete is conditional: a newer object survives
    /// and the call fails `ConflictNewer`.
    async fn delete_object(&self, object: &ObjectRef, timestamp: Option<Timestamp>)
    -> Result<()>;

    async fn list_objects(
        &self,
        container: &str,
        marker: Option<&str>,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<ListPage>;

    /// `account` addresses the local cluster's verbatim namespace; remote
    /// providers list their own account root and ignore it.
    async fn list_containers(
        &self,
        account: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContainerEntry>>;

    async fn put_container(
        &self,
        container: &str,
        policy: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<()>;

    /// Container user metadata (and ACLs for Swift), `None` on 404.
    async fn head_container(&self, container: &str) -> Result<Option<Metadata>>;

    /// Resolve the manifest of a large object previously detected via HEAD.
    async fn get_manifest(&self, object: &ObjectRef) -> Result<Manifest>;

    /// Upload a manifest document (SLO put, or preserved-manifest write).
    async fn upload_manifest(
        &self,
        object: &ObjectRef,
        manifest: &Manifest,
        opts: &PutOptions,
    ) -> Result<PutOutcome>;

    /// Install an expiry rule for a key prefix (S3 bucket lifecycle).
    async fn set_lifecycle(
        &self,
        container: &str,
        prefix: &str,
        delete_after_seconds: i64,
    ) -> Result<()>;

    async fn create_multipart_upload(&self, _object: &ObjectRef) -> Result<String> {
        Err(anyhow!(SpanError::LargeObjectPolicy(
            "multipart upload is not supported by this provider".into()
        )))
    }

    async fn upload_part(
        &self,
        _object: &ObjectRef,
        _upload_id: &str,
        _part_number: i32,
        _body: BodyStream,
        _content_length: u64,
    ) -> Result<String> {
        Err(anyhow!(SpanError::LargeObjectPolicy(
            "multipart upload is not supported by this provider".into()
        )))
    }

    async fn complete_multipart_upload(
        &self,
        _object: &ObjectRef,
        _upload_id: &str,
        _parts: &[MpuPart],
    ) -> Result<PutOutcome> {
        Err(anyhow!(SpanError::LargeObjectPolicy(
            "multipart upload is not supported by this provider".into()
        )))
    }

    async fn abort_multipart_upload(&self, _object: &ObjectRef, _upload_id: &str) -> Result<()> {
        Err(anyhow!(SpanError::LargeObjectPolicy(
            "multipart upload is not supported by this provider".into()
        )))
    }
}

dyn_clone::clone_trait_object!(ProviderTrait);

/// The remote half of a profile binding, shared by sync and migration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub account: String,
    pub container: String,
    pub endpoint: String,
    pub identity: String,
    pub secret: Secret,
    pub bucket: String,
    pub protocol: Protocol,
    pub custom_prefix: Option<String>,
}

impl From<&SyncProfile> for RemoteConfig {
    fn from(profile: &SyncProfile) -> Self {
        Self {
            account: profile.account.clone(),
            container: profile.container.clone(),
            endpoint: profile.aws_endpoint.clone(),
            identity: profile.aws_identity.clone(),
            secret: profile.aws_secret.clone(),
            bucket: profile.aws_bucket.clone(),
            protocol: profile.protocol,
            custom_prefix: profile.custom_prefix.clone(),
        }
    }
}

impl From<&MigrationProfile> for RemoteConfig {
    fn from(profile: &MigrationProfile) -> Self {
        Self {
            account: profile.account.clone(),
            container: profile.container.clone(),
            endpoint: profile.aws_endpoint.clone(),
            identity: profile.aws_identity.clone(),
            secret: profile.aws_secret.clone(),
            bucket: profile.aws_bucket.clone(),
            protocol: profile.protocol,
            custom_prefix: profile.custom_prefix.clone(),
        }
    }
}

/// Build the remote provider for a profile.
pub async fn create_remote_provider(config: RemoteConfig) -> Result<Provider> {
    match config.protocol {
        Protocol::S3 => Ok(Box::new(s3::S3Provider::create(config).await?)),
        Protocol::Swift => Ok(Box::new(swift::SwiftProvider::remote(config)?)),
    }
}

/// Build the provider for the local cluster's internal endpoint. Paths map
/// verbatim; no profile prefixing.
pub fn create_local_provider(endpoint: &str) -> Result<Provider> {
    Ok(Box::new(swift::SwiftProvider::local(endpoint)?))
}

/// Default S3 key prefix: first 16 hex chars of `md5(account/container)`.
pub fn s3_hash_prefix(account: &str, container: &str) -> String {
    let digest = md5::compute(format!("{account}/{container}").as_bytes());
    hex::encode(digest.0)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_prefix_is_stable_and_short() {
        let a = s3_hash_prefix("AUTH_test", "container");
        let b = s3_hash_prefix("AUTH_test", "container");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_prefix_differs_per_container() {
        assert_ne!(
            s3_hash_prefix("AUTH_test", "c1"),
            s3_hash_prefix("AUTH_test", "c2")
        );
    }
}
