use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::config::Protocol;
use crate::largeobject::{Manifest, SloSegment};
use crate::provider::{
    BodyStream, ContainerEntry, GetResponse, ListPage, ProviderTrait, PutOptions, PutOutcome,
    RemoteConfig,
};
use crate::types::error::SpanError;
use crate::types::{
    DLO_HEADER, ListEntry, ManifestKind, Metadata, ObjectHead, ObjectRef, SLO_HEADER, Timestamp,
};

const OBJECT_META_PREFIX: &str = "x-object-meta-";
const CONTAINER_META_PREFIX: &str = "x-container-meta-";
const CONTAINER_ACL_HEADERS: [&str; 2] = ["x-container-read", "x-container-write"];

/// Everything except unreserved characters and the path separator.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'%')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^');

#[derive(Debug, Clone)]
struct AuthConfig {
    identity: String,
    secret: crate::config::Secret,
}

#[derive(Debug, Clone)]
struct AuthSession {
    token: Option<String>,
    storage_url: String,
}

#[derive(Debug, Clone)]
enum KeyMapping {
    /// Local cluster: paths pass through untouched.
    Verbatim { account: Option<String> },
    /// Remote profile: the synced container maps onto the bucket; any other
    /// container (segment containers) keeps its name.
    Remote {
        container: String,
        bucket: String,
        wildcard: bool,
    },
}

/// Swift-protocol provider, used both for the remote side of swift profiles
/// and for the local cluster's internal endpoint.
#[derive(Clone)]
pub struct SwiftProvider {
    client: reqwest::Client,
    endpoint: String,
    auth: Option<AuthConfig>,
    mapping: KeyMapping,
    session: Arc<tokio::sync::RwLock<Option<AuthSession>>>,
}

impl SwiftProvider {
    pub fn remote(config: RemoteConfig) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            auth: Some(AuthConfig {
                identity: config.identity.clone(),
                secret: config.secret.clone(),
            }),
            mapping: KeyMapping::Remote {
                container: config.container.clone(),
                bucket: config.bucket.clone(),
                wildcard: config.container == crate::config::WILDCARD_CONTAINER,
            },
            session: Arc::new(tokio::sync::RwLock::new(None)),
        })
    }

    /// Internal cluster endpoint; the URL already addresses the account
    /// root (`.../v1`). No authentication.
    pub fn local(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth: None,
            mapping: KeyMapping::Verbatim { account: None },
            session: Arc::new(tokio::sync::RwLock::new(None)),
        })
    }

    fn remote_container(&self, local_container: &str) -> String {
        match &self.mapping {
            KeyMapping::Verbatim { .. } => local_container.to_string(),
            KeyMapping::Remote {
                container,
                bucket,
                wildcard,
            } => {
                if *wildcard {
                    format!("{bucket}-{local_container}")
                } else if local_container == container {
                    bucket.clone()
                } else {
                    // Segment containers keep their names so an
                    // account-wide pass does not copy them twice.
                    local_container.to_string()
                }
            }
        }
    }

    async fn ensure_session(&self) -> Result<AuthSession> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self) -> Result<AuthSession> {
        let Some(auth) = &self.auth else {
            // Local mode: account lives in the object path.
            return Ok(AuthSession {
                token: None,
                storage_url: self.endpoint.clone(),
            });
        };

        trace!(endpoint = self.endpoint, "authenticating against swift endpoint.");
        let response = self
            .client
            .get(format!("{}/auth/v1.0", self.endpoint))
            .header("X-Auth-User", auth.identity.as_str())
            .header("X-Auth-Key", auth.secret.value())
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(anyhow!(SpanError::Auth(format!(
                "auth request returned {}",
                response.status()
            ))));
        }
        let token = header_string(response.headers(), "x-auth-token")
            .ok_or_else(|| anyhow!(SpanError::Auth("no token in auth response".into())))?;
        let storage_url = header_string(response.headers(), "x-storage-url")
            .ok_or_else(|| anyhow!(SpanError::Auth("no storage url in auth response".into())))?;
        Ok(AuthSession {
            token: Some(token),
            storage_url: storage_url.trim_end_matches('/').to_string(),
        })
    }

    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }

    fn account_root(&self, session: &AuthSession, object: Option<&ObjectRef>) -> String {
        match &self.mapping {
            KeyMapping::Verbatim { account } => {
                let account = object
                    .map(|o| o.account.as_str())
                    .or(account.as_deref())
                    .unwrap_or_default();
                format!("{}/{}", session.storage_url, encode_segment(account))
            }
            KeyMapping::Remote { .. } => session.storage_url.clone(),
        }
    }

    fn object_url(&self, session: &AuthSession, object: &ObjectRef) -> String {
        format!(
            "{}/{}/{}",
            self.account_root(session, Some(object)),
            encode_segment(&self.remote_container(&object.container)),
            encode_path(&object.name)
        )
    }

    fn container_url(&self, session: &AuthSession, account: &str, container: &str) -> String {
        let root = match &self.mapping {
            KeyMapping::Verbatim { .. } => {
                format!("{}/{}", session.storage_url, encode_segment(account))
            }
            KeyMapping::Remote { .. } => session.storage_url.clone(),
        };
        format!(
            "{}/{}",
            root,
            encode_segment(&self.remote_container(container))
        )
    }

    /// Issue a request without a body, re-authenticating once on 401.
    async fn request(
        &self,
        method: Method,
        url_for: impl Fn(&AuthSession) -> String,
        headers: HeaderMap,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            let session = self.ensure_session().await?;
            let mut builder = self
                .client
                .request(method.clone(), url_for(&session))
                .headers(headers.clone());
            if let Some(token) = &session.token {
                builder = builder.header("X-Auth-Token", token.as_str());
            }
            if !query.is_empty() {
                builder = builder.query(query);
            }
            let response = builder.send().await.map_err(transport_error)?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("swift token rejected, re-authenticating.");
                self.invalidate_session().await;
                continue;
            }
            return Ok(response);
        }
        unreachable!("auth retry loop always returns");
    }
}

#[async_trait]
impl ProviderTrait for SwiftProvider {
    fn provider_id(&self) -> String {
        match &self.mapping {
            KeyMapping::Verbatim { .. } => format!("swift:{}", self.endpoint),
            KeyMapping::Remote { bucket, .. } => format!("swift:{}/{}", self.endpoint, bucket),
        }
    }

    fn protocol(&self) -> Protocol {
        Protocol::Swift
    }

    async fn put_object(
        &self,
        object: &ObjectRef,
        body: BodyStream,
        content_length: Option<u64>,
        opts: &PutOptions,
    ) -> Result<PutOutcome> {
        let session = self.ensure_session().await?;
        let url = self.object_url(&session, object);

        let mut builder = self.client.put(url);
        if let Some(token) = &session.token {
            builder = builder.header("X-Auth-Token", token.as_str());
        }
        if let Some(length) = content_length {
            builder = builder.header(reqwest::header::CONTENT_LENGTH, length);
        }
        if let Some(etag) = &object.etag {
            builder = builder.header("ETag", crate::largeobject::etag::normalize_etag(etag));
        }
        if let Some(timestamp) = &object.timestamp {
            builder = builder.header("X-Timestamp", timestamp.to_string());
        }
        if let Some(content_type) = &object.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(delete_at) = opts.delete_at {
            builder = builder.header("X-Delete-At", delete_at);
        }
        if let Some(delete_after) = opts.delete_after {
            builder = builder.header("X-Delete-After", delete_after);
        }
        for (key, value) in &object.metadata {
            builder = builder.header(format!("{OBJECT_META_PREFIX}{key}"), value.as_str());
        }

        let stream = tokio_util::io::ReaderStream::new(body);
        let response = builder
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        Ok(PutOutcome {
            etag: header_string(response.headers(), "etag")
                .map(|e| crate::largeobject::etag::normalize_etag(&e)),
            timestamp: header_timestamp(response.headers()),
        })
    }

    async fn post_object(&self, object: &ObjectRef, metadata: &Metadata) -> Result<()> {
        let mut headers = HeaderMap::new();
        for (key, value) in metadata {
            headers.insert(
                reqwest::header::HeaderName::try_from(format!("{OBJECT_META_PREFIX}{key}"))
                    .context("invalid metadata key")?,
                HeaderValue::from_str(value).context("invalid metadata value")?,
            );
        }
        if let Some(content_type) = &object.content_type {
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_str(content_type)?,
            );
        }
        let response = self
            .request(
                Method::POST,
                |session| self.object_url(session, object),
                headers,
                &[],
            )
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn get_object(
        &self,
        object: &ObjectRef,
        range: Option<(u64, u64)>,
    ) -> Result<GetResponse> {
        let mut headers = HeaderMap::new();
        if let Some((start, end)) = range {
            headers.insert(
                reqwest::header::RANGE,
                HeaderValue::from_str(&format!("bytes={start}-{end}"))?,
            );
        }
        let response = self
            .request(
                Method::GET,
                |session| self.object_url(session, object),
                headers,
                &[],
            )
            .await?;
        let response = check_status(response).await?;

        let status = response.status().as_u16();
        let head = parse_object_head(response.headers());

        // Relay the response stream through a pipe so the body satisfies
        // the provider's AsyncRead surface.
        let mut stream = response.bytes_stream();
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("body relay ended early: {e}");
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(GetResponse {
            status,
            head,
            body: Box::new(reader),
        })
    }

    async fn head_object(&self, object: &ObjectRef) -> Result<Option<ObjectHead>> {
        let response = self
            .request(
                Method::HEAD,
                |session| self.object_url(session, object),
                HeaderMap::new(),
                &[],
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(parse_object_head(response.headers())))
    }

    async fn delete_object(
        &self,
        object: &ObjectRef,
        timestamp: Option<Timestamp>,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        if let Some(timestamp) = timestamp {
            headers.insert("X-Timestamp", HeaderValue::from_str(&timestamp.to_string())?);
        }
        let response = self
            .request(
                Method::DELETE,
                |session| self.object_url(session, object),
                headers,
                &[],
            )
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: Option<&str>,
        limit: usize,
        prefix: Option<&str>,
    ) -> Result<ListPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix.to_string()));
        }
        let account = match &self.mapping {
            KeyMapping::Verbatim { account } => account.clone().unwrap_or_default(),
            KeyMapping::Remote { .. } => String::new(),
        };
        let response = self
            .request(
                Method::GET,
                |session| self.container_url(session, &account, container),
                HeaderMap::new(),
                &query,
            )
            .await?;
        let response = check_status(response).await?;

        #[derive(Deserialize)]
        struct SwiftEntry {
            name: String,
            #[serde(default)]
            hash: Option<String>,
            #[serde(default)]
            bytes: u64,
            #[serde(default)]
            last_modified: Option<String>,
            #[serde(default)]
            content_type: Option<String>,
        }

        let raw: Vec<SwiftEntry> = response.json().await.map_err(transport_error)?;
        let next_marker = if raw.len() == limit {
            raw.last().map(|e| e.name.clone())
        } else {
            None
        };
        let entries = raw
            .into_iter()
            .map(|e| ListEntry {
                name: e.name,
                bytes: e.bytes,
                hash: e.hash.map(|h| crate::largeobject::etag::normalize_etag(&h)),
                last_modified: e.last_modified,
                content_type: e.content_type,
                content_location: None,
            })
            .collect();
        Ok(ListPage {
            entries,
            next_marker,
        })
    }

    async fn list_containers(
        &self,
        account: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContainerEntry>> {
        let mut query: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        let account_object = ObjectRef::new(account, "", "");
        let response = self
            .request(
                Method::GET,
                |session| self.account_root(session, Some(&account_object)),
                HeaderMap::new(),
                &query,
            )
            .await?;
        let response = check_status(response).await?;

        #[derive(Deserialize)]
        struct SwiftContainer {
            name: String,
            #[serde(default)]
            count: u64,
            #[serde(default)]
            bytes: u64,
        }
        let raw: Vec<SwiftContainer> = response.json().await.map_err(transport_error)?;
        Ok(raw
            .into_iter()
            .map(|c| ContainerEntry {
                name: c.name,
                count: c.count,
                bytes: c.bytes,
            })
            .collect())
    }

    async fn put_container(
        &self,
        container: &str,
        policy: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        if let Some(policy) = policy {
            headers.insert("X-Storage-Policy", HeaderValue::from_str(policy)?);
        }
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                let name = if is_container_system_key(key) {
                    key.to_ascii_lowercase()
                } else {
                    format!("{CONTAINER_META_PREFIX}{key}")
                };
                headers.insert(
                    reqwest::header::HeaderName::try_from(name)
                        .context("invalid container metadata key")?,
                    HeaderValue::from_str(value).context("invalid container metadata value")?,
                );
            }
        }
        let account = match &self.mapping {
            KeyMapping::Verbatim { account } => account.clone().unwrap_or_default(),
            KeyMapping::Remote { .. } => String::new(),
        };
        let response = self
            .request(
                Method::PUT,
                |session| self.container_url(session, &account, container),
                headers,
                &[],
            )
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn head_container(&self, container: &str) -> Result<Option<Metadata>> {
        let account = match &self.mapping {
            KeyMapping::Verbatim { account } => account.clone().unwrap_or_default(),
            KeyMapping::Remote { .. } => String::new(),
        };
        let response = self
            .request(
                Method::HEAD,
                |session| self.container_url(session, &account, container),
                HeaderMap::new(),
                &[],
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;

        let mut metadata = Metadata::new();
        for (name, value) in response.headers() {
            let name = name.as_str();
            let Ok(value) = value.to_str() else { continue };
            if let Some(key) = name.strip_prefix(CONTAINER_META_PREFIX) {
                metadata.insert(key.to_string(), value.to_string());
            } else if is_container_system_key(name) {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
        Ok(Some(metadata))
    }

    async fn get_manifest(&self, object: &ObjectRef) -> Result<Manifest> {
        let head = self
            .head_object(object)
            .await?
            .ok_or_else(|| anyhow!(SpanError::NotFound))?;
        match head.manifest {
            Some(ManifestKind::Dlo { container, prefix }) => {
                Ok(Manifest::Dlo { container, prefix })
            }
            Some(ManifestKind::Slo) => {
                let response = self
                    .request(
                        Method::GET,
                        |session| self.object_url(session, object),
                        HeaderMap::new(),
                        &[("multipart-manifest", "get".to_string())],
                    )
                    .await?;
                let response = check_status(response).await?;
                let raw = response.bytes().await.map_err(transport_error)?;
                Manifest::from_slo_json(&raw)
            }
            None => Err(anyhow!(SpanError::LargeObjectPolicy(format!(
                "{} is not a large object",
                object.path()
            )))),
        }
    }

    async fn upload_manifest(
        &self,
        object: &ObjectRef,
        manifest: &Manifest,
        opts: &PutOptions,
    ) -> Result<PutOutcome> {
        match manifest {
            Manifest::Slo(_) => {
                let session = self.ensure_session().await?;
                let document = manifest.to_slo_json()?;
                let mut builder = self
                    .client
                    .put(self.object_url(&session, object))
                    .query(&[("multipart-manifest", "put")]);
                if let Some(token) = &session.token {
                    builder = builder.header("X-Auth-Token", token.as_str());
                }
                if let Some(timestamp) = &object.timestamp {
                    builder = builder.header("X-Timestamp", timestamp.to_string());
                }
                if let Some(content_type) = &object.content_type {
                    builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
                }
                if let Some(delete_at) = opts.delete_at {
                    builder = builder.header("X-Delete-At", delete_at);
                }
                if let Some(delete_after) = opts.delete_after {
                    builder = builder.header("X-Delete-After", delete_after);
                }
                for (key, value) in &object.metadata {
                    builder = builder.header(format!("{OBJECT_META_PREFIX}{key}"), value.as_str());
                }
                let response = builder.body(document).send().await.map_err(transport_error)?;
                let response = check_status(response).await?;
                Ok(PutOutcome {
                    etag: header_string(response.headers(), "etag")
                        .map(|e| crate::largeobject::etag::normalize_etag(&e)),
                    timestamp: header_timestamp(response.headers()),
                })
            }
            Manifest::Dlo { container, prefix } => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    DLO_HEADER,
                    HeaderValue::from_str(&format!("{container}/{prefix}"))?,
                );
                for (key, value) in &object.metadata {
                    headers.insert(
                        reqwest::header::HeaderName::try_from(format!(
                            "{OBJECT_META_PREFIX}{key}"
                        ))?,
                        HeaderValue::from_str(value)?,
                    );
                }
                let response = self
                    .request(
                        Method::PUT,
                        |session| self.object_url(session, object),
                        headers,
                        &[],
                    )
                    .await?;
                check_status(response).await?;
                Ok(PutOutcome::default())
            }
            Manifest::Mpu(_) => Err(anyhow!(SpanError::LargeObjectPolicy(
                "multipart manifests cannot be uploaded to a swift target".into()
            ))),
        }
    }

    async fn set_lifecycle(
        &self,
        _container: &str,
        _prefix: &str,
        _delete_after_seconds: i64,
    ) -> Result<()> {
        Err(anyhow!(SpanError::ConfigInvalid(
            "bucket lifecycle rules are an s3 capability; swift targets expire per object".into()
        )))
    }
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to build http client")
}

fn transport_error(e: reqwest::Error) -> anyhow::Error {
    anyhow!(SpanError::TransientNetwork(e.to_string()))
}

/// Non-2xx statuses become taxonomy errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(anyhow!(SpanError::from_status(status.as_u16())))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn header_timestamp(headers: &HeaderMap) -> Option<Timestamp> {
    header_string(headers, "x-timestamp").and_then(|v| v.parse().ok())
}

/// Pull the attribute set out of HEAD/GET response headers.
pub fn parse_object_head(headers: &HeaderMap) -> ObjectHead {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        if let Some(key) = name.as_str().strip_prefix(OBJECT_META_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }

    let manifest = if header_string(headers, SLO_HEADER)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        Some(ManifestKind::Slo)
    } else {
        header_string(headers, DLO_HEADER).and_then(|value| {
            value.split_once('/').map(|(container, prefix)| ManifestKind::Dlo {
                container: container.to_string(),
                prefix: prefix.to_string(),
            })
        })
    };

    let last_modified = header_string(headers, "last-modified")
        .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
        .map(|dt| dt.with_timezone(&Utc));

    ObjectHead {
        etag: header_string(headers, "etag")
            .map(|e| crate::largeobject::etag::normalize_etag(&e)),
        timestamp: header_timestamp(headers),
        last_modified,
        size: header_string(headers, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        content_type: header_string(headers, "content-type"),
        metadata,
        manifest,
        delete_at: header_string(headers, "x-delete-at").and_then(|v| v.parse().ok()),
    }
}

fn is_container_system_key(key: &str) -> bool {
    CONTAINER_ACL_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(key))
        || key.eq_ignore_ascii_case("x-storage-policy")
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Encode an object name, keeping `/` separators intact.
fn encode_path(name: &str) -> String {
    name.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand a DLO into concrete segments by prefix listing.
pub async fn expand_dlo(
    provider: &(dyn ProviderTrait + Send + Sync),
    container: &str,
    prefix: &str,
) -> Result<Vec<SloSegment>> {
    let mut segments = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let page = provider
            .list_objects(container, marker.as_deref(), 1000, Some(prefix))
            .await?;
        for entry in &page.entries {
            segments.push(SloSegment {
                path: format!("/{container}/{}", entry.name),
                etag: entry.hash.clone().unwrap_or_default(),
                size: entry.bytes,
                range: None,
            });
        }
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => break,
        }
    }
    Ok(segments)
}
