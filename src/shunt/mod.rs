use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use bytes::Bytes;
use futures_util::stream::TryStreamExt;
use http::{Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::config::{Config, ConfigWatcher};
use crate::provider::{GetResponse, Provider, ProviderTrait, RemoteConfig, create_remote_provider};
use crate::types::error::{SpanError, classify};
use crate::types::{ListEntry, ObjectRef};

pub type ShuntBody = BoxBody<Bytes, std::io::Error>;

/// Rendering chosen from the request's `Accept` header. Plain text is the
/// Swift default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Plain,
    Json,
    Xml,
}

impl ListingFormat {
    pub fn from_accept(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return ListingFormat::Plain;
        };
        if accept.contains("application/json") {
            ListingFormat::Json
        } else if accept.contains("/xml") {
            ListingFormat::Xml
        } else {
            ListingFormat::Plain
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            ListingFormat::Plain => "text/plain; charset=utf-8",
            ListingFormat::Json => "application/json; charset=utf-8",
            ListingFormat::Xml => "application/xml; charset=utf-8",
        }
    }
}

/// Proxy middleware that services local misses from the remote side of the
/// applicable profile. The embedding server calls in on local 404s and on
/// listing requests; everything else passes through untouched.
pub struct ShuntHandler {
    config: RwLock<Arc<Config>>,
    watcher: Mutex<ConfigWatcher>,
    providers: tokio::sync::Mutex<HashMap<String, Provider>>,
}

impl ShuntHandler {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = Config::load(config_path)?;
        let mut watcher = ConfigWatcher::new(config_path);
        watcher.poll();
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            watcher: Mutex::new(watcher),
            providers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn from_config(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            watcher: Mutex::new(ConfigWatcher::new(Path::new("/nonexistent"))),
            providers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a fresh config when the file mtime moved. Invalid content
    /// keeps the serving config.
    pub async fn reload_if_changed(&self) {
        let reloaded = self.watcher.lock().unwrap().poll();
        if let Some(config) = reloaded {
            debug!("shunt configuration reloaded.");
            *self.config.write().unwrap() = Arc::new(config);
            self.providers.lock().await.clear();
        }
    }

    fn config(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    async fn provider_for(&self, remote_config: RemoteConfig, id: &str) -> Result<Provider> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(id) {
            return Ok(provider.clone());
        }
        let provider = create_remote_provider(remote_config).await?;
        providers.insert(id.to_string(), provider.clone());
        Ok(provider)
    }

    fn remote_for(&self, account: &str, container: &str) -> Option<(RemoteConfig, String)> {
        let config = self.config();
        if let Some(migration) = config.migration_for(account, container) {
            return Some((RemoteConfig::from(migration), migration.profile_id()));
        }
        config
            .sync_profiles_for(account, container)
            .into_iter()
            .find(|p| p.merge_namespaces)
            .map(|p| (RemoteConfig::from(p), p.profile_id()))
    }

    /// Service a GET/HEAD that 404ed locally. `None` means no profile
    /// covers the path and the local 404 stands.
    pub async fn handle_object_miss(
        &self,
        account: &str,
        container: &str,
        name: &str,
        range: Option<&str>,
        head_only: bool,
    ) -> Option<Response<ShuntBody>> {
        let (remote_config, id) = self.remote_for(account, container)?;
        let provider = match self.provider_for(remote_config, &id).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!("shunt provider construction failed: {e:#}");
                return Some(bad_gateway());
            }
        };
        let object = ObjectRef::new(account, container, name);
        Some(fetch_object(&provider, &object, range, head_only).await)
    }

    /// Merge a local container listing with the remote's view.
    pub async fn handle_container_listing(
        &self,
        account: &str,
        container: &str,
        local_entries: Vec<ListEntry>,
        marker: Option<&str>,
        limit: usize,
        prefix: Option<&str>,
        format: ListingFormat,
    ) -> Option<Response<ShuntBody>> {
        let config = self.config();
        let migration = config.migration_for(account, container)?;
        let remote_config = RemoteConfig::from(migration);
        let id = migration.profile_id();
        let provider = match self.provider_for(remote_config, &id).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!("shunt provider construction failed: {e:#}");
                return Some(bad_gateway());
            }
        };
        let remote_entries = match provider
            .list_objects(container, marker, limit, prefix)
            .await
        {
            Ok(page) => page.entries,
            Err(e) => match classify(&e) {
                Some(SpanError::NotFound) => Vec::new(),
                _ => {
                    warn!("remote listing failed: {e:#}");
                    return Some(bad_gateway());
                }
            },
        };
        let merged = merge_entries(local_entries, remote_entries, &provider.provider_id());
        Some(render_listing(container, &merged, limit, format))
    }

    /// Under a wildcard migration an account GET reflects the remote's
    /// container set as well.
    pub async fn handle_account_listing(
        &self,
        account: &str,
        local_containers: Vec<String>,
        format: ListingFormat,
    ) -> Option<Response<ShuntBody>> {
        let config = self.config();
        let migration = config
            .migrations
            .iter()
            .find(|m| m.account == account && m.is_wildcard())?;
        let remote_config = RemoteConfig::from(migration);
        let id = migration.profile_id();
        let provider = match self.provider_for(remote_config, &id).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!("shunt provider construction failed: {e:#}");
                return Some(bad_gateway());
            }
        };
        let remote = match provider.list_containers(account, None, 10_000).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("remote account listing failed: {e:#}");
                return Some(bad_gateway());
            }
        };

        let mut names: Vec<String> = local_containers;
        for container in remote {
            if !names.contains(&container.name) {
                names.push(container.name);
            }
        }
        names.sort();

        let body = match format {
            ListingFormat::Json => serde_json::to_string(
                &names
                    .iter()
                    .map(|name| serde_json::json!({"name": name.nfc().collect::<String>()}))
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_default(),
            _ => {
                let mut text = names
                    .iter()
                    .map(|name| name.nfc().collect::<String>())
                    .collect::<Vec<_>>()
                    .join("\n");
                text.push('\n');
                text
            }
        };
        Some(buffered_response(StatusCode::OK, format.content_type(), body.into_bytes()))
    }
}

/// Fetch an object from the remote, translating failures into proxy-shaped
/// responses. A 206 whose range covers the whole object is promoted to 200.
pub async fn fetch_object(
    provider: &Provider,
    object: &ObjectRef,
    range: Option<&str>,
    head_only: bool,
) -> Response<ShuntBody> {
    let parsed_range = range.and_then(parse_range_header);

    // The HEAD settles existence, size, and whether a ranged request in
    // fact spans the full object.
    let head = match provider.head_object(object).await {
        Ok(Some(head)) => head,
        Ok(None) => return status_response(StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e),
    };

    let effective_range = match parsed_range {
        Some((start, end)) => {
            let end = end.unwrap_or(head.size.saturating_sub(1));
            if start == 0 && end + 1 >= head.size {
                None
            } else {
                Some((start, end))
            }
        }
        None => None,
    };

    if head_only {
        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, head.size)
            .header(header::CONTENT_TYPE, head.content_type.clone().unwrap_or_else(|| "application/octet-stream".into()));
        if let Some(etag) = &head.etag {
            response = response.header(header::ETAG, format!("\"{etag}\""));
        }
        if let Some(timestamp) = &head.timestamp {
            response = response.header("x-timestamp", timestamp.to_string());
        }
        for (key, value) in &head.metadata {
            response = response.header(format!("x-object-meta-{key}"), value.as_str());
        }
        return response
            .body(empty_body())
            .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY));
    }

    let response = match provider.get_object(object, effective_range).await {
        Ok(response) => response,
        Err(e) => return error_response(&e),
    };
    let content_length = match effective_range {
        Some((start, end)) => end - start + 1,
        None => head.size,
    };
    stream_response(response, effective_range.is_some(), content_length)
}

fn stream_response(
    response: GetResponse,
    ranged: bool,
    content_length: u64,
) -> Response<ShuntBody> {
    let GetResponse { status, head, body } = response;
    let status = if status == 206 && !ranged {
        // Full-coverage range requests come back whole.
        StatusCode::OK
    } else {
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
    };

    let stream = ReaderStream::new(body).map_ok(Frame::data);
    let boxed = BodyExt::boxed(StreamBody::new(stream));

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, content_length)
        .header(
            header::CONTENT_TYPE,
            head.content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
        );
    if let Some(etag) = &head.etag {
        builder = builder.header(header::ETAG, format!("\"{etag}\""));
    }
    if let Some(timestamp) = &head.timestamp {
        builder = builder.header("x-timestamp", timestamp.to_string());
    }
    for (key, value) in &head.metadata {
        builder = builder.header(format!("x-object-meta-{key}"), value.as_str());
    }
    builder
        .body(boxed)
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
}

/// Merge-sort local and remote listings by name. Exact-name duplicates keep
/// the local entry; remote-only entries carry a `content-location` marker.
pub fn merge_entries(
    local: Vec<ListEntry>,
    remote: Vec<ListEntry>,
    location: &str,
) -> Vec<ListEntry> {
    let mut merged = Vec::with_capacity(local.len() + remote.len());
    let mut local_iter = local.into_iter().peekable();
    let mut remote_iter = remote.into_iter().peekable();

    loop {
        match (local_iter.peek(), remote_iter.peek()) {
            (Some(l), Some(r)) => {
                if l.name < r.name {
                    merged.push(local_iter.next().unwrap());
                } else if r.name < l.name {
                    let mut entry = remote_iter.next().unwrap();
                    entry.content_location = Some(location.to_string());
                    merged.push(entry);
                } else {
                    merged.push(local_iter.next().unwrap());
                    remote_iter.next();
                }
            }
            (Some(_), None) => merged.push(local_iter.next().unwrap()),
            (None, Some(_)) => {
                let mut entry = remote_iter.next().unwrap();
                entry.content_location = Some(location.to_string());
                merged.push(entry);
            }
            (None, None) => break,
        }
    }
    merged
}

/// Render a merged listing in the requested format. Names come out
/// NFC-normalized.
pub fn render_listing(
    container: &str,
    entries: &[ListEntry],
    limit: usize,
    format: ListingFormat,
) -> Response<ShuntBody> {
    let entries: Vec<ListEntry> = entries
        .iter()
        .take(limit)
        .map(|entry| ListEntry {
            name: entry.name.nfc().collect::<String>(),
            ..entry.clone()
        })
        .collect();

    let body = match format {
        ListingFormat::Json => serde_json::to_string(&entries).unwrap_or_default(),
        ListingFormat::Plain => {
            let mut text = entries
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            text
        }
        ListingFormat::Xml => {
            let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
            xml.push_str(&format!("<container name=\"{}\">", xml_escape(container)));
            for entry in &entries {
                xml.push_str("<object>");
                xml.push_str(&format!("<name>{}</name>", xml_escape(&entry.name)));
                if let Some(hash) = &entry.hash {
                    xml.push_str(&format!("<hash>{}</hash>", xml_escape(hash)));
                }
                xml.push_str(&format!("<bytes>{}</bytes>", entry.bytes));
                if let Some(content_type) = &entry.content_type {
                    xml.push_str(&format!(
                        "<content_type>{}</content_type>",
                        xml_escape(content_type)
                    ));
                }
                if let Some(last_modified) = &entry.last_modified {
                    xml.push_str(&format!(
                        "<last_modified>{}</last_modified>",
                        xml_escape(last_modified)
                    ));
                }
                xml.push_str("</object>");
            }
            xml.push_str("</container>");
            xml
        }
    };
    buffered_response(StatusCode::OK, format.content_type(), body.into_bytes())
}

fn parse_range_header(range: &str) -> Option<(u64, Option<u64>)> {
    let spec = range.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn empty_body() -> ShuntBody {
    BodyExt::boxed(Full::new(Bytes::new()).map_err(std::io::Error::other))
}

fn buffered_response(
    status: StatusCode,
    content_type: &str,
    body: Vec<u8>,
) -> Response<ShuntBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .body(BodyExt::boxed(
            Full::new(Bytes::from(body)).map_err(std::io::Error::other),
        ))
        .unwrap()
}

fn status_response(status: StatusCode) -> Response<ShuntBody> {
    let body = status
        .canonical_reason()
        .unwrap_or_default()
        .as_bytes()
        .to_vec();
    buffered_response(status, "text/plain; charset=utf-8", body)
}

/// Upstream statuses pass through where meaningful; everything else is a
/// 502 with an accurate `Content-Length`.
fn error_response(e: &anyhow::Error) -> Response<ShuntBody> {
    match classify(e) {
        Some(SpanError::NotFound) => status_response(StatusCode::NOT_FOUND),
        Some(SpanError::Remote4xxClient(416)) => status_response(StatusCode::RANGE_NOT_SATISFIABLE),
        _ => bad_gateway(),
    }
}

fn bad_gateway() -> Response<ShuntBody> {
    status_response(StatusCode::BAD_GATEWAY)
}
