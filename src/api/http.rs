//! Submission Gateway
//!
//! HTTP surface of the middleware: POST a job config (JSON), a tar
//! archive with an embedded boot map, or a shebang script to
//! `/<account>[/<container>[/<object>]]` with `x-zerovm-execute: 1.0`;
//! or open a stored object through the registry with
//! `/<open|open-with>/<account>/<container>/<object>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use md5::{Digest, Md5};

use crate::accounting::ship_cdr_log;
use crate::config::StratorunConfig;
use crate::daemon::DaemonMatcher;
use crate::error::{Error, Result};
use crate::job::{job_from_json, FileDef, JobConfig};
use crate::orchestrator::source::CachedBody;
use crate::orchestrator::{Orchestrator, TAR_MIMES};
use crate::path::{parse_location, Location, StoragePath};
use crate::planner::ClusterPlanner;
use crate::storage::{ByteStream, ObjectResponse, StorageBackend};
use crate::tarball::{member_header, member_padding, member_total};

use super::template::{
    content_type_template, expand_template, TemplateCache, ACCOUNT_SCRIPT_TEMPLATE,
    DEFAULT_EXE_TEMPLATE, OBJECT_SCRIPT_TEMPLATE,
};

/// Header that marks a POST as an execution request
pub const EXECUTE_HEADER: &str = "x-zerovm-execute";
/// Engine version answered for bare execute requests
pub const EXECUTE_VERSION: &str = "1.0";
/// URL command names routed through the registry
pub const ALLOWED_COMMANDS: [&str; 2] = ["open", "open-with"];

/// Archive member names searched for the embedded job config
const CONFIG_MEMBER_NAMES: [&str; 2] = ["boot/cluster.map", "boot/system.map"];

/// Look-ahead cache for sniffing tar and shebang submissions
const STREAM_CACHE_SIZE: usize = 256 * 1024;

/// Shared gateway state
pub struct AppState {
    pub config: Arc<StratorunConfig>,
    pub storage: Arc<dyn StorageBackend>,
    pub daemons: Arc<DaemonMatcher>,
    pub cache: Arc<dyn TemplateCache>,
}

/// Submission API server
pub struct GatewayServer {
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(
        config: Arc<StratorunConfig>,
        storage: Arc<dyn StorageBackend>,
        daemons: Arc<DaemonMatcher>,
        cache: Arc<dyn TemplateCache>,
    ) -> Self {
        let state = Arc::new(AppState {
            config,
            storage,
            daemons,
            cache,
        });
        Self { state }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/*path", any(handle_request))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the gateway
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));
        let bind = &self.state.config.server.bind_address;
        let listener = tokio::net::TcpListener::bind(bind).await?;
        tracing::info!("Execution gateway listening on {}", bind);
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("gateway server error: {}", e)))?;
        Ok(())
    }
}

/// A parsed submission URL
struct UrlParts {
    command: Option<String>,
    account: String,
    container: Option<String>,
    object: Option<String>,
}

fn split_url(path: &str) -> Option<UrlParts> {
    let mut segments = path.trim_matches('/').splitn(4, '/').map(String::from);
    let first = segments.next().filter(|s| !s.is_empty())?;
    if ALLOWED_COMMANDS.contains(&first.as_str()) {
        let account = segments.next().filter(|s| !s.is_empty())?;
        Some(UrlParts {
            command: Some(first),
            account,
            container: segments.next(),
            object: segments.next(),
        })
    } else {
        Some(UrlParts {
            command: None,
            account: first,
            container: segments.next(),
            object: segments.next(),
        })
    }
}

async fn handle_request(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let parts = match split_url(uri.path()) {
        Some(parts) => parts,
        None => return plain_response(StatusCode::NOT_FOUND, "Not found"),
    };
    let is_execute = headers.contains_key(EXECUTE_HEADER) || parts.command.is_some();
    if !is_execute {
        return plain_response(StatusCode::PRECONDITION_FAILED, "Bad URL");
    }
    let txn_id = format!("tx{}", uuid::Uuid::new_v4().simple());
    let started = Instant::now();
    let result = if method == Method::GET {
        open_command(&state, &parts, &params, &txn_id).await
    } else if method == Method::POST && parts.command.is_none() {
        let stream: ByteStream = Box::pin(
            body.into_data_stream()
                .map(|chunk| chunk.map_err(|e| Error::ClientDisconnect(e.to_string()))),
        );
        submit(&state, &parts, &headers, stream, &txn_id).await
    } else {
        return plain_response(StatusCode::PRECONDITION_FAILED, "Bad HTTP method");
    };
    match result {
        Ok(mut response) => {
            stamp_cdr_elapsed(&mut response, started);
            response
        }
        Err(e) => {
            tracing::warn!("Request {} failed: {}", txn_id, e);
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            plain_response(status, &e.to_string())
        }
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response {
    (status, body.to_string()).into_response()
}

/// Prefix the aggregated cdr line with the request wall time
fn stamp_cdr_elapsed(response: &mut Response, started: Instant) {
    if let Some(value) = response.headers().get("x-nexe-cdr-line").cloned() {
        if let Ok(value) = value.to_str() {
            let stamped = format!("{:.3}, {}", started.elapsed().as_secs_f64(), value);
            if let Ok(stamped) = stamped.parse() {
                response.headers_mut().insert("x-nexe-cdr-line", stamped);
            }
        }
    }
}

/// Handle a GET: resolve the registry template for the object's
/// content type and run it as a one-node job
async fn open_command(
    state: &Arc<AppState>,
    parts: &UrlParts,
    params: &HashMap<String, String>,
    txn_id: &str,
) -> Result<Response> {
    let (container, object) = match (&parts.container, &parts.object) {
        (Some(container), Some(object)) => (container.clone(), object.clone()),
        _ => return Ok(plain_response(StatusCode::NOT_FOUND, "Not found")),
    };
    let object_path = StoragePath::new(parts.account.clone(), container.clone(), object.clone());
    let resp = state
        .storage
        .get_object(&object_path.path(), state.config.execution.uses_newest, false)
        .await?;
    if resp.status >= 300 {
        return Ok(plain_response(
            StatusCode::from_u16(resp.status).unwrap_or(StatusCode::NOT_FOUND),
            "Cannot fetch object",
        ));
    }
    let content = resp
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    let run = content == "application/x-nexe" || object.ends_with(".nexe");
    let registry = content_type_template(
        state.storage.as_ref(),
        state.cache.as_ref(),
        &parts.account,
        &state.config.registry.container,
        &content,
        state.config.execution.max_config,
        Duration::from_secs(state.config.registry.cache_timeout_secs),
    )
    .await?;
    let template = match registry {
        Some(template) => template,
        None if run => DEFAULT_EXE_TEMPLATE.to_string(),
        None => {
            return Ok(plain_response(
                StatusCode::NOT_FOUND,
                &format!("No application registered for {}", content),
            ))
        }
    };
    let config = expand_template(params, &template, &object_path.url());
    let job = job_from_json(config.as_bytes())?;
    let exe_resp = if run {
        Some((object_path.path(), resp))
    } else {
        None
    };
    run_job(
        state,
        &parts.account,
        Some(&container),
        job,
        None,
        exe_resp,
        txn_id,
    )
    .await
}

/// Handle an execute POST: JSON config, tar submission, or shebang
/// script
async fn submit(
    state: &Arc<AppState>,
    parts: &UrlParts,
    headers: &HeaderMap,
    body: ByteStream,
    txn_id: &str,
) -> Result<Response> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::BadRequest("Must specify Content-Type".to_string()))?;
    let main_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    let content_length: Option<u64> = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    if TAR_MIMES.contains(&main_type.as_str()) {
        // streaming a tar twice is impossible, so its length is required
        let length = content_length
            .ok_or_else(|| Error::BadRequest("Must specify Content-Length".to_string()))?;
        let cached = CachedBody::new(body, STREAM_CACHE_SIZE).await?;
        let config = find_config_member(&cached.cached_bytes()).ok_or_else(|| {
            Error::BadRequest("System boot map was not found in request".to_string())
        })?;
        let job = job_from_json(&config)?;
        let user_image = Some((length, cached.into_stream(None)));
        return run_job(
            state,
            &parts.account,
            parts.container.as_deref(),
            job,
            user_image,
            None,
            txn_id,
        )
        .await;
    }

    if main_type == "application/json" {
        let config = read_bounded_config(
            body,
            state.config.execution.max_config,
            content_length,
            headers.get("etag").and_then(|v| v.to_str().ok()),
            Duration::from_secs(state.config.timeouts.max_upload_secs),
        )
        .await?;
        let job = job_from_json(&config)?;
        return run_job(
            state,
            &parts.account,
            parts.container.as_deref(),
            job,
            None,
            None,
            txn_id,
        )
        .await;
    }

    // anything else starting with #! is a script submission
    let length = content_length
        .ok_or_else(|| Error::BadRequest("Must specify Content-Length".to_string()))?;
    let cached = CachedBody::new(body, STREAM_CACHE_SIZE).await?;
    let head = cached.cached_bytes();
    let (exe_path, args) = parse_shebang(&head)?;
    let location = parse_location(Some(&exe_path))
        .ok()
        .flatten()
        .ok_or_else(|| Error::BadRequest(format!("Bad interpreter {}", exe_path)))?;
    let mut sysimage = None;
    if let Location::Image(member) = &location {
        if member.image == "image" {
            return Err(Error::BadRequest(format!(
                "Must supply image name in shebang url {}",
                location.url()
            )));
        }
        sysimage = Some(member.image.clone());
    }
    let mut params = HashMap::from([("exe_path".to_string(), exe_path)]);
    if let Some(args) = args {
        params.insert("args".to_string(), args);
    }
    let (template, object_url) = match (&parts.container, &parts.object) {
        (Some(container), Some(object)) => (
            OBJECT_SCRIPT_TEMPLATE,
            StoragePath::new(parts.account.clone(), container.clone(), object.clone()).url(),
        ),
        _ => (ACCOUNT_SCRIPT_TEMPLATE, String::new()),
    };
    let config = expand_template(&params, template, &object_url);
    let mut job = job_from_json(config.as_bytes())?;
    if let (Some(sysimage), Some(node)) = (sysimage, job.first_mut()) {
        node.file_list.get_or_insert_with(Vec::new).push(FileDef {
            device: Some(sysimage),
            ..FileDef::default()
        });
    }
    // the script rides along as a single-member archive on the image
    // device, sized from the original Content-Length
    let header = member_header("script", length)?;
    let padding = member_padding(length);
    let image_length = member_total(length);
    let mut tail: Vec<Result<Bytes>> = Vec::new();
    if !padding.is_empty() {
        tail.push(Ok(padding));
    }
    let image: ByteStream = Box::pin(
        futures::stream::iter([Ok(header)])
            .chain(cached.into_stream(Some(length)))
            .chain(futures::stream::iter(tail)),
    );
    run_job(
        state,
        &parts.account,
        parts.container.as_deref(),
        job,
        Some((image_length, image)),
        None,
        txn_id,
    )
    .await
}

/// Plan and execute a job, then render the aggregated response
async fn run_job(
    state: &Arc<AppState>,
    account: &str,
    container: Option<&str>,
    job: JobConfig,
    user_image: Option<(u64, ByteStream)>,
    exe_resp: Option<(String, ObjectResponse)>,
    txn_id: &str,
) -> Result<Response> {
    let config = &state.config;
    let mut planner = ClusterPlanner::new(
        &config.execution.sysimage_devices,
        &config.execution.default_content_type,
        config.limits,
    );
    if let Err(e) = planner
        .plan(
            &job,
            user_image.is_some(),
            Some(account),
            state.storage.replica_count(),
            state.storage.as_ref(),
        )
        .await
    {
        tracing::warn!("Error parsing config: {}", e);
        return Err(e);
    }
    let orchestrator = Orchestrator::new(
        Arc::clone(&state.config),
        Arc::clone(&state.storage),
        Arc::clone(&state.daemons),
    );
    let outcome = orchestrator
        .execute(&mut planner, account, txn_id, user_image, exe_resp)
        .await?;

    if config.accounting.enabled {
        tokio::spawn(ship_cdr_log(
            Arc::clone(&state.storage),
            config.accounting.clone(),
            account.to_string(),
            outcome.cdr_lines.clone(),
        ));
    }

    let mut builder = Response::builder().status(StatusCode::OK);
    for (name, value) in &outcome.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(content_type) = &outcome.content_type {
        builder = builder.header("Content-Type", content_type.as_str());
    }
    if let Some(content_length) = outcome.content_length {
        builder = builder.header("Content-Length", content_length);
    }
    if config.execution.use_cors {
        if let Some(container) = container {
            if let Ok(info) = state.storage.container_info(account, container).await {
                if let Some(origin) = info.cors_allow_origin {
                    builder = builder.header("access-control-allow-origin", origin);
                }
                if let Some(expose) = info.cors_expose_headers {
                    builder = builder.header("access-control-expose-headers", expose);
                }
            }
        }
    }
    let body = match outcome.body {
        Some(stream) => Body::from_stream(stream.map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })),
        None => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("response build: {}", e)))
}

/// Read a JSON config body bounded by size, deadline and etag
async fn read_bounded_config(
    mut body: ByteStream,
    max_config: usize,
    content_length: Option<u64>,
    etag: Option<&str>,
    max_upload: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + max_upload;
    let mut config = Vec::new();
    let mut hasher = Md5::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if Instant::now() > deadline {
            return Err(Error::ClientTimeout(max_upload.as_secs()));
        }
        if config.len() + chunk.len() > max_config {
            return Err(Error::ConfigTooLarge(max_config));
        }
        hasher.update(&chunk);
        config.extend_from_slice(&chunk);
    }
    if let Some(expected) = content_length {
        if expected != config.len() as u64 {
            return Err(Error::ClientDisconnect(
                "application/json post unfinished".to_string(),
            ));
        }
    }
    if let Some(etag) = etag {
        let digest = hex::encode(hasher.finalize());
        if !etag.eq_ignore_ascii_case(&digest) {
            return Err(Error::Unprocessable("Etag mismatch".to_string()));
        }
    }
    Ok(config)
}

/// Extract the shebang interpreter and arguments from a script head
fn parse_shebang(head: &[u8]) -> Result<(String, Option<String>)> {
    if !head.starts_with(b"#!") {
        return Err(Error::BadRequest("Unsupported Content-Type".to_string()));
    }
    let newline = head
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| Error::BadRequest("Cannot find shebang (#!) in script".to_string()))?;
    let line = String::from_utf8_lossy(&head[2..newline]);
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let exe_path = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::BadRequest("Cannot find shebang (#!) in script".to_string()))?
        .to_string();
    let args = parts
        .next()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    Ok((exe_path, args))
}

/// Search the cached head of a tar submission for the embedded job
/// config member
fn find_config_member(data: &[u8]) -> Option<Vec<u8>> {
    let mut offset = 0usize;
    while offset + 512 <= data.len() {
        let block = &data[offset..offset + 512];
        if block.iter().all(|b| *b == 0) {
            return None;
        }
        let mut header = tar::Header::new_old();
        header.as_mut_bytes().copy_from_slice(block);
        let name = header.path().ok()?.to_string_lossy().into_owned();
        let size = header.entry_size().ok()? as usize;
        offset += 512;
        if CONFIG_MEMBER_NAMES.contains(&name.as_str()) {
            if offset + size <= data.len() {
                return Some(data[offset..offset + size].to_vec());
            }
            return None;
        }
        let padded = size.div_ceil(512) * 512;
        offset += padded;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_url_plain_and_command() {
        let parts = split_url("/acc/cont/obj/with/slashes").unwrap();
        assert!(parts.command.is_none());
        assert_eq!(parts.account, "acc");
        assert_eq!(parts.container.as_deref(), Some("cont"));
        assert_eq!(parts.object.as_deref(), Some("obj/with/slashes"));

        let parts = split_url("/open/acc/cont/obj").unwrap();
        assert_eq!(parts.command.as_deref(), Some("open"));
        assert_eq!(parts.account, "acc");

        assert!(split_url("/").is_none());
    }

    #[test]
    fn test_parse_shebang() {
        let (exe, args) = parse_shebang(b"#!swift://acc/bin/py.nexe -u\nprint 1\n").unwrap();
        assert_eq!(exe, "swift://acc/bin/py.nexe");
        assert_eq!(args.as_deref(), Some("-u"));

        let (exe, args) = parse_shebang(b"#! swift://acc/bin/sh.nexe\nbody").unwrap();
        assert_eq!(exe, "swift://acc/bin/sh.nexe");
        assert!(args.is_none());

        assert!(parse_shebang(b"not a script").is_err());
        assert!(parse_shebang(b"#!no newline").is_err());
    }

    #[test]
    fn test_find_config_member() {
        let mut data = Vec::new();
        let payload = br#"[{"name":"a"}]"#;
        data.extend_from_slice(&member_header("boot/system.map", payload.len() as u64).unwrap());
        data.extend_from_slice(payload);
        data.extend_from_slice(&member_padding(payload.len() as u64));
        data.extend_from_slice(&member_header("other", 3).unwrap());
        data.extend_from_slice(b"xyz");
        data.extend_from_slice(&member_padding(3));

        let found = find_config_member(&data).unwrap();
        assert_eq!(found, payload);

        // config buried after another member is still found
        let mut data2 = Vec::new();
        data2.extend_from_slice(&member_header("other", 3).unwrap());
        data2.extend_from_slice(b"xyz");
        data2.extend_from_slice(&member_padding(3));
        data2.extend_from_slice(
            &member_header("boot/cluster.map", payload.len() as u64).unwrap(),
        );
        data2.extend_from_slice(payload);
        data2.extend_from_slice(&member_padding(payload.len() as u64));
        assert_eq!(find_config_member(&data2).unwrap(), payload);

        assert!(find_config_member(b"garbage").is_none());
    }

    #[tokio::test]
    async fn test_read_bounded_config_etag_and_size() {
        let body: ByteStream = Box::pin(futures::stream::iter([
            Ok(Bytes::from_static(b"[{\"name\":")),
            Ok(Bytes::from_static(b"\"a\"}]")),
        ]));
        let expected = hex::encode(Md5::digest(b"[{\"name\":\"a\"}]"));
        let config = read_bounded_config(
            body,
            1024,
            Some(14),
            Some(&expected),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(config, b"[{\"name\":\"a\"}]");
    }

    #[tokio::test]
    async fn test_read_bounded_config_rejects_oversize() {
        let body: ByteStream =
            Box::pin(futures::stream::iter([Ok(Bytes::from(vec![b'x'; 100]))]));
        let err = read_bounded_config(body, 10, None, None, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigTooLarge(_)));
    }

    #[tokio::test]
    async fn test_read_bounded_config_rejects_bad_etag() {
        let body: ByteStream =
            Box::pin(futures::stream::iter([Ok(Bytes::from_static(b"[]"))]));
        let err = read_bounded_config(
            body,
            1024,
            None,
            Some("deadbeefdeadbeefdeadbeefdeadbeef"),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Unprocessable(_)));
    }

    #[tokio::test]
    async fn test_read_bounded_config_rejects_short_body() {
        let body: ByteStream =
            Box::pin(futures::stream::iter([Ok(Bytes::from_static(b"[]"))]));
        let err = read_bounded_config(body, 1024, Some(10), None, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientDisconnect(_)));
    }
}
