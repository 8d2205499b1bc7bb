//! Boot HTTP endpoints.
//!
//! `/_/ipxe` hands the chainloaded iPXE its boot script, `/_/file` resolves
//! signed file URLs to Booter bytes, `/_/booting` lets the client-side UI
//! report progress, `/_/events` exposes a machine's boot log. Anything else
//! falls through to the optional UI asset directory.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use macaddr::MacAddr;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::booter::BootFile;
use crate::domain::{format_mac, Firmware, Machine, Phase};
use crate::error::{BootError, ServerError};
use crate::server::{ipxe, Context};
use crate::urlsign;
use crate::utils::parse_host_header;

/// A per-request failure with its HTTP mapping.
struct HttpError {
    status: StatusCode,
    err: BootError,
}

impl HttpError {
    /// Server-side failures that must not read as client errors.
    fn internal(err: BootError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<BootError> for HttpError {
    fn from(err: BootError) -> Self {
        let status = match &err {
            BootError::BadPacket(_) | BootError::UnsupportedClient(_) => StatusCode::BAD_REQUEST,
            BootError::SignatureInvalid => StatusCode::BAD_REQUEST,
            BootError::NotFound(_) | BootError::BooterRefused => StatusCode::NOT_FOUND,
            BootError::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            BootError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            BootError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, err }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, format!("{}\n", self.err)).into_response()
    }
}

/// HTTP request logging middleware.
async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    debug!(
        "{} {} {} - {}",
        addr.ip(),
        method,
        uri.path(),
        response.status().as_u16()
    );
    response
}

/// Create the boot router.
pub(crate) fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/_/ipxe", get(serve_ipxe))
        .route("/_/file", get(serve_file))
        .route("/_/booting", post(client_booting))
        .route("/_/events", get(machine_events))
        .fallback(ui_asset)
        .layer(middleware::from_fn(request_logging))
        .with_state(ctx)
}

/// The HTTP task: run the router until shut down.
pub(crate) fn serve_http(
    ctx: Arc<Context>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| ServerError::Listener {
            what: "HTTP",
            source,
        })?;

    runtime
        .block_on(async move {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            debug!("HTTP server up on {}", listener.local_addr()?);

            let app = router(ctx).into_make_service_with_connect_info::<SocketAddr>();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while running.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                })
                .await
        })
        .map_err(|source| ServerError::Listener {
            what: "HTTP",
            source,
        })
}

#[derive(Debug, Deserialize)]
struct IpxeQuery {
    mac: String,
    arch: u16,
}

/// Handle GET /_/ipxe?mac={mac}&arch={arch}
async fn serve_ipxe(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Query(query): Query<IpxeQuery>,
) -> Result<Response, HttpError> {
    let mac = MacAddr::from_str(&query.mac)
        .map_err(|_| BootError::BadPacket(format!("unparseable MAC {:?}", query.mac)))?;
    let arch = Firmware::from_id(query.arch).ok_or_else(|| {
        BootError::UnsupportedClient(format!("unknown architecture {}", query.arch))
    })?;
    let machine = Machine { mac, arch };
    let mac = format_mac(&mac);

    let booter = ctx.booter.clone();
    let spec = tokio::task::spawn_blocking(move || booter.boot_spec(&machine))
        .await
        .map_err(|e| HttpError::internal(BootError::Io(std::io::Error::other(e))))??;
    let Some(spec) = spec else {
        info!("HTTP: booter declined to boot {}", mac);
        return Err(BootError::BooterRefused.into());
    };

    let base_url = base_url(&headers, &ctx);
    let script = ipxe::assemble_script(&spec, &machine, &base_url, &ctx.key).map_err(|e| {
        info!("HTTP: building script for {} failed: {}", mac, e);
        // A bad spec or template is our configuration's fault, not the
        // client's.
        HttpError::internal(e)
    })?;

    info!("HTTP: sent boot script to {}", mac);
    ctx.events
        .record(&mac, Phase::HttpScript, "Sent iPXE boot script");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        script,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    name: String,
    #[serde(default)]
    mac: Option<String>,
}

/// Handle GET /_/file?name={signed-id}
async fn serve_file(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<FileQuery>,
) -> Result<Response, HttpError> {
    // Verification happens before the Booter is consulted; a tampered name
    // never reaches it.
    let id = urlsign::open_id(&query.name, &ctx.key)?;

    let booter = ctx.booter.clone();
    let open_id = id.clone();
    let file = tokio::task::spawn_blocking(move || booter.read_boot_file(&open_id))
        .await
        .map_err(|e| HttpError::internal(BootError::Io(std::io::Error::other(e))))??;

    if let Some(mac) = &query.mac {
        ctx.events.record(
            &mac.to_lowercase(),
            Phase::HttpFile,
            format!("Sent file {id}"),
        );
    }
    info!("HTTP: serving boot file {}", id);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(size) = file.size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }
    builder
        .body(stream_boot_file(file))
        .map_err(|e| HttpError::internal(BootError::Io(std::io::Error::other(e))))
}

#[derive(Debug, Deserialize)]
struct BootingQuery {
    mac: String,
    #[serde(default)]
    message: Option<String>,
}

/// Handle POST /_/booting?mac={mac}&message={text}
///
/// Lets the booting machine itself report progress into the event log.
async fn client_booting(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<BootingQuery>,
) -> StatusCode {
    let message = query.message.unwrap_or_else(|| "Machine is booting".to_string());
    ctx.events
        .record(&query.mac.to_lowercase(), Phase::ClientReport, message);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    mac: String,
}

/// Handle GET /_/events?mac={mac}
async fn machine_events(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<crate::domain::MachineEvent>> {
    Json(ctx.events.snapshot(&query.mac.to_lowercase()))
}

/// Serve operator UI assets, when a directory is configured.
async fn ui_asset(State(ctx): State<Arc<Context>>, uri: Uri) -> Result<Response, HttpError> {
    let Some(dir) = &ctx.ui_assets_dir else {
        return Err(BootError::NotFound(uri.path().to_string()).into());
    };

    let mut path = uri.path().trim_start_matches('/');
    if path.is_empty() {
        path = "index.html";
    }
    if path.contains("..") {
        return Err(BootError::BadPacket("path traversal".to_string()).into());
    }

    let bytes = tokio::fs::read(dir.join(path))
        .await
        .map_err(|_| BootError::NotFound(uri.path().to_string()))?;

    let content_type = match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}

/// The origin clients should use in generated URLs, from the Host header
/// they reached us with, falling back to the advertised interface address.
fn base_url(headers: &HeaderMap, ctx: &Context) -> String {
    if let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        let (host, port) = parse_host_header(Some(host), ctx.http_port);
        return format!("http://{host}:{port}");
    }
    let host = ctx
        .server_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "localhost".to_string());
    format!("http://{host}:{}", ctx.http_port)
}

/// Bridge a blocking Booter stream into a response body.
fn stream_boot_file(file: BootFile) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::task::spawn_blocking(move || {
        let mut reader = file.reader;
        let mut buf = [0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booter::{BootSpec, FileId, StaticBooter};
    use crate::domain::EventLog;
    use std::collections::HashMap;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::thread;

    fn start(ctx: Arc<Context>) -> (u16, Arc<AtomicBool>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        thread::spawn(move || serve_http(ctx, listener, running).unwrap());
        (port, flag)
    }

    fn context(kernel_id: &str) -> Arc<Context> {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from(kernel_id)),
            ..Default::default()
        })
        .unwrap();
        Arc::new(Context {
            booter: Arc::new(booter),
            ipxe: HashMap::new(),
            key: urlsign::generate_key(),
            events: EventLog::new(),
            http_port: 80,
            pxelinux_assets: HashMap::new(),
            ui_assets_dir: None,
            fixed_ip: Some(Ipv4Addr::LOCALHOST),
            interface: None,
        })
    }

    fn get(port: u16, path: &str) -> reqwest::blocking::Response {
        reqwest::blocking::get(format!("http://127.0.0.1:{port}{path}")).unwrap()
    }

    #[test]
    fn test_ipxe_file_and_events_flow() {
        // The kernel id is a local file, so /_/file can stream it back.
        let mut kernel = tempfile::NamedTempFile::new().unwrap();
        kernel.write_all(b"kernel image bytes").unwrap();
        let kernel_id = kernel.path().to_str().unwrap().to_string();

        let ctx = context(&kernel_id);
        let (port, flag) = start(ctx.clone());

        // Boot script for a UEFI64 machine.
        let response = get(port, "/_/ipxe?mac=52:54:00:12:34:56&arch=9");
        assert_eq!(response.status(), 200);
        let script = response.text().unwrap();
        assert!(script.starts_with("#!ipxe\n"), "got {script:?}");
        let kernel_line = script.lines().nth(1).unwrap();
        assert!(kernel_line.starts_with("kernel http://"));

        // The kernel URL in the script round-trips through /_/file.
        let path = kernel_line
            .strip_prefix(&format!("kernel http://127.0.0.1:{port}"))
            .expect("kernel URL uses the Host header origin");
        let response = get(port, path);
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-length")
                .unwrap()
                .to_str()
                .unwrap(),
            kernel.as_file().metadata().unwrap().len().to_string()
        );
        assert_eq!(response.bytes().unwrap().as_ref(), b"kernel image bytes");

        // Both phases landed in the event log.
        let response = get(port, "/_/events?mac=52:54:00:12:34:56");
        let body = response.text().unwrap();
        assert!(body.contains("http-script"), "events: {body}");
        assert!(body.contains("http-file"), "events: {body}");

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_tampered_file_url_is_rejected() {
        let ctx = context("/nonexistent/kernel");
        let signed = urlsign::sign_id(&FileId::from("/nonexistent/kernel"), &ctx.key).unwrap();
        let (port, flag) = start(ctx);

        // Flip one character of the signed blob.
        let mut tampered = signed.clone();
        let flipped = if tampered.starts_with('A') { "B" } else { "A" };
        tampered.replace_range(0..1, flipped);

        let response = get(port, &format!("/_/file?name={tampered}"));
        assert_eq!(response.status(), 400);

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_bad_queries_are_client_errors() {
        let ctx = context("k");
        let (port, flag) = start(ctx);

        assert_eq!(get(port, "/_/ipxe?mac=nonsense&arch=9").status(), 400);
        assert_eq!(get(port, "/_/ipxe?mac=52:54:00:12:34:56&arch=5").status(), 400);
        assert_eq!(get(port, "/_/ipxe?arch=9").status(), 400);
        assert_eq!(get(port, "/nowhere").status(), 404);

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_newline_in_cmdline_is_a_server_error() {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from("k")),
            cmdline: "bad\ncmdline".to_string(),
            ..Default::default()
        })
        .unwrap();
        let ctx = Arc::new(Context {
            booter: Arc::new(booter),
            ipxe: HashMap::new(),
            key: urlsign::generate_key(),
            events: EventLog::new(),
            http_port: 80,
            pxelinux_assets: HashMap::new(),
            ui_assets_dir: None,
            fixed_ip: Some(Ipv4Addr::LOCALHOST),
            interface: None,
        });
        let (port, flag) = start(ctx);

        let response = get(port, "/_/ipxe?mac=52:54:00:12:34:56&arch=9");
        assert_eq!(response.status(), 500);

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_client_booting_records_event() {
        let ctx = context("k");
        let (port, flag) = start(ctx.clone());

        let client = reqwest::blocking::Client::new();
        let response = client
            .post(format!(
                "http://127.0.0.1:{port}/_/booting?mac=AA:BB:CC:DD:EE:FF&message=installing"
            ))
            .send()
            .unwrap();
        assert_eq!(response.status(), 204);

        let events = ctx.events.snapshot("aa:bb:cc:dd:ee:ff");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::ClientReport);
        assert_eq!(events[0].message, "installing");

        flag.store(false, Ordering::SeqCst);
    }
}
