#![forbid(unsafe_code)]

use crate::config::PeerConfig;
use crate::http::{HttpRequest, read_request, write_response};
use crate::main_context::{DispatchError, Dispatcher};
use crate::protocol::{
    AUTH_HEADER, EXECUTE_PATH, EXECUTE_PATH_ALIAS, ExecuteResponse, HEALTH_PATH, decode_request,
};
use crate::runtime::{EndpointInfo, RuntimeDir, generate_token, tokens_match};
use crate::tls::{ServerStream, self_signed_server_config, server_config};
use crate::GatewayError;
use peerlink_core::PeerIdentity;
use peerlink_core::clock::now_ms;
use rustls::ServerConfig;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const DRAIN_POLL: Duration = Duration::from_millis(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    Stopped,
    Starting,
    Listening,
    Draining,
}

#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub bind: SocketAddr,
    /// Host name other peers use to reach this gateway.
    pub advertised_host: String,
    pub runtime_dir: RuntimeDir,
    pub shared_token: Option<String>,
    /// PEM certificate chain and private key. A self-signed certificate is generated when
    /// absent.
    pub tls_files: Option<(PathBuf, PathBuf)>,
    pub drain_timeout: Duration,
    /// How long a connection waits for the main context to run its request.
    pub request_timeout: Duration,
}

impl GatewayOptions {
    /// Loopback, any free port, self-signed certificate.
    pub fn loopback(runtime_dir: RuntimeDir) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertised_host: "127.0.0.1".to_string(),
            runtime_dir,
            shared_token: None,
            tls_files: None,
            drain_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(90),
        }
    }

    pub fn from_config(config: &PeerConfig, runtime_dir: RuntimeDir, hostname: &str) -> Self {
        let bind = config.bind_addr();
        let advertised_host = if bind.ip().is_unspecified() {
            hostname.to_string()
        } else {
            bind.ip().to_string()
        };
        Self {
            bind,
            advertised_host,
            runtime_dir,
            shared_token: config.shared_token.clone(),
            tls_files: config
                .tls_files()
                .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf())),
            drain_timeout: config.drain_timeout(),
            request_timeout: config.invoke_timeout(),
        }
    }
}

/// Token-guarded HTTPS endpoint that forwards requests to the peer's main context.
///
/// Dropping the gateway shuts it down.
pub struct Gateway {
    identity: PeerIdentity,
    options: GatewayOptions,
    endpoint: EndpointInfo,
    state: Arc<Mutex<GatewayState>>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    accept_thread: Option<JoinHandle<()>>,
}

struct ConnectionContext {
    session_tag: String,
    dispatcher: Dispatcher,
    tokens: Vec<String>,
    request_timeout: Duration,
}

impl ConnectionContext {
    fn authorized(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        // Every candidate is compared so the outcome does not depend on which one matched.
        self.tokens
            .iter()
            .fold(false, |ok, token| tokens_match(token, presented) | ok)
    }
}

/// Counts a connection as in flight until dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gateway {
    pub fn start(
        identity: PeerIdentity,
        dispatcher: Dispatcher,
        options: GatewayOptions,
    ) -> Result<Self, GatewayError> {
        let state = Arc::new(Mutex::new(GatewayState::Starting));
        let tls = match &options.tls_files {
            Some((cert, key)) => server_config(cert, key)?,
            None => self_signed_server_config(&[options.advertised_host.as_str()])?,
        };

        let listener = TcpListener::bind(options.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let token = generate_token();
        options.runtime_dir.write_token(&identity.session_id, &token)?;
        let endpoint = EndpointInfo {
            session_id: identity.session_id.clone(),
            hostname: options.advertised_host.clone(),
            port: local_addr.port(),
            pid: identity.pid,
            tls: true,
            started_at_ms: now_ms(),
        };
        if let Err(err) = options.runtime_dir.write_endpoint(&endpoint) {
            options.runtime_dir.remove_session_files(&identity.session_id);
            return Err(err);
        }

        let mut tokens = vec![token];
        tokens.extend(options.shared_token.iter().cloned());
        let context = Arc::new(ConnectionContext {
            session_tag: identity.session_id.to_string(),
            dispatcher,
            tokens,
            request_timeout: options.request_timeout,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let in_flight = Arc::clone(&in_flight);
            std::thread::Builder::new()
                .name("peerlink-gateway".to_string())
                .spawn(move || run_accept_loop(listener, context, tls, shutdown, in_flight))
        };
        let accept_thread = match accept_thread {
            Ok(handle) => handle,
            Err(err) => {
                options.runtime_dir.remove_session_files(&identity.session_id);
                return Err(err.into());
            }
        };

        *state.lock().unwrap_or_else(PoisonError::into_inner) = GatewayState::Listening;
        tracing::info!(
            session = %identity.session_id,
            addr = %local_addr,
            tls = endpoint.tls,
            "gateway listening"
        );

        Ok(Self {
            identity,
            options,
            endpoint,
            state,
            shutdown,
            in_flight,
            accept_thread: Some(accept_thread),
        })
    }

    /// Like [`Gateway::start`], but a failure is logged and the peer carries on without
    /// remote execution.
    pub fn start_best_effort(
        identity: PeerIdentity,
        dispatcher: Dispatcher,
        options: GatewayOptions,
    ) -> Option<Self> {
        let bind = options.bind;
        match Self::start(identity, dispatcher, options) {
            Ok(gateway) => Some(gateway),
            Err(err) => {
                tracing::warn!(%bind, error = %err, "gateway failed to start; remote execution disabled");
                None
            }
        }
    }

    pub fn state(&self) -> GatewayState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: GatewayState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn endpoint(&self) -> &EndpointInfo {
        &self.endpoint
    }

    pub fn uses_tls(&self) -> bool {
        self.endpoint.tls
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops accepting, waits up to the drain timeout for in-flight requests and removes the
    /// token and endpoint files. Returns false when requests were still running at the
    /// deadline.
    pub fn shutdown(&mut self) -> bool {
        if self.state() == GatewayState::Stopped {
            return true;
        }
        self.set_state(GatewayState::Draining);
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::warn!("gateway accept thread panicked");
        }

        let deadline = Instant::now() + self.options.drain_timeout;
        while self.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }
        let drained = self.in_flight() == 0;
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight(),
                "gateway drain timed out; abandoning running requests"
            );
        }

        self.options
            .runtime_dir
            .remove_session_files(&self.identity.session_id);
        self.set_state(GatewayState::Stopped);
        tracing::info!(session = %self.identity.session_id, "gateway stopped");
        drained
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    tls: Arc<ServerConfig>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let guard = InFlight::enter(&in_flight);
                let context = Arc::clone(&context);
                let tls = Arc::clone(&tls);
                let spawned = std::thread::Builder::new()
                    .name("peerlink-conn".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        serve_connection(stream, peer, &context, &tls);
                    });
                if let Err(err) = spawned {
                    tracing::warn!(%peer, error = %err, "failed to spawn connection thread");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::debug!(error = %err, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: &ConnectionContext,
    tls: &Arc<ServerConfig>,
) {
    // Accepted sockets inherit non-blocking mode on some platforms.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(IO_TIMEOUT));
    let _ = stream.set_write_timeout(Some(IO_TIMEOUT));
    let _ = stream.set_nodelay(true);

    let mut stream = match ServerStream::accept(stream, tls) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%peer, error = %err, "tls session setup failed");
            return;
        }
    };
    if let Err(err) = handle_connection(&mut stream, context) {
        tracing::debug!(%peer, error = %err, "connection ended with an error");
    }
    stream.finish();
}

fn handle_connection<S: Read + Write>(
    stream: &mut S,
    context: &ConnectionContext,
) -> std::io::Result<()> {
    let request = match read_request(stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            return write_execute(
                stream,
                "413 Payload Too Large",
                &ExecuteResponse::failed(String::new(), format!("compile: {err}")),
            );
        }
        Err(err) => return Err(err),
    };

    let path = request.path.split('?').next().unwrap_or("/");
    match (request.method.as_str(), path) {
        ("GET" | "HEAD", HEALTH_PATH) => {
            let body = serde_json::json!({ "ok": true, "session_id": context.session_tag });
            write_response(
                stream,
                "200 OK",
                "application/json; charset=utf-8",
                body.to_string().as_bytes(),
                request.method == "HEAD",
            )
        }
        ("POST", EXECUTE_PATH | EXECUTE_PATH_ALIAS) => execute(stream, &request, context),
        (_, EXECUTE_PATH | EXECUTE_PATH_ALIAS | HEALTH_PATH) => write_response(
            stream,
            "405 Method Not Allowed",
            "text/plain; charset=utf-8",
            b"Method not allowed.",
            false,
        ),
        _ => write_response(
            stream,
            "404 Not Found",
            "text/plain; charset=utf-8",
            b"Not found.",
            false,
        ),
    }
}

fn execute<S: Write>(
    stream: &mut S,
    request: &HttpRequest,
    context: &ConnectionContext,
) -> std::io::Result<()> {
    if !context.authorized(request.header(AUTH_HEADER)) {
        tracing::warn!(path = %request.path, "rejected request with a missing or invalid token");
        return write_execute(
            stream,
            "401 Unauthorized",
            &ExecuteResponse::failed(String::new(), "unauthorized: missing or invalid token"),
        );
    }

    let decoded = match decode_request(request.header("content-type"), &request.body) {
        Ok(decoded) => decoded,
        Err(message) => {
            tracing::debug!(error = %message, "request did not decode");
            return write_execute(
                stream,
                "400 Bad Request",
                &ExecuteResponse::failed(String::new(), format!("compile: {message}")),
            );
        }
    };

    let label = decoded.label().to_string();
    match context.dispatcher.execute(decoded, context.request_timeout) {
        Ok(response) => write_execute(stream, "200 OK", &response),
        Err(err @ DispatchError::Unavailable) => {
            tracing::warn!(command = %label, "main context unavailable");
            write_execute(
                stream,
                "503 Service Unavailable",
                &ExecuteResponse::failed(String::new(), format!("unavailable: {err}")),
            )
        }
        Err(err @ DispatchError::TimedOut(_)) => {
            tracing::warn!(command = %label, "main context did not answer in time");
            write_execute(
                stream,
                "504 Gateway Timeout",
                &ExecuteResponse::failed(String::new(), format!("timeout: {err}")),
            )
        }
    }
}

fn write_execute<S: Write>(
    stream: &mut S,
    status: &str,
    response: &ExecuteResponse,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    write_response(
        stream,
        status,
        "application/json; charset=utf-8",
        &body,
        false,
    )
}
