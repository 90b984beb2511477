#![forbid(unsafe_code)]

use crate::config::PeerConfig;
use crate::http::{read_response, write_request};
use crate::protocol::{AUTH_HEADER, EXECUTE_PATH, ExecuteResponse, RemoteCommand};
use crate::runtime::RuntimeDir;
use crate::tls::{ClientStream, client_config};
use crate::GatewayError;
use peerlink_core::ids::SessionId;
use peerlink_storage::SharedStore;
use rustls::ClientConfig;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown peer {0}: no live registry entry or endpoint file")]
    UnknownPeer(SessionId),
    #[error("no token available for peer {0}")]
    MissingToken(SessionId),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("tls: {0}")]
    Tls(String),
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<GatewayError> for InvokeError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Io(err) => Self::Io(err),
            other => Self::Tls(other.to_string()),
        }
    }
}

/// Where a peer's gateway can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Calls other peers' gateways. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RemoteClient {
    store: SharedStore,
    runtime_dir: RuntimeDir,
    shared_token: Option<String>,
    remote_tls: bool,
    default_timeout: Duration,
    tls_config: Arc<ClientConfig>,
}

impl RemoteClient {
    pub fn new(store: SharedStore, runtime_dir: RuntimeDir) -> Result<Self, GatewayError> {
        Ok(Self {
            store,
            runtime_dir,
            shared_token: None,
            remote_tls: true,
            default_timeout: DEFAULT_INVOKE_TIMEOUT,
            tls_config: client_config()?,
        })
    }

    pub fn from_config(
        store: SharedStore,
        runtime_dir: RuntimeDir,
        config: &PeerConfig,
    ) -> Result<Self, GatewayError> {
        Ok(Self::new(store, runtime_dir)?
            .with_shared_token(config.shared_token.clone())
            .with_remote_tls(config.remote_tls)
            .with_default_timeout(config.invoke_timeout()))
    }

    pub fn with_shared_token(mut self, token: Option<String>) -> Self {
        self.shared_token = token;
        self
    }

    pub fn with_remote_tls(mut self, remote_tls: bool) -> Self {
        self.remote_tls = remote_tls;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Registry first; a local endpoint file for the same port supplies the reachable host
    /// and TLS flag, and stands in when the registry has no live row.
    pub fn resolve(&self, session_id: &SessionId) -> Result<Target, InvokeError> {
        let endpoint = self.runtime_dir.read_endpoint(session_id);
        match (self.store.peer_endpoint(session_id), endpoint) {
            (Some((_, port)), Some(local)) if local.port == port => Ok(Target {
                host: local.hostname,
                port,
                tls: local.tls,
            }),
            (Some((host, port)), _) => Ok(Target {
                host,
                port,
                tls: self.remote_tls,
            }),
            (None, Some(local)) => Ok(Target {
                host: local.hostname,
                port: local.port,
                tls: local.tls,
            }),
            (None, None) => Err(InvokeError::UnknownPeer(session_id.clone())),
        }
    }

    fn token_for(&self, session_id: &SessionId) -> Result<String, InvokeError> {
        self.runtime_dir
            .read_token(session_id)
            .or_else(|| self.shared_token.clone())
            .ok_or_else(|| InvokeError::MissingToken(session_id.clone()))
    }

    pub fn invoke(
        &self,
        session_id: &SessionId,
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, InvokeError> {
        let body = serde_json::to_vec(command)?;
        tracing::debug!(session = %session_id, command = command.name(), "invoking remote command");
        self.post(session_id, "application/json", &body, timeout)
    }

    /// Sends a raw source fragment. The target must be built with fragments enabled.
    #[cfg(feature = "fragments")]
    pub fn invoke_fragment(
        &self,
        session_id: &SessionId,
        source: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, InvokeError> {
        self.post(
            session_id,
            "text/plain; charset=utf-8",
            source.as_bytes(),
            timeout,
        )
    }

    /// Runs the call on a detached thread and only logs the outcome.
    pub fn invoke_fire_and_forget(&self, session_id: &SessionId, command: RemoteCommand) {
        let client = self.clone();
        let session_id = session_id.clone();
        let spawned = std::thread::Builder::new()
            .name("peerlink-invoke".to_string())
            .spawn(move || match client.invoke(&session_id, &command, None) {
                Ok(response) if response.success => {
                    tracing::debug!(session = %session_id, command = command.name(), "fire-and-forget call succeeded");
                }
                Ok(response) => {
                    tracing::warn!(
                        session = %session_id,
                        command = command.name(),
                        error = response.error.as_deref().unwrap_or(""),
                        "fire-and-forget call failed remotely"
                    );
                }
                Err(err) => {
                    tracing::warn!(session = %session_id, command = command.name(), error = %err, "fire-and-forget call failed");
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn fire-and-forget call");
        }
    }

    /// Calls every session in parallel and waits for all of them. Peers that could not be
    /// reached are logged and left out of the result.
    pub fn invoke_all(
        &self,
        sessions: &[SessionId],
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Vec<(SessionId, ExecuteResponse)> {
        std::thread::scope(|scope| {
            let handles = sessions
                .iter()
                .map(|session_id| {
                    let handle = scope.spawn(move || self.invoke(session_id, command, timeout));
                    (session_id, handle)
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .filter_map(|(session_id, handle)| match handle.join() {
                    Ok(Ok(response)) => Some((session_id.clone(), response)),
                    Ok(Err(err)) => {
                        tracing::warn!(session = %session_id, error = %err, "peer did not answer");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(session = %session_id, "invocation thread panicked");
                        None
                    }
                })
                .collect()
        })
    }

    fn post(
        &self,
        session_id: &SessionId,
        content_type: &str,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse, InvokeError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let target = self.resolve(session_id)?;
        let token = self.token_for(session_id)?;

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| InvokeError::UnknownPeer(session_id.clone()))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| timed_out(e, timeout))?;
        let remaining = timeout
            .checked_sub(started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(InvokeError::Timeout(timeout))?;
        tcp.set_read_timeout(Some(remaining))?;
        tcp.set_write_timeout(Some(remaining))?;
        let _ = tcp.set_nodelay(true);

        let tls = target.tls.then_some(&self.tls_config);
        let mut stream = ClientStream::connect(tcp, &target.host, tls)?;
        write_request(
            &mut stream,
            &format!("{}:{}", target.host, target.port),
            EXECUTE_PATH,
            &[(AUTH_HEADER, token.as_str())],
            content_type,
            body,
        )
        .map_err(|e| timed_out(e, timeout))?;
        // A read timeout surfaces as an early end of stream.
        let response = read_response(&mut stream).map_err(|e| {
            if started.elapsed() >= timeout {
                InvokeError::Timeout(timeout)
            } else {
                timed_out(e, timeout)
            }
        })?;

        match serde_json::from_slice::<ExecuteResponse>(&response.body) {
            Ok(decoded) => Ok(decoded),
            Err(_) if response.status != 200 => Err(InvokeError::Http {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }),
            Err(err) => Err(InvokeError::Decode(err)),
        }
    }
}

fn timed_out(err: std::io::Error, timeout: Duration) -> InvokeError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            InvokeError::Timeout(timeout)
        }
        _ => InvokeError::Io(err),
    }
}
