#![forbid(unsafe_code)]

//! Requests are executed on the peer's main context: the one thread that owns live document
//! state. Connection threads post a [`Job`] through a [`Dispatcher`] and block on the reply;
//! the owning thread drains jobs with [`MainContext::run_pending`] or
//! [`MainContext::run_until`].

use crate::protocol::{ExecuteResponse, RemoteCommand, Request};
use peerlink_core::PeerIdentity;
use peerlink_core::wire::{RemoteRecord, error_line};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::time::Duration;

/// Captured output of one request. Survives a failing or panicking handler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    buf: String,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: &str) {
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    pub fn record(&mut self, record: &RemoteRecord) {
        self.line(&record.to_line());
    }

    /// Reports a per-item failure without failing the whole request.
    pub fn error(&mut self, message: &str) {
        self.line(&error_line(message));
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl std::fmt::Write for Output {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}

/// The peer-specific side of remote execution.
pub trait CommandHost {
    fn execute(&mut self, command: &RemoteCommand, out: &mut Output) -> Result<(), ExecError>;

    #[cfg(feature = "fragments")]
    fn execute_fragment(&mut self, source: &str, out: &mut Output) -> Result<(), ExecError> {
        let _ = (source, out);
        Err(ExecError::Unsupported(
            "this peer does not evaluate source fragments".to_string(),
        ))
    }
}

struct Job {
    request: Request,
    reply: SyncSender<ExecuteResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("main context is not running")]
    Unavailable,
    #[error("main context did not answer within {0:?}")]
    TimedOut(Duration),
}

/// Cloneable handle used by connection threads.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: Sender<Job>,
}

impl Dispatcher {
    /// Blocks until the main context has run `request` or `timeout` elapses. A request that
    /// times out may still run later; its result is discarded.
    pub fn execute(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<ExecuteResponse, DispatchError> {
        let (reply, wait) = mpsc::sync_channel(1);
        self.tx
            .send(Job { request, reply })
            .map_err(|_| DispatchError::Unavailable)?;
        match wait.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::TimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Unavailable),
        }
    }
}

pub struct MainContext {
    rx: Receiver<Job>,
    identity: PeerIdentity,
}

impl MainContext {
    pub fn channel(identity: PeerIdentity) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::channel();
        (Self { rx, identity }, Dispatcher { tx })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Runs every queued job without blocking. Returns how many ran.
    pub fn run_pending(&self, host: &mut dyn CommandHost) -> usize {
        let mut ran = 0usize;
        loop {
            match self.rx.try_recv() {
                Ok(job) => {
                    self.run_job(host, job);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Serves jobs until `stop` is set, waking at least every `poll`.
    pub fn run_until(&self, host: &mut dyn CommandHost, stop: &AtomicBool, poll: Duration) {
        while !stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(poll) {
                Ok(job) => self.run_job(host, job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run_job(&self, host: &mut dyn CommandHost, job: Job) {
        let label = job.request.label().to_string();
        let mut out = Output::new();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(host, &job.request, &mut out)
        }));
        let response = match outcome {
            Ok(Ok(())) => {
                tracing::debug!(command = %label, "remote command completed");
                ExecuteResponse::ok(out.into_string())
            }
            Ok(Err(err)) => {
                tracing::warn!(command = %label, error = %err, "remote command failed");
                ExecuteResponse::failed(out.into_string(), format!("runtime: {err}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(command = %label, panic = %message, "remote command panicked");
                ExecuteResponse::failed(out.into_string(), format!("runtime: panic: {message}"))
            }
        };
        if job.reply.send(response).is_err() {
            tracing::debug!(command = %label, "caller stopped waiting for the result");
        }
    }

    fn dispatch(
        &self,
        host: &mut dyn CommandHost,
        request: &Request,
        out: &mut Output,
    ) -> Result<(), ExecError> {
        match request {
            Request::Command(RemoteCommand::Ping) => {
                out.record(
                    &RemoteRecord::new("PEER", self.identity.session_id.as_str())
                        .with_field("Pid", self.identity.pid.to_string())
                        .with_field("Host", self.identity.hostname.as_str()),
                );
                Ok(())
            }
            Request::Command(command) => host.execute(command, out),
            #[cfg(feature = "fragments")]
            Request::Fragment(source) => host.execute_fragment(source, out),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::wire::parse_output;

    struct Scripted {
        calls: usize,
    }

    impl CommandHost for Scripted {
        fn execute(&mut self, command: &RemoteCommand, out: &mut Output) -> Result<(), ExecError> {
            self.calls += 1;
            match command {
                RemoteCommand::ListDocuments => {
                    out.record(&RemoteRecord::new("DOCUMENT", "d1").with_field("Title", "Proj"));
                    Ok(())
                }
                RemoteCommand::Synchronize => {
                    out.line("started");
                    Err(ExecError::Failed("central model locked".to_string()))
                }
                RemoteCommand::Custom { name, .. } if name == "boom" => {
                    out.line("before panic");
                    panic!("host exploded");
                }
                other => Err(ExecError::Unsupported(other.name().to_string())),
            }
        }
    }

    fn identity() -> PeerIdentity {
        PeerIdentity::new("ws01", 4120)
    }

    fn run(request: Request) -> ExecuteResponse {
        let (ctx, dispatcher) = MainContext::channel(identity());
        let mut host = Scripted { calls: 0 };
        let waiter = std::thread::spawn(move || {
            dispatcher
                .execute(request, Duration::from_secs(5))
                .expect("dispatch")
        });
        while !waiter.is_finished() {
            ctx.run_pending(&mut host);
            std::thread::sleep(Duration::from_millis(2));
        }
        waiter.join().expect("waiter thread")
    }

    #[test]
    fn ping_is_answered_without_the_host() {
        let response = run(Request::Command(RemoteCommand::Ping));
        assert!(response.success);
        let parsed = parse_output(&response.output);
        let peer = parsed.records_of("PEER").next().expect("peer record");
        assert_eq!(peer.id, "ws01-4120");
        assert_eq!(peer.field("Pid"), Some("4120"));
        assert_eq!(peer.field("Host"), Some("ws01"));
    }

    #[test]
    fn handler_error_keeps_partial_output() {
        let response = run(Request::Command(RemoteCommand::Synchronize));
        assert!(!response.success);
        assert_eq!(response.output, "started\n");
        assert_eq!(
            response.error.as_deref(),
            Some("runtime: central model locked")
        );
    }

    #[test]
    fn panic_is_contained() {
        let response = run(Request::Command(RemoteCommand::Custom {
            name: "boom".to_string(),
            args: serde_json::Value::Null,
        }));
        assert!(!response.success);
        assert_eq!(response.output, "before panic\n");
        let error = response.error.expect("error");
        assert!(error.contains("host exploded"), "error was {error}");
    }

    #[test]
    fn dropped_main_context_reads_as_unavailable() {
        let (ctx, dispatcher) = MainContext::channel(identity());
        drop(ctx);
        let err = dispatcher
            .execute(Request::Command(RemoteCommand::Ping), Duration::from_millis(50))
            .expect_err("no main context");
        assert_eq!(err, DispatchError::Unavailable);
    }

    #[test]
    fn idle_main_context_times_out() {
        let (_ctx, dispatcher) = MainContext::channel(identity());
        let err = dispatcher
            .execute(
                Request::Command(RemoteCommand::ListDocuments),
                Duration::from_millis(20),
            )
            .expect_err("nobody pumps the queue");
        assert_eq!(err, DispatchError::TimedOut(Duration::from_millis(20)));
    }

    #[test]
    fn output_collects_records_and_errors() {
        let mut out = Output::new();
        out.record(&RemoteRecord::new("ELEMENT", "e|1").with_field("Name", "Wall"));
        out.error("view not printable");
        let parsed = parse_output(out.as_str());
        assert_eq!(parsed.records[0].id, "e|1");
        assert_eq!(parsed.errors, vec!["view not printable".to_string()]);
    }
}
