#![forbid(unsafe_code)]

//! Remote execution between peers: a token-guarded HTTPS endpoint per peer that runs typed
//! commands on the peer's main context, and the client used to call it.

pub mod client;
pub mod config;
mod error;
mod http;
pub mod main_context;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod tls;

pub use client::{DEFAULT_INVOKE_TIMEOUT, InvokeError, RemoteClient, Target};
pub use config::PeerConfig;
pub use error::GatewayError;
pub use main_context::{CommandHost, DispatchError, Dispatcher, ExecError, MainContext, Output};
pub use protocol::{ExecuteResponse, RemoteCommand, Request};
pub use runtime::{EndpointInfo, RuntimeDir};
pub use server::{Gateway, GatewayOptions, GatewayState};
