#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("config: {0}")]
    Config(String),
}
