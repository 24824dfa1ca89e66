//! Error taxonomy for the gateway (spec.md §7).
//!
//! Individual subsystems return one of these typed errors; the SPI boundary
//! (`gateway::Gateway` public methods) converts them to `anyhow::Error` the
//! way the teacher's `src/tools.rs` and `src/client/pull.rs` do at their own
//! call boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or invalid configuration directory: {0}")]
    InvalidDirectory(String),
    #[error("malformed index location '{0}'")]
    MalformedLocation(String),
    #[error("bad version string '{0}'")]
    BadVersion(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("index '{0}' has no configured or discoverable location")]
    IndexNotFound(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache")]
    InvalidCache,
    #[error("invalid cache mode")]
    InvalidMode,
    #[error("invalid artifact type")]
    InvalidType,
    #[error("cache save failed: {0}")]
    SaveFailed(String),
    #[error("cache get failed: {0}")]
    GetFailed(String),
    #[error("cache lock failed")]
    LockFailed,
    #[error("cache unlock failed")]
    UnlockFailed,
    #[error("failed to create cache directory: {0}")]
    CreateDirFailed(String),
    #[error("sha1 digest failed")]
    Sha1Failed,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid index '{0}'")]
    InvalidIndex(String),
    #[error("invalid session")]
    InvalidSession,
    #[error("invalid search results range ({0}, {1})")]
    InvalidRange(u32, u32),
    #[error("invalid document key '{0}'")]
    InvalidDocumentKey(String),
    #[error("invalid chunk type or range")]
    InvalidChunk,
    #[error("return parameter error: {0}")]
    ReturnParameter(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("request error: {0}")]
    Request(#[from] RequestError),
}
