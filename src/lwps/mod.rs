//! LWPS client interface (spec.md §1, §9).
//!
//! The wire codec and sockets layer are explicitly out of scope for this
//! crate — they are external collaborators. What the gateway core actually
//! needs from them is narrow: open a connection, optionally perform an init
//! handshake, issue a search/retrieval/index-info request and get back an
//! opaque, typed result. That narrow surface is the [`Connection`] trait
//! below. [`line_protocol`] supplies one concrete implementation so the rest
//! of the crate can be exercised against a real socket; it does not attempt
//! to reproduce the original LWPS wire format.

pub mod line_protocol;

use crate::error::TransportError;

/// Default LWPS port used when a mirror URL omits one (spec.md §6
/// "Location string grammar": "default port = LWPS default").
pub const DEFAULT_LWPS_PORT: u16 = 1970;

/// The kind of ordering a response's sort keys carry (spec.md's SPI "named
/// sort-key variants"). `Unknown` only ever appears after a heterogeneous
/// multi-index merge (spec.md §4.7 "Merge").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortType {
    None,
    UintAsc,
    UintDesc,
    DoubleAsc,
    DoubleDesc,
    UCharAsc,
    UCharDesc,
    Unknown,
}

impl SortType {
    pub fn is_uchar(self) -> bool {
        matches!(self, SortType::UCharAsc | SortType::UCharDesc)
    }

    /// The bare field order implied by this sort type, if any.
    pub fn order(self) -> Option<SortOrder> {
        match self {
            SortType::UintAsc | SortType::DoubleAsc | SortType::UCharAsc => Some(SortOrder::Asc),
            SortType::UintDesc | SortType::DoubleDesc | SortType::UCharDesc => {
                Some(SortOrder::Desc)
            }
            SortType::None | SortType::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// The value of one row's sort key — opaque beyond its named variant, per
/// spec.md §9 "the SPI result shape is treated as an opaque record with
/// named sort-key variants".
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SortKeyValue {
    None,
    Uint(u64),
    Double(f64),
    UChar(String),
}

/// One row of a search response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResultRow {
    pub document_key: String,
    pub sort_key: SortKeyValue,
    /// Set by the segment/mirror that actually served this row, so a later
    /// retrieval can target the same mirror for search-report items
    /// (spec.md §4.7 "Retrieval dispatch").
    pub served_by_mirror: Option<String>,
    /// Index name this row belongs to; overwritten by dispatch with the
    /// logical index name on join (spec.md §4.7 step 2).
    pub index_name: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SearchRequest {
    pub search_text: String,
    pub positive_feedback: Option<String>,
    pub negative_feedback: Option<String>,
    pub language: Option<String>,
    pub start_index: u32,
    pub end_index: u32,
    pub sort_field: Option<String>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SearchResponse {
    pub rows: Vec<ResultRow>,
    pub total_results: u64,
    pub max_sort_key: Option<f64>,
    pub sort_type: SortType,
    pub document_count: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrievalRequest {
    pub document_key: String,
    pub item: String,
    pub mime_type: Option<String>,
    pub chunk_type: Option<String>,
    pub chunk_start: Option<u64>,
    pub chunk_end: Option<u64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrievalChunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerIndexInfo {
    pub index_names: Vec<String>,
}

/// One live connection to a single mirror. `Mirror` owns exactly one of
/// these while connected (spec.md §4.4).
pub trait Connection: Send {
    /// Optional LWPS init handshake; carries no credentials (spec.md §1
    /// Non-goals: authentication).
    fn init(&mut self, timeout_ms: u64) -> Result<(), TransportError>;

    fn search(
        &mut self,
        request: &SearchRequest,
        timeout_ms: u64,
    ) -> Result<SearchResponse, TransportError>;

    fn retrieve(
        &mut self,
        request: &RetrievalRequest,
        timeout_ms: u64,
    ) -> Result<RetrievalChunk, TransportError>;

    fn server_index_info(&mut self, timeout_ms: u64) -> Result<ServerIndexInfo, TransportError>;

    fn close(&mut self);
}

/// Opens connections of a given wire protocol to a given host/port/index.
/// Implemented once for real sockets ([`line_protocol::LineProtocolTransport`])
/// and once for tests ([`line_protocol::MockTransport`] in `#[cfg(test)]`).
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        remote_index_name: &str,
        timeout_ms: u64,
    ) -> Result<Box<dyn Connection>, TransportError>;
}
