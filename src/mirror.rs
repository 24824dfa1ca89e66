//! One backend replica inside a segment (spec.md §3, §4.4).

use crate::error::TransportError;
use crate::lwps::{Connection, RetrievalChunk, RetrievalRequest, SearchRequest, SearchResponse, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Disconnected,
    Connected,
    TemporaryError,
    PermanentError,
}

/// Canonical identity of a mirror: `protocol://host:port/index` (spec.md
/// GLOSSARY "Canonical index name"), used both as the cache key component
/// and as the prefix for document-key rewriting (spec.md §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorLocation {
    pub host: String,
    pub port: u16,
    pub remote_index_name: String,
}

impl MirrorLocation {
    pub fn canonical_url(&self) -> String {
        format!("lwps://{}:{}/{}", self.host, self.port, self.remote_index_name)
    }
}

/// A single backend connection plus its mutable connection-state (spec.md
/// §3 "Mirror"). Only the owning [`crate::segment::Segment`] mutates this.
pub struct Mirror {
    pub location: MirrorLocation,
    pub priority: u32,
    pub state: MirrorState,
    connection: Option<Box<dyn Connection>>,
}

impl Mirror {
    pub fn new(location: MirrorLocation, priority: u32) -> Self {
        Mirror {
            location,
            priority,
            state: MirrorState::Disconnected,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == MirrorState::Connected
    }

    pub fn is_in_error(&self) -> bool {
        matches!(self.state, MirrorState::TemporaryError | MirrorState::PermanentError)
    }

    /// spec.md §4.4 `open(mirror, index)`.
    pub fn open(
        &mut self,
        transport: &dyn Transport,
        connection_timeout_ms: u64,
        send_init: bool,
    ) -> Result<(), TransportError> {
        if self.state == MirrorState::Connected {
            return Ok(());
        }
        if self.is_in_error() {
            return Err(TransportError::ConnectionFailed(
                "mirror already in error state".into(),
            ));
        }

        match transport.connect(
            &self.location.host,
            self.location.port,
            &self.location.remote_index_name,
            connection_timeout_ms,
        ) {
            Ok(mut conn) => {
                if send_init {
                    if let Err(err) = conn.init(connection_timeout_ms) {
                        self.state = MirrorState::TemporaryError;
                        return Err(err);
                    }
                }
                self.connection = Some(conn);
                self.state = MirrorState::Connected;
                Ok(())
            }
            Err(err) => {
                self.state = MirrorState::PermanentError;
                Err(err)
            }
        }
    }

    /// spec.md §4.4 `close(mirror)`.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        if self.state != MirrorState::PermanentError {
            self.state = MirrorState::Disconnected;
        }
    }

    /// Transition out of a transport/protocol failure mid-search, so the
    /// segment can retry a different mirror (spec.md §4.5 `search`).
    pub fn mark_temporary_error(&mut self) {
        self.close();
        self.state = MirrorState::TemporaryError;
    }

    pub fn reset_temporary_error(&mut self) {
        if self.state == MirrorState::TemporaryError {
            self.state = MirrorState::Disconnected;
        }
    }

    pub fn search(
        &mut self,
        request: &SearchRequest,
        search_timeout_ms: u64,
    ) -> Result<SearchResponse, TransportError> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionFailed("mirror not connected".into()))?;
        conn.search(request, search_timeout_ms)
    }

    pub fn retrieve(
        &mut self,
        request: &RetrievalRequest,
        retrieval_timeout_ms: u64,
    ) -> Result<RetrievalChunk, TransportError> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionFailed("mirror not connected".into()))?;
        conn.retrieve(request, retrieval_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwps::line_protocol::mock::{MockTransport, Scripted};
    use crate::lwps::{SortType, SortKeyValue};

    fn loc(host: &str, port: u16) -> MirrorLocation {
        MirrorLocation {
            host: host.to_string(),
            port,
            remote_index_name: "foo".to_string(),
        }
    }

    #[test]
    fn open_success_transitions_to_connected() {
        let transport = MockTransport::new();
        transport.script(
            "h1",
            1970,
            Scripted::Search(crate::lwps::SearchResponse {
                rows: vec![],
                total_results: 0,
                max_sort_key: None,
                sort_type: SortType::None,
                document_count: 0,
            }),
        );
        let mut mirror = Mirror::new(loc("h1", 1970), 1);
        mirror.open(transport.as_ref(), 100, false).unwrap();
        assert!(mirror.is_connected());
    }

    #[test]
    fn open_failure_is_permanent() {
        let transport = MockTransport::new();
        transport.script("h2", 1970, Scripted::ConnectFails);
        let mut mirror = Mirror::new(loc("h2", 1970), 1);
        let err = mirror.open(transport.as_ref(), 100, false);
        assert!(err.is_err());
        assert_eq!(mirror.state, MirrorState::PermanentError);
    }

    #[test]
    fn init_failure_is_temporary() {
        let transport = MockTransport::new();
        transport.script("h3", 1970, Scripted::InitFails);
        let mut mirror = Mirror::new(loc("h3", 1970), 1);
        let err = mirror.open(transport.as_ref(), 100, true);
        assert!(err.is_err());
        assert_eq!(mirror.state, MirrorState::TemporaryError);
    }

    #[test]
    fn already_connected_open_is_noop_success() {
        let transport = MockTransport::new();
        transport.script(
            "h4",
            1970,
            Scripted::Search(crate::lwps::SearchResponse {
                rows: vec![],
                total_results: 0,
                max_sort_key: None,
                sort_type: SortType::None,
                document_count: 0,
            }),
        );
        let mut mirror = Mirror::new(loc("h4", 1970), 1);
        mirror.open(transport.as_ref(), 100, false).unwrap();
        mirror.open(transport.as_ref(), 100, false).unwrap();
        assert_eq!(transport.connect_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn permanent_error_mirror_never_reopens() {
        let transport = MockTransport::new();
        transport.script("h5", 1970, Scripted::ConnectFails);
        let mut mirror = Mirror::new(loc("h5", 1970), 1);
        let _ = mirror.open(transport.as_ref(), 100, false);
        let err = mirror.open(transport.as_ref(), 100, false);
        assert!(err.is_err());
        assert_eq!(transport.connect_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn result_row_carries_sort_key_value() {
        let row = crate::lwps::ResultRow {
            document_key: "doc1".into(),
            sort_key: SortKeyValue::Uint(10),
            served_by_mirror: None,
            index_name: "foo".into(),
        };
        assert_eq!(row.sort_key, SortKeyValue::Uint(10));
    }
}
