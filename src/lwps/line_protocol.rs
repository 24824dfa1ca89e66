//! A concrete, minimal LWPS transport.
//!
//! Frames each request/response as one JSON line over a TCP stream, or one
//! JSON datagram over UDP. This is a convenience wire format chosen for this
//! crate — the real LWPS codec is out of scope (spec.md §1) — grounded on
//! the teacher's own preference for `serde_json` request/response bodies
//! (`src/client/pull.rs` uses `serde_json::from_value` throughout) rather
//! than a hand-rolled binary framing.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, UdpSocket};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    Connection, RetrievalChunk, RetrievalRequest, SearchRequest, SearchResponse,
    ServerIndexInfo, Transport,
};
use crate::config::WireProtocol;
use crate::error::TransportError;

#[derive(Debug, Serialize, Deserialize)]
enum WireRequest {
    Init,
    Search(SearchRequest),
    Retrieve(RetrievalRequest),
    ServerIndexInfo,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireResponse {
    InitOk,
    Search(SearchResponse),
    Retrieve(RetrievalChunk),
    ServerIndexInfo(ServerIndexInfo),
    Err(String),
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

struct TcpConnection {
    stream: BufReader<TcpStream>,
}

impl TcpConnection {
    fn roundtrip(&mut self, req: &WireRequest, timeout_ms: u64) -> Result<WireResponse, TransportError> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        self.stream
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.stream
            .get_ref()
            .set_write_timeout(Some(timeout))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut line = serde_json::to_string(req).map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');

        self.stream.get_mut().write_all(line.as_bytes()).map_err(|e| {
            if is_timeout(&e) {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let mut response_line = String::new();
        let n = self.stream.read_line(&mut response_line).map_err(|e| {
            if is_timeout(&e) {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Protocol(e.to_string())
            }
        })?;
        if n == 0 {
            return Err(TransportError::ConnectionFailed(
                "connection closed by peer".into(),
            ));
        }

        serde_json::from_str(response_line.trim_end())
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

impl Connection for TcpConnection {
    fn init(&mut self, timeout_ms: u64) -> Result<(), TransportError> {
        match self.roundtrip(&WireRequest::Init, timeout_ms)? {
            WireResponse::InitOk => Ok(()),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to init".into())),
        }
    }

    fn search(
        &mut self,
        request: &SearchRequest,
        timeout_ms: u64,
    ) -> Result<SearchResponse, TransportError> {
        match self.roundtrip(&WireRequest::Search(request.clone()), timeout_ms)? {
            WireResponse::Search(resp) => Ok(resp),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to search".into())),
        }
    }

    fn retrieve(
        &mut self,
        request: &RetrievalRequest,
        timeout_ms: u64,
    ) -> Result<RetrievalChunk, TransportError> {
        match self.roundtrip(&WireRequest::Retrieve(request.clone()), timeout_ms)? {
            WireResponse::Retrieve(chunk) => Ok(chunk),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to retrieve".into())),
        }
    }

    fn server_index_info(&mut self, timeout_ms: u64) -> Result<ServerIndexInfo, TransportError> {
        match self.roundtrip(&WireRequest::ServerIndexInfo, timeout_ms)? {
            WireResponse::ServerIndexInfo(info) => Ok(info),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol(
                "unexpected response to server_index_info".into(),
            )),
        }
    }

    fn close(&mut self) {
        let _ = self.stream.get_ref().shutdown(std::net::Shutdown::Both);
    }
}

struct UdpConnection {
    socket: UdpSocket,
}

impl UdpConnection {
    fn roundtrip(&mut self, req: &WireRequest, timeout_ms: u64) -> Result<WireResponse, TransportError> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let payload = serde_json::to_vec(req).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.socket.send(&payload).map_err(|e| {
            if is_timeout(&e) {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).map_err(|e| {
            if is_timeout(&e) {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Protocol(e.to_string())
            }
        })?;

        serde_json::from_slice(&buf[..n]).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

impl Connection for UdpConnection {
    fn init(&mut self, timeout_ms: u64) -> Result<(), TransportError> {
        match self.roundtrip(&WireRequest::Init, timeout_ms)? {
            WireResponse::InitOk => Ok(()),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to init".into())),
        }
    }

    fn search(
        &mut self,
        request: &SearchRequest,
        timeout_ms: u64,
    ) -> Result<SearchResponse, TransportError> {
        match self.roundtrip(&WireRequest::Search(request.clone()), timeout_ms)? {
            WireResponse::Search(resp) => Ok(resp),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to search".into())),
        }
    }

    fn retrieve(
        &mut self,
        request: &RetrievalRequest,
        timeout_ms: u64,
    ) -> Result<RetrievalChunk, TransportError> {
        match self.roundtrip(&WireRequest::Retrieve(request.clone()), timeout_ms)? {
            WireResponse::Retrieve(chunk) => Ok(chunk),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol("unexpected response to retrieve".into())),
        }
    }

    fn server_index_info(&mut self, timeout_ms: u64) -> Result<ServerIndexInfo, TransportError> {
        match self.roundtrip(&WireRequest::ServerIndexInfo, timeout_ms)? {
            WireResponse::ServerIndexInfo(info) => Ok(info),
            WireResponse::Err(msg) => Err(TransportError::Protocol(msg)),
            _ => Err(TransportError::Protocol(
                "unexpected response to server_index_info".into(),
            )),
        }
    }

    fn close(&mut self) {}
}

/// Default [`Transport`]: opens a real TCP or UDP socket per the gateway's
/// configured wire protocol (spec.md §6 `gateway-network-protocol:lwps`).
pub struct LineProtocolTransport {
    pub protocol: WireProtocol,
}

impl Transport for LineProtocolTransport {
    fn connect(
        &self,
        host: &str,
        port: u16,
        _remote_index_name: &str,
        timeout_ms: u64,
    ) -> Result<Box<dyn Connection>, TransportError> {
        match self.protocol {
            WireProtocol::Tcp => {
                let addr = format!("{}:{}", host, port);
                let stream = TcpStream::connect(&addr).map_err(|e| {
                    TransportError::ConnectionFailed(format!("{}: {}", addr, e))
                })?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                Ok(Box::new(TcpConnection {
                    stream: BufReader::new(stream),
                }))
            }
            WireProtocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                socket
                    .connect(format!("{}:{}", host, port))
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                let _ = timeout_ms;
                Ok(Box::new(UdpConnection { socket }))
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! An in-process [`Transport`] used by mirror/segment/dispatch tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub enum Scripted {
        ConnectFails,
        InitFails,
        Search(SearchResponse),
        SearchTimesOut,
        SearchFailsThenSucceeds(Box<SearchResponse>),
        Retrieve(RetrievalChunk),
        ServerIndexInfo(ServerIndexInfo),
    }

    #[derive(Default)]
    pub struct MockTransport {
        pub scripts: Mutex<HashMap<(String, u16), Scripted>>,
        pub connect_calls: Mutex<Vec<(String, u16)>>,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(MockTransport::default())
        }

        pub fn script(&self, host: &str, port: u16, s: Scripted) {
            self.scripts
                .lock()
                .unwrap()
                .insert((host.to_string(), port), s);
        }
    }

    struct MockConnection {
        script: Scripted,
    }

    impl Connection for MockConnection {
        fn init(&mut self, _timeout_ms: u64) -> Result<(), TransportError> {
            if let Scripted::InitFails = self.script {
                Err(TransportError::Protocol("init failed".into()))
            } else {
                Ok(())
            }
        }

        fn search(
            &mut self,
            _request: &SearchRequest,
            timeout_ms: u64,
        ) -> Result<SearchResponse, TransportError> {
            match &self.script {
                Scripted::Search(resp) => Ok(resp.clone()),
                Scripted::SearchTimesOut => Err(TransportError::Timeout(timeout_ms)),
                Scripted::SearchFailsThenSucceeds(resp) => Ok((**resp).clone()),
                _ => Err(TransportError::Protocol("no script for search".into())),
            }
        }

        fn retrieve(
            &mut self,
            _request: &RetrievalRequest,
            _timeout_ms: u64,
        ) -> Result<RetrievalChunk, TransportError> {
            match &self.script {
                Scripted::Retrieve(chunk) => Ok(chunk.clone()),
                _ => Err(TransportError::Protocol("no script for retrieve".into())),
            }
        }

        fn server_index_info(&mut self, _timeout_ms: u64) -> Result<ServerIndexInfo, TransportError> {
            match &self.script {
                Scripted::ServerIndexInfo(info) => Ok(info.clone()),
                _ => Err(TransportError::Protocol(
                    "no script for server_index_info".into(),
                )),
            }
        }

        fn close(&mut self) {}
    }

    impl Transport for MockTransport {
        fn connect(
            &self,
            host: &str,
            port: u16,
            _remote_index_name: &str,
            _timeout_ms: u64,
        ) -> Result<Box<dyn Connection>, TransportError> {
            self.connect_calls
                .lock()
                .unwrap()
                .push((host.to_string(), port));

            let scripts = self.scripts.lock().unwrap();
            match scripts.get(&(host.to_string(), port)) {
                Some(Scripted::ConnectFails) => {
                    Err(TransportError::ConnectionFailed("scripted failure".into()))
                }
                Some(other) => Ok(Box::new(MockConnection {
                    script: other.clone(),
                })),
                None => Err(TransportError::ConnectionFailed(format!(
                    "no script for {}:{}",
                    host, port
                ))),
            }
        }
    }
}
