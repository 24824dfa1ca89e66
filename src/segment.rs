//! An ordered set of equivalent mirrors (spec.md §3, §4.5).

use rand::Rng;

use crate::error::TransportError;
use crate::lwps::{RetrievalChunk, RetrievalRequest, SearchRequest, SearchResponse, Transport};
use crate::mirror::{Mirror, MirrorState};

pub struct Segment {
    pub mirrors: Vec<Mirror>,
}

impl Segment {
    pub fn new(mirrors: Vec<Mirror>) -> Self {
        Segment { mirrors }
    }

    pub fn is_alive(&self) -> bool {
        self.mirrors.iter().any(|m| m.is_connected())
    }

    fn connected_index(&self) -> Option<usize> {
        self.mirrors.iter().position(|m| m.is_connected())
    }

    /// Build the weighted availability list (spec.md §4.5 step 1): each
    /// non-error mirror's offset appears `priority` times.
    fn availability_list(&self, excluded: &[usize]) -> Vec<usize> {
        let mut list = Vec::new();
        for (idx, mirror) in self.mirrors.iter().enumerate() {
            if mirror.is_in_error() || excluded.contains(&idx) {
                continue;
            }
            for _ in 0..mirror.priority.max(1) {
                list.push(idx);
            }
        }
        list
    }

    /// spec.md §4.5 `open(segment, index)`. Always attempts to connect a
    /// mirror — the lazy-vs-strict distinction is the *caller's* to make
    /// (spec.md §4.6: a lazy index simply never calls this proactively at
    /// index-open time, relying on `search`/`retrieve` to call it on
    /// first use instead).
    pub fn open(
        &mut self,
        transport: &dyn Transport,
        connection_timeout_ms: u64,
        send_init: bool,
        mirror_affinity: i32,
    ) -> Result<(), TransportError> {
        if self.connected_index().is_some() {
            return Ok(());
        }

        let mut excluded = Vec::new();
        let mut tried_affinity = false;

        loop {
            let candidate = if !tried_affinity
                && mirror_affinity >= 0
                && (mirror_affinity as usize) < self.mirrors.len()
                && !self.mirrors[mirror_affinity as usize].is_in_error()
                && !excluded.contains(&(mirror_affinity as usize))
            {
                tried_affinity = true;
                Some(mirror_affinity as usize)
            } else {
                let list = self.availability_list(&excluded);
                if list.is_empty() {
                    None
                } else {
                    let pick = rand::thread_rng().gen_range(0..list.len());
                    Some(list[pick])
                }
            };

            let idx = match candidate {
                Some(idx) => idx,
                None => return Err(TransportError::ConnectionFailed("no mirror available".into())),
            };

            match self.mirrors[idx].open(transport, connection_timeout_ms, send_init) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    excluded.push(idx);
                    if excluded.len() >= self.mirrors.len() {
                        return Err(err);
                    }
                }
            }
        }
    }

    pub fn close(&mut self) {
        for mirror in &mut self.mirrors {
            mirror.close();
        }
    }

    pub fn reset_temporary_errors(&mut self) {
        for mirror in &mut self.mirrors {
            mirror.reset_temporary_error();
        }
    }

    /// spec.md §4.5 `search`: loop until success, timeout, or mirrors
    /// exhausted. A transport **timeout** is surfaced immediately rather
    /// than retried, because the wall-clock search budget is spent.
    pub fn search(
        &mut self,
        request: &SearchRequest,
        transport: &dyn Transport,
        connection_timeout_ms: u64,
        send_init: bool,
        mirror_affinity: i32,
        search_timeout_ms: u64,
    ) -> Result<SearchResponse, TransportError> {
        loop {
            self.open(transport, connection_timeout_ms, send_init, mirror_affinity)?;

            let idx = match self.connected_index() {
                Some(idx) => idx,
                None => return Err(TransportError::ConnectionFailed("segment not open".into())),
            };

            match self.mirrors[idx].search(request, search_timeout_ms) {
                Ok(resp) => return Ok(resp),
                Err(TransportError::Timeout(ms)) => return Err(TransportError::Timeout(ms)),
                Err(err) => {
                    self.mirrors[idx].mark_temporary_error();
                    if self.mirrors.iter().all(|m| m.is_in_error()) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// spec.md §4.5 `retrieve`. When `target_mirror` names a specific
    /// mirror (the caller already knows which one served the original
    /// search result) that mirror is used directly; otherwise the
    /// currently-connected mirror is discovered exactly as in `search`.
    pub fn retrieve(
        &mut self,
        request: &RetrievalRequest,
        transport: &dyn Transport,
        connection_timeout_ms: u64,
        send_init: bool,
        mirror_affinity: i32,
        retrieval_timeout_ms: u64,
        target_mirror: Option<&str>,
    ) -> Result<RetrievalChunk, TransportError> {
        loop {
            self.open(transport, connection_timeout_ms, send_init, mirror_affinity)?;

            let idx = if let Some(target) = target_mirror {
                match self
                    .mirrors
                    .iter()
                    .position(|m| m.location.canonical_url() == target && m.is_connected())
                {
                    Some(idx) => idx,
                    None => match self.connected_index() {
                        Some(idx) => idx,
                        None => {
                            return Err(TransportError::ConnectionFailed("segment not open".into()))
                        }
                    },
                }
            } else {
                match self.connected_index() {
                    Some(idx) => idx,
                    None => return Err(TransportError::ConnectionFailed("segment not open".into())),
                }
            };

            match self.mirrors[idx].retrieve(request, retrieval_timeout_ms) {
                Ok(chunk) => return Ok(chunk),
                Err(TransportError::Timeout(ms)) => return Err(TransportError::Timeout(ms)),
                Err(err) => {
                    self.mirrors[idx].mark_temporary_error();
                    if self.mirrors.iter().all(|m| m.is_in_error()) {
                        return Err(err);
                    }
                }
            }
        }
    }

    pub fn connected_mirror_url(&self) -> Option<String> {
        self.connected_index()
            .map(|idx| self.mirrors[idx].location.canonical_url())
    }

    #[cfg(test)]
    pub fn mirror_state(&self, idx: usize) -> MirrorState {
        self.mirrors[idx].state
    }
}
