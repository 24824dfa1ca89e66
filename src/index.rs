//! Logical index: an ordered list of segments plus sort metadata and policy
//! flags (spec.md §3 "Logical index", §4.6).

use crate::config::{ConnectionPolicy, ErrorPolicy, GatewayDefaults, IndexConfigEntry};
use crate::error::{ConfigError, TransportError};
use crate::lwps::{SortOrder, Transport, DEFAULT_LWPS_PORT};
use crate::mirror::{Mirror, MirrorLocation};
use crate::modifiers::{parse_sort_clause, SortClause};
use crate::segment::Segment;

/// Where a logical index's location came from (spec.md §3 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The name itself was an `lwps://` URL: a single segment, single mirror.
    FromUrl,
    /// Resolved from `index-location:NAME` or autodiscovery.
    FromConfig,
}

#[derive(Debug, Clone)]
pub struct SortOrderEntry {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone)]
pub struct IndexTimeouts {
    pub connection_ms: u64,
    pub search_ms: u64,
    pub retrieval_ms: u64,
    pub information_ms: u64,
}

impl IndexTimeouts {
    fn from_defaults(defaults: &GatewayDefaults) -> Self {
        IndexTimeouts {
            connection_ms: defaults.connection_timeout_ms,
            search_ms: defaults.search_timeout_ms,
            retrieval_ms: defaults.retrieval_timeout_ms,
            information_ms: defaults.information_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexFlags {
    pub ignore_connection_error: bool,
    pub ignore_search_error: bool,
    pub ignore_retrieval_error: bool,
}

impl IndexFlags {
    fn from_config_entry(entry: &IndexConfigEntry) -> Self {
        IndexFlags {
            ignore_connection_error: entry.connection_error == ErrorPolicy::Ignore,
            ignore_search_error: entry.search_error == ErrorPolicy::Ignore,
            ignore_retrieval_error: entry.retrieval_error == ErrorPolicy::Ignore,
        }
    }
}

/// An ordered list of segments plus the per-index policy knobs (spec.md §3).
pub struct LogicalIndex {
    pub name: String,
    pub origin: Origin,
    pub segments: Vec<Segment>,
    pub connection_policy: ConnectionPolicy,
    pub flags: IndexFlags,
    pub sort_orders: Vec<SortOrderEntry>,

    base_timeouts: IndexTimeouts,
    pub effective_timeouts: IndexTimeouts,
    base_mirror_affinity: i32,
    pub effective_mirror_affinity: i32,
    base_max_segments_searched: u32,
    base_min_segments_searched: u32,
    pub effective_max_segments_searched: u32,
    pub effective_min_segments_searched: u32,

    /// Template for [`duplicate`]: the parsed segment/mirror topology,
    /// independent of any live connection state.
    template: Vec<Vec<MirrorLocation>>,
}

/// Parse a location string into segments-of-mirrors: segments are
/// comma-separated, mirrors within a segment are `|`-separated, and each
/// mirror is `protocol://host[:port]/index_name` (spec.md §3 GLOSSARY
/// "Canonical index name").
pub fn parse_location(location: &str) -> Result<Vec<Vec<MirrorLocation>>, ConfigError> {
    let mut segments = Vec::new();
    for segment_spec in location.split(',') {
        let segment_spec = segment_spec.trim();
        if segment_spec.is_empty() {
            continue;
        }
        let mut mirrors = Vec::new();
        for mirror_spec in segment_spec.split('|') {
            mirrors.push(parse_mirror_url(mirror_spec.trim())?);
        }
        segments.push(mirrors);
    }
    if segments.is_empty() {
        return Err(ConfigError::Parse(format!(
            "empty index location '{}'",
            location
        )));
    }
    Ok(segments)
}

fn parse_mirror_url(spec: &str) -> Result<MirrorLocation, ConfigError> {
    let rest = spec.strip_prefix("lwps://").ok_or_else(|| {
        ConfigError::Parse(format!("mirror location '{}' is missing the lwps:// scheme", spec))
    })?;

    let (host_port, remote_index_name) = rest
        .split_once('/')
        .ok_or_else(|| ConfigError::Parse(format!("mirror location '{}' is missing /index_name", spec)))?;

    if remote_index_name.is_empty() {
        return Err(ConfigError::Parse(format!(
            "mirror location '{}' has an empty index name",
            spec
        )));
    }

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| ConfigError::Parse(format!("invalid port '{}' in '{}'", p, spec)))?;
            (h.to_string(), port)
        }
        None => (host_port.to_string(), DEFAULT_LWPS_PORT),
    };

    if host.is_empty() {
        return Err(ConfigError::Parse(format!("mirror location '{}' has an empty host", spec)));
    }

    Ok(MirrorLocation {
        host,
        port,
        remote_index_name: remote_index_name.to_string(),
    })
}

/// Parse `index-sort-orders:NAME`: a whitespace-separated list of
/// `{sort:field:order}` clauses declaring the index's natively supported
/// sort orders (spec.md §4.6).
fn parse_sort_orders(spec: &str) -> Vec<SortOrderEntry> {
    let mut orders = Vec::new();
    for token in spec.split_whitespace() {
        let body = token.trim_start_matches('{').trim_end_matches('}');
        match parse_sort_clause(body) {
            Some(SortClause::Field { field, order }) => orders.push(SortOrderEntry { field, order }),
            Some(SortClause::None) | None => {
                log::warn!("ignoring unrecognized sort-order clause '{}'", token);
            }
        }
    }
    orders
}

impl LogicalIndex {
    /// Build a working template from an explicit location string — either
    /// the index name itself (when it is an `lwps://` URL, [`Origin::FromUrl`])
    /// or a resolved `index-location`/autodiscovery string ([`Origin::FromConfig`]).
    pub fn from_location(
        name: &str,
        location: &str,
        origin: Origin,
        entry: Option<&IndexConfigEntry>,
        defaults: &GatewayDefaults,
    ) -> Result<Self, ConfigError> {
        let template = parse_location(location)?;
        let segments = build_segments(&template);

        let flags = entry
            .map(IndexFlags::from_config_entry)
            .unwrap_or(IndexFlags {
                ignore_connection_error: false,
                ignore_search_error: false,
                ignore_retrieval_error: false,
            });
        let connection_policy = entry.map(|e| e.connection_policy).unwrap_or(ConnectionPolicy::Strict);
        let sort_orders = entry
            .and_then(|e| e.sort_orders.as_deref())
            .map(parse_sort_orders)
            .unwrap_or_default();

        let base_timeouts = IndexTimeouts::from_defaults(defaults);
        let base_mirror_affinity = defaults.mirror_affinity;
        let base_max_segments_searched = entry.map(|e| e.max_segments_searched).unwrap_or(0);
        let base_min_segments_searched = entry.map(|e| e.min_segments_searched).unwrap_or(0);

        let mut index = LogicalIndex {
            name: name.to_string(),
            origin,
            segments,
            connection_policy,
            flags,
            sort_orders,
            effective_timeouts: base_timeouts.clone(),
            base_timeouts,
            effective_mirror_affinity: base_mirror_affinity,
            base_mirror_affinity,
            base_max_segments_searched,
            base_min_segments_searched,
            effective_max_segments_searched: base_max_segments_searched,
            effective_min_segments_searched: base_min_segments_searched,
            template,
        };
        index.reset_search_overrides();
        Ok(index)
    }

    /// Resolve a logical index entirely from gateway config (spec.md §3
    /// "created on first reference to its name"): tries the name itself as
    /// an LWPS URL first, then `index-location:NAME`. Autodiscovery-resolved
    /// locations are built by the caller and passed through
    /// [`LogicalIndex::from_location`] directly with `Origin::FromConfig`.
    pub fn initialize(
        name: &str,
        entry: Option<&IndexConfigEntry>,
        defaults: &GatewayDefaults,
    ) -> Result<Self, ConfigError> {
        if name.starts_with("lwps://") {
            return Self::from_location(name, name, Origin::FromUrl, entry, defaults);
        }

        let location = entry
            .and_then(|e| e.location.as_deref())
            .ok_or_else(|| ConfigError::IndexNotFound(name.to_string()))?;

        Self::from_location(name, location, Origin::FromConfig, entry, defaults)
    }

    /// Deep-copy the structural template into a fresh, unconnected working
    /// copy (spec.md §3 "duplicated into a per-call working copy"). Live
    /// connection state never survives a duplicate.
    pub fn duplicate(&self) -> LogicalIndex {
        LogicalIndex {
            name: self.name.clone(),
            origin: self.origin,
            segments: build_segments(&self.template),
            connection_policy: self.connection_policy,
            flags: self.flags,
            sort_orders: self.sort_orders.clone(),
            base_timeouts: self.base_timeouts.clone(),
            effective_timeouts: self.base_timeouts.clone(),
            base_mirror_affinity: self.base_mirror_affinity,
            effective_mirror_affinity: self.base_mirror_affinity,
            base_max_segments_searched: self.base_max_segments_searched,
            base_min_segments_searched: self.base_min_segments_searched,
            effective_max_segments_searched: self.base_max_segments_searched,
            effective_min_segments_searched: self.base_min_segments_searched,
            template: self.template.clone(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// spec.md §4.6 `open(index)`. Under [`ConnectionPolicy::Lazy`] the
    /// index is considered connected without touching a single segment;
    /// the first `search`/`retrieve` call opens segments on demand instead.
    /// Under [`ConnectionPolicy::Strict`] every segment is opened up front,
    /// in parallel when there is more than one, and the index only fails if
    /// every segment failed and `ignore_connection_error` is not set.
    pub fn open(
        &mut self,
        transport: &dyn Transport,
        connection_timeout_ms: u64,
        send_init: bool,
        mirror_affinity: i32,
    ) -> Result<(), TransportError> {
        if self.connection_policy == ConnectionPolicy::Lazy {
            return Ok(());
        }

        if self.segments.len() > 1 {
            let results: Vec<Result<(), TransportError>> = std::thread::scope(|scope| {
                let handles: Vec<_> = self
                    .segments
                    .iter_mut()
                    .map(|segment| {
                        scope.spawn(|| segment.open(transport, connection_timeout_ms, send_init, mirror_affinity))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("segment open thread panicked")).collect()
            });

            let any_ok = results.iter().any(|r| r.is_ok());
            if any_ok || self.flags.ignore_connection_error {
                return Ok(());
            }
            return Err(results.into_iter().find_map(Result::err).expect("at least one error present"));
        }

        match self.segments.first_mut() {
            Some(segment) => {
                match segment.open(transport, connection_timeout_ms, send_init, mirror_affinity) {
                    Ok(()) => Ok(()),
                    Err(err) if self.flags.ignore_connection_error => {
                        log::warn!("index '{}' failed to open its only segment: {}", self.name, err);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            None => Ok(()),
        }
    }

    /// Reset per-request overrides to the index's base settings, clamping
    /// segment-count bounds into range (spec.md §4.6, §4.7 "Prologue").
    pub fn reset_search_overrides(&mut self) {
        self.effective_timeouts = self.base_timeouts.clone();
        self.effective_mirror_affinity = self.base_mirror_affinity;

        let segment_count = self.segments.len() as u32;
        let mut max = self.base_max_segments_searched;
        let mut min = self.base_min_segments_searched;
        if max == 0 || max > segment_count {
            max = segment_count;
        }
        if min > segment_count {
            min = segment_count;
        }
        if min > max {
            min = max;
        }
        self.effective_max_segments_searched = max;
        self.effective_min_segments_searched = min;
    }

    pub fn reset_temporary_errors(&mut self) {
        for segment in &mut self.segments {
            segment.reset_temporary_errors();
        }
    }

    pub fn close(&mut self) {
        for segment in &mut self.segments {
            segment.close();
        }
    }
}

fn build_segments(template: &[Vec<MirrorLocation>]) -> Vec<Segment> {
    template
        .iter()
        .map(|mirrors| {
            Segment::new(
                mirrors
                    .iter()
                    .map(|location| Mirror::new(location.clone(), 1))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    #[test]
    fn parses_multi_segment_multi_mirror_location() {
        let segments = parse_location(
            "lwps://h1:1970/seg1|lwps://h2:1970/seg1,lwps://h3/seg2",
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 2);
        assert_eq!(segments[1].len(), 1);
        assert_eq!(segments[1][0].port, 1970); // default port applied
    }

    #[test]
    fn rejects_missing_scheme() {
        let err = parse_location("h1:1970/seg1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn name_as_url_has_from_url_origin() {
        let defaults = GatewayDefaults::default();
        let idx = LogicalIndex::initialize("lwps://h1:1970/seg1", None, &defaults).unwrap();
        assert_eq!(idx.origin, Origin::FromUrl);
        assert_eq!(idx.segment_count(), 1);
    }

    #[test]
    fn config_location_resolves_from_config_origin() {
        let raw = RawConfig::parse("index-location:foo lwps://h1:1970/foo|lwps://h2:1970/foo\n").unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let idx = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();
        assert_eq!(idx.origin, Origin::FromConfig);
        assert_eq!(idx.segment_count(), 1);
        assert_eq!(idx.segments[0].mirrors.len(), 2);
    }

    #[test]
    fn unknown_index_without_location_errors() {
        let defaults = GatewayDefaults::default();
        let err = LogicalIndex::initialize("bar", None, &defaults).unwrap_err();
        assert!(matches!(err, ConfigError::IndexNotFound(_)));
    }

    #[test]
    fn reset_search_overrides_clamps_bounds() {
        let raw = RawConfig::parse(
            "index-location:foo lwps://h1/foo,lwps://h2/foo\n\
             index-max-segments-searched:foo 9\n\
             index-min-segments-searched:foo 9\n",
        )
        .unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let idx = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();
        assert_eq!(idx.effective_max_segments_searched, 2);
        assert_eq!(idx.effective_min_segments_searched, 2);
    }

    #[test]
    fn sort_orders_parsed_from_config() {
        let raw = RawConfig::parse(
            "index-location:foo lwps://h1/foo\n\
             index-sort-orders:foo {sort:date:desc} {s:r:a}\n",
        )
        .unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let idx = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();
        assert_eq!(idx.sort_orders.len(), 2);
        assert_eq!(idx.sort_orders[0].field, "date");
        assert_eq!(idx.sort_orders[1].field, "relevance");
    }

    #[test]
    fn duplicate_is_independent_and_unconnected() {
        let raw = RawConfig::parse("index-location:foo lwps://h1/foo\n").unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let template = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();
        let mut copy = template.duplicate();
        assert_eq!(copy.segment_count(), template.segment_count());
        assert!(!copy.segments[0].is_alive());
        copy.effective_mirror_affinity = 3;
        assert_ne!(copy.effective_mirror_affinity, template.effective_mirror_affinity);
    }

    #[test]
    fn lazy_policy_open_never_touches_segments() {
        use crate::lwps::line_protocol::mock::MockTransport;

        let raw = RawConfig::parse(
            "index-location:foo lwps://lazyhost/foo\n\
             index-connection-policy:foo lazy\n",
        )
        .unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let mut idx = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();
        assert_eq!(idx.connection_policy, ConnectionPolicy::Lazy);

        let transport = MockTransport::new();
        idx.open(transport.as_ref(), 100, false, -1).unwrap();
        assert!(!idx.segments[0].is_alive());
        assert_eq!(transport.connect_calls.lock().unwrap().len(), 0);
    }

    #[test]
    fn strict_policy_opens_all_segments_in_parallel() {
        use crate::lwps::line_protocol::mock::{MockTransport, Scripted};
        use crate::lwps::SearchResponse;
        use crate::lwps::SortType;

        let raw = RawConfig::parse(
            "index-location:foo lwps://h1/foo,lwps://h2/foo\n",
        )
        .unwrap();
        let entry = IndexConfigEntry::resolve(&raw, "foo").unwrap();
        let defaults = GatewayDefaults::default();
        let mut idx = LogicalIndex::initialize("foo", Some(&entry), &defaults).unwrap();

        let transport = MockTransport::new();
        transport.script(
            "h1",
            1970,
            Scripted::Search(SearchResponse {
                rows: vec![],
                total_results: 0,
                max_sort_key: None,
                sort_type: SortType::None,
                document_count: 0,
            }),
        );
        transport.script(
            "h2",
            1970,
            Scripted::Search(SearchResponse {
                rows: vec![],
                total_results: 0,
                max_sort_key: None,
                sort_type: SortType::None,
                document_count: 0,
            }),
        );

        idx.open(transport.as_ref(), 100, false, -1).unwrap();
        assert!(idx.segments[0].is_alive());
        assert!(idx.segments[1].is_alive());
    }
}
