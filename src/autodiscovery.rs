//! Host/mask scan producing a logical-name → location trie (spec.md §4.8).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use regex::Regex;

use crate::config::RawConfig;
use crate::lwps::{Transport, DEFAULT_LWPS_PORT};

/// Name → comma-separated-segment-urls table, the end product of a full
/// autodiscovery pass (spec.md §4.8 "the resulting... trie").
pub type AutodiscoveryTable = HashMap<String, String>;

fn parse_host_spec(spec: &str) -> Option<(Ipv4Addr, u8, u16)> {
    let mut rest = spec;
    let mut port = DEFAULT_LWPS_PORT;

    if let Some(idx) = rest.rfind(':') {
        let candidate = &rest[idx + 1..];
        if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
            port = candidate.parse().ok()?;
            rest = &rest[..idx];
        }
    }

    let mut prefix: u8 = 32;
    let mut host_str = rest;
    if let Some(idx) = rest.find('/') {
        prefix = rest[idx + 1..].parse().ok()?;
        host_str = &rest[..idx];
    }

    let base: Ipv4Addr = host_str.parse().ok()?;
    Some((base, prefix, port))
}

/// Every address in the mask's range, skipping `.0`, `.1`, `.255` in the
/// last octet (spec.md §4.8).
fn host_range(base: Ipv4Addr, prefix: u8) -> Vec<Ipv4Addr> {
    let base_u32 = u32::from(base);
    let host_bits = 32u32.saturating_sub(prefix as u32);
    let mask_bits: u32 = if host_bits >= 32 { 0 } else { !0u32 << host_bits };
    let network = base_u32 & mask_bits;
    let broadcast = network | !mask_bits;

    (network..=broadcast)
        .filter(|addr| {
            let last_octet = addr & 0xFF;
            !matches!(last_octet, 0 | 1 | 255)
        })
        .map(Ipv4Addr::from)
        .collect()
}

fn merge_discovered(into: &mut AutodiscoveryTable, from: AutodiscoveryTable) {
    for (name, url) in from {
        into.entry(name)
            .and_modify(|existing| {
                existing.push('|');
                existing.push_str(&url);
            })
            .or_insert(url);
    }
}

/// Probe a single candidate address: open, optionally init, ask for
/// `server_index_info`, close. Returns the empty vec on any transport
/// failure — an unreachable host in the scan range is expected, not an
/// error (spec.md §4.8 describes a best-effort sweep).
fn probe_host(
    transport: &dyn Transport,
    host: &str,
    port: u16,
    connection_timeout_ms: u64,
    send_init: bool,
) -> Vec<String> {
    let mut conn = match transport.connect(host, port, "", connection_timeout_ms) {
        Ok(conn) => conn,
        Err(_) => return Vec::new(),
    };
    if send_init && conn.init(connection_timeout_ms).is_err() {
        conn.close();
        return Vec::new();
    }
    let names = conn
        .server_index_info(connection_timeout_ms)
        .map(|info| info.index_names)
        .unwrap_or_default();
    conn.close();
    names
}

/// Scan one `host[/mask][:port]` comma-list, opening an LWPS connection to
/// every candidate address and recording the index names each reports
/// (spec.md §4.8). Each host in the expanded mask range is probed from its
/// own worker thread — spec.md §5 models the gateway as fanning out onto
/// "parallel OS threads" wherever backends are probed independently, and a
/// `/24` scan run serially would dominate wall-clock autodiscovery time.
pub fn discover_hosts(
    host_list: &str,
    transport: &dyn Transport,
    connection_timeout_ms: u64,
    send_init: bool,
) -> AutodiscoveryTable {
    let mut table = AutodiscoveryTable::new();

    for spec in host_list.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (base, prefix, port) = match parse_host_spec(spec) {
            Some(v) => v,
            None => {
                log::warn!("unparseable autodiscovery host spec '{}'", spec);
                continue;
            }
        };

        let addrs = host_range(base, prefix);
        let (tx, rx) = crossbeam_channel::unbounded();

        std::thread::scope(|scope| {
            for (slot, addr) in addrs.iter().enumerate() {
                let tx = tx.clone();
                let host = addr.to_string();
                scope.spawn(move || {
                    let names = probe_host(transport, &host, port, connection_timeout_ms, send_init);
                    let _ = tx.send((slot, host, names));
                });
            }
            drop(tx);

            // Re-sort by scan-order slot: worker completion order is
            // unspecified, but each host's contribution to a multi-host
            // `|`-joined location must stay in a stable, scan order-derived
            // sequence (spec.md §4.8 "appending with `|` when the same name
            // already maps to some location").
            let mut results: Vec<(usize, String, Vec<String>)> = rx.iter().collect();
            results.sort_by_key(|(slot, _, _)| *slot);

            for (_, host, names) in results {
                for name in names {
                    let url = format!("lwps://{}:{}/{}", host, port, name);
                    table
                        .entry(name)
                        .and_modify(|existing| {
                            existing.push('|');
                            existing.push_str(&url);
                        })
                        .or_insert(url);
                }
            }
        });
    }

    table
}

/// Expand one `index:NAME=SEGMENTS` token list against the discovered
/// name→URL table: a literal token is looked up directly; a `[regex]`
/// token matches multiple trie keys, each contributing its own segment
/// (spec.md §4.8).
fn resolve_segment_spec(spec: &str, discovered: &AutodiscoveryTable) -> String {
    let mut segments: Vec<String> = Vec::new();

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some(pattern) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            match Regex::new(pattern) {
                Ok(re) => {
                    let mut matched: Vec<&String> =
                        discovered.keys().filter(|k| re.is_match(k)).collect();
                    matched.sort();
                    for key in matched {
                        segments.push(discovered[key].clone());
                    }
                }
                Err(err) => log::warn!("invalid regex segment token '{}': {}", token, err),
            }
        } else if let Some(location) = discovered.get(token) {
            segments.push(location.clone());
        } else {
            log::warn!("segment token '{}' not found in autodiscovery trie", token);
        }
    }

    segments.join(",")
}

/// Process every `index:NAME=SEGMENTS` config entry against the discovered
/// table, producing the final `NAME → location` autodiscovery table
/// consumed by [`crate::index::LogicalIndex::initialize`]'s third
/// resolution step.
pub fn build_autodiscovery_table(raw: &RawConfig, discovered: AutodiscoveryTable) -> AutodiscoveryTable {
    let mut table = AutodiscoveryTable::new();
    for (name, spec) in raw.all_appended("index") {
        let resolved = resolve_segment_spec(spec, &discovered);
        if !resolved.is_empty() {
            table.insert(name.to_string(), resolved);
        }
    }
    table
}

/// Full autodiscovery pass: scans every configured host list (the global
/// `index-hosts` key plus any per-index `index-hosts:NAME` overrides),
/// then resolves `index:NAME=SEGMENTS` entries against the merged result.
pub fn autodiscover(
    raw: &RawConfig,
    transport: &dyn Transport,
    connection_timeout_ms: u64,
    send_init: bool,
) -> AutodiscoveryTable {
    let mut discovered = AutodiscoveryTable::new();

    if let Some(global_hosts) = raw.get("index-hosts") {
        merge_discovered(
            &mut discovered,
            discover_hosts(global_hosts, transport, connection_timeout_ms, send_init),
        );
    }
    for (_, hosts) in raw.all_appended("index-hosts") {
        merge_discovered(
            &mut discovered,
            discover_hosts(hosts, transport, connection_timeout_ms, send_init),
        );
    }

    build_autodiscovery_table(raw, discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwps::line_protocol::mock::{MockTransport, Scripted};
    use crate::lwps::ServerIndexInfo;

    #[test]
    fn host_range_skips_network_gateway_and_broadcast() {
        let addrs = host_range("10.0.0.0".parse().unwrap(), 29);
        let last_octets: Vec<u32> = addrs.iter().map(|a| u32::from(*a) & 0xFF).collect();
        assert!(!last_octets.contains(&0));
        assert!(!last_octets.contains(&1));
        assert!(!last_octets.contains(&255));
        assert_eq!(last_octets, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn parses_host_mask_and_port() {
        let (base, prefix, port) = parse_host_spec("10.0.0.0/29:1971").unwrap();
        assert_eq!(base, "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(prefix, 29);
        assert_eq!(port, 1971);
    }

    #[test]
    fn parses_bare_host_defaults() {
        let (base, prefix, port) = parse_host_spec("10.0.0.2").unwrap();
        assert_eq!(base, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(prefix, 32);
        assert_eq!(port, DEFAULT_LWPS_PORT);
    }

    #[test]
    fn discover_hosts_builds_pipe_joined_table_across_hosts() {
        let transport = MockTransport::new();
        transport.script(
            "10.0.0.2",
            1970,
            Scripted::ServerIndexInfo(ServerIndexInfo {
                index_names: vec!["foo".into()],
            }),
        );
        transport.script(
            "10.0.0.3",
            1970,
            Scripted::ServerIndexInfo(ServerIndexInfo {
                index_names: vec!["foo".into(), "bar".into()],
            }),
        );

        let table = discover_hosts("10.0.0.0/30", transport.as_ref(), 100, false);
        assert_eq!(table.get("foo").unwrap(), "lwps://10.0.0.2:1970/foo|lwps://10.0.0.3:1970/foo");
        assert_eq!(table.get("bar").unwrap(), "lwps://10.0.0.3:1970/bar");
    }

    #[test]
    fn regex_segment_token_expands_to_multiple_segments() {
        let mut discovered = AutodiscoveryTable::new();
        discovered.insert("shard-a".into(), "lwps://h1:1970/shard-a".into());
        discovered.insert("shard-b".into(), "lwps://h2:1970/shard-b".into());
        discovered.insert("other".into(), "lwps://h3:1970/other".into());

        let resolved = resolve_segment_spec("[^shard-]", &discovered);
        assert_eq!(resolved, "lwps://h1:1970/shard-a,lwps://h2:1970/shard-b");
    }

    #[test]
    fn literal_token_resolves_directly() {
        let mut discovered = AutodiscoveryTable::new();
        discovered.insert("foo".into(), "lwps://h1:1970/foo|lwps://h2:1970/foo".into());
        assert_eq!(resolve_segment_spec("foo", &discovered), "lwps://h1:1970/foo|lwps://h2:1970/foo");
    }

    #[test]
    fn unknown_literal_token_is_dropped_with_warning() {
        let discovered = AutodiscoveryTable::new();
        assert_eq!(resolve_segment_spec("missing", &discovered), "");
    }
}
