//! Session root: configuration, index registry, autodiscovery trie, and
//! info cache (spec.md §3 "Gateway", §5 "Reinitialization").
//!
//! This is the crate's SPI entry point (spec.md §9 "Design Notes" — a
//! session type owning a gateway value by composition). Callers construct
//! one [`Gateway`] per configuration file and call [`Gateway::search`] /
//! [`Gateway::retrieve`] per request; every call re-stats the configuration
//! file first and transparently rebuilds the gateway's generation if its
//! status-change time has advanced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::autodiscovery::{self, AutodiscoveryTable};
use crate::config::{self, GatewayDefaults, IndexConfigEntry, RawConfig, SearchCacheConfig};
use crate::dispatch::{self, DispatchRequest, DispatchResponse};
use crate::error::{ConfigError, GatewayError};
use crate::index::{LogicalIndex, Origin};
use crate::info_cache::InfoCache;
use crate::lwps::{RetrievalChunk, Transport};
use crate::search_cache::SearchCache;

/// Everything that gets torn down and rebuilt on config reload (spec.md §5
/// "Reinitialization": "the current gateway is torn down (registry freed,
/// info cache freed, trie freed) and rebuilt from the config"). The info
/// cache lives outside this struct since it is cleared in place rather than
/// replaced (its internal lock would otherwise need re-acquiring by every
/// in-flight reader).
struct Generation {
    status_change_time: std::time::SystemTime,
    raw_config: RawConfig,
    defaults: GatewayDefaults,
    /// Append-only once a name is resolved (spec.md §5 "Shared-resource
    /// policy"): never mutated after insertion, only read or extended.
    registry: HashMap<String, Arc<LogicalIndex>>,
    autodiscovery: AutodiscoveryTable,
    search_cache: SearchCache,
}

impl Generation {
    fn load(path: &Path, transport: &dyn Transport) -> Result<Self, GatewayError> {
        let status_change_time = config::status_change_time(path)
            .map_err(|e| ConfigError::InvalidDirectory(format!("{:?}: {}", path, e)))?;
        let raw_config = RawConfig::load(path)?;
        let defaults = GatewayDefaults::from_config(&raw_config)?;
        let autodiscovery = autodiscovery::autodiscover(
            &raw_config,
            transport,
            defaults.connection_timeout_ms,
            defaults.send_init,
        );
        let cache_config = SearchCacheConfig::from_config(&raw_config)?;
        let search_cache = SearchCache::new(
            cache_config.mode,
            cache_config.directory.unwrap_or_else(|| ".".to_string()),
            cache_config.subdirectory_mask,
        );

        Ok(Generation {
            status_change_time,
            raw_config,
            defaults,
            registry: HashMap::new(),
            autodiscovery,
            search_cache,
        })
    }
}

/// spec.md §3 "Gateway": root container owning the config path, resolved
/// defaults, index registry, autodiscovery trie, and info cache.
pub struct Gateway {
    config_path: PathBuf,
    transport: Arc<dyn Transport>,
    generation: RwLock<Generation>,
    info_cache: InfoCache,
}

impl Gateway {
    /// Load the gateway for the first time from `config_path`, scanning for
    /// autodiscoverable backends over `transport` (spec.md §4.8).
    pub fn open<P: AsRef<Path>>(
        config_path: P,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GatewayError> {
        let config_path = config_path.as_ref().to_path_buf();
        let generation = Generation::load(&config_path, transport.as_ref())?;
        Ok(Gateway {
            config_path,
            transport,
            generation: RwLock::new(generation),
            info_cache: InfoCache::new(),
        })
    }

    /// spec.md §3 "Lifecycle" / §5 "Reinitialization": re-stat the config
    /// file and rebuild the whole generation if its status-change time has
    /// advanced. Called at the top of every request entry point.
    ///
    /// Concurrent requests during a reload are not guaranteed to observe
    /// either generation atomically (spec.md §9 Open Question (a)); this
    /// implementation accepts that a request already past this check keeps
    /// working against its own duplicated index copies from the old
    /// generation to completion, while later callers see the new one.
    fn check_for_reload(&self) -> Result<(), GatewayError> {
        let current = config::status_change_time(&self.config_path)
            .map_err(|e| ConfigError::InvalidDirectory(format!("{:?}: {}", self.config_path, e)))?;

        let stale = { self.generation.read().status_change_time != current };
        if !stale {
            return Ok(());
        }

        let fresh = Generation::load(&self.config_path, self.transport.as_ref())?;
        *self.generation.write() = fresh;
        self.info_cache.free_cache();
        log::info!("gateway configuration changed, reinitialized from {:?}", self.config_path);
        Ok(())
    }

    /// Resolve a logical index's location (spec.md §4.6 "initialize"): the
    /// name itself as an LWPS URL, then `index-location:NAME`, then the
    /// autodiscovery trie.
    fn location_for(
        name: &str,
        entry: Option<&IndexConfigEntry>,
        autodiscovery: &AutodiscoveryTable,
    ) -> Option<(String, Origin)> {
        if name.starts_with("lwps://") {
            return Some((name.to_string(), Origin::FromUrl));
        }
        if let Some(location) = entry.and_then(|e| e.location.clone()) {
            return Some((location, Origin::FromConfig));
        }
        autodiscovery.get(name).cloned().map(|loc| (loc, Origin::FromConfig))
    }

    /// spec.md §3 "Lifecycle": "a logical index is created on first
    /// reference to its name, duplicated into a per-call working copy".
    /// The registry template, once built, is never mutated again.
    fn resolve_index(&self, name: &str) -> Result<LogicalIndex, GatewayError> {
        self.check_for_reload()?;

        if let Some(template) = self.generation.read().registry.get(name) {
            return Ok(template.duplicate());
        }

        let mut generation = self.generation.write();
        // another writer may have raced us between the read above and here
        if let Some(template) = generation.registry.get(name) {
            return Ok(template.duplicate());
        }

        let entry = IndexConfigEntry::resolve(&generation.raw_config, name)?;
        let (location, origin) = Self::location_for(name, Some(&entry), &generation.autodiscovery)
            .ok_or_else(|| ConfigError::IndexNotFound(name.to_string()))?;

        let template = LogicalIndex::from_location(name, &location, origin, Some(&entry), &generation.defaults)?;
        let template = Arc::new(template);
        generation.registry.insert(name.to_string(), Arc::clone(&template));
        Ok(template.duplicate())
    }

    fn open_indices(&self, names: &[String]) -> Result<Vec<LogicalIndex>, GatewayError> {
        let defaults = self.generation.read().defaults.clone();
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let mut index = self.resolve_index(name)?;
            index.open(
                self.transport.as_ref(),
                defaults.connection_timeout_ms,
                defaults.send_init,
                defaults.mirror_affinity,
            )?;
            indices.push(index);
        }
        Ok(indices)
    }

    /// Full fan-out search across one or more logical indices (spec.md
    /// §4.7). Each index is duplicated from the registry template, opened,
    /// searched, and dropped at the end of the call (spec.md §3
    /// "Lifecycle": "used, then freed with its copy").
    pub fn search(&self, names: &[String], request: &DispatchRequest) -> Result<DispatchResponse, GatewayError> {
        let mut indices = self.open_indices(names)?;
        let (send_init, allow_overrides) = {
            let generation = self.generation.read();
            (generation.defaults.send_init, generation.defaults.allow_search_overrides)
        };
        let response = dispatch::dispatch_search(
            &mut indices,
            self.transport.as_ref(),
            send_init,
            allow_overrides,
            request,
        );
        Ok(response)
    }

    /// Retrieval dispatch (spec.md §4.7 "Retrieval dispatch"): routes to the
    /// segment/mirror a rewritten document key names, or the first segment
    /// otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn retrieve(
        &self,
        name: &str,
        document_key: &str,
        item: &str,
        mime_type: Option<&str>,
        chunk_type: Option<&str>,
        chunk_start: Option<u64>,
        chunk_end: Option<u64>,
        is_search_report_item: bool,
    ) -> Result<RetrievalChunk, GatewayError> {
        let mut index = self.resolve_index(name)?;
        let send_init = self.generation.read().defaults.send_init;
        dispatch::dispatch_retrieve(
            &mut index,
            self.transport.as_ref(),
            send_init,
            document_key,
            item,
            mime_type,
            chunk_type,
            chunk_start,
            chunk_end,
            is_search_report_item,
        )
    }

    pub fn info_cache(&self) -> &InfoCache {
        &self.info_cache
    }

    pub fn search_cache_mode(&self) -> crate::search_cache::CacheMode {
        self.generation.read().search_cache.mode
    }

    pub fn defaults(&self) -> GatewayDefaults {
        self.generation.read().defaults.clone()
    }

    /// TTL used when populating the info cache from a fresh lookup,
    /// resolved from `gateway-information-cache-timeout` (spec.md §6).
    pub fn info_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.generation.read().defaults.info_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lwps::line_protocol::mock::{MockTransport, Scripted};
    use crate::lwps::{SearchResponse, SortType};
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn empty_response() -> SearchResponse {
        SearchResponse {
            rows: vec![],
            total_results: 0,
            max_sort_key: None,
            sort_type: SortType::None,
            document_count: 0,
        }
    }

    #[test]
    fn resolves_index_from_config_location_and_caches_template() {
        let file = write_config("index-location:foo lwps://h1:1970/foo\n");
        let transport = MockTransport::new();
        transport.script("h1", 1970, Scripted::Search(empty_response()));

        let gateway = Gateway::open(file.path(), transport.clone() as Arc<dyn Transport>).unwrap();
        let request = DispatchRequest {
            language: None,
            search_text: String::new(),
            positive_feedback: None,
            negative_feedback: None,
            start_index: 0,
            end_index: 10,
        };
        let response = gateway.search(&["foo".to_string()], &request).unwrap();
        assert_eq!(response.total_results, 0);
        assert_eq!(gateway.generation.read().registry.len(), 1);

        // second call reuses the cached template (duplicate, not rebuild)
        gateway.search(&["foo".to_string()], &request).unwrap();
        assert_eq!(gateway.generation.read().registry.len(), 1);
    }

    #[test]
    fn unknown_index_errors() {
        let file = write_config("");
        let transport = MockTransport::new();
        let gateway = Gateway::open(file.path(), transport.clone() as Arc<dyn Transport>).unwrap();
        let request = DispatchRequest {
            language: None,
            search_text: String::new(),
            positive_feedback: None,
            negative_feedback: None,
            start_index: 0,
            end_index: 10,
        };
        let err = gateway.search(&["missing".to_string()], &request).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(ConfigError::IndexNotFound(_))));
    }

    #[test]
    fn reinitializes_when_config_file_changes() {
        let mut file = write_config("index-location:foo lwps://h1:1970/foo\n");
        let transport = MockTransport::new();
        transport.script("h1", 1970, Scripted::Search(empty_response()));
        transport.script("h2", 1970, Scripted::Search(empty_response()));

        let gateway = Gateway::open(file.path(), transport.clone() as Arc<dyn Transport>).unwrap();
        let request = DispatchRequest {
            language: None,
            search_text: String::new(),
            positive_feedback: None,
            negative_feedback: None,
            start_index: 0,
            end_index: 10,
        };
        gateway.search(&["foo".to_string()], &request).unwrap();

        // rewrite the config with a different location for "foo" and bump mtime
        std::thread::sleep(std::time::Duration::from_millis(10));
        file.as_file_mut().set_len(0).unwrap();
        use std::io::Seek;
        file.as_file_mut().seek(std::io::SeekFrom::Start(0)).unwrap();
        write!(file, "index-location:foo lwps://h2:1970/foo\n").unwrap();
        file.flush().unwrap();

        gateway.search(&["foo".to_string()], &request).unwrap();
        // the registry must have been rebuilt against the new location
        let registry = &gateway.generation.read().registry;
        let template = registry.get("foo").unwrap();
        assert_eq!(template.segments[0].mirrors[0].location.host, "h2");
    }

    #[test]
    fn allow_search_overrides_gates_modifier_application() {
        let file = write_config(
            "index-location:foo lwps://h1:1970/foo\n\
             gateway-allow-search-overrides yes\n",
        );
        let transport = MockTransport::new();
        transport.script("h1", 1970, Scripted::Search(empty_response()));

        let gateway = Gateway::open(file.path(), transport.clone() as Arc<dyn Transport>).unwrap();
        let request = DispatchRequest {
            language: None,
            search_text: "{gtwy_search_timeout:10}".to_string(),
            positive_feedback: None,
            negative_feedback: None,
            start_index: 0,
            end_index: 10,
        };
        gateway.search(&["foo".to_string()], &request).unwrap();
        // defaults() reflects the gateway-wide timeout, not the per-request
        // override, which only ever lives on the duplicated working copy.
        assert_eq!(gateway.defaults().allow_search_overrides, true);
    }
}
