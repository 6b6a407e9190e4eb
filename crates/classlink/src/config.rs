//
// config.rs
//
// Server configuration and its parsing from LSP settings
//

use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Slot bound of each language cache
    pub cache_max_entries: usize,
    /// Idle time after which a cache slot is swept; 0 disables the sweep
    pub cache_cleanup_interval_secs: u64,
    /// Whether the workspace may be enumerated to build the reference map
    pub workspace_scan: bool,
    /// Directory names skipped during the workspace scan
    pub scan_exclude: Vec<String>,
    /// Maximum number of files read during one scan
    pub max_scan_files: usize,
    /// Files larger than this are neither scanned nor fetched
    pub max_file_size_bytes: u64,
    /// How long completion waits for pending reference documents
    pub fetch_wait_ms: u64,
    /// Whether `http(s)` stylesheets are downloaded
    pub remote_enabled: bool,
    /// Age after which a cached remote stylesheet is revalidated
    pub remote_cache_expiry_secs: u64,
    /// Override for the persisted remote cache directory
    pub remote_cache_path: Option<PathBuf>,
    /// Hops followed when collecting documents for references and rename
    pub reference_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_max_entries: 20,
            cache_cleanup_interval_secs: 120,
            workspace_scan: true,
            scan_exclude: ["node_modules", ".git", "target", "dist"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_scan_files: 5000,
            max_file_size_bytes: 1024 * 1024,
            fetch_wait_ms: 750,
            remote_enabled: true,
            remote_cache_expiry_secs: 24 * 60 * 60,
            remote_cache_path: None,
            reference_depth: 2,
        }
    }
}

impl ServerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }

    pub fn remote_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.remote_cache_expiry_secs)
    }

    /// Whether a change from `self` to `other` needs new language caches.
    pub fn caches_differ(&self, other: &ServerConfig) -> bool {
        self.cache_max_entries != other.cache_max_entries
            || self.cache_cleanup_interval_secs != other.cache_cleanup_interval_secs
    }
}

/// Parse the `classlink` section of initialization options or workspace
/// settings. Missing keys keep their defaults; a missing section yields
/// `None`.
///
/// ```ignore
/// let settings = serde_json::json!({
///     "classlink": { "cache": { "maxEntries": 50 }, "workspaceScan": false }
/// });
/// let cfg = parse_config(&settings).unwrap();
/// assert_eq!(cfg.cache_max_entries, 50);
/// assert!(!cfg.workspace_scan);
/// ```
pub fn parse_config(settings: &serde_json::Value) -> Option<ServerConfig> {
    let section = settings.get("classlink")?;
    let mut config = ServerConfig::default();

    if let Some(cache) = section.get("cache") {
        if let Some(v) = cache.get("maxEntries").and_then(|v| v.as_u64()) {
            config.cache_max_entries = (v as usize).max(1);
        }
        if let Some(v) = cache.get("cleanupIntervalSeconds").and_then(|v| v.as_i64()) {
            // Negative values disable the sweep like zero does
            config.cache_cleanup_interval_secs = v.max(0) as u64;
        }
    }
    if let Some(v) = section.get("workspaceScan").and_then(|v| v.as_bool()) {
        config.workspace_scan = v;
    }
    if let Some(dirs) = section.get("scanExclude").and_then(|v| v.as_array()) {
        config.scan_exclude = dirs
            .iter()
            .filter_map(|d| d.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(v) = section.get("maxScanFiles").and_then(|v| v.as_u64()) {
        config.max_scan_files = v as usize;
    }
    if let Some(v) = section.get("maxFileSizeBytes").and_then(|v| v.as_u64()) {
        config.max_file_size_bytes = v;
    }
    if let Some(v) = section.get("fetchWaitMs").and_then(|v| v.as_u64()) {
        config.fetch_wait_ms = v;
    }
    if let Some(v) = section.get("referenceDepth").and_then(|v| v.as_u64()) {
        config.reference_depth = v as usize;
    }
    if let Some(remote) = section.get("remote") {
        if let Some(v) = remote.get("enabled").and_then(|v| v.as_bool()) {
            config.remote_enabled = v;
        }
        if let Some(v) = remote.get("cacheExpirySeconds").and_then(|v| v.as_u64()) {
            config.remote_cache_expiry_secs = v;
        }
        if let Some(v) = remote.get("cachePath").and_then(|v| v.as_str()) {
            if !v.is_empty() && !v.contains('\0') {
                config.remote_cache_path = Some(PathBuf::from(v));
            }
        }
    }

    log::info!("Configuration loaded from LSP settings:");
    log::info!(
        "  cache: max_entries={}, cleanup_interval={}s",
        config.cache_max_entries,
        config.cache_cleanup_interval_secs
    );
    log::info!(
        "  workspace_scan: {} (max {} files, exclude {:?})",
        config.workspace_scan,
        config.max_scan_files,
        config.scan_exclude
    );
    log::info!("  fetch_wait_ms: {}", config.fetch_wait_ms);
    log::info!(
        "  remote: enabled={}, expiry={}s",
        config.remote_enabled,
        config.remote_cache_expiry_secs
    );
    log::info!("  reference_depth: {}", config.reference_depth);

    Some(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_section() {
        assert!(parse_config(&json!({})).is_none());
        assert!(parse_config(&json!({ "other": {} })).is_none());
    }

    #[test]
    fn test_empty_section_keeps_defaults() {
        assert_eq!(parse_config(&json!({ "classlink": {} })), Some(ServerConfig::default()));
    }

    #[test]
    fn test_all_keys() {
        let settings = json!({
            "classlink": {
                "cache": { "maxEntries": 5, "cleanupIntervalSeconds": 0 },
                "workspaceScan": false,
                "scanExclude": ["vendor", ""],
                "maxScanFiles": 10,
                "maxFileSizeBytes": 2048,
                "fetchWaitMs": 0,
                "referenceDepth": 4,
                "remote": {
                    "enabled": false,
                    "cacheExpirySeconds": 60,
                    "cachePath": "/tmp/classlink"
                }
            }
        });
        let cfg = parse_config(&settings).unwrap();
        assert_eq!(cfg.cache_max_entries, 5);
        assert_eq!(cfg.cleanup_interval(), Duration::ZERO);
        assert!(!cfg.workspace_scan);
        assert_eq!(cfg.scan_exclude, vec!["vendor".to_string()]);
        assert_eq!(cfg.max_scan_files, 10);
        assert_eq!(cfg.max_file_size_bytes, 2048);
        assert_eq!(cfg.fetch_wait(), Duration::ZERO);
        assert_eq!(cfg.reference_depth, 4);
        assert!(!cfg.remote_enabled);
        assert_eq!(cfg.remote_cache_expiry(), Duration::from_secs(60));
        assert_eq!(cfg.remote_cache_path, Some(PathBuf::from("/tmp/classlink")));
        assert!(cfg.caches_differ(&ServerConfig::default()));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let cfg = parse_config(&json!({
            "classlink": { "cache": { "maxEntries": 0, "cleanupIntervalSeconds": -5 } }
        }))
        .unwrap();
        assert_eq!(cfg.cache_max_entries, 1);
        assert_eq!(cfg.cache_cleanup_interval_secs, 0);
    }
}
