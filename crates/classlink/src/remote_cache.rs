//
// remote_cache.rs
//
// On-disk cache of downloaded stylesheets with HTTP validators
//

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const INDEX_FILE: &str = "index.json";

/// Validators and freshness for one cached URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Seconds since the Unix epoch of the last download or revalidation
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Younger than the expiry; use without contacting the server
    Fresh(String),
    /// Older than the expiry; revalidate with the stored validators
    Stale { text: String, entry: IndexEntry },
    Missing,
}

/// Content-addressed store: each URL's body lives in a file named by the
/// SHA-256 of the URL, and `index.json` maps URLs to their validators.
///
/// The index never names a file that does not exist: bodies are written
/// before their index entry, and clearing persists an empty index before
/// deleting bodies.
#[derive(Debug)]
pub struct RemoteCache {
    dir: PathBuf,
    expiry: Duration,
    index: Mutex<BTreeMap<String, IndexEntry>>,
}

impl RemoteCache {
    pub fn open(dir: PathBuf, expiry: Duration) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let index = load_index(&dir.join(INDEX_FILE));
        log::info!(
            "Remote stylesheet cache at {} ({} entries)",
            dir.display(),
            index.len()
        );
        Ok(Self {
            dir,
            expiry,
            index: Mutex::new(index),
        })
    }

    /// Platform cache directory for this server.
    pub fn default_dir() -> PathBuf {
        #[cfg(unix)]
        {
            if let Ok(dirs) = xdg::BaseDirectories::with_prefix("classlink") {
                return dirs.get_cache_home();
            }
        }
        std::env::temp_dir().join("classlink-cache")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(url: &str) -> String {
        Sha256::digest(url.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn lookup(&self, url: &str) -> Lookup {
        self.lookup_at(url, now_secs())
    }

    fn lookup_at(&self, url: &str, now: u64) -> Lookup {
        let Some(entry) = self.index.lock().ok().and_then(|index| index.get(url).cloned()) else {
            return Lookup::Missing;
        };
        let text = match fs::read_to_string(self.dir.join(Self::file_name(url))) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Cached body for {} unreadable: {}", url, e);
                return Lookup::Missing;
            }
        };
        if now.saturating_sub(entry.updated_at) > self.expiry.as_secs() {
            Lookup::Stale { text, entry }
        } else {
            Lookup::Fresh(text)
        }
    }

    pub fn store(
        &self,
        url: &str,
        text: &str,
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> io::Result<()> {
        write_atomic(&self.dir.join(Self::file_name(url)), text.as_bytes())?;
        self.update_index(|index| {
            index.insert(
                url.to_string(),
                IndexEntry {
                    etag,
                    last_modified,
                    updated_at: now_secs(),
                },
            );
        })
    }

    /// Record a successful revalidation (HTTP 304).
    pub fn touch(&self, url: &str) -> io::Result<()> {
        self.update_index(|index| {
            if let Some(entry) = index.get_mut(url) {
                entry.updated_at = now_secs();
            }
        })
    }

    /// Delete every cached body and the index.
    pub fn clear(&self) -> io::Result<()> {
        let removed: Vec<String> = {
            let mut index = self
                .index
                .lock()
                .map_err(|_| io::Error::other("cache index lock poisoned"))?;
            let removed = index.keys().cloned().collect();
            index.clear();
            write_atomic(&self.dir.join(INDEX_FILE), b"{}")?;
            removed
        };

        for url in &removed {
            let path = self.dir.join(Self::file_name(url));
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        log::info!("Cleared {} cached remote stylesheets", removed.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.lock().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_index<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, IndexEntry>),
    {
        let mut index = self
            .index
            .lock()
            .map_err(|_| io::Error::other("cache index lock poisoned"))?;
        f(&mut index);
        let json = serde_json::to_vec_pretty(&*index).map_err(io::Error::other)?;
        write_atomic(&self.dir.join(INDEX_FILE), &json)
    }
}

fn load_index(path: &Path) -> BTreeMap<String, IndexEntry> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            log::warn!("Ignoring corrupt cache index {}: {}", path.display(), e);
            BTreeMap::new()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => {
            log::warn!("Failed to read cache index {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const URL: &str = "https://cdn.example.com/a.css";

    fn cache(dir: &TempDir) -> RemoteCache {
        RemoteCache::open(dir.path().to_path_buf(), Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_file_name_is_sha256_hex() {
        let name = RemoteCache::file_name(URL);
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, RemoteCache::file_name("https://cdn.example.com/b.css"));
    }

    #[test]
    fn test_store_then_lookup_fresh_and_stale() {
        let dir = TempDir::new().unwrap();
        let c = cache(&dir);
        c.store(URL, ".a {}", Some("\"v1\"".into()), None).unwrap();

        assert_eq!(c.lookup(URL), Lookup::Fresh(".a {}".to_string()));
        match c.lookup_at(URL, now_secs() + 120) {
            Lookup::Stale { text, entry } => {
                assert_eq!(text, ".a {}");
                assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
            }
            other => panic!("expected stale, got {:?}", other),
        }
        assert_eq!(c.lookup("https://other/x.css"), Lookup::Missing);
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        cache(&dir)
            .store(URL, ".b {}", None, Some("Tue, 01 Oct 2024 00:00:00 GMT".into()))
            .unwrap();
        let reopened = cache(&dir);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.lookup(URL), Lookup::Fresh(".b {}".to_string()));

        let raw = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(raw.contains("lastModified"));
        assert!(raw.contains("updatedAt"));
    }

    #[test]
    fn test_touch_refreshes_stale_entry() {
        let dir = TempDir::new().unwrap();
        let c = cache(&dir);
        c.store(URL, ".a {}", None, None).unwrap();
        c.update_index(|index| {
            if let Some(entry) = index.get_mut(URL) {
                entry.updated_at = 0;
            }
        })
        .unwrap();
        assert!(matches!(c.lookup(URL), Lookup::Stale { .. }));
        c.touch(URL).unwrap();
        assert!(matches!(c.lookup(URL), Lookup::Fresh(_)));
    }

    #[test]
    fn test_clear_removes_index_and_files() {
        let dir = TempDir::new().unwrap();
        let c = cache(&dir);
        c.store(URL, ".a {}", None, None).unwrap();
        let body = dir.path().join(RemoteCache::file_name(URL));
        assert!(body.exists());

        c.clear().unwrap();
        assert!(c.is_empty());
        assert!(!body.exists());
        assert_eq!(cache(&dir).len(), 0);
    }

    #[test]
    fn test_missing_body_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let c = cache(&dir);
        c.store(URL, ".a {}", None, None).unwrap();
        fs::remove_file(dir.path().join(RemoteCache::file_name(URL))).unwrap();
        assert_eq!(c.lookup(URL), Lookup::Missing);
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), "not json").unwrap();
        assert!(cache(&dir).is_empty());
    }
}
