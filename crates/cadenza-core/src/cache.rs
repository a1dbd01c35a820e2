//! Descriptor cache for cheap staleness checks against the filesystem.
//!
//! The cache persists one lightweight [`Descriptor`] per known singer id as
//! a flat JSON list, rewritten wholesale on every save. Descriptors never
//! hold heavy payload; they exist so a rescan can skip re-parsing banks
//! whose definition files have not changed.

use crate::error::CadenzaResult;
use crate::voicebank::SingerType;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lightweight persisted record of one singer's identity and freshness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Stable singer id
    pub id: String,
    /// Display name at the time of caching
    pub name: String,
    /// Primary definition file the singer loads from
    pub location: PathBuf,
    /// Backend the singer renders with
    pub singer_type: SingerType,
    /// Modification time of `location` when the singer was last loaded
    pub last_modified: DateTime<Utc>,
    /// When this record was written
    pub cached_at: DateTime<Utc>,
}

impl Descriptor {
    /// Capture a descriptor from the current state of `location`
    ///
    /// # Errors
    ///
    /// Returns an error if the file's metadata cannot be read.
    pub fn capture(
        id: &str,
        name: &str,
        location: &Path,
        singer_type: SingerType,
    ) -> CadenzaResult<Self> {
        let modified = std::fs::metadata(location)?.modified()?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            location: location.to_path_buf(),
            singer_type,
            last_modified: DateTime::<Utc>::from(modified),
            cached_at: Utc::now(),
        })
    }
}

/// Cache of singer descriptors backed by a flat JSON file.
///
/// Reads and updates go through interior locks so discovery workers can
/// share one instance without external synchronization; `save` and `load`
/// are mutually exclusive with each other.
#[derive(Debug)]
pub struct MetadataCache {
    path: PathBuf,
    descriptors: RwLock<HashMap<String, Descriptor>>,
    io_lock: Mutex<()>,
}

impl MetadataCache {
    /// Create an empty cache backed by `path` (nothing is read yet)
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            descriptors: RwLock::new(HashMap::new()),
            io_lock: Mutex::new(()),
        }
    }

    /// Cross-platform default backing file location
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "Cadenza", "cadenza")
            .map(|dirs| dirs.cache_dir().join("singers.json"))
            .unwrap_or_else(|| PathBuf::from(".cadenza").join("singers.json"))
    }

    /// Backing file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the descriptor set from the backing file.
    ///
    /// Never fails past this boundary: a missing file yields an empty cache
    /// (informational), a corrupt file yields an empty cache (warning).
    /// Returns the number of descriptors loaded.
    pub fn load(&self) -> usize {
        let _io = self.io_lock.lock();
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                info!(
                    "no descriptor cache at {}: {err}; starting empty",
                    self.path.display()
                );
                self.descriptors.write().clear();
                return 0;
            }
        };
        match serde_json::from_str::<Vec<Descriptor>>(&raw) {
            Ok(records) => {
                let mut map = self.descriptors.write();
                map.clear();
                for record in records {
                    map.insert(record.id.clone(), record);
                }
                debug!("loaded {} singer descriptors", map.len());
                map.len()
            }
            Err(err) => {
                warn!(
                    "descriptor cache at {} is corrupt: {err}; starting empty",
                    self.path.display()
                );
                self.descriptors.write().clear();
                0
            }
        }
    }

    /// Serialize the full descriptor set, overwriting the backing file
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self) -> CadenzaResult<()> {
        let _io = self.io_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut records: Vec<Descriptor> = self.descriptors.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, json)?;
        debug!(
            "saved {} singer descriptors to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Get the descriptor for `id`, if one is cached
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Descriptor> {
        self.descriptors.read().get(id).cloned()
    }

    /// Insert or replace the descriptor for its id
    pub fn update(&self, descriptor: Descriptor) {
        self.descriptors
            .write()
            .insert(descriptor.id.clone(), descriptor);
    }

    /// Whether the singer at `location` must be re-parsed.
    ///
    /// True if no descriptor exists for `id`, or if the file's current
    /// modification time is strictly greater than the cached value. An
    /// unreadable modification time also forces a reload.
    #[must_use]
    pub fn needs_reload(&self, id: &str, location: &Path) -> bool {
        let Some(cached) = self.get(id) else {
            return true;
        };
        match std::fs::metadata(location).and_then(|meta| meta.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified) > cached.last_modified,
            Err(err) => {
                debug!(
                    "cannot stat {} for staleness check: {err}",
                    location.display()
                );
                true
            }
        }
    }

    /// Remove the descriptor for `id`, returning it if present
    pub fn remove(&self, id: &str) -> Option<Descriptor> {
        self.descriptors.write().remove(id)
    }

    /// Drop every descriptor whose location no longer resolves to an
    /// existing file; returns the number removed
    pub fn cleanup_stale(&self) -> usize {
        let mut map = self.descriptors.write();
        let before = map.len();
        map.retain(|id, descriptor| {
            let alive = descriptor.location.is_file();
            if !alive {
                debug!(
                    "pruning stale descriptor '{id}' ({} is gone)",
                    descriptor.location.display()
                );
            }
            alive
        });
        before - map.len()
    }

    /// Drop all descriptors
    pub fn clear(&self) {
        self.descriptors.write().clear();
    }

    /// Number of cached descriptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    /// Whether the cache holds no descriptors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn descriptor_for(id: &str, location: &Path) -> Descriptor {
        Descriptor::capture(id, id, location, SingerType::Utau).expect("capture should work")
    }

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "name=Test").unwrap();
        path
    }

    #[test]
    fn test_load_missing_file_yields_empty() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::new(dir.path().join("absent.json"));
        assert_eq!(cache.load(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_yields_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("singers.json");
        std::fs::write(&path, "{ not json").unwrap();
        let cache = MetadataCache::new(path);
        assert_eq!(cache.load(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let backing = dir.path().join("cache").join("singers.json");
        let file = touch(&dir, "character.txt");

        let cache = MetadataCache::new(backing.clone());
        cache.update(descriptor_for("teto", &file));
        cache.update(descriptor_for("momo", &file));
        cache.save().expect("save should succeed");

        // Fresh instance pointed at the same backing file
        let reloaded = MetadataCache::new(backing);
        assert_eq!(reloaded.load(), 2);
        assert_eq!(reloaded.get("teto"), cache.get("teto"));
        assert_eq!(reloaded.get("momo"), cache.get("momo"));
    }

    #[test]
    fn test_needs_reload_unknown_id() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        assert!(cache.needs_reload("unknown", &file));
    }

    #[test]
    fn test_needs_reload_fresh_descriptor() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        cache.update(descriptor_for("teto", &file));
        // Captured at the file's current mtime: not strictly greater
        assert!(!cache.needs_reload("teto", &file));
    }

    #[test]
    fn test_needs_reload_stale_descriptor() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        let mut descriptor = descriptor_for("teto", &file);
        descriptor.last_modified = descriptor.last_modified - Duration::hours(1);
        cache.update(descriptor);
        assert!(cache.needs_reload("teto", &file));
    }

    #[test]
    fn test_needs_reload_missing_file() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        cache.update(descriptor_for("teto", &file));
        std::fs::remove_file(&file).unwrap();
        assert!(cache.needs_reload("teto", &file));
    }

    #[test]
    fn test_cleanup_stale_removes_exactly_the_dead() {
        let dir = TempDir::new().unwrap();
        let alive = touch(&dir, "alive.txt");
        let dead = touch(&dir, "dead.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        cache.update(descriptor_for("alive", &alive));
        cache.update(descriptor_for("dead", &dead));

        std::fs::remove_file(&dead).unwrap();
        assert_eq!(cache.cleanup_stale(), 1);
        assert!(cache.get("alive").is_some());
        assert!(cache.get("dead").is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let cache = MetadataCache::new(dir.path().join("singers.json"));
        cache.update(descriptor_for("teto", &file));
        cache.update(descriptor_for("momo", &file));

        assert!(cache.remove("teto").is_some());
        assert!(cache.remove("teto").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let backing = dir.path().join("deep").join("nested").join("singers.json");
        let cache = MetadataCache::new(backing.clone());
        cache.save().expect("save should create directories");
        assert!(backing.is_file());
    }

    #[test]
    fn test_descriptor_serialization() {
        let dir = TempDir::new().unwrap();
        let file = touch(&dir, "character.txt");
        let descriptor = descriptor_for("teto", &file);
        let json = serde_json::to_string(&descriptor).expect("Should serialize");
        let deserialized: Descriptor = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(descriptor, deserialized);
    }
}
