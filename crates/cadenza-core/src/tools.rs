//! Registry of external synthesis tools with guaranteed built-in fallback.
//!
//! Two registries exist at runtime, one per capability (resampling and
//! wavtool concatenation); both follow the same protocol. A rescan rebuilds
//! the lookup map wholesale and publishes it in one write so concurrent
//! lookups never observe a partially rebuilt map.

use crate::error::{CadenzaError, CadenzaResult};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Capability a tool implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Pitch/time resampling of one audio segment
    Resampler,
    /// Concatenation of rendered segments ("wavtool")
    Wavtool,
}

impl ToolKind {
    /// Name of the built-in default implementation for this capability
    #[must_use]
    pub const fn builtin_name(&self) -> &'static str {
        match self {
            Self::Resampler => "worldline",
            Self::Wavtool => "stitchline",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resampler => write!(f, "resampler"),
            Self::Wavtool => write!(f, "wavtool"),
        }
    }
}

/// Descriptor of one registered tool; the name is the lookup key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    /// Display name, unique within a registry
    pub name: String,
    /// Capability the tool implements
    pub kind: ToolKind,
    /// Executable path for external tools; `None` for built-ins
    pub path: Option<PathBuf>,
    /// Whether this is the in-process built-in implementation
    pub builtin: bool,
}

impl ToolDescriptor {
    /// Descriptor for a built-in implementation
    #[must_use]
    pub fn builtin(name: &str, kind: ToolKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            path: None,
            builtin: true,
        }
    }

    /// Descriptor for an external executable
    #[must_use]
    pub fn external(name: &str, kind: ToolKind, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            kind,
            path: Some(path.to_path_buf()),
            builtin: false,
        }
    }
}

static BUILTIN_TOOLS: Lazy<Vec<ToolDescriptor>> = Lazy::new(|| {
    vec![
        ToolDescriptor::builtin(ToolKind::Resampler.builtin_name(), ToolKind::Resampler),
        ToolDescriptor::builtin(ToolKind::Wavtool.builtin_name(), ToolKind::Wavtool),
    ]
});

/// Registry of tools for one capability.
///
/// Lookups resolve by exact name with a guaranteed fallback chain: the
/// built-in default, then the first available tool in name order.
#[derive(Debug)]
pub struct ToolRegistry {
    kind: ToolKind,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    failed: Mutex<HashSet<PathBuf>>,
}

impl ToolRegistry {
    /// Create a registry pre-seeded with the built-in implementation
    #[must_use]
    pub fn new(kind: ToolKind) -> Self {
        let registry = Self {
            kind,
            tools: RwLock::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        };
        *registry.tools.write() = registry.builtin_map();
        registry
    }

    /// Capability this registry serves
    #[must_use]
    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    /// Rescan `base_dir` recursively and rebuild the registry wholesale.
    ///
    /// Prior state, including the failed-attempt memory, is discarded. The
    /// built-in implementation is always registered regardless of the scan
    /// outcome. Returns the number of registered tools.
    pub fn search(&self, base_dir: &Path) -> usize {
        self.failed.lock().clear();
        let mut fresh = self.builtin_map();

        if base_dir.is_dir() {
            // Lexical walk order makes first-registered-wins deterministic
            for entry in WalkDir::new(base_dir).follow_links(false).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        self.consider(&mut fresh, entry.path());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("{} scan skipping unreadable entry: {err}", self.kind);
                    }
                }
            }
        } else {
            debug!(
                "{} directory {} does not exist; only built-ins registered",
                self.kind,
                base_dir.display()
            );
        }

        let count = fresh.len();
        // Swap-then-publish: concurrent lookups see old or new, never partial
        *self.tools.write() = fresh;
        debug!("{} search registered {count} tools", self.kind);
        count
    }

    /// Resolve a tool by exact name, falling back to the built-in default.
    ///
    /// A miss on a non-empty name is logged; an empty name silently
    /// resolves to the fallback. If even the fallback is unavailable the
    /// first tool in name order is returned; `None` only when the registry
    /// is completely empty, which callers must handle.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.read();
        if let Some(tool) = tools.get(name) {
            return Some(tool.clone());
        }
        if !name.is_empty() {
            warn!(
                "{} '{name}' not found, falling back to '{}'",
                self.kind,
                self.kind.builtin_name()
            );
        }
        if let Some(fallback) = tools.get(self.kind.builtin_name()) {
            return Some(fallback.clone());
        }
        let first = tools.values().min_by(|a, b| a.name.cmp(&b.name)).cloned();
        if first.is_none() {
            error!("no {} available at all", self.kind);
        }
        first
    }

    /// All registered tools in name order
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Paths that matched the platform shape but failed to instantiate
    /// during the current scan cycle
    #[must_use]
    pub fn failed_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.failed.lock().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether no tools are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    fn builtin_map(&self) -> HashMap<String, ToolDescriptor> {
        BUILTIN_TOOLS
            .iter()
            .filter(|tool| tool.kind == self.kind)
            .map(|tool| (tool.name.clone(), tool.clone()))
            .collect()
    }

    fn consider(&self, fresh: &mut HashMap<String, ToolDescriptor>, path: &Path) {
        if self.failed.lock().contains(path) {
            // Already failed this cycle; not retried until the next search
            return;
        }
        if !matches_platform_shape(path) {
            debug!("{} scan skipping {}", self.kind, path.display());
            return;
        }
        match instantiate(self.kind, path) {
            Ok(tool) => {
                if let Some(existing) = fresh.get(&tool.name) {
                    warn!(
                        "{} name '{}' already registered from {:?}; discarding {}",
                        self.kind,
                        tool.name,
                        existing.path,
                        path.display()
                    );
                } else {
                    debug!("registered {} '{}' from {}", self.kind, tool.name, path.display());
                    fresh.insert(tool.name.clone(), tool);
                }
            }
            Err(err) => {
                warn!("failed to load {} at {}: {err}", self.kind, path.display());
                self.failed.lock().insert(path.to_path_buf());
            }
        }
    }
}

/// Owned pair of registries for the two capabilities, as held by the
/// application context
#[derive(Debug)]
pub struct ToolManager {
    resampler_dir: PathBuf,
    wavtool_dir: PathBuf,
    resamplers: ToolRegistry,
    wavtools: ToolRegistry,
}

impl ToolManager {
    /// Create a manager scanning the two configured base directories
    #[must_use]
    pub fn new(resampler_dir: PathBuf, wavtool_dir: PathBuf) -> Self {
        Self {
            resampler_dir,
            wavtool_dir,
            resamplers: ToolRegistry::new(ToolKind::Resampler),
            wavtools: ToolRegistry::new(ToolKind::Wavtool),
        }
    }

    /// Rescan the resampler directory; returns the registered count
    pub fn search_resamplers(&self) -> usize {
        self.resamplers.search(&self.resampler_dir)
    }

    /// Rescan the wavtool directory; returns the registered count
    pub fn search_wavtools(&self) -> usize {
        self.wavtools.search(&self.wavtool_dir)
    }

    /// Resolve a resampler by name with built-in fallback
    #[must_use]
    pub fn get_resampler(&self, name: &str) -> Option<ToolDescriptor> {
        self.resamplers.get(name)
    }

    /// Resolve a wavtool by name with built-in fallback
    #[must_use]
    pub fn get_wavtool(&self, name: &str) -> Option<ToolDescriptor> {
        self.wavtools.get(name)
    }

    /// The resampler registry
    #[must_use]
    pub fn resamplers(&self) -> &ToolRegistry {
        &self.resamplers
    }

    /// The wavtool registry
    #[must_use]
    pub fn wavtools(&self) -> &ToolRegistry {
        &self.wavtools
    }
}

/// Whether the file looks like a tool on the current platform.
///
/// Anything else is skipped silently; readmes and stray assets are the
/// common case in user tool folders.
fn matches_platform_shape(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if cfg!(windows) {
        matches!(ext.as_deref(), Some("exe" | "bat"))
    } else {
        matches!(ext.as_deref(), Some("sh") | None)
    }
}

fn instantiate(kind: ToolKind, path: &Path) -> CadenzaResult<ToolDescriptor> {
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| {
            CadenzaError::tool(format!("tool at {} has no usable name", path.display()))
        })?;
    let _meta = std::fs::metadata(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if _meta.permissions().mode() & 0o111 == 0 {
            return Err(CadenzaError::tool(format!(
                "{} is not executable",
                path.display()
            )));
        }
    }
    Ok(ToolDescriptor::external(name, kind, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn write_tool(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_builtin_registered_without_search() {
        let registry = ToolRegistry::new(ToolKind::Resampler);
        let tool = registry.get("worldline").expect("built-in should exist");
        assert!(tool.builtin);
        assert_eq!(tool.kind, ToolKind::Resampler);
    }

    #[test]
    fn test_get_unknown_name_falls_back_to_builtin() {
        let registry = ToolRegistry::new(ToolKind::Resampler);
        let tool = registry.get("moresampler").expect("fallback should exist");
        assert_eq!(tool.name, "worldline");
    }

    #[test]
    fn test_get_empty_name_falls_back_to_builtin() {
        let registry = ToolRegistry::new(ToolKind::Wavtool);
        let tool = registry.get("").expect("fallback should exist");
        assert_eq!(tool.name, "stitchline");
        assert!(tool.builtin);
    }

    #[test]
    fn test_search_missing_directory_keeps_builtin() {
        let registry = ToolRegistry::new(ToolKind::Resampler);
        let count = registry.search(Path::new("/does/not/exist"));
        assert_eq!(count, 1);
        assert!(registry.get("worldline").is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_search_registers_executables_and_skips_assets() {
        let dir = TempDir::new().unwrap();
        write_tool(dir.path(), "moresampler.sh");
        std::fs::write(dir.path().join("readme.md"), "docs").unwrap();

        let registry = ToolRegistry::new(ToolKind::Resampler);
        registry.search(dir.path());

        let found = registry.get("moresampler").expect("tool should resolve");
        assert!(!found.builtin);
        assert_eq!(found.path.as_deref(), Some(dir.path().join("moresampler.sh").as_path()));
        assert!(registry.tools().iter().all(|tool| tool.name != "readme"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_instantiation_is_remembered() {
        let dir = TempDir::new().unwrap();
        // Platform shape (no extension) but not executable
        std::fs::write(dir.path().join("brokentool"), "data").unwrap();

        let registry = ToolRegistry::new(ToolKind::Resampler);
        registry.search(dir.path());

        assert_eq!(registry.failed_paths(), vec![dir.path().join("brokentool")]);
        assert!(registry.get("brokentool").expect("fallback").builtin);

        // Fresh search clears the failed memory
        std::fs::remove_file(dir.path().join("brokentool")).unwrap();
        registry.search(dir.path());
        assert!(registry.failed_paths().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_name_collision_first_registered_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        let first = write_tool(&dir.path().join("a"), "moresampler.sh");
        write_tool(&dir.path().join("b"), "moresampler.sh");

        let registry = ToolRegistry::new(ToolKind::Resampler);
        registry.search(dir.path());

        let found = registry.get("moresampler").expect("tool should resolve");
        assert_eq!(found.path.as_deref(), Some(first.as_path()));
        assert_eq!(registry.len(), 2); // built-in + one external
    }

    #[cfg(unix)]
    #[test]
    fn test_rescan_rebuilds_wholesale() {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(dir.path(), "moresampler.sh");

        let registry = ToolRegistry::new(ToolKind::Resampler);
        registry.search(dir.path());
        assert_eq!(registry.len(), 2);

        std::fs::remove_file(&tool).unwrap();
        registry.search(dir.path());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("moresampler").expect("fallback").builtin);
    }

    #[test]
    fn test_tool_manager_serves_both_capabilities() {
        let dir = TempDir::new().unwrap();
        let manager = ToolManager::new(
            dir.path().join("resamplers"),
            dir.path().join("wavtools"),
        );
        assert_eq!(manager.search_resamplers(), 1);
        assert_eq!(manager.search_wavtools(), 1);
        assert_eq!(
            manager.get_resampler("anything").expect("fallback").name,
            "worldline"
        );
        assert_eq!(
            manager.get_wavtool("").expect("fallback").name,
            "stitchline"
        );
    }
}
