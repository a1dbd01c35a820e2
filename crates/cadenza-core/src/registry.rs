//! Singer catalog with parallel discovery and a coalescing reload scheduler.
//!
//! The registry is an explicitly constructed application context: it owns
//! the configuration, the descriptor cache, the parser handle and the
//! notification sink, and is created once at startup. There is no global
//! state; collaborators receive the registry by `Arc`.

use crate::cache::{Descriptor, MetadataCache};
use crate::retry::RetryPolicy;
use crate::voicebank::{SingerType, Voicebank, VoicebankParser};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A loadable voice resource with stable identity.
///
/// Identity survives reloads; the heavy payload is rebuilt off to the side
/// and published with an atomic swap, so readers holding an old snapshot
/// keep a valid (if superseded) voicebank instead of observing partial
/// mutation. The generation counter lets readers detect that their
/// snapshot is stale and re-read.
#[derive(Debug)]
pub struct Singer {
    id: String,
    name: RwLock<String>,
    location: PathBuf,
    singer_type: SingerType,
    found: AtomicBool,
    generation: AtomicU64,
    payload: RwLock<Option<Arc<Voicebank>>>,
}

impl Singer {
    /// Create a singer shell with no payload loaded yet
    #[must_use]
    pub fn new<S: Into<String>>(
        id: S,
        name: S,
        location: PathBuf,
        singer_type: SingerType,
    ) -> Self {
        let found = location.is_file();
        Self {
            id: id.into(),
            name: RwLock::new(name.into()),
            location,
            singer_type,
            found: AtomicBool::new(found),
            generation: AtomicU64::new(0),
            payload: RwLock::new(None),
        }
    }

    /// Stable unique id within a registry snapshot
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current display name (updated on reload)
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Primary definition file this singer loads from
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Backend the singer renders with
    #[must_use]
    pub fn singer_type(&self) -> SingerType {
        self.singer_type
    }

    /// Whether the backing definition file was present at last check
    #[must_use]
    pub fn is_found(&self) -> bool {
        self.found.load(Ordering::Acquire)
    }

    /// Whether the heavy payload is currently resident
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.payload.read().is_some()
    }

    /// Snapshot of the current payload.
    ///
    /// The snapshot stays valid after a reload supersedes it; compare
    /// [`Singer::generation`] before and after a read to detect staleness.
    #[must_use]
    pub fn voicebank(&self) -> Option<Arc<Voicebank>> {
        self.payload.read().clone()
    }

    /// Payload generation, bumped on every install or release
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn install(&self, voicebank: Voicebank) {
        let voicebank = Arc::new(voicebank);
        *self.name.write() = voicebank.name.clone();
        *self.payload.write() = Some(voicebank);
        self.found.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        if self.payload.write().take().is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            debug!("released heavy payload of singer '{}'", self.id);
        }
    }
}

/// Fire-and-forget sink for reload progress and completion signals.
///
/// The editor supplies its own implementation; [`LogNotifier`] is the
/// tracing-backed default.
pub trait ReloadNotifier: Send + Sync + std::fmt::Debug {
    /// A reload attempt sequence for `singer_id` is starting
    fn reload_started(&self, singer_id: &str) {
        let _ = singer_id;
    }

    /// The singer reloaded successfully after `attempts` attempts
    fn reload_succeeded(&self, singer_id: &str, attempts: u32);

    /// Every attempt failed; `reason` is the final error
    fn reload_failed(&self, singer_id: &str, reason: &str);
}

/// Default notifier that logs completion signals
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ReloadNotifier for LogNotifier {
    fn reload_succeeded(&self, singer_id: &str, attempts: u32) {
        info!("singer '{singer_id}' reloaded ({attempts} attempt(s))");
    }

    fn reload_failed(&self, singer_id: &str, reason: &str) {
        warn!("singer '{singer_id}' reload failed: {reason}");
    }
}

/// Minimal view of an open project, as far as singer usage is concerned
#[derive(Debug, Clone, Default)]
pub struct Project {
    /// Tracks in project order
    pub tracks: Vec<Track>,
}

impl Project {
    /// Distinct singer ids referenced by the project's tracks
    #[must_use]
    pub fn referenced_singers(&self) -> HashSet<String> {
        self.tracks
            .iter()
            .filter_map(|track| track.singer_id.clone())
            .collect()
    }
}

/// One track's singer assignment
#[derive(Debug, Clone, Default)]
pub struct Track {
    /// Assigned singer id, if any
    pub singer_id: Option<String>,
}

/// Configuration for a [`SingerRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Singer search roots in priority order. On duplicate ids the singer
    /// from the earliest root wins; this ordering is a documented contract,
    /// so user-added roots placed first override bundled ones.
    pub search_roots: Vec<PathBuf>,
    /// Backing file for the descriptor cache
    pub cache_path: PathBuf,
    /// Coalescing delay before a scheduled reload cycle fires
    pub debounce: Duration,
    /// Retry policy for one singer reload
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let search_roots = directories::ProjectDirs::from("org", "Cadenza", "cadenza")
            .map(|dirs| vec![dirs.data_dir().join("singers")])
            .unwrap_or_else(|| vec![PathBuf::from("singers")]);
        Self {
            search_roots,
            cache_path: MetadataCache::default_path(),
            debounce: Duration::from_millis(crate::DEFAULT_RELOAD_DEBOUNCE_MS),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    pending: Vec<Arc<Singer>>,
    epoch: u64,
}

/// Top-level singer catalog and reload scheduler
#[derive(Debug)]
pub struct SingerRegistry {
    config: RegistryConfig,
    cache: Arc<MetadataCache>,
    parser: Arc<dyn VoicebankParser>,
    notifier: Arc<dyn ReloadNotifier>,
    singers: RwLock<HashMap<String, Arc<Singer>>>,
    groups: RwLock<BTreeMap<SingerType, Vec<Arc<Singer>>>>,
    in_use: Mutex<HashSet<String>>,
    scheduler: Mutex<SchedulerState>,
    // Serializes reload cycles; an executing cycle is never interrupted
    reload_gate: tokio::sync::Mutex<()>,
}

impl SingerRegistry {
    /// Create a registry with the tracing-backed notifier
    #[must_use]
    pub fn new(config: RegistryConfig, parser: Arc<dyn VoicebankParser>) -> Self {
        Self::with_notifier(config, parser, Arc::new(LogNotifier))
    }

    /// Create a registry with a custom notification sink
    #[must_use]
    pub fn with_notifier(
        config: RegistryConfig,
        parser: Arc<dyn VoicebankParser>,
        notifier: Arc<dyn ReloadNotifier>,
    ) -> Self {
        let cache = Arc::new(MetadataCache::new(config.cache_path.clone()));
        cache.load();
        Self {
            config,
            cache,
            parser,
            notifier,
            singers: RwLock::new(HashMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            in_use: Mutex::new(HashSet::new()),
            scheduler: Mutex::new(SchedulerState::default()),
            reload_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The registry's configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The descriptor cache
    #[must_use]
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Perform one full rescan of every configured root.
    ///
    /// Roots are searched concurrently and merged in priority order; a
    /// failing root is logged and skipped. Singers already known keep
    /// their identity (the same [`Singer`] object) and are re-parsed only
    /// when the cache says their definition file changed. On total failure
    /// the catalog is empty rather than an error.
    pub async fn search_all(&self) -> BTreeMap<SingerType, Vec<Arc<Singer>>> {
        let previous = Arc::new(self.singers.read().clone());
        let mut tasks = JoinSet::new();
        for (priority, root) in self.config.search_roots.iter().cloned().enumerate() {
            let parser = Arc::clone(&self.parser);
            let cache = Arc::clone(&self.cache);
            let previous = Arc::clone(&previous);
            tasks.spawn(async move {
                match discover_root(&root, parser.as_ref(), &cache, &previous) {
                    Ok(found) => {
                        debug!("found {} singers under {}", found.len(), root.display());
                        (priority, found)
                    }
                    Err(err) => {
                        warn!("singer search failed for {}: {err}; skipping root", root.display());
                        (priority, Vec::new())
                    }
                }
            });
        }

        let mut per_root: Vec<(usize, Vec<Arc<Singer>>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => per_root.push(result),
                Err(err) => warn!("singer search task failed: {err}"),
            }
        }
        per_root.sort_by_key(|(priority, _)| *priority);

        let mut merged: HashMap<String, Arc<Singer>> = HashMap::new();
        for (_, found) in per_root {
            for singer in found {
                if let Some(winner) = merged.get(singer.id()) {
                    warn!(
                        "duplicate singer id '{}': keeping {}, ignoring {}",
                        singer.id(),
                        winner.location().display(),
                        singer.location().display()
                    );
                } else {
                    merged.insert(singer.id().to_string(), singer);
                }
            }
        }

        let mut groups: BTreeMap<SingerType, Vec<Arc<Singer>>> = BTreeMap::new();
        for singer in merged.values() {
            groups
                .entry(singer.singer_type())
                .or_default()
                .push(Arc::clone(singer));
        }
        for group in groups.values_mut() {
            group.sort_by_key(|singer| singer.name().to_lowercase());
        }

        info!("singer search found {} singers", merged.len());
        *self.singers.write() = merged;
        *self.groups.write() = groups.clone();

        let pruned = self.cache.cleanup_stale();
        if pruned > 0 {
            debug!("pruned {pruned} stale descriptors after search");
        }
        if let Err(err) = self.cache.save() {
            warn!("failed to persist descriptor cache: {err}");
        }
        groups
    }

    /// Exact-id lookup after stripping the track placeholder token.
    ///
    /// Empty input and unknown ids are logged and answered with `None`.
    #[must_use]
    pub fn get_singer(&self, name: &str) -> Option<Arc<Singer>> {
        let stripped = name.replace(crate::VOICE_PLACEHOLDER, "");
        let id = stripped.trim();
        if id.is_empty() {
            warn!("singer lookup with empty name");
            return None;
        }
        match self.singers.read().get(id) {
            Some(singer) => Some(Arc::clone(singer)),
            None => {
                warn!("singer '{id}' not found");
                None
            }
        }
    }

    /// All singers in the current catalog, unordered
    #[must_use]
    pub fn singers(&self) -> Vec<Arc<Singer>> {
        self.singers.read().values().cloned().collect()
    }

    /// The catalog grouped by type, ordered by display name within each
    /// group, as of the last completed search
    #[must_use]
    pub fn grouped_by_type(&self) -> BTreeMap<SingerType, Vec<Arc<Singer>>> {
        self.groups.read().clone()
    }

    /// Enqueue `singer` for reload and (re)arm the coalescing timer.
    ///
    /// Repeated calls for the same singer within one debounce window are
    /// idempotent: the pending set is deduplicated and each call replaces
    /// the outstanding timer, so a burst of triggers produces exactly one
    /// reload cycle, firing no earlier than one debounce interval after
    /// the last trigger. An already-executing cycle is never interrupted,
    /// only not re-triggered.
    pub fn schedule_reload(self: &Arc<Self>, singer: &Arc<Singer>) {
        let epoch = {
            let mut state = self.scheduler.lock();
            if !state.pending.iter().any(|queued| queued.id() == singer.id()) {
                state.pending.push(Arc::clone(singer));
            }
            // Cancel-old, install-new: an unfired timer sees a stale epoch
            state.epoch += 1;
            state.epoch
        };
        debug!("scheduled reload of singer '{}'", singer.id());
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(registry.config.debounce).await;
            registry.run_reload_cycle(epoch).await;
        });
    }

    /// Free the heavy payload of every singer no longer referenced by the
    /// project's tracks.
    ///
    /// Identity and descriptors are kept; only the parsed sets and sample
    /// data go. The in-use tracking set is replaced by the project's
    /// referenced set.
    pub fn release_singers_not_in_use(&self, project: &Project) {
        let referenced = project.referenced_singers();
        let mut in_use = self.in_use.lock();
        let singers = self.singers.read();
        for id in in_use.iter() {
            if !referenced.contains(id) {
                if let Some(singer) = singers.get(id) {
                    singer.release();
                    info!("singer '{id}' no longer in use; payload freed");
                }
            }
        }
        *in_use = referenced;
    }

    /// Snapshot of the ids currently tracked as in use
    #[must_use]
    pub fn singers_in_use(&self) -> HashSet<String> {
        self.in_use.lock().clone()
    }

    async fn run_reload_cycle(&self, epoch: u64) {
        let batch = {
            let mut state = self.scheduler.lock();
            if state.epoch != epoch {
                // Superseded by a newer trigger; that timer will fire
                return;
            }
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }
        let _gate = self.reload_gate.lock().await;
        debug!("reload cycle starting for {} singer(s)", batch.len());
        for singer in batch {
            self.reload_singer(&singer).await;
        }
    }

    /// Reload one singer with bounded retries, refreshing its descriptor
    /// on success. Failure is reported to the notifier and does not stop
    /// the remainder of the cycle.
    async fn reload_singer(&self, singer: &Arc<Singer>) {
        self.notifier.reload_started(singer.id());
        let parser = Arc::clone(&self.parser);
        let location = singer.location().to_path_buf();
        let outcome = self
            .config
            .retry
            .run("singer reload", || {
                let parser = Arc::clone(&parser);
                let location = location.clone();
                async move { parser.parse(&location) }
            })
            .await;
        match outcome {
            Ok(reloaded) => {
                singer.install(reloaded.value);
                match Descriptor::capture(
                    singer.id(),
                    &singer.name(),
                    singer.location(),
                    singer.singer_type(),
                ) {
                    Ok(descriptor) => {
                        self.cache.update(descriptor);
                        if let Err(err) = self.cache.save() {
                            warn!("failed to persist descriptor cache: {err}");
                        }
                    }
                    Err(err) => {
                        warn!("could not refresh descriptor for '{}': {err}", singer.id());
                    }
                }
                self.notifier
                    .reload_succeeded(singer.id(), reloaded.attempts);
            }
            Err(err) => {
                warn!(
                    "reload of singer '{}' exhausted {} attempt(s): {err}",
                    singer.id(),
                    self.config.retry.max_attempts.max(1)
                );
                self.notifier.reload_failed(singer.id(), &err.to_string());
            }
        }
    }
}

/// Scan one root for singer folders. Direct children carrying a backend
/// marker are singers; everything else is skipped. Per-child errors are
/// isolated so one unreadable folder does not abort the root.
fn discover_root(
    root: &Path,
    parser: &dyn VoicebankParser,
    cache: &MetadataCache,
    previous: &HashMap<String, Arc<Singer>>,
) -> crate::CadenzaResult<Vec<Arc<Singer>>> {
    if !root.is_dir() {
        return Err(crate::CadenzaError::discovery(format!(
            "search root {} is not a directory",
            root.display()
        )));
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let dir = match entry {
            Ok(entry) => entry.path(),
            Err(err) => {
                warn!("unreadable entry under {}: {err}", root.display());
                continue;
            }
        };
        if !dir.is_dir() {
            continue;
        }
        let Some(singer_type) = SingerType::detect(&dir) else {
            debug!("{} has no backend marker; skipping", dir.display());
            continue;
        };
        let definition = singer_type.definition_file(&dir);
        let Some(id) = dir.file_name().and_then(|name| name.to_str()) else {
            warn!("skipping singer folder with non-UTF-8 name: {}", dir.display());
            continue;
        };

        if let Some(existing) = previous.get(id) {
            // Stable identity across searches; re-parse only when stale or
            // the payload was reclaimed since
            if cache.needs_reload(id, &definition) || !existing.is_loaded() {
                refresh(existing, parser, cache);
            }
            found.push(Arc::clone(existing));
            continue;
        }

        let singer = Arc::new(Singer::new(id, id, definition, singer_type));
        refresh(&singer, parser, cache);
        found.push(singer);
    }
    Ok(found)
}

fn refresh(singer: &Arc<Singer>, parser: &dyn VoicebankParser, cache: &MetadataCache) {
    match parser.parse(singer.location()) {
        Ok(voicebank) => {
            singer.install(voicebank);
            match Descriptor::capture(
                singer.id(),
                &singer.name(),
                singer.location(),
                singer.singer_type(),
            ) {
                Ok(descriptor) => cache.update(descriptor),
                Err(err) => {
                    warn!("could not capture descriptor for '{}': {err}", singer.id());
                }
            }
        }
        Err(err) => {
            warn!("failed to load singer '{}': {err}", singer.id());
        }
    }
}
