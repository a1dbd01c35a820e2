//! Debounced per-singer filesystem watcher.
//!
//! One watcher monitors one singer's folder and forwards coalesced change
//! signals to the registry's reload scheduler. The debounce window is
//! sliding: every relevant event restarts the full interval, so a burst of
//! writes produces a single reload request once the folder goes quiet.

#![allow(missing_docs)]

use crate::error::CadenzaResult;
use crate::registry::{Singer, SingerRegistry};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

enum WatchSignal {
    Change,
    Failure,
}

/// Per-singer filesystem monitor with sliding-window debounce.
///
/// State machine: idle until a relevant event arrives, then pending until
/// the debounce timer fires and the reload request is forwarded to the
/// scheduler. Pausing suppresses event handling without tearing down the
/// OS watch. On an underlying watcher error the OS watch is restarted
/// exactly once; a second failure leaves the component inert until it is
/// reconstructed.
pub struct SingerWatcher {
    root: PathBuf,
    paused: Arc<AtomicBool>,
    disposed: Arc<AtomicBool>,
    os_watch: Arc<Mutex<Option<RecommendedWatcher>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SingerWatcher {
    /// Start watching `singer`'s folder, forwarding debounced reload
    /// requests to `registry`. Must be called within a tokio runtime.
    pub fn spawn(
        registry: Arc<SingerRegistry>,
        singer: Arc<Singer>,
        debounce: Duration,
    ) -> CadenzaResult<Self> {
        let root = singer
            .location()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| singer.location().to_path_buf());
        let paused = Arc::new(AtomicBool::new(false));
        let disposed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let os_watch = Arc::new(Mutex::new(Some(make_watcher(
            tx.clone(),
            Arc::clone(&paused),
            &root,
        )?)));

        let task = tokio::spawn(debounce_loop(DebounceContext {
            registry,
            singer,
            root: root.clone(),
            debounce,
            paused: Arc::clone(&paused),
            disposed: Arc::clone(&disposed),
            os_watch: Arc::clone(&os_watch),
            tx,
            rx,
        }));

        Ok(Self {
            root,
            paused,
            disposed,
            os_watch,
            task: Mutex::new(Some(task)),
        })
    }

    /// Folder being watched
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Suppress event handling; the OS watch stays attached
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume event handling
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear down: cancel any pending timer and detach the OS watch.
    /// Idempotent; safe to call repeatedly.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.os_watch.lock() = None;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("watcher for {} disposed", self.root.display());
    }
}

impl Drop for SingerWatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for SingerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingerWatcher")
            .field("root", &self.root)
            .field("paused", &self.paused)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

struct DebounceContext {
    registry: Arc<SingerRegistry>,
    singer: Arc<Singer>,
    root: PathBuf,
    debounce: Duration,
    paused: Arc<AtomicBool>,
    disposed: Arc<AtomicBool>,
    os_watch: Arc<Mutex<Option<RecommendedWatcher>>>,
    tx: mpsc::UnboundedSender<WatchSignal>,
    rx: mpsc::UnboundedReceiver<WatchSignal>,
}

async fn debounce_loop(mut ctx: DebounceContext) {
    let mut restart_attempted = false;
    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        let signal = match deadline {
            Some(when) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(when) => {
                        deadline = None;
                        if ctx.disposed.load(Ordering::SeqCst) {
                            break;
                        }
                        if !ctx.paused.load(Ordering::SeqCst) {
                            debug!(
                                "change in {} settled; requesting reload of '{}'",
                                ctx.root.display(),
                                ctx.singer.id()
                            );
                            ctx.registry.schedule_reload(&ctx.singer);
                        }
                        continue;
                    }
                    signal = ctx.rx.recv() => signal,
                }
            }
            None => ctx.rx.recv().await,
        };
        match signal {
            Some(WatchSignal::Change) => {
                if !ctx.paused.load(Ordering::SeqCst) {
                    // Sliding window: every event restarts the full interval
                    deadline = Some(tokio::time::Instant::now() + ctx.debounce);
                }
            }
            Some(WatchSignal::Failure) => {
                if !restart_watch(&mut restart_attempted, &ctx) {
                    break;
                }
            }
            None => break,
        }
    }
}

/// One self-restart of the OS-level watch; a second failure goes inert.
fn restart_watch(restart_attempted: &mut bool, ctx: &DebounceContext) -> bool {
    if *restart_attempted {
        error!(
            "watcher for {} failed again; giving up until reconstructed",
            ctx.root.display()
        );
        *ctx.os_watch.lock() = None;
        return false;
    }
    *restart_attempted = true;
    match make_watcher(ctx.tx.clone(), Arc::clone(&ctx.paused), &ctx.root) {
        Ok(watcher) => {
            warn!("watcher for {} restarted after error", ctx.root.display());
            *ctx.os_watch.lock() = Some(watcher);
            true
        }
        Err(err) => {
            error!(
                "could not restart watcher for {}: {err}; giving up",
                ctx.root.display()
            );
            *ctx.os_watch.lock() = None;
            false
        }
    }
}

fn make_watcher(
    tx: mpsc::UnboundedSender<WatchSignal>,
    paused: Arc<AtomicBool>,
    root: &Path,
) -> CadenzaResult<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if paused.load(Ordering::SeqCst) {
                    return;
                }
                if is_relevant(&event) {
                    let _ = tx.send(WatchSignal::Change);
                }
            }
            Err(err) => {
                warn!("filesystem watcher error: {err}");
                let _ = tx.send(WatchSignal::Failure);
            }
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Create/modify/remove/rename of a definition-shaped file; sample audio
/// writes do not trigger reloads.
fn is_relevant(event: &Event) -> bool {
    let kind_ok = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    );
    kind_ok && event.paths.iter().any(|path| is_definition_file(path))
}

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("txt" | "ini" | "yaml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, ReloadNotifier};
    use crate::retry::RetryPolicy;
    use crate::voicebank::{SingerType, Voicebank, VoicebankParser};

    #[derive(Debug)]
    struct EmptyBankParser;

    impl VoicebankParser for EmptyBankParser {
        fn parse(&self, location: &Path) -> CadenzaResult<Voicebank> {
            std::fs::read_to_string(location)?;
            Ok(Voicebank::new("Watched", SingerType::Utau))
        }
    }

    #[derive(Debug, Default)]
    struct CountingNotifier {
        succeeded: Mutex<u32>,
    }

    impl ReloadNotifier for CountingNotifier {
        fn reload_succeeded(&self, _singer_id: &str, _attempts: u32) {
            *self.succeeded.lock() += 1;
        }

        fn reload_failed(&self, _singer_id: &str, _reason: &str) {}
    }

    async fn watched_registry(
        dir: &Path,
    ) -> (Arc<SingerRegistry>, Arc<Singer>, Arc<CountingNotifier>) {
        let root = dir.join("singers");
        let singer_dir = root.join("teto");
        std::fs::create_dir_all(&singer_dir).unwrap();
        std::fs::write(singer_dir.join("character.txt"), "name=Teto").unwrap();

        let notifier = Arc::new(CountingNotifier::default());
        let config = RegistryConfig {
            search_roots: vec![root],
            cache_path: dir.join("cache").join("singers.json"),
            debounce: Duration::from_millis(10),
            retry: RetryPolicy::new(3, Duration::ZERO),
        };
        let registry = Arc::new(SingerRegistry::with_notifier(
            config,
            Arc::new(EmptyBankParser),
            Arc::clone(&notifier) as Arc<dyn ReloadNotifier>,
        ));
        registry.search_all().await;
        let singer = registry.get_singer("teto").expect("teto should exist");
        (registry, singer, notifier)
    }

    fn touch_definition(singer: &Singer, content: &str) {
        std::fs::write(singer.location(), content).unwrap();
    }

    async fn wait_for_reloads(notifier: &CountingNotifier, expected: u32) -> bool {
        for _ in 0..100 {
            if *notifier.succeeded.lock() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_definition_file_filter() {
        assert!(is_definition_file(Path::new("bank/oto.ini")));
        assert!(is_definition_file(Path::new("bank/character.txt")));
        assert!(is_definition_file(Path::new("bank/dsconfig.yaml")));
        assert!(!is_definition_file(Path::new("bank/sample.wav")));
        assert!(!is_definition_file(Path::new("bank/noext")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_burst_coalesces_into_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, singer, notifier) = watched_registry(dir.path()).await;
        let watcher = SingerWatcher::spawn(
            Arc::clone(&registry),
            Arc::clone(&singer),
            Duration::from_millis(150),
        )
        .expect("watcher should start");

        for i in 0..4 {
            touch_definition(&singer, &format!("name=Teto{i}"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(wait_for_reloads(&notifier, 1).await, "reload should fire");
        // Quiet period: the burst produced exactly one cycle
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*notifier.succeeded.lock(), 1);
        watcher.dispose();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_paused_watcher_suppresses_events() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, singer, notifier) = watched_registry(dir.path()).await;
        let watcher = SingerWatcher::spawn(
            Arc::clone(&registry),
            Arc::clone(&singer),
            Duration::from_millis(50),
        )
        .expect("watcher should start");

        watcher.pause();
        assert!(watcher.is_paused());
        touch_definition(&singer, "name=Muted");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*notifier.succeeded.lock(), 0);

        watcher.resume();
        touch_definition(&singer, "name=Audible");
        assert!(wait_for_reloads(&notifier, 1).await, "resume should handle events");
        watcher.dispose();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, singer, notifier) = watched_registry(dir.path()).await;
        let watcher = SingerWatcher::spawn(
            Arc::clone(&registry),
            Arc::clone(&singer),
            Duration::from_millis(50),
        )
        .expect("watcher should start");

        watcher.dispose();
        watcher.dispose();
        assert!(watcher.is_disposed());

        touch_definition(&singer, "name=Gone");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*notifier.succeeded.lock(), 0);
    }
}
