//! # Cadenza Core
//!
//! Resource-lifecycle core for UTAU-style voice-synthesis singer assets.
//!
//! ## Features
//!
//! - Concurrent singer discovery across prioritized search roots
//! - Descriptor cache with modification-time staleness checks
//! - Debounced, retrying reload scheduling on external file change
//! - Memory reclamation for singers no longer used by the open project
//! - Resampler/wavtool registries with guaranteed built-in fallback
//!
//! ## Example
//!
//! ```rust,no_run
//! use cadenza_core::{RegistryConfig, SingerRegistry, SingerWatcher};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[derive(Debug)] struct MyParser;
//! # impl cadenza_core::VoicebankParser for MyParser {
//! #     fn parse(&self, _location: &std::path::Path)
//! #         -> cadenza_core::CadenzaResult<cadenza_core::Voicebank> { unimplemented!() }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(SingerRegistry::new(
//!         RegistryConfig::default(),
//!         Arc::new(MyParser),
//!     ));
//!     registry.search_all().await;
//!
//!     if let Some(singer) = registry.get_singer("teto") {
//!         let _watcher = SingerWatcher::spawn(
//!             Arc::clone(&registry),
//!             singer,
//!             Duration::from_millis(cadenza_core::DEFAULT_WATCH_DEBOUNCE_MS),
//!         );
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod error;
pub mod registry;
pub mod retry;
pub mod tools;
pub mod voicebank;
pub mod watcher;

// Re-export main types for convenience
pub use cache::{Descriptor, MetadataCache};
pub use error::{CadenzaError, CadenzaResult};
pub use registry::{
    LogNotifier, Project, RegistryConfig, ReloadNotifier, Singer, SingerRegistry, Track,
};
pub use retry::{Retried, RetryPolicy};
pub use tools::{ToolDescriptor, ToolKind, ToolManager, ToolRegistry};
pub use voicebank::{Oto, OtoSet, SingerType, Voicebank, VoicebankParser};
pub use watcher::SingerWatcher;

/// Version information for the cadenza-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sliding debounce for watcher-driven reload requests (ms)
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 500;

/// Default coalescing delay before a scheduled reload cycle fires (ms)
pub const DEFAULT_RELOAD_DEBOUNCE_MS: u64 = 200;

/// Default bounded attempt count for one singer reload
pub const DEFAULT_RELOAD_ATTEMPTS: u32 = 5;

/// Default fixed delay between reload attempts (ms)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 300;

/// Placeholder token stripped from singer lookups; the editor writes it
/// into tracks that have no singer assigned yet
pub const VOICE_PLACEHOLDER: &str = "%VOICE%";
