//! Voicebank value model: timing entries, entry sets and derived queries.
//!
//! These types are produced by an external definition-file parser and are
//! treated as values afterwards: parse-time validity is fixed at load, and
//! every aggregate query is computed on demand from the owned sets so a
//! reload that swaps the sets keeps all derived answers consistent.

use crate::error::CadenzaResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Synthesis backend selector for a singer folder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SingerType {
    /// Classic concatenative voicebank driven by oto timing entries
    Utau,
    /// Machine-learned bank configured by a dsconfig manifest
    Diffsinger,
    /// Packaged Vogen bank
    Vogen,
}

impl SingerType {
    /// Detect the backend for a singer folder from its marker file.
    ///
    /// Machine-learned markers take precedence because those banks often
    /// carry a classic `character.txt` alongside for display metadata.
    #[must_use]
    pub fn detect(dir: &Path) -> Option<Self> {
        if dir.join("dsconfig.yaml").is_file() {
            Some(Self::Diffsinger)
        } else if dir.join("voicebank.vogeon").is_file() {
            Some(Self::Vogen)
        } else if dir.join("character.txt").is_file() {
            Some(Self::Utau)
        } else {
            None
        }
    }

    /// Path of the primary definition file for this backend inside `dir`
    #[must_use]
    pub fn definition_file(&self, dir: &Path) -> PathBuf {
        match self {
            Self::Utau => dir.join("character.txt"),
            Self::Diffsinger => dir.join("dsconfig.yaml"),
            Self::Vogen => dir.join("voicebank.vogeon"),
        }
    }
}

impl std::fmt::Display for SingerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utau => write!(f, "Utau"),
            Self::Diffsinger => write!(f, "Diffsinger"),
            Self::Vogen => write!(f, "Vogen"),
        }
    }
}

/// One phoneme-timing record inside an [`OtoSet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oto {
    /// Alias the entry is looked up by
    pub alias: String,
    /// Source audio file the entry cuts from
    pub wav: String,
    /// Left offset into the source audio, in milliseconds
    pub offset: f64,
    /// Fixed consonant length, in milliseconds
    pub consonant: f64,
    /// Right cutoff; negative is the sentinel for "measure from the
    /// consonant plus stretched region", not an error
    pub cutoff: f64,
    /// Pre-utterance lead-in, in milliseconds
    pub preutterance: f64,
    /// Overlap with the previous note, in milliseconds
    pub overlap: f64,
    valid: bool,
    error: Option<String>,
}

impl Oto {
    /// Create a parse-valid entry with zeroed timing
    #[must_use]
    pub fn new<S: Into<String>>(alias: S, wav: S) -> Self {
        Self {
            alias: alias.into(),
            wav: wav.into(),
            offset: 0.0,
            consonant: 0.0,
            cutoff: 0.0,
            preutterance: 0.0,
            overlap: 0.0,
            valid: true,
            error: None,
        }
    }

    /// Create an entry whose record was malformed at parse time
    #[must_use]
    pub fn invalid<S: Into<String>>(alias: S, wav: S, message: S) -> Self {
        Self {
            alias: alias.into(),
            wav: wav.into(),
            offset: 0.0,
            consonant: 0.0,
            cutoff: 0.0,
            preutterance: 0.0,
            overlap: 0.0,
            valid: false,
            error: Some(message.into()),
        }
    }

    /// Set the five timing fields
    #[must_use]
    pub fn with_timing(
        mut self,
        offset: f64,
        consonant: f64,
        cutoff: f64,
        preutterance: f64,
        overlap: f64,
    ) -> Self {
        self.offset = offset;
        self.consonant = consonant;
        self.cutoff = cutoff;
        self.preutterance = preutterance;
        self.overlap = overlap;
        self
    }

    /// Whether the source record was syntactically well-formed
    #[must_use]
    pub fn is_parse_valid(&self) -> bool {
        self.valid
    }

    /// Parse-time failure message, if the record was malformed
    #[must_use]
    pub fn parse_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Semantic timing check, independent of parse-time validity.
    ///
    /// Offset, consonant length, pre-utterance and overlap must each be
    /// non-negative; cutoff is exempt. A violation is a warning for the
    /// editing surface, not a load error.
    pub fn validate_timing(&self) -> Result<(), String> {
        for (field, value) in [
            ("offset", self.offset),
            ("consonant", self.consonant),
            ("cutoff", self.cutoff),
            ("preutterance", self.preutterance),
            ("overlap", self.overlap),
        ] {
            if !value.is_finite() {
                return Err(format!("{field} is not a finite number"));
            }
        }
        for (field, value) in [
            ("offset", self.offset),
            ("consonant", self.consonant),
            ("preutterance", self.preutterance),
            ("overlap", self.overlap),
        ] {
            if value < 0.0 {
                return Err(format!("{field} must be non-negative, got {value}"));
            }
        }
        Ok(())
    }

    /// Convenience wrapper around [`Oto::validate_timing`]
    #[must_use]
    pub fn is_timing_valid(&self) -> bool {
        self.validate_timing().is_ok()
    }
}

/// The entries originating from one definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtoSet {
    /// Definition file the entries were parsed from
    pub file: PathBuf,
    /// Entries in file order
    pub entries: Vec<Oto>,
}

impl OtoSet {
    /// Create a set for one definition file
    #[must_use]
    pub fn new(file: PathBuf, entries: Vec<Oto>) -> Self {
        Self { file, entries }
    }
}

/// An aggregate voicebank: one or more entry sets plus display metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voicebank {
    /// Localized display name
    pub name: String,
    /// Backend the bank is rendered with
    pub singer_type: SingerType,
    /// Entry sets in definition-file order
    pub sets: Vec<OtoSet>,
}

impl Voicebank {
    /// Create an empty voicebank
    #[must_use]
    pub fn new<S: Into<String>>(name: S, singer_type: SingerType) -> Self {
        Self {
            name: name.into(),
            singer_type,
            sets: Vec::new(),
        }
    }

    /// Total entry count across all sets
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.sets.iter().map(|set| set.entries.len()).sum()
    }

    /// Count of parse-valid entries
    #[must_use]
    pub fn valid_entry_count(&self) -> usize {
        self.entries().filter(|oto| oto.is_parse_valid()).count()
    }

    /// Count of parse-invalid entries
    #[must_use]
    pub fn invalid_entry_count(&self) -> usize {
        self.entries().filter(|oto| !oto.is_parse_valid()).count()
    }

    /// Whether any set holds at least one entry
    #[must_use]
    pub fn has_entries(&self) -> bool {
        self.sets.iter().any(|set| !set.entries.is_empty())
    }

    /// First entry matching `alias`, in set order then file order
    #[must_use]
    pub fn find_by_alias(&self, alias: &str) -> Option<&Oto> {
        self.entries().find(|oto| oto.alias == alias)
    }

    /// All parse-invalid entries, with their messages reachable via
    /// [`Oto::parse_error`]
    #[must_use]
    pub fn invalid_entries(&self) -> Vec<&Oto> {
        self.entries().filter(|oto| !oto.is_parse_valid()).collect()
    }

    /// Aliases appearing more than once, grouped with their entries
    #[must_use]
    pub fn duplicate_aliases(&self) -> BTreeMap<&str, Vec<&Oto>> {
        let mut groups: BTreeMap<&str, Vec<&Oto>> = BTreeMap::new();
        for oto in self.entries() {
            groups.entry(oto.alias.as_str()).or_default().push(oto);
        }
        groups.retain(|_, otos| otos.len() > 1);
        groups
    }

    fn entries(&self) -> impl Iterator<Item = &Oto> {
        self.sets.iter().flat_map(|set| set.entries.iter())
    }
}

/// External definition-file parser seam.
///
/// Parsing raw definition files into sets, including computing parse-time
/// validity, happens outside this crate; the lifecycle core only schedules
/// when parsing runs.
pub trait VoicebankParser: Send + Sync + std::fmt::Debug {
    /// Parse the voicebank whose primary definition file is at `location`
    ///
    /// # Errors
    ///
    /// Returns an error if the definition file cannot be read at all;
    /// malformed individual records are reported per entry instead.
    fn parse(&self, location: &Path) -> CadenzaResult<Voicebank>;
}
