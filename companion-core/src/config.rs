//! Engine configuration.
//!
//! Everything has a working default; `from_env` layers `COMPANION_*`
//! environment variables on top for deployments.

use crate::memory::RankingKind;
use crate::store::DEFAULT_BULK_PREFIX;
use std::path::PathBuf;
use std::time::Duration;

/// Number of memories surfaced per turn.
pub const DEFAULT_MEMORY_LIMIT: usize = 5;

/// Maximum characters of a memory summary shown to the model.
pub const DEFAULT_SUMMARY_CAP: usize = 60;

/// Profile edits kept per identity.
pub const DEFAULT_PROFILE_HISTORY: usize = 20;

/// Turns kept in a stored transcript.
pub const DEFAULT_TRANSCRIPT_LIMIT: usize = 200;

/// A song switch younger than this is called out to the model.
pub const DEFAULT_SONG_CHANGE_WINDOW: Duration = Duration::from_secs(30);

/// Storage backend settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Byte budget for the key/value layer. `None` means unbounded.
    pub quota_bytes: Option<usize>,
    /// Key prefixes that mark evictable bulk records.
    pub bulk_prefixes: Vec<String>,
    /// Upper bound on a single store call.
    pub op_timeout: Option<Duration>,
    /// SQLite connection pool size.
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            bulk_prefixes: vec![DEFAULT_BULK_PREFIX.to_string()],
            op_timeout: None,
            pool_size: 4,
        }
    }
}

impl StoreConfig {
    pub fn with_quota_bytes(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn with_bulk_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bulk_prefixes.push(prefix.into());
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = Some(timeout);
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size.max(1);
        self
    }
}

/// Configuration for a companion engine.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Storage settings.
    pub store: StoreConfig,
    /// SQLite database file. `None` keeps everything in memory.
    pub sqlite_path: Option<PathBuf>,
    /// Memories surfaced per turn.
    pub memory_limit: usize,
    /// Character cap on each surfaced memory summary.
    pub summary_cap: usize,
    /// Memory ranking policy.
    pub ranking: RankingKind,
    /// Profile edits kept per identity.
    pub profile_history_len: usize,
    /// Turns kept per stored transcript.
    pub transcript_limit: usize,
    /// How recent a song switch must be to mention it.
    pub song_change_window: Duration,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sqlite_path: None,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            summary_cap: DEFAULT_SUMMARY_CAP,
            ranking: RankingKind::Recency,
            profile_history_len: DEFAULT_PROFILE_HISTORY,
            transcript_limit: DEFAULT_TRANSCRIPT_LIMIT,
            song_change_window: DEFAULT_SONG_CHANGE_WINDOW,
        }
    }
}

impl CompanionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `COMPANION_*` environment variables.
    ///
    /// Recognized: `COMPANION_DB_PATH`, `COMPANION_MEMORY_LIMIT`,
    /// `COMPANION_SUMMARY_CAP`, `COMPANION_RANKING` (`recency`,
    /// `importance`, or `tags:a,b`), `COMPANION_QUOTA_BYTES`,
    /// `COMPANION_STORE_TIMEOUT_MS`, `COMPANION_TRANSCRIPT_LIMIT`.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("COMPANION_DB_PATH") {
            config.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(limit) = env_parse::<usize>("COMPANION_MEMORY_LIMIT") {
            config.memory_limit = limit;
        }
        if let Some(cap) = env_parse::<usize>("COMPANION_SUMMARY_CAP") {
            config.summary_cap = cap;
        }
        if let Ok(raw) = std::env::var("COMPANION_RANKING") {
            match RankingKind::parse(&raw) {
                Some(kind) => config.ranking = kind,
                None => tracing::warn!(value = %raw, "ignoring unknown COMPANION_RANKING"),
            }
        }
        if let Some(bytes) = env_parse::<usize>("COMPANION_QUOTA_BYTES") {
            config.store.quota_bytes = Some(bytes);
        }
        if let Some(ms) = env_parse::<u64>("COMPANION_STORE_TIMEOUT_MS") {
            config.store.op_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(limit) = env_parse::<usize>("COMPANION_TRANSCRIPT_LIMIT") {
            config.transcript_limit = limit;
        }

        config
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_summary_cap(mut self, cap: usize) -> Self {
        self.summary_cap = cap;
        self
    }

    pub fn with_ranking(mut self, ranking: RankingKind) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn with_profile_history_len(mut self, len: usize) -> Self {
        self.profile_history_len = len;
        self
    }

    pub fn with_transcript_limit(mut self, limit: usize) -> Self {
        self.transcript_limit = limit;
        self
    }

    pub fn with_song_change_window(mut self, window: Duration) -> Self {
        self.song_change_window = window;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
