//! Hypebot Content Tables
//!
//! JSON-backed reply pools (keywords, idle, general, scheduled) with
//! atomic swap on reload. Reads never see a partially-updated table:
//! each table lives behind an `Arc` that a successful reload replaces
//! in one pointer swap, while a failed reload keeps the previous table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: expected {expected}")]
    Shape { path: PathBuf, expected: &'static str },
}

/// Keyword -> replies table. Entries keep the key order of the file they
/// were loaded from, so "first match wins" follows the order the operator
/// wrote. Keys starting with '@' only match as a whole mention token;
/// every other key matches as a case-insensitive substring.
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    entries: Vec<(String, Vec<String>)>,
}

impl KeywordTable {
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the first configured keyword found in `text`, with its
    /// reply pool. At most one keyword matches per message.
    pub fn match_keyword(&self, text: &str) -> Option<(&str, &[String])> {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '@' || c == '_'))
            .filter(|t| !t.is_empty())
            .collect();

        for (key, replies) in &self.entries {
            let key_lower = key.to_lowercase();
            let hit = if key_lower.starts_with('@') {
                tokens.iter().any(|t| *t == key_lower)
            } else {
                lower.contains(&key_lower)
            };
            if hit {
                return Some((key.as_str(), replies.as_slice()));
            }
        }
        None
    }
}

pub type Pool = Vec<String>;
pub type SlotPools = HashMap<String, Vec<String>>;

pub struct ContentPaths {
    pub keywords: PathBuf,
    pub idle: PathBuf,
    pub general: PathBuf,
    pub scheduled: PathBuf,
}

/// Owner of every loaded content table. Shared read access, reload
/// swaps one table at a time.
pub struct ContentStore {
    paths: ContentPaths,
    keywords: RwLock<Arc<KeywordTable>>,
    idle: RwLock<Arc<Pool>>,
    general: RwLock<Arc<Pool>>,
    scheduled: RwLock<Arc<SlotPools>>,
}

impl ContentStore {
    /// Loads every table, falling back to the built-in defaults for any
    /// file that is missing or unreadable (a warning, not a failure --
    /// startup must succeed even with no content files on disk).
    pub fn load(paths: ContentPaths) -> Self {
        let keywords = match load_keywords(&paths.keywords) {
            Ok(table) => table,
            Err(e) => {
                warn!("using built-in keywords: {}", e);
                default_keywords()
            }
        };
        let idle = match load_pool(&paths.idle) {
            Ok(pool) => pool,
            Err(e) => {
                warn!("using built-in idle messages: {}", e);
                default_idle_pool()
            }
        };
        let general = match load_pool(&paths.general) {
            Ok(pool) => pool,
            Err(e) => {
                warn!("using built-in general replies: {}", e);
                default_general_pool()
            }
        };
        let scheduled = match load_slot_pools(&paths.scheduled) {
            Ok(pools) => pools,
            Err(e) => {
                warn!("using built-in scheduled messages: {}", e);
                default_slot_pools()
            }
        };

        Self {
            paths,
            keywords: RwLock::new(Arc::new(keywords)),
            idle: RwLock::new(Arc::new(idle)),
            general: RwLock::new(Arc::new(general)),
            scheduled: RwLock::new(Arc::new(scheduled)),
        }
    }

    pub fn keywords(&self) -> Arc<KeywordTable> {
        Arc::clone(&read(&self.keywords))
    }

    pub fn idle_pool(&self) -> Arc<Pool> {
        Arc::clone(&read(&self.idle))
    }

    pub fn general_pool(&self) -> Arc<Pool> {
        Arc::clone(&read(&self.general))
    }

    pub fn slot_pool(&self, slot: &str) -> Option<Vec<String>> {
        read(&self.scheduled).get(slot).cloned()
    }

    /// Reloads the keyword table from disk. On failure the previous
    /// table keeps serving and the error is returned to the caller.
    pub fn reload_keywords(&self) -> Result<usize, ReloadError> {
        let table = load_keywords(&self.paths.keywords)?;
        let count = table.len();
        *write(&self.keywords) = Arc::new(table);
        Ok(count)
    }

    pub fn reload_idle(&self) -> Result<usize, ReloadError> {
        let pool = load_pool(&self.paths.idle)?;
        let count = pool.len();
        *write(&self.idle) = Arc::new(pool);
        Ok(count)
    }

    pub fn reload_general(&self) -> Result<usize, ReloadError> {
        let pool = load_pool(&self.paths.general)?;
        let count = pool.len();
        *write(&self.general) = Arc::new(pool);
        Ok(count)
    }

    pub fn reload_scheduled(&self) -> Result<usize, ReloadError> {
        let pools = load_slot_pools(&self.paths.scheduled)?;
        let count = pools.len();
        *write(&self.scheduled) = Arc::new(pools);
        Ok(count)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_json(path: &Path) -> Result<serde_json::Value, ReloadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ReloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ReloadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a keyword->replies mapping. Non-string reply entries are
/// filtered out; a value that is not a list of strings drops the key, as
/// does an empty key (an empty substring would match every message).
pub fn load_keywords(path: &Path) -> Result<KeywordTable, ReloadError> {
    let value = read_json(path)?;
    let obj = value.as_object().ok_or(ReloadError::Shape {
        path: path.to_path_buf(),
        expected: "a JSON object mapping keyword to list of replies",
    })?;

    let mut entries = Vec::new();
    for (key, replies) in obj {
        if key.trim().is_empty() {
            warn!("dropping empty keyword key");
            continue;
        }
        match replies.as_array() {
            Some(items) => {
                let replies: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                entries.push((key.clone(), replies));
            }
            None => {
                warn!("dropping keyword '{}': replies are not a list", key);
            }
        }
    }
    Ok(KeywordTable::new(entries))
}

/// Loads a flat message pool (idle or general replies).
pub fn load_pool(path: &Path) -> Result<Pool, ReloadError> {
    let value = read_json(path)?;
    let items = value.as_array().ok_or(ReloadError::Shape {
        path: path.to_path_buf(),
        expected: "a JSON list of strings",
    })?;
    Ok(items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Loads the per-slot scheduled message pools.
pub fn load_slot_pools(path: &Path) -> Result<SlotPools, ReloadError> {
    let value = read_json(path)?;
    let obj = value.as_object().ok_or(ReloadError::Shape {
        path: path.to_path_buf(),
        expected: "a JSON object mapping slot name to list of messages",
    })?;

    let mut pools = SlotPools::new();
    for (slot, messages) in obj {
        match messages.as_array() {
            Some(items) => {
                pools.insert(
                    slot.clone(),
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                );
            }
            None => {
                warn!("dropping slot '{}': messages are not a list", slot);
            }
        }
    }
    Ok(pools)
}

pub fn default_keywords() -> KeywordTable {
    KeywordTable::new(vec![
        (
            "moon".to_string(),
            vec![
                "To the moon, fam!".to_string(),
                "Moon mode engaged, strap in!".to_string(),
            ],
        ),
        (
            "hodl".to_string(),
            vec![
                "HODL strong!".to_string(),
                "Diamond hands only here.".to_string(),
            ],
        ),
        (
            "lfg".to_string(),
            vec![
                "LFG! Unstoppable!".to_string(),
                "Let's gooo, fam!".to_string(),
            ],
        ),
    ])
}

pub fn default_idle_pool() -> Pool {
    vec![
        "What's everyone holding today?".to_string(),
        "Quiet in here... who's still around?".to_string(),
        "Drop a message if you're awake!".to_string(),
    ]
}

pub fn default_general_pool() -> Pool {
    vec![
        "Love the energy in here!".to_string(),
        "This community never sleeps.".to_string(),
        "Stay strong, fam!".to_string(),
    ]
}

pub fn default_slot_pools() -> SlotPools {
    let mut pools = SlotPools::new();
    pools.insert(
        "morning".to_string(),
        vec!["Good morning, fam! Let's make it count.".to_string()],
    );
    pools.insert(
        "noon".to_string(),
        vec!["Midday check-in: how's everyone doing?".to_string()],
    );
    pools.insert(
        "night".to_string(),
        vec!["Wrapping up the day. See you tomorrow!".to_string()],
    );
    pools
}
