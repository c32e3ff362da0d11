//! Hypebot State Store
//!
//! Durable per-chat state: runtime overrides, activity timestamps, and
//! scheduled-slot bookkeeping. The store owns the authoritative in-memory
//! map and is the single writer of the JSON snapshot on disk; every
//! mutation is serialized through the store lock and triggers a
//! best-effort persist (write-temp-then-rename, so a crash mid-write
//! never corrupts the snapshot).

use chrono::{DateTime, Duration, NaiveDate, Utc};
use hypebot_config::{EngineDefaults, CALMDOWN_EXTRA_SECS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write state snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode state snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum OverrideError {
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
}

/// Per-chat runtime state. Override fields are `None` when the chat
/// falls back to the global defaults. `cooldown_extra_until` is the one
/// transient field: it never reaches the snapshot and a restart clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatState {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_prob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_prob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_prob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u32>,
    #[serde(skip)]
    pub cooldown_extra_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_send_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mention_reply_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hype_active: bool,
    pub last_activity_at: DateTime<Utc>,
}

impl ChatState {
    /// Fresh state for a chat seen for the first time: no overrides,
    /// inactive until `/start`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active: false,
            idle_minutes: None,
            keyword_prob: None,
            mention_prob: None,
            reply_prob: None,
            cooldown_secs: None,
            cooldown_extra_until: None,
            last_send_at: None,
            last_mention_reply_at: None,
            hype_active: false,
            last_activity_at: now,
        }
    }

    pub fn effective_idle_minutes(&self, defaults: &EngineDefaults) -> u32 {
        self.idle_minutes.unwrap_or(defaults.idle_minutes)
    }

    pub fn effective_keyword_prob(&self, defaults: &EngineDefaults) -> f64 {
        self.keyword_prob.unwrap_or(defaults.keyword_prob)
    }

    pub fn effective_mention_prob(&self, defaults: &EngineDefaults) -> f64 {
        self.mention_prob.unwrap_or(defaults.mention_prob)
    }

    pub fn effective_reply_prob(&self, defaults: &EngineDefaults) -> f64 {
        self.reply_prob.unwrap_or(defaults.general_prob)
    }

    pub fn effective_cooldown_secs(&self, defaults: &EngineDefaults) -> u32 {
        self.cooldown_secs.unwrap_or(defaults.cooldown_secs)
    }

    /// Idle deadline: the last moment anyone (user or bot) touched the
    /// chat, plus the effective idle interval.
    pub fn idle_deadline(&self, defaults: &EngineDefaults) -> DateTime<Utc> {
        let last_touch = match self.last_send_at {
            Some(sent) => sent.max(self.last_activity_at),
            None => self.last_activity_at,
        };
        last_touch + Duration::minutes(i64::from(self.effective_idle_minutes(defaults)))
    }
}

/// The closed set of runtime override operations a chat admin can apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Override {
    IdleMinutes(u32),
    Probability(ProbKind, f64),
    CooldownSecs(u32),
    Active(bool),
    HypeActive(bool),
    /// `/calmdown`: push the cooldown window end out by 40 seconds.
    ExtendCooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbKind {
    Keyword,
    Mention,
    Reply,
}

impl ProbKind {
    fn field(self) -> &'static str {
        match self {
            ProbKind::Keyword => "keyword probability",
            ProbKind::Mention => "mention probability",
            ProbKind::Reply => "reply probability",
        }
    }
}

/// Normalizes a probability input: [0, 1] is taken as-is, (1, 100] is
/// treated as a percentage, anything else is rejected. Clamping happens
/// here, at write time, never at read time.
fn normalize_prob(kind: ProbKind, raw: f64) -> Result<f64, OverrideError> {
    if !raw.is_finite() || raw < 0.0 || raw > 100.0 {
        return Err(OverrideError::OutOfRange {
            field: kind.field(),
            min: 0.0,
            max: 1.0,
        });
    }
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    Ok(value.clamp(0.0, 1.0))
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    chats: HashMap<String, ChatState>,
    #[serde(default)]
    slot_fires: HashMap<String, NaiveDate>,
}

struct StoreInner {
    chats: HashMap<i64, ChatState>,
    slot_fires: HashMap<String, NaiveDate>,
    dirty: bool,
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    /// Held across encode+write+rename so concurrent mutation-triggered
    /// persists cannot land on disk out of order.
    persist_lock: Mutex<()>,
    path: PathBuf,
}

impl StateStore {
    /// Loads the snapshot at `path` if present. A missing file starts
    /// empty; malformed individual entries are dropped with a warning,
    /// never fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut chats = HashMap::new();
        let mut slot_fires = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => {
                    if let Some(entries) = value.get("chats").and_then(|v| v.as_object()) {
                        for (key, entry) in entries {
                            let chat_id = match key.parse::<i64>() {
                                Ok(id) => id,
                                Err(_) => {
                                    warn!("dropping state entry with bad chat id '{}'", key);
                                    continue;
                                }
                            };
                            match serde_json::from_value::<ChatState>(entry.clone()) {
                                Ok(state) => {
                                    chats.insert(chat_id, state);
                                }
                                Err(e) => {
                                    warn!("dropping malformed state for chat {}: {}", chat_id, e);
                                }
                            }
                        }
                    }
                    if let Some(fires) = value.get("slot_fires").and_then(|v| v.as_object()) {
                        for (slot, date) in fires {
                            match serde_json::from_value::<NaiveDate>(date.clone()) {
                                Ok(d) => {
                                    slot_fires.insert(slot.clone(), d);
                                }
                                Err(e) => {
                                    warn!("dropping slot-fire record '{}': {}", slot, e);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("state snapshot {} unreadable, starting empty: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("cannot read state snapshot {}: {}", path.display(), e);
            }
        }

        Self {
            inner: Mutex::new(StoreInner {
                chats,
                slot_fires,
                dirty: false,
            }),
            persist_lock: Mutex::new(()),
            path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the chat's state, or a freshly materialized default
    /// (not yet persisted) if the chat has never been seen.
    pub fn get(&self, chat_id: i64, now: DateTime<Utc>) -> ChatState {
        self.lock()
            .chats
            .get(&chat_id)
            .cloned()
            .unwrap_or_else(|| ChatState::new(now))
    }

    /// Applies `f` to the chat's state under the store lock and returns
    /// the updated copy. Creates the chat on first touch. Triggers a
    /// best-effort persist; a persist failure is logged and retried on
    /// the next mutation, never surfaced to the caller.
    pub fn mutate<F>(&self, chat_id: i64, now: DateTime<Utc>, f: F) -> ChatState
    where
        F: FnOnce(&mut ChatState),
    {
        let updated = {
            let mut inner = self.lock();
            let state = inner
                .chats
                .entry(chat_id)
                .or_insert_with(|| ChatState::new(now));
            f(state);
            let snapshot = state.clone();
            inner.dirty = true;
            snapshot
        };
        self.persist_best_effort();
        updated
    }

    /// Validates and applies one override command. Rejected values leave
    /// the previous state untouched.
    pub fn apply_override(
        &self,
        chat_id: i64,
        cmd: Override,
        now: DateTime<Utc>,
    ) -> Result<ChatState, OverrideError> {
        match cmd {
            Override::IdleMinutes(minutes) => {
                if !(1..=1440).contains(&minutes) {
                    return Err(OverrideError::OutOfRange {
                        field: "idle minutes",
                        min: 1.0,
                        max: 1440.0,
                    });
                }
                Ok(self.mutate(chat_id, now, |s| s.idle_minutes = Some(minutes)))
            }
            Override::Probability(kind, raw) => {
                let prob = normalize_prob(kind, raw)?;
                Ok(self.mutate(chat_id, now, |s| match kind {
                    ProbKind::Keyword => s.keyword_prob = Some(prob),
                    ProbKind::Mention => s.mention_prob = Some(prob),
                    ProbKind::Reply => s.reply_prob = Some(prob),
                }))
            }
            Override::CooldownSecs(secs) => {
                if !(1..=3600).contains(&secs) {
                    return Err(OverrideError::OutOfRange {
                        field: "cooldown seconds",
                        min: 1.0,
                        max: 3600.0,
                    });
                }
                Ok(self.mutate(chat_id, now, |s| s.cooldown_secs = Some(secs)))
            }
            Override::Active(active) => Ok(self.mutate(chat_id, now, |s| {
                s.active = active;
                if active {
                    // Reactivation starts a clean idle window instead of
                    // firing off stale timestamps.
                    s.last_activity_at = now;
                }
            })),
            Override::HypeActive(enabled) => {
                Ok(self.mutate(chat_id, now, |s| s.hype_active = enabled))
            }
            Override::ExtendCooldown => Ok(self.mutate(chat_id, now, |s| {
                let floor = now + Duration::seconds(CALMDOWN_EXTRA_SECS);
                s.cooldown_extra_until = Some(match s.cooldown_extra_until {
                    Some(end) if end > floor => end,
                    _ => floor,
                });
            })),
        }
    }

    /// Every chat the store has ever materialized.
    pub fn chat_ids(&self) -> Vec<i64> {
        self.lock().chats.keys().copied().collect()
    }

    /// Chats opted in to scheduled broadcasts.
    pub fn hype_active_chats(&self) -> Vec<i64> {
        self.lock()
            .chats
            .iter()
            .filter(|(_, s)| s.hype_active)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn slot_last_fired(&self, slot: &str) -> Option<NaiveDate> {
        self.lock().slot_fires.get(slot).copied()
    }

    pub fn mark_slot_fired(&self, slot: &str, date: NaiveDate) {
        {
            let mut inner = self.lock();
            inner.slot_fires.insert(slot.to_string(), date);
            inner.dirty = true;
        }
        self.persist_best_effort();
    }

    /// Serializes the durable fields to disk, atomically replacing the
    /// previous snapshot. Transient fields are skipped by serde.
    pub fn persist(&self) -> Result<(), PersistError> {
        let _persisting = self
            .persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let encoded = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            let snapshot = Snapshot {
                chats: inner
                    .chats
                    .iter()
                    .map(|(id, s)| (id.to_string(), s.clone()))
                    .collect(),
                slot_fires: inner.slot_fires.clone(),
            };
            let encoded = serde_json::to_string(&snapshot)?;
            // Cleared at encode time: a mutation racing the write below
            // re-marks it, so the following persist rewrites the newer
            // state instead of returning early on a clean flag.
            inner.dirty = false;
            encoded
        };

        let tmp = self.path.with_extension("json.tmp");
        let write_result = std::fs::write(&tmp, encoded.as_bytes())
            .and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(source) = write_result {
            self.lock().dirty = true;
            return Err(PersistError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }

    fn persist_best_effort(&self) {
        if let Err(e) = self.persist() {
            warn!("state persist failed, will retry on next mutation: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_state_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("hypebot-state-{}-{}.json", name, ts))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().expect("t0")
    }

    #[test]
    fn unseen_chat_materializes_default_state() {
        let store = StateStore::load(temp_state_path("default"));
        let state = store.get(99, t0());
        assert!(!state.active);
        assert!(state.idle_minutes.is_none());
        assert_eq!(state.last_activity_at, t0());
        // Not persisted: the store still tracks no chats.
        assert!(store.chat_ids().is_empty());
    }

    #[test]
    fn persist_then_load_roundtrips_durable_fields() {
        let path = temp_state_path("roundtrip");
        let store = StateStore::load(&path);
        let now = t0();
        store
            .apply_override(7, Override::Active(true), now)
            .expect("activate");
        store
            .apply_override(7, Override::IdleMinutes(30), now)
            .expect("idle");
        store
            .apply_override(7, Override::Probability(ProbKind::Mention, 0.5), now)
            .expect("prob");
        store
            .apply_override(7, Override::ExtendCooldown, now)
            .expect("extend");
        store.mutate(7, now, |s| {
            s.last_send_at = Some(now);
            s.last_mention_reply_at = Some(now);
            s.hype_active = true;
        });

        let reloaded = StateStore::load(&path);
        let state = reloaded.get(7, now);
        assert!(state.active);
        assert_eq!(state.idle_minutes, Some(30));
        assert_eq!(state.mention_prob, Some(0.5));
        assert_eq!(state.last_send_at, Some(now));
        assert_eq!(state.last_mention_reply_at, Some(now));
        assert!(state.hype_active);
        assert_eq!(state.last_activity_at, now);
        // Transient field never survives a restart.
        assert!(state.cooldown_extra_until.is_none());
    }

    #[test]
    fn concurrent_overrides_reach_disk_intact() {
        let path = temp_state_path("concurrent");
        let store = std::sync::Arc::new(StateStore::load(&path));
        let now = t0();

        let handles: Vec<_> = (0..4i64)
            .map(|chat_id| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for minutes in 1..=50 {
                        store
                            .apply_override(chat_id, Override::IdleMinutes(minutes), now)
                            .expect("override");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let reloaded = StateStore::load(&path);
        for chat_id in 0..4 {
            assert_eq!(
                reloaded.get(chat_id, now).idle_minutes,
                store.get(chat_id, now).idle_minutes,
                "chat {} lost its newest override across restart",
                chat_id
            );
            assert_eq!(reloaded.get(chat_id, now).idle_minutes, Some(50));
        }
    }

    #[test]
    fn percentage_input_is_normalized_at_write() {
        let store = StateStore::load(temp_state_path("pct"));
        let state = store
            .apply_override(1, Override::Probability(ProbKind::Keyword, 75.0), t0())
            .expect("percentage accepted");
        assert_eq!(state.keyword_prob, Some(0.75));
    }

    #[test]
    fn out_of_range_probability_rejected_with_previous_retained() {
        let store = StateStore::load(temp_state_path("reject"));
        let now = t0();
        store
            .apply_override(1, Override::Probability(ProbKind::Reply, 0.6), now)
            .expect("valid");
        let err = store
            .apply_override(1, Override::Probability(ProbKind::Reply, 150.0), now)
            .expect_err("must reject");
        assert!(err.to_string().contains("reply probability"));
        assert_eq!(store.get(1, now).reply_prob, Some(0.6));
    }

    #[test]
    fn nan_probability_rejected() {
        let store = StateStore::load(temp_state_path("nan"));
        assert!(store
            .apply_override(1, Override::Probability(ProbKind::Keyword, f64::NAN), t0())
            .is_err());
    }

    #[test]
    fn idle_minutes_bounds_enforced() {
        let store = StateStore::load(temp_state_path("idle-bounds"));
        let now = t0();
        assert!(store.apply_override(1, Override::IdleMinutes(0), now).is_err());
        assert!(store.apply_override(1, Override::IdleMinutes(1441), now).is_err());
        assert!(store.apply_override(1, Override::IdleMinutes(1440), now).is_ok());
    }

    #[test]
    fn cooldown_bounds_enforced() {
        let store = StateStore::load(temp_state_path("cd-bounds"));
        let now = t0();
        assert!(store.apply_override(1, Override::CooldownSecs(0), now).is_err());
        assert!(store.apply_override(1, Override::CooldownSecs(3601), now).is_err());
        assert!(store.apply_override(1, Override::CooldownSecs(3600), now).is_ok());
    }

    #[test]
    fn extend_cooldown_stacks_by_taking_the_later_end() {
        let store = StateStore::load(temp_state_path("calmdown"));
        let now = t0();
        let state = store
            .apply_override(1, Override::ExtendCooldown, now)
            .expect("first");
        assert_eq!(state.cooldown_extra_until, Some(now + Duration::seconds(40)));

        let later = now + Duration::seconds(5);
        let state = store
            .apply_override(1, Override::ExtendCooldown, later)
            .expect("second");
        assert_eq!(
            state.cooldown_extra_until,
            Some(now + Duration::seconds(45)),
            "second /calmdown extends to max(40, 5+40) from t=0"
        );
    }

    #[test]
    fn reactivation_resets_activity_timestamp() {
        let store = StateStore::load(temp_state_path("reactivate"));
        let now = t0();
        store.mutate(1, now, |s| s.active = true);
        let later = now + Duration::minutes(90);
        let state = store
            .apply_override(1, Override::Active(true), later)
            .expect("reactivate");
        assert_eq!(state.last_activity_at, later);
    }

    #[test]
    fn malformed_entries_are_dropped_not_fatal() {
        let path = temp_state_path("malformed");
        std::fs::write(
            &path,
            r#"{"chats": {
                "100": {"active": true, "last_activity_at": "2025-06-01T00:00:00Z"},
                "not-a-number": {"active": true, "last_activity_at": "2025-06-01T00:00:00Z"},
                "200": {"active": "bogus"}
            }}"#,
        )
        .expect("seed snapshot");

        let store = StateStore::load(&path);
        let ids = store.chat_ids();
        assert_eq!(ids, vec![100]);
        assert!(store.get(100, t0()).active);
    }

    #[test]
    fn slot_fires_survive_restart() {
        let path = temp_state_path("slots");
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).expect("date");
        {
            let store = StateStore::load(&path);
            store.mutate(1, t0(), |s| s.hype_active = true);
            store.mark_slot_fired("noon", date);
        }
        let store = StateStore::load(&path);
        assert_eq!(store.slot_last_fired("noon"), Some(date));
        assert_eq!(store.slot_last_fired("morning"), None);
    }

    #[test]
    fn snapshot_on_disk_is_valid_json_without_transients() {
        let path = temp_state_path("shape");
        let store = StateStore::load(&path);
        let now = t0();
        store
            .apply_override(5, Override::ExtendCooldown, now)
            .expect("extend");
        let raw = std::fs::read_to_string(&path).expect("snapshot written");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid JSON");
        let chat = &value["chats"]["5"];
        assert!(chat.get("cooldown_extra_until").is_none());
        assert!(chat.get("last_activity_at").is_some());
    }
}
