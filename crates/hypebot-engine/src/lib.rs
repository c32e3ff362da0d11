//! Hypebot Engine
//!
//! The reply decision engine: probability-gated keyword / mention /
//! general triggers, the idle fire path, and scheduled-slot sends. Each
//! decision plus its cooldown bookkeeping runs inside a single state
//! mutation, so an idle sweep and a message handler can never interleave
//! on the same chat.

pub mod cooldown;

use chrono::{DateTime, Utc};
use hypebot_config::EngineDefaults;
use hypebot_content::ContentStore;
use hypebot_state::StateStore;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Keyword,
    Mention,
    General,
    Idle,
    Scheduled,
}

/// One decided outbound reply. The transport sends it; a transport
/// failure does not roll back the bookkeeping already recorded.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub trigger: Trigger,
}

pub struct ReplyEngine {
    defaults: EngineDefaults,
    content: Arc<ContentStore>,
    state: Arc<StateStore>,
    rng: Mutex<StdRng>,
}

impl ReplyEngine {
    pub fn new(defaults: EngineDefaults, content: Arc<ContentStore>, state: Arc<StateStore>) -> Self {
        Self {
            defaults,
            content,
            state,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded variant so probability draws and pool picks are
    /// reproducible in tests.
    pub fn with_rng_seed(
        defaults: EngineDefaults,
        content: Arc<ContentStore>,
        state: Arc<StateStore>,
        seed: u64,
    ) -> Self {
        Self {
            defaults,
            content,
            state,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decides whether an inbound message gets a reply.
    ///
    /// Paths in order, first success wins: keyword (first matching key
    /// only), mention (both cooldown gates, reuses the general pool),
    /// general. An inactive chat still gets its activity timestamp
    /// bumped so reactivation starts from a clean idle window.
    pub fn handle_message(
        &self,
        chat_id: i64,
        text: &str,
        is_mention: bool,
        now: DateTime<Utc>,
    ) -> Option<Reply> {
        let keywords = self.content.keywords();
        let general = self.content.general_pool();
        let mut rng = self.rng();
        let mut reply = None;

        self.state.mutate(chat_id, now, |s| {
            s.last_activity_at = now;
            cooldown::clear_lapsed(s, now);
            if !s.active {
                return;
            }

            let gate_open = cooldown::may_send(s, &self.defaults, now);

            if let Some((key, pool)) = keywords.match_keyword(text) {
                if rng.gen::<f64>() < s.effective_keyword_prob(&self.defaults) && gate_open {
                    if let Some(text) = pool.choose(&mut *rng) {
                        debug!(chat_id, key, "keyword reply");
                        cooldown::note_send(s, now, false);
                        reply = Some(Reply {
                            text: text.clone(),
                            trigger: Trigger::Keyword,
                        });
                        return;
                    }
                }
            }

            if is_mention
                && rng.gen::<f64>() < s.effective_mention_prob(&self.defaults)
                && gate_open
                && cooldown::may_send_mention(s, now)
            {
                if let Some(text) = general.choose(&mut *rng) {
                    debug!(chat_id, "mention reply");
                    cooldown::note_send(s, now, true);
                    reply = Some(Reply {
                        text: text.clone(),
                        trigger: Trigger::Mention,
                    });
                    return;
                }
            }

            if rng.gen::<f64>() < s.effective_reply_prob(&self.defaults) && gate_open {
                if let Some(text) = general.choose(&mut *rng) {
                    debug!(chat_id, "general reply");
                    cooldown::note_send(s, now, false);
                    reply = Some(Reply {
                        text: text.clone(),
                        trigger: Trigger::General,
                    });
                }
            }
        });

        reply
    }

    /// Fires one idle message if the chat is active, its deadline has
    /// elapsed, and the cooldown gate allows it. The deadline is derived
    /// from the last touch, so the recorded send resets it.
    pub fn try_idle_fire(&self, chat_id: i64, now: DateTime<Utc>) -> Option<Reply> {
        let snapshot = self.state.get(chat_id, now);
        if !snapshot.active
            || now < snapshot.idle_deadline(&self.defaults)
            || !cooldown::may_send(&snapshot, &self.defaults, now)
        {
            return None;
        }

        let pool = self.content.idle_pool();
        let mut rng = self.rng();
        let mut reply = None;

        self.state.mutate(chat_id, now, |s| {
            cooldown::clear_lapsed(s, now);
            // Re-checked under the lock: a message handled between the
            // snapshot and here may already have reset the deadline.
            if !s.active
                || now < s.idle_deadline(&self.defaults)
                || !cooldown::may_send(s, &self.defaults, now)
            {
                return;
            }
            if let Some(text) = pool.choose(&mut *rng) {
                debug!(chat_id, "idle fire");
                cooldown::note_send(s, now, false);
                reply = Some(Reply {
                    text: text.clone(),
                    trigger: Trigger::Idle,
                });
            }
        });

        reply
    }

    /// One scheduled-slot broadcast to one chat. Bypasses the cooldown
    /// gate (operator-configured sends are not reactive chatter) but
    /// records the send so idle and cooldown bookkeeping stay honest.
    pub fn scheduled_send(&self, chat_id: i64, slot: &str, now: DateTime<Utc>) -> Option<Reply> {
        let pool = self.content.slot_pool(slot)?;
        let mut rng = self.rng();
        let mut reply = None;

        self.state.mutate(chat_id, now, |s| {
            if !s.active {
                return;
            }
            if let Some(text) = pool.choose(&mut *rng) {
                debug!(chat_id, slot, "scheduled send");
                cooldown::note_send(s, now, false);
                reply = Some(Reply {
                    text: text.clone(),
                    trigger: Trigger::Scheduled,
                });
            }
        });

        reply
    }

    /// `/hype`: an immediate general-pool message, active-gated but
    /// bypassing probability and cooldown.
    pub fn hype_now(&self, chat_id: i64, now: DateTime<Utc>) -> Option<Reply> {
        let pool = self.content.general_pool();
        let mut rng = self.rng();
        let mut reply = None;

        self.state.mutate(chat_id, now, |s| {
            if !s.active {
                return;
            }
            if let Some(text) = pool.choose(&mut *rng) {
                cooldown::note_send(s, now, false);
                reply = Some(Reply {
                    text: text.clone(),
                    trigger: Trigger::General,
                });
            }
        });

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use hypebot_content::ContentPaths;
    use hypebot_state::{Override, ProbKind};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().expect("t0")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn temp_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("hypebot-engine-{}-{}", name, ts))
    }

    /// Engine over the built-in content tables (keywords include "moon")
    /// and a fresh temp-backed state store.
    fn engine(name: &str) -> ReplyEngine {
        engine_with_general(name, None)
    }

    fn engine_with_general(name: &str, general: Option<&str>) -> ReplyEngine {
        let general_path = match general {
            Some(json) => {
                let p = temp_path(&format!("{}-general.json", name));
                std::fs::write(&p, json).expect("write general pool");
                p
            }
            None => PathBuf::from("/nonexistent/general.json"),
        };
        let content = Arc::new(ContentStore::load(ContentPaths {
            keywords: PathBuf::from("/nonexistent/keywords.json"),
            idle: PathBuf::from("/nonexistent/idle.json"),
            general: general_path,
            scheduled: PathBuf::from("/nonexistent/scheduled.json"),
        }));
        let state = Arc::new(StateStore::load(temp_path(&format!("{}-state.json", name))));
        ReplyEngine::with_rng_seed(EngineDefaults::default(), content, state, 7)
    }

    fn activate(engine: &ReplyEngine, chat_id: i64, now: DateTime<Utc>) {
        engine
            .state()
            .apply_override(chat_id, Override::Active(true), now)
            .expect("activate");
    }

    fn set_prob(engine: &ReplyEngine, chat_id: i64, kind: ProbKind, p: f64) {
        engine
            .state()
            .apply_override(chat_id, Override::Probability(kind, p), t0())
            .expect("probability override");
    }

    #[test]
    fn keyword_reply_respects_cooldown_window() {
        let eng = engine("kw-cooldown");
        activate(&eng, 1, t0());
        set_prob(&eng, 1, ProbKind::Reply, 0.0);

        let first = eng.handle_message(1, "to the moon", false, at(0));
        assert_eq!(first.expect("reply at t=0").trigger, Trigger::Keyword);

        assert!(eng.handle_message(1, "to the moon", false, at(5)).is_none());

        let third = eng.handle_message(1, "to the moon", false, at(11));
        assert_eq!(third.expect("reply at t=11").trigger, Trigger::Keyword);
    }

    #[test]
    fn probability_zero_suppresses_every_path() {
        let eng = engine("prob-zero");
        activate(&eng, 1, t0());
        set_prob(&eng, 1, ProbKind::Keyword, 0.0);
        set_prob(&eng, 1, ProbKind::Mention, 0.0);
        set_prob(&eng, 1, ProbKind::Reply, 0.0);

        assert!(eng.handle_message(1, "moon!", true, at(0)).is_none());
        assert!(eng.handle_message(1, "hello", false, at(1)).is_none());
    }

    #[test]
    fn inactive_chat_gets_no_reply_but_activity_is_tracked() {
        let eng = engine("inactive");
        eng.state().mutate(1, t0(), |s| s.active = false);

        let later = at(300);
        assert!(eng.handle_message(1, "moon", false, later).is_none());
        assert_eq!(eng.state().get(1, later).last_activity_at, later);
    }

    #[test]
    fn mention_reply_requires_both_gates() {
        let eng = engine("mention-gates");
        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::CooldownSecs(1), t0())
            .expect("short cooldown");
        set_prob(&eng, 1, ProbKind::Mention, 1.0);
        set_prob(&eng, 1, ProbKind::Reply, 0.0);

        let first = eng.handle_message(1, "hello there", true, at(0));
        assert_eq!(first.expect("mention reply").trigger, Trigger::Mention);

        // General cooldown (1s) reopened, mention window (30s) has not.
        assert!(eng.handle_message(1, "hello there", true, at(5)).is_none());

        let again = eng.handle_message(1, "hello there", true, at(31));
        assert_eq!(again.expect("mention reply after window").trigger, Trigger::Mention);
    }

    #[test]
    fn mention_sends_are_at_least_thirty_seconds_apart() {
        let eng = engine("mention-spacing");
        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::CooldownSecs(1), t0())
            .expect("short cooldown");
        set_prob(&eng, 1, ProbKind::Mention, 1.0);
        set_prob(&eng, 1, ProbKind::Reply, 0.0);

        let mut sends = Vec::new();
        for secs in 0..120 {
            if eng.handle_message(1, "yo bot", true, at(secs)).is_some() {
                sends.push(secs);
            }
        }
        assert!(sends.len() >= 2, "expected repeated mention replies");
        for pair in sends.windows(2) {
            assert!(pair[1] - pair[0] >= 30, "sends at {:?} violate the window", pair);
        }
    }

    #[test]
    fn empty_general_pool_is_a_quiet_noop() {
        let eng = engine_with_general("empty-pool", Some("[]"));
        activate(&eng, 1, t0());
        set_prob(&eng, 1, ProbKind::Mention, 1.0);
        set_prob(&eng, 1, ProbKind::Reply, 1.0);

        assert!(eng.handle_message(1, "hello", true, at(0)).is_none());
        assert!(eng.handle_message(1, "hello", false, at(60)).is_none());
    }

    #[test]
    fn calmdown_extension_blocks_keyword_replies() {
        let eng = engine("calmdown");
        activate(&eng, 1, t0());
        set_prob(&eng, 1, ProbKind::Reply, 0.0);
        eng.state()
            .apply_override(1, Override::ExtendCooldown, at(0))
            .expect("calmdown");

        assert!(eng.handle_message(1, "moon", false, at(5)).is_none());
        assert!(eng.handle_message(1, "moon", false, at(39)).is_none());
        assert!(eng.handle_message(1, "moon", false, at(41)).is_some());
    }

    #[test]
    fn idle_fires_once_after_interval_and_resets() {
        let eng = engine("idle-fire");
        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::IdleMinutes(1), t0())
            .expect("idle override");

        assert!(eng.try_idle_fire(1, at(59)).is_none());

        let fired = eng.try_idle_fire(1, at(61));
        assert_eq!(fired.expect("idle message").trigger, Trigger::Idle);

        // The send reset the deadline: nothing more for another minute.
        assert!(eng.try_idle_fire(1, at(62)).is_none());
        assert!(eng.try_idle_fire(1, at(122)).is_some());
    }

    #[test]
    fn inbound_message_resets_the_idle_deadline() {
        let eng = engine("idle-reset");
        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::IdleMinutes(1), t0())
            .expect("idle override");
        set_prob(&eng, 1, ProbKind::Keyword, 0.0);
        set_prob(&eng, 1, ProbKind::Reply, 0.0);

        eng.handle_message(1, "still here", false, at(50));
        assert!(eng.try_idle_fire(1, at(61)).is_none());
        assert!(eng.try_idle_fire(1, at(111)).is_some());
    }

    #[test]
    fn idle_fire_respects_the_cooldown_gate() {
        let eng = engine("idle-gated");
        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::IdleMinutes(1), t0())
            .expect("idle override");
        eng.state()
            .apply_override(1, Override::CooldownSecs(3600), t0())
            .expect("long cooldown");

        let reply = eng.handle_message(1, "moon", false, at(0));
        assert!(reply.is_some(), "keyword reply arms the cooldown");

        // Deadline elapsed but the hour-long cooldown still holds.
        assert!(eng.try_idle_fire(1, at(61)).is_none());
        assert!(eng.try_idle_fire(1, at(3601)).is_some());
    }

    #[test]
    fn inactive_chat_never_idle_fires() {
        let eng = engine("idle-inactive");
        eng.state().mutate(1, t0(), |s| s.active = false);
        assert!(eng.try_idle_fire(1, at(86_400)).is_none());
    }

    #[test]
    fn scheduled_send_bypasses_cooldown_but_records_it() {
        let eng = engine("scheduled");
        activate(&eng, 1, t0());

        let first = eng.handle_message(1, "moon", false, at(0));
        assert!(first.is_some());

        // Inside the 10s cooldown, but scheduled sends are not gated.
        let broadcast = eng.scheduled_send(1, "noon", at(2));
        assert_eq!(broadcast.expect("slot message").trigger, Trigger::Scheduled);
        assert_eq!(eng.state().get(1, at(2)).last_send_at, Some(at(2)));

        // The recorded send re-arms the cooldown for reactive replies.
        assert!(eng.handle_message(1, "moon", false, at(5)).is_none());
    }

    #[test]
    fn scheduled_send_skips_unknown_slot() {
        let eng = engine("unknown-slot");
        activate(&eng, 1, t0());
        assert!(eng.scheduled_send(1, "midnight", at(0)).is_none());
    }

    #[test]
    fn hype_now_bypasses_gates_but_needs_active() {
        let eng = engine("hype-now");
        assert!(eng.hype_now(1, at(0)).is_none(), "inactive chat stays silent");

        activate(&eng, 1, t0());
        eng.state()
            .apply_override(1, Override::ExtendCooldown, at(0))
            .expect("calmdown");
        assert!(eng.hype_now(1, at(1)).is_some(), "hype ignores the cooldown");
    }
}
