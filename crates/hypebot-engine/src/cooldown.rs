//! Cooldown gate shared by every trigger path.
//!
//! Two independent windows: the general per-chat cooldown (override or
//! global default, optionally extended by `/calmdown`), and a fixed 30 s
//! window that applies only to mention-triggered replies on top of the
//! general one.

use chrono::{DateTime, Duration, Utc};
use hypebot_config::EngineDefaults;
use hypebot_state::ChatState;

/// Minimum spacing between two mention-triggered replies. Deliberately
/// not overridable, unlike the general cooldown.
pub const MENTION_WINDOW_SECS: i64 = 30;

/// The earliest moment the next send is allowed, or `None` when nothing
/// gates it. A live `/calmdown` extension acts as an absolute floor on
/// top of the `last_send_at + cooldown` window.
pub fn next_allowed_at(state: &ChatState, defaults: &EngineDefaults) -> Option<DateTime<Utc>> {
    let window_end = state.last_send_at.map(|sent| {
        sent + Duration::seconds(i64::from(state.effective_cooldown_secs(defaults)))
    });
    match (window_end, state.cooldown_extra_until) {
        (Some(end), Some(extra)) => Some(end.max(extra)),
        (Some(end), None) => Some(end),
        (None, extra) => extra,
    }
}

pub fn may_send(state: &ChatState, defaults: &EngineDefaults, now: DateTime<Utc>) -> bool {
    next_allowed_at(state, defaults).is_none_or(|at| now >= at)
}

/// The second gate layered on mention replies only.
pub fn may_send_mention(state: &ChatState, now: DateTime<Utc>) -> bool {
    state
        .last_mention_reply_at
        .is_none_or(|at| now - at >= Duration::seconds(MENTION_WINDOW_SECS))
}

/// Records a send. Mention-triggered sends also arm the mention window.
pub fn note_send(state: &mut ChatState, now: DateTime<Utc>, mention: bool) {
    state.last_send_at = Some(now);
    if mention {
        state.last_mention_reply_at = Some(now);
    }
    clear_lapsed(state, now);
}

/// Drops a `/calmdown` extension once it has lapsed. Transient by
/// contract: restarts clear it too, via the snapshot skipping it.
pub fn clear_lapsed(state: &mut ChatState, now: DateTime<Utc>) {
    if state.cooldown_extra_until.is_some_and(|end| end <= now) {
        state.cooldown_extra_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("t0")
    }

    fn state_at(now: DateTime<Utc>) -> ChatState {
        ChatState::new(now)
    }

    #[test]
    fn fresh_chat_may_send_immediately() {
        let defaults = EngineDefaults::default();
        assert!(may_send(&state_at(t0()), &defaults, t0()));
    }

    #[test]
    fn send_closes_window_for_cooldown_secs() {
        let defaults = EngineDefaults::default(); // 10s cooldown
        let mut state = state_at(t0());
        note_send(&mut state, t0(), false);
        assert!(!may_send(&state, &defaults, t0() + Duration::seconds(5)));
        assert!(may_send(&state, &defaults, t0() + Duration::seconds(10)));
    }

    #[test]
    fn chat_override_replaces_default_window() {
        let defaults = EngineDefaults::default();
        let mut state = state_at(t0());
        state.cooldown_secs = Some(60);
        note_send(&mut state, t0(), false);
        assert!(!may_send(&state, &defaults, t0() + Duration::seconds(30)));
        assert!(may_send(&state, &defaults, t0() + Duration::seconds(60)));
    }

    #[test]
    fn extension_floors_the_window_even_without_a_send() {
        let defaults = EngineDefaults::default();
        let mut state = state_at(t0());
        state.cooldown_extra_until = Some(t0() + Duration::seconds(40));
        assert!(!may_send(&state, &defaults, t0() + Duration::seconds(15)));
        assert!(may_send(&state, &defaults, t0() + Duration::seconds(40)));
    }

    #[test]
    fn extension_lengthens_an_open_send_window() {
        let defaults = EngineDefaults::default();
        let mut state = state_at(t0());
        note_send(&mut state, t0(), false);
        state.cooldown_extra_until = Some(t0() + Duration::seconds(40));
        // Base window would reopen at t=10, extension holds it to t=40.
        assert!(!may_send(&state, &defaults, t0() + Duration::seconds(11)));
        assert!(may_send(&state, &defaults, t0() + Duration::seconds(40)));
    }

    #[test]
    fn mention_window_is_independent_of_general_cooldown() {
        let mut state = state_at(t0());
        note_send(&mut state, t0(), true);
        let later = t0() + Duration::seconds(15);
        // General 10s window reopened, mention window still closed.
        assert!(may_send(&state, &EngineDefaults::default(), later));
        assert!(!may_send_mention(&state, later));
        assert!(may_send_mention(&state, t0() + Duration::seconds(30)));
    }

    #[test]
    fn non_mention_send_leaves_mention_window_untouched() {
        let mut state = state_at(t0());
        note_send(&mut state, t0(), false);
        assert!(state.last_mention_reply_at.is_none());
        assert!(may_send_mention(&state, t0()));
    }

    #[test]
    fn lapsed_extension_is_cleared() {
        let mut state = state_at(t0());
        state.cooldown_extra_until = Some(t0() + Duration::seconds(40));
        clear_lapsed(&mut state, t0() + Duration::seconds(41));
        assert!(state.cooldown_extra_until.is_none());
    }
}
