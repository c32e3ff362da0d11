//! Chat command layer: parsing `/command@bot args` lines and mapping
//! them onto engine and state operations.

use chrono::{DateTime, Utc};
use hypebot_engine::cooldown;
use hypebot_engine::ReplyEngine;
use hypebot_state::{Override, ProbKind};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: String,
}

/// Parses a leading `/command` line. An `@target` suffix addressed to a
/// different bot is ignored; with no resolved identity yet, targeted
/// commands are skipped rather than guessed at.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<ParsedCommand> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }

    let (first, args) = match rest.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (rest, ""),
    };

    let name = match first.split_once('@') {
        Some((name, target)) => {
            let ours = bot_username.is_some_and(|u| u.eq_ignore_ascii_case(target));
            if !ours {
                return None;
            }
            name
        }
        None => first,
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some(ParsedCommand {
        name: name.to_ascii_lowercase(),
        args: args.to_string(),
    })
}

/// Executes one command. Returns the confirmation text to post, or
/// `None` when the command stays silent (unknown, or suppressed in an
/// inactive chat).
pub fn dispatch(
    engine: &ReplyEngine,
    chat_id: i64,
    cmd: &ParsedCommand,
    now: DateTime<Utc>,
) -> Option<String> {
    info!(chat_id, command = %cmd.name, "command received");

    match cmd.name.as_str() {
        "start" => match engine.state().apply_override(chat_id, Override::Active(true), now) {
            Ok(_) => Some("Hype bot activated 🚀".to_string()),
            Err(e) => Some(e.to_string()),
        },
        "shutup" => match engine.state().apply_override(chat_id, Override::Active(false), now) {
            Ok(_) => Some("Hype bot silenced 🤐".to_string()),
            Err(e) => Some(e.to_string()),
        },
        "hype" => engine.hype_now(chat_id, now).map(|reply| reply.text),
        "calmdown" => match engine
            .state()
            .apply_override(chat_id, Override::ExtendCooldown, now)
        {
            Ok(_) => Some("Calm down mode: +40s cooldown ⏳".to_string()),
            Err(e) => Some(e.to_string()),
        },
        "status" => Some(render_status(engine, chat_id, now)),
        "setidle" => match cmd.args.parse::<u32>() {
            Ok(minutes) => match engine
                .state()
                .apply_override(chat_id, Override::IdleMinutes(minutes), now)
            {
                Ok(_) => Some(format!("Idle interval set to {} minutes ⏱️", minutes)),
                Err(e) => Some(e.to_string()),
            },
            Err(_) => Some("Usage: /setidle <minutes>".to_string()),
        },
        "setcooldown" => match cmd.args.parse::<u32>() {
            Ok(secs) => match engine
                .state()
                .apply_override(chat_id, Override::CooldownSecs(secs), now)
            {
                Ok(_) => Some(format!("Cooldown set to {} seconds ⏳", secs)),
                Err(e) => Some(e.to_string()),
            },
            Err(_) => Some("Usage: /setcooldown <seconds>".to_string()),
        },
        "setkeyword" => set_probability(engine, chat_id, ProbKind::Keyword, cmd, now),
        "setmention" => set_probability(engine, chat_id, ProbKind::Mention, cmd, now),
        "setreply" => set_probability(engine, chat_id, ProbKind::Reply, cmd, now),
        "hypeon" => match engine
            .state()
            .apply_override(chat_id, Override::HypeActive(true), now)
        {
            Ok(_) => Some("Scheduled hype enabled for this chat 📅".to_string()),
            Err(e) => Some(e.to_string()),
        },
        "hypeoff" => match engine
            .state()
            .apply_override(chat_id, Override::HypeActive(false), now)
        {
            Ok(_) => Some("Scheduled hype disabled for this chat".to_string()),
            Err(e) => Some(e.to_string()),
        },
        "reloadkeys" => Some(match engine.content().reload_keywords() {
            Ok(n) => format!("Reloaded {} keyword sets.", n),
            Err(e) => format!("Failed to reload keywords: {}", e),
        }),
        "reloadidle" => Some(match engine.content().reload_idle() {
            Ok(n) => format!("Reloaded {} idle messages.", n),
            Err(e) => format!("Failed to reload idle messages: {}", e),
        }),
        "reloadgeneral" => Some(match engine.content().reload_general() {
            Ok(n) => format!("Reloaded {} general replies.", n),
            Err(e) => format!("Failed to reload general replies: {}", e),
        }),
        "reloadscheduled" => Some(match engine.content().reload_scheduled() {
            Ok(n) => format!("Reloaded {} broadcast slots.", n),
            Err(e) => format!("Failed to reload broadcast slots: {}", e),
        }),
        _ => None,
    }
}

fn set_probability(
    engine: &ReplyEngine,
    chat_id: i64,
    kind: ProbKind,
    cmd: &ParsedCommand,
    now: DateTime<Utc>,
) -> Option<String> {
    let (label, usage) = match kind {
        ProbKind::Keyword => ("Keyword", "Usage: /setkeyword <probability>"),
        ProbKind::Mention => ("Mention", "Usage: /setmention <probability>"),
        ProbKind::Reply => ("General", "Usage: /setreply <probability>"),
    };

    let raw = match cmd.args.parse::<f64>() {
        Ok(v) => v,
        Err(_) => return Some(usage.to_string()),
    };

    match engine
        .state()
        .apply_override(chat_id, Override::Probability(kind, raw), now)
    {
        Ok(state) => {
            let applied = match kind {
                ProbKind::Keyword => state.effective_keyword_prob(engine.defaults()),
                ProbKind::Mention => state.effective_mention_prob(engine.defaults()),
                ProbKind::Reply => state.effective_reply_prob(engine.defaults()),
            };
            Some(format!("{} reply probability set to {:.2}", label, applied))
        }
        Err(e) => Some(e.to_string()),
    }
}

fn render_status(engine: &ReplyEngine, chat_id: i64, now: DateTime<Utc>) -> String {
    let defaults = engine.defaults();
    let state = engine.state().get(chat_id, now);
    let remaining = cooldown::next_allowed_at(&state, defaults)
        .map(|at| (at - now).num_seconds().max(0))
        .unwrap_or(0);

    format!(
        "Active: {}\n\
         Scheduled hype: {}\n\
         Idle minutes: {}\n\
         Keyword prob: {:.2}\n\
         Mention prob: {:.2}\n\
         General prob: {:.2}\n\
         Cooldown: {}s (remaining: {}s)",
        state.active,
        state.hype_active,
        state.effective_idle_minutes(defaults),
        state.effective_keyword_prob(defaults),
        state.effective_mention_prob(defaults),
        state.effective_reply_prob(defaults),
        state.effective_cooldown_secs(defaults),
        remaining,
    )
}
