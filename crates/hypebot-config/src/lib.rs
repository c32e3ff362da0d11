//! Hypebot Configuration
//!
//! TOML configuration loading with engine defaults and scheduled-slot table

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Seconds added to the cooldown window end by each `/calmdown`.
pub const CALMDOWN_EXTRA_SECS: i64 = 40;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub engine: EngineDefaults,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default = "default_slots")]
    pub slots: Vec<SlotConfig>,
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

/// Global defaults every chat falls back to when it carries no override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefaults {
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u32,
    #[serde(default = "default_keyword_prob")]
    pub keyword_prob: f64,
    #[serde(default = "default_mention_prob")]
    pub mention_prob: f64,
    #[serde(default = "default_general_prob")]
    pub general_prob: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u32,
    #[serde(default = "default_idle_sweep_secs")]
    pub idle_sweep_secs: u64,
    #[serde(default = "default_slot_sweep_secs")]
    pub slot_sweep_secs: u64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            idle_minutes: default_idle_minutes(),
            keyword_prob: default_keyword_prob(),
            mention_prob: default_mention_prob(),
            general_prob: default_general_prob(),
            cooldown_secs: default_cooldown_secs(),
            idle_sweep_secs: default_idle_sweep_secs(),
            slot_sweep_secs: default_slot_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_keywords_file")]
    pub keywords_file: String,
    #[serde(default = "default_idle_file")]
    pub idle_file: String,
    #[serde(default = "default_general_file")]
    pub general_file: String,
    #[serde(default = "default_scheduled_file")]
    pub scheduled_file: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            keywords_file: default_keywords_file(),
            idle_file: default_idle_file(),
            general_file: default_general_file(),
            scheduled_file: default_scheduled_file(),
        }
    }
}

/// One fixed time-of-day broadcast slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    pub hour: u32,
    pub minute: u32,
    /// UTC offset the hour/minute are expressed in, e.g. "+02:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl SlotConfig {
    pub fn offset(&self) -> anyhow::Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
}

fn default_idle_minutes() -> u32 {
    5
}

fn default_keyword_prob() -> f64 {
    1.0
}

fn default_mention_prob() -> f64 {
    0.90
}

fn default_general_prob() -> f64 {
    0.75
}

fn default_cooldown_secs() -> u32 {
    10
}

fn default_idle_sweep_secs() -> u64 {
    20
}

fn default_slot_sweep_secs() -> u64 {
    20
}

fn default_keywords_file() -> String {
    "keywords.json".to_string()
}

fn default_idle_file() -> String {
    "idle_messages.json".to_string()
}

fn default_general_file() -> String {
    "general_replies.json".to_string()
}

fn default_scheduled_file() -> String {
    "scheduled_messages.json".to_string()
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_slots() -> Vec<SlotConfig> {
    ["morning", "noon", "night"]
        .iter()
        .zip([9u32, 12, 21])
        .map(|(name, hour)| SlotConfig {
            name: name.to_string(),
            hour,
            minute: 0,
            utc_offset: default_utc_offset(),
        })
        .collect()
}

fn parse_utc_offset(raw: &str) -> anyhow::Result<FixedOffset> {
    raw.parse::<FixedOffset>()
        .map_err(|e| anyhow::anyhow!("invalid UTC offset '{}': {}", raw, e))
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("failed to read config {}: {}", path.as_ref().display(), e)
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hypebot")
            .join("config.toml")
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.core.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".hypebot"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let e = &self.engine;
        if e.idle_minutes == 0 || e.idle_minutes > 1440 {
            anyhow::bail!("engine.idle_minutes must be between 1 and 1440");
        }
        if e.cooldown_secs == 0 || e.cooldown_secs > 3600 {
            anyhow::bail!("engine.cooldown_secs must be between 1 and 3600");
        }
        for (name, prob) in [
            ("keyword_prob", e.keyword_prob),
            ("mention_prob", e.mention_prob),
            ("general_prob", e.general_prob),
        ] {
            if !prob.is_finite() || !(0.0..=1.0).contains(&prob) {
                anyhow::bail!("engine.{} must be between 0.0 and 1.0", name);
            }
        }
        if e.idle_sweep_secs == 0 || e.slot_sweep_secs == 0 {
            anyhow::bail!("sweep intervals must be > 0");
        }

        let mut slot_names = HashSet::new();
        for slot in &self.slots {
            let name = slot.name.trim();
            if name.is_empty() {
                anyhow::bail!("slot name cannot be empty");
            }
            if !slot_names.insert(name.to_string()) {
                anyhow::bail!("duplicate slot '{}'", name);
            }
            if slot.hour > 23 {
                anyhow::bail!("slot '{}' hour must be 0-23", name);
            }
            if slot.minute > 59 {
                anyhow::bail!("slot '{}' minute must be 0-59", name);
            }
            slot.offset()?;
        }

        if let Some(telegram) = &self.telegram {
            if telegram.bot_token.trim().is_empty() {
                anyhow::bail!("telegram.bot_token cannot be empty");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    fn parse_config(toml_str: &str) -> Config {
        toml::from_str(toml_str).expect("parse config")
    }

    #[test]
    fn empty_config_gets_defaults() {
        let cfg = parse_config("");
        assert_eq!(cfg.engine.idle_minutes, 5);
        assert_eq!(cfg.engine.cooldown_secs, 10);
        assert!((cfg.engine.mention_prob - 0.90).abs() < f64::EPSILON);
        assert_eq!(cfg.slots.len(), 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_slots_cover_morning_noon_night() {
        let cfg = parse_config("");
        let names: Vec<&str> = cfg.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["morning", "noon", "night"]);
        assert_eq!(cfg.slots[1].hour, 12);
    }

    #[test]
    fn validate_rejects_out_of_range_probability() {
        let cfg = parse_config(
            r#"
[engine]
keyword_prob = 1.5
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_slot_hour() {
        let cfg = parse_config(
            r#"
[[slots]]
name = "late"
hour = 24
minute = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_slot_names() {
        let cfg = parse_config(
            r#"
[[slots]]
name = "noon"
hour = 12
minute = 0

[[slots]]
name = "noon"
hour = 13
minute = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_invalid_utc_offset() {
        let cfg = parse_config(
            r#"
[[slots]]
name = "morning"
hour = 9
minute = 0
utc_offset = "UTC+2"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slot_offset_parses_fixed_offset() {
        let cfg = parse_config(
            r#"
[[slots]]
name = "evening"
hour = 19
minute = 30
utc_offset = "+02:00"
"#,
        );
        let offset = cfg.slots[0].offset().expect("offset");
        assert_eq!(offset.local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn validate_rejects_empty_bot_token() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = ""
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_cooldown() {
        let cfg = parse_config(
            r#"
[engine]
cooldown_secs = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }
}
