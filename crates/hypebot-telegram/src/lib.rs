//! Hypebot Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence and periodic
//! client recreation. Inbound messages are routed to the command layer
//! or the reply engine; outbound messages are drained from the shared
//! channel.

pub mod commands;

use anyhow::{anyhow, Result};
use chrono::Utc;
use hypebot_config::TelegramConfig;
use hypebot_engine::{ReplyEngine, Trigger};
use hypebot_ipc::{InboundEvent, OutboundMessage};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramReplyToMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramReplyToMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    allowed_chats: Option<HashSet<i64>>,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    bot_username: OnceLock<String>,
    engine: Arc<ReplyEngine>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl TelegramAdapter {
    pub fn new(
        cfg: &TelegramConfig,
        data_dir: PathBuf,
        engine: Arc<ReplyEngine>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let api_url = format!("https://api.telegram.org/bot{}", cfg.bot_token);
        let allowed_chats = cfg
            .allowed_chats
            .clone()
            .map(|items| items.into_iter().collect());

        Self {
            client: Self::build_client(),
            bot_token: cfg.bot_token.clone(),
            api_url,
            allowed_chats,
            data_dir,
            poll_timeout_secs: cfg.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: cfg.client_recreate_interval_secs.unwrap_or(600),
            bot_username: OnceLock::new(),
            engine,
            outbound,
        }
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    }

    fn offset_path(&self) -> PathBuf {
        let runtime_dir = self.data_dir.join("runtime");
        let _ = std::fs::create_dir_all(&runtime_dir);
        let bot_id = self.bot_token.split(':').next().unwrap_or("default");
        runtime_dir.join(format!("telegram.{}.offset", bot_id))
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&chat_id))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let _ = fs::write(self.offset_path(), format!("{}\n", offset)).await;
    }

    async fn get_me(&self, client: &Client) -> Result<TelegramUser> {
        let url = format!("{}/getMe", self.api_url);
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getMe request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getMe HTTP error: {}", e))?;

        let parsed: ApiResponse<TelegramUser> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getMe decode failed: {}", e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram getMe returned ok=false"));
        }
        Ok(parsed.result)
    }

    async fn get_updates(&self, client: &Client, offset: Option<i64>) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;
        if !parsed.ok {
            return Err(anyhow!("telegram getUpdates returned ok=false"));
        }
        Ok(parsed.result)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<()> {
        for (i, chunk) in chunk_message(text).iter().enumerate() {
            let url = format!("{}/sendMessage", self.api_url);
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if i == 0 {
                if let Some(reply_to_message_id) = reply_to {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            let resp = self
                .client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| anyhow!("telegram sendMessage request failed: {}", e))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("telegram sendMessage HTTP {}: {}", status, body));
            }

            let parsed: ApiResponse<serde_json::Value> = resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram sendMessage decode failed: {}", e))?;
            if !parsed.ok {
                return Err(anyhow!("telegram sendMessage returned ok=false"));
            }
        }
        Ok(())
    }

    /// Long-poll loop. Runs until the task is aborted; transport errors
    /// are logged and retried after a short pause.
    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;
        info!(offset = ?offset, "telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        match self.get_me(&client).await {
            Ok(me) => {
                if let Some(username) = me.username {
                    info!(username = %username, "bot identity resolved");
                    let _ = self.bot_username.set(username);
                }
            }
            Err(err) => warn!("failed to resolve bot identity: {}", err),
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("recreating HTTP client to prevent stale connections");
                client = Self::build_client();
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: &TelegramMessage) {
        let chat_id = message.chat.id;
        if !self.is_chat_allowed(chat_id) {
            debug!(chat_id, "skipping message from unauthorized chat");
            return;
        }
        if message.from.as_ref().is_some_and(|u| u.is_bot == Some(true)) {
            return;
        }

        let now = Utc::now();
        let text = message.text.clone().or_else(|| message.caption.clone());
        let Some(text) = text else {
            // Media without a caption still counts as chat activity.
            self.engine.state().mutate(chat_id, now, |s| s.last_activity_at = now);
            return;
        };

        let bot_username = self.bot_username.get().map(String::as_str);

        if let Some(cmd) = commands::parse_command(&text, bot_username) {
            // Commands count as chat activity too.
            self.engine.state().mutate(chat_id, now, |s| s.last_activity_at = now);
            let response = commands::dispatch(&self.engine, chat_id, &cmd, now);
            if let Some(reply_text) = response {
                self.queue(OutboundMessage::new(chat_id, reply_text)).await;
            }
            return;
        }

        let is_mention = is_bot_mention(message, &text, bot_username);
        let event = InboundEvent {
            chat_id,
            text,
            is_mention,
            timestamp: now,
        };
        if let Some(reply) =
            self.engine
                .handle_message(event.chat_id, &event.text, event.is_mention, event.timestamp)
        {
            let mut out = OutboundMessage::new(chat_id, reply.text);
            if reply.trigger == Trigger::Mention {
                out = out.with_reply_to(message.message_id);
            }
            self.queue(out).await;
        }
    }

    async fn queue(&self, msg: OutboundMessage) {
        if let Err(e) = self.outbound.send(msg).await {
            warn!("failed to queue outbound message: {}", e);
        }
    }

    /// Drains the outbound channel. Send failures are logged and the
    /// message is dropped; the engine already recorded the send.
    pub async fn run_outbound_handler(&self, mut receiver: mpsc::Receiver<OutboundMessage>) {
        info!("telegram outbound handler started");

        while let Some(msg) = receiver.recv().await {
            if let Err(e) = self.send_message(msg.chat_id, &msg.text, msg.reply_to).await {
                warn!("failed to send outbound message to {}: {}", msg.chat_id, e);
            }
        }

        info!("telegram outbound handler stopped: channel closed");
    }
}

/// True when the message addresses the bot: an `@username` token in the
/// text, or a direct reply to one of the bot's own messages.
pub fn is_bot_mention(message: &TelegramMessage, text: &str, bot_username: Option<&str>) -> bool {
    let Some(username) = bot_username else {
        return false;
    };

    if let Some(replied) = &message.reply_to_message {
        let replied_to_us = replied.from.as_ref().is_some_and(|u| {
            u.is_bot == Some(true)
                && u.username
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(username))
        });
        if replied_to_us {
            return true;
        }
    }

    text.split(|c: char| c.is_whitespace() || c == ',' || c == ':' || c == '!' || c == '?')
        .any(|token| {
            token
                .strip_prefix('@')
                .is_some_and(|name| name.eq_ignore_ascii_case(username))
        })
}

fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    chars
        .chunks(TELEGRAM_MAX_MESSAGE_LEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
