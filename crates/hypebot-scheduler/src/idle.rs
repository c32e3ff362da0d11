//! Idle sweep: walks every known chat on a fixed interval and fires an
//! idle message wherever the silence deadline has elapsed.

use chrono::{DateTime, Utc};
use hypebot_engine::ReplyEngine;
use hypebot_ipc::OutboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct IdleSweeper {
    engine: Arc<ReplyEngine>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl IdleSweeper {
    pub fn new(engine: Arc<ReplyEngine>, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self { engine, outbound }
    }

    pub async fn run(self) {
        let interval = Duration::from_secs(self.engine.defaults().idle_sweep_secs);
        info!("idle sweeper started (every {:?})", interval);

        loop {
            self.sweep(Utc::now()).await;
            tokio::time::sleep(interval).await;
        }
    }

    /// One pass over every known chat. The engine re-checks the deadline
    /// under its own lock, so a message arriving mid-sweep wins.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for chat_id in self.engine.state().chat_ids() {
            if let Some(reply) = self.engine.try_idle_fire(chat_id, now) {
                info!(chat_id, "idle message dispatched");
                if let Err(e) = self
                    .outbound
                    .send(OutboundMessage::new(chat_id, reply.text))
                    .await
                {
                    error!("failed to queue idle message for {}: {}", chat_id, e);
                }
            }
        }
    }
}
