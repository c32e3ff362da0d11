//! Slot dispatcher: fixed time-of-day broadcasts, delivered once per
//! local calendar day to every chat opted in with /hypeon.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use hypebot_config::SlotConfig;
use hypebot_engine::ReplyEngine;
use hypebot_ipc::OutboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

struct ResolvedSlot {
    name: String,
    fire_at: NaiveTime,
    offset: FixedOffset,
}

impl ResolvedSlot {
    fn is_due(&self, local_time: NaiveTime) -> bool {
        local_time >= self.fire_at
    }
}

pub struct SlotDispatcher {
    engine: Arc<ReplyEngine>,
    slots: Vec<ResolvedSlot>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl SlotDispatcher {
    pub fn new(
        engine: Arc<ReplyEngine>,
        slots: &[SlotConfig],
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Result<Self> {
        let slots = slots
            .iter()
            .map(|s| {
                let fire_at = NaiveTime::from_hms_opt(s.hour, s.minute, 0)
                    .with_context(|| format!("slot '{}' has invalid time", s.name))?;
                let offset = s.offset()?;
                Ok(ResolvedSlot {
                    name: s.name.clone(),
                    fire_at,
                    offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            engine,
            slots,
            outbound,
        })
    }

    pub async fn run(self) {
        let interval = Duration::from_secs(self.engine.defaults().slot_sweep_secs);
        self.prime(Utc::now());
        info!("slot dispatcher started ({} slots, every {:?})", self.slots.len(), interval);

        loop {
            self.tick(Utc::now()).await;
            tokio::time::sleep(interval).await;
        }
    }

    /// Marks every slot whose local fire time already passed today as
    /// fired. A process restarted at 15:00 must not deliver the morning
    /// broadcast five hours late.
    pub fn prime(&self, now: DateTime<Utc>) {
        for slot in &self.slots {
            let local = now.with_timezone(&slot.offset);
            let today = local.date_naive();
            if slot.is_due(local.time())
                && self.engine.state().slot_last_fired(&slot.name) != Some(today)
            {
                info!(slot = %slot.name, "slot already past at startup, skipping for today");
                self.engine.state().mark_slot_fired(&slot.name, today);
            }
        }
    }

    /// One dispatch pass. A slot is marked fired before its sends go
    /// out, so a crash mid-broadcast costs messages rather than
    /// duplicating them the next day.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for slot in &self.slots {
            let local = now.with_timezone(&slot.offset);
            let today = local.date_naive();
            if !slot.is_due(local.time())
                || self.engine.state().slot_last_fired(&slot.name) == Some(today)
            {
                continue;
            }
            self.engine.state().mark_slot_fired(&slot.name, today);

            let chats = self.engine.state().hype_active_chats();
            info!(slot = %slot.name, chats = chats.len(), "slot fired");
            for chat_id in chats {
                if let Some(reply) = self.engine.scheduled_send(chat_id, &slot.name, now) {
                    if let Err(e) = self
                        .outbound
                        .send(OutboundMessage::new(chat_id, reply.text))
                        .await
                    {
                        error!("failed to queue slot message for {}: {}", chat_id, e);
                    }
                }
            }
        }
    }
}
