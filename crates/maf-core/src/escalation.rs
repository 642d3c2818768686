//! Escalation Channel (component H): durable, per-channel, at-least-once
//! message queues. Grounded on the teacher's `storage/claims_log.rs`
//! append-only-log-with-monotonic-id shape, generalized from claim records
//! to the envelope vocabulary of §4.H.

use crate::errors::{MafError, MafResult};
use crate::model::EnvelopeKind;
use crate::model::{EscalationEnvelope, Event, EventKind};
use crate::store::Store;

pub const CHANNEL_AGENT_MAIL: &str = "agent-mail";

impl Store {
    /// Registers a channel if it does not already exist. Idempotent.
    pub fn register_channel(&self, name: &str) -> MafResult<()> {
        self.with_tx(|tx| tx.ensure_channel(name))
    }

    /// Registers the channels that MUST exist at bootstrap (§6.2):
    /// `agent-mail`, plus the configured debug and review targets.
    pub fn bootstrap_channels(&self, debug_channel: &str, review_channel: &str) -> MafResult<()> {
        self.register_channel(CHANNEL_AGENT_MAIL)?;
        self.register_channel(debug_channel)?;
        self.register_channel(review_channel)
    }

    /// Persists `envelope` on `channel`, assigning a monotonic id. Fails
    /// with `UnknownChannel` if `channel` was never registered.
    pub fn send_escalation(
        &self,
        channel: &str,
        kind: EnvelopeKind,
        from_agent: &str,
        payload: serde_json::Value,
    ) -> MafResult<i64> {
        let now = self.now_ms();
        self.with_tx(|tx| {
            if !tx.channel_exists(channel)? {
                return Err(MafError::UnknownChannel(channel.to_string()));
            }
            let id = tx.next_envelope_id()?;
            tx.append_envelope(&EscalationEnvelope {
                id,
                kind,
                from_agent: from_agent.to_string(),
                to_channel: channel.to_string(),
                created_at: now,
                payload: payload.clone(),
                read: false,
            })?;
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: None,
                ts: now,
                kind: EventKind::EscalationSent,
                data: serde_json::json!({ "channel": channel, "message_id": id }),
            })?;
            Ok(id)
        })
    }

    /// Returns unread messages on `channel` in FIFO arrival order
    /// (`created_at` ascending, ties by id), optionally after `since_id`
    /// and capped at `limit`.
    pub fn fetch_escalations(
        &self,
        channel: &str,
        since_id: Option<i64>,
        limit: Option<usize>,
    ) -> MafResult<Vec<EscalationEnvelope>> {
        let mut envelopes = self.with_tx(|tx| tx.list_envelopes(channel))?;
        envelopes.retain(|e| !e.read);
        if let Some(since) = since_id {
            envelopes.retain(|e| e.id > since);
        }
        if let Some(limit) = limit {
            envelopes.truncate(limit);
        }
        Ok(envelopes)
    }

    /// Marks a message read. Idempotent.
    pub fn mark_escalation_read(&self, channel: &str, message_id: i64) -> MafResult<()> {
        self.with_tx(|tx| {
            tx.mark_envelope_read(channel, message_id)?;
            let now = self.now_ms();
            let event_id = tx.next_event_id()?;
            tx.append_event(&Event {
                id: event_id,
                task_id: None,
                ts: now,
                kind: EventKind::EscalationRead,
                data: serde_json::json!({ "channel": channel, "message_id": message_id }),
            })
        })
    }
}
