//! Space core: join state machine, router, delegation and fan-out
//!
//! Exactly one [`GatewayCore`] exists per process. It owns all mutable
//! space state (participant registry, runtime grants, stream table) and
//! consumes [`GatewayEvent`]s from every transport on a single queue, so
//! each envelope's state mutation is atomic with respect to its own
//! fan-out and every recipient observes it.
//!
//! Handlers are synchronous; the only async surface is the event loop in
//! [`run`]. Outbound delivery never blocks: frames are enqueued on each
//! channel's bounded queue, and a participant that cannot keep up is
//! disconnected instead of stalling the space.

use crate::space::channel::{ChannelHandle, ChannelId, GatewayEvent};
use crate::space::join::{JoinRequest, TokenTable};
use crate::space::registry::ParticipantRegistry;
use crate::space::streams::StreamTable;
use mew_core::capability::{CapabilityPattern, authorizes, baseline_patterns};
use mew_core::config::SpaceConfig;
use mew_core::envelope::{Envelope, PROTOCOL_VERSION, error_codes, kinds};
use mew_core::framing::{StreamFrame, parse_stream_frame};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The single authoritative process state of a space.
pub struct GatewayCore {
    space_id: String,
    config: SpaceConfig,
    tokens: TokenTable,
    /// Channels that connected but have not authenticated yet.
    pending: HashMap<ChannelId, ChannelHandle>,
    registry: ParticipantRegistry,
    streams: StreamTable,
}

impl GatewayCore {
    pub fn new(config: SpaceConfig, tokens: TokenTable) -> Self {
        Self {
            space_id: config.space.id.clone(),
            config,
            tokens,
            pending: HashMap::new(),
            registry: ParticipantRegistry::new(),
            streams: StreamTable::new(),
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    /// Number of joined participants. Used by tests and status logging.
    pub fn participant_count(&self) -> usize {
        self.registry.len()
    }

    /// Dispatch one transport event.
    pub fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Connected { handle } => self.on_connected(handle),
            GatewayEvent::Frame { channel_id, text } => self.on_frame(channel_id, &text),
            GatewayEvent::Malformed { channel_id, reason } => {
                self.on_malformed(channel_id, &reason)
            }
            GatewayEvent::Disconnected { channel_id } => self.on_disconnected(channel_id),
        }
    }

    /// Close every channel. Called once when the event loop stops.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.close();
        }
        let ids: Vec<String> = self.registry.iter().map(|(id, _)| id.clone()).collect();
        for id in ids {
            if let Some(record) = self.registry.remove(&id) {
                record.channel.close();
            }
        }
        info!("All channels closed");
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    fn on_connected(&mut self, handle: ChannelHandle) {
        debug!("Channel {} connected, awaiting join", handle.id());
        self.pending.insert(handle.id(), handle);
    }

    fn on_frame(&mut self, channel_id: ChannelId, text: &str) {
        if let Some(participant_id) = self
            .registry
            .participant_for_channel(channel_id)
            .map(str::to_string)
        {
            self.route_frame(&participant_id, text);
        } else if self.pending.contains_key(&channel_id) {
            self.handle_join_frame(channel_id, text);
        } else {
            debug!("Frame on unknown channel {channel_id}; dropped");
        }
    }

    fn on_malformed(&mut self, channel_id: ChannelId, reason: &str) {
        let handle = self
            .pending
            .get(&channel_id)
            .cloned()
            .or_else(|| self.channel_of(channel_id));
        if let Some(handle) = handle {
            let error = error_envelope(validation_error(reason), None);
            self.send_frame_on(&handle, &error);
        }
    }

    fn on_disconnected(&mut self, channel_id: ChannelId) {
        if self.pending.remove(&channel_id).is_some() {
            debug!("Unauthenticated channel {channel_id} disconnected");
            return;
        }
        let Some(participant_id) = self
            .registry
            .participant_for_channel(channel_id)
            .map(str::to_string)
        else {
            return;
        };
        let Some(record) = self.registry.remove(&participant_id) else {
            return;
        };
        record.channel.close();

        // Streams owned by the leaver end implicitly; peers get a
        // synthesized close so they can drop subscriptions.
        for (stream_id, _) in self.streams.close_owned_by(&participant_id) {
            let close = Envelope::from_gateway(
                kinds::STREAM_CLOSE,
                json!({"stream_id": stream_id, "reason": "owner_disconnected"}),
            );
            self.broadcast(&close);
        }

        let presence = Envelope::from_gateway(
            kinds::SYSTEM_PRESENCE,
            json!({"event": "leave", "participant": {"id": participant_id}}),
        );
        self.broadcast(&presence);
        info!("Participant {participant_id} left ({channel_id})");
    }

    // ── Join handshake ────────────────────────────────────────────────────────

    fn handle_join_frame(&mut self, channel_id: ChannelId, text: &str) {
        let Some(handle) = self.pending.get(&channel_id).cloned() else {
            return;
        };
        if text.starts_with('#') {
            debug!("Stream frame before join on {channel_id}; dropped");
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                let error =
                    error_envelope(validation_error(&format!("invalid JSON: {err}")), None);
                self.send_frame_on(&handle, &error);
                return;
            }
        };

        let Some(request) = JoinRequest::from_value(&value) else {
            let error = error_envelope(
                validation_error("first envelope must be a system/join"),
                None,
            );
            self.send_frame_on(&handle, &error);
            handle.close();
            self.pending.remove(&channel_id);
            return;
        };
        let correlation = request.envelope_id.clone();

        if let Some(space) = &request.space
            && space != &self.space_id
        {
            warn!(
                "Join for space {space:?} rejected on {channel_id} (serving {:?})",
                self.space_id
            );
            let error = error_envelope(
                json!({"message": "Invalid space for this gateway"}),
                correlation,
            );
            self.send_frame_on(&handle, &error);
            handle.close();
            self.pending.remove(&channel_id);
            return;
        }

        let token_ok = request
            .token
            .as_deref()
            .is_some_and(|token| self.tokens.verify(&request.participant_id, token));
        if !token_ok {
            warn!(
                "Authentication failed for {:?} on {channel_id}",
                request.participant_id
            );
            let error =
                error_envelope(json!({"message": "Authentication failed"}), correlation);
            self.send_frame_on(&handle, &error);
            handle.close();
            self.pending.remove(&channel_id);
            return;
        }

        self.pending.remove(&channel_id);
        let participant_id = request.participant_id;

        let mut capabilities = self.config.capabilities_for(&participant_id);
        capabilities.extend(baseline_patterns());

        // Last-writer-wins on duplicate join: the stale channel is closed
        // and the fresh one takes over the id.
        if let Some(previous) = self
            .registry
            .join(&participant_id, handle, capabilities)
        {
            info!(
                "Participant {participant_id} rejoined; closing stale channel {}",
                previous.channel.id()
            );
            previous.channel.close();
        }

        let welcome = Envelope::from_gateway(
            kinds::SYSTEM_WELCOME,
            self.welcome_payload(&participant_id),
        )
        .addressed_to(vec![participant_id.clone()]);
        self.send_to_participant(&participant_id, &welcome);

        let presence = Envelope::from_gateway(
            kinds::SYSTEM_PRESENCE,
            json!({"event": "join", "participant": self.participant_summary(&participant_id)}),
        );
        self.broadcast_except(&participant_id, &presence);

        info!("Participant {participant_id} joined ({channel_id})");
    }

    // ── Router ────────────────────────────────────────────────────────────────

    fn route_frame(&mut self, sender: &str, text: &str) {
        if let Some(frame) = parse_stream_frame(text) {
            self.forward_stream_data(sender, frame, text);
            return;
        }

        let mut envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.error_to(
                    sender,
                    validation_error(&format!("invalid envelope: {err}")),
                    None,
                );
                return;
            }
        };
        envelope.ensure_id();
        envelope.ensure_ts();
        let envelope_id = envelope.id.clone();

        if let Some(protocol) = envelope.protocol.as_deref()
            && !protocol.is_empty()
            && protocol != PROTOCOL_VERSION
        {
            self.error_to(
                sender,
                validation_error(&format!(
                    "unsupported protocol {protocol:?}; this gateway speaks {PROTOCOL_VERSION}"
                )),
                envelope_id,
            );
            return;
        }

        if let Err(message) = check_required_fields(&envelope) {
            self.error_to(sender, validation_error(&message), envelope_id);
            return;
        }

        // A joined channel re-sending a join (e.g. a FIFO participant
        // restarting behind the same pipe) is ignored.
        if envelope.kind == kinds::SYSTEM_JOIN {
            debug!("Ignoring join from already-joined participant {sender}");
            return;
        }

        if envelope.kind == kinds::SYSTEM_REGISTER {
            self.handle_register(sender, &envelope);
            return;
        }

        if envelope.kind != kinds::SYSTEM_HEARTBEAT {
            let Some(record) = self.registry.get(sender) else {
                self.error_to(
                    sender,
                    json!({"code": error_codes::PROCESSING_ERROR, "message": "sender record missing"}),
                    envelope_id,
                );
                return;
            };
            let effective = record.effective_capabilities();
            if !authorizes(&effective, &envelope) {
                warn!(
                    "Capability violation: {sender} attempted {} without authorization",
                    envelope.kind
                );
                self.error_to(
                    sender,
                    json!({
                        "error": error_codes::CAPABILITY_VIOLATION,
                        "attempted_kind": envelope.kind,
                        "your_capabilities": effective,
                    }),
                    envelope_id,
                );
                return;
            }
        }

        let proceed = match envelope.kind.as_str() {
            kinds::CAPABILITY_GRANT => self.apply_grant(sender, &envelope),
            kinds::CAPABILITY_REVOKE => self.apply_revoke(sender, &envelope),
            kinds::STREAM_REQUEST => {
                self.apply_stream_request(sender, &envelope);
                true
            }
            kinds::STREAM_CLOSE => self.apply_stream_close(sender, &envelope),
            _ => true,
        };
        if !proceed {
            return;
        }

        envelope.stamp(sender);
        self.broadcast(&envelope);
    }

    // ── system/register ───────────────────────────────────────────────────────

    fn handle_register(&mut self, sender: &str, envelope: &Envelope) {
        let envelope_id = envelope.id.clone();
        let patterns = envelope
            .payload
            .get("capabilities")
            .filter(|value| value.is_array())
            .and_then(|value| {
                serde_json::from_value::<Vec<CapabilityPattern>>(value.clone()).ok()
            });
        let Some(patterns) = patterns else {
            self.error_to(
                sender,
                json!({
                    "error": error_codes::INVALID_REQUEST,
                    "message": "system/register requires payload.capabilities as a sequence of patterns",
                }),
                envelope_id,
            );
            return;
        };

        self.registry.merge_static_capabilities(sender, patterns);
        let presence = Envelope::from_gateway(
            kinds::SYSTEM_PRESENCE,
            json!({"event": "update", "participant": self.participant_summary(sender)}),
        );
        self.broadcast_except(sender, &presence);
        debug!("Participant {sender} registered additional capabilities");
    }

    // ── Capability delegation ─────────────────────────────────────────────────

    fn apply_grant(&mut self, sender: &str, envelope: &Envelope) -> bool {
        let envelope_id = envelope.id.clone();
        let Some(recipient) = envelope
            .payload
            .get("recipient")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.error_to(
                sender,
                invalid_request("capability/grant requires payload.recipient"),
                envelope_id,
            );
            return false;
        };
        let patterns = envelope
            .payload
            .get("capabilities")
            .filter(|value| value.is_array())
            .and_then(|value| {
                serde_json::from_value::<Vec<CapabilityPattern>>(value.clone()).ok()
            });
        let Some(patterns) = patterns else {
            self.error_to(
                sender,
                invalid_request(
                    "capability/grant requires payload.capabilities as a sequence of patterns",
                ),
                envelope_id,
            );
            return false;
        };

        let grant_id = envelope.id.clone().unwrap_or_default();
        if !self
            .registry
            .add_grant(&recipient, &grant_id, patterns.clone())
        {
            self.error_to(
                sender,
                invalid_request(&format!("recipient {recipient:?} is not joined")),
                envelope_id,
            );
            return false;
        }
        info!("Grant {grant_id} from {sender} to {recipient} recorded");

        // The recipient learns about its new authority before anyone sees
        // the grant itself: ack first, then a refreshed welcome, then the
        // broadcast from the router.
        let ack = Envelope::from_gateway(
            kinds::CAPABILITY_GRANT_ACK,
            json!({
                "status": "accepted",
                "grant_id": grant_id.clone(),
                "capabilities": patterns,
            }),
        )
        .correlated_to(vec![grant_id])
        .addressed_to(vec![recipient.clone()]);
        self.send_to_participant(&recipient, &ack);

        let welcome =
            Envelope::from_gateway(kinds::SYSTEM_WELCOME, self.welcome_payload(&recipient))
                .addressed_to(vec![recipient.clone()]);
        self.send_to_participant(&recipient, &welcome);
        true
    }

    fn apply_revoke(&mut self, sender: &str, envelope: &Envelope) -> bool {
        let envelope_id = envelope.id.clone();
        let Some(recipient) = envelope
            .payload
            .get("recipient")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.error_to(
                sender,
                invalid_request("capability/revoke requires payload.recipient"),
                envelope_id,
            );
            return false;
        };

        if let Some(grant_id) = envelope.payload.get("grant_id").and_then(Value::as_str) {
            // Unknown recipients and grant ids are a silent no-op: the
            // grant may have died with its recipient already.
            self.registry.revoke_grant_by_id(&recipient, grant_id);
            debug!("Revoked grant {grant_id} from {recipient} (by {sender})");
            return true;
        }

        let patterns = envelope
            .payload
            .get("capabilities")
            .filter(|value| value.is_array())
            .and_then(|value| {
                serde_json::from_value::<Vec<CapabilityPattern>>(value.clone()).ok()
            });
        match patterns {
            Some(patterns) => {
                self.registry.revoke_grants_by_patterns(&recipient, &patterns);
                debug!("Revoked {} pattern(s) from {recipient} (by {sender})", patterns.len());
                true
            }
            None => {
                self.error_to(
                    sender,
                    invalid_request(
                        "capability/revoke requires payload.grant_id or payload.capabilities",
                    ),
                    envelope_id,
                );
                false
            }
        }
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    fn apply_stream_request(&mut self, sender: &str, envelope: &Envelope) {
        let direction = envelope.payload.get("direction").and_then(Value::as_str);
        let request_id = envelope.id.clone().unwrap_or_default();
        let stream_id = self.streams.open(&request_id, sender, direction);
        info!("Stream {stream_id} opened by {sender}");

        let open = Envelope::from_gateway(
            kinds::STREAM_OPEN,
            json!({"stream_id": stream_id, "encoding": "text"}),
        )
        .correlated_to(vec![request_id]);
        self.broadcast(&open);
    }

    fn apply_stream_close(&mut self, sender: &str, envelope: &Envelope) -> bool {
        let envelope_id = envelope.id.clone();
        let Some(stream_id) = envelope.payload.get("stream_id").and_then(Value::as_str) else {
            self.error_to(
                sender,
                invalid_request("stream/close requires payload.stream_id"),
                envelope_id,
            );
            return false;
        };
        if self.streams.close(stream_id).is_some() {
            info!("Stream {stream_id} closed by {sender}");
        }
        // The close envelope is forwarded even for unknown streams so
        // late subscribers can reconcile.
        true
    }

    fn forward_stream_data(&mut self, sender: &str, frame: StreamFrame<'_>, raw: &str) {
        if !self.streams.owner_may_write(frame.stream_id, sender) {
            debug!(
                "Dropping data frame for {} from {sender}: not the registered owner",
                frame.stream_id
            );
            return;
        }
        self.broadcast_frame(Arc::from(raw));
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    fn channel_of(&self, channel_id: ChannelId) -> Option<ChannelHandle> {
        let participant_id = self.registry.participant_for_channel(channel_id)?;
        self.registry
            .get(participant_id)
            .map(|record| record.channel.clone())
    }

    fn participant_summary(&self, participant_id: &str) -> Value {
        let capabilities = self
            .registry
            .get(participant_id)
            .map(|record| record.effective_capabilities())
            .unwrap_or_default();
        json!({"id": participant_id, "capabilities": capabilities})
    }

    fn welcome_payload(&self, participant_id: &str) -> Value {
        let others: Vec<Value> = self
            .registry
            .iter()
            .filter(|(id, _)| id.as_str() != participant_id)
            .map(|(id, _)| self.participant_summary(id))
            .collect();
        json!({
            "you": self.participant_summary(participant_id),
            "participants": others,
        })
    }

    /// Send a gateway error envelope to one joined participant.
    fn error_to(&mut self, participant_id: &str, payload: Value, correlation: Option<String>) {
        let envelope = error_envelope(payload, correlation)
            .addressed_to(vec![participant_id.to_string()]);
        self.send_to_participant(participant_id, &envelope);
    }

    fn send_to_participant(&mut self, participant_id: &str, envelope: &Envelope) {
        let Some(record) = self.registry.get(participant_id) else {
            return;
        };
        let channel = record.channel.clone();
        let frame: Arc<str> = Arc::from(envelope.to_json());
        if let Err(err) = channel.try_send_frame(frame) {
            warn!("Send to {participant_id} failed ({err}); disconnecting");
            self.on_disconnected(channel.id());
        }
    }

    /// Send on a channel that may not have joined yet (join errors).
    fn send_frame_on(&mut self, handle: &ChannelHandle, envelope: &Envelope) {
        let frame: Arc<str> = Arc::from(envelope.to_json());
        if let Err(err) = handle.try_send_frame(frame) {
            warn!("Send on {} failed ({err})", handle.id());
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) {
        self.broadcast_frame(Arc::from(envelope.to_json()));
    }

    fn broadcast_except(&mut self, excluded: &str, envelope: &Envelope) {
        let frame: Arc<str> = Arc::from(envelope.to_json());
        let mut dead = Vec::new();
        for (id, record) in self.registry.iter() {
            if id == excluded {
                continue;
            }
            if let Err(err) = record.channel.try_send_frame(frame.clone()) {
                warn!("Fan-out to {id} failed ({err}); disconnecting");
                dead.push(record.channel.id());
            }
        }
        for channel_id in dead {
            self.on_disconnected(channel_id);
        }
    }

    /// Fan one serialized frame out to every joined participant, including
    /// the originator. Channels that cannot accept the frame are closed
    /// and cleaned up; delivery to the rest is unaffected.
    fn broadcast_frame(&mut self, frame: Arc<str>) {
        let mut dead = Vec::new();
        for (id, record) in self.registry.iter() {
            if let Err(err) = record.channel.try_send_frame(frame.clone()) {
                warn!("Fan-out to {id} failed ({err}); disconnecting");
                dead.push(record.channel.id());
            }
        }
        for channel_id in dead {
            self.on_disconnected(channel_id);
        }
    }
}

/// Kind-specific required-field checks applied before authorization.
fn check_required_fields(envelope: &Envelope) -> Result<(), String> {
    match envelope.kind.as_str() {
        kinds::CHAT => {
            if envelope.payload.get("text").and_then(Value::as_str).is_none() {
                return Err("chat requires payload.text".to_string());
            }
        }
        kinds::MCP_REQUEST => {
            if envelope
                .payload
                .get("method")
                .and_then(Value::as_str)
                .is_none()
            {
                return Err("mcp/request requires payload.method".to_string());
            }
        }
        _ => {}
    }
    Ok(())
}

fn validation_error(message: &str) -> Value {
    json!({"code": error_codes::VALIDATION_ERROR, "message": message})
}

fn invalid_request(message: &str) -> Value {
    json!({"error": error_codes::INVALID_REQUEST, "message": message})
}

fn error_envelope(payload: Value, correlation: Option<String>) -> Envelope {
    let envelope = Envelope::from_gateway(kinds::SYSTEM_ERROR, payload);
    match correlation {
        Some(id) => envelope.correlated_to(vec![id]),
        None => envelope,
    }
}

/// Event loop: drain transport events into the core until cancellation,
/// then close every channel.
pub async fn run(
    mut core: GatewayCore,
    mut events: mpsc::Receiver<GatewayEvent>,
    cancel: CancellationToken,
) {
    info!("Space core started for {:?}", core.space_id());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Space core cancelled");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => core.handle_event(event),
                    None => {
                        info!("All transports gone; space core stopping");
                        break;
                    }
                }
            }
        }
    }
    core.shutdown();
    info!("Space core stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
