//! In-process test harness for driving a space core
//!
//! Tests feed [`GatewayEvent`]s into a [`GatewayCore`] directly and read
//! each participant's outbound queue, so every scenario runs synchronously
//! and deterministically without sockets.

use mew_core::config::SpaceConfig;
use mew_core::envelope::Envelope;
use mew_gateway::space::{ChannelId, GatewayCore, GatewayEvent, Outbound, TokenTable, channel_pair};
use serde_json::{Value, json};
use tokio::sync::mpsc::Receiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A space core under test plus the token table it was built with.
pub struct TestSpace {
    pub core: GatewayCore,
}

impl TestSpace {
    /// Build a space `"demo"` from a `participants` map in config JSON
    /// shape. Every participant's token is `token-<pid>`.
    pub fn new(participants: Value) -> Self {
        let config: SpaceConfig = serde_json::from_value(json!({
            "space": {"id": "demo"},
            "participants": participants,
        }))
        .expect("test participants should deserialize");

        let mut tokens = TokenTable::new();
        for id in config.participants.keys() {
            tokens.insert(id.clone(), format!("token-{id}"));
        }

        Self {
            core: GatewayCore::new(config, tokens),
        }
    }

    /// Open a raw channel (not yet joined).
    pub fn connect(&mut self) -> TestClient {
        let (handle, rx) = channel_pair();
        let channel_id = handle.id();
        self.core.handle_event(GatewayEvent::Connected { handle });
        TestClient {
            channel_id,
            rx,
            saw_close: false,
        }
    }

    /// Connect and join in one step, asserting the welcome arrives.
    pub fn join(&mut self, participant_id: &str) -> TestClient {
        let mut client = self.connect();
        self.send_raw(
            &client,
            &json!({
                "kind": "system/join",
                "payload": {
                    "participantId": participant_id,
                    "space": "demo",
                    "token": format!("token-{participant_id}"),
                },
            })
            .to_string(),
        );
        let welcome = client.next_envelope();
        assert_eq!(welcome.kind, "system/welcome", "join should yield a welcome");
        client
    }

    /// Feed one envelope (as config-free JSON) from a client.
    pub fn send(&mut self, client: &TestClient, envelope: Value) {
        self.send_raw(client, &envelope.to_string());
    }

    /// Feed one raw text frame from a client.
    pub fn send_raw(&mut self, client: &TestClient, text: &str) {
        self.core.handle_event(GatewayEvent::Frame {
            channel_id: client.channel_id,
            text: text.to_string(),
        });
    }

    /// Simulate the transport reporting the client's connection gone.
    pub fn disconnect(&mut self, client: &TestClient) {
        self.core.handle_event(GatewayEvent::Disconnected {
            channel_id: client.channel_id,
        });
    }
}

/// One simulated participant connection.
pub struct TestClient {
    pub channel_id: ChannelId,
    rx: Receiver<Outbound>,
    saw_close: bool,
}

impl TestClient {
    /// Next outbound frame as raw text, or `None` when the queue is empty.
    /// A queued `Close` is remembered for [`assert_closed`](Self::assert_closed)
    /// and skipped.
    pub fn next_raw(&mut self) -> Option<String> {
        loop {
            match self.rx.try_recv() {
                Ok(Outbound::Frame(frame)) => return Some(frame.to_string()),
                Ok(Outbound::Close) => {
                    self.saw_close = true;
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    self.saw_close = true;
                    return None;
                }
                Err(TryRecvError::Empty) => return None,
            }
        }
    }

    /// Next outbound frame parsed as an envelope; panics when none is
    /// queued or it is not envelope JSON.
    pub fn next_envelope(&mut self) -> Envelope {
        let frame = self.next_raw().expect("expected an outbound frame");
        Envelope::parse(&frame)
            .unwrap_or_else(|err| panic!("expected envelope JSON, got {frame:?}: {err}"))
    }

    /// Assert nothing further is queued.
    pub fn assert_silent(&mut self) {
        if let Some(frame) = self.next_raw() {
            panic!("expected no outbound frames, got {frame:?}");
        }
    }

    /// Assert the core asked the transport to close this connection (a
    /// `Close` marker, or the queue already torn down).
    pub fn assert_closed(&mut self) {
        while self.next_raw().is_some() {}
        assert!(self.saw_close, "expected the channel to be closed");
    }

    /// Discard everything queued so far.
    pub fn drain(&mut self) {
        while self.next_raw().is_some() {}
    }
}
