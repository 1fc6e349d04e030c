//! Integration tests for the join handshake, routing and fan-out

mod common;

use common::TestSpace;
use mew_core::envelope::PROTOCOL_VERSION;
use serde_json::json;

fn chat_space() -> TestSpace {
    TestSpace::new(json!({
        "alice": {"capabilities": [{"kind": "chat"}]},
        "bob": {"capabilities": [{"kind": "chat"}]},
    }))
}

#[test]
fn test_two_party_chat() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain(); // presence for bob's join

    space.send(&alice, json!({"kind": "chat", "payload": {"text": "hi"}}));

    let received = bob.next_envelope();
    assert_eq!(received.from.as_deref(), Some("alice"));
    assert_eq!(received.kind, "chat");
    assert_eq!(received.payload["text"], "hi");
    assert_eq!(received.protocol.as_deref(), Some(PROTOCOL_VERSION));
    assert!(received.id.as_deref().is_some_and(|id| !id.is_empty()));
    assert!(received.ts.as_deref().is_some_and(|ts| !ts.is_empty()));

    // Fan-out includes the originator.
    let echo = alice.next_envelope();
    assert_eq!(echo.kind, "chat");
    assert_eq!(echo.from.as_deref(), Some("alice"));
    assert_eq!(echo.id, received.id);
}

#[test]
fn test_welcome_lists_other_participants_with_capabilities() {
    let mut space = chat_space();
    let _alice = space.join("alice");

    let mut bob = space.connect();
    space.send(
        &bob,
        json!({
            "kind": "system/join",
            "payload": {"participantId": "bob", "space": "demo", "token": "token-bob"},
        }),
    );

    let welcome = bob.next_envelope();
    assert_eq!(welcome.kind, "system/welcome");
    assert_eq!(welcome.payload["you"]["id"], "bob");
    // Baseline capabilities are part of the published set.
    let own_caps = welcome.payload["you"]["capabilities"].as_array().unwrap();
    assert!(own_caps.iter().any(|c| c["kind"] == "chat"));
    assert!(own_caps.iter().any(|c| c["kind"] == "system/register"));
    assert!(own_caps.iter().any(|c| c["kind"] == "mcp/response"));

    let others = welcome.payload["participants"].as_array().unwrap();
    assert_eq!(others.len(), 1);
    assert_eq!(others[0]["id"], "alice");
    assert!(others[0]["capabilities"].as_array().is_some());
}

#[test]
fn test_presence_join_goes_to_others_only() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");

    let presence = alice.next_envelope();
    assert_eq!(presence.kind, "system/presence");
    assert_eq!(presence.payload["event"], "join");
    assert_eq!(presence.payload["participant"]["id"], "bob");

    // The joiner itself saw only the welcome.
    bob.assert_silent();
}

#[test]
fn test_join_rejection_wrong_token() {
    let mut space = chat_space();
    let mut observer = space.join("bob");

    let mut intruder = space.connect();
    space.send(
        &intruder,
        json!({
            "kind": "system/join",
            "payload": {"participantId": "alice", "space": "demo", "token": "WRONG"},
        }),
    );

    let error = intruder.next_envelope();
    assert_eq!(error.kind, "system/error");
    assert_eq!(error.payload["message"], "Authentication failed");
    intruder.assert_closed();

    // No presence broadcast for the failed join.
    observer.assert_silent();
    assert_eq!(space.core.participant_count(), 1);
}

#[test]
fn test_join_rejection_unknown_participant() {
    let mut space = chat_space();
    let mut ghost = space.connect();
    space.send(
        &ghost,
        json!({
            "kind": "system/join",
            "payload": {"participantId": "mallory", "space": "demo", "token": "anything"},
        }),
    );
    let error = ghost.next_envelope();
    assert_eq!(error.payload["message"], "Authentication failed");
    ghost.assert_closed();
}

#[test]
fn test_join_rejection_wrong_space() {
    let mut space = chat_space();
    let mut client = space.connect();
    space.send(
        &client,
        json!({
            "kind": "system/join",
            "payload": {"participantId": "alice", "space": "other", "token": "token-alice"},
        }),
    );
    let error = client.next_envelope();
    assert_eq!(error.payload["message"], "Invalid space for this gateway");
    client.assert_closed();
}

#[test]
fn test_legacy_join_form_accepted() {
    let mut space = chat_space();
    let mut client = space.connect();
    space.send(
        &client,
        json!({"type": "join", "participantId": "alice", "token": "token-alice"}),
    );
    let welcome = client.next_envelope();
    assert_eq!(welcome.kind, "system/welcome");
    assert_eq!(welcome.payload["you"]["id"], "alice");
}

#[test]
fn test_duplicate_join_closes_old_channel() {
    let mut space = chat_space();
    let mut first = space.join("alice");
    let mut second = space.join("alice");

    first.assert_closed();
    assert_eq!(space.core.participant_count(), 1);

    // A frame from the stale channel is ignored; the new channel routes.
    space.send(&first, json!({"kind": "chat", "payload": {"text": "stale"}}));
    second.assert_silent();

    space.send(&second, json!({"kind": "chat", "payload": {"text": "fresh"}}));
    let echo = second.next_envelope();
    assert_eq!(echo.payload["text"], "fresh");
}

#[test]
fn test_capability_violation_not_broadcast() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain();

    space.send(
        &bob,
        json!({
            "id": "req-1",
            "kind": "mcp/request",
            "payload": {"method": "tools/call"},
        }),
    );

    let error = bob.next_envelope();
    assert_eq!(error.from.as_deref(), Some("system:gateway"));
    assert_eq!(error.kind, "system/error");
    assert_eq!(error.payload["error"], "capability_violation");
    assert_eq!(error.payload["attempted_kind"], "mcp/request");
    assert!(error.payload["your_capabilities"].as_array().is_some());
    assert_eq!(error.correlation_id, Some(vec!["req-1".to_string()]));

    alice.assert_silent();
}

#[test]
fn test_to_field_never_prunes_fanout() {
    let mut space = TestSpace::new(json!({
        "alice": {"capabilities": [{"kind": "chat"}]},
        "bob": {"capabilities": [{"kind": "chat"}]},
        "carol": {"capabilities": [{"kind": "chat"}]},
    }));
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    let mut carol = space.join("carol");
    alice.drain();
    bob.drain();

    space.send(
        &alice,
        json!({"kind": "chat", "to": ["bob"], "payload": {"text": "addressed"}}),
    );

    // Everyone sees it, the addressing is a hint only.
    assert_eq!(bob.next_envelope().payload["text"], "addressed");
    assert_eq!(carol.next_envelope().payload["text"], "addressed");
    assert_eq!(alice.next_envelope().payload["text"], "addressed");
}

#[test]
fn test_per_sender_order_is_preserved() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain();

    for i in 0..5 {
        space.send(&alice, json!({"kind": "chat", "payload": {"text": format!("m{i}")}}));
    }
    for i in 0..5 {
        assert_eq!(bob.next_envelope().payload["text"], format!("m{i}"));
    }
}

#[test]
fn test_disconnect_broadcasts_leave() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let bob = space.join("bob");
    alice.drain();

    space.disconnect(&bob);

    let leave = alice.next_envelope();
    assert_eq!(leave.kind, "system/presence");
    assert_eq!(leave.payload["event"], "leave");
    assert_eq!(leave.payload["participant"]["id"], "bob");
    assert_eq!(space.core.participant_count(), 1);
}

#[test]
fn test_rejoin_after_disconnect() {
    let mut space = chat_space();
    let bob = space.join("bob");
    space.disconnect(&bob);
    assert_eq!(space.core.participant_count(), 0);

    let _bob_again = space.join("bob");
    assert_eq!(space.core.participant_count(), 1);
}

#[test]
fn test_invalid_json_yields_validation_error() {
    let mut space = chat_space();
    let mut alice = space.join("alice");

    space.send_raw(&alice, "{not json");
    let error = alice.next_envelope();
    assert_eq!(error.kind, "system/error");
    assert_eq!(error.payload["code"], "VALIDATION_ERROR");

    // The channel survives the bad frame.
    space.send(&alice, json!({"kind": "chat", "payload": {"text": "still here"}}));
    assert_eq!(alice.next_envelope().payload["text"], "still here");
}

#[test]
fn test_mcp_request_requires_method() {
    let mut space = TestSpace::new(json!({
        "alice": {"capabilities": [{"kind": "mcp/*"}]},
    }));
    let mut alice = space.join("alice");

    space.send(&alice, json!({"kind": "mcp/request", "payload": {}}));
    let error = alice.next_envelope();
    assert_eq!(error.payload["code"], "VALIDATION_ERROR");
}

#[test]
fn test_proposal_lifecycle_kinds_pass_through() {
    // Proposals are ordinary messages: capability-checked, no server state.
    let mut space = TestSpace::new(json!({
        "alice": {"capabilities": [{"kind": "mcp/*"}]},
        "bob": {"capabilities": [{"kind": "chat"}]},
    }));
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain();

    space.send(
        &alice,
        json!({"kind": "mcp/proposal", "payload": {"method": "tools/call"}}),
    );
    let proposal = bob.next_envelope();
    assert_eq!(proposal.kind, "mcp/proposal");
    let proposal_id = proposal.id.clone().unwrap();

    space.send(
        &alice,
        json!({"kind": "mcp/withdraw", "correlation_id": [proposal_id]}),
    );
    assert_eq!(bob.next_envelope().kind, "mcp/withdraw");
}

#[test]
fn test_system_register_extends_capabilities_and_updates_presence() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain();

    space.send(
        &bob,
        json!({
            "kind": "system/register",
            "payload": {"capabilities": [{"kind": "reasoning/*"}]},
        }),
    );

    let update = alice.next_envelope();
    assert_eq!(update.kind, "system/presence");
    assert_eq!(update.payload["event"], "update");
    assert_eq!(update.payload["participant"]["id"], "bob");
    let caps = update.payload["participant"]["capabilities"].as_array().unwrap();
    assert!(caps.iter().any(|c| c["kind"] == "reasoning/*"));

    // The registered kind is now authorized.
    space.send(&bob, json!({"kind": "reasoning/thought", "payload": {"text": "hm"}}));
    assert_eq!(alice.next_envelope().kind, "reasoning/thought");
}

#[test]
fn test_register_with_held_pattern_leaves_set_unchanged() {
    let mut space = chat_space();
    let mut alice = space.join("alice");
    let mut bob = space.join("bob");
    alice.drain();

    space.send(
        &bob,
        json!({"kind": "system/register", "payload": {"capabilities": [{"kind": "chat"}]}}),
    );
    let update = alice.next_envelope();
    let caps = update.payload["participant"]["capabilities"].as_array().unwrap();
    let chat_count = caps.iter().filter(|c| c["kind"] == "chat").count();
    assert_eq!(chat_count, 1);
}
