mod support;

use std::sync::Arc;
use std::time::Duration;

use room404_client_core::config::{ClientConfig, MediaMode};
use room404_client_core::media::SampleTrackDevice;
use room404_client_core::media::mock::DeniedDevice;
use room404_client_core::negotiation::mock::ScriptedPeerFactory;
use room404_client_core::negotiation::{
    InitiatorPhase, Negotiation, NegotiationRole, ResponderPhase,
};
use room404_client_core::session::{
    ChatAuthor, STATUS_CONNECTION_ERROR, SessionController, SessionHandle, SessionState,
};
use room404_client_core::transport::WebSocketConnector;
use tokio::time::{Instant, sleep};

use support::{REFUSED_NAME, StubRelay, WAIT, init_tracing, wait_for};

fn client(relay: &StubRelay, peers: &ScriptedPeerFactory) -> SessionHandle {
    let config = ClientConfig::default()
        .with_server(relay.base_url())
        .with_ice_servers(Vec::new())
        .with_reconnect_delay(Duration::from_millis(20));
    SessionController::spawn(
        config,
        Arc::new(WebSocketConnector),
        Arc::new(SampleTrackDevice::default()),
        Arc::new(peers.clone()),
    )
}

async fn wait_for_entry(peers: &ScriptedPeerFactory, needle: &str) {
    let deadline = Instant::now() + WAIT;
    while !peers.entries().iter().any(|entry| entry.contains(needle)) {
        if Instant::now() >= deadline {
            panic!("no `{needle}` in {:?}", peers.entries());
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn strangers_pair_negotiate_and_chat_through_the_relay() {
    init_tracing();
    let relay = StubRelay::start().await;
    let alice_peers = ScriptedPeerFactory::new();
    let bob_peers = ScriptedPeerFactory::new();
    let alice = client(&relay, &alice_peers);
    let bob = client(&relay, &bob_peers);

    alice.connect("alice").await.expect("alice connects");
    wait_for(&alice, "alice waiting", |s| {
        s.state == SessionState::WaitingForPartner
    })
    .await;
    bob.connect("bob").await.expect("bob connects");

    // The longest waiter is elected initiator.
    let alice_view = wait_for(&alice, "alice stable", |s| {
        s.negotiation == Some(Negotiation::Initiator(InitiatorPhase::Stable))
    })
    .await;
    assert_eq!(alice_view.state, SessionState::Active);
    let bob_view = wait_for(&bob, "bob stable", |s| {
        s.negotiation == Some(Negotiation::Responder(ResponderPhase::Stable))
    })
    .await;
    assert!(bob_view.partner_present);
    wait_for_entry(&bob_peers, "remote offer").await;
    wait_for_entry(&alice_peers, "remote answer").await;
    assert!(
        !bob_peers.entries().iter().any(|entry| entry.ends_with(" offer")),
        "responder must never create an offer: {:?}",
        bob_peers.entries()
    );

    alice.send_message("hi stranger").await.expect("alice chats");
    let bob_view = wait_for(&bob, "chat delivered", |s| {
        s.chat
            .iter()
            .any(|entry| entry.author == ChatAuthor::Partner && entry.text == "hi stranger")
    })
    .await;
    assert!(bob_view.chat.iter().all(|entry| entry.author != ChatAuthor::Local));

    bob.disconnect().await.expect("bob leaves");
    let alice_view = wait_for(&alice, "partner lost", |s| {
        s.state == SessionState::WaitingForPartner && !s.partner_present
    })
    .await;
    assert!(alice_view.negotiation.is_none());
    assert!(
        alice_view
            .chat
            .iter()
            .any(|entry| entry.author == ChatAuthor::System && entry.text == "Stranger disconnected.")
    );
    wait_for_entry(&alice_peers, "peer1 close").await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn find_new_partner_pairs_with_the_next_stranger() {
    init_tracing();
    let relay = StubRelay::start().await;
    let alice_peers = ScriptedPeerFactory::new();
    let bob_peers = ScriptedPeerFactory::new();
    let carol_peers = ScriptedPeerFactory::new();
    let alice = client(&relay, &alice_peers);
    let bob = client(&relay, &bob_peers);
    let carol = client(&relay, &carol_peers);

    alice.connect("alice").await.expect("alice connects");
    wait_for(&alice, "alice waiting", |s| {
        s.state == SessionState::WaitingForPartner
    })
    .await;
    bob.connect("bob").await.expect("bob connects");
    wait_for(&alice, "alice active", |s| s.state == SessionState::Active).await;
    wait_for(&bob, "bob active", |s| s.state == SessionState::Active).await;
    alice.send_message("first chat").await.expect("chat");

    carol.connect("carol").await.expect("carol connects");
    wait_for(&carol, "carol waiting", |s| {
        s.state == SessionState::WaitingForPartner
    })
    .await;

    // Bob leaves alice; the relay hands alice to carol, who waited longer
    // and so offers this time.
    bob.find_new_partner().await.expect("bob skips");
    let alice_view = wait_for(&alice, "alice re-paired", |s| {
        s.state == SessionState::Active
            && s.negotiation.map(|n| n.role()) == Some(NegotiationRole::Responder)
    })
    .await;
    assert!(alice_view.partner_present);
    wait_for(&carol, "carol active", |s| s.state == SessionState::Active).await;
    let bob_view = wait_for(&bob, "bob reconnected", |s| {
        s.state == SessionState::WaitingForPartner
    })
    .await;
    assert!(
        !bob_view.chat.iter().any(|entry| entry.text == "first chat"),
        "finding a new partner starts with a clean chat"
    );

    alice.shutdown().await;
    bob.shutdown().await;
    carol.shutdown().await;
}

#[tokio::test]
async fn refused_upgrade_reports_a_connection_error() {
    init_tracing();
    let relay = StubRelay::start().await;
    let peers = ScriptedPeerFactory::new();
    let handle = client(&relay, &peers);

    handle.connect(REFUSED_NAME).await.expect("command accepted");
    let snapshot = wait_for(&handle, "connection error", |s| {
        s.state == SessionState::Disconnected && s.status == STATUS_CONNECTION_ERROR
    })
    .await;
    assert!(snapshot.chat.is_empty());
    assert_eq!(peers.created(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn text_only_sessions_still_negotiate_receive_only() {
    init_tracing();
    let relay = StubRelay::start().await;
    let alice_peers = ScriptedPeerFactory::new();
    let bob_peers = ScriptedPeerFactory::new();
    let text_config = ClientConfig::default()
        .with_server(relay.base_url())
        .with_ice_servers(Vec::new())
        .with_media_mode(MediaMode::TextOnly);
    let alice = SessionController::spawn(
        text_config,
        Arc::new(WebSocketConnector),
        Arc::new(DeniedDevice::default()),
        Arc::new(alice_peers.clone()),
    );
    let bob = client(&relay, &bob_peers);

    alice.connect("alice").await.expect("alice connects");
    wait_for(&alice, "alice waiting", |s| {
        s.state == SessionState::WaitingForPartner
    })
    .await;
    bob.connect("bob").await.expect("bob connects");

    let alice_view = wait_for(&alice, "alice stable", |s| {
        s.negotiation == Some(Negotiation::Initiator(InitiatorPhase::Stable))
    })
    .await;
    assert!(alice_view.local_media.is_none());
    assert!(alice_view.media_hint.is_none());
    assert!(!alice_peers.entries().iter().any(|entry| entry.ends_with("attach")));

    alice.shutdown().await;
    bob.shutdown().await;
}
