//! End-to-end manual-signaling handshake between two local engines
//!
//! Drives the full loop a pair of users would: the host builds an invite
//! link, a human relays it, the joiner answers with a token, the host
//! completes. Signaling never touches the network; transport connectivity
//! afterwards is environment-dependent, so it is reported rather than
//! required.

use anyhow::Result;
use earshot::session::{
    parse_shareable_link, ConnectionRegistry, LocalIdentity, MediaGate, NegotiationEngine,
    PayloadKind, PeerState, RtcTransport, SessionConfig, ToneCapture,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SessionConfig {
    SessionConfig {
        // Host candidates are enough for two engines on one machine, and
        // skipping STUN keeps the test off the network.
        stun_servers: vec![],
        gather_timeout_ms: 1500,
        // Generous budget: this test exercises the flow, not the budget
        // (the codec unit tests cover that contract).
        max_link_len: 8000,
        ..Default::default()
    }
}

fn make_engine(nickname: &str) -> (NegotiationEngine, Arc<ConnectionRegistry>) {
    let config = test_config();
    let registry = ConnectionRegistry::new();
    let transport = Arc::new(RtcTransport::new(config.stun_servers.clone()));
    let engine = NegotiationEngine::new(
        transport,
        registry.clone(),
        LocalIdentity::new(nickname),
        config,
    );
    (engine, registry)
}

#[tokio::test]
async fn test_manual_handshake_end_to_end() -> Result<()> {
    let (host, host_registry) = make_engine("ada");
    let (joiner, joiner_registry) = make_engine("grace");

    // Host side: invite link.
    let link = host.create_offer("abc123").await?;
    println!("invite link: {} chars", link.len());
    assert!(link.contains("#offer=abc123:"));
    assert_eq!(host_registry.pending_count().await, 1);
    assert_eq!(host_registry.count().await, 0);

    // Relay the link by hand.
    let (token, offer) = parse_shareable_link(&link).expect("link should parse back");
    assert_eq!(token, "abc123");
    assert_eq!(offer.kind, PayloadKind::Offer);
    assert_eq!(offer.nickname, "ada");

    // Joiner side: answer token, connection established immediately.
    let answer_token = joiner.process_offer(&token, offer).await?;
    assert_eq!(joiner_registry.count().await, 1);
    let joiner_peers = joiner_registry.peer_ids().await;
    let host_peer_id = joiner_peers.iter().next().expect("one peer").clone();
    assert_eq!(
        joiner_registry.peer_state(&host_peer_id).await,
        Some(PeerState::Connecting)
    );

    // Relay the answer token by hand; host completes.
    host.complete_connection("abc123", &answer_token).await?;
    assert_eq!(host_registry.count().await, 1);
    assert_eq!(host_registry.pending_count().await, 0);
    assert!(host_registry.take_pending("abc123").await.is_none());

    // Both sides can start sharing audio through the gate.
    let host_gate = MediaGate::new(host_registry.clone(), Arc::new(ToneCapture::default()));
    for peer_id in host_registry.peer_ids().await {
        host_gate.start_sharing(&peer_id).await?;
        // Twice: must stay a single outbound attachment.
        host_gate.start_sharing(&peer_id).await?;
    }
    for status in host_registry.statuses().await {
        assert!(status.is_sharing);
    }

    // Connectivity confirmation is best-effort; report what happened.
    let mut connected = false;
    for i in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let host_state = host_registry.statuses().await[0].state;
        let joiner_state = joiner_registry.peer_state(&host_peer_id).await;
        if i % 4 == 0 {
            println!(
                "check {}: host sees {}, joiner sees {:?}",
                i, host_state, joiner_state
            );
        }
        if host_state == PeerState::Connected {
            connected = true;
            break;
        }
    }
    println!("transport connectivity: {}", connected);

    host.shutdown().await;
    joiner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_expired_offer_cannot_be_completed() -> Result<()> {
    let config = SessionConfig {
        pending_timeout_ms: 500,
        ..test_config()
    };
    let registry = ConnectionRegistry::new();
    let transport = Arc::new(RtcTransport::new(vec![]));
    let host = NegotiationEngine::new(
        transport,
        registry.clone(),
        LocalIdentity::new("ada"),
        config,
    );
    let (joiner, _) = make_engine("grace");

    let link = host.create_offer("abc123").await?;
    let (token, offer) = parse_shareable_link(&link).expect("link should parse back");
    let answer_token = joiner.process_offer(&token, offer).await?;

    // The invite sat around too long before the answer came back.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(registry.pending_count().await, 0);
    let err = host
        .complete_connection("abc123", &answer_token)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        earshot::session::Error::UnknownConnection(_)
    ));

    host.shutdown().await;
    joiner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_offer_is_gone() -> Result<()> {
    let (host, registry) = make_engine("ada");

    host.create_offer("abc123").await?;
    assert!(host.cancel_offer("abc123").await);
    assert!(!host.cancel_offer("abc123").await);
    assert_eq!(registry.pending_count().await, 0);

    host.shutdown().await;
    Ok(())
}
