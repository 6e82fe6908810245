//! Negotiation engine: the manual-signaling state machine
//!
//! There is no signaling channel. The offerer turns a freshly-opened
//! session into a shareable link, a human carries it to the answerer, and
//! the answer comes back the same way as a bare token. The engine's job
//! ends at producing and consuming those payloads and registering sessions;
//! liveness transitions are observed from the transport, never commanded.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::payload::{self, PayloadKind, SignalingPayload};
use super::registry::{ConnectionRegistry, PeerMetadata, PendingNegotiation};
use super::transport::{SessionHandle, Transport, TransportEvent};
use super::types::{Candidate, LocalIdentity, PeerState, SessionConfig, SessionRole};

pub struct NegotiationEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    identity: LocalIdentity,
    config: SessionConfig,
}

impl NegotiationEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        identity: LocalIdentity,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            identity,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Offerer step one: open a session, produce an offer and return the
    /// shareable link carrying it.
    ///
    /// The link is encoded and length-checked before anything is
    /// registered, so an oversized link leaves no pending entry behind; any
    /// failure closes the partially-opened session before propagating.
    pub async fn create_offer(&self, connection_token: &str) -> Result<String> {
        let session = self.transport.open_session(SessionRole::Offerer).await?;
        match self.drive_offer(&session, connection_token).await {
            Ok(link) => Ok(link),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    async fn drive_offer(
        &self,
        session: &Arc<dyn SessionHandle>,
        connection_token: &str,
    ) -> Result<String> {
        let mut events = session.subscribe();
        let offer = session.create_offer().await?;
        session.set_local_description(offer.clone()).await?;
        let candidates = gather_candidates(
            &mut events,
            Duration::from_millis(self.config.gather_timeout_ms),
        )
        .await;

        let payload = SignalingPayload::offer(
            &self.identity.peer_id,
            &self.identity.nickname,
            offer,
            candidates,
            self.identity.metadata.clone(),
        );
        let link = payload::build_shareable_link(
            &self.config.link_base,
            connection_token,
            &payload,
            self.config.max_link_len,
        )?;

        self.registry
            .add_pending(
                connection_token,
                session.clone(),
                SessionRole::Offerer,
                Duration::from_millis(self.config.pending_timeout_ms),
            )
            .await?;
        Ok(link)
    }

    /// Answerer: consume a received offer and produce the answer token to
    /// relay back.
    ///
    /// The resulting session is registered as established immediately:
    /// from this side the connection exists as soon as the answer does,
    /// in Connecting state until the transport confirms otherwise.
    pub async fn process_offer(
        &self,
        connection_token: &str,
        offer: SignalingPayload,
    ) -> Result<String> {
        if offer.kind != PayloadKind::Offer {
            return Err(Error::Protocol(
                "processing a payload that is not an offer".to_string(),
            ));
        }
        if self.registry.contains(&offer.peer_id).await {
            return Err(Error::Collision(offer.peer_id));
        }

        let session = self.transport.open_session(SessionRole::Answerer).await?;
        match self.drive_answer(&session, connection_token, offer).await {
            Ok(token) => Ok(token),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    async fn drive_answer(
        &self,
        session: &Arc<dyn SessionHandle>,
        connection_token: &str,
        offer: SignalingPayload,
    ) -> Result<String> {
        let mut events = session.subscribe();
        session
            .set_remote_description(offer.session_description.clone())
            .await?;
        for candidate in offer.candidates.iter().cloned() {
            session.add_remote_candidate(candidate).await?;
        }

        let answer = session.create_answer().await?;
        session.set_local_description(answer.clone()).await?;
        let candidates = gather_candidates(
            &mut events,
            Duration::from_millis(self.config.gather_timeout_ms),
        )
        .await;

        let answer_payload = SignalingPayload::answer(
            &self.identity.peer_id,
            &self.identity.nickname,
            connection_token,
            answer,
            candidates,
            self.identity.metadata.clone(),
        );
        // Encode before registering so a failed encode leaves no entry.
        let answer_token = payload::encode(&answer_payload, self.config.max_link_len)?;

        let metadata = PeerMetadata {
            nickname: offer.nickname.clone(),
            position: offer.metadata.position,
            joined_at: Instant::now(),
            connection_token: connection_token.to_string(),
        };
        self.register_established(&offer.peer_id, session.clone(), metadata)
            .await?;
        Ok(answer_token)
    }

    /// Offerer step two: ingest the relayed answer and promote the pending
    /// negotiation into an established connection.
    ///
    /// The pending entry is consumed by the initial take whether or not
    /// later steps succeed; a mismatched answer does not restore it.
    pub async fn complete_connection(
        &self,
        connection_token: &str,
        answer_token: &str,
    ) -> Result<()> {
        let pending = self
            .registry
            .take_pending(connection_token)
            .await
            .ok_or_else(|| Error::UnknownConnection(connection_token.to_string()))?;

        match self
            .drive_completion(&pending, connection_token, answer_token)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = pending.session.close().await;
                Err(e)
            }
        }
    }

    async fn drive_completion(
        &self,
        pending: &PendingNegotiation,
        connection_token: &str,
        answer_token: &str,
    ) -> Result<()> {
        let answer = payload::decode(answer_token)?;
        if answer.kind != PayloadKind::Answer {
            return Err(Error::Protocol(
                "completing a connection with a payload that is not an answer".to_string(),
            ));
        }
        // Guards against answer/offer cross-wiring when several invites
        // are in flight at once.
        match answer.connection_token.as_deref() {
            Some(token) if token == connection_token => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "answer does not correlate to connection {}",
                    connection_token
                )))
            }
        }

        pending
            .session
            .set_remote_description(answer.session_description.clone())
            .await?;
        for candidate in answer.candidates.iter().cloned() {
            pending.session.add_remote_candidate(candidate).await?;
        }

        let metadata = PeerMetadata {
            nickname: answer.nickname.clone(),
            position: answer.metadata.position,
            joined_at: Instant::now(),
            connection_token: connection_token.to_string(),
        };
        self.register_established(&answer.peer_id, pending.session.clone(), metadata)
            .await
    }

    /// Cancel a pending offer before it is answered. Returns whether one
    /// was actually cancelled; cancelling an expired offer is benign.
    pub async fn cancel_offer(&self, connection_token: &str) -> bool {
        match self.registry.take_pending(connection_token).await {
            Some(pending) => {
                let _ = pending.session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every pending and established session and clear the registry.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    async fn register_established(
        &self,
        peer_id: &str,
        session: Arc<dyn SessionHandle>,
        metadata: PeerMetadata,
    ) -> Result<()> {
        // Subscribe before the entry exists so no transition is missed.
        let events = session.subscribe();
        self.registry
            .add_established(peer_id, session, metadata)
            .await?;
        self.spawn_peer_watch(peer_id.to_string(), events);
        Ok(())
    }

    /// Drive one peer's lifecycle from transport notifications. Events for
    /// a peer no longer in the registry are silently dropped there.
    fn spawn_peer_watch(&self, peer_id: String, mut events: broadcast::Receiver<TransportEvent>) {
        let registry = Arc::clone(&self.registry);
        let connecting_timeout = Duration::from_millis(self.config.connecting_timeout_ms);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(connecting_timeout);
            tokio::pin!(deadline);
            let mut deadline_armed = true;
            loop {
                tokio::select! {
                    () = &mut deadline, if deadline_armed => {
                        deadline_armed = false;
                        // A handshake whose answer never reached the other
                        // side would sit in Connecting forever; drop it.
                        if registry.peer_state(&peer_id).await == Some(PeerState::Connecting) {
                            warn!("peer {} never left connecting, removing", peer_id);
                            let _ = registry.remove(&peer_id).await;
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(TransportEvent::StateChanged(state)) => {
                            if state == PeerState::Connected {
                                deadline_armed = false;
                            }
                            registry.set_peer_state(&peer_id, state).await;
                            if state == PeerState::Closed {
                                break;
                            }
                        }
                        Ok(TransportEvent::TrackArrived(track)) => {
                            registry.set_remote_track(&peer_id, track).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("peer {} watch lagged by {} events", peer_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

/// Collect locally-discovered reachability candidates for a bounded time.
///
/// Resolution is whichever comes first: the transport's gathering-complete
/// signal or the timeout. A partial (even empty) list is acceptable; no
/// candidate is accepted after resolution.
async fn gather_candidates(
    events: &mut broadcast::Receiver<TransportEvent>,
    timeout: Duration,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(
                    "candidate gathering timed out with {} gathered",
                    candidates.len()
                );
                break;
            }
            event = events.recv() => match event {
                Ok(TransportEvent::CandidateDiscovered(candidate)) => candidates.push(candidate),
                Ok(TransportEvent::GatheringComplete) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    candidates
}
