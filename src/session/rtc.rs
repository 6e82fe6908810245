//! webrtc-rs implementation of the transport and capture capabilities

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::error::{Error, Result};
use super::transport::{
    AudioCapture, InboundTrack, OutboundTrack, SessionHandle, Transport, TransportEvent,
};
use super::types::{Candidate, DescriptionKind, PeerState, SessionDescription, SessionRole};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn rtc_err(e: webrtc::Error) -> Error {
    Error::Transport(e.to_string())
}

fn candidate_from_init(init: RTCIceCandidateInit) -> Candidate {
    Candidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn init_from_candidate(candidate: Candidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(rtc_err),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(rtc_err),
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Opens webrtc-rs peer connections configured with the given STUN servers
pub struct RtcTransport {
    stun_servers: Vec<String>,
}

impl RtcTransport {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn open_session(&self, role: SessionRole) -> Result<Arc<dyn SessionHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);

        // The offer must carry an audio section before any track exists;
        // the answerer's transceivers come from applying the remote offer.
        // Later attach_outbound reuses this transceiver's unused sender.
        if role == SessionRole::Offerer {
            pc.add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(rtc_err)?;
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(c) => {
                        if let Ok(init) = c.to_json() {
                            let _ = candidate_tx
                                .send(TransportEvent::CandidateDiscovered(candidate_from_init(init)));
                        }
                    }
                    // The transport signals end-of-gathering with a null
                    // candidate.
                    None => {
                        let _ = candidate_tx.send(TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                debug!("peer connection state: {:?}", state);
                if let Some(mapped) = map_state(state) {
                    let _ = state_tx.send(TransportEvent::StateChanged(mapped));
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                let inbound: Arc<dyn InboundTrack> = Arc::new(RtcInboundTrack::new(track));
                let _ = track_tx.send(TransportEvent::TrackArrived(inbound));
            })
        }));

        debug!("opened transport session as {}", role);
        Ok(Arc::new(RtcSession {
            pc,
            events,
            sender: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<TransportEvent>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SessionHandle for RtcSession {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(rtc_err)
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        self.pc
            .add_ice_candidate(init_from_candidate(candidate))
            .await
            .map_err(rtc_err)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn attach_outbound(&self, track: Arc<dyn OutboundTrack>) -> Result<()> {
        let rtc_track = track
            .as_any()
            .downcast_ref::<RtcOutboundTrack>()
            .ok_or_else(|| Error::Transport("incompatible outbound track".to_string()))?;
        let sender = self
            .pc
            .add_track(rtc_track.local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;
        *self.sender.lock().await = Some(sender);
        Ok(())
    }

    async fn detach_outbound(&self) -> Result<()> {
        if let Some(sender) = self.sender.lock().await.take() {
            self.pc.remove_track(&sender).await.map_err(rtc_err)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc.close().await.map_err(rtc_err)
    }
}

/// Inbound track wrapper; muting gates audibility, not delivery
struct RtcInboundTrack {
    id: String,
    _remote: Arc<TrackRemote>,
    muted: AtomicBool,
}

impl RtcInboundTrack {
    fn new(remote: Arc<TrackRemote>) -> Self {
        Self {
            id: remote.id(),
            _remote: remote,
            muted: AtomicBool::new(false),
        }
    }
}

impl InboundTrack for RtcInboundTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

/// Outbound track backed by a sample-writing local track
pub struct RtcOutboundTrack {
    id: String,
    local: Arc<TrackLocalStaticSample>,
}

impl OutboundTrack for RtcOutboundTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Capture source producing a steady PCMU test tone.
///
/// Stands in for a real microphone behind the same capability surface:
/// acquisition is idempotent and shared, and the writer keeps running until
/// process teardown regardless of how many sessions it feeds.
pub struct ToneCapture {
    freq_hz: f32,
    track: Mutex<Option<Arc<RtcOutboundTrack>>>,
}

const SAMPLE_RATE: u32 = 8000;
const FRAME_MS: u64 = 20;
const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

impl ToneCapture {
    pub fn new(freq_hz: f32) -> Self {
        Self {
            freq_hz,
            track: Mutex::new(None),
        }
    }
}

impl Default for ToneCapture {
    fn default() -> Self {
        Self::new(440.0)
    }
}

#[async_trait]
impl AudioCapture for ToneCapture {
    async fn acquire(&self) -> Result<Arc<dyn OutboundTrack>> {
        let mut guard = self.track.lock().await;
        if let Some(track) = guard.as_ref() {
            return Ok(track.clone());
        }

        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "earshot".to_owned(),
        ));

        let writer = local.clone();
        let step = std::f32::consts::TAU * self.freq_hz / SAMPLE_RATE as f32;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let mut phase = 0f32;
            loop {
                ticker.tick().await;
                let mut frame = Vec::with_capacity(SAMPLES_PER_FRAME);
                for _ in 0..SAMPLES_PER_FRAME {
                    frame.push(linear_to_ulaw((phase.sin() * 8000.0) as i16));
                    phase = (phase + step) % std::f32::consts::TAU;
                }
                let sample = Sample {
                    data: Bytes::from(frame),
                    duration: Duration::from_millis(FRAME_MS),
                    ..Default::default()
                };
                // Writes only fail once the track is gone for good.
                if writer.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        });

        let track = Arc::new(RtcOutboundTrack {
            id: "capture0".to_string(),
            local,
        });
        *guard = Some(track.clone());
        debug!("acquired shared capture source");
        Ok(track)
    }
}

/// G.711 mu-law companding of a linear 16-bit sample
fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut value = i32::from(sample);
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0x00
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (i32::from(exponent) + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}
