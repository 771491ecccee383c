//! Peer session: owns the lifetime of one realtime audio/video connection.
//!
//! One session per call attempt. Local media comes in through the
//! [`MediaSource`] seam, remote candidates that arrive before the remote
//! description are buffered and flushed in arrival order, and teardown is
//! idempotent so every exit path can call it unconditionally.

use crate::config::RtcConfig;
use crate::error::Result;
use crate::models::CallType;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// Media source
// ============================================================================

/// Supplies local capture tracks for a call: microphone always, camera when
/// the call is video. Device and permission failures surface as
/// [`Error::Media`], which callers keep distinct from signaling failures.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self, call_type: CallType) -> Result<Vec<Arc<TrackLocalStaticSample>>>;
}

/// Headless media source: creates sample tracks without touching devices.
/// The embedding application writes captured samples into the tracks.
pub struct StaticMediaSource;

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn capture(&self, call_type: CallType) -> Result<Vec<Arc<TrackLocalStaticSample>>> {
        let mut tracks = vec![Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "unitynets-audio".to_owned(),
        ))];
        if call_type == CallType::Video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                "unitynets-video".to_owned(),
            )));
        }
        Ok(tracks)
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate, ready to be published through the
    /// signal channel.
    LocalCandidate(RTCIceCandidateInit),
    RemoteTrack { ssrc: u32, kind: String },
    StateChanged(RTCPeerConnectionState),
}

#[derive(Debug, Clone)]
pub struct RemoteTrackInfo {
    pub ssrc: u32,
    pub kind: String,
}

// ============================================================================
// Candidate buffering
// ============================================================================

/// Candidates received before the remote description is set cannot be
/// applied yet; they queue here and flush in arrival order exactly once.
struct CandidateBuffer {
    queued: Vec<RTCIceCandidateInit>,
    ready: bool,
}

impl CandidateBuffer {
    fn new() -> Self {
        Self {
            queued: Vec::new(),
            ready: false,
        }
    }

    /// Returns the candidate when it can be applied immediately, `None` when
    /// it was queued.
    fn push(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.ready {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    fn mark_ready(&mut self) -> Vec<RTCIceCandidateInit> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        std::mem::take(&mut self.queued)
    }

    fn queued_len(&self) -> usize {
        self.queued.len()
    }
}

// ============================================================================
// Duration counter
// ============================================================================

struct CallTimer {
    seconds: Arc<AtomicU64>,
    task: tokio::task::JoinHandle<()>,
}

impl CallTimer {
    fn start() -> Self {
        let seconds = Arc::new(AtomicU64::new(0));
        let counter = seconds.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        Self { seconds, task }
    }

    fn elapsed_secs(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Peer session
// ============================================================================

pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Vec<Arc<TrackLocalStaticSample>>,
    remote_tracks: Arc<RwLock<Vec<RemoteTrackInfo>>>,
    buffer: Mutex<CandidateBuffer>,
    timer: Mutex<Option<CallTimer>>,
    muted: AtomicBool,
    camera_off: AtomicBool,
    torn_down: AtomicBool,
}

impl PeerSession {
    /// Builds the connection, attaches the local tracks, and wires candidate,
    /// remote-track and connection-state callbacks into `events`.
    pub async fn new(
        config: &RtcConfig,
        local_tracks: Vec<Arc<TrackLocalStaticSample>>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: config.stun_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await?,
        );

        for track in &local_tracks {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(PeerEvent::LocalCandidate(init));
                        }
                        Err(e) => log::warn!("failed to serialize local candidate: {e}"),
                    }
                }
            })
        }));

        let tx = events.clone();
        let remote_tracks = Arc::new(RwLock::new(Vec::new()));
        let registry = remote_tracks.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let info = RemoteTrackInfo {
                        ssrc: track.ssrc(),
                        kind: track.kind().to_string(),
                    };
                    registry.write().push(info.clone());
                    let _ = tx.send(PeerEvent::RemoteTrack {
                        ssrc: info.ssrc,
                        kind: info.kind,
                    });
                })
            },
        ));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::StateChanged(state));
            })
        }));

        Ok(Self {
            pc,
            local_tracks,
            remote_tracks,
            buffer: Mutex::new(CandidateBuffer::new()),
            timer: Mutex::new(None),
            muted: AtomicBool::new(false),
            camera_off: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies the remote offer or answer, then flushes every buffered
    /// candidate in arrival order. One bad candidate is logged and skipped;
    /// it does not fail the call.
    pub async fn apply_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc).await?;
        let flushable = self.buffer.lock().mark_ready();
        for candidate in flushable {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::warn!("skipping buffered candidate: {e}");
            }
        }
        Ok(())
    }

    /// Feeds a remote candidate in. Buffered until the remote description is
    /// set; individual apply failures are logged and skipped.
    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let apply_now = self.buffer.lock().push(candidate);
        if let Some(candidate) = apply_now {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::warn!("skipping candidate: {e}");
            }
        }
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrackInfo> {
        self.remote_tracks.read().clone()
    }

    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.local_tracks
    }

    /// Starts the one-second duration counter. No-op if already running.
    pub fn start_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            *timer = Some(CallTimer::start());
        }
    }

    pub fn duration_secs(&self) -> u64 {
        self.timer.lock().as_ref().map(|t| t.elapsed_secs()).unwrap_or(0)
    }

    /// Local mute toggle. Consulted by whatever writes samples into the
    /// audio track; never touches the signal channel.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Local camera toggle; same contract as [`set_muted`].
    ///
    /// [`set_muted`]: PeerSession::set_muted
    pub fn set_camera_off(&self, off: bool) {
        self.camera_off.store(off, Ordering::SeqCst);
    }

    pub fn is_camera_off(&self) -> bool {
        self.camera_off.load(Ordering::SeqCst)
    }

    /// Stops the timer, releases media, closes the connection. Safe to call
    /// any number of times, on every exit path.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
        if let Err(e) = self.pc.close().await {
            log::warn!("error closing peer connection: {e}");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn buffered_candidates(&self) -> usize {
        self.buffer.lock().queued_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_candidate(tag: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("bogus:{tag}"),
            ..Default::default()
        }
    }

    #[test]
    fn buffer_queues_until_ready_then_passes_through() {
        let mut buffer = CandidateBuffer::new();

        assert!(buffer.push(fake_candidate("one")).is_none());
        assert!(buffer.push(fake_candidate("two")).is_none());
        assert_eq!(buffer.queued_len(), 2);

        let flushed = buffer.mark_ready();
        let tags: Vec<&str> = flushed.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(tags, vec!["bogus:one", "bogus:two"]);

        // Exactly once: a second flush yields nothing.
        assert!(buffer.mark_ready().is_empty());

        // After readiness, candidates apply directly.
        assert!(buffer.push(fake_candidate("three")).is_some());
        assert_eq!(buffer.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_counter_ticks_once_per_second() {
        let timer = CallTimer::start();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        assert_eq!(timer.elapsed_secs(), 3);
        timer.stop();
    }

    #[tokio::test]
    async fn static_source_matches_call_type() {
        let source = StaticMediaSource;
        assert_eq!(source.capture(CallType::Voice).await.unwrap().len(), 1);
        assert_eq!(source.capture(CallType::Video).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracks = StaticMediaSource.capture(CallType::Voice).await.unwrap();
        let session = PeerSession::new(&RtcConfig::default(), tracks, tx).await.unwrap();

        session.start_timer();
        session.teardown().await;
        session.teardown().await;
        session.teardown().await;

        assert!(session.is_torn_down());
        assert_eq!(session.connection_state(), RTCPeerConnectionState::Closed);
        assert_eq!(session.duration_secs(), 0);
    }

    #[tokio::test]
    async fn offer_answer_exchange_flushes_buffered_candidates() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let caller = PeerSession::new(
            &RtcConfig::default(),
            StaticMediaSource.capture(CallType::Voice).await.unwrap(),
            tx_a,
        )
        .await
        .unwrap();
        let callee = PeerSession::new(
            &RtcConfig::default(),
            StaticMediaSource.capture(CallType::Voice).await.unwrap(),
            tx_b,
        )
        .await
        .unwrap();

        // Candidates arriving before the remote description queue up.
        callee.add_remote_candidate(fake_candidate("early")).await;
        assert_eq!(callee.buffered_candidates(), 1);

        let offer = caller.create_offer().await.unwrap();
        // A malformed buffered candidate is skipped, not fatal.
        callee.apply_remote_description(offer).await.unwrap();
        assert_eq!(callee.buffered_candidates(), 0);

        let answer = callee.create_answer().await.unwrap();
        caller.apply_remote_description(answer).await.unwrap();

        assert!(caller.pc.remote_description().await.is_some());
        assert!(callee.pc.remote_description().await.is_some());

        caller.teardown().await;
        callee.teardown().await;
    }
}
