//! Call controller: drives one call from idle through calling/ringing to
//! connected and back.
//!
//! Every input — user commands, signal-channel updates, peer connection
//! events, the ring timeout — lands in a single event queue consumed by one
//! driver task, so state transitions happen in one place, in order. The
//! internal `ended` transition tears everything down and lands back at
//! `idle`; the terminal status of the finished call is reported through the
//! snapshot's `last_outcome`.

use crate::config::RtcConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityProvider;
use crate::models::{CallSignal, CallStatus, CallType, UserProfile};
use crate::notify::{ErrorReporter, NoticeKind};
use crate::peer::{MediaSource, PeerEvent, PeerSession};
use crate::signal::{SignalChannel, SignalEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

// ============================================================================
// Public surface
// ============================================================================

#[derive(Debug, Clone)]
pub enum CallCommand {
    Start {
        conversation_id: String,
        receiver_id: String,
        call_type: CallType,
    },
    Accept,
    Reject,
    HangUp,
    SetMuted(bool),
    SetCameraOff(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ActiveCallInfo {
    pub signal_id: String,
    pub conversation_id: String,
    pub peer: UserProfile,
    pub call_type: CallType,
    pub outgoing: bool,
    pub duration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call: Option<ActiveCallInfo>,
    /// Terminal status of the most recently finished call.
    pub last_outcome: Option<CallStatus>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call: None,
            last_outcome: None,
        }
    }
}

pub struct CallController {
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: tokio::task::JoinHandle<()>,
}

impl CallController {
    pub fn spawn(
        config: RtcConfig,
        signals: SignalChannel,
        identity: Arc<dyn IdentityProvider>,
        media: Arc<dyn MediaSource>,
        reporter: ErrorReporter,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(CallSnapshot::default());
        let user_id = identity.user_id();
        let signal_rx = signals.subscribe_for(&user_id);

        let driver = Driver {
            config,
            signals,
            identity,
            media,
            reporter,
            user_id,
            state: State::Idle,
            peer_rx: None,
            ring_deadline: None,
            last_outcome: None,
            snapshot: snap_tx,
        };
        let task = tokio::spawn(driver.run(cmd_rx, signal_rx));

        Self {
            commands: cmd_tx,
            snapshot: snap_rx,
            task,
        }
    }

    pub fn command(&self, command: CallCommand) {
        let _ = self.commands.send(command);
    }

    pub fn start_call(&self, conversation_id: &str, receiver_id: &str, call_type: CallType) {
        self.command(CallCommand::Start {
            conversation_id: conversation_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type,
        });
    }

    pub fn accept(&self) {
        self.command(CallCommand::Accept);
    }

    pub fn reject(&self) {
        self.command(CallCommand::Reject);
    }

    pub fn hang_up(&self) {
        self.command(CallCommand::HangUp);
    }

    pub fn set_muted(&self, muted: bool) {
        self.command(CallCommand::SetMuted(muted));
    }

    pub fn set_camera_off(&self, off: bool) {
        self.command(CallCommand::SetCameraOff(off));
    }

    /// Observable state; UIs watch this instead of polling.
    pub fn snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// True once the driver task has exited. Dropping the controller closes
    /// the command channel, which lets the driver tear down any active
    /// session and stop.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

// ============================================================================
// Driver
// ============================================================================

struct Active {
    signal: CallSignal,
    session: PeerSession,
    peer: UserProfile,
    outgoing: bool,
    /// Candidate-list entries already consumed, so each remote candidate is
    /// applied exactly once even though the whole document is re-delivered.
    seen_candidates: usize,
}

enum State {
    Idle,
    Calling(Active),
    Ringing { signal: CallSignal, caller: UserProfile },
    Connected(Active),
}

enum LoopEvent {
    Cmd(CallCommand),
    Sig(SignalEvent),
    Peer(PeerEvent),
    RingTimeout,
}

struct Driver {
    config: RtcConfig,
    signals: SignalChannel,
    identity: Arc<dyn IdentityProvider>,
    media: Arc<dyn MediaSource>,
    reporter: ErrorReporter,
    user_id: String,
    state: State,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    ring_deadline: Option<Instant>,
    last_outcome: Option<CallStatus>,
    snapshot: watch::Sender<CallSnapshot>,
}

async fn next_peer_event(rx: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> PeerEvent {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn ring_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        loop {
            let deadline = self.ring_deadline;
            let event = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => LoopEvent::Cmd(cmd),
                    None => break,
                },
                sig = signal_rx.recv() => match sig {
                    Some(sig) => LoopEvent::Sig(sig),
                    None => break,
                },
                peer = next_peer_event(&mut self.peer_rx) => LoopEvent::Peer(peer),
                _ = ring_expired(deadline) => LoopEvent::RingTimeout,
            };
            self.handle(event).await;
            self.publish();
        }

        // Controller handle dropped: release devices before exiting.
        let state = std::mem::replace(&mut self.state, State::Idle);
        if let State::Calling(active) | State::Connected(active) = state {
            active.session.teardown().await;
        }
    }

    async fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Cmd(cmd) => self.handle_command(cmd).await,
            LoopEvent::Sig(event) => self.handle_signal(event).await,
            LoopEvent::Peer(event) => self.handle_peer(event).await,
            LoopEvent::RingTimeout => self.handle_ring_timeout().await,
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::Start {
                conversation_id,
                receiver_id,
                call_type,
            } => {
                if !matches!(self.state, State::Idle) {
                    self.reporter
                        .notify(NoticeKind::Signal, Error::CallInProgress.to_string());
                    return;
                }
                if let Err(e) = self.start_call(&conversation_id, &receiver_id, call_type).await {
                    let kind = if matches!(e, Error::Media(_)) {
                        NoticeKind::Media
                    } else {
                        NoticeKind::Signal
                    };
                    self.reporter.notify(kind, e.to_string());
                }
            }
            CallCommand::Accept => self.accept().await,
            CallCommand::Reject => self.decline().await,
            CallCommand::HangUp => self.hang_up().await,
            CallCommand::SetMuted(muted) => {
                if let State::Calling(active) | State::Connected(active) = &self.state {
                    active.session.set_muted(muted);
                }
            }
            CallCommand::SetCameraOff(off) => {
                if let State::Calling(active) | State::Connected(active) = &self.state {
                    active.session.set_camera_off(off);
                }
            }
        }
    }

    /// idle -> calling: media, signal row, peer session, offer. Any failure
    /// rolls back to idle with the partial session torn down.
    async fn start_call(
        &mut self,
        conversation_id: &str,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<()> {
        let peer = match self.identity.profile(receiver_id).await {
            Ok(profile) => profile,
            Err(_) => UserProfile::placeholder(receiver_id),
        };

        let tracks = self.media.capture(call_type).await?;

        let signal = self
            .signals
            .create(conversation_id, &self.user_id, receiver_id, call_type)
            .await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let session = match PeerSession::new(&self.config, tracks, peer_tx).await {
            Ok(session) => session,
            Err(e) => {
                let _ = self.signals.finish(&signal.id, CallStatus::Ended).await;
                return Err(e);
            }
        };

        let setup: Result<()> = async {
            let offer = session.create_offer().await?;
            self.signals.write_offer(&signal.id, offer).await?;
            Ok(())
        }
        .await;
        if let Err(e) = setup {
            session.teardown().await;
            let _ = self.signals.finish(&signal.id, CallStatus::Ended).await;
            return Err(e);
        }

        self.peer_rx = Some(peer_rx);
        self.ring_deadline = self.ring_deadline_from_now();
        self.state = State::Calling(Active {
            signal,
            session,
            peer,
            outgoing: true,
            seen_candidates: 0,
        });
        Ok(())
    }

    /// ringing -> connected, optimistically on successful answer creation.
    async fn accept(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        let State::Ringing { signal, caller } = state else {
            self.state = state;
            self.reporter
                .notify(NoticeKind::Signal, Error::NoActiveCall.to_string());
            return;
        };

        let signal_id = signal.id.clone();
        match self.answer_call(signal, caller).await {
            Ok(active) => {
                self.ring_deadline = None;
                self.state = State::Connected(active);
            }
            Err(e) => {
                let kind = if matches!(e, Error::Media(_)) {
                    NoticeKind::Media
                } else {
                    NoticeKind::Signal
                };
                self.reporter.notify(kind, e.to_string());
                let _ = self.signals.finish(&signal_id, CallStatus::Ended).await;
                self.end_with(CallStatus::Ended);
            }
        }
    }

    async fn answer_call(&mut self, signal: CallSignal, caller: UserProfile) -> Result<Active> {
        // Re-read: the ring was triggered by the insert, the caller's offer
        // write may have landed after it.
        let fresh = self.signals.get(&signal.id).await?;
        if fresh.status.is_terminal() {
            return Err(Error::SignalTerminal(fresh.id));
        }
        let offer = fresh
            .signal_data
            .offer
            .clone()
            .ok_or_else(|| Error::Signal(format!("no offer on signal {}", fresh.id)))?;

        let tracks = self.media.capture(fresh.call_type).await?;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(&self.config, tracks, peer_tx).await?;

        let setup: Result<()> = async {
            session.apply_remote_description(offer).await?;
            let answer = session.create_answer().await?;
            self.signals.write_answer(&fresh.id, answer).await?;
            self.signals.accept(&fresh.id).await?;
            Ok(())
        }
        .await;
        if let Err(e) = setup {
            session.teardown().await;
            return Err(e);
        }

        let mut active = Active {
            signal: fresh,
            session,
            peer: caller,
            outgoing: false,
            seen_candidates: 0,
        };
        self.apply_new_candidates(&mut active).await;
        self.peer_rx = Some(peer_rx);
        Ok(active)
    }

    async fn decline(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Ringing { signal, .. } => {
                if let Err(e) = self.signals.finish(&signal.id, CallStatus::Rejected).await {
                    self.reporter.notify(NoticeKind::Signal, e.to_string());
                }
                self.end_with(CallStatus::Rejected);
            }
            other => {
                self.state = other;
                self.reporter
                    .notify(NoticeKind::Signal, Error::NoActiveCall.to_string());
            }
        }
    }

    async fn hang_up(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            // Canceled before the receiver ever answered: missed on their side.
            State::Calling(active) => {
                if let Err(e) = self.signals.finish(&active.signal.id, CallStatus::Missed).await {
                    log::warn!("failed to finish signal {}: {e}", active.signal.id);
                }
                active.session.teardown().await;
                self.end_with(CallStatus::Missed);
            }
            State::Ringing { signal, .. } => {
                if let Err(e) = self.signals.finish(&signal.id, CallStatus::Rejected).await {
                    log::warn!("failed to finish signal {}: {e}", signal.id);
                }
                self.end_with(CallStatus::Rejected);
            }
            State::Connected(active) => {
                if let Err(e) = self.signals.finish(&active.signal.id, CallStatus::Ended).await {
                    log::warn!("failed to finish signal {}: {e}", active.signal.id);
                }
                active.session.teardown().await;
                self.end_with(CallStatus::Ended);
            }
            State::Idle => {
                log::debug!("hangup with no active call");
            }
        }
    }

    // ------------------------------------------------------------------
    // Signal channel events
    // ------------------------------------------------------------------

    async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Incoming(signal) => {
                if !matches!(self.state, State::Idle) {
                    // One active call per user; no call waiting.
                    log::debug!("ignoring incoming call {} while busy", signal.id);
                    return;
                }
                let caller = match self.identity.profile(&signal.caller_id).await {
                    Ok(profile) => profile,
                    Err(_) => UserProfile::placeholder(&signal.caller_id),
                };
                self.ring_deadline = self.ring_deadline_from_now();
                self.state = State::Ringing { signal, caller };
            }
            SignalEvent::Updated(update) => self.handle_signal_update(update).await,
        }
    }

    async fn handle_signal_update(&mut self, update: CallSignal) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Calling(mut active) if active.signal.id == update.id => {
                if update.status.is_terminal() {
                    // The other side hung up or declined before we connected.
                    active.session.teardown().await;
                    self.end_with(update.status);
                    return;
                }
                if let (CallStatus::Accepted, Some(answer)) =
                    (update.status, update.signal_data.answer.clone())
                {
                    active.signal = update;
                    if let Err(e) = active.session.apply_remote_description(answer).await {
                        self.reporter.notify(NoticeKind::Signal, e.to_string());
                        let _ = self.signals.finish(&active.signal.id, CallStatus::Ended).await;
                        active.session.teardown().await;
                        self.end_with(CallStatus::Ended);
                        return;
                    }
                    self.apply_new_candidates(&mut active).await;
                    self.ring_deadline = None;
                    self.state = State::Connected(active);
                } else {
                    // Candidate appends while the far side still rings.
                    active.signal = update;
                    self.apply_new_candidates(&mut active).await;
                    self.state = State::Calling(active);
                }
            }
            State::Connected(mut active) if active.signal.id == update.id => {
                if update.status.is_terminal() {
                    active.session.teardown().await;
                    self.end_with(update.status);
                    return;
                }
                active.signal = update;
                self.apply_new_candidates(&mut active).await;
                self.state = State::Connected(active);
            }
            State::Ringing { signal, caller } if signal.id == update.id => {
                if update.status.is_terminal() {
                    // Caller gave up before we answered.
                    self.end_with(update.status);
                    return;
                }
                // Keep the freshest copy; the offer may arrive after the ring.
                self.state = State::Ringing { signal: update, caller };
            }
            other => {
                log::debug!("ignoring update for inactive signal {}", update.id);
                self.state = other;
            }
        }
    }

    /// Applies every not-yet-seen candidate contributed by the other side,
    /// in arrival order. The session buffers them if its remote description
    /// is not set yet.
    async fn apply_new_candidates(&self, active: &mut Active) {
        let start = active.seen_candidates.min(active.signal.signal_data.candidates.len());
        for entry in active.signal.signal_data.candidates[start..].iter() {
            if entry.by != self.user_id {
                active.session.add_remote_candidate(entry.candidate.clone()).await;
            }
        }
        active.seen_candidates = active.signal.signal_data.candidates.len();
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn handle_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let signal_id = match &self.state {
                    State::Calling(active) | State::Connected(active) => Some(active.signal.id.clone()),
                    _ => None,
                };
                if let Some(id) = signal_id {
                    match self.signals.append_candidate(&id, &self.user_id, candidate).await {
                        Ok(()) => {}
                        // The other side already finished the call; its
                        // terminal update is on the way through the
                        // subscription.
                        Err(Error::SignalTerminal(_)) => {}
                        Err(e) => {
                            // A dropped signal write mid-call is fatal for
                            // the attempt; no retry.
                            self.reporter.notify(NoticeKind::Signal, e.to_string());
                            self.abort_call(CallStatus::Ended).await;
                        }
                    }
                }
            }
            PeerEvent::StateChanged(state) => match state {
                RTCPeerConnectionState::Connected => {
                    if let State::Calling(active) | State::Connected(active) = &self.state {
                        active.session.start_timer();
                    }
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    // Handles silent network death without a remote signal.
                    if matches!(self.state, State::Calling(_) | State::Connected(_)) {
                        self.abort_call(CallStatus::Ended).await;
                    }
                }
                _ => {}
            },
            PeerEvent::RemoteTrack { ssrc, kind } => {
                log::debug!("remote {kind} track arrived (ssrc {ssrc})");
            }
        }
    }

    async fn handle_ring_timeout(&mut self) {
        if matches!(self.state, State::Calling(_) | State::Ringing { .. }) {
            log::info!("ring timeout, resolving call as missed");
            self.abort_call(CallStatus::Missed).await;
        } else {
            self.ring_deadline = None;
        }
    }

    // ------------------------------------------------------------------
    // Shared exit path
    // ------------------------------------------------------------------

    async fn abort_call(&mut self, outcome: CallStatus) {
        let state = std::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Calling(active) | State::Connected(active) => {
                let _ = self.signals.finish(&active.signal.id, outcome).await;
                active.session.teardown().await;
                self.end_with(outcome);
            }
            State::Ringing { signal, .. } => {
                let _ = self.signals.finish(&signal.id, outcome).await;
                self.end_with(outcome);
            }
            State::Idle => {}
        }
    }

    fn end_with(&mut self, outcome: CallStatus) {
        self.last_outcome = Some(outcome);
        self.ring_deadline = None;
        self.peer_rx = None;
        self.state = State::Idle;
    }

    fn ring_deadline_from_now(&self) -> Option<Instant> {
        self.config
            .ring_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }

    fn publish(&self) {
        let (phase, call) = match &self.state {
            State::Idle => (CallPhase::Idle, None),
            State::Calling(active) => (CallPhase::Calling, Some(Self::info(active))),
            State::Ringing { signal, caller } => (
                CallPhase::Ringing,
                Some(ActiveCallInfo {
                    signal_id: signal.id.clone(),
                    conversation_id: signal.conversation_id.clone(),
                    peer: caller.clone(),
                    call_type: signal.call_type,
                    outgoing: false,
                    duration_secs: 0,
                }),
            ),
            State::Connected(active) => (CallPhase::Connected, Some(Self::info(active))),
        };
        self.snapshot.send_replace(CallSnapshot {
            phase,
            call,
            last_outcome: self.last_outcome,
        });
    }

    fn info(active: &Active) -> ActiveCallInfo {
        ActiveCallInfo {
            signal_id: active.signal.id.clone(),
            conversation_id: active.signal.conversation_id.clone(),
            peer: active.peer.clone(),
            call_type: active.signal.call_type,
            outgoing: active.outgoing,
            duration_secs: active.session.duration_secs(),
        }
    }
}
