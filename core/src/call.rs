//! Call negotiation engine
//!
//! One actor task owns the call state, the peer connection and the media
//! streams. User commands, inbound signals, peer events and ring timeouts
//! are queued on a single channel and handled strictly one at a time.
//!
//! The party that placed the call is the only one that creates an offer and the only
//! party that logs a call summary into the conversation.

use crate::chat::ChatChannel;
use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::listeners::ListenerId;
use crate::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::models::{
    CallSignal, CallState, ChatMessage, IceCandidate, SessionDescription, SignalType,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
use crate::signaling::{SignalChannel, SignalFilter};
use crate::subscription::ConversationTracker;
use crate::transport::BrokerClient;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub from_user_id: String,
    pub conversation_id: String,
    pub is_video: bool,
    pub received_at: DateTime<Utc>,
}

impl IncomingCall {
    pub fn notification_title(&self) -> String {
        if self.is_video {
            "Incoming video call".to_string()
        } else {
            "Incoming voice call".to_string()
        }
    }

    pub fn notification_body(&self) -> String {
        format!("{} is calling you", self.from_user_id)
    }
}

/// Read-only view of the engine for rendering.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub is_video: bool,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_caller: bool,
    pub peer_user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub incoming_call: Option<IncomingCall>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Completed { duration: Duration },
    /// Never reached CONNECTED (unanswered, cancelled or timed out).
    Missed,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub conversation_id: String,
    pub is_video: bool,
    pub outcome: CallOutcome,
}

impl CallSummary {
    pub fn message_text(&self) -> String {
        let kind = if self.is_video { "Video call" } else { "Voice call" };
        match &self.outcome {
            CallOutcome::Completed { duration } => {
                let secs = duration.as_secs();
                format!("{} ended, duration {}:{:02}", kind, secs / 60, secs % 60)
            }
            CallOutcome::Missed => format!("Missed {}", kind.to_lowercase()),
            CallOutcome::Declined => format!("{} declined", kind),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall {
        call: IncomingCall,
        title: String,
        body: String,
    },
    RemoteTrack(Arc<MediaTrack>),
    Error(String),
    Summary(CallSummary),
}

// ============================================================================
// Engine handle
// ============================================================================

enum Command {
    Start {
        video: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Accept {
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        reply: oneshot::Sender<Result<()>>,
    },
    End {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleCamera {
        reply: oneshot::Sender<bool>,
    },
    Signal(CallSignal),
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    RingTimeout {
        attempt: u64,
    },
    Shutdown,
}

pub(crate) struct CallDeps {
    pub(crate) transport: BrokerClient,
    pub(crate) tracker: ConversationTracker,
    pub(crate) signaling: SignalChannel,
    pub(crate) chat: ChatChannel,
    pub(crate) media: Arc<dyn MediaDevices>,
    pub(crate) peers: Arc<dyn PeerConnectionFactory>,
    pub(crate) config: CallConfig,
}

/// Handle to the call actor. Dropping it tears down any active call.
pub struct CallEngine {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    signaling: SignalChannel,
    signal_listener: ListenerId,
}

impl CallEngine {
    /// Spawn the actor. Must be called inside a tokio runtime.
    pub(crate) fn spawn(deps: CallDeps) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::default());
        let (events, _) = broadcast::channel(64);

        let tx = commands.clone();
        let signal_listener = deps.signaling.on_call_signal_received(move |signal| {
            let _ = tx.send(Command::Signal(signal.clone()));
        });
        let signaling = deps.signaling.clone();

        let actor = Actor::new(deps, commands.clone(), snapshot_tx, events.clone());
        tokio::spawn(actor.run(rx));

        Self {
            commands,
            snapshot,
            events,
            signaling,
            signal_listener,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::EngineStopped)?;
        response.await.map_err(|_| Error::EngineStopped)
    }

    /// Ring the other participant of the joined conversation.
    pub async fn start_call(&self, video: bool) -> Result<()> {
        self.request(|reply| Command::Start { video, reply }).await?
    }

    pub async fn accept_call(&self) -> Result<()> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    pub async fn reject_call(&self) -> Result<()> {
        self.request(|reply| Command::Reject { reply }).await?
    }

    /// Hang up. A no-op when idle.
    pub async fn end_call(&self) -> Result<()> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Returns whether the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Returns whether the camera is now off.
    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleCamera { reply }).await
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        self.signaling.remove_listener(self.signal_listener);
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Actor {
    deps: CallDeps,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,

    state: CallState,
    is_video: bool,
    is_muted: bool,
    is_camera_off: bool,
    is_caller: bool,
    peer_user_id: Option<String>,
    conversation_id: Option<String>,
    incoming: Option<IncomingCall>,

    local_stream: Option<MediaStream>,
    remote_stream: MediaStream,
    peer: Option<Arc<dyn PeerConnection>>,
    /// Bumped whenever the peer slot changes; events of older peers are dropped.
    peer_generation: u64,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,

    /// Bumped by every outgoing call; stale ring timeouts are ignored.
    attempt: u64,
    accepted: bool,
    offer_sent: bool,
    declined: bool,
    summary_pending: bool,
    connected_at: Option<Instant>,
    connected_since: Option<DateTime<Utc>>,
}

impl Actor {
    fn new(
        deps: CallDeps,
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Sender<CallSnapshot>,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            deps,
            commands,
            snapshot,
            events,
            state: CallState::Idle,
            is_video: false,
            is_muted: false,
            is_camera_off: false,
            is_caller: false,
            peer_user_id: None,
            conversation_id: None,
            incoming: None,
            local_stream: None,
            remote_stream: MediaStream::default(),
            peer: None,
            peer_generation: 0,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            attempt: 0,
            accepted: false,
            offer_sent: false,
            declined: false,
            summary_pending: false,
            connected_at: None,
            connected_since: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Start { video, reply } => {
                    let _ = reply.send(self.start_call(video).await);
                }
                Command::Accept { reply } => {
                    let _ = reply.send(self.accept_call().await);
                }
                Command::Reject { reply } => {
                    let _ = reply.send(self.reject_call().await);
                }
                Command::End { reply } => {
                    let _ = reply.send(self.end_call().await);
                }
                Command::ToggleMute { reply } => {
                    let _ = reply.send(self.toggle_mute());
                }
                Command::ToggleCamera { reply } => {
                    let _ = reply.send(self.toggle_camera());
                }
                Command::Signal(signal) => self.on_signal(signal).await,
                Command::Peer { generation, event } => {
                    if generation == self.peer_generation {
                        self.on_peer_event(event).await;
                    }
                }
                Command::RingTimeout { attempt } => self.on_ring_timeout(attempt).await,
                Command::Shutdown => break,
            }
            self.publish();
        }

        if let Err(e) = self.end_call().await {
            log::debug!("Hanging up on shutdown failed: {}", e);
        }
        self.teardown().await;
        log::debug!("Call engine stopped");
    }

    // ------------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------------

    async fn start_call(&mut self, video: bool) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(Error::InvalidCallState(format!(
                "cannot start a call while {:?}",
                self.state
            )));
        }
        if self.local_user_id().is_none() {
            return Err(Error::NotAuthenticated);
        }
        let conversation_id = self.deps.tracker.current_conversation().ok_or_else(|| {
            Error::InvalidCallState("no conversation joined".to_string())
        })?;

        self.attempt += 1;
        self.is_video = video;
        self.is_caller = true;
        self.summary_pending = true;
        self.conversation_id = Some(conversation_id);
        self.transition(CallState::Outgoing);

        // Start from a fresh connection object.
        self.close_peer().await;
        let prepared = match self.acquire_media(video).await {
            Ok(()) => self.ensure_peer_connection().await.map(|_| ()).map_err(|e| {
                self.fail(&e);
                e
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            // Nobody was rung, so there is nothing to summarize.
            self.summary_pending = false;
            self.teardown().await;
            return Err(e);
        }

        self.send_signal(SignalType::CallInit, None);
        self.schedule_ring_timeout();
        log::info!(
            "Calling in conversation {:?} (video: {})",
            self.conversation_id,
            video
        );
        Ok(())
    }

    async fn accept_call(&mut self) -> Result<()> {
        let incoming = match (&self.incoming, self.state) {
            (Some(incoming), CallState::Incoming) => incoming.clone(),
            _ => return Err(Error::NoIncomingCall),
        };

        self.incoming = None;
        self.is_caller = false;
        self.is_video = incoming.is_video;
        self.peer_user_id = Some(incoming.from_user_id.clone());
        self.conversation_id = Some(incoming.conversation_id.clone());
        self.transition(CallState::Outgoing);

        let prepared = match self.acquire_media(incoming.is_video).await {
            Ok(()) => self.ensure_peer_connection().await.map(|_| ()).map_err(|e| {
                self.fail(&e);
                e
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            // The caller is already ringing; tell it we are not coming.
            self.send_signal(SignalType::CallReject, Some(incoming.from_user_id));
            self.teardown().await;
            return Err(e);
        }

        self.send_signal(SignalType::CallAccept, Some(incoming.from_user_id.clone()));
        log::info!("Accepted call from {}", incoming.from_user_id);
        Ok(())
    }

    async fn reject_call(&mut self) -> Result<()> {
        let incoming = match (&self.incoming, self.state) {
            (Some(incoming), CallState::Incoming) => incoming.clone(),
            _ => return Err(Error::NoIncomingCall),
        };

        self.conversation_id = Some(incoming.conversation_id.clone());
        self.send_signal(SignalType::CallReject, Some(incoming.from_user_id.clone()));
        log::info!("Rejected call from {}", incoming.from_user_id);
        self.teardown().await;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<()> {
        if self.state == CallState::Idle {
            return Ok(());
        }
        if let Some(incoming) = &self.incoming {
            self.conversation_id = Some(incoming.conversation_id.clone());
            self.peer_user_id = Some(incoming.from_user_id.clone());
        }

        self.transition(CallState::Ending);
        self.send_signal(SignalType::CallEnd, self.peer_user_id.clone());
        self.teardown().await;
        Ok(())
    }

    fn toggle_mute(&mut self) -> bool {
        self.is_muted = !self.is_muted;
        if let Some(stream) = &self.local_stream {
            stream.set_enabled(TrackKind::Audio, !self.is_muted);
        }
        self.is_muted
    }

    fn toggle_camera(&mut self) -> bool {
        self.is_camera_off = !self.is_camera_off;
        if let Some(stream) = &self.local_stream {
            stream.set_enabled(TrackKind::Video, !self.is_camera_off);
        }
        self.is_camera_off
    }

    // ------------------------------------------------------------------------
    // Inbound signals
    // ------------------------------------------------------------------------

    async fn on_signal(&mut self, signal: CallSignal) {
        let Some(local_user_id) = self.local_user_id() else {
            return;
        };
        let conversation_id = match &self.conversation_id {
            Some(id) if self.state.is_active() => id.clone(),
            _ => match self.deps.tracker.current_conversation() {
                Some(id) => id,
                None => return,
            },
        };
        if !SignalFilter::new(local_user_id, conversation_id).accepts(&signal) {
            log::trace!("Ignoring {:?} from {}", signal.signal_type, signal.from_user_id);
            return;
        }

        log::debug!(
            "Received {:?} from {} while {:?}",
            signal.signal_type,
            signal.from_user_id,
            self.state
        );

        match signal.signal_type {
            SignalType::CallInit => self.on_call_init(signal).await,
            SignalType::CallAccept => self.on_call_accept(signal).await,
            SignalType::Offer => self.on_offer(signal).await,
            SignalType::Answer => self.on_answer(signal).await,
            SignalType::Candidate => self.on_candidate(signal).await,
            SignalType::CallReject => {
                if self.state.is_active() {
                    log::info!("Call declined by {}", signal.from_user_id);
                    self.declined = true;
                    self.teardown().await;
                }
            }
            SignalType::CallEnd => {
                if self.state.is_active() {
                    log::info!("Call ended by {}", signal.from_user_id);
                    self.teardown().await;
                }
            }
        }
    }

    async fn on_call_init(&mut self, signal: CallSignal) {
        if self.state == CallState::Outgoing && self.is_caller && !self.accepted {
            self.on_simultaneous_call(signal).await;
            return;
        }
        if self.state.is_active() {
            log::info!(
                "New call from {} supersedes the current {:?} call",
                signal.from_user_id,
                self.state
            );
            self.teardown().await;
        }

        let incoming = self.ring(signal);
        let _ = self.events.send(CallEvent::IncomingCall {
            title: incoming.notification_title(),
            body: incoming.notification_body(),
            call: incoming,
        });
    }

    /// Both parties rang each other. The lower user id keeps the caller
    /// role; the other side drops its own attempt and answers.
    async fn on_simultaneous_call(&mut self, signal: CallSignal) {
        let local_user_id = self.local_user_id().unwrap_or_default();
        if local_user_id < signal.from_user_id {
            log::info!("{} called at the same time, keeping the caller role", signal.from_user_id);
            return;
        }

        log::info!("{} called at the same time, answering their call", signal.from_user_id);
        // Our own attempt never rang anyone, so it is not a missed call.
        self.summary_pending = false;
        self.teardown().await;
        self.ring(signal);
        if let Err(e) = self.accept_call().await {
            log::warn!("Answering the simultaneous call failed: {}", e);
        }
    }

    fn ring(&mut self, signal: CallSignal) -> IncomingCall {
        let incoming = IncomingCall {
            from_user_id: signal.from_user_id.clone(),
            conversation_id: signal.conversation_id.clone(),
            is_video: signal.is_video,
            received_at: Utc::now(),
        };
        self.is_video = incoming.is_video;
        self.peer_user_id = Some(incoming.from_user_id.clone());
        self.conversation_id = Some(incoming.conversation_id.clone());
        self.incoming = Some(incoming.clone());
        self.transition(CallState::Incoming);
        incoming
    }

    async fn on_call_accept(&mut self, signal: CallSignal) {
        if self.state != CallState::Outgoing || !self.is_caller || self.offer_sent {
            log::debug!("Ignoring CALL_ACCEPT while {:?}", self.state);
            return;
        }
        self.accepted = true;
        self.peer_user_id = Some(signal.from_user_id.clone());

        if let Err(e) = self.send_offer(&signal.from_user_id).await {
            self.abort_call(&e).await;
        }
    }

    async fn send_offer(&mut self, to: &str) -> Result<()> {
        let peer = self.ensure_peer_connection().await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.offer_sent = true;
        self.send_payload(SignalType::Offer, Some(to.to_string()), serde_json::to_value(&offer)?);
        log::info!("Sent offer to {}", to);
        Ok(())
    }

    async fn on_offer(&mut self, signal: CallSignal) {
        if self.state != CallState::Outgoing || self.is_caller {
            log::debug!("Ignoring OFFER while {:?}", self.state);
            return;
        }
        let result = async {
            let offer = parse_payload::<SessionDescription>(&signal)?;
            let peer = self.ensure_peer_connection().await?;
            peer.set_remote_description(offer).await?;
            self.remote_description_set = true;
            self.flush_candidates(&peer).await;

            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            self.send_payload(
                SignalType::Answer,
                Some(signal.from_user_id.clone()),
                serde_json::to_value(&answer)?,
            );
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => self.mark_connected(),
            Err(e) => self.abort_call(&e).await,
        }
    }

    async fn on_answer(&mut self, signal: CallSignal) {
        if self.state != CallState::Outgoing || !self.is_caller || !self.offer_sent {
            log::debug!("Ignoring ANSWER while {:?}", self.state);
            return;
        }
        let result = async {
            let answer = parse_payload::<SessionDescription>(&signal)?;
            let peer = self.ensure_peer_connection().await?;
            peer.set_remote_description(answer).await?;
            self.remote_description_set = true;
            self.flush_candidates(&peer).await;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => self.mark_connected(),
            Err(e) => self.abort_call(&e).await,
        }
    }

    async fn on_candidate(&mut self, signal: CallSignal) {
        if !self.state.is_active() {
            return;
        }
        let candidate = match parse_payload::<IceCandidate>(&signal) {
            Ok(candidate) => candidate,
            Err(e) => {
                log::debug!("Dropping malformed candidate: {}", e);
                return;
            }
        };

        let peer = match self.ensure_peer_connection().await {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("No peer connection for remote candidate: {}", e);
                return;
            }
        };
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            log::warn!("Failed to apply remote candidate: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Peer events and timers
    // ------------------------------------------------------------------------

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if !self.state.is_active() {
                    return;
                }
                match serde_json::to_value(&candidate) {
                    Ok(payload) => {
                        self.send_payload(SignalType::Candidate, self.peer_user_id.clone(), payload)
                    }
                    Err(e) => log::warn!("Failed to encode local candidate: {}", e),
                }
            }
            PeerEvent::RemoteTrack(track) => {
                self.remote_stream.add_track(track.clone());
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            PeerEvent::StateChanged(state) => {
                log::debug!("Peer connection is {:?}", state);
                if state == PeerState::Failed && self.state == CallState::Connected {
                    self.abort_call(&Error::Peer("media connection lost".to_string()))
                        .await;
                }
            }
        }
    }

    fn schedule_ring_timeout(&self) {
        let Some(timeout) = self.deps.config.ring_timeout() else {
            return;
        };
        let attempt = self.attempt;
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::RingTimeout { attempt });
        });
    }

    async fn on_ring_timeout(&mut self, attempt: u64) {
        if attempt != self.attempt
            || self.state != CallState::Outgoing
            || !self.is_caller
            || self.accepted
        {
            return;
        }
        log::info!("Outgoing call was not answered in time");
        self.transition(CallState::Ending);
        self.send_signal(SignalType::CallEnd, None);
        self.teardown().await;
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn local_user_id(&self) -> Option<String> {
        self.deps.transport.identity().map(|identity| identity.user_id)
    }

    fn transition(&mut self, next: CallState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("Refusing call transition {:?} -> {:?}", self.state, next);
            return false;
        }
        log::info!("Call state {:?} -> {:?}", self.state, next);
        self.state = next;
        let _ = self.events.send(CallEvent::StateChanged(next));
        self.publish();
        true
    }

    fn mark_connected(&mut self) {
        if self.transition(CallState::Connected) && self.connected_at.is_none() {
            self.connected_at = Some(Instant::now());
            self.connected_since = Some(Utc::now());
        }
    }

    async fn acquire_media(&mut self, video: bool) -> Result<()> {
        match self
            .deps
            .media
            .get_user_media(MediaConstraints::for_call(video))
            .await
        {
            Ok(stream) => {
                stream.set_enabled(TrackKind::Audio, !self.is_muted);
                stream.set_enabled(TrackKind::Video, !self.is_camera_off);
                self.local_stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                log::warn!("Could not acquire local media: {}", e);
                let error = Error::Media(e);
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// The only place a peer connection is created. A missing or closed
    /// connection is replaced and the local tracks are attached again.
    async fn ensure_peer_connection(&mut self) -> Result<Arc<dyn PeerConnection>> {
        if let Some(peer) = &self.peer {
            if !peer.is_closed() {
                return Ok(peer.clone());
            }
            log::info!("Peer connection was closed, creating a new one");
        }

        self.peer_generation += 1;
        let generation = self.peer_generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = self.deps.peers.create(tx).await?;

        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if commands.send(Command::Peer { generation, event }).is_err() {
                    break;
                }
            }
        });

        if let Some(stream) = &self.local_stream {
            for track in stream.tracks() {
                peer.add_track(track.clone()).await?;
            }
        }
        self.remote_description_set = false;
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                log::warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    async fn close_peer(&mut self) {
        self.peer_generation += 1;
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                log::debug!("Closing peer connection failed: {}", e);
            }
        }
        self.remote_description_set = false;
    }

    fn fail(&self, error: &Error) {
        let _ = self.events.send(CallEvent::Error(error.to_string()));
    }

    /// Negotiation failed mid-call: tell the other side and reset.
    async fn abort_call(&mut self, error: &Error) {
        log::warn!("Call negotiation failed: {}", error);
        self.fail(error);
        self.transition(CallState::Ending);
        self.send_signal(SignalType::CallEnd, self.peer_user_id.clone());
        self.teardown().await;
    }

    fn send_signal(&self, signal_type: SignalType, to: Option<String>) {
        self.dispatch(signal_type, to, None);
    }

    fn send_payload(&self, signal_type: SignalType, to: Option<String>, payload: serde_json::Value) {
        self.dispatch(signal_type, to, Some(payload));
    }

    fn dispatch(
        &self,
        signal_type: SignalType,
        to: Option<String>,
        payload: Option<serde_json::Value>,
    ) {
        let (Some(from), Some(conversation_id)) = (self.local_user_id(), &self.conversation_id)
        else {
            log::warn!("Cannot send {:?} without identity and conversation", signal_type);
            return;
        };

        let mut signal = CallSignal::new(signal_type, conversation_id.clone(), from)
            .to(to)
            .video(self.is_video);
        if let Some(payload) = payload {
            signal = signal.with_payload(payload);
        }
        if let Err(e) = self.deps.signaling.send_call_signal(&signal) {
            log::warn!("Failed to send {:?}: {}", signal_type, e);
        }
    }

    /// Release the peer connection and all media, log the caller's summary
    /// and return to IDLE. Safe to call in any state, any number of times.
    async fn teardown(&mut self) {
        self.close_peer().await;
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        self.remote_stream.stop_all();
        self.remote_stream = MediaStream::default();
        self.pending_candidates.clear();

        if self.summary_pending {
            self.summary_pending = false;
            self.log_summary();
        }

        self.transition(CallState::Idle);
        self.is_video = false;
        self.is_muted = false;
        self.is_camera_off = false;
        self.is_caller = false;
        self.peer_user_id = None;
        self.conversation_id = None;
        self.incoming = None;
        self.accepted = false;
        self.offer_sent = false;
        self.declined = false;
        self.connected_at = None;
        self.connected_since = None;
        self.publish();
    }

    fn log_summary(&self) {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return;
        };
        let outcome = match self.connected_at {
            Some(at) => CallOutcome::Completed {
                duration: at.elapsed(),
            },
            None if self.declined => CallOutcome::Declined,
            None => CallOutcome::Missed,
        };
        let summary = CallSummary {
            conversation_id: conversation_id.clone(),
            is_video: self.is_video,
            outcome,
        };
        log::info!("Call summary: {}", summary.message_text());
        let _ = self.events.send(CallEvent::Summary(summary.clone()));

        let Some(sender_id) = self.local_user_id() else {
            return;
        };
        let chat = self.deps.chat.clone();
        let message = ChatMessage::compose(conversation_id, sender_id, summary.message_text());
        tokio::spawn(async move {
            if let Err(e) = chat.send_message(&message).await {
                log::warn!("Failed to post call summary: {}", e);
            }
        });
    }

    fn publish(&self) {
        let remote_stream = if self.remote_stream.is_empty() {
            None
        } else {
            Some(self.remote_stream.clone())
        };
        self.snapshot.send_replace(CallSnapshot {
            state: self.state,
            is_video: self.is_video,
            is_muted: self.is_muted,
            is_camera_off: self.is_camera_off,
            is_caller: self.is_caller,
            peer_user_id: self.peer_user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            incoming_call: self.incoming.clone(),
            local_stream: self.local_stream.clone(),
            remote_stream,
            connected_since: self.connected_since,
        });
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(signal: &CallSignal) -> Result<T> {
    let payload = signal.payload.clone().ok_or_else(|| {
        Error::InvalidMessage(format!("{:?} without payload", signal.signal_type))
    })?;
    Ok(serde_json::from_value(payload)?)
}
