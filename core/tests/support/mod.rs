//! In-memory broker, fake media devices and fake peer connections shared by
//! the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use homestay_realtime::network::{Connector, WireSink, WireStream};
use homestay_realtime::peer::PeerEventSender;
use homestay_realtime::stomp::{Command, Frame, FrameDecoder};
use homestay_realtime::{
    CallEngine, ChatMessage, ClientConfig, Error, IceCandidate, Identity, MediaConstraints,
    MediaDevices, MediaError, MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerState, RealtimeClient, ReconnectPolicy, Result, SessionDescription, TrackKind,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Broker
// ============================================================================

struct Connection {
    outbound: mpsc::UnboundedSender<Result<String>>,
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    next_message: u64,
    connections: HashMap<u64, Connection>,
    refuse: bool,
    /// Advertised in CONNECTED; the broker itself never sends heart-beats.
    heart_beat: Option<String>,
    /// Accept the socket but never answer CONNECT.
    mute_handshake: bool,
    attempts: Vec<Instant>,
    connect_headers: Vec<Frame>,
    published: Vec<(String, String)>,
}

/// STOMP broker living in the test process. Routes chat sends to the
/// conversation topic and call signals to the call topic.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Advertise `value` as the server heart-beat on future handshakes.
    pub fn set_heart_beat(&self, value: &str) {
        self.state.lock().heart_beat = Some(value.to_string());
    }

    pub fn set_mute_handshake(&self, mute: bool) {
        self.state.lock().mute_handshake = mute;
    }

    /// Send an ERROR frame on every open connection.
    pub fn send_error(&self, message: &str) {
        let state = self.state.lock();
        let error = Frame::new(Command::Error)
            .header("message", message)
            .body(message);
        for connection in state.connections.values() {
            let _ = connection.outbound.unbounded_send(Ok(error.encode()));
        }
    }

    /// Close every open socket from the server side.
    pub fn drop_connections(&self) {
        self.state.lock().connections.clear();
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }

    pub fn connect_frames(&self) -> Vec<Frame> {
        self.state.lock().connect_headers.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of live subscriptions to `destination` across all clients.
    pub fn subscribers(&self, destination: &str) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    pub fn subscribed_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self
            .state
            .lock()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values().cloned())
            .collect();
        destinations.sort();
        destinations
    }

    /// Bodies published by clients to `destination`, in arrival order.
    pub fn published(&self, destination: &str) -> Vec<Value> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .filter_map(|(_, body)| serde_json::from_str(body).ok())
            .collect()
    }

    /// Call signals seen by the broker as `(type, fromUserId)` pairs.
    pub fn signal_log(&self) -> Vec<(String, String)> {
        self.published("/app/call.signal")
            .iter()
            .map(|s| {
                (
                    s["type"].as_str().unwrap_or_default().to_string(),
                    s["fromUserId"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    /// Deliver a raw body to every subscriber of `destination`.
    pub fn publish_raw(&self, destination: &str, body: &str) {
        deliver(&self.state.lock(), destination, body);
    }

    fn handle(&self, connection_id: u64, frame: Frame) {
        let mut state = self.state.lock();
        match frame.command {
            Command::Connect | Command::Stomp => {
                state.connect_headers.push(frame.clone());
                if state.mute_handshake {
                    return;
                }
                let heart_beat = state.heart_beat.clone().unwrap_or_else(|| "0,0".to_string());
                if let Some(connection) = state.connections.get(&connection_id) {
                    let connected = Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("heart-beat", heart_beat);
                    let _ = connection.outbound.unbounded_send(Ok(connected.encode()));
                }
            }
            Command::Subscribe => {
                if let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) {
                    if let Some(connection) = state.connections.get_mut(&connection_id) {
                        connection
                            .subscriptions
                            .insert(id.to_string(), destination.to_string());
                    }
                }
            }
            Command::Unsubscribe => {
                if let Some(id) = frame.get("id") {
                    if let Some(connection) = state.connections.get_mut(&connection_id) {
                        connection.subscriptions.remove(id);
                    }
                }
            }
            Command::Send => {
                let destination = frame.get("destination").unwrap_or_default().to_string();
                state.published.push((destination.clone(), frame.body.clone()));
                route(&mut state, &destination, &frame.body);
            }
            Command::Disconnect => {
                state.connections.remove(&connection_id);
            }
            _ => {}
        }
    }
}

fn route(state: &mut BrokerState, destination: &str, body: &str) {
    let Ok(mut value) = serde_json::from_str::<Value>(body) else {
        return;
    };
    let conversation_id = match &value["conversationId"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return,
    };

    match destination {
        "/app/chat.sendMessage" => {
            state.next_message += 1;
            value["id"] = Value::from(format!("srv-{}", state.next_message));
            value["timestamp"] = Value::from(chrono::Utc::now().timestamp_millis());
            let topic = format!("/topic/conversation.{}", conversation_id);
            deliver(state, &topic, &value.to_string());
        }
        "/app/call.signal" => {
            let topic = format!("/topic/call.{}", conversation_id);
            deliver(state, &topic, body);
        }
        _ => {}
    }
}

fn deliver(state: &BrokerState, destination: &str, body: &str) {
    for connection in state.connections.values() {
        for (id, subscribed) in &connection.subscriptions {
            if subscribed != destination {
                continue;
            }
            let message = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", id.as_str())
                .header("message-id", uuid::Uuid::new_v4().to_string())
                .header("content-type", "application/json")
                .body(body);
            let _ = connection.outbound.unbounded_send(Ok(message.encode()));
        }
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, _url: &str) -> Result<(WireSink, WireStream)> {
        let connection_id = {
            let mut state = self.state.lock();
            state.attempts.push(Instant::now());
            if state.refuse {
                return Err(Error::WebSocket("connection refused".into()));
            }
            state.next_connection += 1;
            state.next_connection
        };

        let (to_client, client_inbound) = mpsc::unbounded::<Result<String>>();
        let (client_outbound, mut from_client) = mpsc::unbounded::<String>();
        self.state.lock().connections.insert(
            connection_id,
            Connection {
                outbound: to_client,
                subscriptions: HashMap::new(),
            },
        );

        let broker = self.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            while let Some(text) = from_client.next().await {
                let Ok(frames) = decoder.push(&text) else {
                    break;
                };
                for frame in frames {
                    broker.handle(connection_id, frame);
                }
            }
            broker.state.lock().connections.remove(&connection_id);
        });

        let sink = client_outbound.sink_map_err(|_| Error::ConnectionClosed);
        Ok((Box::pin(sink), Box::pin(client_inbound)))
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Default)]
pub struct FakeMedia {
    deny: AtomicBool,
    acquired: Mutex<Vec<MediaStream>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denied() -> Arc<Self> {
        let media = Self::default();
        media.deny.store(true, Ordering::SeqCst);
        Arc::new(media)
    }

    pub fn acquired(&self) -> Vec<MediaStream> {
        self.acquired.lock().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.acquired
            .lock()
            .iter()
            .flat_map(|s| s.tracks().to_vec())
            .filter(|t| t.is_live())
            .count()
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<MediaStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera and microphone".into()));
        }
        let mut stream = MediaStream::default();
        if constraints.audio {
            stream.add_track(Arc::new(MediaTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            stream.add_track(Arc::new(MediaTrack::new(TrackKind::Video)));
        }
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// Peer connections
// ============================================================================

pub struct FakePeer {
    events: PeerEventSender,
    closed: AtomicBool,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub tracks: Mutex<Vec<Arc<MediaTrack>>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
}

impl FakePeer {
    /// Simulate the connection dying underneath the engine.
    pub fn close_externally(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Report an ICE failure the way a real connection would.
    pub fn report_state(&self, state: PeerState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().is_empty() {
            return Err(Error::Peer("answer without remote offer".into()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<()> {
        // Trickle one host candidate per local description.
        let _ = self.events.send(PeerEvent::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.20 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.remote.lock().push(description);
        let _ = self
            .events
            .send(PeerEvent::RemoteTrack(Arc::new(MediaTrack::new(TrackKind::Audio))));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn total_offers(&self) -> usize {
        self.peers()
            .iter()
            .map(|p| p.offers.load(Ordering::SeqCst))
            .sum()
    }

    pub fn total_answers(&self) -> usize {
        self.peers()
            .iter()
            .map(|p| p.answers.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer {
            events,
            closed: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Clients
// ============================================================================

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("ws://broker.test/chat");
    config.send_wait_ms = 500;
    config.reconnect = ReconnectPolicy {
        base_delay_ms: 20,
        max_delay_ms: 200,
        max_attempts: 5,
    };
    config.call.ring_timeout_secs = None;
    config
}

/// Signed-in client that has joined `conversation_id`.
pub async fn joined_client(
    broker: &MemoryBroker,
    config: ClientConfig,
    user_id: &str,
    conversation_id: &str,
) -> RealtimeClient {
    let client = RealtimeClient::with_connector(config, Arc::new(broker.clone())).unwrap();
    client.sign_in(Identity::new(user_id));
    client
        .transport()
        .wait_until_connected(Duration::from_secs(2))
        .await
        .unwrap();
    client.tracker().join_conversation(conversation_id).unwrap();
    client
}

pub struct CallParty {
    pub client: RealtimeClient,
    pub engine: Arc<CallEngine>,
    pub media: Arc<FakeMedia>,
    pub peers: Arc<FakePeerFactory>,
}

pub async fn call_party(
    broker: &MemoryBroker,
    config: ClientConfig,
    user_id: &str,
    conversation_id: &str,
    media: Arc<FakeMedia>,
) -> CallParty {
    let client = joined_client(broker, config, user_id, conversation_id).await;
    let peers = FakePeerFactory::new();
    let engine = client.call_engine(media.clone(), peers.clone());
    CallParty {
        client,
        engine,
        media,
        peers,
    }
}

/// Collect every chat message delivered to `client`.
pub fn record_messages(client: &RealtimeClient) -> Arc<Mutex<Vec<ChatMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client
        .chat()
        .on_message_received(move |m| sink.lock().push(m.clone()));
    seen
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
