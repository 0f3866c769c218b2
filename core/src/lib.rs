//! Homestay Real-time Core
//!
//! Chat and call signaling for the Homestay marketplace over a STOMP broker.
//! Provides: broker transport, conversation subscriptions, chat and signal
//! channels, and the call negotiation engine.

pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod listeners;
pub mod media;
pub mod models;
pub mod network;
pub mod peer;
pub mod rtc;
pub mod signaling;
pub mod stomp;
pub mod subscription;
pub mod transport;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub use call::{CallEngine, CallEvent, CallOutcome, CallSnapshot, CallSummary, IncomingCall};
pub use chat::{ChatChannel, MessageLog};
pub use config::{CallConfig, ClientConfig};
pub use error::{Error, MediaError, Result};
pub use listeners::ListenerId;
pub use media::{LocalMediaDevices, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
pub use models::*;
pub use network::{Connector, WsConnector};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
pub use rtc::RtcPeerFactory;
pub use signaling::{SignalChannel, SignalFilter};
pub use subscription::ConversationTracker;
pub use transport::{BrokerClient, ReconnectPolicy, SubscriptionHandle};

use subscription::Inbox;

/// Real-time context for one signed-in session. Constructed explicitly and
/// passed to whatever needs it; there is no global instance.
pub struct RealtimeClient {
    config: ClientConfig,
    transport: BrokerClient,
    tracker: ConversationTracker,
    chat: ChatChannel,
    signaling: SignalChannel,
    call: Mutex<Weak<CallEngine>>,
}

impl RealtimeClient {
    /// Create a client talking to the configured WebSocket broker.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let transport = BrokerClient::new(&config, connector);
        let inbox = Arc::new(Inbox::default());
        let tracker = ConversationTracker::new(transport.clone(), inbox.clone());
        let chat = ChatChannel::new(transport.clone(), inbox.clone(), config.send_wait());
        let signaling = SignalChannel::new(transport.clone(), inbox);

        Ok(Self {
            config,
            transport,
            tracker,
            chat,
            signaling,
            call: Mutex::new(Weak::new()),
        })
    }

    /// Identity became available: connect. Must be called inside a tokio runtime.
    pub fn sign_in(&self, identity: Identity) {
        log::info!("Signing in as {}", identity.user_id);
        self.transport.set_identity(Some(identity));
    }

    /// Identity cleared: hang up, leave the conversation and disconnect.
    pub async fn sign_out(&self) {
        let engine = self.call.lock().upgrade();
        if let Some(engine) = engine {
            if let Err(e) = engine.end_call().await {
                log::debug!("Ending call on sign out failed: {}", e);
            }
        }
        self.tracker.leave_conversation();
        self.transport.set_identity(None);
        log::info!("Signed out");
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &BrokerClient {
        &self.transport
    }

    pub fn tracker(&self) -> &ConversationTracker {
        &self.tracker
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    pub fn signaling(&self) -> &SignalChannel {
        &self.signaling
    }

    /// Spawn the call engine for this session. Must be called inside a
    /// tokio runtime.
    pub fn call_engine(
        &self,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<CallEngine> {
        let engine = Arc::new(CallEngine::spawn(call::CallDeps {
            transport: self.transport.clone(),
            tracker: self.tracker.clone(),
            signaling: self.signaling.clone(),
            chat: self.chat.clone(),
            media,
            peers,
            config: self.config.call.clone(),
        }));
        *self.call.lock() = Arc::downgrade(&engine);
        engine
    }

    /// Call engine backed by local devices and native peer connections.
    pub fn native_call_engine(&self) -> Arc<CallEngine> {
        self.call_engine(
            Arc::new(LocalMediaDevices::default()),
            Arc::new(RtcPeerFactory::new(&self.config.call)),
        )
    }
}
