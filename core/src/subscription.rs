//! Conversation subscription tracker
//!
//! Keeps exactly one conversation's topics subscribed and replays the join
//! whenever the transport (re)connects.

use crate::chat::normalize_inbound;
use crate::error::Result;
use crate::listeners::Listeners;
use crate::models::{call_topic, conversation_topic, CallSignal, ChatMessage};
use crate::transport::{BrokerClient, SubscriptionHandle};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Receive-side fan-out shared by the chat and signaling channels.
#[derive(Default)]
pub(crate) struct Inbox {
    pub(crate) messages: Listeners<ChatMessage>,
    pub(crate) signals: Listeners<CallSignal>,
}

#[derive(Default)]
struct Tracked {
    conversation_id: Option<String>,
    subscriptions: Vec<SubscriptionHandle>,
}

struct TrackerInner {
    transport: BrokerClient,
    inbox: Arc<Inbox>,
    tracked: Mutex<Tracked>,
}

#[derive(Clone)]
pub struct ConversationTracker {
    inner: Arc<TrackerInner>,
}

impl ConversationTracker {
    pub(crate) fn new(transport: BrokerClient, inbox: Arc<Inbox>) -> Self {
        let inner = Arc::new(TrackerInner {
            transport: transport.clone(),
            inbox,
            tracked: Mutex::new(Tracked::default()),
        });

        let weak: Weak<TrackerInner> = Arc::downgrade(&inner);
        transport.on_connected(move || {
            if let Some(inner) = weak.upgrade() {
                inner.replay();
            }
        });

        Self { inner }
    }

    /// Move the subscription to `conversation_id`. While disconnected the
    /// request is remembered and replayed on the next successful connect.
    pub fn join_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut tracked = self.inner.tracked.lock();
        tracked.conversation_id = Some(conversation_id.to_string());

        if !self.inner.transport.is_connected() {
            log::debug!("Deferring join of conversation {} until connected", conversation_id);
            return Ok(());
        }
        self.inner.subscribe_locked(&mut tracked)
    }

    /// Safe to call when nothing is subscribed.
    pub fn leave_conversation(&self) {
        let mut tracked = self.inner.tracked.lock();
        for handle in tracked.subscriptions.drain(..) {
            self.inner.transport.unsubscribe(&handle);
        }
        if let Some(id) = tracked.conversation_id.take() {
            log::debug!("Left conversation {}", id);
        }
    }

    pub fn current_conversation(&self) -> Option<String> {
        self.inner.tracked.lock().conversation_id.clone()
    }

    /// Whether the current conversation's topics are live on the broker.
    /// False from the moment the link drops until the join is replayed.
    pub fn is_subscribed(&self) -> bool {
        let tracked = self.inner.tracked.lock();
        !tracked.subscriptions.is_empty()
            && tracked
                .subscriptions
                .iter()
                .all(|handle| self.inner.transport.is_active(handle))
    }
}

impl TrackerInner {
    fn replay(&self) {
        let mut tracked = self.tracked.lock();
        if tracked.conversation_id.is_none() {
            return;
        }
        if let Err(e) = self.subscribe_locked(&mut tracked) {
            log::warn!("Rejoining conversation after reconnect failed: {}", e);
        }
    }

    fn subscribe_locked(&self, tracked: &mut Tracked) -> Result<()> {
        for handle in tracked.subscriptions.drain(..) {
            self.transport.unsubscribe(&handle);
        }
        let Some(conversation_id) = tracked.conversation_id.clone() else {
            return Ok(());
        };

        let inbox = self.inbox.clone();
        let fallback_id = conversation_id.clone();
        let chat = self
            .transport
            .subscribe(&conversation_topic(&conversation_id), move |frame| {
                match normalize_inbound(&frame.body, &fallback_id) {
                    Ok(message) => inbox.messages.emit(&message),
                    Err(e) => log::debug!("Dropping malformed chat frame: {}", e),
                }
            })?;
        tracked.subscriptions.push(chat);

        let inbox = self.inbox.clone();
        let signals = self
            .transport
            .subscribe(&call_topic(&conversation_id), move |frame| {
                match serde_json::from_str::<CallSignal>(&frame.body) {
                    Ok(signal) => inbox.signals.emit(&signal),
                    Err(e) => log::debug!("Dropping malformed call signal: {}", e),
                }
            })?;
        tracked.subscriptions.push(signals);

        log::info!("Joined conversation {}", conversation_id);
        Ok(())
    }
}
