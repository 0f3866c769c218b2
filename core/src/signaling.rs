//! Call signaling channel
//!
//! Signals ride the broker connection already held by the transport; the
//! call topic of the joined conversation is subscribed by the tracker.

use crate::error::Result;
use crate::listeners::ListenerId;
use crate::models::{CallSignal, CALL_SEND_DESTINATION};
use crate::subscription::Inbox;
use crate::transport::BrokerClient;
use std::sync::Arc;

#[derive(Clone)]
pub struct SignalChannel {
    transport: BrokerClient,
    inbox: Arc<Inbox>,
}

impl SignalChannel {
    pub(crate) fn new(transport: BrokerClient, inbox: Arc<Inbox>) -> Self {
        Self { transport, inbox }
    }

    /// Publish immediately. Best effort: there is no retry, the caller
    /// decides whether a failure matters.
    pub fn send_call_signal(&self, signal: &CallSignal) -> Result<()> {
        let body = serde_json::to_string(signal)?;
        self.transport.publish(CALL_SEND_DESTINATION, body)?;
        log::debug!(
            "Sent {:?} for conversation {}",
            signal.signal_type,
            signal.conversation_id
        );
        Ok(())
    }

    pub fn on_call_signal_received(
        &self,
        callback: impl Fn(&CallSignal) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inbox.signals.add(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inbox.signals.remove(id)
    }
}

/// Routing discipline applied by signal consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFilter {
    pub local_user_id: String,
    pub conversation_id: String,
}

impl SignalFilter {
    pub fn new(local_user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Reject signals for another conversation, echoes of our own signals
    /// and signals addressed to somebody else.
    pub fn accepts(&self, signal: &CallSignal) -> bool {
        if signal.conversation_id != self.conversation_id {
            return false;
        }
        if signal.from_user_id == self.local_user_id {
            return false;
        }
        match &signal.to_user_id {
            Some(to) => *to == self.local_user_id,
            None => true,
        }
    }
}
