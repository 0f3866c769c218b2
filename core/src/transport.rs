//! Transport connection manager
//!
//! Owns the single STOMP session to the broker. Connection loss is retried
//! with exponential backoff; the state is published on a watch channel so
//! dependents gate publishing on it instead of polling.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::listeners::{ListenerId, Listeners};
use crate::models::{ConnectionState, Identity};
use crate::network::{Connector, WireSink, WireStream};
use crate::stomp::{Command, Frame, FrameDecoder, HeartBeat};
use futures::{future, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};

// ============================================================================
// Reconnect policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures after which the manager stops retrying.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, cap)` for the zero-based retry number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

// ============================================================================
// Broker client
// ============================================================================

/// Active topic subscription on the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: String,
    destination: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

struct Subscription {
    handler: FrameHandler,
}

#[derive(Default)]
struct Session {
    /// Bumped by every connect/disconnect; tasks of older generations stand down.
    generation: u64,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct Inner {
    url: String,
    handshake_timeout: Duration,
    heartbeat: HeartBeat,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    identity: Mutex<Option<Identity>>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_subscription: AtomicU64,
    failures: AtomicU32,
    connect_listeners: Listeners<()>,
}

/// Handle to the broker connection. Clones share the same connection.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: config.socket_url.clone(),
                handshake_timeout: config.handshake_timeout(),
                heartbeat: HeartBeat::new(config.heartbeat_ms, config.heartbeat_ms),
                policy: config.reconnect,
                connector,
                identity: Mutex::new(None),
                state,
                session: Mutex::new(Session::default()),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                failures: AtomicU32::new(0),
                connect_listeners: Listeners::new(),
            }),
        }
    }

    /// Follow the auth lifecycle: connect when an identity arrives,
    /// disconnect when it is cleared.
    pub fn set_identity(&self, identity: Option<Identity>) {
        let signed_in = identity.is_some();
        *self.inner.identity.lock() = identity;
        if signed_in {
            self.connect();
        } else {
            self.disconnect();
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn failed_attempts(&self) -> u32 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Run `callback` every time a session reaches CONNECTED.
    pub fn on_connected(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.inner.connect_listeners.add(move |_| callback())
    }

    pub fn remove_connect_listener(&self, id: ListenerId) -> bool {
        self.inner.connect_listeners.remove(id)
    }

    /// Start connecting. No-op without an identity or while a session is
    /// already connecting, connected or backing off. Must be called inside
    /// a tokio runtime.
    pub fn connect(&self) {
        if self.inner.identity.lock().is_none() {
            log::debug!("Connect skipped: no identity");
            return;
        }

        let mut session = self.inner.session.lock();
        if session.driver.as_ref().is_some_and(|d| !d.is_finished()) {
            return;
        }

        session.generation += 1;
        let generation = session.generation;
        self.inner.failures.store(0, Ordering::Relaxed);
        self.inner.set_state(ConnectionState::Connecting);
        session.driver = Some(tokio::spawn(drive(self.inner.clone(), generation)));
    }

    /// Tear down subscriptions and the session. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let (driver, outbound) = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            (session.driver.take(), session.outbound.take())
        };

        let subscription_ids: Vec<String> = self
            .inner
            .subscriptions
            .lock()
            .drain()
            .map(|(id, _)| id)
            .collect();

        match outbound {
            Some(outbound) => {
                for id in subscription_ids {
                    let _ = outbound.send(Frame::unsubscribe(&id));
                }
                let _ = outbound.send(Frame::disconnect());
                // The link drains the queue and closes once the sender is gone.
            }
            None => {
                if let Some(driver) = driver {
                    driver.abort();
                }
            }
        }

        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Resolve once the state is CONNECTED, or fail after `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| s.is_connected()))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::SendTimeout(timeout)),
        }
    }

    pub fn subscribe(
        &self,
        destination: &str,
        handler: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let session = self.inner.session.lock();
        let outbound = session.outbound.as_ref().ok_or(Error::NotConnected)?;

        let id = format!(
            "sub-{}",
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        self.inner.subscriptions.lock().insert(
            id.clone(),
            Subscription {
                handler: Arc::new(handler),
            },
        );

        if outbound.send(Frame::subscribe(&id, destination)).is_err() {
            self.inner.subscriptions.lock().remove(&id);
            return Err(Error::NotConnected);
        }

        log::debug!("Subscribed {} to {}", id, destination);
        Ok(SubscriptionHandle {
            id,
            destination: destination.to_string(),
        })
    }

    /// Idempotent: unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self.inner.subscriptions.lock().remove(&handle.id).is_some();
        if !removed {
            return;
        }
        if let Some(outbound) = self.inner.session.lock().outbound.as_ref() {
            let _ = outbound.send(Frame::unsubscribe(&handle.id));
        }
        log::debug!("Unsubscribed {} from {}", handle.id, handle.destination);
    }

    pub fn publish(&self, destination: &str, body: impl Into<String>) -> Result<()> {
        let session = self.inner.session.lock();
        let outbound = session.outbound.as_ref().ok_or(Error::NotConnected)?;
        outbound
            .send(Frame::send(destination, body))
            .map_err(|_| Error::NotConnected)
    }

    /// Whether `handle` still belongs to the live session. Handles die with
    /// the link that created them.
    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.subscriptions.lock().contains_key(&handle.id)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Broker connection {:?} -> {:?}", previous, next);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame.command {
            Command::Message => {
                let handler = frame
                    .get("subscription")
                    .and_then(|id| self.subscriptions.lock().get(id).map(|s| s.handler.clone()));
                match handler {
                    Some(handler) => handler(&frame),
                    None => log::debug!(
                        "Dropping MESSAGE for inactive subscription {:?}",
                        frame.get("subscription")
                    ),
                }
                Ok(())
            }
            Command::Error => Err(Error::Broker(
                frame.get("message").unwrap_or(frame.body.as_str()).to_string(),
            )),
            Command::Receipt => Ok(()),
            other => {
                log::debug!("Ignoring {} frame", other);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Connection driver
// ============================================================================

struct Link {
    sink: WireSink,
    stream: WireStream,
    decoder: FrameDecoder,
    pending: Vec<Frame>,
    send_every: Option<Duration>,
    expect_every: Option<Duration>,
}

async fn drive(inner: Arc<Inner>, generation: u64) {
    loop {
        if !inner.is_current(generation) {
            return;
        }
        inner.set_state(ConnectionState::Connecting);

        let outcome = match establish(&inner).await {
            Ok(link) => {
                inner.failures.store(0, Ordering::Relaxed);
                run_link(&inner, generation, link).await
            }
            Err(e) => Err(e),
        };

        if !inner.is_current(generation) {
            return;
        }
        inner.subscriptions.lock().clear();

        match &outcome {
            Ok(()) => {
                log::warn!("Broker connection closed");
                inner.set_state(ConnectionState::Disconnected);
            }
            Err(e) => {
                log::warn!("Broker connection failed: {}", e);
                inner.set_state(ConnectionState::Error);
            }
        }

        let failures = inner.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= inner.policy.max_attempts {
            log::error!("Giving up on broker after {} failed attempts", failures);
            inner.set_state(ConnectionState::Error);
            return;
        }

        let delay = inner.policy.delay_for_attempt(failures - 1);
        log::info!("Reconnecting to broker in {:?} (attempt {})", delay, failures);
        tokio::time::sleep(delay).await;
    }
}

async fn establish(inner: &Inner) -> Result<Link> {
    let identity = inner.identity.lock().clone().ok_or(Error::NotAuthenticated)?;
    let host = url::Url::parse(&inner.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let connect = Frame::connect(
        &host,
        Some(identity.user_id.as_str()),
        identity.token.as_deref(),
        inner.heartbeat,
    );

    tokio::time::timeout(inner.handshake_timeout, handshake(inner, connect))
        .await
        .map_err(|_| Error::HandshakeTimeout(inner.handshake_timeout))?
}

async fn handshake(inner: &Inner, connect: Frame) -> Result<Link> {
    let (mut sink, mut stream) = inner.connector.open(&inner.url).await?;
    sink.send(connect.encode()).await?;

    let mut decoder = FrameDecoder::new();
    while let Some(text) = stream.next().await {
        let mut frames = decoder.push(&text?)?.into_iter();
        while let Some(frame) = frames.next() {
            match frame.command {
                Command::Connected => {
                    let server = frame
                        .get("heart-beat")
                        .and_then(HeartBeat::parse)
                        .unwrap_or_default();
                    let (send_every, expect_every) = inner.heartbeat.negotiate(server);
                    return Ok(Link {
                        sink,
                        stream,
                        decoder,
                        pending: frames.collect(),
                        send_every,
                        expect_every,
                    });
                }
                Command::Error => {
                    return Err(Error::Broker(
                        frame.get("message").unwrap_or(frame.body.as_str()).to_string(),
                    ))
                }
                other => log::debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }
    Err(Error::ConnectionClosed)
}

async fn run_link(inner: &Arc<Inner>, generation: u64, link: Link) -> Result<()> {
    let Link {
        mut sink,
        mut stream,
        mut decoder,
        pending,
        send_every,
        expect_every,
    } = link;

    let (tx, mut outbound) = mpsc::unbounded_channel::<Frame>();
    let installed = {
        let mut session = inner.session.lock();
        if session.generation == generation {
            session.outbound = Some(tx);
            true
        } else {
            false
        }
    };
    if !installed {
        let _ = sink.send(Frame::disconnect().encode()).await;
        return Ok(());
    }

    log::info!("Connected to broker at {}", inner.url);
    inner.set_state(ConnectionState::Connected);
    inner.connect_listeners.emit(&());

    let mut result = Ok(());
    for frame in pending {
        if let Err(e) = inner.dispatch(frame) {
            result = Err(e);
            break;
        }
    }
    if result.is_ok() {
        result = pump(
            inner,
            &mut sink,
            &mut stream,
            &mut decoder,
            &mut outbound,
            send_every,
            expect_every,
        )
        .await;
    }

    let mut session = inner.session.lock();
    if session.generation == generation {
        session.outbound = None;
    }
    result
}

async fn pump(
    inner: &Inner,
    sink: &mut WireSink,
    stream: &mut WireStream,
    decoder: &mut FrameDecoder,
    outbound: &mut mpsc::UnboundedReceiver<Frame>,
    send_every: Option<Duration>,
    expect_every: Option<Duration>,
) -> Result<()> {
    let mut heartbeat = send_every.map(|every| tokio::time::interval_at(Instant::now() + every, every));
    let silence_limit = expect_every.map(|every| every * 2);
    let mut last_seen = Instant::now();

    loop {
        let deadline = silence_limit.map(|limit| last_seen + limit);
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let closing = frame.command == Command::Disconnect;
                    sink.send(frame.encode()).await?;
                    if closing {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            _ = tick(&mut heartbeat) => {
                sink.send("\n".to_string()).await?;
            }
            _ = sleep_until(deadline) => {
                return Err(Error::HeartbeatTimeout(silence_limit.unwrap_or_default()));
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => {
                    last_seen = Instant::now();
                    for frame in decoder.push(&text)? {
                        inner.dispatch(frame)?;
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|a| policy.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_backoff_survives_huge_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(30000));
    }
}
