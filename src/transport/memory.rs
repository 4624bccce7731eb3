//! In-memory broker.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Connector`] and [`Session`] traits. It is intended primarily for testing,
//! local execution, and as a reference for session semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the session
//! layer. The AMQP connector is expected to approximate it as closely as the
//! real broker allows.
//!
//! - Exchanges route like their AMQP counterparts: fanout to every bound
//!   queue, direct on exact key, topic on `*`/`#` word patterns, headers to
//!   every bound queue (no header arguments are ever supplied).
//! - Redeclaring an exchange with different flags fails with `SpecConflict`.
//! - When a session ends, its auto-delete queues go away, and auto-delete
//!   exchanges lose that binding; an auto-delete exchange whose last binding
//!   was removed is deleted.
//! - A broker restart forgets every non-durable exchange and queue.
//! - Messages published while no queue is bound are dropped.
//! - Every queue buffers without limit, as a broker queue does. A slow
//!   consumer only fills its own queue; publishers never wait for it.
//! - Cancelling a consumer removes an auto-delete queue and its binding.
//!
//! ## Fault injection
//!
//! [`MemoryBroker::restart`], [`MemoryBroker::set_online`] and
//! [`MemoryBroker::drop_sessions`] let tests take sessions away from under
//! the supervisor. [`MemoryBroker::tap`] observes an exchange independently of
//! any session, so it keeps counting across restarts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_info,
    Binding,
    BrokerConfig,
    Connector,
    Delivery,
    DeliveryStream,
    ExchangeKind,
    ExchangeSpec,
    QueueSpec,
    Result,
    Session,
    SessionPtr,
    WarrenError,
};

struct QueueEntry {
    spec: QueueSpec,
    owner: String,
    binding: Option<(String, String)>,
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct BrokerState {
    online: bool,
    reject_credentials: bool,
    connect_delay: Option<Duration>,
    sessions: HashSet<String>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueEntry>,
    taps: Vec<(String, mpsc::UnboundedSender<Delivery>)>,
}

impl BrokerState {
    fn check_session(&self, session_id: &str) -> Result<()> {
        if self.sessions.contains(session_id) {
            Ok(())
        } else {
            Err(WarrenError::ConnectionLost(format!(
                "memory: session {session_id} is closed"
            )))
        }
    }

    fn bound_count(&self, exchange: &str) -> usize {
        self.queues
            .values()
            .filter(|q| matches!(&q.binding, Some((x, _)) if x == exchange))
            .count()
    }

    /// Remove everything a dead session owned.
    fn end_session(&mut self, session_id: &str) {
        // ---
        self.sessions.remove(session_id);

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == session_id)
            .map(|(name, _)| name.clone())
            .collect();

        for queue in owned {
            self.release_queue(&queue, |spec| spec.auto_delete || spec.exclusive);
        }
    }

    /// Detach the consumer of `queue`, deleting the queue when `remove`
    /// says so for its declaration.
    fn release_queue(&mut self, queue: &str, remove: impl Fn(&QueueSpec) -> bool) {
        // ---
        let Some(entry) = self.queues.get_mut(queue) else {
            return;
        };
        entry.consumer = None;
        if !remove(&entry.spec) {
            return;
        }

        let unbound = self.queues.remove(queue).and_then(|q| q.binding);
        if let Some((exchange, _)) = unbound {
            let drop_it = self
                .exchanges
                .get(&exchange)
                .is_some_and(|x| x.auto_delete)
                && self.bound_count(&exchange) == 0;
            if drop_it {
                log_debug!("memory: auto-deleting exchange {exchange}");
                self.exchanges.remove(&exchange);
            }
        }
    }

    fn restart(&mut self) {
        // ---
        let sessions: Vec<String> = self.sessions.iter().cloned().collect();
        for id in sessions {
            self.end_session(&id);
        }
        self.queues.retain(|_, q| q.spec.durable);
        for q in self.queues.values_mut() {
            q.consumer = None;
        }
        self.exchanges.retain(|_, x| x.durable);
    }
}

struct BrokerShared {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

impl BrokerShared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_ignore_poison(&self.state)
    }
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process broker.
///
/// Cheap to clone; clones share the same exchanges, queues and sessions.
///
/// ```
/// # use warren::{BrokerConfig, Connector, MemoryBroker, Session};
/// # async fn example() -> warren::Result<()> {
/// let broker = MemoryBroker::new();
/// let session = broker.establish(&BrokerConfig::memory()).await?;
/// assert!(session.is_open());
///
/// broker.restart();
/// assert!(!session.is_open());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    /// Create a new, empty broker that accepts connections.
    pub fn new() -> Self {
        // ---
        Self {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(BrokerState {
                    online: true,
                    ..BrokerState::default()
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Take the broker down or bring it back.
    ///
    /// Going offline behaves like a broker restart that has not finished yet:
    /// every session dies, non-durable state is forgotten, and connection
    /// attempts fail as refused until the broker is back online.
    pub fn set_online(&self, online: bool) {
        // ---
        let mut state = self.shared.lock();
        if !online && state.online {
            log_info!("memory: broker going offline");
            state.restart();
        }
        state.online = online;
    }

    /// Restart the broker and come straight back.
    pub fn restart(&self) {
        // ---
        log_info!("memory: broker restart");
        self.shared.lock().restart();
    }

    /// Kill every session without touching broker state beyond what the
    /// sessions owned, as a network partition would.
    pub fn drop_sessions(&self) {
        // ---
        let mut state = self.shared.lock();
        let sessions: Vec<String> = state.sessions.iter().cloned().collect();
        log_info!("memory: dropping {} sessions", sessions.len());
        for id in sessions {
            state.end_session(&id);
        }
    }

    /// Refuse (or accept again) every new connection as an authentication failure.
    pub fn reject_credentials(&self, reject: bool) {
        self.shared.lock().reject_credentials = reject;
    }

    /// Delay every connection attempt, to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.shared.lock().connect_delay = delay;
    }

    /// Observe every message published to `exchange`, across restarts.
    pub fn tap(&self, exchange: impl Into<String>) -> mpsc::UnboundedReceiver<Delivery> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().taps.push((exchange.into(), tx));
        rx
    }

    /// Current declaration of an exchange, if it exists.
    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.shared.lock().exchanges.get(name).cloned()
    }

    /// Number of queues bound to `exchange`.
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.shared.lock().bound_count(exchange)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    // ---
    async fn establish(&self, config: &BrokerConfig) -> Result<SessionPtr> {
        // ---
        let delay = self.shared.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.lock();
        if !state.online {
            return Err(WarrenError::ConnectionLost(
                "memory: connection refused".into(),
            ));
        }
        if state.reject_credentials {
            return Err(WarrenError::AccessRefused(format!(
                "memory: login refused for user {}",
                config.username
            )));
        }

        let id = format!(
            "memory-{}",
            self.shared.next_id.fetch_add(1, Ordering::Relaxed)
        );
        state.sessions.insert(id.clone());
        log_debug!("memory: opened session {id} for {}", config.connection_name);

        Ok(Arc::new(MemorySession {
            session_id: id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Session on a [`MemoryBroker`].
struct MemorySession {
    // ---
    session_id: String,
    shared: Arc<BrokerShared>,
}

#[async_trait::async_trait]
impl Session for MemorySession {
    // ---
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_open(&self) -> bool {
        self.shared.lock().sessions.contains(&self.session_id)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let mut state = self.shared.lock();
        state.check_session(&self.session_id)?;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.is_compatible(spec) => Ok(()),
            Some(existing) => Err(WarrenError::SpecConflict {
                name: spec.name.clone(),
                details: format!(
                    "declared as {}, requested {}",
                    existing.describe(),
                    spec.describe()
                ),
            }),
            None => {
                log_debug!("{}: declared exchange {}", self.session_id, spec.name);
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        // ---
        let mut state = self.shared.lock();
        state.check_session(&self.session_id)?;

        if !state.exchanges.contains_key(name) {
            return Err(WarrenError::NotFound(name.to_string()));
        }
        if if_unused && state.bound_count(name) > 0 {
            return Err(WarrenError::ExchangeInUse(name.to_string()));
        }

        state.exchanges.remove(name);
        for q in state.queues.values_mut() {
            if matches!(&q.binding, Some((x, _)) if x == name) {
                q.binding = None;
            }
        }
        log_debug!("{}: deleted exchange {name}", self.session_id);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        let (targets, taps) = {
            let state = self.shared.lock();
            state.check_session(&self.session_id)?;

            let kind = match state.exchanges.get(exchange) {
                Some(spec) => spec.kind,
                None => return Err(WarrenError::NotFound(exchange.to_string())),
            };

            let targets: Vec<mpsc::UnboundedSender<Delivery>> = state
                .queues
                .values()
                .filter_map(|q| match (&q.binding, &q.consumer) {
                    (Some((x, key)), Some(tx))
                        if x == exchange && routes(kind, key, routing_key) =>
                    {
                        Some(tx.clone())
                    }
                    _ => None,
                })
                .collect();

            let taps: Vec<mpsc::UnboundedSender<Delivery>> = state
                .taps
                .iter()
                .filter(|(x, _)| x == exchange)
                .map(|(_, tx)| tx.clone())
                .collect();

            (targets, taps)
        };

        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: payload,
            redelivered: false,
        };

        // A closed channel means the consumer went away; the broker does not
        // care.
        for tx in taps.iter().chain(targets.iter()) {
            let _ = tx.send(delivery.clone());
        }

        Ok(())
    }

    async fn consume(&self, binding: &Binding, capacity: usize) -> Result<DeliveryStream> {
        // ---
        let mut state = self.shared.lock();
        state.check_session(&self.session_id)?;

        let exchange = &binding.exchange.name;
        if !state.exchanges.contains_key(exchange) {
            return Err(WarrenError::NotFound(exchange.clone()));
        }

        let queue = match &binding.queue.name {
            Some(name) => name.clone(),
            None => format!("amq.gen-{}", uuid::Uuid::new_v4().simple()),
        };

        if let Some(existing) = state.queues.get(&queue) {
            if existing.consumer.is_some() && existing.spec.exclusive {
                return Err(WarrenError::Broker(format!(
                    "memory: queue {queue} is locked by another session"
                )));
            }
        }

        let (queued_tx, mut queued) = mpsc::unbounded_channel();
        state.queues.insert(
            queue.clone(),
            QueueEntry {
                spec: binding.queue.clone(),
                owner: self.session_id.clone(),
                binding: Some((exchange.clone(), binding.binding_key.clone())),
                consumer: Some(queued_tx),
            },
        );

        // Moves the queue into the bounded delivery window. Ends when the
        // consumer is detached (after handing over what was queued) or when
        // the stream is dropped.
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(delivery) = queued.recv().await {
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        log_debug!(
            "{}: consuming {queue} bound to {exchange} with key {:?}",
            self.session_id,
            binding.binding_key
        );

        Ok(DeliveryStream { queue, inbox: rx })
    }

    async fn cancel(&self, queue: &str) -> Result<()> {
        // ---
        let mut state = self.shared.lock();
        state.check_session(&self.session_id)?;

        if state.queues.get(queue).is_some_and(|q| q.owner == self.session_id) {
            log_debug!("{}: cancelled consumer of {queue}", self.session_id);
            state.release_queue(queue, |spec| spec.auto_delete);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.shared.lock().end_session(&self.session_id);
        Ok(())
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    // ---
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
