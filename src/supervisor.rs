//! Connection supervisor.
//!
//! The [`Supervisor`] owns the single broker [`Session`](crate::Session) of a
//! client and keeps it healthy:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Reconnecting -> Connected -> ...
//!                                 \-> Closed (shutdown or fatal reconnect failure)
//! ```
//!
//! - Dependents (Writers, Readers, the admin) fetch the current session with
//!   [`Supervisor::wait_connected`], which also yields the session's *epoch*.
//! - Any dependent that sees the session fail reports it through
//!   [`Supervisor::on_failure`] with that epoch. Reports for an epoch that is
//!   no longer current are ignored, so one outage starts exactly one
//!   reconnect no matter how many dependents notice it.
//! - The reconnect loop backs off exponentially (capped, unlimited attempts),
//!   redeclares every recorded exchange and subscription on the new session,
//!   and only then publishes `Connected` again.
//! - The session slot is guarded by one lock that is held only while the
//!   session is swapped or read; no network call ever runs under it.
//! - Each subscription has one pump task for its whole life. A reconnect
//!   hands the pump the new delivery stream; the pump finishes the old one
//!   first, so order is kept without the supervisor ever waiting on a sink.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Binding,
    BrokerConfig,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    ExchangeSpec,
    Result,
    SessionPtr,
    WarrenError,
};

/// Lifecycle state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; no further reconnects are attempted.
    Closed,
}

/// State plus the epoch of the session it refers to.
///
/// The epoch increases by one on every successful (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: SupervisorState,
    pub epoch: u64,
}

/// Identifies a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubscriptionEntry {
    binding: Binding,
    queue: watch::Sender<Option<String>>,
    // Epoch of the session the latest stream came from.
    epoch: u64,
    streams: mpsc::UnboundedSender<(DeliveryStream, u64)>,
    pump: JoinHandle<()>,
}

struct Inner {
    // ---
    name: String,
    config: BrokerConfig,
    connector: ConnectorPtr,
    status_tx: watch::Sender<Status>,

    // The one lock around the live session.
    session: RwLock<Option<(SessionPtr, u64)>>,

    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
    declarations: Mutex<Vec<ExchangeSpec>>,

    // Serializes subscription installs against reconnect replay.
    registry_gate: tokio::sync::Mutex<()>,

    next_epoch: AtomicU64,
    next_subscription: AtomicU64,
    leases: AtomicUsize,
    reconnects: AtomicU64,
    terminal: Mutex<Option<WarrenError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owner of the broker session for one client.
///
/// Cheap to clone; clones share the same session and state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Supervisor {
    /// Connect to the AMQP broker described by `config`.
    #[cfg(feature = "transport_lapin")]
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        Self::establish(Arc::new(crate::LapinConnector::new()), config).await
    }

    /// Perform the initial handshake through `connector`.
    ///
    /// The attempt is bounded by `config.connect_timeout`. Failures here are
    /// returned to the caller and never retried; only sessions lost after
    /// this point are recovered automatically.
    pub async fn establish(connector: ConnectorPtr, config: BrokerConfig) -> Result<Self> {
        // ---
        config.validate()?;

        let (status_tx, _) = watch::channel(Status {
            state: SupervisorState::Idle,
            epoch: 0,
        });

        let inner = Arc::new(Inner {
            name: format!("{}@{}", config.connection_name, config.endpoint()),
            config,
            connector,
            status_tx,
            session: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            declarations: Mutex::new(Vec::new()),
            registry_gate: tokio::sync::Mutex::new(()),
            next_epoch: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            leases: AtomicUsize::new(0),
            reconnects: AtomicU64::new(0),
            terminal: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        inner.set_state(SupervisorState::Connecting, 0);
        log_info!("[{}] connecting", inner.name);

        let session = match timeout(
            inner.config.connect_timeout,
            inner.connector.establish(&inner.config),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                log_error!("[{}] initial connect failed: {e}", inner.name);
                inner.set_state(SupervisorState::Closed, 0);
                return Err(e);
            }
            Err(_) => {
                let e = WarrenError::ConnectTimeout(inner.config.connect_timeout);
                log_error!("[{}] initial connect failed: {e}", inner.name);
                inner.set_state(SupervisorState::Closed, 0);
                return Err(e);
            }
        };

        let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst);
        inner.install_session(session, epoch);
        inner.set_state(SupervisorState::Connected, epoch);
        log_info!("[{}] connected (epoch {epoch})", inner.name);

        if let Some(interval) = inner.config.health_check_interval {
            let handle = tokio::spawn(Inner::health_check(Arc::clone(&inner), interval));
            lock_ignore_poison(&inner.tasks).push(handle);
        }

        Ok(Self { inner })
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.status().state
    }

    /// Current state and epoch.
    pub fn status(&self) -> Status {
        *self.inner.status_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    /// Number of completed reconnects.
    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// The error that moved the supervisor to `Closed`, if any.
    pub fn terminal_error(&self) -> Option<WarrenError> {
        lock_ignore_poison(&self.inner.terminal).clone()
    }

    /// Wait until a session is available and return it with its epoch.
    ///
    /// Fails with `Closed` (or `Terminated` after a fatal reconnect
    /// failure) once the supervisor has shut down.
    pub async fn wait_connected(&self) -> Result<(SessionPtr, u64)> {
        self.inner.wait_connected().await
    }

    /// Report that the session of `epoch` is broken.
    ///
    /// Moves `Connected -> Reconnecting`, discards the session and starts the
    /// reconnect loop. Stale reports (older epoch, or already reconnecting)
    /// are ignored.
    pub fn on_failure(&self, epoch: u64, reason: &WarrenError) {
        self.inner.on_failure(epoch, reason);
    }

    /// Record an exchange so it is redeclared after every reconnect.
    pub fn remember_exchange(&self, spec: &ExchangeSpec) {
        // ---
        let mut declarations = lock_ignore_poison(&self.inner.declarations);
        match declarations.iter_mut().find(|d| d.name == spec.name) {
            Some(existing) => *existing = spec.clone(),
            None => declarations.push(spec.clone()),
        }
    }

    /// Stop redeclaring an exchange, e.g. after it was deleted.
    pub fn forget_exchange(&self, name: &str) {
        lock_ignore_poison(&self.inner.declarations).retain(|d| d.name != name);
    }

    /// Declare, bind and consume `binding`, forwarding deliveries to `sink`.
    ///
    /// The subscription is recorded so that it is redeclared after every
    /// reconnect. If the session is lost while subscribing, the subscription
    /// stays registered and becomes active with the next session. Returns
    /// the id to pass to [`unregister_subscription`](Self::unregister_subscription)
    /// and a receiver for the bound queue name.
    ///
    /// Cancel safe: nothing is recorded until the broker has answered, so a
    /// dropped call leaves no subscription behind.
    pub async fn register_subscription(
        &self,
        binding: Binding,
        sink: mpsc::Sender<Delivery>,
    ) -> Result<(SubscriptionId, watch::Receiver<Option<String>>)> {
        // ---
        loop {
            let (session, epoch) = self.inner.wait_connected().await?;

            let _gate = self.inner.registry_gate.lock().await;
            if self.status().epoch != epoch || self.state() != SupervisorState::Connected {
                continue;
            }

            match session
                .consume(&binding, self.inner.config.delivery_capacity)
                .await
            {
                Ok(stream) => {
                    log_debug!("[{}] subscribed on queue {}", self.inner.name, stream.queue);
                    return Ok(self.inner.insert_subscription(binding, sink, Some((stream, epoch))));
                }
                Err(e) if e.is_transient() => {
                    // Stays registered; the reconnect replay activates it.
                    let registered = self.inner.insert_subscription(binding, sink, None);
                    self.inner.on_failure(epoch, &e);
                    return Ok(registered);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forget a subscription, stop forwarding its deliveries and cancel its
    /// consumer on the broker.
    pub async fn unregister_subscription(&self, id: SubscriptionId) {
        // ---
        let _gate = self.inner.registry_gate.lock().await;
        let Some(entry) = lock_ignore_poison(&self.inner.subscriptions).remove(&id) else {
            return;
        };
        entry.pump.abort();

        let queue = entry.queue.borrow().clone();
        if let (Some(queue), Some((session, epoch))) = (queue, self.inner.current_session()) {
            // A queue from an older session died with it.
            if epoch == entry.epoch {
                match session.cancel(&queue).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => self.inner.on_failure(epoch, &e),
                    Err(_e) => log_warn!("[{}] cancel of {queue} failed: {_e}", self.inner.name),
                }
            }
        }

        log_debug!("[{}] unregistered subscription {id:?}", self.inner.name);
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock_ignore_poison(&self.inner.subscriptions).len()
    }

    /// Shut down: stop all background tasks and release the session.
    ///
    /// Idempotent. Dependents observe `Closed` on their next operation.
    pub async fn close(&self) {
        self.inner.shutdown().await;
    }

    /// Take a lease; the last released lease shuts the supervisor down.
    pub(crate) fn lease(&self) -> Lease {
        // ---
        self.inner.leases.fetch_add(1, Ordering::SeqCst);
        Lease {
            supervisor: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn closed_error(&self) -> WarrenError {
        self.inner.closed_error()
    }
}

impl Inner {
    fn set_state(&self, state: SupervisorState, epoch: u64) {
        self.status_tx.send_replace(Status { state, epoch });
    }

    fn is_closed(&self) -> bool {
        self.status_tx.borrow().state == SupervisorState::Closed
    }

    fn closed_error(&self) -> WarrenError {
        match &*lock_ignore_poison(&self.terminal) {
            Some(e) => WarrenError::Terminated(e.to_string()),
            None => WarrenError::Closed,
        }
    }

    fn install_session(&self, session: SessionPtr, epoch: u64) {
        let mut slot = match self.session.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some((session, epoch));
    }

    fn take_session(&self) -> Option<(SessionPtr, u64)> {
        let mut slot = match self.session.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }

    fn current_session(&self) -> Option<(SessionPtr, u64)> {
        let slot = match self.session.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }

    async fn wait_connected(&self) -> Result<(SessionPtr, u64)> {
        // ---
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx
                .wait_for(|s| {
                    matches!(
                        s.state,
                        SupervisorState::Connected | SupervisorState::Closed
                    )
                })
                .await
                .map_err(|_| WarrenError::Closed)?;

            if status.state == SupervisorState::Closed {
                return Err(self.closed_error());
            }

            if let Some(current) = self.current_session() {
                return Ok(current);
            }

            // Connected was published but the slot is between swaps.
            rx.changed().await.map_err(|_| WarrenError::Closed)?;
        }
    }

    fn on_failure(self: &Arc<Self>, epoch: u64, reason: &WarrenError) {
        // ---
        let transitioned = self.status_tx.send_if_modified(|s| {
            if s.state == SupervisorState::Connected && s.epoch == epoch {
                s.state = SupervisorState::Reconnecting;
                true
            } else {
                false
            }
        });

        if !transitioned {
            log_debug!(
                "[{}] ignoring stale failure report for epoch {epoch}: {reason}",
                self.name
            );
            return;
        }

        log_warn!("[{}] session lost (epoch {epoch}): {reason}", self.name);

        let dead = self.take_session().map(|(session, _)| session);
        let handle = tokio::spawn(Inner::reconnect(Arc::clone(self), dead));
        let mut tasks = lock_ignore_poison(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn reconnect(self: Arc<Self>, dead: Option<SessionPtr>) {
        // ---
        if let Some(session) = dead {
            let _ = session.close().await;
        }

        let mut backoff = Backoff::new(&self.config.backoff);
        let mut status_rx = self.status_tx.subscribe();

        loop {
            if self.is_closed() {
                return;
            }

            let attempt = backoff.attempts() + 1;
            match timeout(
                self.config.connect_timeout,
                self.connector.establish(&self.config),
            )
            .await
            {
                Ok(Ok(session)) => {
                    let gate = self.registry_gate.lock().await;
                    match self.replay(&session).await {
                        Ok(streams) => {
                            self.complete_reconnect(session, streams);
                            drop(gate);
                            return;
                        }
                        Err(e) => {
                            drop(gate);
                            log_warn!("[{}] replay on new session failed: {e}", self.name);
                            let _ = session.close().await;
                        }
                    }
                }
                Ok(Err(e)) if e.is_auth_failure() => {
                    log_error!("[{}] reconnect refused, giving up: {e}", self.name);
                    *lock_ignore_poison(&self.terminal) = Some(e);
                    self.shutdown().await;
                    return;
                }
                Ok(Err(e)) => {
                    log_warn!("[{}] reconnect attempt {attempt} failed: {e}", self.name);
                }
                Err(_) => {
                    log_warn!(
                        "[{}] reconnect attempt {attempt} timed out after {:?}",
                        self.name,
                        self.config.connect_timeout
                    );
                }
            }

            let delay = backoff.next_delay();
            log_debug!("[{}] next reconnect attempt in {delay:?}", self.name);

            tokio::select! {
                _ = sleep(delay) => {}
                _ = status_rx.wait_for(|s| s.state == SupervisorState::Closed) => return,
            }
        }
    }

    /// Redeclare exchanges and subscriptions on a fresh session.
    ///
    /// Transient failures abort the replay so the caller retries with a new
    /// session; anything else is logged and skipped.
    async fn replay(&self, session: &SessionPtr) -> Result<Vec<(SubscriptionId, DeliveryStream)>> {
        // ---
        let declarations = lock_ignore_poison(&self.declarations).clone();
        for spec in &declarations {
            match session.declare_exchange(spec).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => log_error!("[{}] redeclare of {} failed: {e}", self.name, spec.name),
            }
        }

        let bindings: Vec<(SubscriptionId, Binding)> = lock_ignore_poison(&self.subscriptions)
            .iter()
            .map(|(id, entry)| (*id, entry.binding.clone()))
            .collect();

        let mut streams = Vec::with_capacity(bindings.len());
        for (id, binding) in bindings {
            match session.consume(&binding, self.config.delivery_capacity).await {
                Ok(stream) => streams.push((id, stream)),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => log_error!(
                    "[{}] resubscribe to {} failed: {e}",
                    self.name,
                    binding.exchange.name
                ),
            }
        }

        Ok(streams)
    }

    fn complete_reconnect(
        self: &Arc<Self>,
        session: SessionPtr,
        streams: Vec<(SubscriptionId, DeliveryStream)>,
    ) {
        // ---
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        self.install_session(Arc::clone(&session), epoch);

        for (id, stream) in streams {
            self.attach_stream(id, stream, epoch);
        }

        let published = self.status_tx.send_if_modified(|s| {
            if s.state == SupervisorState::Reconnecting {
                *s = Status {
                    state: SupervisorState::Connected,
                    epoch,
                };
                true
            } else {
                false
            }
        });

        if !published {
            // Closed while we were connecting.
            self.take_session();
            tokio::spawn(async move {
                let _ = session.close().await;
            });
            return;
        }

        let count = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
        log_info!(
            "[{}] reconnected (epoch {epoch}, reconnect #{count})",
            self.name
        );
    }

    /// Record a subscription and start its pump.
    ///
    /// Callers hold `registry_gate`.
    fn insert_subscription(
        self: &Arc<Self>,
        binding: Binding,
        sink: mpsc::Sender<Delivery>,
        stream: Option<(DeliveryStream, u64)>,
    ) -> (SubscriptionId, watch::Receiver<Option<String>>) {
        // ---
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (queue_tx, queue_rx) = watch::channel(None);
        let (streams_tx, streams_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(Inner::pump(Arc::clone(self), id, sink, streams_rx));
        lock_ignore_poison(&self.subscriptions).insert(
            id,
            SubscriptionEntry {
                binding,
                queue: queue_tx,
                epoch: 0,
                streams: streams_tx,
                pump,
            },
        );

        if let Some((stream, epoch)) = stream {
            self.attach_stream(id, stream, epoch);
        }
        (id, queue_rx)
    }

    /// Hand a subscription the stream of a newer session.
    fn attach_stream(&self, id: SubscriptionId, stream: DeliveryStream, epoch: u64) {
        // ---
        let mut subs = lock_ignore_poison(&self.subscriptions);
        let Some(entry) = subs.get_mut(&id) else {
            return;
        };
        if entry.epoch >= epoch {
            return;
        }

        entry.epoch = epoch;
        entry.queue.send_replace(Some(stream.queue.clone()));
        let _ = entry.streams.send((stream, epoch));
    }

    /// Forward each delivery stream of a subscription into its sink, one
    /// stream after the other.
    ///
    /// A stream ending means its session is gone, unless the subscription
    /// was dropped in the meantime.
    async fn pump(
        inner: Arc<Self>,
        id: SubscriptionId,
        sink: mpsc::Sender<Delivery>,
        mut streams: mpsc::UnboundedReceiver<(DeliveryStream, u64)>,
    ) {
        // ---
        while let Some((stream, epoch)) = streams.recv().await {
            let DeliveryStream { queue, mut inbox } = stream;

            while let Some(delivery) = inbox.recv().await {
                if sink.send(delivery).await.is_err() {
                    return;
                }
            }

            let registered = lock_ignore_poison(&inner.subscriptions).contains_key(&id);
            if registered && !inner.is_closed() {
                let reason = WarrenError::ConnectionLost(format!("consumer of {queue} ended"));
                inner.on_failure(epoch, &reason);
            }
        }
    }

    async fn health_check(self: Arc<Self>, period: Duration) {
        // ---
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_rx = self.status_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = status_rx.wait_for(|s| s.state == SupervisorState::Closed) => return,
            }

            if let Some((session, epoch)) = self.current_session() {
                if !session.is_open() {
                    let reason = WarrenError::ConnectionLost(format!(
                        "health check: session {} is closed",
                        session.session_id()
                    ));
                    self.on_failure(epoch, &reason);
                }
            }
        }
    }

    async fn shutdown(&self) {
        // ---
        let changed = self.status_tx.send_if_modified(|s| {
            if s.state == SupervisorState::Closed {
                false
            } else {
                s.state = SupervisorState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        log_info!("[{}] shutting down", self.name);

        // Tasks exit once they observe Closed.
        let tasks: Vec<JoinHandle<()>> = lock_ignore_poison(&self.tasks).drain(..).collect();
        drop(tasks);

        let entries: Vec<SubscriptionEntry> = lock_ignore_poison(&self.subscriptions)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.pump.abort();
        }

        if let Some((session, _)) = self.take_session() {
            let _ = session.close().await;
        }
    }
}

/// Keeps a shared supervisor alive.
///
/// Released explicitly with [`Lease::release`]; dropping an unreleased lease
/// releases it in the background.
pub(crate) struct Lease {
    supervisor: Supervisor,
    released: AtomicBool,
}

impl Lease {
    pub(crate) fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Release the lease, shutting the supervisor down if it was the last one.
    pub(crate) async fn release(&self) {
        if let Some(supervisor) = self.take_last() {
            supervisor.close().await;
        }
    }

    fn take_last(&self) -> Option<Supervisor> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        let remaining = self.supervisor.inner.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        (remaining == 0).then(|| self.supervisor.clone())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(supervisor) = self.take_last() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { supervisor.close().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{BackoffConfig, Connector, ExchangeSpec, MemoryBroker, QueueSpec, Session};
    use bytes::Bytes;

    fn fast_config() -> BrokerConfig {
        BrokerConfig::memory()
            .with_health_check_interval(Some(Duration::from_millis(10)))
            .with_backoff(BackoffConfig {
                multiplier: 2.0,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            })
    }

    async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) -> Status {
        let mut rx = supervisor.subscribe_state();
        let status = *tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached in time")
            .expect("status channel closed");
        status
    }

    /// Wait until the supervisor is connected on `epoch` or later.
    async fn wait_for_epoch(supervisor: &Supervisor, epoch: u64) -> Status {
        let mut rx = supervisor.subscribe_state();
        let status = *tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == SupervisorState::Connected && s.epoch >= epoch),
        )
        .await
        .expect("epoch not reached in time")
        .expect("status channel closed");
        status
    }

    #[tokio::test]
    async fn test_establish_connects() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        assert_eq!(supervisor.state(), SupervisorState::Connected);
        assert_eq!(supervisor.status().epoch, 1);
        assert_eq!(broker.session_count(), 1);

        supervisor.close().await;
        assert_eq!(supervisor.state(), SupervisorState::Closed);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_auth_failure_is_not_retried() {
        // ---
        let broker = MemoryBroker::new();
        broker.reject_credentials(true);

        let err = Supervisor::establish(Arc::new(broker), fast_config())
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_initial_connect_timeout() {
        // ---
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_millis(500)));

        let config = fast_config().with_connect_timeout(Duration::from_millis(20));
        let err = Supervisor::establish(Arc::new(broker), config)
            .await
            .unwrap_err();
        assert!(matches!(err, WarrenError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn test_health_check_reconnects() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        broker.drop_sessions();

        let status = wait_for_epoch(&supervisor, 2).await;
        assert_eq!(status.epoch, 2);
        assert_eq!(supervisor.reconnects(), 1);
        assert_eq!(broker.session_count(), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_stale_failure_is_ignored() {
        // ---
        let broker = MemoryBroker::new();
        let config = fast_config().with_health_check_interval(None);
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), config)
            .await
            .unwrap();

        let reason = WarrenError::ConnectionLost("test".into());
        supervisor.on_failure(7, &reason);
        assert_eq!(supervisor.state(), SupervisorState::Connected);

        supervisor.on_failure(1, &reason);
        assert_eq!(supervisor.state(), SupervisorState::Reconnecting);
        supervisor.on_failure(1, &reason);
        wait_for_epoch(&supervisor, 2).await;

        let (_, epoch) = supervisor.wait_connected().await.unwrap();
        assert_eq!(epoch, 2);
        assert_eq!(supervisor.reconnects(), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_retries_until_broker_returns() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        broker.set_online(false);
        wait_for_state(&supervisor, SupervisorState::Reconnecting).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state(), SupervisorState::Reconnecting);

        broker.set_online(true);
        wait_for_epoch(&supervisor, 2).await;
        assert_eq!(supervisor.reconnects(), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_auth_failure_on_reconnect_is_terminal() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        broker.reject_credentials(true);
        broker.drop_sessions();

        wait_for_state(&supervisor, SupervisorState::Closed).await;
        assert!(supervisor.terminal_error().unwrap().is_auth_failure());
        assert!(matches!(
            supervisor.wait_connected().await,
            Err(WarrenError::Terminated(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_replayed_after_restart() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        let exchange = ExchangeSpec::parse("events", "fanout+ad").unwrap();
        let (session, _) = supervisor.wait_connected().await.unwrap();
        session.declare_exchange(&exchange).await.unwrap();
        supervisor.remember_exchange(&exchange);

        let (tx, mut rx) = mpsc::channel(16);
        let binding = Binding {
            exchange: exchange.clone(),
            queue: QueueSpec::default(),
            binding_key: String::new(),
        };
        let (_id, queue) = supervisor.register_subscription(binding, tx).await.unwrap();
        assert!(queue.borrow().is_some());

        broker.restart();
        assert!(broker.exchange("events").is_none());

        wait_for_epoch(&supervisor, 2).await;
        assert!(broker.exchange("events").is_some());
        assert_eq!(broker.binding_count("events"), 1);

        let (session, _) = supervisor.wait_connected().await.unwrap();
        session
            .publish("events", "", Bytes::from_static(b"after"))
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, Bytes::from_static(b"after"));

        supervisor.close().await;
        assert_eq!(supervisor.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_sink_does_not_hold_reconnect() {
        // ---
        let broker = MemoryBroker::new();
        let config = fast_config().with_delivery_capacity(1);
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), config)
            .await
            .unwrap();

        let exchange = ExchangeSpec::parse("events", "fanout").unwrap();
        let (session, _) = supervisor.wait_connected().await.unwrap();
        session.declare_exchange(&exchange).await.unwrap();
        supervisor.remember_exchange(&exchange);

        // Nobody reads from this sink until the reconnect is done.
        let (tx, mut rx) = mpsc::channel(1);
        let binding = Binding {
            exchange,
            queue: QueueSpec::default(),
            binding_key: String::new(),
        };
        supervisor.register_subscription(binding, tx).await.unwrap();

        for body in ["1", "2", "3", "4"] {
            session.publish("events", "", Bytes::from(body)).await.unwrap();
        }

        broker.drop_sessions();
        wait_for_epoch(&supervisor, 2).await;
        assert_eq!(supervisor.reconnects(), 1);

        let (session, _) = supervisor.wait_connected().await.unwrap();
        session
            .publish("events", "", Bytes::from_static(b"5"))
            .await
            .unwrap();

        // Old deliveries drain first, then the new session's.
        for expected in ["1", "2", "3", "4", "5"] {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got.body, Bytes::from(expected));
        }

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_unregister_cancels_consumer() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), fast_config())
            .await
            .unwrap();

        let exchange = ExchangeSpec::parse("events", "fanout").unwrap();
        let (session, _) = supervisor.wait_connected().await.unwrap();
        session.declare_exchange(&exchange).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let binding = Binding {
            exchange,
            queue: QueueSpec::default(),
            binding_key: String::new(),
        };
        let (id, _) = supervisor.register_subscription(binding, tx).await.unwrap();
        assert_eq!(broker.binding_count("events"), 1);

        supervisor.unregister_subscription(id).await;
        supervisor.unregister_subscription(id).await;
        assert_eq!(supervisor.subscription_count(), 0);
        assert_eq!(broker.binding_count("events"), 0);

        supervisor.close().await;
    }

    /// Memory sessions whose `consume` takes a while to answer.
    struct SlowConsume(MemoryBroker);

    struct SlowSession(SessionPtr);

    #[async_trait::async_trait]
    impl Connector for SlowConsume {
        async fn establish(&self, config: &BrokerConfig) -> Result<SessionPtr> {
            Ok(Arc::new(SlowSession(self.0.establish(config).await?)))
        }
    }

    #[async_trait::async_trait]
    impl Session for SlowSession {
        fn session_id(&self) -> &str {
            self.0.session_id()
        }
        fn is_open(&self) -> bool {
            self.0.is_open()
        }
        async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
            self.0.declare_exchange(spec).await
        }
        async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
            self.0.delete_exchange(name, if_unused).await
        }
        async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
            self.0.publish(exchange, routing_key, payload).await
        }
        async fn consume(&self, binding: &Binding, capacity: usize) -> Result<DeliveryStream> {
            sleep(Duration::from_millis(200)).await;
            self.0.consume(binding, capacity).await
        }
        async fn cancel(&self, queue: &str) -> Result<()> {
            self.0.cancel(queue).await
        }
        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_dropped_registration_leaves_nothing_behind() {
        // ---
        let broker = MemoryBroker::new();
        let connector = Arc::new(SlowConsume(broker.clone()));
        let supervisor = Supervisor::establish(connector, fast_config())
            .await
            .unwrap();

        let exchange = ExchangeSpec::parse("events", "fanout").unwrap();
        let (session, _) = supervisor.wait_connected().await.unwrap();
        session.declare_exchange(&exchange).await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let binding = Binding {
            exchange,
            queue: QueueSpec::default(),
            binding_key: String::new(),
        };
        let registered = tokio::time::timeout(
            Duration::from_millis(20),
            supervisor.register_subscription(binding.clone(), tx.clone()),
        )
        .await;
        assert!(registered.is_err());
        assert_eq!(supervisor.subscription_count(), 0);
        assert_eq!(broker.binding_count("events"), 0);

        // The gate was released with the dropped call.
        supervisor.register_subscription(binding, tx).await.unwrap();
        assert_eq!(supervisor.subscription_count(), 1);
        assert_eq!(broker.binding_count("events"), 1);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn test_last_lease_closes() {
        // ---
        let broker = MemoryBroker::new();
        let supervisor = Supervisor::establish(Arc::new(broker), fast_config())
            .await
            .unwrap();

        let a = supervisor.lease();
        let b = supervisor.lease();

        a.release().await;
        a.release().await;
        assert_eq!(supervisor.state(), SupervisorState::Connected);

        b.release().await;
        assert_eq!(supervisor.state(), SupervisorState::Closed);
    }
}
