//! Consuming side.
//!
//! A [`Reader`] binds a queue to one exchange and forwards every delivery to
//! a caller-supplied [`DeliverySink`], in broker delivery order.
//!
//! ## Design notes
//!
//! ### Subscriptions survive reconnects
//!
//! `start_eating` registers the queue binding with the supervisor. After a
//! reconnect the supervisor redeclares it and deliveries resume on the same
//! sink. Nothing is buffered or synthesized across the outage: whatever the
//! broker did not retain is lost to every reader.
//!
//! ### Sink errors
//!
//! A sink returning `Closed` stops the reader's consume task. Any other
//! error is logged and the next delivery is processed as usual.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::supervisor::{Lease, SubscriptionId};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Binding,
    BrokerConfig,
    ConnectorPtr,
    Delivery,
    ExchangeAdmin,
    ExchangeSpec,
    QueueSpec,
    Result,
    RouteSpec,
    Supervisor,
    WarrenError,
};

/// Receiver of a reader's deliveries.
///
/// Implementations should assume:
/// - deliveries arrive in broker order, one at a time
/// - a gap may occur while the session is being recovered
/// - a message may be redelivered if the broker says so (`redelivered`)
#[async_trait::async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// Handle one delivery.
    ///
    /// Returning `Closed` stops the reader; other errors are logged.
    async fn deliver(&self, delivery: Delivery) -> Result<()>;
}

#[async_trait::async_trait]
impl DeliverySink for mpsc::Sender<Delivery> {
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.send(delivery).await.map_err(|_| WarrenError::Closed)
    }
}

/// Sink built from an async closure, see [`sink_fn`].
pub struct FnSink<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> DeliverySink for FnSink<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        (self.f)(delivery).await
    }
}

/// Wrap an async closure as a [`DeliverySink`].
///
/// ```
/// # use warren::{sink_fn, Delivery};
/// let sink = sink_fn(|d: Delivery| async move {
///     println!("{}: {} bytes", d.routing_key, d.body.len());
///     Ok(())
/// });
/// # let _ = sink;
/// ```
pub fn sink_fn<F, Fut>(f: F) -> FnSink<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnSink { f }
}

#[derive(Default)]
struct Eating {
    subscription: Option<SubscriptionId>,
    task: Option<JoinHandle<()>>,
}

type QueueWatch = Option<watch::Receiver<Option<String>>>;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consumes from one exchange.
pub struct Reader {
    exchange: ExchangeSpec,
    queue: QueueSpec,
    binding_key: String,
    admin: ExchangeAdmin,
    lease: Lease,
    closed_tx: watch::Sender<bool>,
    eating: tokio::sync::Mutex<Eating>,
    // Kept outside `eating` so it can be read while start/stop is running.
    queue_name: Mutex<QueueWatch>,
}

impl Reader {
    /// Connect to an AMQP broker and declare the reader's exchange.
    #[cfg(feature = "transport_lapin")]
    pub async fn connect(
        config: BrokerConfig,
        exchange_name: &str,
        spec: &str,
        binding_key: impl Into<String>,
    ) -> Result<Self> {
        let connector: ConnectorPtr = Arc::new(crate::LapinConnector::new());
        Self::with_connector(connector, config, exchange_name, spec, binding_key).await
    }

    /// Like [`connect`](Self::connect) but through any [`Connector`](crate::Connector).
    ///
    /// The reader owns the supervisor it creates; closing the reader closes it.
    pub async fn with_connector(
        connector: ConnectorPtr,
        config: BrokerConfig,
        exchange_name: &str,
        spec: &str,
        binding_key: impl Into<String>,
    ) -> Result<Self> {
        // ---
        let route = RouteSpec::parse(exchange_name, spec)?;
        let supervisor = Supervisor::establish(connector, config)
            .await
            .map_err(WarrenError::construction)?;

        match Self::from_route(&supervisor, route, binding_key.into()).await {
            Ok(reader) => Ok(reader),
            Err(e) => {
                supervisor.close().await;
                Err(e)
            }
        }
    }

    /// Declare (or validate) `exchange_name` with `spec` on a shared supervisor.
    ///
    /// `spec` may carry a queue section after `>`, e.g. `"topic+du>audit+du+!ad"`.
    pub async fn new(
        supervisor: &Supervisor,
        exchange_name: &str,
        spec: &str,
        binding_key: impl Into<String>,
    ) -> Result<Self> {
        let route = RouteSpec::parse(exchange_name, spec)?;
        Self::from_route(supervisor, route, binding_key.into()).await
    }

    async fn from_route(
        supervisor: &Supervisor,
        route: RouteSpec,
        binding_key: String,
    ) -> Result<Self> {
        // ---
        let admin = ExchangeAdmin::new(supervisor.clone());
        admin
            .declare(&route.exchange)
            .await
            .map_err(WarrenError::construction)?;

        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            exchange: route.exchange,
            queue: route.queue,
            binding_key,
            admin,
            lease: supervisor.lease(),
            closed_tx,
            eating: tokio::sync::Mutex::new(Eating::default()),
            queue_name: Mutex::new(None),
        })
    }

    /// Bind a queue to the exchange and forward its deliveries to `sink`.
    ///
    /// Waits for a session if the supervisor is reconnecting. Fails with
    /// `AlreadyStarted` while a previous `start_eating` is still active (call
    /// [`stop`](Self::stop) first) and with `Closed` once the reader is closed.
    pub async fn start_eating<S>(&self, sink: S) -> Result<()>
    where
        S: DeliverySink,
    {
        // ---
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(WarrenError::Closed);
        }

        let mut eating = self.eating.lock().await;
        if eating.subscription.is_some() {
            return Err(WarrenError::AlreadyStarted);
        }

        let supervisor = self.lease.supervisor();
        let (tx, mut rx) = mpsc::channel(supervisor.config().delivery_capacity);
        let binding = Binding {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            binding_key: self.binding_key.clone(),
        };

        // Registration is cancel safe, so losing the race to close leaves
        // nothing registered.
        let (id, queue_name) = tokio::select! {
            registered = supervisor.register_subscription(binding, tx) => registered?,
            _ = closed.wait_for(|c| *c) => return Err(WarrenError::Closed),
        };

        let exchange = self.exchange.name.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match sink.deliver(delivery).await {
                    Ok(()) => {}
                    Err(WarrenError::Closed) => {
                        log_debug!("sink for {exchange} closed");
                        break;
                    }
                    Err(_e) => log_warn!("sink for {exchange} failed: {_e}"),
                }
            }
        });

        log_info!(
            "reader eating from {} (key {:?}, queue {:?})",
            self.exchange.name,
            self.binding_key,
            queue_name.borrow().as_deref()
        );

        *lock_ignore_poison(&self.queue_name) = Some(queue_name);
        *eating = Eating {
            subscription: Some(id),
            task: Some(task),
        };
        Ok(())
    }

    /// Unregister the subscription and stop delivering. Idempotent.
    pub async fn stop(&self) {
        // ---
        let mut eating = self.eating.lock().await;
        let Eating { subscription, task } = std::mem::take(&mut *eating);

        lock_ignore_poison(&self.queue_name).take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(id) = subscription {
            self.lease.supervisor().unregister_subscription(id).await;
            log_debug!("reader on {} stopped", self.exchange.name);
        }
    }

    /// Name of the bound queue, once eating.
    ///
    /// Changes after a reconnect when the broker generates queue names.
    pub fn queue_name(&self) -> Option<String> {
        let queue_name = lock_ignore_poison(&self.queue_name);
        let name = queue_name.as_ref()?.borrow().clone();
        name
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Delete the reader's exchange; see [`ExchangeAdmin::delete`].
    pub async fn delete(&self, if_unused: bool) -> Result<()> {
        self.admin.delete(&self.exchange.name, if_unused).await
    }

    /// Stop eating and release the supervisor lease. Idempotent.
    pub async fn close(&self) {
        // ---
        if self.closed_tx.send_replace(true) {
            return;
        }
        self.stop().await;
        self.lease.release().await;
    }
}
