//! Publishing side.
//!
//! A [`Writer`] publishes the messages queued on its [`SendPort`] to one
//! exchange, in the order they were queued.
//!
//! The port is bounded (`BrokerConfig::send_capacity`): `send` suspends the
//! caller while it is full. During an outage the publish task waits for the
//! supervisor to reconnect and queued messages stay in the port. The only
//! message that can be lost is the one being published at the moment the
//! session fails; it is dropped, not retried.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::supervisor::Lease;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerConfig,
    ConnectorPtr,
    ExchangeAdmin,
    ExchangeSpec,
    Result,
    Supervisor,
    SupervisorState,
    WarrenError,
};

/// One message waiting in a writer's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,

    /// Overrides the writer's routing key when set.
    pub routing_key: Option<String>,
}

/// Producer handle for a [`Writer`].
///
/// Cheap to clone. All clones feed the same FIFO port.
#[derive(Clone)]
pub struct SendPort {
    tx: mpsc::Sender<OutboundMessage>,
    closed: watch::Receiver<bool>,
    supervisor: Supervisor,
}

impl SendPort {
    /// Queue `payload` for publishing under the writer's routing key.
    ///
    /// Suspends while the port is full. Fails with `Closed` once the writer
    /// has been closed, or with `Terminated` if the session was given up.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(OutboundMessage {
            payload: payload.into(),
            routing_key: None,
        })
        .await
    }

    /// Queue `payload` for publishing under `routing_key`.
    pub async fn send_to(&self, routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.enqueue(OutboundMessage {
            payload: payload.into(),
            routing_key: Some(routing_key.into()),
        })
        .await
    }

    async fn enqueue(&self, msg: OutboundMessage) -> Result<()> {
        // ---
        if *self.closed.borrow() || self.supervisor.state() == SupervisorState::Closed {
            return Err(self.closed_error());
        }

        let mut closed = self.closed.clone();
        tokio::select! {
            sent = self.tx.send(msg) => sent.map_err(|_| self.closed_error()),
            _ = closed.wait_for(|c| *c) => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> WarrenError {
        self.supervisor.closed_error()
    }
}

/// Publishes to one exchange.
pub struct Writer {
    exchange: ExchangeSpec,
    routing_key: String,
    admin: ExchangeAdmin,
    lease: Lease,
    port: SendPort,
    closed_tx: Arc<watch::Sender<bool>>,
    outbox: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Writer {
    /// Connect to an AMQP broker and declare the writer's exchange.
    #[cfg(feature = "transport_lapin")]
    pub async fn connect(
        config: BrokerConfig,
        exchange_name: &str,
        spec: &str,
        routing_key: impl Into<String>,
    ) -> Result<(Self, SendPort)> {
        let connector: ConnectorPtr = Arc::new(crate::LapinConnector::new());
        Self::with_connector(connector, config, exchange_name, spec, routing_key).await
    }

    /// Like [`connect`](Self::connect) but through any [`Connector`](crate::Connector).
    ///
    /// The writer owns the supervisor it creates; closing the writer closes it.
    pub async fn with_connector(
        connector: ConnectorPtr,
        config: BrokerConfig,
        exchange_name: &str,
        spec: &str,
        routing_key: impl Into<String>,
    ) -> Result<(Self, SendPort)> {
        // ---
        let exchange = ExchangeSpec::parse(exchange_name, spec)?;
        let supervisor = Supervisor::establish(connector, config)
            .await
            .map_err(WarrenError::construction)?;

        match Self::from_spec(&supervisor, exchange, routing_key.into()).await {
            Ok(writer) => Ok(writer),
            Err(e) => {
                supervisor.close().await;
                Err(e)
            }
        }
    }

    /// Declare `exchange_name` with `spec` on a shared supervisor.
    ///
    /// Fails with `Construction` if the declaration is rejected, e.g. because
    /// the exchange exists with a different kind or flags.
    pub async fn new(
        supervisor: &Supervisor,
        exchange_name: &str,
        spec: &str,
        routing_key: impl Into<String>,
    ) -> Result<(Self, SendPort)> {
        let exchange = ExchangeSpec::parse(exchange_name, spec)?;
        Self::from_spec(supervisor, exchange, routing_key.into()).await
    }

    async fn from_spec(
        supervisor: &Supervisor,
        exchange: ExchangeSpec,
        routing_key: String,
    ) -> Result<(Self, SendPort)> {
        // ---
        let admin = ExchangeAdmin::new(supervisor.clone());
        admin
            .declare(&exchange)
            .await
            .map_err(WarrenError::construction)?;

        let (tx, rx) = mpsc::channel(supervisor.config().send_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);

        let port = SendPort {
            tx,
            closed: closed_rx,
            supervisor: supervisor.clone(),
        };

        log_debug!("writer ready on exchange {}", exchange.name);

        let writer = Self {
            exchange,
            routing_key,
            admin,
            lease: supervisor.lease(),
            port: port.clone(),
            closed_tx: Arc::new(closed_tx),
            outbox: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        };

        Ok((writer, port))
    }

    /// Start publishing with the routing key given at construction.
    pub fn start(&self) -> Result<()> {
        self.start_writer(self.routing_key.clone())
    }

    /// Start the publish task, draining the port in FIFO order.
    ///
    /// Messages sent without an explicit key are published under
    /// `routing_key`. Fails with `AlreadyStarted` on a second call.
    pub fn start_writer(&self, routing_key: impl Into<String>) -> Result<()> {
        // ---
        if *self.closed_tx.borrow() {
            return Err(WarrenError::Closed);
        }

        let outbox = lock_ignore_poison(&self.outbox)
            .take()
            .ok_or(WarrenError::AlreadyStarted)?;

        let task = PublishTask {
            supervisor: self.lease.supervisor().clone(),
            exchange: self.exchange.name.clone(),
            routing_key: routing_key.into(),
            outbox,
            closed_tx: Arc::clone(&self.closed_tx),
        };

        log_info!(
            "writer started on exchange {} (key {:?})",
            task.exchange,
            task.routing_key
        );

        *lock_ignore_poison(&self.task) = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Another producer handle for this writer.
    pub fn port(&self) -> SendPort {
        self.port.clone()
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Delete the writer's exchange; see [`ExchangeAdmin::delete`].
    pub async fn delete(&self, if_unused: bool) -> Result<()> {
        self.admin.delete(&self.exchange.name, if_unused).await
    }

    /// Stop publishing and release the supervisor lease.
    ///
    /// Callers suspended in `send` are woken with `Closed`. Messages still
    /// queued in the port are discarded. Idempotent.
    pub async fn close(&self) {
        // ---
        if self.closed_tx.send_replace(true) {
            return;
        }

        let task = lock_ignore_poison(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        log_debug!("writer on exchange {} closed", self.exchange.name);
        self.lease.release().await;
    }
}

struct PublishTask {
    supervisor: Supervisor,
    exchange: String,
    routing_key: String,
    outbox: mpsc::Receiver<OutboundMessage>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl PublishTask {
    async fn run(mut self) {
        // ---
        let mut closed = self.closed_tx.subscribe();

        loop {
            let msg = tokio::select! {
                msg = self.outbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = closed.wait_for(|c| *c) => break,
            };

            let connected = tokio::select! {
                connected = self.supervisor.wait_connected() => connected,
                _ = closed.wait_for(|c| *c) => break,
            };

            let (session, epoch) = match connected {
                Ok(connected) => connected,
                Err(_e) => {
                    log_warn!("writer on {} stopping: {_e}", self.exchange);
                    break;
                }
            };

            let key = msg.routing_key.as_deref().unwrap_or(&self.routing_key);
            match session.publish(&self.exchange, key, msg.payload).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    log_warn!("dropped message in flight to {}: {e}", self.exchange);
                    self.supervisor.on_failure(epoch, &e);
                }
                Err(_e) => {
                    log_error!("publish to {} failed: {_e}", self.exchange);
                }
            }
        }

        // Wake producers blocked on a full port.
        self.closed_tx.send_replace(true);
    }
}
