//! AMQP connector implementation using `lapin`.
//!
//! This module provides an implementation of the `Connector` and `Session`
//! traits backed by an AMQP 0-9-1 broker connection. It follows an
//! **actor-based concurrency model** to safely integrate with the underlying
//! AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** per session owns the AMQP connection
//!   and the publish channel.
//! - The actor is responsible for:
//!   - publishing outbound messages,
//!   - declaring and deleting exchanges,
//!   - declaring, binding, consuming and cancelling queues,
//!   - clean shutdown of the connection.
//! - All interaction with the AMQP client is serialized through this actor;
//!   no other task ever touches the connection directly.
//!
//! ## Channel usage
//!
//! AMQP closes a channel on any soft error (404 NOT_FOUND, 406
//! PRECONDITION_FAILED). Declarations and deletions therefore run on a
//! short-lived channel each, and every consumer gets its own channel, so a
//! rejected declaration never takes the publish channel down with it.
//!
//! ## Failure detection
//!
//! The connection's error callback flips the session's liveness flag, which
//! the supervisor's health check polls. Consumer streams end when their
//! channel dies, which the supervisor also treats as session loss.
//!
//! ## Delivery semantics
//!
//! Consumers run in `no_ack` mode; the broker considers a message delivered
//! once it is on the wire. Nothing is persisted or replayed by this layer.
//!
//! ## Cancellation
//!
//! A consumer is cancelled either through `Session::cancel` or by dropping
//! its `DeliveryStream`. Either way `basic.cancel` is sent and the
//! consumer's channel closed, which lets the broker remove an auto-delete
//! queue and its binding.

use lapin::{
    //
    options::{
        //
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ExchangeDeclareOptions,
        ExchangeDeleteOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError},
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Binding,
    BrokerConfig,
    Connector,
    Delivery,
    DeliveryStream,
    ExchangeKind,
    ExchangeSpec,
    Result,
    Session,
    SessionPtr,
    WarrenError,
};

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        exchange: String,
        routing_key: String,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Declare {
        spec: ExchangeSpec,
        resp: oneshot::Sender<Result<()>>,
    },
    Delete {
        name: String,
        if_unused: bool,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        binding: Binding,
        capacity: usize,
        resp: oneshot::Sender<Result<DeliveryStream>>,
    },
    Cancel {
        queue: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor
    async fn handle(self, actor: &mut Actor) -> ActorStep {
        // ---
        match self {
            Cmd::Publish {
                exchange,
                routing_key,
                payload,
                resp,
            } => {
                let result = actor.do_publish(&exchange, &routing_key, payload).await;
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Declare { spec, resp } => {
                let _ = resp.send(actor.do_declare(&spec).await);
                ActorStep::Continue
            }
            Cmd::Delete {
                name,
                if_unused,
                resp,
            } => {
                let _ = resp.send(actor.do_delete(&name, if_unused).await);
                ActorStep::Continue
            }
            Cmd::Consume {
                binding,
                capacity,
                resp,
            } => {
                let _ = resp.send(actor.do_consume(&binding, capacity).await);
                ActorStep::Continue
            }
            Cmd::Cancel { queue, resp } => {
                let _ = resp.send(actor.do_cancel(&queue).await);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }
}

/// Background actor task that owns the AMQP connection and publish channel.
struct Actor {
    // ---
    session_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: Vec<ConsumerTask>,
    open: Arc<AtomicBool>,
}

/// A running consumer and the channel it owns.
struct ConsumerTask {
    queue: String,
    tag: String,
    channel: Channel,
    handle: JoinHandle<()>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.session_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if let ActorStep::Stop = cmd.handle(&mut self).await {
                break;
            }
        }

        log_info!("[{}] AMQP session shutting down", self.session_id);
        self.open.store(false, Ordering::SeqCst);

        for consumer in self.consumers.drain(..) {
            consumer.handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_debug!("[{}] AMQP actor stopped", self.session_id);
    }

    async fn do_publish(&mut self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        if !self.channel.status().connected() {
            // The broker closed the publish channel (e.g. 404 on a vanished
            // exchange); open a fresh one on the same connection.
            self.channel = self.connection.create_channel().await.map_err(classify)?;
            log_warn!("[{}] reopened publish channel", self.session_id);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn do_declare(&mut self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let channel = self.connection.create_channel().await.map_err(classify)?;

        let opts = ExchangeDeclareOptions {
            passive: false,
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: spec.internal,
            nowait: false,
        };

        let result = channel
            .exchange_declare(&spec.name, amqp_kind(spec.kind), opts, FieldTable::default())
            .await
            .map_err(|e| match soft_error(&e) {
                Some(AMQPSoftError::PRECONDITIONFAILED) => WarrenError::SpecConflict {
                    name: spec.name.clone(),
                    details: e.to_string(),
                },
                _ => classify(e),
            });

        close_quietly(&channel).await;

        if result.is_ok() {
            log_info!("[{}] Declared exchange: {}", self.session_id, spec.name);
        }
        result
    }

    async fn do_delete(&mut self, name: &str, if_unused: bool) -> Result<()> {
        // ---

        // RabbitMQ reports success when deleting a missing exchange; a passive
        // declare tells us whether it exists.
        let passive = self.connection.create_channel().await.map_err(classify)?;
        let exists = passive
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| match soft_error(&e) {
                Some(AMQPSoftError::NOTFOUND) => WarrenError::NotFound(name.to_string()),
                _ => classify(e),
            });
        close_quietly(&passive).await;
        exists?;

        let channel = self.connection.create_channel().await.map_err(classify)?;
        let result = channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(|e| match soft_error(&e) {
                Some(AMQPSoftError::PRECONDITIONFAILED) => {
                    WarrenError::ExchangeInUse(name.to_string())
                }
                Some(AMQPSoftError::NOTFOUND) => WarrenError::NotFound(name.to_string()),
                _ => classify(e),
            });
        close_quietly(&channel).await;

        if result.is_ok() {
            log_info!("[{}] Deleted exchange: {name}", self.session_id);
        }
        result
    }

    async fn do_consume(&mut self, binding: &Binding, capacity: usize) -> Result<DeliveryStream> {
        // ---
        let channel = self.connection.create_channel().await.map_err(classify)?;

        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: binding.queue.durable,
            exclusive: binding.queue.exclusive,
            auto_delete: binding.queue.auto_delete,
            nowait: false,
        };

        let requested = binding.queue.name.as_deref().unwrap_or("");
        let queue = channel
            .queue_declare(requested, queue_opts, FieldTable::default())
            .await
            .map_err(classify)?;
        let queue_name = queue.name().as_str().to_string();

        let exchange = binding.exchange.name.as_str();
        channel
            .queue_bind(
                &queue_name,
                exchange,
                &binding.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| match soft_error(&e) {
                Some(AMQPSoftError::NOTFOUND) => WarrenError::NotFound(exchange.to_string()),
                _ => classify(e),
            })?;

        let tag = format!("{}-{queue_name}", self.session_id);
        let consumer = channel
            .basic_consume(
                &queue_name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        log_info!(
            "[{}] Consuming queue {queue_name} bound to {exchange} with key {:?}",
            self.session_id,
            binding.binding_key
        );

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session_id = self.session_id.clone();
        let queue_clone = queue_name.clone();
        let consumer_channel = channel.clone();
        let consumer_tag = tag.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let channel = consumer_channel;
            let mut consumer = consumer;

            loop {
                // A dropped stream cancels the consumer.
                let next = tokio::select! {
                    next = consumer.next() => next,
                    _ = tx.closed() => None,
                };
                let Some(delivery_result) = next else {
                    break;
                };

                match delivery_result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            body: Bytes::from(delivery.data),
                            redelivered: delivery.redelivered,
                        };
                        if tx.send(delivery).await.is_err() {
                            log_debug!("[{session_id}] delivery stream for {queue_clone} dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{session_id}] Consumer error on {queue_clone}: {e}");
                        break;
                    }
                }
            }

            if tx.is_closed() && channel.status().connected() {
                let _ = channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await;
            }
            close_quietly(&channel).await;

            log_info!("[{session_id}] Consumer task ended for queue: {queue_clone}");
        });

        self.consumers.retain(|c| !c.handle.is_finished());
        self.consumers.push(ConsumerTask {
            queue: queue_name.clone(),
            tag,
            channel,
            handle,
        });

        Ok(DeliveryStream {
            queue: queue_name,
            inbox: rx,
        })
    }

    async fn do_cancel(&mut self, queue: &str) -> Result<()> {
        // ---
        let (cancelled, kept): (Vec<ConsumerTask>, Vec<ConsumerTask>) = self
            .consumers
            .drain(..)
            .partition(|c| c.queue == queue);
        self.consumers = kept;

        for consumer in cancelled {
            consumer.handle.abort();
            if consumer.channel.status().connected() {
                consumer
                    .channel
                    .basic_cancel(&consumer.tag, BasicCancelOptions::default())
                    .await
                    .map_err(classify)?;
            }
            close_quietly(&consumer.channel).await;
            log_info!("[{}] Cancelled consumer of queue {queue}", self.session_id);
        }
        Ok(())
    }
}

/// AMQP session handle.
///
/// All operations are forwarded to the session's actor.
struct LapinSession {
    // ---
    session_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    open: Arc<AtomicBool>,
}

impl LapinSession {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|_| {
            WarrenError::ConnectionLost(format!("amqp: session {} stopped", self.session_id))
        })?;

        rx.await.map_err(|_| {
            WarrenError::ConnectionLost(format!("amqp: session {} dropped reply", self.session_id))
        })?
    }
}

#[async_trait::async_trait]
impl Session for LapinSession {
    // ---
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let spec = spec.clone();
        self.request(|resp| Cmd::Declare { spec, resp }).await
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        let name = name.to_string();
        self.request(|resp| Cmd::Delete {
            name,
            if_unused,
            resp,
        })
        .await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        self.request(|resp| Cmd::Publish {
            exchange,
            routing_key,
            payload,
            resp,
        })
        .await
    }

    async fn consume(&self, binding: &Binding, capacity: usize) -> Result<DeliveryStream> {
        let binding = binding.clone();
        self.request(|resp| Cmd::Consume {
            binding,
            capacity,
            resp,
        })
        .await
    }

    async fn cancel(&self, queue: &str) -> Result<()> {
        let queue = queue.to_string();
        self.request(|resp| Cmd::Cancel { queue, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector for AMQP 0-9-1 brokers (RabbitMQ).
///
/// # Connection Behavior
///
/// Each `establish()` opens a new TCP connection and publish channel and
/// spawns the session actor. The connect timeout is applied by the caller.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for LapinConnector {
    // ---
    async fn establish(&self, config: &BrokerConfig) -> Result<SessionPtr> {
        // ---
        log_info!("Connecting to AMQP broker: {}", config.endpoint());

        let mut uri = AMQPUri::default();
        uri.authority.host = config.host.clone();
        uri.authority.port = config.port;
        uri.authority.userinfo.username = config.username.clone();
        uri.authority.userinfo.password = config.password.clone();
        uri.vhost = config.vhost.clone();
        uri.query.heartbeat = config.heartbeat_secs;

        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(|e| {
                let err = classify(e);
                log_error!("amqp: connection to {} failed: {err}", config.endpoint());
                err
            })?;

        let channel = connection.create_channel().await.map_err(classify)?;

        let session_id = format!("amqp-{}", uuid::Uuid::new_v4().simple());
        let open = Arc::new(AtomicBool::new(true));

        {
            let open = Arc::clone(&open);
            let session_id = session_id.clone();
            connection.on_error(move |_err| {
                log_warn!("[{session_id}] AMQP connection error: {_err}");
                open.store(false, Ordering::SeqCst);
            });
        }

        log_info!("[{session_id}] Connected to AMQP broker {}", config.endpoint());

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let actor = Actor {
            session_id: session_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: Vec::new(),
            open: Arc::clone(&open),
        };
        tokio::spawn(actor.run());

        Ok(Arc::new(LapinSession {
            session_id,
            cmd_tx,
            open,
        }))
    }
}

fn amqp_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

async fn close_quietly(channel: &Channel) {
    if channel.status().connected() {
        let _ = channel.close(200, "OK").await;
    }
}

fn soft_error(err: &lapin::Error) -> Option<AMQPSoftError> {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(soft) => Some(soft.clone()),
            AMQPErrorKind::Hard(_) => None,
        },
        _ => None,
    }
}

/// Map a lapin error onto the crate's error taxonomy.
///
/// Authentication and permission failures are fatal, negotiation failures
/// are protocol errors, and everything that looks like the network or the
/// connection going away is transient.
fn classify(err: lapin::Error) -> WarrenError {
    // ---
    let text = err.to_string();
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => WarrenError::AccessRefused(text),
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED)
            | AMQPErrorKind::Hard(AMQPHardError::INTERNALERROR)
            | AMQPErrorKind::Hard(AMQPHardError::RESOURCEERROR) => {
                WarrenError::ConnectionLost(text)
            }
            AMQPErrorKind::Hard(_) => WarrenError::Protocol(text),
            AMQPErrorKind::Soft(_) => WarrenError::Broker(text),
        },
        lapin::Error::InvalidProtocolVersion(_) => WarrenError::Protocol(text),
        _ => WarrenError::ConnectionLost(text),
    }
}
