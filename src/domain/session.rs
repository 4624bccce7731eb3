// src/domain/session.rs

//! Broker session abstractions.
//!
//! A [`Session`] is one live connection to the broker. It is owned by the
//! supervisor, replaced wholesale on every reconnect, and only ever handed
//! out by reference ([`SessionPtr`]).
//!
//! The session layer makes no attempt at recovery. Any operation on a dead
//! session fails with [`WarrenError::ConnectionLost`](crate::WarrenError) and
//! it is up to the caller to report the failure to the supervisor.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{BrokerConfig, ExchangeSpec, QueueSpec, Result};

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Opaque payload bytes.
    pub body: Bytes,

    /// Set by the broker when the message was delivered before.
    pub redelivered: bool,
}

/// Queue declaration and binding requested by a Reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub binding_key: String,
}

/// Stream of deliveries for one consumed queue.
///
/// The stream ends (`recv` returns `None`) when the session that created it
/// dies or is closed.
pub struct DeliveryStream {
    /// Name of the queue the broker bound, generated names included.
    pub queue: String,

    /// Receiver channel for delivered messages, in broker delivery order.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// One live broker session.
///
/// Implementations must ensure that:
/// - once `consume()` returns, messages published afterwards to the bound
///   exchange and matching the key are deliverable,
/// - `publish()` calls made sequentially by one caller reach the broker in
///   call order,
/// - after the session is lost every operation fails with
///   `ConnectionLost` and every `DeliveryStream` ends.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    // ---
    /// Unique identifier of this session, used for logging.
    fn session_id(&self) -> &str;

    /// Cheap liveness check, polled by the supervisor's health task.
    fn is_open(&self) -> bool;

    /// Create the exchange, or confirm an existing one has the same flags.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Delete an exchange, refusing when `if_unused` is set and it has bindings.
    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()>;

    /// Publish a payload to an exchange.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Declare the queue, bind it and start consuming.
    async fn consume(&self, binding: &Binding, capacity: usize) -> Result<DeliveryStream>;

    /// Stop consuming `queue` on this session.
    ///
    /// An auto-delete queue is removed together with its binding; a durable
    /// queue stays bound and keeps collecting messages.
    async fn cancel(&self, queue: &str) -> Result<()>;

    /// Close the session and release its resources.
    async fn close(&self) -> Result<()>;
}

/// Shared session pointer.
pub type SessionPtr = Arc<dyn Session>;

/// Opens sessions.
///
/// This is the boundary to the broker-protocol client: authentication and
/// negotiation failures come back as `AccessRefused`/`Protocol`, network
/// failures as `ConnectionLost`.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn establish(&self, config: &BrokerConfig) -> Result<SessionPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
