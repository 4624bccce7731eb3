//! Domain layer public interface.
//!
//! This module defines the broker session abstraction the supervisor, Writer,
//! Reader and admin are written against. It is independent of any concrete
//! protocol client.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod session;

pub use session::{
    //
    Binding,
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryStream,
    Session,
    SessionPtr,
};
