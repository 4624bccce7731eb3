//! Exchange lifecycle management.
//!
//! [`ExchangeAdmin`] declares and deletes exchanges on the supervisor's
//! current session. Admin errors (`SpecConflict`, `ExchangeInUse`,
//! `NotFound`) are returned to the caller and never retried. A transient
//! failure is reported to the supervisor and also returned, since the
//! operation may or may not have reached the broker.

use crate::{
    // ---
    log_debug,
    log_info,
    ExchangeSpec,
    Result,
    Supervisor,
    WarrenError,
};

/// Declares and deletes exchanges through a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct ExchangeAdmin {
    supervisor: Supervisor,
}

impl ExchangeAdmin {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// Create the exchange, or confirm that an existing one matches `spec`.
    ///
    /// Idempotent. Fails with `SpecConflict` when an exchange of the same
    /// name exists with a different kind or flags. A declared exchange is
    /// redeclared by the supervisor after every reconnect.
    pub async fn declare(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let (session, epoch) = self.supervisor.wait_connected().await?;

        match session.declare_exchange(spec).await {
            Ok(()) => {
                log_debug!("declared exchange {} ({})", spec.name, spec.describe());
                self.supervisor.remember_exchange(spec);
                Ok(())
            }
            Err(e) => {
                self.report(epoch, &e);
                Err(e)
            }
        }
    }

    /// Delete the exchange `name`.
    ///
    /// With `if_unused` set, an exchange that still has bindings is left in
    /// place and `ExchangeInUse` is returned. Either form fails with
    /// `NotFound` if the exchange does not exist.
    pub async fn delete(&self, name: &str, if_unused: bool) -> Result<()> {
        // ---
        let (session, epoch) = self.supervisor.wait_connected().await?;

        match session.delete_exchange(name, if_unused).await {
            Ok(()) => {
                log_info!("deleted exchange {name} (if_unused={if_unused})");
                self.supervisor.forget_exchange(name);
                Ok(())
            }
            Err(e) => {
                self.report(epoch, &e);
                Err(e)
            }
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    fn report(&self, epoch: u64, err: &WarrenError) {
        if err.is_transient() {
            self.supervisor.on_failure(epoch, err);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Binding, BrokerConfig, MemoryBroker, QueueSpec};
    use std::sync::Arc;

    async fn setup() -> (MemoryBroker, ExchangeAdmin) {
        let broker = MemoryBroker::new();
        let config = BrokerConfig::memory().with_health_check_interval(None);
        let supervisor = Supervisor::establish(Arc::new(broker.clone()), config)
            .await
            .unwrap();
        (broker, ExchangeAdmin::new(supervisor))
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        // ---
        let (broker, admin) = setup().await;
        let spec = ExchangeSpec::parse("orders", "direct+du").unwrap();

        admin.declare(&spec).await.unwrap();
        admin.declare(&spec).await.unwrap();

        assert_eq!(broker.exchange("orders"), Some(spec));
    }

    #[tokio::test]
    async fn test_declare_conflict() {
        // ---
        let (_broker, admin) = setup().await;
        admin
            .declare(&ExchangeSpec::parse("orders", "direct").unwrap())
            .await
            .unwrap();

        let err = admin
            .declare(&ExchangeSpec::parse("orders", "fanout").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, WarrenError::SpecConflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_exchange() {
        // ---
        let (_broker, admin) = setup().await;

        let err = admin.delete("nowhere", false).await.unwrap_err();
        assert!(matches!(err, WarrenError::NotFound(_)));

        let err = admin.delete("nowhere", true).await.unwrap_err();
        assert!(matches!(err, WarrenError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_if_unused() {
        // ---
        let (broker, admin) = setup().await;
        let spec = ExchangeSpec::parse("events", "fanout").unwrap();
        admin.declare(&spec).await.unwrap();

        let (session, _) = admin.supervisor().wait_connected().await.unwrap();
        let _stream = session
            .consume(
                &Binding {
                    exchange: spec.clone(),
                    queue: QueueSpec::default(),
                    binding_key: String::new(),
                },
                8,
            )
            .await
            .unwrap();

        let err = admin.delete("events", true).await.unwrap_err();
        assert!(matches!(err, WarrenError::ExchangeInUse(_)));
        assert!(broker.exchange("events").is_some());

        admin.delete("events", false).await.unwrap();
        assert!(broker.exchange("events").is_none());
    }

    #[tokio::test]
    async fn test_closed_supervisor() {
        // ---
        let (_broker, admin) = setup().await;
        admin.supervisor().close().await;

        let spec = ExchangeSpec::parse("late", "topic").unwrap();
        assert!(matches!(
            admin.declare(&spec).await,
            Err(WarrenError::Closed)
        ));
    }
}
