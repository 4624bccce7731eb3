use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use warren::{
    //
    BackoffConfig,
    BrokerConfig,
    Delivery,
    MemoryBroker,
    Reader,
    Supervisor,
    SupervisorState,
    WarrenError,
    Writer,
};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn config() -> BrokerConfig {
    BrokerConfig::memory()
        .with_health_check_interval(Some(Duration::from_millis(10)))
        .with_backoff(BackoffConfig {
            multiplier: 2.0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(25),
        })
}

async fn shared(broker: &MemoryBroker, config: BrokerConfig) -> Supervisor {
    init_tracing();
    Supervisor::establish(Arc::new(broker.clone()), config)
        .await
        .expect("memory broker accepts connections")
}

fn seq(delivery: &Delivery) -> u32 {
    std::str::from_utf8(&delivery.body)
        .expect("utf8 payload")
        .parse()
        .expect("numbered payload")
}

async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Option<Delivery> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_uninterrupted_session_keeps_order() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config()).await;

    let reader = Reader::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    reader.start_eating(tx).await.unwrap();

    let (writer, port) = Writer::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    writer.start().unwrap();

    const N: u32 = 500;
    let producer = tokio::spawn(async move {
        for i in 1..=N {
            port.send(i.to_string()).await.unwrap();
        }
    });

    for expected in 1..=N {
        let d = recv(&mut rx).await.expect("delivery");
        assert_eq!(seq(&d), expected);
    }
    producer.await.unwrap();

    writer.close().await;
    reader.close().await;
    assert_eq!(sup.state(), SupervisorState::Closed);
}

#[tokio::test]
async fn test_writer_loses_exactly_the_message_in_flight() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config().with_health_check_interval(None)).await;
    let mut tap = broker.tap("rhtest");

    let (writer, port) = Writer::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    writer.start().unwrap();

    for i in 1..=5u32 {
        port.send(i.to_string()).await.unwrap();
    }
    for expected in 1..=5u32 {
        assert_eq!(seq(&tap.recv().await.unwrap()), expected);
    }

    broker.drop_sessions();

    for i in 6..=10u32 {
        port.send(i.to_string()).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 7..=10u32 {
        let d = tokio::time::timeout(Duration::from_secs(2), tap.recv())
            .await
            .expect("delivery after reconnect")
            .unwrap();
        seen.push(seq(&d));
    }
    assert_eq!(seen, vec![7, 8, 9, 10]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tap.try_recv().is_err());
    assert_eq!(sup.reconnects(), 1);

    writer.close().await;
}

#[tokio::test]
async fn test_broker_outage_loses_at_most_one() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config()).await;

    let reader = Reader::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    let (tx, mut rx) = mpsc::channel(64);
    reader.start_eating(tx).await.unwrap();

    let (writer, port) = Writer::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    writer.start().unwrap();

    const N: u32 = 100;
    const K: u32 = 20;

    for i in 1..=K {
        port.send(i.to_string()).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < K as usize {
        received.push(seq(&recv(&mut rx).await.expect("delivery before outage")));
    }

    broker.set_online(false);
    for i in K + 1..=N {
        port.send(i.to_string()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sup.state(), SupervisorState::Reconnecting);
    broker.set_online(true);

    while let Some(d) = recv(&mut rx).await {
        received.push(seq(&d));
        if received.last() == Some(&N) {
            break;
        }
    }

    let count = received.len() as u32;
    assert!(count >= N - 1 && count <= N, "received {count} of {N}");
    assert!(received.windows(2).all(|w| w[0] < w[1]), "order broken");
    assert_eq!(sup.reconnects(), 1);

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn test_delete_if_unused_with_active_reader() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config()).await;

    let reader = Reader::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();
    let (tx, _rx) = mpsc::channel(8);
    reader.start_eating(tx).await.unwrap();

    let (writer, _port) = Writer::new(&sup, "rhtest", "fanout+ad", "").await.unwrap();

    let err = writer.delete(true).await.unwrap_err();
    assert!(matches!(err, WarrenError::ExchangeInUse(_)));
    assert!(broker.exchange("rhtest").is_some());

    writer.delete(false).await.unwrap();
    assert!(broker.exchange("rhtest").is_none());

    let err = writer.delete(false).await.unwrap_err();
    assert!(matches!(err, WarrenError::NotFound(_)));

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn test_auth_failure_after_construction_is_terminal() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config()).await;

    let (writer, port) = Writer::new(&sup, "rhtest", "fanout", "").await.unwrap();
    writer.start().unwrap();

    broker.reject_credentials(true);
    broker.drop_sessions();

    let mut status = sup.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == SupervisorState::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(port.send("x").await, Err(WarrenError::Terminated(_))));
    assert!(matches!(
        writer.delete(false).await,
        Err(WarrenError::Terminated(_))
    ));

    writer.close().await;
}

#[tokio::test]
async fn test_initial_failures_surface_as_construction_errors() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();

    broker.set_connect_delay(Some(Duration::from_millis(200)));
    let slow = config().with_connect_timeout(Duration::from_millis(20));
    let err = Writer::with_connector(Arc::new(broker.clone()), slow, "rhtest", "fanout", "")
        .await
        .err()
        .unwrap();
    match err {
        WarrenError::Construction(inner) => {
            assert!(matches!(*inner, WarrenError::ConnectTimeout(_)))
        }
        other => panic!("unexpected {other:?}"),
    }

    broker.set_connect_delay(None);
    broker.reject_credentials(true);
    let err = Reader::with_connector(Arc::new(broker.clone()), config(), "rhtest", "fanout", "")
        .await
        .err()
        .unwrap();
    match err {
        WarrenError::Construction(inner) => assert!(inner.is_auth_failure()),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_owned_supervisor_closes_with_writer() {
    // ---
    init_tracing();
    let broker = MemoryBroker::new();

    let (writer, port) =
        Writer::with_connector(Arc::new(broker.clone()), config(), "rhtest", "topic+du", "a.b")
            .await
            .unwrap();
    writer.start().unwrap();
    assert_eq!(broker.session_count(), 1);
    assert_eq!(broker.exchange("rhtest").map(|x| x.durable), Some(true));

    let mut tap = broker.tap("rhtest");
    port.send(Bytes::from_static(b"payload")).await.unwrap();
    let d = tap.recv().await.unwrap();
    assert_eq!(d.routing_key, "a.b");

    writer.close().await;
    assert_eq!(broker.session_count(), 0);
    assert!(matches!(port.send("late").await, Err(WarrenError::Closed)));
}

#[tokio::test]
async fn test_stopped_reader_no_longer_blocks_delete() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config()).await;

    let (writer, _port) = Writer::new(&sup, "rhtest", "fanout", "").await.unwrap();
    let reader = Reader::new(&sup, "rhtest", "fanout", "").await.unwrap();

    let (tx, _rx) = mpsc::channel(8);
    reader.start_eating(tx).await.unwrap();
    assert!(matches!(
        writer.delete(true).await,
        Err(WarrenError::ExchangeInUse(_))
    ));

    reader.stop().await;
    assert_eq!(broker.binding_count("rhtest"), 0);
    writer.delete(true).await.unwrap();
    assert!(broker.exchange("rhtest").is_none());
    reader.close().await;

    // Closing a reader releases its binding too.
    let reader = Reader::new(&sup, "rhtest", "fanout", "").await.unwrap();
    let (tx, _rx) = mpsc::channel(8);
    reader.start_eating(tx).await.unwrap();
    assert_eq!(broker.binding_count("rhtest"), 1);

    reader.close().await;
    assert_eq!(sup.state(), SupervisorState::Connected);
    writer.delete(true).await.unwrap();

    writer.close().await;
    assert_eq!(sup.state(), SupervisorState::Closed);
}

#[tokio::test]
async fn test_backpressured_reader_does_not_stall_writer() {
    // ---
    let broker = MemoryBroker::new();
    let sup = shared(&broker, config().with_delivery_capacity(1)).await;
    let mut tap = broker.tap("rhtest");

    let reader = Reader::new(&sup, "rhtest", "fanout", "").await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    reader.start_eating(tx).await.unwrap();

    let (writer, port) = Writer::new(&sup, "rhtest", "fanout", "").await.unwrap();
    writer.start().unwrap();

    for i in 1..=4u32 {
        port.send(i.to_string()).await.unwrap();
    }
    for expected in 1..=4u32 {
        assert_eq!(seq(&tap.recv().await.unwrap()), expected);
    }

    // The reader has not taken a single delivery when the session goes.
    broker.drop_sessions();

    let mut status = sup.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == SupervisorState::Connected && s.epoch >= 2),
    )
    .await
    .expect("reconnect must not wait for the reader")
    .unwrap();

    for i in 5..=8u32 {
        port.send(i.to_string()).await.unwrap();
    }

    let mut published = Vec::new();
    while published.last() != Some(&8) {
        let d = tokio::time::timeout(Duration::from_secs(2), tap.recv())
            .await
            .expect("writer keeps publishing")
            .unwrap();
        published.push(seq(&d));
    }
    assert!(published.windows(2).all(|w| w[0] < w[1]));

    let mut received = Vec::new();
    while let Some(d) = recv(&mut rx).await {
        received.push(seq(&d));
        if received.last() == Some(&8) {
            break;
        }
    }
    assert_eq!(&received[..4], &[1, 2, 3, 4]);
    assert!(received.windows(2).all(|w| w[0] < w[1]), "order broken");

    writer.close().await;
    reader.close().await;
}
