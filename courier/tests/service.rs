use courier::{
    BrokerClient, Emulator, Error, ErrorPolicy, Message, ReceivedStore, ServiceOpts, ServiceState,
    SubscriptionService,
};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};

const TOPIC: &str = "topic";
const SUB: &str = "sub";

async fn emulator_with(payloads: &[&str]) -> Arc<Emulator> {
    let emulator = Arc::new(Emulator::new());
    emulator.create_topic(TOPIC).await.unwrap();
    emulator.create_subscription(TOPIC, SUB).await.unwrap();
    for payload in payloads {
        emulator
            .publish(TOPIC, Message::new(*payload))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    emulator
}

fn opts(error_policy: ErrorPolicy) -> ServiceOpts {
    ServiceOpts {
        max_messages: 2,
        max_backoff: Duration::from_millis(100),
        error_policy,
    }
}

fn shutdown_after(service: &SubscriptionService<Emulator>, delay: Duration) {
    let handle = service.handle();
    tokio::spawn(async move {
        sleep(delay).await;
        handle.shutdown();
    });
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_bounded_and_idempotent() {
    let emulator = emulator_with(&[]).await;
    let service =
        SubscriptionService::new(emulator, SUB).with_opts(opts(ErrorPolicy::AckOnError));
    let handle = service.handle();
    assert_eq!(handle.state(), ServiceState::Idle);
    shutdown_after(&service, Duration::from_millis(300));

    let started = Instant::now();
    let stats = timeout(Duration::from_secs(5), service.run(|_| Ok(true)))
        .await
        .expect("run returns after shutdown")
        .unwrap();
    // noticed no later than one max backoff after the signal
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() <= Duration::from_millis(400));
    assert_eq!(stats.delivered, 0);
    assert_eq!(handle.state(), ServiceState::Stopped);

    handle.shutdown();
    handle.shutdown();
    assert_eq!(handle.state(), ServiceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_run() {
    let emulator = emulator_with(&["a"]).await;
    let service = SubscriptionService::new(emulator.clone(), SUB);
    service.handle().shutdown();
    assert_eq!(service.state(), ServiceState::Idle);

    let stats = service.run(|_| Ok(true)).await.unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(emulator.outstanding(SUB), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cannot_run_twice() {
    let emulator = emulator_with(&[]).await;
    let service = SubscriptionService::new(emulator, SUB);
    service.handle().shutdown();
    service.run(|_| Ok(true)).await.unwrap();

    let err = service.run(|_| Ok(true)).await.unwrap_err();
    assert!(matches!(err, Error::ServiceState(ServiceState::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn test_handler_error_does_not_stop_loop() {
    let emulator = emulator_with(&["m0", "m1", "m2", "m3", "m4"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::AckOnError));
    shutdown_after(&service, Duration::from_secs(1));

    let store = ReceivedStore::new();
    let stats = service
        .run(|message| {
            store.record(message.clone());
            if message.data == b"m2".to_vec() {
                anyhow::bail!("cannot handle m2");
            }
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(store.count(), 5);
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.handler_errors, 1);
    assert_eq!(stats.acked, 5);
    assert_eq!(emulator.outstanding(SUB), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handler_panic_does_not_stop_loop() {
    let emulator = emulator_with(&["m0", "m1", "m2"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::AckOnError));
    shutdown_after(&service, Duration::from_secs(1));

    let mut seen = Vec::new();
    let stats = service
        .run(|message| {
            if message.data == b"m1".to_vec() {
                panic!("handler blew up");
            }
            seen.push(message.data.clone());
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![b"m0".to_vec(), b"m2".to_vec()]);
    assert_eq!(stats.handler_errors, 1);
    assert_eq!(emulator.outstanding(SUB), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nack_on_error_redelivers() {
    let emulator = emulator_with(&["m0", "m1", "m2"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::NackOnError));
    shutdown_after(&service, Duration::from_secs(1));

    let mut failed_once = false;
    let store = ReceivedStore::new();
    let stats = service
        .run(|message| {
            if message.data == b"m1".to_vec() && !failed_once {
                failed_once = true;
                anyhow::bail!("transient failure");
            }
            store.record(message.clone());
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(store.count(), 3);
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.acked, 3);
    assert_eq!(emulator.outstanding(SUB), 0);
}

#[tokio::test(start_paused = true)]
async fn test_false_leaves_message_unacked() {
    let emulator = emulator_with(&["keep"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::AckOnError));
    shutdown_after(&service, Duration::from_millis(500));

    let mut attempts = 0;
    let stats = service
        .run(|_| {
            attempts += 1;
            // reject the first two deliveries
            Ok(attempts > 2)
        })
        .await
        .unwrap();

    assert_eq!(stats.nacked, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(emulator.outstanding(SUB), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_stream_stops_loop() {
    let emulator = emulator_with(&["a"]).await;
    let service = SubscriptionService::new(emulator.clone(), SUB);
    let handle = service.handle();
    let closer = emulator.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        closer.close();
    });

    let stats = timeout(Duration::from_secs(5), service.run(|_| Ok(true)))
        .await
        .expect("closed stream ends the loop")
        .unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(handle.state(), ServiceState::Stopped);
    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_broker_is_retried() {
    let emulator = emulator_with(&["a"]).await;
    emulator.set_unavailable(true);
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::AckOnError));
    let healer = emulator.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        healer.set_unavailable(false);
    });
    shutdown_after(&service, Duration::from_secs(1));

    let stats = service.run(|_| Ok(true)).await.unwrap();
    assert_eq!(stats.acked, 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_heartbeat() {
    let emulator = emulator_with(&[]).await;
    let service =
        SubscriptionService::new(emulator, SUB).with_opts(opts(ErrorPolicy::AckOnError));
    let handle = service.handle();
    let probe = tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        let health = handle.health(Duration::from_secs(1)).await;
        handle.shutdown();
        health
    });

    service.run(|_| Ok(true)).await.unwrap();
    let (state, at) = probe.await.unwrap().unwrap();
    assert_eq!(state, ServiceState::Running);
    assert!(at > 0);
}

#[tokio::test]
async fn test_rejecting_handler_does_not_starve_runtime() {
    let emulator = emulator_with(&["a"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::AckOnError));
    let handle = service.handle();
    shutdown_after(&service, Duration::from_millis(100));

    let stats = timeout(Duration::from_secs(1), service.run(|_| Ok(false)))
        .await
        .expect("run returns after shutdown")
        .unwrap();
    assert!(stats.nacked >= 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(emulator.outstanding(SUB), 1);
    assert_eq!(handle.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_failing_handler_with_nack_does_not_starve_runtime() {
    let emulator = emulator_with(&["a", "b"]).await;
    let service =
        SubscriptionService::new(emulator.clone(), SUB).with_opts(opts(ErrorPolicy::NackOnError));
    shutdown_after(&service, Duration::from_millis(100));

    let stats = timeout(
        Duration::from_secs(1),
        service.run(|_| Err(anyhow::anyhow!("rejected"))),
    )
    .await
    .expect("run returns after shutdown")
    .unwrap();
    assert!(stats.handler_errors >= 2);
    assert!(stats.nacked >= 2);
    assert_eq!(stats.acked, 0);
    assert_eq!(emulator.outstanding(SUB), 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_answers_when_not_running() {
    let emulator = emulator_with(&[]).await;
    let service = SubscriptionService::new(emulator, SUB);
    let handle = service.handle();

    let started = Instant::now();
    let (state, _) = handle.health(Duration::from_secs(1)).await.unwrap();
    assert_eq!(state, ServiceState::Idle);

    handle.shutdown();
    service.run(|_| Ok(true)).await.unwrap();
    let (state, at) = handle.health(Duration::from_secs(1)).await.unwrap();
    assert_eq!(state, ServiceState::Stopped);
    assert!(at > 0);
    // neither call waited for an answer from the loop
    assert!(started.elapsed() < Duration::from_millis(10));
}
