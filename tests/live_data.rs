mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agent_live::client::TransportConfig;
use agent_live::core::{LiveError, PushTopic};
use agent_live::live::{LiveDataService, LiveServiceConfig, LiveStatus, SubscriptionOptions};
use agent_live::testing::{MockDataSource, MockTransport, mock_client};
use common::{WAIT, fast_config};
use proptest::prelude::*;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

type Service = LiveDataService<MockTransport>;

async fn offline_service(
    config: TransportConfig,
    live: LiveServiceConfig,
    source: &MockDataSource,
) -> (Service, agent_live::testing::MockServer) {
    let (client, server) = mock_client(config);
    server.refuse_connections(true);
    let service = LiveDataService::init(live, client, Arc::new(source.clone()))
        .await
        .unwrap();
    (service, server)
}

async fn wait_status(service: &Service, pred: impl Fn(&LiveStatus) -> bool) -> LiveStatus {
    tokio::time::timeout(WAIT, async {
        loop {
            let status = service.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status reached")
}

fn channel_callback() -> (
    impl Fn(Value) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(Instant, Value)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |value| {
            let _ = tx.send((Instant::now(), value));
        },
        rx,
    )
}

#[tokio::test(start_paused = true)]
async fn immediate_fetch_runs_before_the_first_interval() {
    let source = MockDataSource::new();
    source.respond("/api/metrics/system", json!({"cpu": 12.5}));
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let (callback, mut rx) = channel_callback();
    let started = Instant::now();
    service
        .subscribe(
            "/api/metrics/system",
            callback,
            SubscriptionOptions::default()
                .immediate(true)
                .interval(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    let (first, data) = rx.recv().await.unwrap();
    assert_eq!(data["cpu"], json!(12.5));
    assert!(first - started < Duration::from_secs(1));

    let (second, _) = rx.recv().await.unwrap();
    let (third, _) = rx.recv().await.unwrap();
    assert!(second - started >= Duration::from_secs(1));
    assert!(third - second >= Duration::from_secs(1));
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_polling_for_good() {
    let source = MockDataSource::new();
    source.respond("/api/alerts", json!([]));
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let (callback, mut rx) = channel_callback();
    let id = service
        .subscribe(
            "/api/alerts",
            callback,
            SubscriptionOptions::default().interval(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    rx.recv().await.unwrap();
    assert_eq!(service.active_subscriptions().await, 1);

    assert!(service.unsubscribe(&id).await.unwrap());
    assert!(!service.unsubscribe(&id).await.unwrap());
    let calls = source.calls_to("/api/alerts");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls_to("/api/alerts"), calls);
    let status = service.status().await.unwrap();
    assert_eq!(status.subscriptions, 0);
    assert_eq!(status.polling, 0);
    assert!(rx.try_recv().is_err());
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn polled_alerts_pass_through_a_critical_only_filter() {
    let source = MockDataSource::new();
    source
        .respond("/api/alerts", json!([]))
        .respond_once("/api/alerts", Ok(json!([{"id": "a1", "severity": "low"}])))
        .respond_once("/api/alerts", Ok(json!([{"id": "a2", "severity": "critical"}])));
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let (callback, mut rx) = channel_callback();
    let started = Instant::now();
    service
        .subscribe(
            "/api/alerts",
            callback,
            SubscriptionOptions::default()
                .interval(Duration::from_millis(1000))
                .filter(|alerts| {
                    alerts
                        .as_array()
                        .is_some_and(|list| list.iter().any(|a| a["severity"] == "critical"))
                }),
        )
        .await
        .unwrap();

    let (at, data) = rx.recv().await.unwrap();
    assert_eq!(data, json!([{"id": "a2", "severity": "critical"}]));
    assert!(at - started >= Duration::from_millis(2000));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(rx.try_recv().is_err());
    assert!(source.calls_to("/api/alerts") >= 4);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_fetches_retry_inline_then_report_once() {
    let source = MockDataSource::new();
    source.fail(
        "/api/projects/metrics",
        LiveError::Http {
            status: 503,
            message: "Service Unavailable".into(),
        },
    );
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let options = SubscriptionOptions::default()
        .immediate(true)
        .interval(Duration::from_secs(60))
        .retry(2, Duration::from_millis(100))
        .on_error({
            let errors = errors.clone();
            move |err| {
                errors.fetch_add(1, Ordering::SeqCst);
                let _ = error_tx.send((Instant::now(), err.clone()));
            }
        });
    let started = Instant::now();
    service
        .subscribe("/api/projects/metrics", |_| {}, options)
        .await
        .unwrap();

    let (at, err) = error_rx.recv().await.unwrap();
    assert!(matches!(err, LiveError::Http { status: 503, .. }));
    // attempts at 0ms, 100ms and 300ms
    assert!(at - started >= Duration::from_millis(300));
    assert!(at - started < Duration::from_secs(1));
    assert_eq!(source.calls_to("/api/projects/metrics"), 3);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_within_retries() {
    let source = MockDataSource::new();
    source
        .respond("/api/agents/metrics", json!([{"id": "agent-1"}]))
        .respond_once("/api/agents/metrics", Err(LiveError::Request("reset".into())));
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let (callback, mut rx) = channel_callback();
    let options = SubscriptionOptions::default().immediate(true).on_error({
        let errors = errors.clone();
        move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        }
    });
    service
        .subscribe("/api/agents/metrics", callback, options)
        .await
        .unwrap();

    let (_, data) = rx.recv().await.unwrap();
    assert_eq!(data[0]["id"], json!("agent-1"));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pushes_reach_only_matching_subscriptions() {
    let source = MockDataSource::new();
    let (client, mut server) = mock_client(fast_config(3));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client,
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let conn = server.accept_timeout(WAIT).await.expect("connection");
    wait_status(&service, |s| s.connected).await;

    let (alerts_cb, mut alerts_rx) = channel_callback();
    let (metrics_cb, mut metrics_rx) = channel_callback();
    let (custom_cb, mut custom_rx) = channel_callback();
    service
        .subscribe("/api/alerts", alerts_cb, SubscriptionOptions::default())
        .await
        .unwrap();
    service
        .subscribe("/api/metrics/system", metrics_cb, SubscriptionOptions::default())
        .await
        .unwrap();
    service
        .subscribe(
            "/custom/feed",
            custom_cb,
            SubscriptionOptions::default()
                .topic(PushTopic::Alerts)
                .transform(|v| json!(v.as_array().map(Vec::len).unwrap_or(0))),
        )
        .await
        .unwrap();
    assert_eq!(service.status().await.unwrap().polling, 0);

    conn.send_json(&json!({
        "type": "alerts",
        "content": "[{\"id\":\"a1\",\"severity\":\"critical\"},{\"id\":\"a2\"}]"
    }))
    .unwrap();

    let (_, alerts) = tokio::time::timeout(WAIT, alerts_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alerts[0]["id"], json!("a1"));
    let (_, count) = tokio::time::timeout(WAIT, custom_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(count, json!(2));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), metrics_rx.recv())
            .await
            .is_err()
    );
    assert_eq!(source.calls().len(), 0);
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn alert_pushes_do_not_reach_the_health_subscription() {
    let source = MockDataSource::new();
    source.respond(
        "/api/health/detailed",
        json!({"overall": "healthy", "services": [], "alerts": []}),
    );
    source.respond("/api/alerts", json!([]));
    let (client, mut server) = mock_client(fast_config(3));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client,
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let conn = server.accept_timeout(WAIT).await.unwrap();
    wait_status(&service, |s| s.connected).await;

    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    service
        .subscribe_to_system_health(
            move |health| {
                let _ = health_tx.send(health);
            },
            SubscriptionOptions::default().on_error(move |err| {
                let _ = error_tx.send(err.clone());
            }),
        )
        .await
        .unwrap();
    let (alerts_tx, mut alerts_rx) = mpsc::unbounded_channel();
    service
        .subscribe_to_alerts(
            move |alerts| {
                let _ = alerts_tx.send(alerts);
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();

    // both immediate REST fetches land first
    let health = tokio::time::timeout(WAIT, health_rx.recv()).await.unwrap().unwrap();
    assert_eq!(health.overall, "healthy");
    assert!(tokio::time::timeout(WAIT, alerts_rx.recv()).await.unwrap().unwrap().is_empty());

    conn.send_json(&json!({
        "type": "alerts",
        "content": "[{\"id\":\"a1\",\"severity\":\"critical\",\"title\":\"Disk full\"}]"
    }))
    .unwrap();

    let pushed = tokio::time::timeout(WAIT, alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].id, "a1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(health_rx.try_recv().is_err());
    assert!(error_rx.try_recv().is_err(), "health subscription saw an alerts push");
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filtered_pushes_are_dropped() {
    let source = MockDataSource::new();
    let (client, mut server) = mock_client(fast_config(3));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client,
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let conn = server.accept_timeout(WAIT).await.unwrap();
    wait_status(&service, |s| s.connected).await;

    let (callback, mut rx) = channel_callback();
    service
        .subscribe(
            "/api/metrics/system",
            callback,
            SubscriptionOptions::default().filter(|v| v["cpu"].as_f64().unwrap_or(0.0) > 50.0),
        )
        .await
        .unwrap();

    conn.send_json(&json!({"type": "system_metrics", "content": {"cpu": 10.0}}))
        .unwrap();
    conn.send_json(&json!({"type": "system_metrics", "content": {"cpu": 90.0}}))
        .unwrap();

    let (_, data) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data["cpu"], json!(90.0));
    assert!(rx.try_recv().is_err());
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_reconnects_degrade_to_polling_permanently() {
    let source = MockDataSource::new();
    source.respond("/api/alerts", json!([{"id": "polled"}]));
    let (client, mut server) = mock_client(fast_config(1));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client.clone(),
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let mut conn = server.accept_timeout(WAIT).await.unwrap();
    wait_status(&service, |s| s.connected).await;

    let (callback, mut rx) = channel_callback();
    service
        .subscribe(
            "/api/alerts",
            callback,
            SubscriptionOptions::default().interval(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert_eq!(service.status().await.unwrap().polling, 0);

    server.refuse_connections(true);
    conn.drop_socket();

    let status = wait_status(&service, |s| s.degraded).await;
    assert!(!status.connected);
    assert_eq!(status.polling, 1);
    let (_, data) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(data[0]["id"], json!("polled"));

    // the transport comes back, but degradation is not undone
    server.refuse_connections(false);
    client.connect().await.unwrap();
    let _conn = server.accept_timeout(WAIT).await.unwrap();
    let status = wait_status(&service, |s| s.connected).await;
    assert!(status.degraded);
    assert_eq!(status.polling, 1);

    let (later_cb, _later_rx) = channel_callback();
    service
        .subscribe("/api/metrics/system", later_cb, SubscriptionOptions::default())
        .await
        .unwrap();
    assert_eq!(service.status().await.unwrap().polling, 2);
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connected_event_promotes_polling_subscriptions() {
    let source = MockDataSource::new();
    source.respond("/api/alerts", json!([]));
    let config = TransportConfig::new("ws://mock").with_reconnect(20, Duration::from_millis(50));
    let (service, mut server) =
        offline_service(config, LiveServiceConfig::default(), &source).await;

    service
        .subscribe("/api/alerts", |_| {}, SubscriptionOptions::default())
        .await
        .unwrap();
    let status = service.status().await.unwrap();
    assert_eq!(status.polling, 1);
    assert!(!status.degraded);

    server.refuse_connections(false);
    let _conn = server.accept_timeout(WAIT).await.expect("retry connects");
    let status = wait_status(&service, |s| s.connected).await;
    assert_eq!(status.polling, 0);
    assert!(!status.degraded);
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_call_rest_then_notify_over_the_socket() {
    let source = MockDataSource::new();
    source.respond("/api/alerts/a1/acknowledge", json!({"ok": true}));
    source.respond("/api/projects/p1/config", json!({"ok": true}));
    let (client, mut server) = mock_client(fast_config(3));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client,
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let mut conn = server.accept_timeout(WAIT).await.unwrap();
    wait_status(&service, |s| s.connected).await;
    assert!(service.connection_status().await);

    service.acknowledge_alert("a1").await.unwrap();
    let notice = conn.recv_json_timeout(WAIT).await.expect("notice");
    assert_eq!(notice["type"], json!("system"));
    let content: Value = serde_json::from_str(notice["content"].as_str().unwrap()).unwrap();
    assert_eq!(content, json!({"type": "alert_acknowledged", "alertId": "a1"}));

    service
        .update_project_configuration("p1", json!({"budget": 10}))
        .await
        .unwrap();
    let notice = conn.recv_json_timeout(WAIT).await.expect("notice");
    let content: Value = serde_json::from_str(notice["content"].as_str().unwrap()).unwrap();
    assert_eq!(content["type"], json!("project_config_updated"));
    assert_eq!(content["config"], json!({"budget": 10}));

    let err = service.restart_agent("missing").await.unwrap_err();
    assert!(matches!(err, LiveError::Http { status: 404, .. }));
    assert!(conn.recv_outbound_timeout(Duration::from_millis(100)).await.is_none());

    let calls = source.calls();
    assert_eq!(calls[0].method, "POST");
    assert_eq!(calls[0].endpoint, "/api/alerts/a1/acknowledge");
    assert_eq!(calls[1].method, "PUT");
    assert_eq!(calls[1].body, Some(json!({"budget": 10})));
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_heartbeat_is_sent_while_connected() {
    let source = MockDataSource::new();
    let (client, mut server) = mock_client(fast_config(3));
    let live = LiveServiceConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..LiveServiceConfig::default()
    };
    let service = LiveDataService::init(live, client, Arc::new(source))
        .await
        .unwrap();
    let mut conn = server.accept_timeout(WAIT).await.unwrap();

    let notice = conn.recv_json_timeout(WAIT).await.expect("heartbeat notice");
    assert_eq!(notice["type"], json!("system"));
    let content: Value = serde_json::from_str(notice["content"].as_str().unwrap()).unwrap();
    assert_eq!(content["type"], json!("heartbeat"));
    assert!(content["timestamp"].is_string());
    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent_and_closes_the_socket() {
    let source = MockDataSource::new();
    source.respond("/api/alerts", json!([]));
    let (client, mut server) = mock_client(fast_config(3));
    let service = LiveDataService::init(
        LiveServiceConfig::default(),
        client.clone(),
        Arc::new(source.clone()),
    )
    .await
    .unwrap();
    let mut conn = server.accept_timeout(WAIT).await.unwrap();
    wait_status(&service, |s| s.connected).await;
    service
        .subscribe("/api/alerts", |_| {}, SubscriptionOptions::default().immediate(true))
        .await
        .unwrap();

    service.shutdown().await.unwrap();
    service.shutdown().await.unwrap();

    assert_eq!(
        conn.recv_outbound_timeout(WAIT).await,
        Some(agent_live::core::WsFrame::client_disconnect())
    );
    assert!(!client.is_connected().await);
    assert!(matches!(
        service
            .subscribe("/api/alerts", |_| {}, SubscriptionOptions::default())
            .await,
        Err(LiveError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn typed_helpers_decode_records() {
    let source = MockDataSource::new();
    source.respond(
        "/api/health/detailed",
        json!({"overall": "degraded", "services": [], "alerts": []}),
    );
    source.respond("/api/alerts", json!({"unexpected": "shape"}));
    let (service, _server) =
        offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    service
        .subscribe_to_system_health(
            move |health| {
                let _ = health_tx.send(health);
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    let health = health_rx.recv().await.unwrap();
    assert_eq!(health.overall, "degraded");

    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    service
        .subscribe_to_alerts(
            |_| panic!("alerts should not decode"),
            SubscriptionOptions::default().on_error(move |err| {
                let _ = error_tx.send(err.clone());
            }),
        )
        .await
        .unwrap();
    assert!(matches!(
        error_rx.recv().await.unwrap(),
        LiveError::ParseFailed(_)
    ));
    service.shutdown().await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn polling_timers_track_live_subscriptions(
        ops in proptest::collection::vec((any::<bool>(), 0usize..8), 1..24)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(async move {
            let source = MockDataSource::new();
            source.respond("/api/metrics/system", json!({"cpu": 1.0}));
            let (service, _server) =
                offline_service(fast_config(1), LiveServiceConfig::default(), &source).await;

            let mut live = Vec::new();
            for (subscribe, pick) in ops {
                if subscribe || live.is_empty() {
                    let id = service
                        .subscribe(
                            "/api/metrics/system",
                            |_| {},
                            SubscriptionOptions::default().interval(Duration::from_millis(100)),
                        )
                        .await
                        .unwrap();
                    live.push(id);
                } else {
                    let id = live.remove(pick % live.len());
                    assert!(service.unsubscribe(&id).await.unwrap());
                }
                let status = service.status().await.unwrap();
                assert_eq!(status.subscriptions, live.len());
                assert!(status.polling <= status.subscriptions);
                assert_eq!(status.polling, live.len());
                tokio::time::sleep(Duration::from_millis(30)).await;
            }

            for id in live.drain(..) {
                service.unsubscribe(&id).await.unwrap();
            }
            let calls = source.calls_to("/api/metrics/system");
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(source.calls_to("/api/metrics/system"), calls);
            assert_eq!(service.status().await.unwrap().polling, 0);
            service.shutdown().await.unwrap();
        });
    }
}
