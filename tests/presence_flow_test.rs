//! End-to-end flow: intake socket -> collection -> event channel

use beacon_presence::domain::Advertisement;
use beacon_presence::infra::Metrics;
use beacon_presence::io::advert_listener::serve_adverts;
use beacon_presence::io::{apply_control, create_event_channel, ControlTopics, LifecycleKind, PresenceEvent};
use beacon_presence::services::{FingerprintCollection, Tunables};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

fn kinds(rx: &mut mpsc::Receiver<PresenceEvent>) -> Vec<LifecycleKind> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PresenceEvent::Lifecycle { kind, .. } = event {
            out.push(kind);
        }
    }
    out
}

#[test]
fn test_lifecycle_events_in_order() {
    let (sender, mut rx) = create_event_channel(64);
    let collection = FingerprintCollection::new(Tunables::default()).with_listener(Arc::new(sender));
    // Keep counting out of the picture
    assert!(collection.command("count_ids", "nothing-matches"));

    let adv = Advertisement::new("c0:ff:ee:00:00:01".parse().unwrap(), -65);
    assert!(collection.seen_at(&adv, 0));

    let forget_ms = collection.tunables().forget_ms;
    let mut now = 0;
    while now <= forget_ms + 5_000 {
        collection.cleanup_at(now);
        now += 1_000;
    }

    assert_eq!(
        kinds(&mut rx),
        vec![LifecycleKind::Add, LifecycleKind::Close, LifecycleKind::Left, LifecycleKind::Del]
    );
    assert!(collection.is_empty());
}

#[test]
fn test_lifecycle_event_json() {
    let (sender, mut rx) = create_event_channel(8);
    let collection = FingerprintCollection::new(Tunables::default()).with_listener(Arc::new(sender));
    assert!(collection.config("c0ffee000001", r#"{"name":"Desk Tag","calRssi":-62}"#));

    let adv = Advertisement::new("c0:ff:ee:00:00:01".parse().unwrap(), -62);
    collection.seen_at(&adv, 0);

    let event = rx.try_recv().unwrap();
    let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
    assert_eq!(json["event"], "lifecycle");
    assert_eq!(json["kind"], "add");
    assert_eq!(json["fingerprint"]["id"], "c0ffee000001");
    assert_eq!(json["fingerprint"]["name"], "Desk Tag");
    assert_eq!(json["fingerprint"]["rssi_1m"], -62);
    assert_eq!(json["fingerprint"]["state"], "tracking");
}

#[tokio::test]
async fn test_socket_intake_reaches_collection() {
    let metrics = Arc::new(Metrics::new());
    let (sender, mut events) = create_event_channel(64);
    let collection = Arc::new(
        FingerprintCollection::new(Tunables::default())
            .with_metrics(metrics.clone())
            .with_listener(Arc::new(sender.with_metrics(metrics.clone()))),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (advert_tx, mut advert_rx) = mpsc::channel::<Advertisement>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_adverts(listener, advert_tx, metrics.clone(), shutdown_rx));

    let intake = collection.clone();
    let pump = tokio::spawn(async move {
        let mut admitted = 0;
        while let Some(advert) = advert_rx.recv().await {
            if intake.seen(&advert) {
                admitted += 1;
            }
            if admitted == 1 {
                break;
            }
        }
        admitted
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"{\"mac\":\"aa:bb:cc:dd:ee:01\",\"rssi\":-58,\"name\":\"Watch\"}\n").await.unwrap();
    client.shutdown().await.unwrap();

    let admitted = tokio::time::timeout(Duration::from_secs(5), pump).await.unwrap().unwrap();
    assert_eq!(admitted, 1);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    match event {
        PresenceEvent::Lifecycle { kind, fingerprint, .. } => {
            assert_eq!(kind, LifecycleKind::Add);
            assert_eq!(fingerprint.id, "aabbccddee01");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(collection.len(), 1);
    assert_eq!(metrics.admitted_total(), 1);

    shutdown_tx.send(true).unwrap();
    server.await.unwrap();
}

#[test]
fn test_control_topics_drive_collection() {
    let (sender, mut rx) = create_event_channel(8);
    let collection = FingerprintCollection::new(Tunables::default()).with_listener(Arc::new(sender));
    let topics = ControlTopics::new("espresense", "lab");

    let enabled = topics.parse("espresense/rooms/lab/enabled/set").unwrap();
    assert!(apply_control(&collection, &enabled, "OFF"));
    assert!(matches!(rx.try_recv().unwrap(), PresenceEvent::Admission { enabled: false, .. }));

    let adv = Advertisement::new("aa:bb:cc:dd:ee:02".parse().unwrap(), -60);
    assert!(!collection.seen_at(&adv, 0));
    assert!(collection.is_empty());

    assert!(apply_control(&collection, &enabled, "ON"));
    assert!(collection.seen_at(&adv, 1_000));

    let max_distance = topics.parse("espresense/rooms/lab/max_distance/set").unwrap();
    assert!(apply_control(&collection, &max_distance, "4.5"));
    assert_eq!(collection.tunables().max_distance, 4.5);

    let settings = topics.parse("espresense/settings/aabbccddee02/config").unwrap();
    assert!(apply_control(&collection, &settings, r#"{"alias":"lab-tag"}"#));
    assert_eq!(collection.find_device_config("aabbccddee02").unwrap().alias, "lab-tag");
}
