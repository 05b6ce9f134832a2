use std::time::Duration;

use futures::SinkExt;
use taxi_hub::{serve, HubConfig};
use taxi_sim::{
    ConnectionManager, FeedBatch, GeoPoint, Route, SessionOutcome, SessionStatus, WsConnector,
};
use tokio::{net::TcpListener, select, time::timeout};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(20);

async fn start_hub() -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let config = HubConfig {
        broadcast_interval: Duration::from_millis(50),
        client_buffer: 16,
        read_period: Duration::from_millis(1),
        read_burst: 64,
    };
    tokio::spawn(serve(listener, config, shutdown.clone()));
    (format!("ws://{addr}"), shutdown)
}

fn manager(url: &str) -> ConnectionManager<WsConnector> {
    ConnectionManager::new(WsConnector::new(url, 16), TICK)
}

fn straight_route(points: usize) -> Route {
    (0..points)
        .map(|i| GeoPoint::new(51.5 + i as f64 * 0.001, -0.12))
        .collect()
}

async fn raw_connect(
    url: &str,
    query: &str,
    protocol: &'static str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Error,
> {
    let mut request = format!("{url}/subscribe?{query}").into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

#[tokio::test]
async fn client_follows_a_taxi_along_its_route() {
    let (url, shutdown) = start_hub().await;
    let manager = manager(&url);

    let client = manager
        .open_consumer(Some("watcher".into()), GeoPoint::new(51.5, -0.12))
        .await
        .unwrap();
    let mut feed = client.feed().unwrap();

    let taxi = manager
        .open_producer(Some("cab-1".into()), straight_route(40))
        .await
        .unwrap();

    timeout(WAIT, feed.wait_for(|batch: &FeedBatch| batch.get("cab-1").is_some()))
        .await
        .unwrap()
        .unwrap();

    let outcome = timeout(WAIT, taxi.join()).await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::Finished { sent: 40 });

    // The hub drops the taxi once its connection closes.
    timeout(WAIT, feed.wait_for(|batch: &FeedBatch| batch.get("cab-1").is_none()))
        .await
        .unwrap()
        .unwrap();

    client.close();
    let outcome = timeout(WAIT, client.join()).await.unwrap().unwrap();
    assert_eq!(outcome, SessionOutcome::ClosedLocally);
    assert!(manager.active().is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn hub_refuses_a_second_taxi_with_the_same_id() {
    let (url, shutdown) = start_hub().await;
    let first = manager(&url)
        .open_producer(Some("dup".into()), straight_route(500))
        .await
        .unwrap();
    let second = manager(&url)
        .open_producer(Some("dup".into()), straight_route(500))
        .await
        .unwrap();

    let mut first_status = first.status_changes();
    let mut second_status = second.status_changes();
    let closed = |status: &SessionStatus| *status == SessionStatus::Closed;
    let (refused, kept) = timeout(WAIT, async {
        select! {
            _ = first_status.wait_for(closed) => (first, second),
            _ = second_status.wait_for(closed) => (second, first),
        }
    })
    .await
    .unwrap();

    match refused.join().await.unwrap() {
        SessionOutcome::ClosedRemotely(reason) => assert!(!reason.is_clean(), "{reason:?}"),
        other => panic!("unexpected outcome {other:?}"),
    }

    kept.close();
    assert_eq!(kept.join().await.unwrap(), SessionOutcome::ClosedLocally);
    shutdown.cancel();
}

#[tokio::test]
async fn hub_drops_malformed_positions_and_accepts_bare_role_names() {
    let (url, shutdown) = start_hub().await;
    let manager = manager(&url);
    let client = manager
        .open_consumer(None, GeoPoint::new(0.0, 0.0))
        .await
        .unwrap();
    let mut feed = client.feed().unwrap();

    let mut taxi = raw_connect(&url, "id=raw&lat=1&lon=2&head=0", "taxi")
        .await
        .unwrap();
    taxi.send(Message::Text("garbage".into())).await.unwrap();
    taxi.send(Message::Text("pos#10.5,20.25,90".into()))
        .await
        .unwrap();

    let batch = timeout(
        WAIT,
        feed.wait_for(|batch: &FeedBatch| {
            batch
                .get("raw")
                .is_some_and(|record| record.latitude == 10.5)
        }),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(batch.get("raw").unwrap().longitude, 20.25);

    taxi.close(None).await.unwrap();
    client.close();
    client.join().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn hub_rejects_bad_handshakes() {
    let (url, shutdown) = start_hub().await;

    let unknown_role = raw_connect(&url, "id=a&lat=1&lon=2", "map-admin").await;
    assert!(unknown_role.is_err());

    let missing_id = raw_connect(&url, "lat=1&lon=2", "map-client").await;
    assert!(missing_id.is_err());

    let bad_id = raw_connect(&url, "id=a$b&lat=1&lon=2", "map-taxi").await;
    assert!(bad_id.is_err());

    let ok = raw_connect(&url, "id=fine&lat=1&lon=2", "map-client").await;
    assert!(ok.is_ok());

    shutdown.cancel();
}
