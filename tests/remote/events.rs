//! Event hubs and subscribers.

use std::sync::Arc;
use std::time::Duration;

use remote_messaging::{
    serve, serve_with_shutdown, HandlerError, HandlerServer, HubMode, RemoteClient, RemoteOptions,
    ServerOptions, SubscriptionState,
};
use tokio::sync::{mpsc, oneshot};

use crate::support::{
    fast_options, free_address, patient_options, recv, start_server, wait_stopped,
    wait_streaming, SomethingHappened,
};

fn hub_server(mode: HubMode) -> Arc<HandlerServer> {
    Arc::new(
        HandlerServer::with_options(
            ServerOptions::default().with_hub_retry(
                3,
                Duration::from_millis(10),
                Duration::from_millis(50),
            ),
        )
        .register_event_hub_with::<SomethingHappened>(mode),
    )
}

/// A subscribed client forwarding every event to a channel.
async fn subscriber(address: &str) -> (RemoteClient, mpsc::UnboundedReceiver<SomethingHappened>) {
    subscriber_with(address, fast_options()).await
}

async fn subscriber_with(
    address: &str,
    options: RemoteOptions,
) -> (RemoteClient, mpsc::UnboundedReceiver<SomethingHappened>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client = RemoteClient::new();
    client
        .map_remote(address, options)
        .unwrap()
        .subscribe::<SomethingHappened, _>(move |event: SomethingHappened| {
            let tx = tx.clone();
            async move {
                tx.send(event).map_err(HandlerError::other)?;
                Ok::<(), HandlerError>(())
            }
        });
    wait_streaming::<SomethingHappened>(&client, address).await;
    (client, rx)
}

fn event(id: u64, description: &str) -> SomethingHappened {
    SomethingHappened {
        id,
        description: description.into(),
    }
}

async fn wait_for_subscribers(server: &HandlerServer, count: usize) {
    let hub = server.hub("something.happened").unwrap();
    for _ in 0..200 {
        if hub.subscribers().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub never reached {count} subscribers");
}

#[tokio::test]
async fn something_happened_is_delivered_exactly_once() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;
    let (_client, mut rx) = subscriber(&address).await;

    assert_eq!(server.broadcast(&event(7, "x")).unwrap(), 1);

    let received = recv(&mut rx).await;
    assert_eq!(received, event(7, "x"));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "event delivered more than once"
    );
}

#[tokio::test]
async fn events_arrive_in_broadcast_order() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;
    let (_client, mut rx) = subscriber(&address).await;

    for (id, name) in [(1, "e1"), (2, "e2"), (3, "e3")] {
        server.broadcast(&event(id, name)).unwrap();
    }

    assert_eq!(recv(&mut rx).await.description, "e1");
    assert_eq!(recv(&mut rx).await.description, "e2");
    assert_eq!(recv(&mut rx).await.description, "e3");
}

#[tokio::test]
async fn broadcast_without_subscribers_is_dropped() {
    let server = hub_server(HubMode::FanOut);
    start_server(Arc::clone(&server)).await;

    assert_eq!(server.broadcast(&event(1, "nobody listens")).unwrap(), 0);
}

#[tokio::test]
async fn every_local_handler_runs_and_failures_stay_isolated() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = RemoteClient::new();
    client
        .map_remote(&address, fast_options())
        .unwrap()
        .subscribe::<SomethingHappened, _>(|event: SomethingHappened| async move {
            Err::<(), _>(HandlerError::Rejected(format!("event {} refused", event.id)))
        })
        .subscribe::<SomethingHappened, _>(|event: SomethingHappened| async move {
            assert_ne!(event.id, 1, "handler bug");
            Ok::<(), HandlerError>(())
        })
        .subscribe::<SomethingHappened, _>(move |event: SomethingHappened| {
            let tx = tx.clone();
            async move {
                tx.send(event.id).map_err(HandlerError::other)?;
                Ok::<(), HandlerError>(())
            }
        });
    wait_streaming::<SomethingHappened>(&client, &address).await;

    // one stream per event type and remote, shared by the three handlers
    wait_for_subscribers(&server, 1).await;

    server.broadcast(&event(1, "first")).unwrap();
    server.broadcast(&event(2, "second")).unwrap();

    assert_eq!(recv(&mut rx).await, 1);
    assert_eq!(recv(&mut rx).await, 2);
    assert_eq!(
        client.subscription_state::<SomethingHappened>(&address),
        Some(SubscriptionState::Streaming)
    );
}

#[tokio::test]
async fn a_gone_subscriber_does_not_affect_the_others() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;
    let (leaving, _leaving_rx) = subscriber(&address).await;
    let (staying, mut rx) = subscriber(&address).await;
    wait_for_subscribers(&server, 2).await;

    leaving.shutdown();
    assert_eq!(
        leaving.subscription_state::<SomethingHappened>(&address),
        None
    );

    for id in 1..=3 {
        server.broadcast(&event(id, "after")).unwrap();
    }
    for id in 1..=3 {
        assert_eq!(recv(&mut rx).await.id, id);
    }

    // the gone subscriber is dropped once a delivery exhausts its retries
    let hub = server.hub("something.happened").unwrap();
    for id in 4..200 {
        if hub.subscribers().len() == 1 {
            break;
        }
        server.broadcast(&event(id, "later")).unwrap();
        assert_eq!(recv(&mut rx).await.id, id);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.subscribers(), vec![staying.subscriber_id().to_string()]);
}

#[tokio::test]
async fn round_robin_delivers_each_event_to_one_subscriber() {
    let server = hub_server(HubMode::RoundRobin);
    let address = start_server(Arc::clone(&server)).await;
    let (_a, mut rx_a) = subscriber(&address).await;
    let (_b, mut rx_b) = subscriber(&address).await;
    wait_for_subscribers(&server, 2).await;

    for id in 1..=4 {
        assert_eq!(server.broadcast(&event(id, "rr")).unwrap(), 1);
    }

    let mut ids = Vec::new();
    for _ in 0..2 {
        ids.push(recv(&mut rx_a).await.id);
        ids.push(recv(&mut rx_b).await.id);
    }
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn restarted_hub_has_lost_queued_events() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;
    let (_client, mut rx) = subscriber(&address).await;

    server.broadcast(&event(1, "before restart")).unwrap();
    assert_eq!(recv(&mut rx).await.id, 1);

    // a fresh process on another port knows nothing of the old queues
    let restarted = hub_server(HubMode::FanOut);
    start_server(Arc::clone(&restarted)).await;
    let hub = restarted.hub("something.happened").unwrap();
    assert!(hub.subscribers().is_empty());
    assert_eq!(restarted.broadcast(&event(2, "after restart")).unwrap(), 0);
}

#[tokio::test]
async fn subscribing_to_a_missing_hub_ends_disconnected() {
    let address = start_server(Arc::new(HandlerServer::new())).await;
    let client = RemoteClient::new();
    client
        .map_remote(&address, fast_options())
        .unwrap()
        .subscribe::<SomethingHappened, _>(|_event: SomethingHappened| async move {
            Ok::<(), HandlerError>(())
        });

    let seen = wait_stopped::<SomethingHappened>(&client, &address).await;
    assert_eq!(seen.last(), Some(&SubscriptionState::Disconnected));
    assert!(!seen.contains(&SubscriptionState::Streaming));
    assert_eq!(
        client.subscription_state::<SomethingHappened>(&address),
        Some(SubscriptionState::Disconnected)
    );
}

#[tokio::test]
async fn server_shutdown_disconnects_subscribers() {
    let server = hub_server(HubMode::FanOut);
    let address = start_server(Arc::clone(&server)).await;
    let (client, _rx) = subscriber(&address).await;
    let mut state = client
        .watch_subscription::<SomethingHappened>(&address)
        .unwrap();

    server.shutdown();

    // the stream ends and reconnect attempts are refused
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s != SubscriptionState::Streaming),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(server.broadcast(&event(1, "late")).unwrap(), 0);
}

#[tokio::test]
async fn subscriber_recovers_when_the_hub_comes_back() {
    let address = free_address().await;

    let first = hub_server(HubMode::FanOut);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = {
        let server = Arc::clone(&first);
        let address = address.clone();
        tokio::spawn(async move {
            serve_with_shutdown(server, &address, async move {
                let _ = stop_rx.await;
            })
            .await
        })
    };

    let (client, mut rx) = subscriber_with(&address, patient_options()).await;
    first.broadcast(&event(1, "before restart")).unwrap();
    assert_eq!(recv(&mut rx).await.id, 1);

    let mut state = client
        .watch_subscription::<SomethingHappened>(&address)
        .unwrap();
    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // the hub is gone: the subscriber keeps trying
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SubscriptionState::Connecting),
    )
    .await
    .unwrap()
    .unwrap();

    let second = hub_server(HubMode::FanOut);
    {
        let server = Arc::clone(&second);
        let address = address.clone();
        tokio::spawn(async move { serve(server, &address).await });
    }

    wait_streaming::<SomethingHappened>(&client, &address).await;
    wait_for_subscribers(&second, 1).await;
    assert_eq!(second.broadcast(&event(2, "after restart")).unwrap(), 1);
    assert_eq!(recv(&mut rx).await.id, 2);
    assert_eq!(
        second.hub("something.happened").unwrap().subscribers(),
        vec![client.subscriber_id().to_string()]
    );
}
