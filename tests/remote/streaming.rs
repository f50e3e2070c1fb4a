//! Client- and server-streaming commands.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use remote_messaging::{
    CallContext, CallOptions, ClientStreamItem, CodecError, HandlerError, HandlerServer,
    ItemStream, RemoteClient, RemoteError,
};
use serde::{Deserialize, Serialize, Serializer};

use crate::support::{fast_options, start_server, ListOrders, Reading, ReadingSummary};

fn streaming_server() -> Arc<HandlerServer> {
    Arc::new(
        HandlerServer::new()
            .register_server_stream::<ListOrders, _>(|cmd: ListOrders, _ctx: CallContext| {
                stream::iter(1..=cmd.count).map(move |id| match cmd.fail_after {
                    Some(limit) if id > limit => {
                        Err(HandlerError::NotFound(format!("order {id}")))
                    }
                    _ => Ok(id),
                })
            })
            .register_client_stream::<Reading, _>(
                |readings: ItemStream<Reading>, _ctx: CallContext| async move {
                    let readings: Vec<Reading> = readings
                        .collect::<Vec<_>>()
                        .await
                        .into_iter()
                        .collect::<Result<_, _>>()?;
                    Ok::<_, HandlerError>(ReadingSummary {
                        count: readings.len(),
                        total: readings.iter().map(|r| r.value).sum(),
                    })
                },
            ),
    )
}

async fn connected_client() -> RemoteClient {
    let address = start_server(streaming_server()).await;
    let client = RemoteClient::new();
    client
        .map_remote(&address, fast_options())
        .unwrap()
        .register_server_stream::<ListOrders>()
        .register_client_stream::<Reading>();
    client
}

#[tokio::test]
async fn server_stream_delivers_items_in_order() {
    let client = connected_client().await;

    let items: Vec<u64> = client
        .execute_server_stream(
            &ListOrders {
                count: 5,
                fail_after: None,
            },
            CallOptions::new(),
        )
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(items, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn server_stream_ends_at_the_first_handler_error() {
    let client = connected_client().await;

    let items: Vec<Result<u64, RemoteError>> = client
        .execute_server_stream(
            &ListOrders {
                count: 5,
                fail_after: Some(2),
            },
            CallOptions::new(),
        )
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert_eq!(*items[0].as_ref().unwrap(), 1);
    assert_eq!(*items[1].as_ref().unwrap(), 2);
    assert!(matches!(
        &items[2],
        Err(RemoteError::RemoteExecution { category, .. }) if category == "not_found"
    ));
}

#[tokio::test]
async fn dropping_a_server_stream_early_is_fine() {
    let client = connected_client().await;

    let mut items = client
        .execute_server_stream(
            &ListOrders {
                count: u64::MAX,
                fail_after: None,
            },
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(items.next().await.unwrap().unwrap(), 1);
    assert_eq!(items.next().await.unwrap().unwrap(), 2);
    drop(items);

    // the connection is still usable
    let again: Vec<_> = client
        .execute_server_stream(
            &ListOrders {
                count: 1,
                fail_after: None,
            },
            CallOptions::new(),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn client_stream_result_arrives_after_input_closes() {
    let client = connected_client().await;

    let readings = stream::iter(vec![
        Reading {
            sensor: "t1".into(),
            value: 20,
        },
        Reading {
            sensor: "t1".into(),
            value: 22,
        },
        Reading {
            sensor: "t2".into(),
            value: -2,
        },
    ]);

    let summary = client
        .execute_client_stream::<Reading, _>(readings, CallOptions::new())
        .await
        .unwrap();
    assert_eq!(
        summary,
        ReadingSummary {
            count: 3,
            total: 40
        }
    );
}

#[tokio::test]
async fn empty_client_stream_still_gets_a_result() {
    let client = connected_client().await;

    let summary = client
        .execute_client_stream::<Reading, _>(stream::empty(), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(summary, ReadingSummary { count: 0, total: 0 });
}

#[tokio::test]
async fn unbound_streaming_commands_are_unregistered() {
    let client = RemoteClient::new();

    let err = client
        .execute_server_stream(
            &ListOrders {
                count: 1,
                fail_after: None,
            },
            CallOptions::new(),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RemoteError::UnregisteredCommand(ref name) if name == "orders.list"));

    let err = client
        .execute_client_stream::<Reading, _>(stream::empty(), CallOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::UnregisteredCommand(ref name) if name == "sensors.readings"));
}

/// Upload chunk whose serializer refuses chunk 0.
#[derive(Debug, Clone, Deserialize)]
struct Chunk(u32);

impl Serialize for Chunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 == 0 {
            return Err(serde::ser::Error::custom("chunk 0 is corrupt"));
        }
        serializer.serialize_newtype_struct("Chunk", &self.0)
    }
}

impl ClientStreamItem for Chunk {
    type Result = usize;
    const NAME: &'static str = "uploads.chunks";
}

#[tokio::test]
async fn unencodable_item_aborts_the_upload() {
    let completed = Arc::new(AtomicUsize::new(0));
    let server = {
        let completed = Arc::clone(&completed);
        Arc::new(HandlerServer::new().register_client_stream::<Chunk, _>(
            move |chunks: ItemStream<Chunk>, _ctx: CallContext| {
                let completed = Arc::clone(&completed);
                async move {
                    let chunks: Vec<Chunk> = chunks
                        .collect::<Vec<_>>()
                        .await
                        .into_iter()
                        .collect::<Result<_, _>>()?;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(chunks.len())
                }
            },
        ))
    };
    let address = start_server(server).await;
    let client = RemoteClient::new();
    client
        .map_remote(&address, fast_options())
        .unwrap()
        .register_client_stream::<Chunk>();

    let err = client
        .execute_client_stream::<Chunk, _>(
            stream::iter(vec![Chunk(1), Chunk(0), Chunk(2)]),
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Codec(CodecError::Encode(ref message)) if message.contains("chunk 0 is corrupt")
    ));

    // the handler never saw the truncated input as complete
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    let sent = client
        .execute_client_stream::<Chunk, _>(
            stream::iter(vec![Chunk(1), Chunk(2)]),
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(sent, 2);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}
