use futures::StreamExt;
use serde_json::{ Value, json };
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::{ SleepSignals, calculator };
use crate::client::{ Client, SseClient, SseClientTransport, SseMessage };
use crate::errors::Error;
use crate::event_store::InMemoryEventStore;
use crate::messages::RequestId;
use crate::server::Server;
use crate::transport::{ SseServerOptions, SseServerTransport, Transport };

async fn serve(options: SseServerOptions) -> (Server, SseServerTransport, String) {
    serve_with(Arc::default(), options).await
}

async fn serve_with(
    signals: Arc<SleepSignals>,
    options: SseServerOptions
) -> (Server, SseServerTransport, String) {
    let server = calculator(signals).build().await.unwrap();
    let mut transport = SseServerTransport::new(SseServerOptions {
        bind_address: "127.0.0.1:0".to_string(),
        ..options
    });
    transport.start(server.dispatcher()).await.unwrap();
    let base = format!("http://{}", transport.local_addr().unwrap());
    (server, transport, base)
}

fn with_store() -> SseServerOptions {
    SseServerOptions {
        event_store: Some(Arc::new(InMemoryEventStore::new())),
        ..Default::default()
    }
}

async fn next_event(events: &mut crate::client::transport::sse::SseStream) -> SseMessage {
    timeout(Duration::from_secs(5), events.next()).await.unwrap().unwrap().unwrap()
}

#[tokio::test]
async fn resume_replays_only_later_events() {
    let (_server, mut transport, base) = serve(with_store()).await;
    let client = SseClient::new(&base).unwrap();

    let mut ids = Vec::new();
    for n in 1..=3 {
        let reply = client.publish("update", &json!({"n": n})).await.unwrap();
        ids.push(reply["id"].as_str().unwrap().to_string());
    }

    let mut subscription = client.subscribe(Some(&ids[0])).await.unwrap();
    assert!(subscription.session_id.is_some());
    let second = next_event(&mut subscription.events).await;
    let third = next_event(&mut subscription.events).await;
    assert_eq!(second.id.as_deref(), Some(ids[1].as_str()));
    assert_eq!(third.id.as_deref(), Some(ids[2].as_str()));
    assert_eq!(second.event, "update");
    assert_eq!(second.json::<Value>().unwrap(), json!({"n": 2}));

    // Live events follow the replay
    client.publish("update", &json!({"n": 4})).await.unwrap();
    let live = next_event(&mut subscription.events).await;
    assert_eq!(live.json::<Value>().unwrap(), json!({"n": 4}));

    assert_eq!(client.close_all().await.unwrap(), 1);
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn publishing_with_a_session_requires_a_live_stream() {
    let (_server, mut transport, base) = serve(SseServerOptions {
        require_session: true,
        ..with_store()
    }).await;

    let anonymous = SseClient::new(&base).unwrap();
    assert_eq!(anonymous.publish("update", &json!(1)).await.unwrap_err().code(), 401);

    let subscription = anonymous.subscribe(None).await.unwrap();
    let owner = SseClient::new(&base).unwrap().with_session(subscription.session_id.unwrap());
    assert!(owner.publish("update", &json!(1)).await.is_ok());

    let stranger = SseClient::new(&base).unwrap().with_session("gone");
    assert_eq!(stranger.publish("update", &json!(1)).await.unwrap_err().code(), 404);
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn mcp_requests_over_sse() {
    let (_server, mut transport, base) = serve(SseServerOptions::default()).await;
    let client = Client::new(SseClientTransport::connect(&base).await.unwrap());
    assert_eq!(transport.connection_count(), 1);

    client.connect().await.unwrap();
    let result = client.call_tool("add", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(result, json!({"result": 5}));

    let err = client.call_tool("teapot", Value::Null).await.unwrap_err();
    assert_eq!((err.code(), err.message()), (418, "teapot".to_string()));

    client.close().await.unwrap();
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn cancelled_requests_free_their_id() {
    let signals = Arc::new(SleepSignals::default());
    let (_server, mut transport, base) = serve_with(signals.clone(), SseServerOptions::default()).await;
    let client = Client::builder(SseClientTransport::connect(&base).await.unwrap())
        .with_request_timeout(Duration::from_millis(500))
        .build();
    client.connect().await.unwrap();
    let client = Arc::new(client);

    let id = RequestId::from("sleep-1");
    let call = {
        let (client, id) = (client.clone(), id.clone());
        tokio::spawn(async move {
            client.request_with_id(id, "callTool", Some(json!({"name": "sleep"}))).await
        })
    };
    timeout(Duration::from_secs(5), signals.started.notified()).await.unwrap();
    client.cancel(&id).await.unwrap();
    timeout(Duration::from_secs(5), signals.cancelled.notified()).await.unwrap();
    assert!(matches!(call.await.unwrap(), Err(Error::Timeout(_))));

    let pong = client.request_with_id(id, "ping", None).await.unwrap();
    assert_eq!(pong, json!({}));
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn broadcasts_stay_off_mcp_streams() {
    let (_server, mut transport, base) = serve(with_store()).await;
    let client = Client::new(SseClientTransport::connect(&base).await.unwrap());
    let mut events = client.transport().take_events().unwrap();
    client.connect().await.unwrap();

    transport.publish("news", &json!("extra")).await.unwrap();
    let result = client.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap();
    assert_eq!(result, json!({"result": 2}));
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());

    // Closing the broadcast streams leaves MCP connections open
    assert_eq!(SseClient::new(&base).unwrap().close_all().await.unwrap(), 0);
    client.ping().await.unwrap();
    transport.stop().await.unwrap();
}
