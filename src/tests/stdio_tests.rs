use serde_json::{ Value, json };
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::{ RESOURCES, SleepSignals, calculator };
use crate::client::{ Client, StdioClientTransport };
use crate::errors::Error;
use crate::messages::RequestId;
use crate::server::Server;
use crate::transport::StdioTransport;

async fn connected(signals: Arc<SleepSignals>) -> (Server, Client<StdioClientTransport>) {
    let (client_out, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, client_in) = tokio::io::duplex(64 * 1024);
    let mut server = calculator(signals).build().await.unwrap();
    server.start(StdioTransport::with_io(server_in, server_out)).await.unwrap();

    let client = Client::builder(StdioClientTransport::new(client_in, client_out))
        .with_request_timeout(Duration::from_millis(500))
        .build();
    client.connect().await.unwrap();
    (server, client)
}

#[tokio::test]
async fn echo_round_trip() {
    let (mut server, client) = connected(Arc::default()).await;
    let info = client.server_info().await.unwrap();
    assert_eq!(info.server_info.name, "calculator");
    assert!(info.session_id.is_some());

    let tools = client.list_tools().await.unwrap();
    assert!(tools.tools.iter().any(|t| t.name == "echo"));

    let result = client.call_tool("echo", json!({"message": "hello"})).await.unwrap();
    assert_eq!(result, json!({"message": "hello"}));

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn handler_errors_keep_code_and_message() {
    let (mut server, client) = connected(Arc::default()).await;
    match client.call_tool("teapot", Value::Null).await {
        Err(Error::Rpc(data)) => assert_eq!((data.code, data.message.as_str()), (418, "teapot")),
        other => panic!("unexpected {:?}", other),
    }
    let err = client.call_tool("divide", json!({"a": 1, "b": 0})).await.unwrap_err();
    assert_eq!((err.code(), err.message()), (400, "Division by zero".to_string()));
    server.shutdown().await;
}

#[tokio::test]
async fn cancel_reaches_the_running_handler() {
    let signals = Arc::new(SleepSignals::default());
    let (mut server, client) = connected(signals.clone()).await;
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

    // A cancelled request is never answered
    assert!(matches!(call.await.unwrap(), Err(Error::Timeout(_))));

    // Giving up on it frees the id for the next call
    let pong: Value = client.request_with_id(id, "ping", None).await.unwrap();
    assert_eq!(pong, json!({}));
    server.shutdown().await;
}

#[tokio::test]
async fn progress_arrives_as_notifications() {
    let (mut server, client) = connected(Arc::default()).await;
    let mut notifications = client.transport().take_notifications().unwrap();

    let result = client.call_tool("work", Value::Null).await.unwrap();
    assert_eq!(result, json!({"done": true}));

    let mut states = Vec::new();
    while let Ok(Some(notification)) = timeout(Duration::from_secs(1), notifications.recv()).await {
        assert_eq!(notification.method.as_deref(), Some("progress"));
        let params = notification.params.unwrap();
        let state = params["progress"]["state"].as_str().unwrap().to_string();
        let done = state == "completed";
        states.push(state);
        if done {
            break;
        }
    }
    assert_eq!(states.first().map(String::as_str), Some("started"));
    assert_eq!(states.last().map(String::as_str), Some("completed"));
    server.shutdown().await;
}

#[tokio::test]
async fn resources_travel_as_chunks() {
    let (mut server, client) = connected(Arc::default()).await;
    for (uri, mime_type, bytes) in RESOURCES {
        let content = client.read_resource(uri).await.unwrap();
        assert_eq!((content.uri.as_str(), content.mime_type.as_str()), (uri, mime_type));
        assert_eq!(&content.bytes[..], bytes);
    }
    assert_eq!(client.read_resource("mem://missing").await.unwrap_err().code(), 404);
    server.shutdown().await;
}
