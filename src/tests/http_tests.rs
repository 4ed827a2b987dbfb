use serde_json::{ Value, json };
use std::sync::Arc;

use super::{ RESOURCES, calculator };
use crate::client::{ Client, HttpClientOptions, HttpClientTransport, HttpStyle };
use crate::errors::Error;
use crate::server::Server;
use crate::transport::{ HttpServerOptions, HttpTransport, Transport };

async fn serve(options: HttpServerOptions) -> (Server, HttpTransport, String) {
    let server = calculator(Arc::default()).build().await.unwrap();
    let mut transport = HttpTransport::new(HttpServerOptions {
        bind_address: "127.0.0.1:0".to_string(),
        ..options
    });
    transport.start(server.dispatcher()).await.unwrap();
    let base = format!("http://{}", transport.local_addr().unwrap());
    (server, transport, base)
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client
        ::new()
        .post(format!("{}/{}", base, path))
        .json(&body)
        .send().await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn calculator_over_path_per_method() {
    let (_server, mut transport, base) = serve(HttpServerOptions::default()).await;

    let (status, body) = post(&base, "callTool", json!({"name": "add", "args": {"a": 2, "b": 3}})).await;
    assert_eq!((status, body), (200, json!({"result": {"result": 5}})));

    let (status, body) = post(&base, "callTool", json!({"name": "divide", "args": {"a": 1, "b": 0}})).await;
    assert_eq!((status, body), (400, json!({"error": {"code": 400, "message": "Division by zero"}})));

    let (status, body) = post(&base, "callTool", json!({"name": "teapot"})).await;
    assert_eq!((status, body), (418, json!({"error": {"code": 418, "message": "teapot"}})));

    let (status, _) = post(&base, "noSuchMethod", json!({})).await;
    assert_eq!(status, 404);

    transport.stop().await.unwrap();
}

#[tokio::test]
async fn client_keeps_the_session_from_initialize() {
    let (_server, mut transport, base) = serve(HttpServerOptions::default()).await;
    let client = Client::new(HttpClientTransport::new(&base).unwrap());

    client.connect().await.unwrap();
    let session_id = client.transport().session_id().unwrap();
    assert_eq!(client.server_info().await.unwrap().session_id, Some(session_id));

    let result = client.call_tool("add", json!({"a": 40, "b": 2})).await.unwrap();
    assert_eq!(result, json!({"result": 42}));
    match client.call_tool("teapot", Value::Null).await {
        Err(Error::Rpc(data)) => assert_eq!((data.code, data.message.as_str()), (418, "teapot")),
        other => panic!("unexpected {:?}", other),
    }

    client.close().await.unwrap();
    assert!(client.transport().session_id().is_none());
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn sessions_can_be_required() {
    let (_server, mut transport, base) = serve(HttpServerOptions {
        require_session: true,
        ..Default::default()
    }).await;
    let options = HttpClientOptions { style: HttpStyle::PathPerMethod, ..Default::default() };
    let client = Client::new(HttpClientTransport::with_options(&base, options).unwrap());

    let err = client.list_tools().await.unwrap_err();
    assert_eq!(err.code(), 400);

    client.connect().await.unwrap();
    let tools = client.list_tools().await.unwrap();
    assert!(tools.tools.iter().any(|t| t.name == "add"));
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_sessions_are_expired() {
    let (_server, mut transport, base) = serve(HttpServerOptions::default()).await;
    let response = reqwest::Client
        ::new()
        .post(format!("{}/ping", base))
        .header(crate::protocol::SESSION_ID_HEADER, "no-such-session")
        .send().await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn health_and_wrong_verbs() {
    let (_server, mut transport, base) = serve(HttpServerOptions::default()).await;
    let http = reqwest::Client::new();

    let health = http.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status().as_u16(), 200);

    let wrong = http.get(format!("{}/mcp", base)).send().await.unwrap();
    assert_eq!(wrong.status().as_u16(), 405);
    transport.stop().await.unwrap();
}

#[tokio::test]
async fn resources_keep_their_bytes_and_mime_type() {
    let (_server, mut transport, base) = serve(HttpServerOptions::default()).await;
    let client = Client::new(HttpClientTransport::new(&base).unwrap());
    client.connect().await.unwrap();

    for (uri, mime_type, bytes) in RESOURCES {
        let content = client.read_resource(uri).await.unwrap();
        assert_eq!(content.uri, uri);
        assert_eq!(content.mime_type, mime_type);
        assert_eq!(&content.bytes[..], bytes);
    }

    let missing = client.read_resource("mem://missing").await.unwrap_err();
    assert_eq!(missing.code(), 404);
    transport.stop().await.unwrap();
}
