//! End-to-end tests: a real server and client talking over each transport

mod http_tests;
mod sse_tests;
mod stdio_tests;

use serde::Deserialize;
use serde_json::{ Value, json };
use std::sync::Arc;
use tokio::sync::Notify;

use crate::errors::Error;
use crate::server::context::RequestContext;
use crate::server::services::resources::MemoryResource;
use crate::server::services::tools::ToolDefinition;
use crate::server::{ Server, ServerBuilder };
use crate::types::{ Resource, Tool };

#[derive(Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

/// Signals raised by the `sleep` tool
#[derive(Default)]
pub(crate) struct SleepSignals {
    pub(crate) started: Notify,
    pub(crate) cancelled: Notify,
}

/// Resources the calculator serves: uri, MIME type, bytes
pub(crate) const RESOURCES: [(&str, &str, &[u8]); 3] = [
    ("mem://readme", "text/plain", b"hello"),
    ("mem://cfg", "application/json", br#"{"a":1}"#),
    ("mem://logo", "image/png", &[0x89, b'P', b'N', b'G', 0x00, 0xff]),
];

/// Route log output through the test harness
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A calculator with a few misbehaving tools
pub(crate) fn calculator(signals: Arc<SleepSignals>) -> ServerBuilder {
    init_tracing();
    let mut builder = Server::builder();
    for (uri, mime_type, bytes) in RESOURCES {
        builder = builder.register_resource(
            Resource::new(uri, uri),
            MemoryResource::new(bytes).with_mime_type(mime_type)
        );
    }
    builder
        .with_server_name("calculator")
        .register_tool(
            ToolDefinition::typed(Tool::new("add"), |_ctx, args: Operands| async move {
                Ok(json!({ "result": args.a + args.b }))
            })
        )
        .register_tool(
            ToolDefinition::typed(Tool::new("divide"), |_ctx, args: Operands| async move {
                if args.b == 0 {
                    return Err(Error::InvalidParams("Division by zero".to_string()));
                }
                Ok(json!({ "result": args.a / args.b }))
            })
        )
        .register_tool(
            ToolDefinition::from_fn(Tool::new("echo"), |_ctx, args| async move { Ok(args) })
        )
        .register_tool(
            ToolDefinition::from_fn(Tool::new("teapot"), |_ctx, _args| async move {
                Err::<Value, _>(Error::rpc(418, "teapot"))
            })
        )
        .register_tool(
            ToolDefinition::from_fn(Tool::new("sleep"), move |ctx: RequestContext, _args| {
                let signals = signals.clone();
                async move {
                    signals.started.notify_one();
                    ctx.cancelled().await;
                    signals.cancelled.notify_one();
                    Ok(json!("late"))
                }
            })
        )
        .register_tool(
            ToolDefinition::from_fn(Tool::new("work"), |ctx: RequestContext, _args| async move {
                let progress = ctx.progress("working")?;
                progress.update(50.0, "half way")?;
                progress.complete("done")?;
                Ok::<_, Error>(json!({ "done": true }))
            })
        )
}
