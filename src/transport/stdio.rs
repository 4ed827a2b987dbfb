//! STDIO Transport
//!
//! This module implements the stdio transport: one JSON envelope per line in
//! both directions. It is the transport of local subprocess servers. A single
//! writer task owns the output stream, so replies from concurrent handlers
//! never interleave. End of input shuts the connection down cleanly.

use async_trait::async_trait;
use bytes::BytesMut;
use serde::{ Deserialize, Serialize };
use std::sync::{ Arc, Mutex };
use tokio::io::{ AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stdin, Stdout };
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{ Decoder, LinesCodec, LinesCodecError };
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::errors::Error;
use crate::messages::{ Envelope, RequestId };
use crate::server::dispatcher::{ Dispatcher, Reply };
use crate::stream::StreamChunk;
use crate::transport::connection::Connection;
use crate::transport::{ ResponseWriter, Transport };

/// Default upper bound of one input line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Options for the stdio transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioOptions {
    /// Longest accepted input line in bytes; longer lines are answered with 413
    pub max_line_length: usize,
}

impl Default for StdioOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// A transport that reads envelopes from `R` and writes them to `W`,
/// the process's stdin and stdout by default
pub struct StdioTransport<R = Stdin, W = Stdout> {
    io: Mutex<Option<(R, W)>>,
    options: StdioOptions,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl StdioTransport<Stdin, Stdout> {
    /// Create a transport over the process's stdin and stdout
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport<Stdin, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
    where R: AsyncRead + Unpin + Send + 'static, W: AsyncWrite + Unpin + Send + 'static
{
    /// Create a transport over any byte streams, e.g. a child process's pipes
    pub fn with_io(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new(Some((reader, writer))),
            options: StdioOptions::default(),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_options(mut self, options: StdioOptions) -> Self {
        self.options = options;
        self
    }

    /// Wait until the input reaches end of file or the transport is stopped
    pub async fn wait(&mut self) -> Result<(), Error> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| Error::Transport(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Serve one connection over `reader`/`writer` until end of input
    pub async fn serve(
        dispatcher: Arc<Dispatcher>,
        mut reader: R,
        writer: W,
        options: StdioOptions,
        shutdown: CancellationToken
    ) -> Result<(), Error> {
        let (line_tx, line_rx) = mpsc::channel::<String>(100);
        let writer_task = tokio::spawn(stdio_writer(writer, line_rx));
        let connection = Connection::new(
            dispatcher,
            format!("stdio-{}", uuid::Uuid::new_v4()),
            Arc::new(LineWriter { tx: line_tx })
        );

        let mut codec = LinesCodec::new_with_max_length(options.max_line_length);
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let mut result = Ok(());
        'read: loop {
            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(line)) => handle_line(&connection, &line).await,
                    Ok(None) => {
                        break;
                    }
                    Err(e) => {
                        if let Err(e) = reject_line(&connection, e).await {
                            result = Err(e);
                            break 'read;
                        }
                    }
                }
            }

            let read = tokio::select! {
                _ = shutdown.cancelled() => None,
                read = reader.read_buf(&mut buffer) => Some(read),
            };
            let Some(read) = read else {
                debug!("stdio transport stopped");
                break;
            };
            match read {
                Ok(0) => {
                    // A last line without a trailing newline
                    while let Ok(Some(line)) = codec.decode_eof(&mut buffer) {
                        handle_line(&connection, &line).await;
                    }
                    debug!("End of input");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    result = Err(Error::Io(e));
                    break;
                }
            }
        }

        connection.shutdown().await;
        drop(connection);
        if let Err(e) = writer_task.await {
            warn!("stdio writer task failed: {}", e);
        }
        result
    }
}

async fn handle_line(connection: &Connection<LineWriter>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => connection.handle(envelope).await,
        Err(e) => {
            debug!("Malformed envelope: {}", e);
            let reply = Reply::error(None, &Error::Protocol(format!("malformed JSON: {}", e)));
            if let Err(e) = connection.writer().write_reply("", reply).await {
                warn!("Failed to write error: {}", e);
            }
        }
    }
}

/// Answer an undecodable line; I/O errors end the connection
async fn reject_line(connection: &Connection<LineWriter>, error: LinesCodecError) -> Result<(), Error> {
    match error {
        LinesCodecError::MaxLineLengthExceeded => {
            warn!("Input line exceeds the maximum length");
            let reply = Reply::error(
                None,
                &Error::PayloadTooLarge("line exceeds maximum length".to_string())
            );
            connection.writer().write_reply("", reply).await
        }
        LinesCodecError::Io(e) => Err(Error::Io(e)),
    }
}

/// Write queued lines to the output, one per envelope
async fn stdio_writer<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

/// Response writer feeding the writer task
struct LineWriter {
    tx: mpsc::Sender<String>,
}

impl LineWriter {
    async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
        let line = serde_json::to_string(envelope)?;
        self.tx.send(line).await.map_err(|_| Error::Transport("stdout closed".to_string()))
    }
}

#[async_trait]
impl ResponseWriter for LineWriter {
    async fn write_reply(&self, _method: &str, reply: Reply) -> Result<(), Error> {
        self.send(&reply.into_envelope()).await
    }

    async fn write_stream_chunk(
        &self,
        _id: Option<&RequestId>,
        _method: &str,
        _chunk: &StreamChunk
    ) -> Result<(), Error> {
        Err(Error::Transport("stdio does not carry stream chunks".to_string()))
    }

    async fn write_notification(&self, notification: &Envelope) -> Result<(), Error> {
        self.send(notification).await
    }
}

#[async_trait]
impl<R, W> Transport
    for StdioTransport<R, W>
    where R: AsyncRead + Unpin + Send + 'static, W: AsyncWrite + Unpin + Send + 'static
{
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error> {
        let (reader, writer) = self.io
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| Error::InvalidState("stdio transport already started".to_string()))?;
        info!("Serving over stdio");
        let options = self.options.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(
            tokio::spawn(async move { Self::serve(dispatcher, reader, writer, options, shutdown).await })
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use serde_json::{ Value, json };
    use tokio::io::{ AsyncBufReadExt, BufReader, DuplexStream };

    async fn start() -> (StdioTransport<DuplexStream, DuplexStream>, DuplexStream, BufReader<DuplexStream>) {
        let server = Server::builder().build().await.unwrap();
        let (client_in, server_in) = tokio::io::duplex(4096);
        let (server_out, client_out) = tokio::io::duplex(4096);
        let mut transport = StdioTransport::with_io(server_in, server_out).with_options(StdioOptions {
            max_line_length: 64,
        });
        transport.start(server.dispatcher()).await.unwrap();
        (transport, client_in, BufReader::new(client_out))
    }

    async fn read_json(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn malformed_and_oversized_lines_are_rejected() {
        let (mut transport, mut input, mut output) = start().await;

        input.write_all(b"{not json\n").await.unwrap();
        let reply = read_json(&mut output).await;
        assert_eq!(reply["error"]["code"], 400);
        assert!(reply.get("id").is_none());

        let long = format!("{{\"method\":\"ping\",\"params\":{{\"pad\":\"{}\"}}}}\n", "x".repeat(100));
        input.write_all(long.as_bytes()).await.unwrap();
        assert_eq!(read_json(&mut output).await["error"]["code"], 413);

        input.write_all(b"{\"id\":1,\"method\":\"ping\"}\n").await.unwrap();
        assert_eq!(read_json(&mut output).await, json!({"id": 1, "result": {}}));

        drop(input);
        transport.wait().await.unwrap();
    }

    #[tokio::test]
    async fn eof_ends_the_transport() {
        let (mut transport, input, _output) = start().await;
        drop(input);
        tokio::time::timeout(std::time::Duration::from_secs(1), transport.wait()).await
            .unwrap()
            .unwrap();
    }
}
