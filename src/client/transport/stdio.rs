//! STDIO Client Transport
//!
//! This module implements the client side of the stdio transport: one JSON
//! envelope per line in each direction, typically over the pipes of a child
//! server process. A reader task matches responses to pending requests and
//! forwards server notifications.
//!
//! End of input completes every pending request: `initialize` fails, any
//! other method resolves with a null result.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use tokio::io::{ AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader };
use tokio::process::{ Child, Command };
use tokio::sync::{ Mutex, mpsc };
use tokio::task::JoinHandle;
use tracing::{ debug, info, warn };

use crate::client::transport::{ ClientTransport, Pending, wait };
use crate::errors::Error;
use crate::messages::{ Envelope, RequestId };
use crate::protocol::Method;

/// Buffer size for the notification channel
const CHANNEL_BUFFER_SIZE: usize = 100;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A client transport over a line-delimited byte stream pair
pub struct StdioClientTransport {
    writer: Mutex<BoxedWriter>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    notifications: std::sync::Mutex<Option<mpsc::Receiver<Envelope>>>,
    reader_task: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl StdioClientTransport {
    /// Talk to a server over `reader` (its output) and `writer` (its input)
    pub fn new<R, W>(reader: R, writer: W) -> Self
        where R: AsyncRead + Unpin + Send + 'static, W: AsyncWrite + Unpin + Send + 'static
    {
        let pending = Arc::new(Pending::default());
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let reader_task = tokio::spawn(read_loop(reader, pending.clone(), closed.clone(), tx));
        Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            closed,
            notifications: std::sync::Mutex::new(Some(rx)),
            reader_task,
            child: Mutex::new(None),
        }
    }

    /// Spawn `command` as a child process and talk to it over its stdio
    pub fn spawn(mut command: Command) -> Result<Self, Error> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin
            .take()
            .ok_or_else(|| Error::Transport("child stdin unavailable".to_string()))?;
        let stdout = child.stdout
            .take()
            .ok_or_else(|| Error::Transport("child stdout unavailable".to_string()))?;
        info!("Spawned server process {:?}", child.id());
        let mut transport = Self::new(stdout, stdin);
        transport.child = Mutex::new(Some(child));
        Ok(transport)
    }

    /// Server notifications; can be taken once
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.notifications.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Whether the server's output reached end of file
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), Error> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Outcome of a request still pending when the output ends
fn eof_outcome(method: &str) -> Result<Value, Error> {
    if method == Method::Initialize.as_str() {
        Err(Error::Transport("server closed the connection during initialize".to_string()))
    } else {
        Ok(Value::Null)
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    notifications: mpsc::Sender<Envelope>
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(line) {
                    Ok(envelope) => {
                        if let Some(unmatched) = pending.resolve(envelope) {
                            if unmatched.is_request() {
                                if notifications.try_send(unmatched).is_err() {
                                    debug!("Notification dropped");
                                }
                            } else {
                                debug!("Response without a pending request: {:?}", unmatched.id);
                            }
                        }
                    }
                    Err(e) => warn!("Failed to parse message: {} - Input: {}", e, line),
                }
            }
            Ok(None) => {
                debug!("End of server output");
                break;
            }
            Err(e) => {
                warn!("Error reading server output: {}", e);
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    pending.close_all(eof_outcome);
}

#[async_trait]
impl ClientTransport for StdioClientTransport {
    async fn request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let rx = self.pending.register(&id, method)?;
        // Frees the id when the caller stops waiting, answered or not
        let _forget = scopeguard::guard(&id, |id| {
            self.pending.remove(id);
        });
        self.write(&Envelope::request(Some(id.clone()), method, params)).await?;
        // Output ended after the write; the reader will not see a response
        if self.is_closed() && self.pending.remove(&id) {
            return eof_outcome(method);
        }
        wait(rx).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.write(&Envelope::notification(method, params)).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.writer.lock().await.shutdown().await?;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("Server process already exited: {}", e);
            }
        }
        self.reader_task.abort();
        self.pending.close_all(eof_outcome);
        Ok(())
    }
}

impl Drop for StdioClientTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{ AsyncBufReadExt, BufReader, DuplexStream };

    fn pair() -> (StdioClientTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_out, server_in) = tokio::io::duplex(4096);
        let (server_out, client_in) = tokio::io::duplex(4096);
        (StdioClientTransport::new(client_in, client_out), BufReader::new(server_in), server_out)
    }

    async fn read_request(reader: &mut BufReader<DuplexStream>) -> Envelope {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn responses_are_matched_by_id() {
        let (transport, mut server_in, mut server_out) = pair();
        let call = tokio::spawn(async move {
            transport.request(RequestId::from(7), "ping", None).await
        });

        let request = read_request(&mut server_in).await;
        assert_eq!(request.method.as_deref(), Some("ping"));
        server_out.write_all(b"{\"id\":7,\"result\":{\"ok\":true}}\n").await.unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn eof_fails_initialize_but_not_other_methods() {
        let (transport, mut server_in, server_out) = pair();
        let transport = Arc::new(transport);

        let list = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request(RequestId::from(1), "listTools", None).await })
        };
        read_request(&mut server_in).await;
        let init = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.request(RequestId::from(2), "initialize", None).await })
        };
        read_request(&mut server_in).await;
        drop(server_out);

        assert_eq!(list.await.unwrap().unwrap(), Value::Null);
        assert!(init.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn abandoned_requests_free_their_id() {
        let (transport, mut server_in, mut server_out) = pair();
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            transport.request(RequestId::from("sleep-1"), "callTool", None)
        ).await;
        assert!(first.is_err());
        assert_eq!(transport.pending.len(), 0);
        read_request(&mut server_in).await;

        let call = tokio::spawn(async move {
            transport.request(RequestId::from("sleep-1"), "ping", None).await
        });
        let request = read_request(&mut server_in).await;
        assert_eq!(request.method.as_deref(), Some("ping"));
        server_out.write_all(b"{\"id\":\"sleep-1\",\"result\":{}}\n").await.unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn server_requests_are_forwarded_as_notifications() {
        let (transport, _server_in, mut server_out) = pair();
        let mut notifications = transport.take_notifications().unwrap();
        server_out.write_all(b"{\"method\":\"progress\",\"params\":{\"percentage\":50}}\n").await.unwrap();
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.method.as_deref(), Some("progress"));
        assert!(transport.take_notifications().is_none());
    }
}
