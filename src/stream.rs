//! Stream Pipe
//!
//! A one-shot single-producer / single-consumer channel of typed chunks scoped
//! to one request. The handler owns the [`StreamWriter`], the transport task
//! owns the [`StreamReader`] and encodes each chunk as one frame (WebSocket) or
//! one event block (SSE).

use serde::Serialize;
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::sync::{ Mutex, mpsc };
use tokio_util::sync::CancellationToken;

use crate::errors::{ Error, ErrorData };
use crate::messages::RequestId;
use crate::progress::Progress;

/// Default number of chunks buffered between writer and reader
pub const DEFAULT_PIPE_CAPACITY: usize = 64;

/// One chunk of a streamed response
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamChunk {
    /// Caller JSON, kept verbatim
    Data {
        data: Box<RawValue>,
    },
    /// Progress snapshot
    Progress {
        progress: Progress,
    },
    /// Error raised while streaming
    Error {
        error: ErrorData,
    },
    /// Terminal marker, nothing follows
    Complete {},
}

impl StreamChunk {
    /// Name of the chunk type, also used as the SSE event name
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamChunk::Data { .. } => "data",
            StreamChunk::Progress { .. } => "progress",
            StreamChunk::Error { .. } => "error",
            StreamChunk::Complete {} => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Complete {})
    }

    /// Encode the chunk as one JSON text
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::Json)
    }

    /// Encode the chunk tagged with the id of the request it belongs to,
    /// `{"id":..,"type":..,..}`, for transports multiplexing several requests
    pub fn to_json_with_id(&self, id: Option<&RequestId>) -> Result<String, Error> {
        #[derive(Serialize)]
        struct Tagged<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            id: Option<&'a RequestId>,
            #[serde(flatten)]
            chunk: &'a StreamChunk,
        }
        serde_json::to_string(&(Tagged { id, chunk: self })).map_err(Error::Json)
    }
}

/// Constructor for a connected writer/reader pair
pub struct StreamPipe;

impl StreamPipe {
    /// Create a pipe buffering up to `capacity` chunks
    pub fn new(capacity: usize) -> (StreamWriter, StreamReader) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            StreamWriter {
                tx: Mutex::new(Some(tx)),
                closed: closed.clone(),
            },
            StreamReader {
                rx,
                closed,
                reader_closed: false,
            },
        )
    }
}

/// Writing half of a pipe; writes are serialized under one mutex
pub struct StreamWriter {
    tx: Mutex<Option<mpsc::Sender<StreamChunk>>>,
    closed: CancellationToken,
}

impl StreamWriter {
    /// Write caller JSON verbatim
    pub async fn write_raw(&self, data: Box<RawValue>) -> Result<(), Error> {
        self.write(StreamChunk::Data { data }).await
    }

    /// Write JSON bytes verbatim; the bytes must be a valid JSON document
    pub async fn write_json_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(bytes).map_err(|e| Error::InvalidParams(e.to_string()))?;
        let raw = RawValue::from_string(text.to_string())?;
        self.write_raw(raw).await
    }

    /// Serialize a value and write it as a data chunk
    pub async fn write_data<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), Error> {
        let raw = serde_json::value::to_raw_value(data)?;
        self.write_raw(raw).await
    }

    /// Write a progress snapshot
    pub async fn write_progress(&self, progress: Progress) -> Result<(), Error> {
        self.write(StreamChunk::Progress { progress }).await
    }

    /// Write an error chunk
    pub async fn write_error(&self, error: &Error) -> Result<(), Error> {
        self.write(StreamChunk::Error { error: error.to_error_data() }).await
    }

    /// Write the terminal chunk; any later write fails
    pub async fn write_complete(&self) -> Result<(), Error> {
        self.write(StreamChunk::Complete {}).await
    }

    /// Close the writer. Chunks already buffered are still delivered. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        self.tx.lock().await.take();
        Ok(())
    }

    /// Whether the reader side has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the reader side has closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn write(&self, chunk: StreamChunk) -> Result<(), Error> {
        let mut guard = self.tx.lock().await;
        if self.closed.is_cancelled() {
            guard.take();
            return Err(Error::StreamClosed);
        }
        let tx = guard.as_ref().ok_or(Error::StreamClosed)?;
        let terminal = chunk.is_terminal();
        let sent =
            tokio::select! {
            sent = tx.send(chunk) => sent.is_ok(),
            _ = self.closed.cancelled() => false,
        };
        if !sent || terminal {
            guard.take();
        }
        if sent { Ok(()) } else { Err(Error::StreamClosed) }
    }
}

/// Reading half of a pipe
pub struct StreamReader {
    rx: mpsc::Receiver<StreamChunk>,
    closed: CancellationToken,
    reader_closed: bool,
}

impl StreamReader {
    /// Next chunk in write order; `stream closed` once both the buffer is
    /// drained and the writer is gone, or after the reader was closed.
    pub async fn recv(&mut self) -> Result<StreamChunk, Error> {
        if self.reader_closed {
            return Err(Error::StreamClosed);
        }
        self.rx.recv().await.ok_or(Error::StreamClosed)
    }

    /// Close the reader and, with it, the writer. Idempotent.
    pub fn close(&mut self) {
        if !self.reader_closed {
            self.reader_closed = true;
            self.closed.cancel();
            self.rx.close();
        }
    }

    /// A token that closes the pipe from outside the reading task
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;
    use serde_json::json;

    #[tokio::test]
    async fn data_chunks_keep_json_verbatim() {
        let (writer, mut reader) = StreamPipe::new(8);
        writer.write_json_bytes(br#"{"b":1, "a":[2,3]}"#).await.unwrap();
        let chunk = reader.recv().await.unwrap();
        insta::assert_snapshot!(chunk.to_json().unwrap(), @r#"{"type":"data","data":{"b":1, "a":[2,3]}}"#);
    }

    #[tokio::test]
    async fn tagged_chunks_keep_json_verbatim() {
        let (writer, mut reader) = StreamPipe::new(8);
        writer.write_json_bytes(br#"{"z":0,"a":1}"#).await.unwrap();
        let chunk = reader.recv().await.unwrap();
        let id = RequestId::from(7);
        insta::assert_snapshot!(chunk.to_json_with_id(Some(&id)).unwrap(), @r#"{"id":7,"type":"data","data":{"z":0,"a":1}}"#);
    }

    #[tokio::test]
    async fn chunks_arrive_in_write_order_then_close() {
        let (writer, mut reader) = StreamPipe::new(8);
        writer.write_data(&json!({"n": 1})).await.unwrap();
        let progress = ProgressTracker::new().start("go").unwrap();
        writer.write_progress(progress).await.unwrap();
        writer.write_error(&Error::rpc(418, "teapot")).await.unwrap();
        writer.write_complete().await.unwrap();

        let types: Vec<_> = [
            reader.recv().await.unwrap(),
            reader.recv().await.unwrap(),
            reader.recv().await.unwrap(),
            reader.recv().await.unwrap(),
        ]
            .iter()
            .map(|c| c.type_name())
            .collect();
        assert_eq!(types, vec!["data", "progress", "error", "complete"]);
        assert!(matches!(reader.recv().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn writes_after_complete_fail() {
        let (writer, _reader) = StreamPipe::new(8);
        writer.write_complete().await.unwrap();
        assert!(matches!(writer.write_data(&1).await, Err(Error::StreamClosed)));
        assert!(matches!(writer.write_complete().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_later_writes_fail() {
        let (writer, mut reader) = StreamPipe::new(8);
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(matches!(writer.write_data(&1).await, Err(Error::StreamClosed)));

        reader.close();
        reader.close();
        assert!(matches!(reader.recv().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn buffered_chunks_survive_writer_close() {
        let (writer, mut reader) = StreamPipe::new(8);
        writer.write_data(&"a").await.unwrap();
        writer.write_data(&"b").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(reader.recv().await.unwrap().type_name(), "data");
        assert_eq!(reader.recv().await.unwrap().type_name(), "data");
        assert!(matches!(reader.recv().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn reader_close_unblocks_a_waiting_writer() {
        let (writer, mut reader) = StreamPipe::new(1);
        writer.write_data(&1).await.unwrap();
        let writer = Arc::new(writer);
        let blocked = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write_data(&2).await })
        };
        tokio::task::yield_now().await;
        reader.close();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(Error::StreamClosed)));
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn in_flight_read_returns_closed_when_writer_closes() {
        let (writer, mut reader) = StreamPipe::new(4);
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        writer.close().await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(Error::StreamClosed)));
    }
}
