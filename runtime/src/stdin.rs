//! Blocking input pumped from a detached thread
//!
//! `tokio::io::stdin()` reads on the blocking pool, and a runtime will not
//! shut down while one of those reads is outstanding. The replay engine
//! keeps stdin open, so after a shutdown signal the process would hang until
//! the engine closed the pipe. [`ThreadReader`] reads on a plain thread the
//! runtime does not own; dropping the reader abandons the thread.

use bytes::Bytes;
use std::io::{self, ErrorKind, Read};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Chunks buffered between the reading thread and the pipeline
const CHANNEL_CAPACITY: usize = 16;
/// Size of one blocking read
const CHUNK_SIZE: usize = 64 * 1024;

/// Async view of a blocking [`Read`] source
pub struct ThreadReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    chunk: Bytes,
}

impl ThreadReader {
    /// Start pumping the process stdin
    pub fn stdin() -> io::Result<Self> {
        Self::spawn(io::stdin())
    }

    /// Start pumping `source` on a new thread
    pub fn spawn<R>(source: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name("kaiku-input".to_string())
            .spawn(move || pump(source, tx))?;
        Ok(Self {
            rx,
            chunk: Bytes::new(),
        })
    }
}

fn pump<R: Read>(mut source: R, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let chunk = match source.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e),
        };
        let failed = chunk.is_err();
        // A closed channel means the pipeline is gone
        if tx.blocking_send(chunk).is_err() || failed {
            return;
        }
    }
}

impl AsyncRead for ThreadReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.chunk.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // End of input
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.chunk.len().min(buf.remaining());
        let head = self.chunk.split_to(n);
        buf.put_slice(&head);
        Poll::Ready(Ok(()))
    }
}
