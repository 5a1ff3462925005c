pub mod blob;
pub mod browse;
pub mod manifest;

use std::io::{self, Read};

use axum::body::{Body, Bytes};
use tokio::sync::mpsc;

/// Chunks buffered between the reading thread and the response.
const STREAM_CHUNKS: usize = 8;
const CHUNK_SIZE: usize = 64 * 1024;

/// Response body fed by a blocking reader on the blocking thread pool.
/// Dropping the body stops the reader at its next chunk.
pub(crate) fn stream_body(mut reader: Box<dyn Read + Send>) -> Body {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(STREAM_CHUNKS);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let chunk = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("failed to stream response body: {e}");
                    Err(e)
                }
            };
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Body::from_stream(stream)
}
