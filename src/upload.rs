//! Bounded-memory transfer of a byte stream into a [`BlobSink`].

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::IngestError;
use crate::store::BlobSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub bytes: u64,
    pub location: String,
}

/// Copies `source` into `sink` in reads of at most `chunk_size` bytes.
///
/// At most one chunk is held here at a time; the next read only starts once the
/// sink accepted the previous chunk. On failure the sink is aborted and the error
/// returned as-is.
pub async fn upload<R, S>(
    source: &mut R,
    sink: &mut S,
    chunk_size: usize,
) -> Result<UploadReceipt, IngestError>
where
    R: AsyncRead + Unpin + ?Sized,
    S: BlobSink + ?Sized,
{
    match transfer(source, sink, chunk_size.max(1)).await {
        Ok(bytes) => match sink.finish().await {
            Ok(location) => {
                debug!(bytes, location = %location, "blob committed");
                Ok(UploadReceipt { bytes, location })
            }
            Err(err) => {
                sink.abort().await;
                Err(err)
            }
        },
        Err(err) => {
            sink.abort().await;
            Err(err)
        }
    }
}

async fn transfer<R, S>(source: &mut R, sink: &mut S, chunk_size: usize) -> Result<u64, IngestError>
where
    R: AsyncRead + Unpin + ?Sized,
    S: BlobSink + ?Sized,
{
    let mut total = 0u64;
    let mut buffer = BytesMut::with_capacity(chunk_size);
    loop {
        // Fill up to one chunk so small reads from pipes do not turn into tiny writes.
        while buffer.len() < chunk_size {
            let read = (&mut *source)
                .take((chunk_size - buffer.len()) as u64)
                .read_buf(&mut buffer)
                .await?;
            if read == 0 {
                break;
            }
        }
        if buffer.is_empty() {
            return Ok(total);
        }
        let eof = buffer.len() < chunk_size;
        total += buffer.len() as u64;
        sink.write(buffer.split().freeze()).await?;
        if eof {
            return Ok(total);
        }
        buffer.reserve(chunk_size);
    }
}
