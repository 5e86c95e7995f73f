use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

use md_ingest::error::IngestError;
use md_ingest::store::BlobSink;
use md_ingest::upload::upload;

fn pattern(offset: u64) -> u8 {
    (offset.wrapping_mul(31) ^ (offset >> 9)) as u8
}

/// Produces `len` deterministic bytes in uneven reads, optionally failing at `fail_at`.
struct PatternSource {
    len: u64,
    position: u64,
    fail_at: Option<u64>,
}

impl PatternSource {
    fn new(len: u64) -> Self {
        Self {
            len,
            position: 0,
            fail_at: None,
        }
    }
}

impl AsyncRead for PatternSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(fail_at) = self.fail_at
            && self.position >= fail_at
        {
            return Poll::Ready(Err(io::Error::other("disk went away")));
        }
        let remaining = self.len - self.position;
        let step = 7_777u64.min(remaining).min(buf.remaining() as u64) as usize;
        let start = self.position;
        let dst = buf.initialize_unfilled_to(step);
        for (offset, slot) in dst.iter_mut().enumerate() {
            *slot = pattern(start + offset as u64);
        }
        buf.advance(step);
        self.position += step as u64;
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct CheckingSink {
    received: u64,
    mismatches: u64,
    max_chunk: usize,
    writes: usize,
    fail_on_write: Option<usize>,
    finished: bool,
    aborted: bool,
}

#[async_trait]
impl BlobSink for CheckingSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), IngestError> {
        self.writes += 1;
        if self.fail_on_write == Some(self.writes) {
            return Err(IngestError::StoreStatus {
                status: 503,
                message: "busy".to_string(),
            });
        }
        self.max_chunk = self.max_chunk.max(chunk.len());
        for byte in chunk.iter() {
            if *byte != pattern(self.received) {
                self.mismatches += 1;
            }
            self.received += 1;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<String, IngestError> {
        self.finished = true;
        Ok(format!("test://{}", self.received))
    }

    async fn abort(&mut self) {
        self.aborted = true;
    }
}

async fn roundtrip(len: u64, chunk_size: usize) -> CheckingSink {
    let mut source = PatternSource::new(len);
    let mut sink = CheckingSink::default();
    let receipt = upload(&mut source, &mut sink, chunk_size).await.unwrap();
    assert_eq!(receipt.bytes, len);
    assert_eq!(receipt.location, format!("test://{len}"));
    sink
}

#[tokio::test]
async fn byte_exact_for_edge_sizes() {
    for len in [0u64, 1, 4_194_305] {
        let sink = roundtrip(len, 1024 * 1024).await;
        assert_eq!(sink.received, len);
        assert_eq!(sink.mismatches, 0);
        assert!(sink.finished);
        assert!(!sink.aborted);
        assert!(sink.max_chunk <= 1024 * 1024);
    }
}

#[tokio::test]
async fn large_payload_is_streamed_in_bounded_chunks() {
    let len = 100 * 1024 * 1024;
    let sink = roundtrip(len, 64 * 1024).await;
    assert_eq!(sink.received, len);
    assert_eq!(sink.mismatches, 0);
    assert_eq!(sink.max_chunk, 64 * 1024);
    assert_eq!(sink.writes, 1600);
}

#[tokio::test]
async fn source_error_aborts_sink() {
    let mut source = PatternSource {
        fail_at: Some(10_000),
        ..PatternSource::new(50_000)
    };
    let mut sink = CheckingSink::default();

    let err = upload(&mut source, &mut sink, 4096).await.unwrap_err();
    assert_matches!(err, IngestError::Filesystem(message) if message.contains("disk went away"));
    assert!(sink.aborted);
    assert!(!sink.finished);
}

#[tokio::test]
async fn sink_error_is_returned_unchanged() {
    let mut source = PatternSource::new(50_000);
    let mut sink = CheckingSink {
        fail_on_write: Some(2),
        ..CheckingSink::default()
    };

    let err = upload(&mut source, &mut sink, 4096).await.unwrap_err();
    assert_matches!(err, IngestError::StoreStatus { status: 503, .. });
    assert!(sink.aborted);
    assert!(!sink.finished);
    assert_eq!(sink.received, 4096);
}
