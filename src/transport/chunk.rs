//! Framing of messages into characteristic-sized chunks.
//!
//! Every chunk is one marker byte followed by payload. All chunks but the
//! last carry the `pending` marker and exactly `payload_size` bytes; the last
//! carries the `last` marker and whatever remains, possibly nothing.
use std::future::Future;

use tracing::{debug, warn};

use crate::config::{ChunkMarkers, RetryPolicy};
use crate::transport::{self, RadioError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("chunk payload size must be positive")]
    ZeroPayloadSize,
    #[error("received an empty chunk")]
    Empty,
    #[error("unknown chunk marker {0:#04x}")]
    UnknownMarker(u8),
}

/// Split `payload` into chunks of at most `payload_size` payload bytes.
pub fn split(payload: &[u8], payload_size: usize, markers: ChunkMarkers) -> Result<Vec<Vec<u8>>, Error> {
    if payload_size == 0 {
        return Err(Error::ZeroPayloadSize);
    }
    let full = payload.len() / payload_size;
    let mut chunks = Vec::with_capacity(full + 1);
    let (body, rest) = payload.split_at(full * payload_size);
    for piece in body.chunks(payload_size) {
        chunks.push(frame(markers.pending, piece));
    }
    // An exact multiple still ends with an empty last chunk.
    chunks.push(frame(markers.last, rest));
    Ok(chunks)
}

fn frame(marker: u8, piece: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(piece.len() + 1);
    chunk.push(marker);
    chunk.extend_from_slice(piece);
    chunk
}

/// Outcome of feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// More chunks are expected; the number of bytes accumulated so far.
    Partial(usize),
    /// The message is complete.
    Complete(Vec<u8>),
}

/// Receive-side reassembly for one connection.
#[derive(Debug)]
pub struct ChunkAccumulator {
    markers: ChunkMarkers,
    buffer: Vec<u8>,
}

impl ChunkAccumulator {
    pub fn new(markers: ChunkMarkers) -> Self {
        Self {
            markers,
            buffer: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Feed, Error> {
        let (&marker, piece) = chunk.split_first().ok_or(Error::Empty)?;
        if marker == self.markers.pending {
            self.buffer.extend_from_slice(piece);
            Ok(Feed::Partial(self.buffer.len()))
        } else if marker == self.markers.last {
            self.buffer.extend_from_slice(piece);
            Ok(Feed::Complete(std::mem::take(&mut self.buffer)))
        } else {
            Err(Error::UnknownMarker(marker))
        }
    }

    /// Whether a partially received message is buffered.
    pub fn in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Run `write` until the radio accepts it, backing off between attempts.
///
/// Only [RadioError::Rejected] is retried; any other radio error is returned
/// immediately.
pub async fn write_with_retry<F, Fut>(policy: &RetryPolicy, mut write: F) -> Result<(), transport::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RadioError>>,
{
    let mut attempt = 0;
    loop {
        match write().await {
            Ok(()) => return Ok(()),
            Err(RadioError::Rejected) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, "radio kept rejecting chunk write");
                    return Err(transport::Error::RetriesExhausted { attempts: attempt });
                }
                let delay = policy.backoff(attempt - 1);
                debug!(attempt, ?delay, "chunk write rejected, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reassemble(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut accumulator = ChunkAccumulator::new(ChunkMarkers::default());
        let mut out = None;
        for chunk in chunks {
            if let Feed::Complete(message) = accumulator.feed(chunk).unwrap() {
                assert!(out.is_none(), "message completed before the last chunk");
                out = Some(message);
            }
        }
        out.expect("no last chunk")
    }

    #[test]
    fn roundtrip_for_all_sizes() {
        let payload: Vec<u8> = (0..=255).collect();
        for size in 1..40 {
            for len in [0, 1, size - 1, size, size + 1, 3 * size, 100, 256] {
                let chunks = split(&payload[..len], size, ChunkMarkers::default()).unwrap();
                assert_eq!(reassemble(&chunks), &payload[..len], "size {size} len {len}");
            }
        }
    }

    #[test]
    fn chunk_layout() {
        let chunks = split(b"abcdefg", 3, ChunkMarkers::default()).unwrap();
        assert_eq!(
            chunks,
            vec![b"\x00abc".to_vec(), b"\x00def".to_vec(), b"\x01g".to_vec()]
        );
    }

    #[test]
    fn exact_multiple_ends_with_empty_last_chunk() {
        let chunks = split(b"abcdef", 3, ChunkMarkers::default()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![0x01]);

        let chunks = split(b"", 3, ChunkMarkers::default()).unwrap();
        assert_eq!(chunks, vec![vec![0x01]]);
    }

    #[test]
    fn custom_markers() {
        let markers = ChunkMarkers {
            pending: 0x10,
            last: 0x20,
        };
        let chunks = split(b"abcd", 2, markers).unwrap();
        assert_eq!(chunks[0][0], 0x10);
        assert_eq!(chunks[2], vec![0x20]);

        let mut accumulator = ChunkAccumulator::new(markers);
        assert_eq!(accumulator.feed(&chunks[0]), Ok(Feed::Partial(2)));
        assert_eq!(
            accumulator.feed(&[0x00, 1]),
            Err(Error::UnknownMarker(0x00))
        );
    }

    #[test]
    fn accumulator_resets_after_last() {
        let mut accumulator = ChunkAccumulator::new(ChunkMarkers::default());
        assert_eq!(accumulator.feed(&[0x00, 1, 2]), Ok(Feed::Partial(2)));
        assert!(accumulator.in_progress());
        assert_eq!(accumulator.feed(&[0x01, 3]), Ok(Feed::Complete(vec![1, 2, 3])));
        assert!(!accumulator.in_progress());
        assert_eq!(accumulator.feed(&[0x01, 9]), Ok(Feed::Complete(vec![9])));
        assert_eq!(accumulator.feed(&[]), Err(Error::Empty));
    }

    #[test]
    fn zero_payload_size_is_rejected() {
        assert_eq!(
            split(b"abc", 0, ChunkMarkers::default()),
            Err(Error::ZeroPayloadSize)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_accepted() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::default();
        write_with_retry(&policy, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(RadioError::Rejected)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_is_bounded() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };
        let err = write_with_retry(&policy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RadioError::Rejected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, transport::Error::RetriesExhausted { attempts: 5 }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn other_radio_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = write_with_retry(&RetryPolicy::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RadioError::NotConnected)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, transport::Error::Radio(RadioError::NotConnected)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
