//! C3 — stream buffer and message dispatcher: a back-pressured byte
//! reservoir over the socket, spec.md §3 and §4.3.
//!
//! Invariant (testable property 7): `0 <= start <= cursor <= end <=
//! size`; after any sequence of `consume_start`/`consume_end` calls,
//! `start == cursor` and `end <= size`.

use bytes::Bytes;
use pgmoneta_proto::frame::peek_header;
use pgmoneta_utils::TokenBucket;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Headroom the buffer tries to keep available past `end` before a read,
/// spec.md §4.3.
const READ_HEADROOM: usize = 1500;
const RATE_LIMIT_SPIN_SLEEP: Duration = Duration::from_millis(500);

/// Kinds whose exposed payload retains the leading 5 bytes (kind + length)
/// for the shared parsing helpers, spec.md §4.3.
fn retains_header(kind: u8) -> bool {
    matches!(kind, b'D' | b'T' | b'E')
}

pub struct StreamBuffer {
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    cursor: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        StreamBuffer {
            buffer: vec![0u8; READ_HEADROOM],
            start: 0,
            end: 0,
            cursor: 0,
        }
    }

    fn invariant(&self) {
        debug_assert!(self.start <= self.cursor);
        debug_assert!(self.cursor <= self.end);
        debug_assert!(self.end <= self.buffer.len());
    }

    /// Grows the backing buffer so at least `READ_HEADROOM` bytes are free
    /// past `end`, without ever shrinking it.
    fn ensure_headroom(&mut self) {
        let free = self.buffer.len() - self.end;
        if free < READ_HEADROOM {
            self.buffer.resize(self.buffer.len() + READ_HEADROOM, 0);
        }
    }

    /// Left-shifts the live `[start, end)` suffix to offset 0, reclaiming
    /// the consumed prefix. Spec.md §4.3: "if the consumed prefix is
    /// non-empty the live suffix is memmoved to offset 0".
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buffer.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.cursor -= self.start;
        self.start = 0;
        self.invariant();
    }

    /// Reads more bytes from the socket into the tail of the buffer.
    /// Returns the number of bytes read; 0 means EOF.
    pub async fn fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        self.ensure_headroom();
        let n = reader.read(&mut self.buffer[self.end..]).await?;
        self.end += n;
        self.invariant();
        Ok(n)
    }

    /// Peeks the next frame's `(kind, total_len including the 1-byte
    /// kind)` at the cursor, without consuming anything.
    fn peek_at_cursor(&self) -> Option<(u8, usize)> {
        peek_header(&self.buffer[self.cursor..self.end])
    }

    /// Aborts a tentative scan: rewinds the cursor back to `start`. Used
    /// when not enough bytes are buffered yet to decide on the next
    /// message (testable property 7).
    pub fn consume_start(&mut self) {
        self.cursor = self.start;
        self.invariant();
    }

    /// Commits a tentative scan: `start` catches up to `cursor`, then the
    /// buffer is compacted if anything was actually consumed.
    pub fn consume_end(&mut self) {
        self.start = self.cursor;
        self.compact();
        self.invariant();
    }

    fn unconsumed(&self) -> usize {
        self.end - self.cursor
    }

    /// Drives one iteration of the dispatcher: fills the buffer if
    /// necessary, rate-limits the frame body against `bucket`, and
    /// returns the next message's `(kind, payload)`. `None` means the
    /// caller must `fill` more bytes and retry (a `None` is never
    /// returned together with a decision to skip — unknown kinds are
    /// consumed internally and looped past).
    pub async fn next_message<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        bucket: Option<&TokenBucket>,
        accepted_kinds: &[u8],
    ) -> std::io::Result<Option<(u8, Bytes)>> {
        loop {
            match self.peek_at_cursor() {
                None => {
                    self.consume_start();
                    let n = self.fill(reader).await?;
                    if n == 0 {
                        return Ok(None);
                    }
                    continue;
                }
                Some((kind, total_len)) => {
                    if self.unconsumed() < total_len {
                        self.consume_start();
                        let n = self.fill(reader).await?;
                        if n == 0 {
                            return Ok(None);
                        }
                        continue;
                    }

                    if let Some(bucket) = bucket {
                        let body_len = (total_len - 5) as u64;
                        while !bucket.consume(body_len) {
                            tokio::time::sleep(RATE_LIMIT_SPIN_SLEEP).await;
                        }
                    }

                    let frame_start = self.cursor;
                    let frame_end = self.cursor + total_len;
                    self.cursor = frame_end;

                    if accepted_kinds.contains(&kind) {
                        let payload_start = if retains_header(kind) {
                            frame_start
                        } else {
                            frame_start + 5
                        };
                        let payload = Bytes::copy_from_slice(&self.buffer[payload_start..frame_end]);
                        self.consume_end();
                        return Ok(Some((kind, payload)));
                    } else {
                        // Unrecognised kind for the current stream phase:
                        // silently skip, cursor already advanced past it.
                        self.consume_end();
                        continue;
                    }
                }
            }
        }
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_accepted_kind_and_skips_unknown() {
        let mut wire = Vec::new();
        pgmoneta_proto::write_frame(&mut wire, b'Z', b"ignored")
            .await
            .unwrap();
        pgmoneta_proto::write_frame(&mut wire, b'Q', b"hello")
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut sb = StreamBuffer::new();
        let (kind, payload) = sb
            .next_message(&mut cursor, None, &[b'Q'])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, b'Q');
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn retains_leading_five_bytes_for_data_row() {
        let mut wire = Vec::new();
        pgmoneta_proto::write_frame(&mut wire, b'D', b"rowbytes")
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let mut sb = StreamBuffer::new();
        let (kind, payload) = sb
            .next_message(&mut cursor, None, &[b'D'])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, b'D');
        // 1 kind byte + 4 length bytes + "rowbytes"
        assert_eq!(payload.len(), 5 + 8);
        assert_eq!(&payload[5..], b"rowbytes");
    }

    #[tokio::test]
    async fn grows_across_multiple_small_reads() {
        // Simulate a reader that trickles bytes one at a time.
        struct Trickle(std::io::Cursor<Vec<u8>>);
        impl AsyncRead for Trickle {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let mut one = [0u8; 1];
                use std::io::Read;
                let n = self.0.read(&mut one).unwrap_or(0);
                if n == 1 {
                    buf.put_slice(&one);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut wire = Vec::new();
        pgmoneta_proto::write_frame(&mut wire, b'Q', b"a bit longer body here")
            .await
            .unwrap();
        let mut trickle = Trickle(std::io::Cursor::new(wire));
        let mut sb = StreamBuffer::new();
        let (kind, payload) = sb
            .next_message(&mut trickle, None, &[b'Q'])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kind, b'Q');
        assert_eq!(&payload[..], b"a bit longer body here");
    }
}
