use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

/// Outbound byte queue of one connection.
///
/// Encoded packets are queued as whole `Bytes` segments and drained by
/// vectored writes, so a short write only advances the front segment and
/// packet order is never disturbed.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    segs: VecDeque<Bytes>,
    len: usize,
}

/// Segments handed to a single `write_vectored` call.
const MAX_IOVECS: usize = 16;

impl OutboundQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Drop `n` bytes from the front, releasing fully written segments.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len`.
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.len);
        self.len -= n;

        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }

    /// One vectored write of the queued segments. Returns the bytes written,
    /// which have already been removed from the queue.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let slices: Vec<IoSlice<'_>> = self
            .segs
            .iter()
            .take(MAX_IOVECS)
            .map(|seg| IoSlice::new(seg))
            .collect();
        let n = writer.write_vectored(&slices)?;
        self.advance(n);
        Ok(n)
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }
}
