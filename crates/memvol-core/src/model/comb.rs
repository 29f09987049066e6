//! Segmented byte storage for file contents.
//!
//! File bytes live in fixed-size 1 MiB segments rather than one contiguous
//! allocation, so growing a large file never relocates existing bytes and a
//! failed grow can stop part-way without losing what was already acquired.
//! A buffer at or below one segment is a single contiguous allocation.

use crate::error::FsError;

/// Segment size in bytes. Also the rounding granularity for allocation
/// sizes ([`rounded_length`]).
pub const SEGMENT_SIZE: u64 = 1 << 20;

/// Round a byte count up to the segment granularity. Zero stays zero.
pub fn rounded_length(n: u64) -> u64 {
    n.div_ceil(SEGMENT_SIZE).saturating_mul(SEGMENT_SIZE)
}

/// File-content byte store split into fixed-size segments.
///
/// Invariant: every segment except the last holds exactly [`SEGMENT_SIZE`]
/// bytes; the last holds the remainder (never zero bytes — an empty buffer
/// has no segments at all). The sum of segment lengths is `length`.
///
/// All bytes are zero until written, including bytes exposed by growing
/// after a shrink.
#[derive(Debug, Default)]
pub struct SegmentedBuffer {
    segments: Vec<Vec<u8>>,
    length: u64,
}

impl SegmentedBuffer {
    /// Current allocated length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Returns `true` if no bytes are allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Grow or shrink to `new_len` bytes.
    ///
    /// Shrinking cannot fail. Growing allocates segment by segment; if the
    /// allocator refuses part-way, the buffer keeps everything acquired so
    /// far, `len()` reflects that partial length, and the call reports
    /// [`FsError::OutOfMemory`]. Newly acquired bytes are zeroed.
    pub fn set_length(&mut self, new_len: u64) -> Result<(), FsError> {
        if new_len < self.length {
            self.shrink_to(new_len);
            return Ok(());
        }
        while self.length < new_len {
            let remaining = new_len - self.length;
            let tail_room = self
                .segments
                .last()
                .map(|s| SEGMENT_SIZE - s.len() as u64)
                .unwrap_or(0);
            if tail_room > 0 {
                let take = tail_room.min(remaining) as usize;
                let tail = self.segments.last_mut().unwrap();
                reserve_zeroed(tail, take)?;
                self.length += take as u64;
            } else {
                let take = SEGMENT_SIZE.min(remaining) as usize;
                // Reserve the Vec-of-segments slot first so a push can
                // never abort after the segment itself was acquired.
                self.segments
                    .try_reserve(1)
                    .map_err(|_| FsError::OutOfMemory)?;
                let mut segment = Vec::new();
                reserve_zeroed(&mut segment, take)?;
                self.segments.push(segment);
                self.length += take as u64;
            }
        }
        Ok(())
    }

    fn shrink_to(&mut self, new_len: u64) {
        let keep = if new_len == 0 {
            0
        } else {
            new_len.div_ceil(SEGMENT_SIZE) as usize
        };
        self.segments.truncate(keep);
        if let Some(tail) = self.segments.last_mut() {
            let tail_len = (new_len - (keep as u64 - 1) * SEGMENT_SIZE) as usize;
            tail.truncate(tail_len);
            tail.shrink_to_fit();
        }
        self.length = new_len;
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// Precondition: `offset + dst.len() <= len()`.
    pub fn read(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() as u64 <= self.length);
        let mut pos = offset;
        let mut done = 0;
        while done < dst.len() {
            let (segment, within) = self.locate(pos);
            let n = (dst.len() - done).min(segment.len() - within);
            dst[done..done + n].copy_from_slice(&segment[within..within + n]);
            done += n;
            pos += n as u64;
        }
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// Precondition: `offset + src.len() <= len()`.
    pub fn write(&mut self, offset: u64, src: &[u8]) {
        debug_assert!(offset + src.len() as u64 <= self.length);
        let mut pos = offset;
        let mut done = 0;
        while done < src.len() {
            let (segment, within) = self.locate_mut(pos);
            let n = (src.len() - done).min(segment.len() - within);
            segment[within..within + n].copy_from_slice(&src[done..done + n]);
            done += n;
            pos += n as u64;
        }
    }

    /// Zero `len` bytes starting at `offset`.
    ///
    /// Precondition: `offset + len <= len()`.
    pub fn zero(&mut self, offset: u64, len: u64) {
        debug_assert!(offset + len <= self.length);
        let mut pos = offset;
        let mut remaining = len;
        while remaining > 0 {
            let (segment, within) = self.locate_mut(pos);
            let n = (remaining as usize).min(segment.len() - within);
            segment[within..within + n].fill(0);
            remaining -= n as u64;
            pos += n as u64;
        }
    }

    fn locate(&self, pos: u64) -> (&[u8], usize) {
        let idx = (pos / SEGMENT_SIZE) as usize;
        (self.segments[idx].as_slice(), (pos % SEGMENT_SIZE) as usize)
    }

    fn locate_mut(&mut self, pos: u64) -> (&mut Vec<u8>, usize) {
        let idx = (pos / SEGMENT_SIZE) as usize;
        (&mut self.segments[idx], (pos % SEGMENT_SIZE) as usize)
    }
}

/// Extend a segment by `additional` zero bytes through the fallible
/// allocator path.
fn reserve_zeroed(segment: &mut Vec<u8>, additional: usize) -> Result<(), FsError> {
    #[cfg(test)]
    if !alloc_failpoint::take(additional as u64) {
        return Err(FsError::OutOfMemory);
    }
    segment
        .try_reserve_exact(additional)
        .map_err(|_| FsError::OutOfMemory)?;
    segment.resize(segment.len() + additional, 0);
    Ok(())
}

/// Test-only allocation failure injection.
///
/// Arms a per-thread byte allowance; once the comb has acquired that many
/// bytes, further segment allocations report [`FsError::OutOfMemory`] until
/// disarmed. Lets tests exercise the documented partial-grow semantics
/// without stubbing the global allocator.
#[cfg(test)]
pub(crate) mod alloc_failpoint {
    use std::cell::Cell;

    thread_local! {
        static REMAINING: Cell<Option<u64>> = const { Cell::new(None) };
    }

    pub(crate) fn arm(bytes: u64) {
        REMAINING.with(|r| r.set(Some(bytes)));
    }

    pub(crate) fn disarm() {
        REMAINING.with(|r| r.set(None));
    }

    pub(super) fn take(request: u64) -> bool {
        REMAINING.with(|r| match r.get() {
            None => true,
            Some(left) if left >= request => {
                r.set(Some(left - request));
                true
            }
            Some(_) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounded_length() {
        assert_eq!(rounded_length(0), 0);
        assert_eq!(rounded_length(1), SEGMENT_SIZE);
        assert_eq!(rounded_length(SEGMENT_SIZE), SEGMENT_SIZE);
        assert_eq!(rounded_length(SEGMENT_SIZE + 1), 2 * SEGMENT_SIZE);
    }

    #[test]
    fn test_single_segment_until_boundary() {
        let mut buf = SegmentedBuffer::default();
        buf.set_length(SEGMENT_SIZE).unwrap();
        assert_eq!(buf.segment_count(), 1);
        // One byte past the boundary promotes to the multi-segment form.
        buf.set_length(SEGMENT_SIZE + 1).unwrap();
        assert_eq!(buf.segment_count(), 2);
        assert_eq!(buf.len(), SEGMENT_SIZE + 1);
    }

    #[test]
    fn test_read_back_across_boundary() {
        let mut buf = SegmentedBuffer::default();
        buf.set_length(2 * SEGMENT_SIZE).unwrap();
        let pattern: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let offset = SEGMENT_SIZE - 1000;
        buf.write(offset, &pattern);

        let mut out = vec![0u8; pattern.len()];
        buf.read(offset, &mut out);
        assert_eq!(out, pattern);
    }

    #[test]
    fn test_new_bytes_are_zero() {
        let mut buf = SegmentedBuffer::default();
        buf.set_length(100).unwrap();
        buf.write(0, &[0xFF; 100]);
        buf.set_length(10).unwrap();
        buf.set_length(100).unwrap();
        let mut out = [1u8; 90];
        buf.read(10, &mut out);
        assert_eq!(out, [0u8; 90]);
    }

    #[test]
    fn test_shrink_releases_segments() {
        let mut buf = SegmentedBuffer::default();
        buf.set_length(3 * SEGMENT_SIZE + 5).unwrap();
        assert_eq!(buf.segment_count(), 4);
        buf.set_length(SEGMENT_SIZE + 1).unwrap();
        assert_eq!(buf.segment_count(), 2);
        assert_eq!(buf.len(), SEGMENT_SIZE + 1);
        buf.set_length(0).unwrap();
        assert_eq!(buf.segment_count(), 0);
    }

    #[test]
    fn test_partial_grow_keeps_acquired_length() {
        let mut buf = SegmentedBuffer::default();
        // Allow one full segment, then fail.
        alloc_failpoint::arm(SEGMENT_SIZE);
        let result = buf.set_length(2 * SEGMENT_SIZE);
        alloc_failpoint::disarm();

        assert_eq!(result, Err(FsError::OutOfMemory));
        assert_eq!(buf.len(), SEGMENT_SIZE);
        assert_eq!(buf.segment_count(), 1);
        // The partial buffer is fully usable.
        buf.write(0, &[7u8; 16]);
        let mut out = [0u8; 16];
        buf.read(0, &mut out);
        assert_eq!(out, [7u8; 16]);
    }
}
