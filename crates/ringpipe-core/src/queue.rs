//! Queue contract shared by the single-threaded and atomic ring buffers.
//!
//! Both variants use the same cursor layout: `read` is owned by the consumer,
//! `write` and `wrap` by the producer. Instead of a modulo ring, a write
//! that does not fit before the physical end of the buffer is relocated to
//! offset 0 and `wrap` records where the valid data before it ends. That way
//! every reservation is one contiguous region and no batch is ever split
//! across the end of the buffer.
//!
//! Valid data is `[read, write)` while `read <= write`, otherwise
//! `[read, wrap) ∪ [0, write)`. One element is always kept free so that a
//! full ring can be told apart from an empty one.

use std::ops::Range;

use crossbeam_utils::Backoff;

/// Sentinel stored in every live queue.
pub const QUEUE_COOKIE: u16 = 0x1337;

/// Flag bit set once a queue has been closed.
pub const FLAG_CLOSED: u16 = 1 << 0;

/// Snapshot of the three ring cursors, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursors {
    /// Next element to read.
    pub read: usize,
    /// Next element to write.
    pub write: usize,
    /// End of valid data before the wrap point.
    pub wrap: usize,
}

/// A contiguous region reserved for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteWindow {
    /// First element of the region.
    pub start: usize,
    /// Number of elements reserved.
    pub count: usize,
    /// Whether the region was relocated to offset 0.
    pub wraps: bool,
}

impl WriteWindow {
    /// Get the reserved elements as a range.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.count
    }
}

/// Up to two element ranges reserved for reading.
///
/// `second` is only non-empty when the reservation spans the wrap point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadWindow {
    /// Run starting at the read cursor.
    pub first: Range<usize>,
    /// Continuation from offset 0.
    pub second: Range<usize>,
}

impl ReadWindow {
    /// Get number of reserved elements.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Check if nothing is reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cursors {
    /// Elements currently readable.
    #[inline]
    pub fn used(&self) -> usize {
        if self.read <= self.write {
            self.write - self.read
        } else {
            (self.wrap - self.read) + self.write
        }
    }

    /// Largest single contiguous writable region.
    #[inline]
    pub fn free(&self, depth: usize) -> usize {
        let contiguous = if self.read <= self.write {
            (depth - self.write).max(self.read.saturating_sub(1))
        } else {
            self.read - self.write - 1
        };
        contiguous.min(depth - 1 - self.used())
    }

    /// Locate a contiguous region of `count` elements, if one exists.
    pub fn write_window(&self, depth: usize, count: usize) -> Option<WriteWindow> {
        if count == 0 || count > depth - 1 || self.used() + count > depth - 1 {
            return None;
        }

        if self.read <= self.write {
            if self.write + count <= depth {
                Some(WriteWindow {
                    start: self.write,
                    count,
                    wraps: false,
                })
            } else if count < self.read {
                // Relocate to the front; must stay strictly before unread data.
                Some(WriteWindow {
                    start: 0,
                    count,
                    wraps: true,
                })
            } else {
                None
            }
        } else if self.write + count < self.read {
            Some(WriteWindow {
                start: self.write,
                count,
                wraps: false,
            })
        } else {
            None
        }
    }

    /// Producer cursors after committing `count` elements of `window`.
    ///
    /// Returns `(write, wrap)`.
    pub fn committed(&self, window: &WriteWindow, count: usize) -> (usize, usize) {
        if window.wraps {
            (count, self.write)
        } else {
            let write = window.start + count;
            (write, self.wrap.max(write))
        }
    }

    /// Contiguous readable run as `(read, run)`.
    ///
    /// `read` is the (possibly reset) read cursor the run starts at.
    pub fn read_run(&self) -> (usize, Range<usize>) {
        let mut read = self.read;
        if read > self.write && read == self.wrap {
            // Wrapped tail fully drained, continue from the front.
            read = 0;
        }

        if read <= self.write {
            (read, read..self.write)
        } else {
            (read, read..self.wrap)
        }
    }

    /// Exactly `count` elements, spanning the wrap point when needed.
    ///
    /// Returns the (possibly reset) read cursor and the window.
    pub fn read_exact(&self, count: usize) -> Option<(usize, ReadWindow)> {
        if self.used() < count {
            return None;
        }

        let (read, run) = self.read_run();
        if run.len() >= count {
            return Some((
                read,
                ReadWindow {
                    first: run.start..run.start + count,
                    second: 0..0,
                },
            ));
        }

        let rest = count - run.len();
        Some((
            read,
            ReadWindow {
                first: run,
                second: 0..rest,
            },
        ))
    }

    /// Read cursor after consuming `count` elements.
    pub fn advanced_read(&self, count: usize) -> usize {
        if self.read <= self.write {
            debug_assert!(self.read + count <= self.write);
            self.read + count
        } else {
            let tail = self.wrap - self.read;
            if count < tail {
                self.read + count
            } else {
                count - tail
            }
        }
    }
}

/// Borrowed view of reserved elements, possibly in two pieces.
#[derive(Debug, Clone, Copy)]
pub struct ReadView<'a> {
    first: &'a [u8],
    second: &'a [u8],
    width: usize,
}

impl<'a> ReadView<'a> {
    /// Create a view over one or two byte runs of `width`-byte elements.
    pub fn new(first: &'a [u8], second: &'a [u8], width: usize) -> Self {
        debug_assert!(width > 0);
        debug_assert_eq!(first.len() % width, 0);
        debug_assert_eq!(second.len() % width, 0);
        Self {
            first,
            second,
            width,
        }
    }

    /// An empty view.
    pub fn empty(width: usize) -> Self {
        Self::new(&[], &[], width)
    }

    /// Get number of elements.
    pub fn len(&self) -> usize {
        (self.first.len() + self.second.len()) / self.width
    }

    /// Check if the view holds no element.
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty()
    }

    /// Get bytes per element.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Get the two underlying byte runs.
    pub fn as_slices(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    /// Get the bytes as one slice if the view does not span the wrap point.
    pub fn as_contiguous(&self) -> Option<&'a [u8]> {
        self.second.is_empty().then_some(self.first)
    }

    /// Get element `index`.
    pub fn get(&self, index: usize) -> Option<&'a [u8]> {
        let offset = index.checked_mul(self.width)?;
        if offset < self.first.len() {
            Some(&self.first[offset..offset + self.width])
        } else {
            let offset = offset - self.first.len();
            self.second.get(offset..offset.checked_add(self.width)?)
        }
    }

    /// Iterate over elements in FIFO order.
    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.first
            .chunks_exact(self.width)
            .chain(self.second.chunks_exact(self.width))
    }

    /// Copy all elements into `dst`, which must be exactly as long as the view.
    pub fn copy_to_slice(&self, dst: &mut [u8]) {
        let (head, tail) = dst.split_at_mut(self.first.len());
        head.copy_from_slice(self.first);
        tail.copy_from_slice(self.second);
    }

    /// Copy all elements into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.first.len() + self.second.len());
        out.extend_from_slice(self.first);
        out.extend_from_slice(self.second);
        out
    }
}

/// State shared by both ends of a queue.
pub trait QueueState {
    /// Capacity in elements, including the slot kept free.
    fn depth(&self) -> usize;

    /// Bytes per element.
    fn width(&self) -> usize;

    /// Elements currently readable.
    fn used(&self) -> usize;

    /// Largest contiguous writable region, in elements.
    fn free(&self) -> usize;

    /// Check if the queue was closed.
    fn is_closed(&self) -> bool;

    /// Close the queue. Both ends observe it.
    fn close(&mut self);

    /// Check the cookie and buffer size.
    fn is_valid(&self) -> bool;

    /// Check if nothing is readable.
    fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Total buffer size in bytes.
    fn size_bytes(&self) -> usize {
        self.depth() * self.width()
    }

    /// Rate-level admission check.
    ///
    /// Writing: `used + change <= depth - 1` and `change` fits in one
    /// reservation, so an admitted write never fails. Reading:
    /// `used >= change`. A change larger than `depth - 1` never fits.
    fn ready(&self, change: usize, writing: bool) -> bool {
        let depth = self.depth();
        if change > depth.saturating_sub(1) {
            return false;
        }
        if writing {
            self.used() + change <= depth - 1 && change <= self.free()
        } else {
            self.used() >= change
        }
    }
}

/// Producer side of a queue.
pub trait QueueWriter: QueueState {
    /// Reserve `count` contiguous elements, returning the first element offset.
    ///
    /// Fails without side effects when the region does not fit.
    fn start_write_offset(&mut self, count: usize) -> Option<usize>;

    /// Bytes of the current reservation; empty when nothing is reserved.
    fn reserved_mut(&mut self) -> &mut [u8];

    /// Commit `count` elements of the current reservation.
    fn finish_write(&mut self, count: usize);

    /// Reserve `count` contiguous elements for writing.
    fn start_write(&mut self, count: usize) -> Option<&mut [u8]> {
        self.start_write_offset(count)?;
        Some(self.reserved_mut())
    }

    /// Reserve `count` elements, yielding until room appears.
    ///
    /// Returns `None` once the queue is closed, or when `count` can never fit.
    fn start_blocking_write(&mut self, count: usize) -> Option<&mut [u8]> {
        if count == 0 || count > self.depth().saturating_sub(1) {
            return None;
        }

        let backoff = Backoff::new();
        loop {
            if self.is_closed() {
                return None;
            }
            if self.start_write_offset(count).is_some() {
                return Some(self.reserved_mut());
            }
            backoff.snooze();
        }
    }
}

/// Consumer side of a queue.
pub trait QueueReader: QueueState {
    /// Reserve the contiguous readable run, returning `(offset, count)`.
    fn start_read_offset(&mut self) -> (usize, usize);

    /// Reserve exactly `count` elements, possibly across the wrap point.
    fn start_read_exact(&mut self, count: usize) -> bool;

    /// View of the current reservation.
    fn reserved(&self) -> ReadView<'_>;

    /// Release `count` reserved elements back to the producer.
    fn finish_read(&mut self, count: usize);

    /// Reserve the contiguous readable run; empty when nothing is available.
    fn start_read(&mut self) -> ReadView<'_> {
        self.start_read_offset();
        self.reserved()
    }

    /// Reserve the readable run, yielding until data appears.
    ///
    /// Returns `None` once the queue is closed and drained.
    fn start_blocking_read(&mut self) -> Option<ReadView<'_>> {
        let backoff = Backoff::new();
        loop {
            let (_, count) = self.start_read_offset();
            if count > 0 {
                break;
            }
            if self.is_closed() {
                // A batch committed just before the close may have been missed.
                if self.start_read_offset().1 == 0 {
                    return None;
                }
                break;
            }
            backoff.snooze();
        }
        Some(self.reserved())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursors(read: usize, write: usize, wrap: usize) -> Cursors {
        Cursors { read, write, wrap }
    }

    #[test]
    fn test_used_and_free_linear() {
        let c = cursors(2, 5, 5);
        assert_eq!(c.used(), 3);
        // max(8 - 5, 2 - 1) capped by 8 - 1 - 3
        assert_eq!(c.free(8), 3);

        let empty = cursors(0, 0, 0);
        assert_eq!(empty.used(), 0);
        assert_eq!(empty.free(8), 7);
    }

    #[test]
    fn test_used_and_free_wrapped() {
        // [6, 7) ∪ [0, 2)
        let c = cursors(6, 2, 7);
        assert_eq!(c.used(), 3);
        assert_eq!(c.free(8), 3);
    }

    #[test]
    fn test_write_window_relocates() {
        let c = cursors(5, 6, 6);
        let window = c.write_window(8, 3).unwrap();
        assert!(window.wraps);
        assert_eq!(window.range(), 0..3);
        assert_eq!(c.committed(&window, 3), (3, 6));
    }

    #[test]
    fn test_write_window_rejects_overlap() {
        // Would need [0, 3) but unread data starts at 2.
        assert!(cursors(2, 6, 6).write_window(8, 3).is_none());
        // Wrapped: [3, 5) would touch the gap before read = 5.
        assert!(cursors(5, 3, 6).write_window(8, 2).is_none());
        assert_eq!(cursors(5, 3, 6).write_window(8, 1).unwrap().start, 3);
        // Never more than depth - 1.
        assert!(cursors(0, 0, 0).write_window(8, 8).is_none());
        assert!(cursors(0, 0, 0).write_window(8, 0).is_none());
    }

    #[test]
    fn test_read_run_resets_drained_tail() {
        let c = cursors(6, 3, 6);
        assert_eq!(c.read_run(), (0, 0..3));

        let c = cursors(4, 3, 6);
        assert_eq!(c.read_run(), (4, 4..6));
    }

    #[test]
    fn test_read_exact_spans_wrap() {
        let c = cursors(7, 2, 8);
        let (read, window) = c.read_exact(3).unwrap();
        assert_eq!(read, 7);
        assert_eq!(window.first, 7..8);
        assert_eq!(window.second, 0..2);
        assert!(c.read_exact(4).is_none());

        assert_eq!(c.advanced_read(1), 0);
        assert_eq!(c.advanced_read(3), 2);
    }

    #[test]
    fn test_ready_rejects_oversized() {
        struct Fixed(Cursors);
        impl QueueState for Fixed {
            fn depth(&self) -> usize {
                8
            }
            fn width(&self) -> usize {
                1
            }
            fn used(&self) -> usize {
                self.0.used()
            }
            fn free(&self) -> usize {
                self.0.free(8)
            }
            fn is_closed(&self) -> bool {
                false
            }
            fn close(&mut self) {}
            fn is_valid(&self) -> bool {
                true
            }
        }

        let q = Fixed(cursors(0, 0, 0));
        assert!(q.ready(7, true));
        assert!(!q.ready(8, true));
        assert!(!q.ready(9, false));
        assert!(q.ready(0, false));

        // Plenty of total room, but no contiguous region of 3.
        let q = Fixed(cursors(2, 6, 6));
        assert_eq!(q.used() + 3, 7);
        assert!(!q.ready(3, true));
    }

    #[test]
    fn test_read_view_pieces() {
        let first = [1u8, 1, 2, 2];
        let second = [3u8, 3];
        let view = ReadView::new(&first, &second, 2);

        assert_eq!(view.len(), 3);
        assert_eq!(view.get(1), Some(&[2u8, 2][..]));
        assert_eq!(view.get(2), Some(&[3u8, 3][..]));
        assert_eq!(view.get(3), None);
        assert_eq!(view.get(usize::MAX), None);
        assert_eq!(view.get(usize::MAX / 2 + 1), None);
        assert!(view.as_contiguous().is_none());
        assert_eq!(view.iter().count(), 3);
        assert_eq!(view.to_vec(), vec![1, 1, 2, 2, 3, 3]);

        let mut dst = [0u8; 6];
        view.copy_to_slice(&mut dst);
        assert_eq!(dst, [1, 1, 2, 2, 3, 3]);
    }
}
