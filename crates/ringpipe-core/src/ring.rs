//! Single-threaded ring queue.

use crate::error::{Result, RingPipeError};
use crate::memory::ArenaRegion;
use crate::queue::{
    Cursors, QueueReader, QueueState, QueueWriter, ReadView, ReadWindow, WriteWindow,
    FLAG_CLOSED, QUEUE_COOKIE,
};

/// Check queue geometry against its backing region.
pub(crate) fn check_geometry(depth: usize, width: usize, region_len: usize) -> Result<()> {
    if depth < 2 {
        return Err(RingPipeError::InvalidConfig(format!(
            "queue depth must be at least 2, got {depth}"
        )));
    }
    if width == 0 {
        return Err(RingPipeError::InvalidConfig(
            "queue element width must be non-zero".to_string(),
        ));
    }
    let size = depth.checked_mul(width).ok_or_else(|| {
        RingPipeError::InvalidConfig(format!("queue of {depth} x {width} bytes overflows"))
    })?;
    if region_len < size {
        return Err(RingPipeError::InvalidConfig(format!(
            "queue needs {size} bytes, region has {region_len}"
        )));
    }
    Ok(())
}

/// Fixed-capacity ring of `width`-byte elements for use on one thread.
///
/// Reservations are contiguous: a write that does not fit before the end of
/// the buffer is relocated to offset 0. See [`crate::queue`] for the cursor
/// layout.
#[derive(Debug)]
pub struct RingQueue {
    data: ArenaRegion,
    depth: usize,
    width: usize,
    cursors: Cursors,
    pending_write: Option<WriteWindow>,
    pending_read: ReadWindow,
    flags: u16,
    cookie: u16,
}

impl RingQueue {
    /// Create a queue with a buffer of its own.
    pub fn new(depth: usize, width: usize) -> Result<Self> {
        let len = depth.checked_mul(width).unwrap_or(usize::MAX);
        check_geometry(depth, width, len)?;
        Self::with_region(depth, width, ArenaRegion::standalone(len)?)
    }

    /// Create a queue over a region carved out of a segment arena.
    pub fn with_region(depth: usize, width: usize, data: ArenaRegion) -> Result<Self> {
        check_geometry(depth, width, data.len())?;
        Ok(Self {
            data,
            depth,
            width,
            cursors: Cursors::default(),
            pending_write: None,
            pending_read: ReadWindow::default(),
            flags: 0,
            cookie: QUEUE_COOKIE,
        })
    }

    /// Get a snapshot of the cursors.
    pub fn cursors(&self) -> Cursors {
        self.cursors
    }

    /// Get the backing region.
    pub fn region(&self) -> &ArenaRegion {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn clobber_cookie(&mut self) {
        self.cookie = !QUEUE_COOKIE;
    }

    fn bytes(&self, elements: std::ops::Range<usize>) -> std::ops::Range<usize> {
        elements.start * self.width..elements.end * self.width
    }
}

impl QueueState for RingQueue {
    fn depth(&self) -> usize {
        self.depth
    }

    fn width(&self) -> usize {
        self.width
    }

    fn used(&self) -> usize {
        self.cursors.used()
    }

    fn free(&self) -> usize {
        self.cursors.free(self.depth)
    }

    fn is_closed(&self) -> bool {
        self.flags & FLAG_CLOSED != 0
    }

    fn close(&mut self) {
        self.flags |= FLAG_CLOSED;
    }

    fn is_valid(&self) -> bool {
        self.cookie == QUEUE_COOKIE
            && self
                .depth
                .checked_mul(self.width)
                .is_some_and(|size| self.data.len() >= size)
    }
}

impl QueueWriter for RingQueue {
    fn start_write_offset(&mut self, count: usize) -> Option<usize> {
        let window = self.cursors.write_window(self.depth, count)?;
        self.pending_write = Some(window);
        Some(window.start)
    }

    fn reserved_mut(&mut self) -> &mut [u8] {
        match self.pending_write {
            Some(window) => {
                let range = self.bytes(window.range());
                &mut self.data.as_mut_slice()[range]
            }
            None => &mut [],
        }
    }

    fn finish_write(&mut self, count: usize) {
        let Some(window) = self.pending_write.take() else {
            debug_assert_eq!(count, 0, "finish_write without a reservation");
            return;
        };
        debug_assert!(count <= window.count);
        if count == 0 {
            return;
        }

        let (write, wrap) = self.cursors.committed(&window, count);
        self.cursors.wrap = wrap;
        self.cursors.write = write;
    }
}

impl QueueReader for RingQueue {
    fn start_read_offset(&mut self) -> (usize, usize) {
        let (read, run) = self.cursors.read_run();
        self.cursors.read = read;
        let offset = run.start;
        let count = run.len();
        self.pending_read = ReadWindow {
            first: run,
            second: 0..0,
        };
        (offset, count)
    }

    fn start_read_exact(&mut self, count: usize) -> bool {
        match self.cursors.read_exact(count) {
            Some((read, window)) => {
                self.cursors.read = read;
                self.pending_read = window;
                true
            }
            None => {
                self.pending_read = ReadWindow::default();
                false
            }
        }
    }

    fn reserved(&self) -> ReadView<'_> {
        let data = self.data.as_slice();
        ReadView::new(
            &data[self.bytes(self.pending_read.first.clone())],
            &data[self.bytes(self.pending_read.second.clone())],
            self.width,
        )
    }

    fn finish_read(&mut self, count: usize) {
        debug_assert!(count <= self.pending_read.len());
        self.cursors.read = self.cursors.advanced_read(count);
        self.pending_read = ReadWindow::default();
    }
}
