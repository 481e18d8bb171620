//! Lock-free SPSC ring queue for edges crossing a thread boundary.
//!
//! Same contract and cursor algorithm as [`RingQueue`](crate::ring::RingQueue).
//! The producer only stores `write`/`wrap`, the consumer only stores `read`.
//! Every store is `Release` and every load `Acquire`, so a committed batch is
//! visible to the consumer before the cursor that covers it, and released
//! slots are free before the producer can claim them.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::error::Result;
use crate::memory::ArenaRegion;
use crate::queue::{
    Cursors, QueueReader, QueueState, QueueWriter, ReadView, ReadWindow, WriteWindow,
    FLAG_CLOSED, QUEUE_COOKIE,
};
use crate::ring::check_geometry;

#[derive(Debug)]
struct Shared {
    read: CachePadded<AtomicUsize>,
    write: CachePadded<AtomicUsize>,
    wrap: CachePadded<AtomicUsize>,
    flags: AtomicU16,
    cookie: u16,
    depth: usize,
    width: usize,
    data: ArenaRegion,
}

impl Shared {
    fn snapshot(&self) -> Cursors {
        // `write` before `wrap`: a wrapped commit publishes `wrap` first.
        let write = self.write.load(Ordering::Acquire);
        let wrap = self.wrap.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        Cursors { read, write, wrap }
    }

    fn is_closed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_CLOSED != 0
    }

    fn close(&self) {
        self.flags.fetch_or(FLAG_CLOSED, Ordering::AcqRel);
    }

    fn is_valid(&self) -> bool {
        self.cookie == QUEUE_COOKIE
            && self
                .depth
                .checked_mul(self.width)
                .is_some_and(|size| self.data.len() >= size)
    }

    fn commit_write(&self, window: &WriteWindow, count: usize) {
        let cursors = self.snapshot();
        let (write, wrap) = cursors.committed(window, count);
        if wrap != cursors.wrap {
            self.wrap.store(wrap, Ordering::Release);
        }
        self.write.store(write, Ordering::Release);
    }

    fn set_read(&self, read: usize) {
        self.read.store(read, Ordering::Release);
    }

    /// # Safety
    ///
    /// Only the producer may call this, for a window it reserved.
    #[allow(clippy::mut_from_ref)]
    unsafe fn window_mut(&self, window: &WriteWindow) -> &mut [u8] {
        // SAFETY: reserved windows never overlap unread data.
        unsafe {
            self.data
                .slice_mut_unchecked(window.start * self.width, window.count * self.width)
        }
    }

    /// # Safety
    ///
    /// Only the consumer may call this, for a window it reserved.
    unsafe fn view(&self, window: &ReadWindow) -> ReadView<'_> {
        let w = self.width;
        // SAFETY: reserved read windows cover committed data the producer
        // cannot touch until `read` moves past it.
        let (first, second) = unsafe {
            (
                self.data
                    .slice_unchecked(window.first.start * w, window.first.len() * w),
                self.data
                    .slice_unchecked(window.second.start * w, window.second.len() * w),
            )
        };
        ReadView::new(first, second, w)
    }
}

/// Cross-thread ring queue holding both endpoints.
///
/// Use it directly when producer and consumer share a thread, or [`split`]
/// it to move the endpoints to different threads.
///
/// [`split`]: AtomicRingQueue::split
#[derive(Debug)]
pub struct AtomicRingQueue {
    producer: RingProducer,
    consumer: RingConsumer,
}

impl AtomicRingQueue {
    /// Create a queue with a buffer of its own.
    pub fn new(depth: usize, width: usize) -> Result<Self> {
        let len = depth.checked_mul(width).unwrap_or(usize::MAX);
        check_geometry(depth, width, len)?;
        Self::with_region(depth, width, ArenaRegion::standalone(len)?)
    }

    /// Create a queue over an existing region.
    pub fn with_region(depth: usize, width: usize, data: ArenaRegion) -> Result<Self> {
        check_geometry(depth, width, data.len())?;
        let shared = Arc::new(Shared {
            read: CachePadded::new(AtomicUsize::new(0)),
            write: CachePadded::new(AtomicUsize::new(0)),
            wrap: CachePadded::new(AtomicUsize::new(0)),
            flags: AtomicU16::new(0),
            cookie: QUEUE_COOKIE,
            depth,
            width,
            data,
        });

        Ok(Self {
            producer: RingProducer {
                shared: Arc::clone(&shared),
                pending: None,
            },
            consumer: RingConsumer {
                shared,
                pending: ReadWindow::default(),
            },
        })
    }

    /// Split into producer and consumer endpoints.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (self.producer, self.consumer)
    }

    /// Get a snapshot of the cursors.
    pub fn cursors(&self) -> Cursors {
        self.producer.shared.snapshot()
    }
}

/// Producer endpoint of an [`AtomicRingQueue`].
#[derive(Debug)]
pub struct RingProducer {
    shared: Arc<Shared>,
    pending: Option<WriteWindow>,
}

/// Consumer endpoint of an [`AtomicRingQueue`].
#[derive(Debug)]
pub struct RingConsumer {
    shared: Arc<Shared>,
    pending: ReadWindow,
}

macro_rules! impl_endpoint_state {
    ($($ty:ty),*) => {
        $(
            impl QueueState for $ty {
                fn depth(&self) -> usize {
                    self.shared.depth
                }

                fn width(&self) -> usize {
                    self.shared.width
                }

                fn used(&self) -> usize {
                    self.shared.snapshot().used()
                }

                fn free(&self) -> usize {
                    self.shared.snapshot().free(self.shared.depth)
                }

                fn is_closed(&self) -> bool {
                    self.shared.is_closed()
                }

                fn close(&mut self) {
                    self.shared.close();
                }

                fn is_valid(&self) -> bool {
                    self.shared.is_valid()
                }
            }
        )*
    };
}

impl_endpoint_state!(RingProducer, RingConsumer);

impl QueueWriter for RingProducer {
    fn start_write_offset(&mut self, count: usize) -> Option<usize> {
        let window = self.shared.snapshot().write_window(self.shared.depth, count)?;
        self.pending = Some(window);
        Some(window.start)
    }

    fn reserved_mut(&mut self) -> &mut [u8] {
        match self.pending {
            // SAFETY: we are the only producer and own this reservation.
            Some(window) => unsafe { self.shared.window_mut(&window) },
            None => &mut [],
        }
    }

    fn finish_write(&mut self, count: usize) {
        let Some(window) = self.pending.take() else {
            debug_assert_eq!(count, 0, "finish_write without a reservation");
            return;
        };
        debug_assert!(count <= window.count);
        if count > 0 {
            self.shared.commit_write(&window, count);
        }
    }
}

impl QueueReader for RingConsumer {
    fn start_read_offset(&mut self) -> (usize, usize) {
        let cursors = self.shared.snapshot();
        let (read, run) = cursors.read_run();
        if read != cursors.read {
            self.shared.set_read(read);
        }
        let offset = run.start;
        let count = run.len();
        self.pending = ReadWindow {
            first: run,
            second: 0..0,
        };
        (offset, count)
    }

    fn start_read_exact(&mut self, count: usize) -> bool {
        let cursors = self.shared.snapshot();
        match cursors.read_exact(count) {
            Some((read, window)) => {
                if read != cursors.read {
                    self.shared.set_read(read);
                }
                self.pending = window;
                true
            }
            None => {
                self.pending = ReadWindow::default();
                false
            }
        }
    }

    fn reserved(&self) -> ReadView<'_> {
        // SAFETY: we are the only consumer and own this reservation.
        unsafe { self.shared.view(&self.pending) }
    }

    fn finish_read(&mut self, count: usize) {
        debug_assert!(count <= self.pending.len());
        let read = self.shared.snapshot().advanced_read(count);
        self.shared.set_read(read);
        self.pending = ReadWindow::default();
    }
}

impl QueueState for AtomicRingQueue {
    fn depth(&self) -> usize {
        self.producer.depth()
    }

    fn width(&self) -> usize {
        self.producer.width()
    }

    fn used(&self) -> usize {
        self.producer.used()
    }

    fn free(&self) -> usize {
        self.producer.free()
    }

    fn is_closed(&self) -> bool {
        self.producer.is_closed()
    }

    fn close(&mut self) {
        self.producer.close();
    }

    fn is_valid(&self) -> bool {
        self.producer.is_valid()
    }
}

impl QueueWriter for AtomicRingQueue {
    fn start_write_offset(&mut self, count: usize) -> Option<usize> {
        self.producer.start_write_offset(count)
    }

    fn reserved_mut(&mut self) -> &mut [u8] {
        self.producer.reserved_mut()
    }

    fn finish_write(&mut self, count: usize) {
        self.producer.finish_write(count)
    }
}

impl QueueReader for AtomicRingQueue {
    fn start_read_offset(&mut self) -> (usize, usize) {
        self.consumer.start_read_offset()
    }

    fn start_read_exact(&mut self, count: usize) -> bool {
        self.consumer.start_read_exact(count)
    }

    fn reserved(&self) -> ReadView<'_> {
        self.consumer.reserved()
    }

    fn finish_read(&mut self, count: usize) {
        self.consumer.finish_read(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::thread;

    #[test]
    fn test_same_thread_fifo() {
        let mut q = AtomicRingQueue::new(8, 1).unwrap();
        assert!(q.is_valid());

        let buf = q.start_write(6).unwrap();
        buf.copy_from_slice(&[0, 1, 2, 3, 4, 5]);
        q.finish_write(6);

        assert!(q.start_read_exact(5));
        q.finish_read(5);

        assert_eq!(q.start_write_offset(3), Some(0));
        q.reserved_mut().copy_from_slice(&[6, 7, 8]);
        q.finish_write(3);
        assert_eq!(q.used(), 4);

        let c = q.cursors();
        assert_eq!((c.read, c.write, c.wrap), (5, 3, 6));

        assert!(q.start_read_exact(4));
        assert_eq!(q.reserved().to_vec(), vec![5, 6, 7, 8]);
        q.finish_read(4);
        assert!(q.is_empty());
    }

    #[test]
    fn test_split_close_seen_by_both() {
        let (mut tx, rx) = AtomicRingQueue::new(4, 8).unwrap().split();
        assert!(!rx.is_closed());
        tx.close();
        assert!(rx.is_closed());
        assert!(tx.is_closed());
    }

    #[test]
    fn test_randomized_spsc_threads() {
        const DEPTH: usize = 64;
        const WIDTH: usize = 8;
        const TOTAL: u64 = 100_000;

        let (mut tx, mut rx) = AtomicRingQueue::new(DEPTH, WIDTH).unwrap().split();

        let producer = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let mut next = 0u64;
            while next < TOTAL {
                let batch = rng.gen_range(1..=DEPTH / 2).min((TOTAL - next) as usize);
                let buf = tx.start_blocking_write(batch).unwrap();
                for chunk in buf.chunks_exact_mut(WIDTH) {
                    chunk.copy_from_slice(&next.to_le_bytes());
                    next += 1;
                }
                tx.finish_write(batch);
            }
            tx.close();
        });

        let consumer = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xfeed);
            let mut expect = 0u64;
            loop {
                let want = rng.gen_range(1..=DEPTH / 2);
                if rx.ready(want, false) {
                    assert!(rx.start_read_exact(want));
                    for value in rx.reserved().iter() {
                        let tag = u64::from_le_bytes(value.try_into().unwrap());
                        assert_eq!(tag, expect);
                        expect += 1;
                    }
                    rx.finish_read(want);
                    continue;
                }

                let Some(view) = rx.start_blocking_read() else {
                    break;
                };
                let n = view.len();
                for value in view.iter() {
                    let tag = u64::from_le_bytes(value.try_into().unwrap());
                    assert_eq!(tag, expect);
                    expect += 1;
                }
                rx.finish_read(n);
                assert!(rx.used() + rx.free() <= DEPTH - 1);
            }
            expect
        });

        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), TOTAL);
    }
}
