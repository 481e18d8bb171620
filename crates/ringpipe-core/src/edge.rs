//! Edges: one queue between two kernels.

use tracing::warn;

use crate::atomic::{AtomicRingQueue, RingConsumer, RingProducer};
use crate::error::{Result, RingPipeError};
use crate::memory::ArenaRegion;
use crate::queue::{QueueReader, QueueState, QueueWriter, ReadView};
use crate::ring::RingQueue;
use crate::types::{EdgeId, KernelId};

/// Queue variant backing an edge.
#[derive(Debug)]
pub enum EdgeQueue {
    /// Producer and consumer run on the same thread.
    Local(RingQueue),
    /// Producer and consumer may run on different threads.
    Shared(AtomicRingQueue),
}

/// A fixed-capacity queue connecting `source` to `dest`.
///
/// The kernel ids are topology only; an edge never calls into a kernel.
#[derive(Debug)]
pub struct Edge {
    id: EdgeId,
    source: KernelId,
    dest: KernelId,
    queue: EdgeQueue,
}

macro_rules! dispatch {
    (mut $self:ident, $q:ident => $body:expr) => {
        match &mut $self.queue {
            EdgeQueue::Local($q) => $body,
            EdgeQueue::Shared($q) => $body,
        }
    };
    ($self:ident, $q:ident => $body:expr) => {
        match &$self.queue {
            EdgeQueue::Local($q) => $body,
            EdgeQueue::Shared($q) => $body,
        }
    };
}

impl Edge {
    /// Create an edge with a buffer of its own.
    pub fn new(
        id: EdgeId,
        source: KernelId,
        dest: KernelId,
        depth: usize,
        width: usize,
        cross_thread: bool,
    ) -> Result<Self> {
        let queue = if cross_thread {
            EdgeQueue::Shared(AtomicRingQueue::new(depth, width)?)
        } else {
            EdgeQueue::Local(RingQueue::new(depth, width)?)
        };
        Ok(Self {
            id,
            source,
            dest,
            queue,
        })
    }

    /// Create an edge whose buffer lives in a segment arena.
    pub fn with_region(
        id: EdgeId,
        source: KernelId,
        dest: KernelId,
        depth: usize,
        width: usize,
        cross_thread: bool,
        region: ArenaRegion,
    ) -> Result<Self> {
        let queue = if cross_thread {
            EdgeQueue::Shared(AtomicRingQueue::with_region(depth, width, region)?)
        } else {
            EdgeQueue::Local(RingQueue::with_region(depth, width, region)?)
        };
        Ok(Self {
            id,
            source,
            dest,
            queue,
        })
    }

    /// Create an edge between two segments.
    ///
    /// Boundary edges are always backed by an [`AtomicRingQueue`]; a
    /// descriptor that did not ask for it is promoted.
    pub fn boundary(
        id: EdgeId,
        source: KernelId,
        dest: KernelId,
        depth: usize,
        width: usize,
        cross_thread: bool,
    ) -> Result<Self> {
        if !cross_thread {
            warn!(
                edge = %id,
                %source,
                %dest,
                "boundary edge is not cross_thread, using atomic queue"
            );
        }
        Self::new(id, source, dest, depth, width, true)
    }

    /// Get the edge id.
    pub fn id(&self) -> EdgeId {
        self.id
    }

    /// Get the producing kernel.
    pub fn source(&self) -> KernelId {
        self.source
    }

    /// Get the consuming kernel.
    pub fn dest(&self) -> KernelId {
        self.dest
    }

    /// Check if the edge is backed by an atomic queue.
    pub fn is_cross_thread(&self) -> bool {
        matches!(self.queue, EdgeQueue::Shared(_))
    }

    /// Get the underlying queue.
    pub fn queue(&self) -> &EdgeQueue {
        &self.queue
    }

    #[cfg(test)]
    pub(crate) fn clobber_cookie(&mut self) {
        if let EdgeQueue::Local(q) = &mut self.queue {
            q.clobber_cookie();
        }
    }

    /// Buffer size in bytes.
    pub fn get_size(&self) -> usize {
        self.size_bytes()
    }

    /// Largest contiguous writable region, in elements.
    pub fn get_free(&self) -> usize {
        self.free()
    }

    /// Readable elements.
    pub fn get_available(&self) -> usize {
        self.used()
    }

    /// Reserve one element for writing.
    pub fn allocate(&mut self) -> Option<&mut [u8]> {
        self.start_write(1)
    }

    /// Commit the element reserved by [`allocate`](Self::allocate).
    pub fn send(&mut self) {
        self.finish_write(1);
    }

    /// Peek at the oldest element.
    pub fn read_value(&mut self) -> Option<&[u8]> {
        if !self.start_read_exact(1) {
            return None;
        }
        self.reserved().get(0)
    }

    /// Consume the element returned by [`read_value`](Self::read_value).
    pub fn release(&mut self) {
        self.finish_read(1);
    }

    /// Split a cross-thread edge into its producer and consumer endpoints.
    pub fn split(self) -> Result<(RingProducer, RingConsumer)> {
        match self.queue {
            EdgeQueue::Shared(queue) => Ok(queue.split()),
            EdgeQueue::Local(_) => Err(RingPipeError::InvalidTopology(format!(
                "edge {} ({} -> {}) is not cross-thread and cannot be split",
                self.id, self.source, self.dest
            ))),
        }
    }
}

impl QueueState for Edge {
    fn depth(&self) -> usize {
        dispatch!(self, q => q.depth())
    }

    fn width(&self) -> usize {
        dispatch!(self, q => q.width())
    }

    fn used(&self) -> usize {
        dispatch!(self, q => q.used())
    }

    fn free(&self) -> usize {
        dispatch!(self, q => q.free())
    }

    fn is_closed(&self) -> bool {
        dispatch!(self, q => q.is_closed())
    }

    fn close(&mut self) {
        dispatch!(mut self, q => q.close())
    }

    fn is_valid(&self) -> bool {
        dispatch!(self, q => q.is_valid())
    }
}

impl QueueWriter for Edge {
    fn start_write_offset(&mut self, count: usize) -> Option<usize> {
        dispatch!(mut self, q => q.start_write_offset(count))
    }

    fn reserved_mut(&mut self) -> &mut [u8] {
        dispatch!(mut self, q => q.reserved_mut())
    }

    fn finish_write(&mut self, count: usize) {
        dispatch!(mut self, q => q.finish_write(count))
    }
}

impl QueueReader for Edge {
    fn start_read_offset(&mut self) -> (usize, usize) {
        dispatch!(mut self, q => q.start_read_offset())
    }

    fn start_read_exact(&mut self, count: usize) -> bool {
        dispatch!(mut self, q => q.start_read_exact(count))
    }

    fn reserved(&self) -> ReadView<'_> {
        dispatch!(self, q => q.reserved())
    }

    fn finish_read(&mut self, count: usize) {
        dispatch!(mut self, q => q.finish_read(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(cross_thread: bool) -> Edge {
        Edge::new(
            EdgeId::new(0),
            KernelId::new(0),
            KernelId::new(1),
            4,
            4,
            cross_thread,
        )
        .unwrap()
    }

    #[test]
    fn test_variant_follows_cross_thread() {
        assert!(!edge(false).is_cross_thread());
        assert!(edge(true).is_cross_thread());
        assert!(Edge::boundary(EdgeId::new(1), KernelId::new(0), KernelId::new(1), 4, 4, false)
            .unwrap()
            .is_cross_thread());
    }

    #[test]
    fn test_element_api() {
        for cross_thread in [false, true] {
            let mut e = edge(cross_thread);
            assert_eq!(e.get_size(), 16);
            assert_eq!(e.get_free(), 3);

            e.allocate().unwrap().copy_from_slice(&7u32.to_le_bytes());
            e.send();
            e.allocate().unwrap().copy_from_slice(&8u32.to_le_bytes());
            e.send();
            assert_eq!(e.get_available(), 2);

            assert_eq!(e.read_value(), Some(&7u32.to_le_bytes()[..]));
            e.release();
            assert_eq!(e.read_value(), Some(&8u32.to_le_bytes()[..]));
            e.release();
            assert!(e.read_value().is_none());
        }
    }

    #[test]
    fn test_split_requires_shared_queue() {
        assert!(edge(false).split().is_err());

        let (mut tx, mut rx) = edge(true).split().unwrap();
        tx.start_write(1).unwrap().fill(3);
        tx.finish_write(1);
        assert_eq!(rx.start_read().to_vec(), vec![3; 4]);
    }

    #[test]
    fn test_region_backed_edge() {
        let region = ArenaRegion::standalone(64).unwrap();
        let e = Edge::with_region(
            EdgeId::new(2),
            KernelId::new(1),
            KernelId::new(2),
            8,
            8,
            false,
            region,
        )
        .unwrap();
        assert!(e.is_valid());
        assert_eq!(e.source(), KernelId::new(1));
        assert_eq!(e.dest(), KernelId::new(2));
        assert_eq!(e.id().to_string(), "e2");
    }
}
