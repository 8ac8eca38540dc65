//! Buffer pool manager (C6).
//!
//! Given a negotiated [`crate::primitives::BufferLayout`], allocates `n`
//! buffers of `blocks` data segments each in shared memory and exposes
//! `dequeue`/`queue` for the single-writer producer/consumer handoff
//! described in spec.md §4.6. Buffer *contents* move through the link's
//! `IoArea` one index at a time; this pool only owns the backing memory
//! and the free-list of indices not currently in flight.
//!
//! Grounded on `rtrb`'s SPSC ring for the free-list: the index set a
//! producer draws from and a consumer returns to is exactly rtrb's
//! single-producer/single-consumer contract, reused here for buffer
//! indices rather than rtrb's own ring of bytes.

use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::CoreError;
use crate::primitives::BufferLayout;
use crate::shm::{BlockFlags, MemoryBlock, ShmPool};

/// One data segment within a buffer (§3/§4.6 "each buffer has... data
/// segments").
#[derive(Debug, Clone)]
pub enum DataKind {
    MemPtr,
    MemFd,
    DmaBuf,
    Id,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone)]
pub struct Data {
    pub kind: DataKind,
    pub block: MemoryBlock,
    pub max_size: u32,
    pub chunk: Chunk,
}

#[derive(Debug, Clone)]
pub enum Meta {
    Header { sequence: u64, pts: i64, dts_offset: i64 },
    VideoCrop { x: i32, y: i32, width: u32, height: u32 },
    VideoDamage(Vec<(i32, i32, u32, u32)>),
    Bitmap { width: u32, height: u32, stride: u32 },
    Cursor { x: i32, y: i32 },
    Control,
}

/// A meta the caller wants sized into every buffer the pool builds, per
/// §4.6 "`VideoCrop` and `Bitmap` metas are sized when the pool is
/// built". `Header` carries no dimensions of its own; the two video
/// metas take the dimensions of the negotiated video format.
#[derive(Debug, Clone, Copy)]
pub enum MetaRequest {
    Header,
    VideoCrop { width: u32, height: u32 },
    Bitmap { width: u32, height: u32, stride: u32 },
}

impl MetaRequest {
    fn build(self) -> Meta {
        match self {
            MetaRequest::Header => Meta::Header { sequence: 0, pts: 0, dts_offset: 0 },
            MetaRequest::VideoCrop { width, height } => {
                Meta::VideoCrop { x: 0, y: 0, width, height }
            }
            MetaRequest::Bitmap { width, height, stride } => Meta::Bitmap { width, height, stride },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub index: u32,
    pub data: Vec<Data>,
    pub metas: Vec<Meta>,
}

/// Owns the backing memory for a negotiated `Buffers` param and the
/// free-list of buffer indices available for the producer to dequeue.
pub struct BufferPool {
    buffers: Vec<Buffer>,
    free_producer: Producer<u32>,
    free_consumer: Consumer<u32>,
    next_sequence: u64,
}

impl BufferPool {
    /// Allocate `layout.buffers` buffers, each `layout.blocks` data
    /// segments of `layout.size` bytes (rounded to `layout.align`), all
    /// backed by freshly allocated shared memory via `shm`.
    pub fn build(shm: &mut ShmPool, layout: BufferLayout, metas: &[MetaRequest]) -> Result<Self, CoreError> {
        let mut buffers = Vec::with_capacity(layout.buffers as usize);
        for index in 0..layout.buffers {
            let mut data = Vec::with_capacity(layout.blocks as usize);
            for _ in 0..layout.blocks {
                let block = shm
                    .allocate(BlockFlags::SEALED | BlockFlags::MAP_READ | BlockFlags::MAP_WRITE, layout.size as u64)?;
                data.push(Data {
                    kind: DataKind::MemFd,
                    block,
                    max_size: layout.size,
                    chunk: Chunk { offset: 0, size: 0, stride: layout.stride },
                });
            }
            let built_metas = metas.iter().map(|m| m.build()).collect();
            buffers.push(Buffer { index, data, metas: built_metas });
        }

        let (mut producer, consumer) = RingBuffer::<u32>::new(layout.buffers as usize);
        for index in 0..layout.buffers {
            // capacity matches buffer count exactly, push cannot fail
            let _ = producer.push(index);
        }

        Ok(Self { buffers, free_producer: producer, free_consumer: consumer, next_sequence: 0 })
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer> {
        self.buffers.get(index as usize)
    }

    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut Buffer> {
        self.buffers.get_mut(index as usize)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Producer side: take a free buffer index to fill. Stamps its
    /// `Header` meta (if present) with the next monotonic sequence
    /// number, per §4.6.
    pub fn dequeue(&mut self) -> Option<u32> {
        let index = self.free_consumer.pop().ok()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        if let Some(buf) = self.buffer_mut(index) {
            for meta in &mut buf.metas {
                if let Meta::Header { sequence: seq, .. } = meta {
                    *seq = sequence;
                }
            }
        }
        Some(index)
    }

    /// Consumer side: return a processed buffer index to the free-list
    /// so it can be dequeued again.
    pub fn queue(&mut self, index: u32) -> Result<(), CoreError> {
        self.free_producer
            .push(index)
            .map_err(|_| CoreError::Fatal("buffer pool free-list overflow: double queue?".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BufferLayout {
        BufferLayout { buffers: 4, blocks: 1, size: 4096, stride: 4096, align: 16 }
    }

    #[test]
    fn build_allocates_requested_count() {
        let mut shm = ShmPool::new();
        let pool = BufferPool::build(&mut shm, layout(), &[MetaRequest::Header]).unwrap();
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn dequeue_then_queue_roundtrips_index() {
        let mut shm = ShmPool::new();
        let mut pool = BufferPool::build(&mut shm, layout(), &[MetaRequest::Header]).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let idx = pool.dequeue().unwrap();
            seen.insert(idx);
        }
        assert_eq!(seen.len(), 4);
        assert!(pool.dequeue().is_none());

        pool.queue(seen.iter().next().copied().unwrap()).unwrap();
        assert!(pool.dequeue().is_some());
    }

    #[test]
    fn header_sequence_increments() {
        let mut shm = ShmPool::new();
        let mut pool = BufferPool::build(&mut shm, layout(), &[MetaRequest::Header]).unwrap();
        let a = pool.dequeue().unwrap();
        let b = pool.dequeue().unwrap();
        let seq_a = match &pool.buffer(a).unwrap().metas[0] {
            Meta::Header { sequence, .. } => *sequence,
            _ => unreachable!(),
        };
        let seq_b = match &pool.buffer(b).unwrap().metas[0] {
            Meta::Header { sequence, .. } => *sequence,
            _ => unreachable!(),
        };
        assert!(seq_b > seq_a);
    }

    #[test]
    fn video_metas_are_sized_at_build_time() {
        let mut shm = ShmPool::new();
        let metas = [
            MetaRequest::VideoCrop { width: 1920, height: 1080 },
            MetaRequest::Bitmap { width: 1920, height: 1080, stride: 7680 },
        ];
        let pool = BufferPool::build(&mut shm, layout(), &metas).unwrap();
        let buf = pool.buffer(0).unwrap();
        assert!(matches!(buf.metas[0], Meta::VideoCrop { width: 1920, height: 1080, .. }));
        assert!(matches!(buf.metas[1], Meta::Bitmap { width: 1920, height: 1080, stride: 7680 }));
    }
}
