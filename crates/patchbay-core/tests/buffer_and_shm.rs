//! Boundary scenarios §8.5 (memory seal enforcement) and the buffer
//! pool's dequeue/queue handoff used by C6/C8 together.

use patchbay_core::buffer::{BufferPool, MetaRequest};
use patchbay_core::primitives::BufferLayout;
use patchbay_core::shm::{BlockFlags, ShmError, ShmPool};

/// §8.5: a peer handing over an unsealed block as a buffer backing
/// store must be rejected, not silently mapped.
#[test]
fn unsealed_incoming_block_is_rejected_as_a_buffer_backing_store() {
    let mut shm = ShmPool::new();
    let unsealed = shm.allocate(BlockFlags::MAP_READ, 4096).unwrap();
    let fd = unsealed.as_fd().try_clone_to_owned().unwrap();

    let result = shm.import(9, 1, fd, 0, 4096, BlockFlags::MAP_READ, true);
    assert!(matches!(result, Err(ShmError::Unsealed)));
}

#[test]
fn sealed_incoming_block_is_accepted_as_a_buffer_backing_store() {
    let mut shm = ShmPool::new();
    let sealed = shm.allocate(BlockFlags::SEALED | BlockFlags::MAP_READ, 4096).unwrap();
    let fd = sealed.as_fd().try_clone_to_owned().unwrap();

    let result = shm.import(9, 2, fd, 0, 4096, BlockFlags::SEALED | BlockFlags::MAP_READ, true);
    assert!(result.is_ok());
}

#[test]
fn buffer_pool_round_trips_through_full_cycle() {
    let mut shm = ShmPool::new();
    let layout = BufferLayout { buffers: 2, blocks: 1, size: 1024, stride: 1024, align: 8 };
    let mut pool = BufferPool::build(&mut shm, layout, &[MetaRequest::Header]).unwrap();

    let produced = pool.dequeue().expect("pool should have free buffers");
    {
        let buf = pool.buffer_mut(produced).unwrap();
        let mut mapping = shm.map(&buf.data[0].block).unwrap();
        mapping.data_mut()[0] = 7;
        buf.data[0].chunk.size = 1;
    }

    // consumer reads it back, then returns the index to the free-list
    let buf = pool.buffer(produced).unwrap();
    let mapping = shm.map(&buf.data[0].block).unwrap();
    assert_eq!(mapping.data()[0], 7);
    assert!(buf.data[0].chunk.size + buf.data[0].chunk.offset <= buf.data[0].max_size);

    pool.queue(produced).unwrap();
    assert!(pool.dequeue().is_some());
}
