//! Staging Pool Tests
//!
//! Tests for:
//! - Best-fit block selection (never smaller than requested)
//! - Age-based recycling after `reuse_age` frames
//! - Leak detection on terminate

use std::sync::Arc;

use myth_gpu::backend::{GpuDevice, HeadlessDevice};
use myth_gpu::errors::GpuError;
use myth_gpu::memory::StagingPool;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(reuse_age: u64) -> (Arc<HeadlessDevice>, StagingPool) {
    let device = Arc::new(HeadlessDevice::new());
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    (device, StagingPool::new(dyn_device, reuse_age))
}

fn release_all(pool: &StagingPool) {
    for _ in 0..pool.reuse_age() {
        pool.gc();
    }
}

// ============================================================================
// Acquire
// ============================================================================

#[test]
fn acquire_copies_payload_to_offset_zero() {
    init();
    let (device, pool) = setup(2);
    let payload: Vec<u8> = (0..100).collect();

    let stage = pool.acquire_stage(&payload).unwrap();
    assert_eq!(stage.size, 100);
    assert_eq!(stage.capacity, 100);

    let contents = device.buffer_contents(stage.buffer).unwrap();
    assert_eq!(&contents[..100], payload.as_slice());
    assert_eq!(pool.used_count(), 1);
}

#[test]
fn picks_smallest_block_that_fits() {
    init();
    let (device, pool) = setup(1);
    pool.acquire_stage(&[0; 4096]).unwrap();
    pool.acquire_stage(&[0; 1024]).unwrap();
    pool.acquire_stage(&[0; 512]).unwrap();
    release_all(&pool);
    assert_eq!(pool.free_count(), 3);

    let stage = pool.acquire_stage(&[7; 1000]).unwrap();
    assert_eq!(stage.capacity, 1024);
    assert_eq!(device.buffers_created(), 3);
}

#[test]
fn never_hands_out_a_smaller_block() {
    init();
    let (device, pool) = setup(1);
    pool.acquire_stage(&[0; 256]).unwrap();
    release_all(&pool);

    let stage = pool.acquire_stage(&[1; 300]).unwrap();
    assert!(stage.capacity >= 300);
    assert_eq!(device.buffers_created(), 2, "a too-small free block must not be reused");
    assert_eq!(pool.free_count(), 1);
}

// ============================================================================
// Recycling
// ============================================================================

#[test]
fn blocks_are_not_reused_before_reuse_age() {
    init();
    let (device, pool) = setup(3);
    pool.acquire_stage(&[0; 64]).unwrap();

    assert_eq!(pool.gc(), 0);
    assert_eq!(pool.gc(), 0);
    pool.acquire_stage(&[0; 64]).unwrap();
    assert_eq!(device.buffers_created(), 2);

    // The first block reaches age 3 on this pass, the second does not.
    assert_eq!(pool.gc(), 1);
    assert_eq!(pool.used_count(), 1);
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn released_kilobyte_blocks_serve_smaller_requests() {
    init();
    let (device, pool) = setup(4);
    for _ in 0..5 {
        pool.acquire_stage(&[0xAB; 1024]).unwrap();
    }
    assert_eq!(device.buffers_created(), 5);

    release_all(&pool);
    assert_eq!(pool.used_count(), 0);
    assert_eq!(pool.free_count(), 5);

    let stage = pool.acquire_stage(&[0xCD; 512]).unwrap();
    assert_eq!(stage.capacity, 1024);
    assert_eq!(device.buffers_created(), 5, "no new buffer for a 512-byte request");
    let contents = device.buffer_contents(stage.buffer).unwrap();
    assert!(contents[..512].iter().all(|&b| b == 0xCD));
}

// ============================================================================
// Terminate
// ============================================================================

#[test]
fn terminate_with_blocks_in_use_reports_a_leak() {
    init();
    let (device, pool) = setup(2);
    pool.acquire_stage(&[0; 32]).unwrap();
    pool.acquire_stage(&[0; 32]).unwrap();

    assert_eq!(pool.terminate(), Err(GpuError::StagingLeak { count: 2 }));
    assert_eq!(device.live_buffer_count(), 2, "nothing is destroyed on a leak");
}

#[test]
fn terminate_after_recycling_destroys_every_block() {
    init();
    let (device, pool) = setup(2);
    pool.acquire_stage(&[0; 32]).unwrap();
    pool.acquire_stage(&[0; 64]).unwrap();
    release_all(&pool);

    pool.terminate().unwrap();
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(pool.free_count(), 0);
}

#[test]
fn retire_all_ignores_age() {
    init();
    let (_device, pool) = setup(100);
    pool.acquire_stage(&[0; 16]).unwrap();
    assert_eq!(pool.retire_all(), 1);
    assert!(pool.terminate().is_ok());
}
