//! Render Context Tests
//!
//! Tests for:
//! - The frame loop: transient reclamation, staging aging, statistics
//! - Texture and buffer creation through the upload paths
//! - Deferred destruction with bindless placeholder rebinding
//! - Dynamic uniform binding through the transient ring
//! - Shutdown releasing every native object

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::{Pod, Zeroable};
use smallvec::smallvec;

use myth_gpu::backend::{
    BufferHandle, BufferUsage, Command, Format, GpuDevice, HeadlessDevice, ImageDesc, ImageHandle,
    ImageLayout, PipelineHandle, RenderingInfo, Scissor, Viewport,
};
use myth_gpu::command::{BatchMode, PipelineState, TrackedCommandList};
use myth_gpu::descriptor::{DescriptorBinding, DescriptorKind, DescriptorPayload, ShaderStages};
use myth_gpu::{GpuSettings, RenderContext};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> GpuSettings {
    GpuSettings {
        frames_in_flight: 3,
        transient_buffer_size: 4096,
        upload_heap_size: 64 * 1024,
        staging_reuse_age: 2,
        deferred_delete_ttl: 4,
        bindless_capacity: 64,
        parallel_record_threshold: 32,
        worker_threads: Some(4),
        ..Default::default()
    }
}

fn context() -> (Arc<HeadlessDevice>, RenderContext) {
    let device = Arc::new(HeadlessDevice::new());
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    let ctx = RenderContext::new(dyn_device, settings()).unwrap();
    (device, ctx)
}

fn pass() -> RenderingInfo {
    RenderingInfo {
        color_targets: smallvec![ImageHandle::from_raw(900)],
        color_formats: smallvec![Format::Bgra8Unorm],
        depth_target: None,
        depth_format: None,
        viewport: Viewport::full(640, 480),
        scissor: Scissor {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        },
        secondary_contents: false,
    }
}

fn run_empty_frame(ctx: &mut RenderContext) {
    ctx.begin_frame().unwrap();
    let primary = ctx.command_list().unwrap();
    ctx.submit_frame(vec![primary]).unwrap();
    ctx.end_frame();
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct CameraUniforms {
    view_projection: [f32; 16],
    position: [f32; 4],
}

// ============================================================================
// Frame Loop
// ============================================================================

#[test]
fn transient_memory_stays_bounded_across_frames() {
    init();
    let (_device, mut ctx) = context();

    for frame in 0..10 {
        ctx.begin_frame().unwrap();
        let allocation = ctx.allocate_bytes(&[frame as u8; 200]).unwrap();
        assert_eq!(allocation.size, 256);
        assert!(ctx.transient_in_use() <= 3 * 256);

        let primary = ctx.command_list().unwrap();
        ctx.submit_frame(vec![primary]).unwrap();
        ctx.end_frame();
    }
    assert_eq!(ctx.frame_info().frame_number, 10);
}

#[test]
fn listeners_run_on_every_frame_boundary() {
    init();
    let (_device, mut ctx) = context();
    let advances = Arc::new(AtomicUsize::new(0));

    let id = {
        let advances = Arc::clone(&advances);
        ctx.subscribe(move |_| {
            advances.fetch_add(1, Ordering::SeqCst);
        })
    };
    run_empty_frame(&mut ctx);
    run_empty_frame(&mut ctx);
    assert_eq!(advances.load(Ordering::SeqCst), 2);

    assert!(ctx.unsubscribe(id));
    run_empty_frame(&mut ctx);
    assert_eq!(advances.load(Ordering::SeqCst), 2);
}

#[test]
fn frame_statistics_are_published_at_end_frame() {
    init();
    let (_device, mut ctx) = context();
    let items: Vec<u32> = (0..100).collect();
    let state = PipelineState::new(PipelineHandle::from_raw(1));

    ctx.begin_frame().unwrap();
    let mut primary = ctx.command_list().unwrap();
    let mode = ctx
        .record_draws(&mut primary, &pass(), &items, |recorder, &i| {
            recorder.bind_pipeline_state(&state);
            recorder.draw(i * 3..i * 3 + 3, 0..1);
        })
        .unwrap();
    assert_eq!(mode, BatchMode::Parallel { partitions: 4 });
    ctx.allocate(&CameraUniforms::zeroed()).unwrap();
    ctx.submit_frame(vec![primary]).unwrap();
    ctx.end_frame();

    let last = ctx.stats().last_frame();
    assert_eq!(last.draw_calls, 100);
    // Four pipeline-state binds per draw, each secondary binds once
    assert_eq!(last.skipped_binds, 4 * (100 - 4));
    assert_eq!(last.transient_bytes, 256);
    assert_eq!(ctx.stats().current().draw_calls, 0);
}

// ============================================================================
// Resources
// ============================================================================

#[test]
fn create_buffer_goes_through_staging() {
    init();
    let (device, mut ctx) = context();
    let vertices: Vec<u8> = (0..=255).collect();

    let buffer = ctx.create_buffer("Vertices", BufferUsage::VERTEX, &vertices).unwrap();
    assert_eq!(buffer.size, 256);
    assert_eq!(device.buffer_contents(buffer.buffer).unwrap(), vertices);
    assert_eq!(ctx.staging().used_count(), 1);

    run_empty_frame(&mut ctx);
    assert_eq!(ctx.staging().used_count(), 1);
    run_empty_frame(&mut ctx);
    assert_eq!(ctx.staging().used_count(), 0);
    assert_eq!(ctx.staging().free_count(), 1);
}

#[test]
fn update_buffer_goes_through_the_upload_heap() -> anyhow::Result<()> {
    init();
    let (device, mut ctx) = context();
    let buffer = ctx.create_buffer("Instances", BufferUsage::STORAGE, &[0; 64])?;

    ctx.update_buffer(&buffer, 16, &[7; 16])?;
    let contents = device
        .buffer_contents(buffer.buffer)
        .ok_or_else(|| anyhow::anyhow!("buffer was not created"))?;
    assert!(contents[16..32].iter().all(|&b| b == 7));
    assert!(contents[..16].iter().all(|&b| b == 0));
    assert_eq!(ctx.upload_heap().cursor(), 0);
    Ok(())
}

#[test]
fn texture_is_uploaded_and_registered_bindless() {
    init();
    let (device, mut ctx) = context();
    let desc = ImageDesc::texture_2d("Albedo", 4, 4, Format::Rgba8Unorm);
    let pixels = vec![128u8; 64];

    let texture = ctx.create_texture(&desc, &pixels).unwrap();
    assert_eq!(device.image_contents(texture.image, 0, 0), Some(pixels));

    let expected = DescriptorPayload::SampledImage {
        image: texture.image,
        layout: ImageLayout::ShaderReadOnly,
    };
    for stages in [ShaderStages::FRAGMENT, ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE] {
        let table = ctx.bindless().table(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(table.payload(texture.bindless_index), Some(expected));
    }
}

#[test]
fn released_texture_is_destroyed_after_ttl_frames() {
    init();
    let (device, mut ctx) = context();
    let desc = ImageDesc::texture_2d("Decal", 2, 2, Format::Rgba8Unorm);
    let texture = ctx.create_texture(&desc, &[1; 16]).unwrap();
    let images_before = device.live_image_count();

    ctx.retain(texture.key).unwrap();
    assert_eq!(ctx.release(texture.key).unwrap(), 1);
    assert_eq!(ctx.release(texture.key).unwrap(), 0);

    let table = ctx.bindless().table(DescriptorKind::SampledImage, ShaderStages::FRAGMENT).unwrap();
    for _ in 0..3 {
        run_empty_frame(&mut ctx);
        assert_eq!(device.live_image_count(), images_before, "destroyed too early");
    }
    run_empty_frame(&mut ctx);
    assert_eq!(device.live_image_count(), images_before - 1);

    let placeholder = DescriptorPayload::SampledImage {
        image: ctx.placeholder_image(),
        layout: ImageLayout::ShaderReadOnly,
    };
    assert_eq!(table.payload(texture.bindless_index), Some(placeholder));

    // The freed index is handed out again
    let next = ctx.create_texture(&desc, &[2; 16]).unwrap();
    assert_eq!(next.bindless_index, texture.bindless_index);
}

#[test]
fn batched_texture_uploads_share_one_submission() {
    init();
    let (device, mut ctx) = context();
    let desc = ImageDesc::texture_2d("Tile", 8, 8, Format::Rgba8Unorm);
    let before = device.submission_count();

    ctx.begin_upload_batch();
    let textures: Vec<_> = (0..5u8)
        .map(|i| ctx.create_texture(&desc, &[i; 256]).unwrap())
        .collect();
    assert_eq!(device.submission_count(), before);
    ctx.end_upload_batch().unwrap();
    assert_eq!(device.submission_count(), before + 1);

    for (i, texture) in textures.iter().enumerate() {
        let contents = device.image_contents(texture.image, 0, 0).unwrap();
        assert!(contents.iter().all(|&b| b == i as u8));
    }
}

// ============================================================================
// Dynamic Uniforms
// ============================================================================

#[test]
fn bind_uniforms_uses_the_allocation_offset() {
    init();
    let (device, ctx) = context();
    let layout = ctx
        .create_layout(vec![DescriptorBinding::new(
            0,
            0,
            DescriptorKind::UniformBufferDynamic,
            1,
            ShaderStages::ALL_GRAPHICS,
            "camera",
        )])
        .unwrap();
    let resources = ctx.create_resource_set();
    resources
        .set_resource(
            0,
            DescriptorPayload::UniformBuffer {
                buffer: ctx.transient_buffer(),
                offset: 0,
                range: 256,
            },
        )
        .unwrap();
    let set = resources.descriptor_set(&layout).unwrap();

    let first = CameraUniforms {
        view_projection: [1.0; 16],
        position: [0.0, 1.0, 2.0, 1.0],
    };
    let second = CameraUniforms {
        position: [5.0, 5.0, 5.0, 1.0],
        ..first
    };

    let primary = ctx.command_list().unwrap();
    let (a, b) = {
        let mut tracked = TrackedCommandList::new(ctx.device().as_ref(), primary.buffer());
        let a = ctx.bind_uniforms(&mut tracked, 0, set, &first).unwrap();
        let b = ctx.bind_uniforms(&mut tracked, 0, set, &second).unwrap();
        (a, b)
    };
    assert_eq!((a.offset, b.offset), (0, 256));

    let binds: Vec<_> = device
        .recorded_commands(primary.buffer())
        .into_iter()
        .filter_map(|c| match c {
            Command::BindDescriptorSet { dynamic_offsets, .. } => Some(dynamic_offsets.to_vec()),
            _ => None,
        })
        .collect();
    assert_eq!(binds, vec![vec![0], vec![256]]);

    let contents = device.buffer_contents(b.buffer).unwrap();
    let size = std::mem::size_of::<CameraUniforms>();
    assert_eq!(&contents[256..256 + size], bytemuck::bytes_of(&second));
    ctx.graphics_queue().free_command_list(primary);
}

#[test]
fn inline_recording_below_threshold() {
    init();
    let (_device, mut ctx) = context();
    let items = [BufferHandle::from_raw(1), BufferHandle::from_raw(2)];

    ctx.begin_frame().unwrap();
    let mut primary = ctx.command_list().unwrap();
    let mode = ctx
        .record_draws(&mut primary, &pass(), &items, |recorder, &vb| {
            recorder.bind_vertex_buffer(0, vb, 0);
            recorder.draw(0..3, 0..1);
        })
        .unwrap();
    assert_eq!(mode, BatchMode::Inline);
    ctx.submit_frame(vec![primary]).unwrap();
    ctx.end_frame();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_releases_every_native_object() {
    init();
    let (device, mut ctx) = context();
    ctx.create_buffer("Mesh", BufferUsage::VERTEX, &[3; 128]).unwrap();
    let desc = ImageDesc::texture_2d("Sprite", 2, 2, Format::Rgba8Unorm);
    let released = ctx.create_texture(&desc, &[9; 16]).unwrap();
    ctx.create_texture(&desc, &[8; 16]).unwrap();
    ctx.release(released.key).unwrap();
    run_empty_frame(&mut ctx);

    ctx.shutdown().unwrap();
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_image_count(), 0);
    assert_eq!(device.descriptor_pool_count(), 0);
}

#[test]
fn dropping_without_shutdown_cleans_up_too() {
    init();
    let (device, mut ctx) = context();
    ctx.create_buffer("Mesh", BufferUsage::INDEX, &[1; 64]).unwrap();
    drop(ctx);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_image_count(), 0);
}
