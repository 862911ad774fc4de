//! 跨模块的帧场景测试，全部跑在 mock driver 上

use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use vireo_frame_graph::binding::{FgBindingState, FgPropertyEntry, FgResourceView};
use vireo_frame_graph::frame::{FgFrameConfig, FgFrameContext, FgFramePlan};
use vireo_frame_graph::handle::{FgResourceHandle, FgTransientDesc};
use vireo_frame_graph::mock_gfx::{MockCall, MockGfx};
use vireo_frame_graph::pipeline::{FgPipeline, FgTargetFormats};
use vireo_frame_graph::transient::FgTransientPlacement;
use vireo_gfx::commands::state::{GfxBufferState, GfxImageState};
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxSamplerDesc};

fn color_desc(width: u32, height: u32) -> FgTransientDesc {
    FgTransientDesc::Image(GfxImageDesc::new_2d(
        vk::Format::R8G8B8A8_UNORM,
        vk::Extent2D { width, height },
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
    ))
}

fn depth_desc(width: u32, height: u32) -> FgTransientDesc {
    FgTransientDesc::Image(GfxImageDesc::new_2d(
        vk::Format::D32_SFLOAT,
        vk::Extent2D { width, height },
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
    ))
}

fn placement(desc: FgTransientDesc, offset: vk::DeviceSize, name: &str) -> FgTransientPlacement {
    FgTransientPlacement {
        desc,
        offset,
        debug_name: name.to_string(),
    }
}

/// 典型一帧：256×256 的 RGBA8 颜色目标 + D32 深度目标，绑定并 flush。
/// 预期：每个目标一条 barrier（undefined→attachment）、一条 clear、
/// 一次 render-target-set；第二次 flush 没有任何 native 调用。
#[test]
fn test_end_to_end_color_depth_frame() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
    let mut binding = FgBindingState::new();

    let tile = 256u64 * 256 * 4;
    frame.begin_frame(
        &gfx,
        FgFramePlan {
            transient_peak_bytes: tile * 2,
            placements: vec![
                placement(color_desc(256, 256), 0, "scene-color"),
                placement(depth_desc(256, 256), tile, "scene-depth"),
            ],
            upload_sizes: vec![],
        },
    );
    gfx.reset_calls();

    binding.set_render_target(0, Some(FgResourceHandle::TransientImage(0)));
    binding.set_depth_stencil(Some(FgResourceHandle::TransientImage(1)));

    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.flush_state(&mut ctx).unwrap();

    let calls = gfx.calls();
    // 一批 image barrier，里面正好两条（颜色 + 深度各一）
    assert_eq!(gfx.image_barrier_batches(), 1);
    assert!(calls.contains(&MockCall::ImageBarriers { count: 2 }));
    // 每个目标一条 clear
    assert_eq!(gfx.clear_count(), 2);
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::ClearColor)), 1);
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::ClearDepth)), 1);
    // 一次 render-target-set
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::SetRenderTargets { colors: 1, has_depth: true })), 1);

    // 状态跟踪与调用方认知一致
    let color = frame.transients.image(FgResourceHandle::TransientImage(0)).unwrap();
    let depth = frame.transients.image(FgResourceHandle::TransientImage(1)).unwrap();
    assert_eq!(frame.tracker.committed_image_state(color), Some(GfxImageState::COLOR_ATTACHMENT_WRITE));
    assert_eq!(frame.tracker.committed_image_state(depth), Some(GfxImageState::DEPTH_ATTACHMENT_WRITE));

    // 没有任何 setter 之后再 flush：零 native 调用
    gfx.reset_calls();
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.flush_state(&mut ctx).unwrap();
    assert_eq!(gfx.recorder_call_count(), 0);

    frame.end_frame(&gfx, &gfx);
    frame.destroy(&gfx);
}

/// 推导的 viewport/scissor 来自绑定目标的尺寸
#[test]
fn test_viewport_scissor_derived_from_render_target() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
    let mut binding = FgBindingState::new();

    frame.begin_frame(
        &gfx,
        FgFramePlan {
            transient_peak_bytes: 128 * 128 * 4,
            placements: vec![placement(color_desc(128, 128), 0, "half-res")],
            upload_sizes: vec![],
        },
    );
    gfx.reset_calls();

    binding.set_render_target(0, Some(FgResourceHandle::TransientImage(0)));
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.flush_state(&mut ctx).unwrap();

    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::SetViewports { count: 1 })), 1);
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::SetScissors { count: 1 })), 1);

    frame.end_frame(&gfx, &gfx);
    frame.destroy(&gfx);
}

/// 属性表解析触发堆轮换：整表重解析 + 堆重绑恰好一次
#[test]
fn test_property_table_restarts_on_heap_rotation() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(
        &gfx,
        FgFrameConfig {
            gpu_view_chunk_capacity: 4,
            ..Default::default()
        },
    );
    let mut binding = FgBindingState::new();

    frame.begin_frame(&gfx, FgFramePlan::default());

    let mut register_tex = |frame: &mut FgFrameContext, i: u64| {
        let image = vk::Image::from_raw(0x100 + i);
        let desc = GfxImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 4, height: 4 },
            vk::ImageUsageFlags::SAMPLED,
        );
        frame.registry.register_image(image, desc, format!("tex-{}", i))
    };
    let warm: Vec<_> = (0..3).map(|i| register_tex(&mut frame, i)).collect();
    let fresh: Vec<_> = (3..5).map(|i| register_tex(&mut frame, i)).collect();

    let pipeline = Rc::new(FgPipeline::new_compute(
        vk::PipelineLayout::from_raw(0x1),
        vk::Pipeline::from_raw(0x2),
        "prefilter",
    ));
    binding.set_pipeline(pipeline);

    // 第一次 dispatch 先消耗掉堆块 4 个槽位里的 3 个
    for (slot, handle) in warm.iter().enumerate() {
        binding.set_property(
            slot,
            FgPropertyEntry {
                resource: Some(FgResourceView::SampledImage(FgResourceHandle::ExternalImage(*handle))),
                sampler: None,
            },
        );
    }
    binding.set_property(
        3,
        FgPropertyEntry {
            resource: None,
            sampler: Some(GfxSamplerDesc::default()),
        },
    );
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.dispatch(&mut ctx, 8, 8, 1).unwrap();

    // 第二次 dispatch 换上两张新纹理：第 4 个槽位分配后堆块耗尽，
    // 触发轮换，整表（包括老的 tex-2）在新堆块里重新解析
    binding.set_property(
        0,
        FgPropertyEntry {
            resource: Some(FgResourceView::SampledImage(FgResourceHandle::ExternalImage(fresh[0]))),
            sampler: None,
        },
    );
    binding.set_property(
        1,
        FgPropertyEntry {
            resource: Some(FgResourceView::SampledImage(FgResourceHandle::ExternalImage(fresh[1]))),
            sampler: None,
        },
    );

    gfx.reset_calls();
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.dispatch(&mut ctx, 8, 8, 1).unwrap();

    // 轮换 -> GPU 堆与 sampler 堆各重绑一次
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::BindDescriptorChunk { .. })), 2);
    // 属性数据：3 个资源下标 + 1 个 sampler 下标
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::PushConstants { len: 16 })), 1);
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::Dispatch)), 1);

    frame.end_frame(&gfx, &gfx);
    frame.destroy(&gfx);
}

/// pipeline 变体与目标格式不匹配：flush 返回失败，draw 被跳过
#[test]
fn test_missing_pipeline_variant_is_reported_not_fatal() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
    let mut binding = FgBindingState::new();

    frame.begin_frame(
        &gfx,
        FgFramePlan {
            transient_peak_bytes: 64 * 64 * 4,
            placements: vec![placement(color_desc(64, 64), 0, "rt")],
            upload_sizes: vec![],
        },
    );

    // 变体只登记了 BGRA8，目标却是 RGBA8
    let mut pipeline = FgPipeline::new_raster(vk::PipelineLayout::from_raw(0x1), "mismatched");
    let mut formats = FgTargetFormats::default();
    formats.colors[0] = vk::Format::B8G8R8A8_UNORM;
    formats.color_count = 1;
    pipeline.add_variant(formats, vk::Pipeline::from_raw(0x2));

    binding.set_render_target(0, Some(FgResourceHandle::TransientImage(0)));
    binding.set_pipeline(Rc::new(pipeline));

    gfx.reset_calls();
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    let result = binding.draw(&mut ctx, 3, 1, 0, 0);
    assert!(result.is_err());
    // draw 没有发出
    assert_eq!(gfx.count_calls(|c| matches!(c, MockCall::Draw)), 0);

    frame.end_frame(&gfx, &gfx);
    frame.destroy(&gfx);
}

/// 上传进 transient buffer 的 roundtrip：字节一致，目标停在 copy-dst 状态
#[test]
fn test_upload_into_transient_buffer_roundtrip() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());

    frame.begin_frame(
        &gfx,
        FgFramePlan {
            transient_peak_bytes: 4096,
            placements: vec![placement(
                FgTransientDesc::Buffer(GfxBufferDesc::new(
                    256,
                    vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
                )),
                0,
                "mesh-vertices",
            )],
            upload_sizes: vec![256],
        },
    );

    let dst = frame.transients.buffer(FgResourceHandle::TransientBuffer(0)).unwrap();
    let payload: Vec<u8> = (0..=255u8).collect();
    frame.uploads.upload_buffer(0, &payload, dst, 0, &mut frame.tracker, &gfx);

    assert_eq!(gfx.buffer_contents(dst), payload);
    assert_eq!(frame.tracker.committed_buffer_state(dst), Some(GfxBufferState::TRANSFER_DST));

    frame.end_frame(&gfx, &gfx);
    frame.destroy(&gfx);
}

/// 帧尾 transition-to-common 覆盖所有被跟踪的资源
#[test]
fn test_end_frame_returns_resources_to_common() {
    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
    let mut binding = FgBindingState::new();

    frame.begin_frame(
        &gfx,
        FgFramePlan {
            transient_peak_bytes: 64 * 64 * 4,
            placements: vec![placement(color_desc(64, 64), 0, "rt")],
            upload_sizes: vec![],
        },
    );
    binding.set_render_target(0, Some(FgResourceHandle::TransientImage(0)));
    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.flush_state(&mut ctx).unwrap();

    let image = frame.transients.image(FgResourceHandle::TransientImage(0)).unwrap();
    frame.end_frame(&gfx, &gfx);
    assert_eq!(frame.tracker.committed_image_state(image), Some(GfxImageState::COMMON));

    frame.destroy(&gfx);
}
