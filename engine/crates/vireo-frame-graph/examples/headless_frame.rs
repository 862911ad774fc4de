//! Headless 演示：在 mock driver 上录制一帧完整的帧图执行
//!
//! 展示一帧的控制流：计划 → begin_frame → 上传 → 绑定/flush →
//! draw → end_frame。不需要 GPU，适合在 CI 里跑。

use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use vireo_frame_graph::binding::{FgBindingState, FgPropertyEntry, FgResourceView};
use vireo_frame_graph::frame::{FgFrameConfig, FgFrameContext, FgFramePlan};
use vireo_frame_graph::handle::{FgResourceHandle, FgTransientDesc};
use vireo_frame_graph::mock_gfx::MockGfx;
use vireo_frame_graph::pipeline::{FgPipeline, FgTargetFormats};
use vireo_frame_graph::transient::FgTransientPlacement;
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxSamplerDesc};

fn main() {
    vireo_crate_tools::init_log::init_log();

    let gfx = MockGfx::new();
    let mut frame = FgFrameContext::new(&gfx, FgFrameConfig::default());
    let mut binding = FgBindingState::new();

    // 外部帧图编译器会算出这些；demo 里手写一份
    let tile = 256u64 * 256 * 4;
    let vertex_bytes = 3 * 6 * 4;
    let plan = FgFramePlan {
        transient_peak_bytes: tile * 2 + 4096,
        placements: vec![
            FgTransientPlacement {
                desc: FgTransientDesc::Image(
                    GfxImageDesc::new_2d(
                        vk::Format::R8G8B8A8_UNORM,
                        vk::Extent2D { width: 256, height: 256 },
                        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                    )
                    .with_clear_color(glam::Vec4::new(0.1, 0.1, 0.12, 1.0)),
                ),
                offset: 0,
                debug_name: "scene-color".into(),
            },
            FgTransientPlacement {
                desc: FgTransientDesc::Image(GfxImageDesc::new_2d(
                    vk::Format::D32_SFLOAT,
                    vk::Extent2D { width: 256, height: 256 },
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                )),
                offset: tile,
                debug_name: "scene-depth".into(),
            },
            FgTransientPlacement {
                desc: FgTransientDesc::Buffer(GfxBufferDesc::new(
                    vertex_bytes,
                    vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER,
                )),
                offset: tile * 2,
                debug_name: "triangle-vertices".into(),
            },
        ],
        upload_sizes: vec![vertex_bytes],
    };

    frame.begin_frame(&gfx, plan);

    // 顶点数据走 staging ring
    let vertices: Vec<f32> = vec![
        0.0, -0.5, 1.0, 0.0, 0.0, 1.0, //
        0.5, 0.5, 0.0, 1.0, 0.0, 1.0, //
        -0.5, 0.5, 0.0, 0.0, 1.0, 1.0, //
    ];
    let vb = frame.transients.buffer(FgResourceHandle::TransientBuffer(2)).unwrap();
    frame.uploads.upload_slice(0, &vertices, vb, 0, &mut frame.tracker, &gfx);

    // pipeline 变体用伪造的 native 句柄登记
    let mut pipeline = FgPipeline::new_raster(vk::PipelineLayout::from_raw(0x1), "triangle");
    let mut formats = FgTargetFormats::default();
    formats.colors[0] = vk::Format::R8G8B8A8_UNORM;
    formats.color_count = 1;
    formats.depth = vk::Format::D32_SFLOAT;
    pipeline.add_variant(formats, vk::Pipeline::from_raw(0x2));

    binding.set_render_target(0, Some(FgResourceHandle::TransientImage(0)));
    binding.set_depth_stencil(Some(FgResourceHandle::TransientImage(1)));
    binding.set_vertex_buffer(FgResourceHandle::TransientBuffer(2), 0, 24);
    binding.set_pipeline(Rc::new(pipeline));
    binding.set_property(
        0,
        FgPropertyEntry {
            resource: None,
            sampler: Some(GfxSamplerDesc::default()),
        },
    );

    let mut ctx = frame.exec_ctx(&gfx, &gfx);
    binding.draw(&mut ctx, 3, 1, 0, 0).expect("flush failed");

    frame.end_frame(&gfx, &gfx);

    log::info!("frame {} recorded, {} native calls:", frame.frame_index(), gfx.recorder_call_count());
    for call in gfx.calls() {
        log::info!("  {:?}", call);
    }

    frame.destroy(&gfx);
}
