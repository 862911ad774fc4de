//! 命令录制接口
//!
//! `GfxRecorder` 是帧图核心看到的全部命令录制面；生产实现
//! `GfxCommandBuffer` 把它落到 `vkCmd*` 上，测试里用 mock 统计调用。
//!
//! # 顺序约束
//! 调用方保证：barrier 总是先于依赖它的命令提交；描述符堆块的重新
//! 绑定先于引用新堆块索引的命令。recorder 自身不做重排。

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk;

use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::foundation::device::GfxDevice;
use crate::foundation::driver::{GfxDescriptorChunk, GfxDescriptorKind};

/// 颜色附件绑定
#[derive(Clone, Copy, Debug)]
pub struct GfxColorAttachment {
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub load_op: vk::AttachmentLoadOp,
    pub clear_color: glam::Vec4,
}

/// 深度模板附件绑定
#[derive(Clone, Copy, Debug)]
pub struct GfxDepthAttachment {
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub load_op: vk::AttachmentLoadOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

/// 命令录制操作
pub trait GfxRecorder {
    /// 一次性提交一批缓冲区 barrier
    fn cmd_buffer_barriers(&self, barriers: &[GfxBufferBarrier]);

    /// 一次性提交一批图像 barrier
    fn cmd_image_barriers(&self, barriers: &[GfxImageBarrier]);

    /// 以 attachment load-op 方式清空一个颜色目标
    ///
    /// 目标必须已处于 COLOR_ATTACHMENT 状态。
    fn cmd_clear_color_target(&self, target: &GfxColorAttachment);

    /// 以 attachment load-op 方式清空一个深度目标
    fn cmd_clear_depth_target(&self, target: &GfxDepthAttachment);

    fn cmd_copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy);

    fn cmd_set_render_targets(&self, colors: &[GfxColorAttachment], depth: Option<&GfxDepthAttachment>);

    fn cmd_set_viewports(&self, viewports: &[vk::Viewport]);

    fn cmd_set_scissors(&self, scissors: &[vk::Rect2D]);

    fn cmd_set_stencil_reference(&self, reference: u32);

    fn cmd_bind_vertex_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, stride: u32);

    fn cmd_bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);

    fn cmd_bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);

    /// 重新绑定描述符堆块（堆轮换之后必须调用）
    fn cmd_bind_descriptor_chunk(
        &self,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        kind: GfxDescriptorKind,
        chunk: GfxDescriptorChunk,
    );

    fn cmd_push_constants(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &[u8]);

    fn cmd_draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    fn cmd_draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_dispatch(&self, group_x: u32, group_y: u32, group_z: u32);
}

/// 当前的 dynamic rendering 作用域
///
/// barrier/copy 不能录制在 rendering 作用域内，所以 recorder 在这类
/// 命令前挂起作用域，并在下一个 draw 前用 LOAD 恢复同一组 attachment。
#[derive(Default)]
struct RenderScope {
    colors: Vec<GfxColorAttachment>,
    depth: Option<GfxDepthAttachment>,
    active: bool,
    bound: bool,
}

/// 基于 ash 的命令录制实现
pub struct GfxCommandBuffer {
    device: Rc<GfxDevice>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    scope: RefCell<RenderScope>,
}

// new & destroy
impl GfxCommandBuffer {
    pub fn new(device: Rc<GfxDevice>, debug_name: &str) -> Self {
        let (pool, cmd) = device.allocate_command_buffer(debug_name);
        Self {
            device,
            pool,
            cmd,
            scope: RefCell::new(RenderScope::default()),
        }
    }

    pub fn free(self) {
        self.device.free_command_buffer(self.pool, self.cmd);
    }
}

// 录制生命周期
impl GfxCommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    pub fn begin(&self) {
        unsafe {
            self.device
                .ash_device()
                .begin_command_buffer(
                    self.cmd,
                    &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .unwrap();
        }
    }

    pub fn end(&self) {
        self.suspend_rendering();
        unsafe {
            self.device.ash_device().end_command_buffer(self.cmd).unwrap();
        }
    }

    /// 提交到设备队列
    pub fn submit(&self) {
        self.device.submit_command_buffer(self.cmd);
    }
}

// rendering 作用域管理
impl GfxCommandBuffer {
    fn color_attachment_info(att: &GfxColorAttachment) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(att.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(att.load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: att.clear_color.to_array(),
                },
            })
    }

    fn depth_attachment_info(att: &GfxDepthAttachment) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(att.view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(att.load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: att.clear_depth,
                    stencil: att.clear_stencil,
                },
            })
    }

    fn begin_rendering(&self, colors: &[GfxColorAttachment], depth: Option<&GfxDepthAttachment>) {
        let extent = colors
            .first()
            .map(|c| c.extent)
            .or_else(|| depth.map(|d| d.extent))
            .expect("rendering scope without attachments");

        let color_infos: Vec<_> = colors.iter().map(Self::color_attachment_info).collect();
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_infos);

        let depth_info = depth.map(Self::depth_attachment_info);
        if let Some(depth_info) = &depth_info {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        unsafe {
            self.device.ash_device().cmd_begin_rendering(self.cmd, &rendering_info);
        }
    }

    /// barrier/copy/clear 之前挂起 rendering 作用域
    fn suspend_rendering(&self) {
        let mut scope = self.scope.borrow_mut();
        if scope.active {
            unsafe {
                self.device.ash_device().cmd_end_rendering(self.cmd);
            }
            scope.active = false;
        }
    }

    /// draw 之前确保 rendering 作用域打开；挂起后恢复时一律用 LOAD
    fn resume_rendering(&self) {
        let mut scope = self.scope.borrow_mut();
        assert!(scope.bound, "draw without render targets bound");
        if scope.active {
            return;
        }

        let colors: Vec<_> = scope
            .colors
            .iter()
            .map(|c| GfxColorAttachment {
                load_op: vk::AttachmentLoadOp::LOAD,
                ..*c
            })
            .collect();
        let depth = scope.depth.map(|d| GfxDepthAttachment {
            load_op: vk::AttachmentLoadOp::LOAD,
            ..d
        });
        self.begin_rendering(&colors, depth.as_ref());
        scope.active = true;
    }
}

impl GfxRecorder for GfxCommandBuffer {
    fn cmd_buffer_barriers(&self, barriers: &[GfxBufferBarrier]) {
        self.suspend_rendering();
        let vk_barriers: Vec<_> = barriers.iter().map(GfxBufferBarrier::vk_barrier).collect();
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&vk_barriers);
        unsafe {
            self.device.ash_device().cmd_pipeline_barrier2(self.cmd, &dependency);
        }
    }

    fn cmd_image_barriers(&self, barriers: &[GfxImageBarrier]) {
        self.suspend_rendering();
        let vk_barriers: Vec<_> = barriers.iter().map(GfxImageBarrier::vk_barrier).collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&vk_barriers);
        unsafe {
            self.device.ash_device().cmd_pipeline_barrier2(self.cmd, &dependency);
        }
    }

    fn cmd_clear_color_target(&self, target: &GfxColorAttachment) {
        self.suspend_rendering();
        let cleared = GfxColorAttachment {
            load_op: vk::AttachmentLoadOp::CLEAR,
            ..*target
        };
        self.begin_rendering(std::slice::from_ref(&cleared), None);
        unsafe {
            self.device.ash_device().cmd_end_rendering(self.cmd);
        }
    }

    fn cmd_clear_depth_target(&self, target: &GfxDepthAttachment) {
        self.suspend_rendering();
        let cleared = GfxDepthAttachment {
            load_op: vk::AttachmentLoadOp::CLEAR,
            ..*target
        };
        self.begin_rendering(&[], Some(&cleared));
        unsafe {
            self.device.ash_device().cmd_end_rendering(self.cmd);
        }
    }

    fn cmd_copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        self.suspend_rendering();
        unsafe {
            self.device.ash_device().cmd_copy_buffer(self.cmd, src, dst, &[region]);
        }
    }

    fn cmd_set_render_targets(&self, colors: &[GfxColorAttachment], depth: Option<&GfxDepthAttachment>) {
        self.suspend_rendering();
        let mut scope = self.scope.borrow_mut();
        scope.colors.clear();
        scope.colors.extend_from_slice(colors);
        scope.depth = depth.copied();
        scope.bound = true;
        drop(scope);

        self.begin_rendering(colors, depth);
        self.scope.borrow_mut().active = true;
    }

    fn cmd_set_viewports(&self, viewports: &[vk::Viewport]) {
        unsafe {
            self.device.ash_device().cmd_set_viewport(self.cmd, 0, viewports);
        }
    }

    fn cmd_set_scissors(&self, scissors: &[vk::Rect2D]) {
        unsafe {
            self.device.ash_device().cmd_set_scissor(self.cmd, 0, scissors);
        }
    }

    fn cmd_set_stencil_reference(&self, reference: u32) {
        unsafe {
            self.device.ash_device().cmd_set_stencil_reference(
                self.cmd,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
        }
    }

    fn cmd_bind_vertex_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, stride: u32) {
        unsafe {
            self.device.ash_device().cmd_bind_vertex_buffers2(
                self.cmd,
                0,
                &[buffer],
                &[offset],
                None,
                Some(&[stride as vk::DeviceSize]),
            );
        }
    }

    fn cmd_bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.device.ash_device().cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
        }
    }

    fn cmd_bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device.ash_device().cmd_bind_pipeline(self.cmd, bind_point, pipeline);
        }
    }

    fn cmd_bind_descriptor_chunk(
        &self,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        kind: GfxDescriptorKind,
        chunk: GfxDescriptorChunk,
    ) {
        // set 编号约定：set 0 = GPU 资源堆，set 1 = sampler 堆
        let set_index = match kind {
            GfxDescriptorKind::GpuView => 0,
            GfxDescriptorKind::Sampler => 1,
            GfxDescriptorKind::CpuView => panic!("CPU view chunk is never bound to the GPU"),
        };
        let set = self.device.descriptor_chunk_set(chunk);
        unsafe {
            self.device.ash_device().cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    fn cmd_push_constants(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &[u8]) {
        unsafe {
            self.device.ash_device().cmd_push_constants(self.cmd, layout, stages, 0, data);
        }
    }

    fn cmd_draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.resume_rendering();
        unsafe {
            self.device
                .ash_device()
                .cmd_draw(self.cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    fn cmd_draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.resume_rendering();
        unsafe {
            self.device.ash_device().cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    fn cmd_dispatch(&self, group_x: u32, group_y: u32, group_z: u32) {
        self.suspend_rendering();
        unsafe {
            self.device.ash_device().cmd_dispatch(self.cmd, group_x, group_y, group_z);
        }
    }
}
