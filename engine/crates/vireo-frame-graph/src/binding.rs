//! 管线绑定状态 diff
//!
//! 每个可绑定槽位（render target、viewport、vertex/index buffer、
//! pipeline、属性表……）是一个带 dirty 标记的单元格：setter 只置位，
//! 不做任何事；`flush_state` 统一解析、排 barrier、按固定顺序只对
//! 变过的组发 native 命令。自上次 flush 以来没变的字段零 native 调用。

use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use vireo_gfx::commands::recorder::{GfxColorAttachment, GfxDepthAttachment, GfxRecorder};
use vireo_gfx::commands::state::{GfxBufferState, GfxImageState};
use vireo_gfx::foundation::driver::{GfxDescriptorKind, GfxDriver};
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxSamplerDesc, GfxViewDesc};

use crate::descriptors::{FgDescriptorArena, FgDescriptorKey};
use crate::handle::FgResourceHandle;
use crate::pipeline::{FgPipeline, FgTargetFormats};
use crate::registry::FgResourceRegistry;
use crate::state_tracker::{FgBarrierKind, FgStateTracker};
use crate::transient::FgTransientAllocator;

pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_VIEWPORTS: usize = 8;

/// 属性表整表重解析的重试上限；超过说明表比堆块还大，属于配置错误
const PROPERTY_RESOLVE_RETRY_LIMIT: u32 = 2;

bitflags::bitflags! {
    /// "需要 native commit" 的组掩码
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FgCommitMask: u32 {
        const RENDER_TARGETS = 1 << 0;
        const VIEWPORTS = 1 << 1;
        const SCISSORS = 1 << 2;
        const STENCIL_REF = 1 << 3;
        const VERTEX_BUFFER = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
        const PIPELINE = 1 << 6;
        const HEAPS = 1 << 7;
        const PROPERTIES = 1 << 8;
    }
}

/// flush 的可报告失败
///
/// 与 §native 失败不同，这类配置错误在内容迭代期是常态，
/// 跳过当次 draw 即可，不应让进程挂掉。
#[derive(Debug)]
pub enum FgFlushError {
    /// pipeline 没有匹配当前绑定目标格式的变体
    MissingPipelineVariant { pipeline: String, formats: FgTargetFormats },
}

impl std::fmt::Display for FgFlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPipelineVariant { pipeline, formats } => {
                write!(f, "pipeline '{}' has no variant for target formats {:?}", pipeline, formats)
            }
        }
    }
}

impl std::error::Error for FgFlushError {}

/// dirty 跟踪的单元格：setter 只写值置位，commit 时清位
struct FgDirty<T> {
    value: T,
    dirty: bool,
}

impl<T> FgDirty<T> {
    fn new(value: T) -> Self {
        Self { value, dirty: false }
    }

    fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }
}

/// 属性表里的资源视图引用
#[derive(Clone, Copy, Debug)]
pub enum FgResourceView {
    SampledImage(FgResourceHandle),
    StorageImage(FgResourceHandle),
    UniformBuffer {
        handle: FgResourceHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    StorageBuffer {
        handle: FgResourceHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
}

/// 属性表的一个槽位：resource 或 sampler，至少有一个
#[derive(Clone, Copy, Debug, Default)]
pub struct FgPropertyEntry {
    pub resource: Option<FgResourceView>,
    pub sampler: Option<GfxSamplerDesc>,
}

/// flush 所需的子系统借用集合
pub struct FgExecContext<'a> {
    pub driver: &'a dyn GfxDriver,
    pub recorder: &'a dyn GfxRecorder,
    pub transients: &'a mut FgTransientAllocator,
    pub registry: &'a FgResourceRegistry,
    pub tracker: &'a mut FgStateTracker,
    pub cpu_views: &'a mut FgDescriptorArena,
    pub gpu_views: &'a mut FgDescriptorArena,
    pub samplers: &'a mut FgDescriptorArena,
}

// 句柄解析
impl FgExecContext<'_> {
    /// 解析 image 句柄；未注册的外部句柄是调用方 bug
    pub fn resolve_image(&self, handle: FgResourceHandle) -> (vk::Image, GfxImageDesc) {
        if let Some(image) = self.transients.image(handle) {
            let FgResourceHandle::TransientImage(index) = handle else { unreachable!() };
            return (image, *self.transients.image_desc(index));
        }
        let FgResourceHandle::ExternalImage(external) = handle else { unreachable!() };
        let entry = self.registry.image(external).expect("unregistered external image");
        (entry.image, entry.desc)
    }

    pub fn resolve_buffer(&self, handle: FgResourceHandle) -> (vk::Buffer, GfxBufferDesc) {
        if let Some(buffer) = self.transients.buffer(handle) {
            let FgResourceHandle::TransientBuffer(index) = handle else { unreachable!() };
            return (buffer, *self.transients.buffer_desc(index));
        }
        let FgResourceHandle::ExternalBuffer(external) = handle else { unreachable!() };
        let entry = self.registry.buffer(external).expect("unregistered external buffer");
        (entry.buffer, entry.desc)
    }
}

/// 绑定状态
pub struct FgBindingState {
    render_targets: FgDirty<[Option<FgResourceHandle>; MAX_RENDER_TARGETS]>,
    depth_stencil: FgDirty<Option<FgResourceHandle>>,
    viewports: FgDirty<([vk::Viewport; MAX_VIEWPORTS], usize)>,
    scissors: FgDirty<([vk::Rect2D; MAX_VIEWPORTS], usize)>,
    stencil_ref: FgDirty<u32>,
    /// (handle, offset, stride)
    vertex_buffer: FgDirty<Option<(FgResourceHandle, vk::DeviceSize, u32)>>,
    /// (handle, offset, index type)
    index_buffer: FgDirty<Option<(FgResourceHandle, vk::DeviceSize, vk::IndexType)>>,
    pipeline: FgDirty<Option<Rc<FgPipeline>>>,

    property_entries: Vec<FgPropertyEntry>,
    /// 标量常量的原始字节，附在解析出的描述符下标之后一起 push
    property_constants: Vec<u8>,
    properties_dirty: bool,

    /// 上次 commit 的目标格式，pipeline 变体查找用
    committed_formats: FgTargetFormats,
}

impl Default for FgBindingState {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl FgBindingState {
    pub fn new() -> Self {
        Self {
            render_targets: FgDirty::new([None; MAX_RENDER_TARGETS]),
            depth_stencil: FgDirty::new(None),
            viewports: FgDirty::new(([vk::Viewport::default(); MAX_VIEWPORTS], 0)),
            scissors: FgDirty::new(([vk::Rect2D::default(); MAX_VIEWPORTS], 0)),
            stencil_ref: FgDirty::new(0),
            vertex_buffer: FgDirty::new(None),
            index_buffer: FgDirty::new(None),
            pipeline: FgDirty::new(None),
            property_entries: Vec::new(),
            property_constants: Vec::new(),
            properties_dirty: false,
            committed_formats: FgTargetFormats::default(),
        }
    }

    /// 把全部字段标脏；帧开始时 committed 状态不再可信
    pub fn invalidate(&mut self) {
        self.render_targets.dirty = true;
        self.depth_stencil.dirty = true;
        self.viewports.dirty = self.viewports.value.1 > 0;
        self.scissors.dirty = self.scissors.value.1 > 0;
        self.stencil_ref.dirty = true;
        self.vertex_buffer.dirty = self.vertex_buffer.value.is_some();
        self.index_buffer.dirty = self.index_buffer.value.is_some();
        self.pipeline.dirty = self.pipeline.value.is_some();
        self.properties_dirty = !self.property_entries.is_empty();
    }
}

// setter：只置 dirty，不做任何工作
impl FgBindingState {
    pub fn set_render_target(&mut self, slot: usize, handle: Option<FgResourceHandle>) {
        assert!(slot < MAX_RENDER_TARGETS);
        let mut targets = self.render_targets.value;
        targets[slot] = handle;
        self.render_targets.set(targets);
    }

    pub fn set_depth_stencil(&mut self, handle: Option<FgResourceHandle>) {
        self.depth_stencil.set(handle);
    }

    pub fn set_viewports(&mut self, viewports: &[vk::Viewport]) {
        assert!(viewports.len() <= MAX_VIEWPORTS);
        let mut value = ([vk::Viewport::default(); MAX_VIEWPORTS], viewports.len());
        value.0[..viewports.len()].copy_from_slice(viewports);
        self.viewports.set(value);
    }

    pub fn set_scissors(&mut self, scissors: &[vk::Rect2D]) {
        assert!(scissors.len() <= MAX_VIEWPORTS);
        let mut value = ([vk::Rect2D::default(); MAX_VIEWPORTS], scissors.len());
        value.0[..scissors.len()].copy_from_slice(scissors);
        self.scissors.set(value);
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.stencil_ref.set(reference);
    }

    pub fn set_vertex_buffer(&mut self, handle: FgResourceHandle, offset: vk::DeviceSize, stride: u32) {
        self.vertex_buffer.set(Some((handle, offset, stride)));
    }

    pub fn set_index_buffer(&mut self, handle: FgResourceHandle, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.index_buffer.set(Some((handle, offset, index_type)));
    }

    pub fn set_pipeline(&mut self, pipeline: Rc<FgPipeline>) {
        self.pipeline.set(Some(pipeline));
    }

    pub fn set_property(&mut self, slot: usize, entry: FgPropertyEntry) {
        if self.property_entries.len() <= slot {
            self.property_entries.resize_with(slot + 1, FgPropertyEntry::default);
        }
        self.property_entries[slot] = entry;
        self.properties_dirty = true;
    }

    pub fn set_property_constants(&mut self, constants: &[u8]) {
        self.property_constants.clear();
        self.property_constants.extend_from_slice(constants);
        self.properties_dirty = true;
    }

    pub fn clear_properties(&mut self) {
        self.property_entries.clear();
        self.property_constants.clear();
        self.properties_dirty = true;
    }
}

// flush
impl FgBindingState {
    /// 把 desired 状态落到 native recorder
    ///
    /// 固定顺序：render targets/depth → viewports → scissors →
    /// stencil ref → vertex buffer → index buffer → pipeline → 属性表。
    /// 全部 barrier 排队完成后一次 flush，随后只对掩码置位的组发
    /// commit。
    pub fn flush_state(&mut self, ctx: &mut FgExecContext<'_>) -> Result<(), FgFlushError> {
        let _span = tracy_client::span!("FgBindingState::flush_state");

        let mut mask = FgCommitMask::empty();

        // ---- render targets / depth ----
        let mut color_attachments: Vec<GfxColorAttachment> = Vec::new();
        let mut depth_attachment: Option<GfxDepthAttachment> = None;
        let mut target_extent: Option<vk::Extent2D> = None;

        if self.render_targets.dirty || self.depth_stencil.dirty {
            let mut formats = FgTargetFormats::default();

            let mut seen_empty = false;
            for slot_handle in self.render_targets.value {
                let Some(handle) = slot_handle else {
                    seen_empty = true;
                    continue;
                };
                assert!(!seen_empty, "render target slots must be contiguous");
                let (image, desc) = ctx.resolve_image(handle);

                if let FgResourceHandle::TransientImage(index) = handle {
                    ctx.transients.ensure_initialized(index);
                }
                ctx.tracker.request_image_state(image, GfxImageState::COLOR_ATTACHMENT_WRITE, desc.full_range());

                let slot = ctx.cpu_views.descriptor_index(
                    ctx.driver,
                    FgDescriptorKey::RenderTarget(image.as_raw()),
                    &GfxViewDesc::RenderTarget { image, format: desc.format },
                );
                color_attachments.push(GfxColorAttachment {
                    view: ctx.cpu_views.view(ctx.driver, slot.index),
                    format: desc.format,
                    extent: desc.extent,
                    load_op: vk::AttachmentLoadOp::LOAD,
                    clear_color: desc.clear_color,
                });
                formats.colors[formats.color_count as usize] = desc.format;
                formats.color_count += 1;
                target_extent.get_or_insert(desc.extent);
            }

            if let Some(handle) = self.depth_stencil.value {
                let (image, desc) = ctx.resolve_image(handle);

                if let FgResourceHandle::TransientImage(index) = handle {
                    ctx.transients.ensure_initialized(index);
                }
                ctx.tracker.request_image_state(image, GfxImageState::DEPTH_ATTACHMENT_WRITE, desc.full_range());

                let slot = ctx.cpu_views.descriptor_index(
                    ctx.driver,
                    FgDescriptorKey::DepthStencil(image.as_raw()),
                    &GfxViewDesc::DepthStencil { image, format: desc.format },
                );
                depth_attachment = Some(GfxDepthAttachment {
                    view: ctx.cpu_views.view(ctx.driver, slot.index),
                    format: desc.format,
                    extent: desc.extent,
                    load_op: vk::AttachmentLoadOp::LOAD,
                    clear_depth: desc.clear_depth,
                    clear_stencil: desc.clear_stencil,
                });
                formats.depth = desc.format;
                target_extent.get_or_insert(desc.extent);
            }

            self.committed_formats = formats;
            mask |= FgCommitMask::RENDER_TARGETS;
        }

        // ---- viewports / scissors ----
        // 调用方没显式设置时，从绑定的 render target 尺寸推导
        if self.viewports.dirty {
            mask |= FgCommitMask::VIEWPORTS;
        } else if mask.contains(FgCommitMask::RENDER_TARGETS) && self.viewports.value.1 == 0 {
            if let Some(extent) = target_extent {
                self.viewports.value.0[0] = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                self.viewports.value.1 = 1;
                mask |= FgCommitMask::VIEWPORTS;
            }
        }

        if self.scissors.dirty {
            mask |= FgCommitMask::SCISSORS;
        } else if mask.contains(FgCommitMask::RENDER_TARGETS) && self.scissors.value.1 == 0 {
            if let Some(extent) = target_extent {
                self.scissors.value.0[0] = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                };
                self.scissors.value.1 = 1;
                mask |= FgCommitMask::SCISSORS;
            }
        }

        // ---- stencil ref ----
        if self.stencil_ref.dirty {
            mask |= FgCommitMask::STENCIL_REF;
        }

        // ---- vertex / index buffer ----
        let mut resolved_vertex: Option<(vk::Buffer, vk::DeviceSize, u32)> = None;
        if self.vertex_buffer.dirty {
            if let Some((handle, offset, stride)) = self.vertex_buffer.value {
                let (buffer, _) = ctx.resolve_buffer(handle);
                ctx.tracker.request_buffer_state(buffer, GfxBufferState::VERTEX_BUFFER);
                resolved_vertex = Some((buffer, offset, stride));
                mask |= FgCommitMask::VERTEX_BUFFER;
            }
        }

        let mut resolved_index: Option<(vk::Buffer, vk::DeviceSize, vk::IndexType)> = None;
        if self.index_buffer.dirty {
            if let Some((handle, offset, index_type)) = self.index_buffer.value {
                let (buffer, _) = ctx.resolve_buffer(handle);
                ctx.tracker.request_buffer_state(buffer, GfxBufferState::INDEX_BUFFER);
                resolved_index = Some((buffer, offset, index_type));
                mask |= FgCommitMask::INDEX_BUFFER;
            }
        }

        // ---- pipeline ----
        let mut resolved_pipeline: Option<(vk::PipelineBindPoint, vk::Pipeline)> = None;
        if self.pipeline.dirty {
            if let Some(pipeline) = &self.pipeline.value {
                let formats = if pipeline.bind_point() == vk::PipelineBindPoint::GRAPHICS {
                    self.committed_formats
                } else {
                    FgTargetFormats::default()
                };
                let variant = pipeline.variant(&formats).ok_or_else(|| {
                    log::error!("pipeline '{}' has no variant for {:?}", pipeline.debug_name(), formats);
                    FgFlushError::MissingPipelineVariant {
                        pipeline: pipeline.debug_name().to_string(),
                        formats,
                    }
                })?;
                resolved_pipeline = Some((pipeline.bind_point(), variant));
                mask |= FgCommitMask::PIPELINE;
            }
        }

        // ---- transient 首次使用的推迟 clear ----
        // 在任何 commit 之前发出：一批 barrier + 每个资源一条 clear
        ctx.transients.flush_pending_inits(ctx.driver, ctx.tracker, ctx.cpu_views, ctx.recorder);

        // ---- 属性表（最后解析） ----
        let mut property_indices: Vec<u32> = Vec::new();
        if self.properties_dirty && !(self.property_entries.is_empty() && self.property_constants.is_empty()) {
            let mut retries = 0;
            loop {
                property_indices.clear();
                if self.resolve_property_table(ctx, &mut property_indices) {
                    break;
                }
                // 堆轮换：重新绑定堆并整表重解析，保证整张表落在同一个堆代里
                mask |= FgCommitMask::HEAPS;
                retries += 1;
                assert!(retries <= PROPERTY_RESOLVE_RETRY_LIMIT, "property table exceeds descriptor chunk capacity");
            }
            mask |= FgCommitMask::PROPERTIES;
        }

        // ---- barrier 一次性 flush，然后才是 native commit ----
        ctx.tracker.flush_barriers(FgBarrierKind::all(), ctx.recorder);

        if mask.contains(FgCommitMask::RENDER_TARGETS) {
            ctx.recorder.cmd_set_render_targets(&color_attachments, depth_attachment.as_ref());
            self.render_targets.dirty = false;
            self.depth_stencil.dirty = false;
        }
        if mask.contains(FgCommitMask::VIEWPORTS) {
            let (viewports, count) = &self.viewports.value;
            ctx.recorder.cmd_set_viewports(&viewports[..*count]);
            self.viewports.dirty = false;
        }
        if mask.contains(FgCommitMask::SCISSORS) {
            let (scissors, count) = &self.scissors.value;
            ctx.recorder.cmd_set_scissors(&scissors[..*count]);
            self.scissors.dirty = false;
        }
        if mask.contains(FgCommitMask::STENCIL_REF) {
            ctx.recorder.cmd_set_stencil_reference(self.stencil_ref.value);
            self.stencil_ref.dirty = false;
        }
        if mask.contains(FgCommitMask::VERTEX_BUFFER) {
            let (buffer, offset, stride) = resolved_vertex.unwrap();
            ctx.recorder.cmd_bind_vertex_buffer(buffer, offset, stride);
            self.vertex_buffer.dirty = false;
        }
        if mask.contains(FgCommitMask::INDEX_BUFFER) {
            let (buffer, offset, index_type) = resolved_index.unwrap();
            ctx.recorder.cmd_bind_index_buffer(buffer, offset, index_type);
            self.index_buffer.dirty = false;
        }
        if mask.contains(FgCommitMask::PIPELINE) {
            let (bind_point, pipeline) = resolved_pipeline.unwrap();
            ctx.recorder.cmd_bind_pipeline(bind_point, pipeline);
            self.pipeline.dirty = false;
        }
        if mask.contains(FgCommitMask::HEAPS) {
            // 堆重绑必须先于引用新堆下标的属性数据
            let pipeline = self.pipeline.value.as_ref().expect("heap rebind without pipeline");
            ctx.recorder.cmd_bind_descriptor_chunk(
                pipeline.layout(),
                pipeline.bind_point(),
                GfxDescriptorKind::GpuView,
                ctx.gpu_views.active_chunk(),
            );
            ctx.recorder.cmd_bind_descriptor_chunk(
                pipeline.layout(),
                pipeline.bind_point(),
                GfxDescriptorKind::Sampler,
                ctx.samplers.active_chunk(),
            );
        }
        if mask.contains(FgCommitMask::PROPERTIES) {
            let pipeline = self.pipeline.value.as_ref().expect("property table without pipeline");
            let mut blob: Vec<u8> = Vec::with_capacity(property_indices.len() * 4 + self.property_constants.len());
            blob.extend_from_slice(bytemuck::cast_slice(&property_indices));
            blob.extend_from_slice(&self.property_constants);
            ctx.recorder.cmd_push_constants(pipeline.layout(), pipeline.push_constant_stages(), &blob);
            self.properties_dirty = false;
        }

        Ok(())
    }

    /// 解析整张属性表；任何一次解析触发堆轮换就返回 false，调用方整表重来
    ///
    /// 状态请求是幂等的（tracker 对相同请求 no-op），重试安全。
    fn resolve_property_table(&self, ctx: &mut FgExecContext<'_>, indices: &mut Vec<u32>) -> bool {
        let compute = self
            .pipeline
            .value
            .as_ref()
            .map(|p| p.bind_point() == vk::PipelineBindPoint::COMPUTE)
            .unwrap_or(false);

        for entry in &self.property_entries {
            assert!(
                entry.resource.is_some() || entry.sampler.is_some(),
                "property entry with neither resource nor sampler"
            );

            if let Some(view) = entry.resource {
                let slot = match view {
                    FgResourceView::SampledImage(handle) => {
                        let (image, desc) = ctx.resolve_image(handle);
                        let state =
                            if compute { GfxImageState::SHADER_READ_COMPUTE } else { GfxImageState::SHADER_READ_FRAGMENT };
                        ctx.tracker.request_image_state(image, state, desc.full_range());
                        ctx.gpu_views.descriptor_index(
                            ctx.driver,
                            FgDescriptorKey::SampledImage(image.as_raw()),
                            &GfxViewDesc::SampledImage {
                                image,
                                format: desc.format,
                                mip_levels: desc.mip_levels,
                                array_layers: desc.array_layers,
                            },
                        )
                    }
                    FgResourceView::StorageImage(handle) => {
                        let (image, desc) = ctx.resolve_image(handle);
                        ctx.tracker.request_image_state(image, GfxImageState::STORAGE_READ_WRITE_COMPUTE, desc.full_range());
                        ctx.gpu_views.descriptor_index(
                            ctx.driver,
                            FgDescriptorKey::StorageImage(image.as_raw()),
                            &GfxViewDesc::StorageImage { image, format: desc.format },
                        )
                    }
                    FgResourceView::UniformBuffer { handle, offset, range } => {
                        let (buffer, _) = ctx.resolve_buffer(handle);
                        let state = if compute { GfxBufferState::UNIFORM_COMPUTE } else { GfxBufferState::UNIFORM_FRAGMENT };
                        ctx.tracker.request_buffer_state(buffer, state);
                        ctx.gpu_views.descriptor_index(
                            ctx.driver,
                            FgDescriptorKey::UniformBuffer {
                                buffer: buffer.as_raw(),
                                offset,
                                range,
                            },
                            &GfxViewDesc::UniformBuffer { buffer, offset, range },
                        )
                    }
                    FgResourceView::StorageBuffer { handle, offset, range } => {
                        let (buffer, _) = ctx.resolve_buffer(handle);
                        ctx.tracker.request_buffer_state(buffer, GfxBufferState::STORAGE_READ_WRITE_COMPUTE);
                        ctx.gpu_views.descriptor_index(
                            ctx.driver,
                            FgDescriptorKey::StorageBuffer {
                                buffer: buffer.as_raw(),
                                offset,
                                range,
                            },
                            &GfxViewDesc::StorageBuffer { buffer, offset, range },
                        )
                    }
                };
                if slot.heap_changed {
                    return false;
                }
                indices.push(slot.index);
            }

            if let Some(sampler) = entry.sampler {
                let slot = ctx.samplers.descriptor_index(
                    ctx.driver,
                    FgDescriptorKey::Sampler(sampler),
                    &GfxViewDesc::Sampler(sampler),
                );
                if slot.heap_changed {
                    return false;
                }
                indices.push(slot.index);
            }
        }
        true
    }
}

// draw / dispatch：flush 后发一条 native 命令
impl FgBindingState {
    pub fn draw(
        &mut self,
        ctx: &mut FgExecContext<'_>,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), FgFlushError> {
        self.flush_state(ctx)?;
        ctx.recorder.cmd_draw(vertex_count, instance_count, first_vertex, first_instance);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        ctx: &mut FgExecContext<'_>,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), FgFlushError> {
        self.flush_state(ctx)?;
        ctx.recorder.cmd_draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance);
        Ok(())
    }

    pub fn dispatch(
        &mut self,
        ctx: &mut FgExecContext<'_>,
        group_x: u32,
        group_y: u32,
        group_z: u32,
    ) -> Result<(), FgFlushError> {
        self.flush_state(ctx)?;
        ctx.recorder.cmd_dispatch(group_x, group_y, group_z);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::MockGfx;

    struct Fixture {
        gfx: MockGfx,
        transients: FgTransientAllocator,
        registry: FgResourceRegistry,
        tracker: FgStateTracker,
        cpu_views: FgDescriptorArena,
        gpu_views: FgDescriptorArena,
        samplers: FgDescriptorArena,
    }

    impl Fixture {
        fn new() -> Self {
            let gfx = MockGfx::new();
            let cpu_views = FgDescriptorArena::cpu(&gfx, 64);
            let gpu_views = FgDescriptorArena::gpu(&gfx, 64);
            let samplers = FgDescriptorArena::sampler(&gfx, 16);
            Self {
                gfx,
                transients: FgTransientAllocator::new(),
                registry: FgResourceRegistry::new(),
                tracker: FgStateTracker::new(),
                cpu_views,
                gpu_views,
                samplers,
            }
        }

        fn ctx(&mut self) -> FgExecContext<'_> {
            FgExecContext {
                driver: &self.gfx,
                recorder: &self.gfx,
                transients: &mut self.transients,
                registry: &self.registry,
                tracker: &mut self.tracker,
                cpu_views: &mut self.cpu_views,
                gpu_views: &mut self.gpu_views,
                samplers: &mut self.samplers,
            }
        }

        fn teardown(mut self) {
            self.transients.destroy(&self.gfx);
            self.cpu_views.destroy(&self.gfx);
            self.gpu_views.destroy(&self.gfx);
            self.samplers.destroy(&self.gfx);
        }
    }

    #[test]
    fn test_flush_with_nothing_bound_is_silent() {
        let mut fixture = Fixture::new();
        let mut binding = FgBindingState::new();

        let mut ctx = fixture.ctx();
        binding.flush_state(&mut ctx).unwrap();
        assert_eq!(fixture.gfx.recorder_call_count(), 0);

        fixture.teardown();
    }

    #[test]
    fn test_setters_defer_all_work() {
        let mut fixture = Fixture::new();
        let mut binding = FgBindingState::new();

        // setter 本身不产生任何 native 调用
        binding.set_stencil_reference(0x80);
        binding.set_viewports(&[vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: 64.0,
            height: 64.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }]);
        assert_eq!(fixture.gfx.recorder_call_count(), 0);

        let mut ctx = fixture.ctx();
        binding.flush_state(&mut ctx).unwrap();
        let calls = fixture.gfx.calls();
        assert!(calls.contains(&crate::mock_gfx::MockCall::SetStencilRef(0x80)));
        assert!(calls.contains(&crate::mock_gfx::MockCall::SetViewports { count: 1 }));

        // 干净的组第二次 flush 零调用
        fixture.gfx.reset_calls();
        let mut ctx = fixture.ctx();
        binding.flush_state(&mut ctx).unwrap();
        assert_eq!(fixture.gfx.recorder_call_count(), 0);

        fixture.teardown();
    }

    #[test]
    fn test_invalidate_recommits_bound_fields() {
        let mut fixture = Fixture::new();
        let mut binding = FgBindingState::new();

        binding.set_stencil_reference(3);
        let mut ctx = fixture.ctx();
        binding.flush_state(&mut ctx).unwrap();

        fixture.gfx.reset_calls();
        binding.invalidate();
        let mut ctx = fixture.ctx();
        binding.flush_state(&mut ctx).unwrap();
        assert!(fixture.gfx.calls().contains(&crate::mock_gfx::MockCall::SetStencilRef(3)));

        fixture.teardown();
    }

    #[test]
    #[should_panic]
    fn test_empty_property_entry_is_fatal() {
        let mut fixture = Fixture::new();
        let mut binding = FgBindingState::new();

        binding.set_pipeline(Rc::new(FgPipeline::new_compute(
            vk::PipelineLayout::from_raw(0x1),
            vk::Pipeline::from_raw(0x2),
            "bad",
        )));
        // 既没有 resource 也没有 sampler 的槽位：调用方 bug
        binding.set_property(0, FgPropertyEntry::default());

        let mut ctx = fixture.ctx();
        let _ = binding.flush_state(&mut ctx);
    }
}
