//! Transient 资源的 aliasing 分配
//!
//! 一整块 backing allocation 按帧图编译器算好的峰值大小创建，帧内
//! 生命周期不重叠的资源在其中按字节偏移 alias。backing 只在需求变大
//! 时重建；所有 transient native 资源每帧释放重建，跨帧没有身份。
//!
//! 同一块 backing 内存每帧被不同的逻辑资源合法复用，所以上一帧的
//! native 引用绝不允许活过 `free_referenced_resources`——这是防止
//! aliasing 腐坏的关键不变式。

use ash::vk;
use vireo_gfx::commands::recorder::{GfxColorAttachment, GfxDepthAttachment, GfxRecorder};
use vireo_gfx::commands::state::GfxImageState;
use vireo_gfx::foundation::driver::{GfxBackingId, GfxDriver};
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc, GfxViewDesc};

use crate::descriptors::{FgDescriptorArena, FgDescriptorKey};
use crate::handle::{FgResourceHandle, FgTransientDesc};
use crate::state_tracker::{FgBarrierKind, FgStateTracker};

/// 帧图编译器产出的一条 placement
pub struct FgTransientPlacement {
    pub desc: FgTransientDesc,
    /// backing allocation 内的字节偏移
    pub offset: vk::DeviceSize,
    pub debug_name: String,
}

enum FgTransientResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Transient aliasing 分配器
#[derive(Default)]
pub struct FgTransientAllocator {
    backing: Option<GfxBackingId>,
    backing_capacity: vk::DeviceSize,
    /// 下标即 transient 句柄的资源表下标
    resources: Vec<FgTransientResource>,
    descs: Vec<FgTransientDesc>,
    names: Vec<String>,
    /// 本帧已清空过的资源
    initialized: Vec<bool>,
    /// 等待首次使用清空的资源
    pending_inits: Vec<u32>,
}

// new & destroy
impl FgTransientAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destroy(&mut self, driver: &dyn GfxDriver) {
        self.free_referenced_resources(driver);
        if let Some(backing) = self.backing.take() {
            driver.destroy_backing_allocation(backing);
        }
        self.backing_capacity = 0;
    }
}

impl Drop for FgTransientAllocator {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.resources.is_empty() && self.backing.is_none(),
                "FgTransientAllocator dropped without destroy()"
            );
        }
    }
}

// 帧准备
impl FgTransientAllocator {
    /// 按编译器给出的峰值与 placement 列表准备本帧的 transient 资源
    ///
    /// backing 只在容量不足时重建；每条 placement 在指定偏移创建一个
    /// placed native 资源并打上调用方给的 debug 名字。
    pub fn prepare_for_execution(
        &mut self,
        driver: &dyn GfxDriver,
        peak_bytes: vk::DeviceSize,
        placements: Vec<FgTransientPlacement>,
    ) {
        let _span = tracy_client::span!("FgTransientAllocator::prepare_for_execution");

        // 上一帧的 native 资源必须已全部释放；无条件先清一遍保证白板
        self.free_referenced_resources(driver);
        assert!(self.resources.is_empty(), "transient resources survived the free pass");

        if peak_bytes > self.backing_capacity {
            if let Some(old) = self.backing.take() {
                driver.destroy_backing_allocation(old);
            }
            log::info!("transient backing grows {} -> {} bytes", self.backing_capacity, peak_bytes);
            self.backing = Some(driver.create_backing_allocation(peak_bytes, "transient-backing"));
            self.backing_capacity = peak_bytes;
        } else if self.backing.is_none() && peak_bytes > 0 {
            self.backing = Some(driver.create_backing_allocation(self.backing_capacity.max(peak_bytes), "transient-backing"));
        }

        for placement in placements {
            debug_assert!(
                placement.offset + placement.desc.estimated_byte_size() <= self.backing_capacity,
                "placement '{}' out of backing bounds",
                placement.debug_name
            );
            let backing = self.backing.expect("placements with zero peak bytes");

            let resource = match &placement.desc {
                FgTransientDesc::Buffer(desc) => FgTransientResource::Buffer(driver.create_placed_buffer(
                    backing,
                    placement.offset,
                    desc,
                    &placement.debug_name,
                )),
                FgTransientDesc::Image(desc) => FgTransientResource::Image(driver.create_placed_image(
                    backing,
                    placement.offset,
                    desc,
                    &placement.debug_name,
                )),
            };
            self.resources.push(resource);
            self.descs.push(placement.desc);
            self.names.push(placement.debug_name);
            self.initialized.push(false);
        }
    }

    /// 释放所有已创建的 transient native 资源并清空跟踪表
    pub fn free_referenced_resources(&mut self, driver: &dyn GfxDriver) {
        for resource in self.resources.drain(..) {
            match resource {
                FgTransientResource::Buffer(buffer) => driver.destroy_buffer(buffer),
                FgTransientResource::Image(image) => driver.destroy_image(image),
            }
        }
        self.descs.clear();
        self.names.clear();
        self.initialized.clear();
        self.pending_inits.clear();
    }
}

// 句柄解析
impl FgTransientAllocator {
    /// 解析 transient buffer 句柄；外部句柄不归这里管，返回 None
    ///
    /// 用 image 句柄解析 buffer 属于调用方 bug。
    pub fn buffer(&self, handle: FgResourceHandle) -> Option<vk::Buffer> {
        match handle {
            FgResourceHandle::TransientBuffer(index) => match &self.resources[index as usize] {
                FgTransientResource::Buffer(buffer) => Some(*buffer),
                FgTransientResource::Image(_) => panic!("handle kind mismatch: {:?} is an image", handle),
            },
            FgResourceHandle::ExternalBuffer(_) => None,
            _ => panic!("handle kind mismatch: {:?} is not a buffer", handle),
        }
    }

    /// 解析 transient image 句柄；外部句柄返回 None
    pub fn image(&self, handle: FgResourceHandle) -> Option<vk::Image> {
        match handle {
            FgResourceHandle::TransientImage(index) => match &self.resources[index as usize] {
                FgTransientResource::Image(image) => Some(*image),
                FgTransientResource::Buffer(_) => panic!("handle kind mismatch: {:?} is a buffer", handle),
            },
            FgResourceHandle::ExternalImage(_) => None,
            _ => panic!("handle kind mismatch: {:?} is not an image", handle),
        }
    }

    /// transient 句柄声明时的描述
    pub fn desc(&self, index: u32) -> &FgTransientDesc {
        &self.descs[index as usize]
    }

    pub fn image_desc(&self, index: u32) -> &GfxImageDesc {
        match &self.descs[index as usize] {
            FgTransientDesc::Image(desc) => desc,
            FgTransientDesc::Buffer(_) => panic!("transient {} is a buffer", index),
        }
    }

    pub fn buffer_desc(&self, index: u32) -> &GfxBufferDesc {
        match &self.descs[index as usize] {
            FgTransientDesc::Buffer(desc) => desc,
            FgTransientDesc::Image(_) => panic!("transient {} is an image", index),
        }
    }

    #[inline]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

// 首次使用清空
impl FgTransientAllocator {
    /// 登记一个 attachment 在首次使用前需要清空
    ///
    /// 新 alias 出来的 RT/DS 在 blend 等 read-modify-write 用法前必须
    /// 清空；实际的 clear 命令推迟到 `flush_pending_inits`，等本帧的
    /// 首次使用集合确定后统一发出。
    pub fn ensure_initialized(&mut self, index: u32) {
        let desc = self.image_desc(index);
        debug_assert!(
            desc.usage.intersects(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
            "ensure_initialized on non-attachment '{}'",
            self.names[index as usize]
        );

        if !self.initialized[index as usize] && !self.pending_inits.contains(&index) {
            self.pending_inits.push(index);
        }
    }

    /// 调用方自己会整屏覆写时，跳过 clear
    pub fn set_as_initialized(&mut self, index: u32) {
        self.initialized[index as usize] = true;
        self.pending_inits.retain(|&i| i != index);
    }

    /// 发出推迟的首次使用 clear：一批 barrier + 每个资源一条 clear
    pub fn flush_pending_inits(
        &mut self,
        driver: &dyn GfxDriver,
        tracker: &mut FgStateTracker,
        cpu_views: &mut FgDescriptorArena,
        recorder: &dyn GfxRecorder,
    ) {
        if self.pending_inits.is_empty() {
            return;
        }
        let _span = tracy_client::span!("FgTransientAllocator::flush_pending_inits");

        let pending = std::mem::take(&mut self.pending_inits);

        // 先把所有待清空的目标排到 attachment 状态，一次性 flush
        for &index in &pending {
            let image = match &self.resources[index as usize] {
                FgTransientResource::Image(image) => *image,
                FgTransientResource::Buffer(_) => unreachable!(),
            };
            let desc = self.image_desc(index);
            let state =
                if desc.is_depth_stencil() { GfxImageState::DEPTH_ATTACHMENT_WRITE } else { GfxImageState::COLOR_ATTACHMENT_WRITE };
            tracker.request_image_state(image, state, desc.full_range());
        }
        tracker.flush_barriers(FgBarrierKind::IMAGE, recorder);

        // 每个资源一条 load-op clear
        for &index in &pending {
            let image = match &self.resources[index as usize] {
                FgTransientResource::Image(image) => *image,
                FgTransientResource::Buffer(_) => unreachable!(),
            };
            let desc = *self.image_desc(index);

            if desc.is_depth_stencil() {
                let slot = cpu_views.descriptor_index(
                    driver,
                    FgDescriptorKey::DepthStencil(ash::vk::Handle::as_raw(image)),
                    &GfxViewDesc::DepthStencil { image, format: desc.format },
                );
                recorder.cmd_clear_depth_target(&GfxDepthAttachment {
                    view: cpu_views.view(driver, slot.index),
                    format: desc.format,
                    extent: desc.extent,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    clear_depth: desc.clear_depth,
                    clear_stencil: desc.clear_stencil,
                });
            } else {
                let slot = cpu_views.descriptor_index(
                    driver,
                    FgDescriptorKey::RenderTarget(ash::vk::Handle::as_raw(image)),
                    &GfxViewDesc::RenderTarget { image, format: desc.format },
                );
                recorder.cmd_clear_color_target(&GfxColorAttachment {
                    view: cpu_views.view(driver, slot.index),
                    format: desc.format,
                    extent: desc.extent,
                    load_op: vk::AttachmentLoadOp::CLEAR,
                    clear_color: desc.clear_color,
                });
            }
            self.initialized[index as usize] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::MockGfx;

    fn color_target(width: u32, height: u32) -> FgTransientDesc {
        FgTransientDesc::Image(GfxImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width, height },
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        ))
    }

    fn placement(desc: FgTransientDesc, offset: vk::DeviceSize, name: &str) -> FgTransientPlacement {
        FgTransientPlacement {
            desc,
            offset,
            debug_name: name.to_string(),
        }
    }

    #[test]
    fn test_aliasing_shares_one_backing_allocation() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();

        // 两个生命周期不重叠的资源，字节区间重叠：合法的 aliasing，
        // 分配器不保留前者的内容，也只创建一块 backing
        allocator.prepare_for_execution(
            &gfx,
            256 * 256 * 4,
            vec![
                placement(color_target(256, 256), 0, "gbuffer-a"),
                placement(color_target(128, 128), 0, "bloom-half"),
            ],
        );
        assert_eq!(gfx.backing_allocations_created(), 1);
        assert_eq!(allocator.resource_count(), 2);

        // 同尺寸的下一帧复用同一块 backing
        allocator.prepare_for_execution(&gfx, 256 * 256 * 4, vec![placement(color_target(256, 256), 0, "gbuffer-a")]);
        assert_eq!(gfx.backing_allocations_created(), 1);

        allocator.destroy(&gfx);
    }

    #[test]
    fn test_backing_recreated_only_on_growth() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();

        allocator.prepare_for_execution(&gfx, 1024, vec![]);
        allocator.prepare_for_execution(&gfx, 512, vec![]);
        assert_eq!(gfx.backing_allocations_created(), 1);

        allocator.prepare_for_execution(&gfx, 4096, vec![]);
        assert_eq!(gfx.backing_allocations_created(), 2);
        assert_eq!(gfx.live_backing_allocations(), 1);

        allocator.destroy(&gfx);
    }

    #[test]
    fn test_transients_are_recreated_every_frame() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();

        allocator.prepare_for_execution(&gfx, 4096, vec![placement(color_target(16, 16), 0, "rt")]);
        let first = allocator.image(FgResourceHandle::TransientImage(0)).unwrap();

        allocator.prepare_for_execution(&gfx, 4096, vec![placement(color_target(16, 16), 0, "rt")]);
        let second = allocator.image(FgResourceHandle::TransientImage(0)).unwrap();

        // 跨帧没有 native 身份；上一帧的 image 已被释放
        assert_ne!(first, second);
        assert_eq!(gfx.live_images(), 1);

        allocator.destroy(&gfx);
    }

    #[test]
    fn test_external_handles_resolve_to_none() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();
        allocator.prepare_for_execution(&gfx, 4096, vec![]);

        let external = FgResourceHandle::ExternalImage(crate::handle::FgExternalImageHandle::default());
        assert!(allocator.image(external).is_none());

        allocator.destroy(&gfx);
    }

    #[test]
    #[should_panic]
    fn test_kind_mismatch_is_fatal() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();
        allocator.prepare_for_execution(&gfx, 4096, vec![placement(color_target(16, 16), 0, "rt")]);

        // image 句柄当 buffer 解析：程序员错误，fatal
        let _ = allocator.buffer(FgResourceHandle::TransientImage(0));
    }

    #[test]
    fn test_pending_inits_batch_barriers_then_clear_each() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();
        let mut tracker = FgStateTracker::new();
        let mut cpu_views = FgDescriptorArena::cpu(&gfx, 16);

        allocator.prepare_for_execution(
            &gfx,
            1 << 20,
            vec![placement(color_target(64, 64), 0, "rt-a"), placement(color_target(64, 64), 1 << 19, "rt-b")],
        );
        allocator.ensure_initialized(0);
        allocator.ensure_initialized(1);
        // 重复登记不会产生第二次 clear
        allocator.ensure_initialized(0);

        allocator.flush_pending_inits(&gfx, &mut tracker, &mut cpu_views, &gfx);
        assert_eq!(gfx.image_barrier_batches(), 1);
        assert_eq!(gfx.clear_count(), 2);

        // 本帧内不会再清第二次
        allocator.ensure_initialized(0);
        allocator.flush_pending_inits(&gfx, &mut tracker, &mut cpu_views, &gfx);
        assert_eq!(gfx.clear_count(), 2);

        cpu_views.destroy(&gfx);
        allocator.destroy(&gfx);
    }

    #[test]
    fn test_set_as_initialized_skips_clear() {
        let gfx = MockGfx::new();
        let mut allocator = FgTransientAllocator::new();
        let mut tracker = FgStateTracker::new();
        let mut cpu_views = FgDescriptorArena::cpu(&gfx, 16);

        allocator.prepare_for_execution(&gfx, 1 << 20, vec![placement(color_target(64, 64), 0, "rt")]);
        allocator.ensure_initialized(0);
        allocator.set_as_initialized(0);

        allocator.flush_pending_inits(&gfx, &mut tracker, &mut cpu_views, &gfx);
        assert_eq!(gfx.clear_count(), 0);

        cpu_views.destroy(&gfx);
        allocator.destroy(&gfx);
    }
}
