//! 上传 staging ring
//!
//! 一块持久映射的 staging buffer，按帧图声明的峰值上传量准备；
//! 只增不减，resize 前由 driver 完成 unmap。每条上传有预先分配好的
//! 偏移。这里不做任何 CPU/GPU 同步——不覆写在途字节由帧节奏
//! （queue fence）和只增不减的分配策略保证。

use ash::vk;
use vireo_gfx::commands::recorder::GfxRecorder;
use vireo_gfx::commands::state::GfxBufferState;
use vireo_gfx::foundation::driver::{GfxDriver, GfxStagingBuffer};

use crate::state_tracker::{FgBarrierKind, FgStateTracker};

/// 上传偏移的对齐
const UPLOAD_ALIGN: vk::DeviceSize = 16;

/// 上传 staging ring
#[derive(Default)]
pub struct FgUploadRing {
    staging: Option<GfxStagingBuffer>,
    capacity: vk::DeviceSize,
    /// 每个上传槽位在 staging 内的预分配偏移
    offsets: Vec<vk::DeviceSize>,
    sizes: Vec<vk::DeviceSize>,
}

// new & destroy
impl FgUploadRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_capacity(driver: &dyn GfxDriver, capacity: vk::DeviceSize) -> Self {
        let mut ring = Self::default();
        if capacity > 0 {
            ring.staging = Some(driver.create_staging_buffer(capacity, "upload-ring"));
            ring.capacity = capacity;
        }
        ring
    }

    pub fn destroy(&mut self, driver: &dyn GfxDriver) {
        if let Some(staging) = self.staging.take() {
            driver.destroy_staging_buffer(staging);
        }
        self.capacity = 0;
    }
}

// 帧准备
impl FgUploadRing {
    /// 按本帧声明的上传大小列表预分配偏移，必要时增长 staging
    pub fn prepare_for_execution(&mut self, driver: &dyn GfxDriver, upload_sizes: &[vk::DeviceSize]) {
        self.offsets.clear();
        self.sizes.clear();

        let mut total: vk::DeviceSize = 0;
        for &size in upload_sizes {
            self.offsets.push(total);
            self.sizes.push(size);
            total += size.next_multiple_of(UPLOAD_ALIGN);
        }

        if total > self.capacity {
            // 只增不减；resize 必须先销毁（其中完成 unmap）
            if let Some(old) = self.staging.take() {
                driver.destroy_staging_buffer(old);
            }
            log::info!("upload ring grows {} -> {} bytes", self.capacity, total);
            self.staging = Some(driver.create_staging_buffer(total, "upload-ring"));
            self.capacity = total;
        }
    }
}

// 上传
impl FgUploadRing {
    /// 把 CPU 数据拷进槽位对应的映射区间，再录制 buffer-to-buffer copy
    ///
    /// copy 前为源和目标请求传输状态并 flush buffer barrier。
    pub fn upload_buffer(
        &mut self,
        index: u32,
        data: &[u8],
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        tracker: &mut FgStateTracker,
        recorder: &dyn GfxRecorder,
    ) {
        let staging = self.staging.as_ref().expect("upload without prepare_for_execution");
        let offset = self.offsets[index as usize];
        assert!(
            data.len() as vk::DeviceSize <= self.sizes[index as usize],
            "upload {} exceeds its declared size",
            index
        );
        debug_assert!(offset + data.len() as vk::DeviceSize <= staging.size);

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), staging.mapped_ptr.add(offset as usize), data.len());
        }

        tracker.request_buffer_state(staging.buffer, GfxBufferState::TRANSFER_SRC);
        tracker.request_buffer_state(dst, GfxBufferState::TRANSFER_DST);
        tracker.flush_barriers(FgBarrierKind::BUFFER, recorder);

        recorder.cmd_copy_buffer(
            staging.buffer,
            dst,
            vk::BufferCopy {
                src_offset: offset,
                dst_offset,
                size: data.len() as vk::DeviceSize,
            },
        );
    }

    /// 类型化的便捷入口
    pub fn upload_slice<T: bytemuck::Pod>(
        &mut self,
        index: u32,
        data: &[T],
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        tracker: &mut FgStateTracker,
        recorder: &dyn GfxRecorder,
    ) {
        self.upload_buffer(index, bytemuck::cast_slice(data), dst, dst_offset, tracker, recorder);
    }
}

// getter
impl FgUploadRing {
    #[inline]
    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_gfx::MockGfx;

    #[test]
    fn test_ring_grows_and_never_shrinks() {
        let gfx = MockGfx::new();
        let mut ring = FgUploadRing::new();

        ring.prepare_for_execution(&gfx, &[1024]);
        assert_eq!(ring.capacity(), 1024);

        ring.prepare_for_execution(&gfx, &[64]);
        assert_eq!(ring.capacity(), 1024);
        assert_eq!(gfx.staging_buffers_created(), 1);

        ring.prepare_for_execution(&gfx, &[4096, 512]);
        assert_eq!(ring.capacity(), 4096 + 512);
        assert_eq!(gfx.staging_buffers_created(), 2);

        ring.destroy(&gfx);
    }

    #[test]
    fn test_upload_copies_bytes_and_leaves_dst_in_copy_state() {
        let gfx = MockGfx::new();
        let mut ring = FgUploadRing::new();
        let mut tracker = FgStateTracker::new();

        ring.prepare_for_execution(&gfx, &[16, 64]);
        let dst = gfx.create_test_buffer(64);

        let payload: Vec<u8> = (0..64u8).collect();
        ring.upload_buffer(1, &payload, dst, 0, &mut tracker, &gfx);

        // mock 的 shadow memory 做 readback
        assert_eq!(gfx.buffer_contents(dst), payload);
        assert_eq!(tracker.committed_buffer_state(dst), Some(GfxBufferState::TRANSFER_DST));

        ring.destroy(&gfx);
    }

    #[test]
    fn test_upload_respects_preassigned_offsets() {
        let gfx = MockGfx::new();
        let mut ring = FgUploadRing::new();
        let mut tracker = FgStateTracker::new();

        ring.prepare_for_execution(&gfx, &[16, 32]);
        let dst = gfx.create_test_buffer(64);

        ring.upload_buffer(0, &[0xAA; 16], dst, 0, &mut tracker, &gfx);
        ring.upload_buffer(1, &[0xBB; 32], dst, 16, &mut tracker, &gfx);

        let contents = gfx.buffer_contents(dst);
        assert!(contents[..16].iter().all(|&b| b == 0xAA));
        assert!(contents[16..48].iter().all(|&b| b == 0xBB));

        // 两个槽位的 staging 偏移互不重叠
        let copies = gfx.copy_regions();
        assert_eq!(copies[0].src_offset, 0);
        assert_eq!(copies[1].src_offset, 16);

        ring.destroy(&gfx);
    }

    #[test]
    #[should_panic]
    fn test_upload_larger_than_declared_is_fatal() {
        let gfx = MockGfx::new();
        let mut ring = FgUploadRing::new();
        let mut tracker = FgStateTracker::new();

        ring.prepare_for_execution(&gfx, &[8]);
        let dst = gfx.create_test_buffer(64);

        ring.upload_buffer(0, &[0u8; 32], dst, 0, &mut tracker, &gfx);
    }
}
