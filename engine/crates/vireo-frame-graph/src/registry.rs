//! 外部资源注册表
//!
//! 应用拥有的长生命周期资源登记在这里，帧图只跟踪它们的同步状态，
//! 从不分配或释放它们的 native 对象。
//! 使用 SlotMap 存储，对外提供轻量级的稳定 Handle。

use ash::vk;
use slotmap::SlotMap;
use vireo_gfx::resources::desc::{GfxBufferDesc, GfxImageDesc};

use crate::handle::{FgExternalBufferHandle, FgExternalImageHandle};

/// 注册的外部缓冲区
pub struct FgExternalBuffer {
    pub buffer: vk::Buffer,
    pub desc: GfxBufferDesc,
    pub name: String,
}

/// 注册的外部图像
pub struct FgExternalImage {
    pub image: vk::Image,
    pub desc: GfxImageDesc,
    pub name: String,
}

/// 外部资源注册表
#[derive(Default)]
pub struct FgResourceRegistry {
    buffers: SlotMap<FgExternalBufferHandle, FgExternalBuffer>,
    images: SlotMap<FgExternalImageHandle, FgExternalImage>,
}

// new & init
impl FgResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

// register & unregister
impl FgResourceRegistry {
    pub fn register_buffer(
        &mut self,
        buffer: vk::Buffer,
        desc: GfxBufferDesc,
        name: impl Into<String>,
    ) -> FgExternalBufferHandle {
        self.buffers.insert(FgExternalBuffer {
            buffer,
            desc,
            name: name.into(),
        })
    }

    pub fn register_image(
        &mut self,
        image: vk::Image,
        desc: GfxImageDesc,
        name: impl Into<String>,
    ) -> FgExternalImageHandle {
        self.images.insert(FgExternalImage {
            image,
            desc,
            name: name.into(),
        })
    }

    /// 注销登记；native 对象归应用所有，这里不销毁
    pub fn unregister_buffer(&mut self, handle: FgExternalBufferHandle) {
        if self.buffers.remove(handle).is_none() {
            log::error!("unregister_buffer: unknown handle {:?}", handle);
        }
    }

    pub fn unregister_image(&mut self, handle: FgExternalImageHandle) {
        if self.images.remove(handle).is_none() {
            log::error!("unregister_image: unknown handle {:?}", handle);
        }
    }
}

// getter
impl FgResourceRegistry {
    #[inline]
    pub fn buffer(&self, handle: FgExternalBufferHandle) -> Option<&FgExternalBuffer> {
        self.buffers.get(handle)
    }

    #[inline]
    pub fn image(&self, handle: FgExternalImageHandle) -> Option<&FgExternalImage> {
        self.images.get(handle)
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = FgResourceRegistry::new();
        let handle = registry.register_buffer(
            vk::Buffer::from_raw(0x10),
            GfxBufferDesc::new(64, vk::BufferUsageFlags::UNIFORM_BUFFER),
            "camera-constants",
        );

        let entry = registry.buffer(handle).unwrap();
        assert_eq!(entry.buffer, vk::Buffer::from_raw(0x10));
        assert_eq!(entry.desc.size, 64);
    }

    #[test]
    fn test_unregister_invalidates_handle() {
        let mut registry = FgResourceRegistry::new();
        let handle = registry.register_buffer(
            vk::Buffer::from_raw(0x10),
            GfxBufferDesc::new(64, vk::BufferUsageFlags::UNIFORM_BUFFER),
            "transient-owner-test",
        );
        registry.unregister_buffer(handle);
        assert!(registry.buffer(handle).is_none());
    }
}
