//! Vulkan 设备封装
//!
//! `GfxDevice` 是 `GfxDriver` 的生产实现：instance/device 的创建、
//! vk-mem allocator、描述符堆块和 timeline fence 都在这里。
//! 设备实例通过构造参数显式传递给各个子系统，没有全局单例。

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::foundation::debug_messenger::GfxDebugMsger;
use crate::foundation::driver::{GfxBackingId, GfxDescriptorChunk, GfxDescriptorKind, GfxDriver, GfxStagingBuffer};
use crate::resources::desc::{image_aspect, GfxBufferDesc, GfxImageDesc, GfxViewDesc};

/// bindless set 里各类描述符的 binding 编号
const BINDING_SAMPLED_IMAGE: u32 = 0;
const BINDING_STORAGE_IMAGE: u32 = 1;
const BINDING_UNIFORM_BUFFER: u32 = 2;
const BINDING_STORAGE_BUFFER: u32 = 3;

/// 一个描述符堆块的 native 存储
enum ChunkStorage {
    /// CPU 堆：槽位即 image view
    CpuView { views: Vec<vk::ImageView> },
    /// GPU 堆：descriptor pool + bindless set；image 槽位持有 view
    GpuSet {
        layout: vk::DescriptorSetLayout,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        slot_views: Vec<vk::ImageView>,
    },
    /// Sampler 堆：槽位持有 sampler 对象
    Sampler {
        layout: vk::DescriptorSetLayout,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        slot_samplers: Vec<vk::Sampler>,
    },
}

/// driver 侧的可变表
#[derive(Default)]
struct DriverTables {
    next_id: u64,
    backings: HashMap<u64, vk::DeviceMemory>,
    /// key 是 staging buffer 的 raw handle
    staging: HashMap<u64, vk_mem::Allocation>,
    chunks: HashMap<u64, ChunkStorage>,
    /// debug 泄漏检查：placed buffer/image 的存活计数
    live_buffers: u64,
    live_images: u64,
}

pub struct GfxDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: ManuallyDrop<GfxDebugMsger>,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    debug_utils: ash::ext::debug_utils::Device,
    queue: vk::Queue,
    queue_family: u32,
    vm_allocator: ManuallyDrop<vk_mem::Allocator>,
    /// 计数 fence 背后的 timeline semaphore
    timeline: vk::Semaphore,
    /// backing allocation 使用的 memory type（探测得到）
    backing_memory_type_index: u32,

    tables: RefCell<DriverTables>,

    #[cfg(debug_assertions)]
    destroyed: Cell<bool>,
}

// new & destroy
impl GfxDevice {
    pub fn new(app_name: &str) -> Rc<Self> {
        let _span = tracy_client::span!("GfxDevice::new");

        let entry = unsafe { ash::Entry::load().unwrap() };
        let instance = Self::create_instance(&entry, app_name);
        let debug_messenger = GfxDebugMsger::new(&entry, &instance);

        let pdevice = Self::pick_physical_device(&instance);
        let queue_family = Self::pick_queue_family(&instance, pdevice);
        let device = Self::create_device(&instance, pdevice, queue_family);
        let debug_utils = ash::ext::debug_utils::Device::new(&instance, &device);
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(&instance, &device, pdevice);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        let vm_allocator = unsafe { vk_mem::Allocator::new(vma_ci).unwrap() };

        let mut timeline_ci =
            vk::SemaphoreTypeCreateInfo::default().semaphore_type(vk::SemaphoreType::TIMELINE).initial_value(0);
        let timeline = unsafe {
            device.create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline_ci), None).unwrap()
        };

        let backing_memory_type_index = Self::probe_backing_memory_type(&instance, pdevice, &device);

        let gfx_device = Self {
            _entry: entry,
            instance,
            debug_messenger: ManuallyDrop::new(debug_messenger),
            pdevice,
            device,
            debug_utils,
            queue,
            queue_family,
            vm_allocator: ManuallyDrop::new(vm_allocator),
            timeline,
            backing_memory_type_index,
            tables: RefCell::new(DriverTables::default()),

            #[cfg(debug_assertions)]
            destroyed: Cell::new(false),
        };
        gfx_device.set_object_debug_name(timeline, "queue-fence-timeline");
        Rc::new(gfx_device)
    }

    pub fn destroy(&self) {
        log::info!("destroying device");
        unsafe {
            self.device.device_wait_idle().unwrap();
        }

        {
            let mut tables = self.tables.borrow_mut();

            // debug 泄漏检查：placed 资源必须先于设备释放
            debug_assert_eq!(tables.live_buffers, 0, "leaked placed buffers");
            debug_assert_eq!(tables.live_images, 0, "leaked placed images");
            debug_assert!(tables.staging.is_empty(), "leaked staging buffers");
            debug_assert!(tables.backings.is_empty(), "leaked backing allocations");

            let chunk_ids = tables.chunks.keys().copied().collect_vec();
            for id in chunk_ids {
                let storage = tables.chunks.remove(&id).unwrap();
                self.destroy_chunk_storage(storage);
            }
        }

        unsafe {
            self.device.destroy_semaphore(self.timeline, None);
        }

        #[cfg(debug_assertions)]
        self.destroyed.set(true);
    }
}

impl Drop for GfxDevice {
    /// native 对象的析构顺序：allocator → device → messenger → instance
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert!(self.destroyed.get(), "GfxDevice dropped without destroy()");

        unsafe {
            ManuallyDrop::drop(&mut self.vm_allocator);
            self.device.destroy_device(None);
            ManuallyDrop::drop(&mut self.debug_messenger);
            self.instance.destroy_instance(None);
        }
    }
}

// getter
impl GfxDevice {
    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn vk_instance(&self) -> vk::Instance {
        self.instance.handle()
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdevice
    }

    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// 堆块对应的 bindless set（recorder 重新绑定堆时用）
    pub fn descriptor_chunk_set(&self, chunk: GfxDescriptorChunk) -> vk::DescriptorSet {
        let tables = self.tables.borrow();
        match tables.chunks.get(&chunk.as_raw()) {
            Some(ChunkStorage::GpuSet { set, .. }) | Some(ChunkStorage::Sampler { set, .. }) => *set,
            Some(ChunkStorage::CpuView { .. }) => panic!("CPU view chunk has no descriptor set"),
            None => panic!("unknown descriptor chunk {:?}", chunk),
        }
    }
}

// tools
impl GfxDevice {
    /// native 调用失败的统一出口：排空 validation 消息后 fatal
    fn native_fatal(&self, what: &str, err: vk::Result) -> ! {
        for msg in self.debug_messenger.drain_captured() {
            log::error!("validation: {}", msg);
        }
        panic!("native call failed: {what}: {err:?}");
    }

    pub fn set_object_debug_name(&self, handle: impl Handle, name: impl AsRef<str>) {
        let name = CString::new(name.as_ref()).unwrap();
        unsafe {
            self.debug_utils
                .set_debug_utils_object_name(
                    &vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name),
                )
                .unwrap();
        }
    }

    pub fn allocate_command_buffer(&self, debug_name: &str) -> (vk::CommandPool, vk::CommandBuffer) {
        unsafe {
            let pool = self
                .device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(self.queue_family)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )
                .unwrap_or_else(|e| self.native_fatal("create_command_pool", e));
            let cmd = self
                .device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .unwrap_or_else(|e| self.native_fatal("allocate_command_buffers", e))[0];
            self.set_object_debug_name(cmd, debug_name);
            (pool, cmd)
        }
    }

    pub fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(pool, &[cmd]);
            self.device.destroy_command_pool(pool, None);
        }
    }

    pub fn submit_command_buffer(&self, cmd: vk::CommandBuffer) {
        let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
        let submit = vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&cmd_info));
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())
                .unwrap_or_else(|e| self.native_fatal("queue_submit2", e));
        }
    }
}

// 创建过程的辅助函数
impl GfxDevice {
    fn create_instance(entry: &ash::Entry, app_name: &str) -> ash::Instance {
        let app_name = CString::new(app_name).unwrap();
        let engine_name = CString::new("vireo").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_ref())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name.as_ref())
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let instance_exts = vec![ash::ext::debug_utils::NAME.as_ptr()];

        // debug 构建下开启 validation layer
        let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
        #[cfg(debug_assertions)]
        {
            const VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";
            let available = unsafe { entry.enumerate_instance_layer_properties().unwrap() };
            let has_validation = available
                .iter()
                .any(|l| l.layer_name_as_c_str().map(|n| n == VALIDATION).unwrap_or(false));
            if has_validation {
                layers.push(VALIDATION.as_ptr());
            } else {
                log::warn!("validation layer not available");
            }
        }

        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        let instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_exts)
            .enabled_layer_names(&layers)
            .push_next(&mut debug_utils_messenger_ci);

        unsafe { entry.create_instance(&instance_ci, None).unwrap() }
    }

    fn pick_physical_device(instance: &ash::Instance) -> vk::PhysicalDevice {
        let pdevices = unsafe { instance.enumerate_physical_devices().unwrap() };
        assert!(!pdevices.is_empty(), "no Vulkan physical device");

        let pdevice = pdevices
            .iter()
            .copied()
            .find(|p| {
                let props = unsafe { instance.get_physical_device_properties(*p) };
                props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
            })
            .unwrap_or(pdevices[0]);

        let props = unsafe { instance.get_physical_device_properties(pdevice) };
        log::info!("physical device: {:?}", props.device_name_as_c_str().unwrap_or(c"<unknown>"));
        pdevice
    }

    fn pick_queue_family(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> u32 {
        let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .expect("no graphics+compute queue family") as u32
    }

    fn create_device(instance: &ash::Instance, pdevice: vk::PhysicalDevice, queue_family: u32) -> ash::Device {
        let device_exts = vec![ash::khr::synchronization2::NAME.as_ptr(), ash::khr::dynamic_rendering::NAME.as_ptr()];
        let mut exts_str = String::new();
        for ext in &device_exts {
            exts_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) }));
        }
        log::info!("device exts: {}", exts_str);

        let queue_priorities = [1.0_f32];
        let queue_ci =
            vk::DeviceQueueCreateInfo::default().queue_family_index(queue_family).queue_priorities(&queue_priorities);

        // bindless 描述符堆需要 descriptor indexing 全家桶，
        // 计数 fence 需要 timeline semaphore
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .runtime_descriptor_array(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .enabled_extension_names(&device_exts)
            .push_next(&mut features12)
            .push_next(&mut features13);

        unsafe { instance.create_device(pdevice, &device_ci, None).unwrap() }
    }

    /// 用一个一次性的探测 buffer 选出 backing allocation 的 memory type
    ///
    /// placed buffer 和 image 必须落在同一个 allocation 里；桌面设备的
    /// DEVICE_LOCAL type 同时覆盖两者。
    fn probe_backing_memory_type(instance: &ash::Instance, pdevice: vk::PhysicalDevice, device: &ash::Device) -> u32 {
        let type_bits = unsafe {
            let probe = device
                .create_buffer(
                    &vk::BufferCreateInfo::default().size(4).usage(
                        vk::BufferUsageFlags::TRANSFER_DST
                            | vk::BufferUsageFlags::VERTEX_BUFFER
                            | vk::BufferUsageFlags::INDEX_BUFFER
                            | vk::BufferUsageFlags::UNIFORM_BUFFER
                            | vk::BufferUsageFlags::STORAGE_BUFFER,
                    ),
                    None,
                )
                .unwrap();
            let bits = device.get_buffer_memory_requirements(probe).memory_type_bits;
            device.destroy_buffer(probe, None);
            bits
        };

        let memory_props = unsafe { instance.get_physical_device_memory_properties(pdevice) };
        (0..memory_props.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && memory_props.memory_types[i as usize]
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .expect("no DEVICE_LOCAL memory type for transient backing")
    }

    fn alloc_id(&self) -> u64 {
        let mut tables = self.tables.borrow_mut();
        tables.next_id += 1;
        tables.next_id
    }

    fn destroy_chunk_storage(&self, storage: ChunkStorage) {
        unsafe {
            match storage {
                ChunkStorage::CpuView { views } => {
                    for view in views {
                        if !view.is_null() {
                            self.device.destroy_image_view(view, None);
                        }
                    }
                }
                ChunkStorage::GpuSet { layout, pool, slot_views, .. } => {
                    for view in slot_views {
                        if !view.is_null() {
                            self.device.destroy_image_view(view, None);
                        }
                    }
                    self.device.destroy_descriptor_pool(pool, None);
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
                ChunkStorage::Sampler { layout, pool, slot_samplers, .. } => {
                    for sampler in slot_samplers {
                        if !sampler.is_null() {
                            self.device.destroy_sampler(sampler, None);
                        }
                    }
                    self.device.destroy_descriptor_pool(pool, None);
                    self.device.destroy_descriptor_set_layout(layout, None);
                }
            }
        }
    }

    /// 创建 bindless set（GPU 堆 / sampler 堆共用的路径）
    fn create_bindless_set(
        &self,
        bindings: &[(u32, vk::DescriptorType)],
        capacity: u32,
        debug_name: &str,
    ) -> (vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet) {
        let layout_bindings = bindings
            .iter()
            .map(|(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(*binding)
                    .descriptor_type(*ty)
                    .descriptor_count(capacity)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect_vec();
        let binding_flags = vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            bindings.len()
        ];
        let mut flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&layout_bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_ci);
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_ci, None)
                .unwrap_or_else(|e| self.native_fatal("create_descriptor_set_layout", e))
        };

        let pool_sizes = bindings
            .iter()
            .map(|(_, ty)| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: capacity,
            })
            .collect_vec();
        let pool_ci = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            self.device
                .create_descriptor_pool(&pool_ci, None)
                .unwrap_or_else(|e| self.native_fatal("create_descriptor_pool", e))
        };

        let set = unsafe {
            self.device
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(pool)
                        .set_layouts(std::slice::from_ref(&layout)),
                )
                .unwrap_or_else(|e| self.native_fatal("allocate_descriptor_sets", e))[0]
        };
        self.set_object_debug_name(set, debug_name);

        (layout, pool, set)
    }

    fn create_image_view_2d(&self, image: vk::Image, format: vk::Format, mip_levels: u32, layers: u32) -> vk::ImageView {
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(if layers > 1 { vk::ImageViewType::TYPE_2D_ARRAY } else { vk::ImageViewType::TYPE_2D })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: image_aspect(format),
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: layers,
            });
        unsafe {
            self.device.create_image_view(&view_ci, None).unwrap_or_else(|e| self.native_fatal("create_image_view", e))
        }
    }

    fn create_sampler(&self, desc: &crate::resources::desc::GfxSamplerDesc) -> vk::Sampler {
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mipmap_mode(desc.mipmap_mode)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        if desc.max_anisotropy > 0 {
            create_info = create_info.anisotropy_enable(true).max_anisotropy(desc.max_anisotropy as f32);
        } else {
            create_info = create_info.anisotropy_enable(false);
        }

        if let Some(compare_op) = desc.compare_op {
            create_info = create_info.compare_enable(true).compare_op(compare_op);
        } else {
            create_info = create_info.compare_enable(false);
        }

        unsafe { self.device.create_sampler(&create_info, None).unwrap_or_else(|e| self.native_fatal("create_sampler", e)) }
    }

    /// 把 view 写进 GPU bindless set 的对应 binding
    fn write_gpu_descriptor(&self, set: vk::DescriptorSet, slot: u32, view: &GfxViewDesc, slot_view: &mut vk::ImageView) {
        // 覆写槽位时回收旧 view
        if !slot_view.is_null() {
            unsafe { self.device.destroy_image_view(*slot_view, None) };
            *slot_view = vk::ImageView::null();
        }

        let mut image_info = vk::DescriptorImageInfo::default();
        let mut buffer_info = vk::DescriptorBufferInfo::default();
        let mut write = vk::WriteDescriptorSet::default().dst_set(set).dst_array_element(slot).descriptor_count(1);

        match view {
            GfxViewDesc::SampledImage { image, format, mip_levels, array_layers } => {
                *slot_view = self.create_image_view_2d(*image, *format, *mip_levels, *array_layers);
                image_info = image_info.image_view(*slot_view).image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                write = write
                    .dst_binding(BINDING_SAMPLED_IMAGE)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(std::slice::from_ref(&image_info));
            }
            GfxViewDesc::StorageImage { image, format } => {
                *slot_view = self.create_image_view_2d(*image, *format, 1, 1);
                image_info = image_info.image_view(*slot_view).image_layout(vk::ImageLayout::GENERAL);
                write = write
                    .dst_binding(BINDING_STORAGE_IMAGE)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_info));
            }
            GfxViewDesc::UniformBuffer { buffer, offset, range } => {
                buffer_info = buffer_info.buffer(*buffer).offset(*offset).range(*range);
                write = write
                    .dst_binding(BINDING_UNIFORM_BUFFER)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_info));
            }
            GfxViewDesc::StorageBuffer { buffer, offset, range } => {
                buffer_info = buffer_info.buffer(*buffer).offset(*offset).range(*range);
                write = write
                    .dst_binding(BINDING_STORAGE_BUFFER)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(&buffer_info));
            }
            _ => panic!("view kind not allowed in GPU descriptor chunk: {:?}", view),
        }

        unsafe {
            self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }
    }
}

impl GfxDriver for GfxDevice {
    fn create_backing_allocation(&self, size: vk::DeviceSize, debug_name: &str) -> GfxBackingId {
        let _span = tracy_client::span!("GfxDevice::create_backing_allocation");

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(self.backing_memory_type_index);
        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).unwrap_or_else(|e| self.native_fatal("allocate_memory", e))
        };
        self.set_object_debug_name(memory, debug_name);
        log::info!("backing allocation '{}': {} bytes", debug_name, size);

        let id = self.alloc_id();
        self.tables.borrow_mut().backings.insert(id, memory);
        GfxBackingId::from_raw(id)
    }

    fn destroy_backing_allocation(&self, backing: GfxBackingId) {
        let memory = self
            .tables
            .borrow_mut()
            .backings
            .remove(&backing.as_raw())
            .expect("unknown backing allocation");
        unsafe {
            self.device.free_memory(memory, None);
        }
    }

    fn create_placed_buffer(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxBufferDesc,
        debug_name: &str,
    ) -> vk::Buffer {
        let buffer_ci = vk::BufferCreateInfo::default().size(desc.size).usage(desc.usage);
        let buffer = unsafe {
            self.device.create_buffer(&buffer_ci, None).unwrap_or_else(|e| self.native_fatal("create_buffer", e))
        };

        let memory = *self.tables.borrow().backings.get(&backing.as_raw()).expect("unknown backing allocation");
        unsafe {
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            debug_assert_eq!(offset % requirements.alignment, 0, "placement offset misaligned");
            self.device
                .bind_buffer_memory(buffer, memory, offset)
                .unwrap_or_else(|e| self.native_fatal("bind_buffer_memory", e));
        }

        self.set_object_debug_name(buffer, format!("Buffer::{}", debug_name));
        self.tables.borrow_mut().live_buffers += 1;
        buffer
    }

    fn create_placed_image(
        &self,
        backing: GfxBackingId,
        offset: vk::DeviceSize,
        desc: &GfxImageDesc,
        debug_name: &str,
    ) -> vk::Image {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe {
            self.device.create_image(&image_ci, None).unwrap_or_else(|e| self.native_fatal("create_image", e))
        };

        let memory = *self.tables.borrow().backings.get(&backing.as_raw()).expect("unknown backing allocation");
        unsafe {
            let requirements = self.device.get_image_memory_requirements(image);
            debug_assert_eq!(offset % requirements.alignment, 0, "placement offset misaligned");
            self.device
                .bind_image_memory(image, memory, offset)
                .unwrap_or_else(|e| self.native_fatal("bind_image_memory", e));
        }

        self.set_object_debug_name(image, format!("Image::{}", debug_name));
        self.tables.borrow_mut().live_images += 1;
        image
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
        let mut tables = self.tables.borrow_mut();
        debug_assert!(tables.live_buffers > 0);
        tables.live_buffers -= 1;
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe {
            self.device.destroy_image(image, None);
        }
        let mut tables = self.tables.borrow_mut();
        debug_assert!(tables.live_images > 0);
        tables.live_images -= 1;
    }

    fn create_staging_buffer(&self, size: vk::DeviceSize, debug_name: &str) -> GfxStagingBuffer {
        let buffer_ci = vk::BufferCreateInfo::default().size(size).usage(vk::BufferUsageFlags::TRANSFER_SRC);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ..Default::default()
        };
        let (buffer, mut allocation) = unsafe {
            self.vm_allocator
                .create_buffer(&buffer_ci, &alloc_ci)
                .unwrap_or_else(|e| self.native_fatal("create_buffer(staging)", e))
        };
        let mapped_ptr = unsafe {
            self.vm_allocator.map_memory(&mut allocation).unwrap_or_else(|e| self.native_fatal("map_memory", e))
        };

        self.set_object_debug_name(buffer, format!("Buffer::{}", debug_name));
        self.tables.borrow_mut().staging.insert(buffer.as_raw(), allocation);
        GfxStagingBuffer { buffer, mapped_ptr, size }
    }

    fn destroy_staging_buffer(&self, staging: GfxStagingBuffer) {
        let mut allocation = self
            .tables
            .borrow_mut()
            .staging
            .remove(&staging.buffer.as_raw())
            .expect("unknown staging buffer");
        unsafe {
            // resize 前必须 unmap
            self.vm_allocator.unmap_memory(&mut allocation);
            self.vm_allocator.destroy_buffer(staging.buffer, &mut allocation);
        }
    }

    fn create_descriptor_chunk(&self, kind: GfxDescriptorKind, capacity: u32, debug_name: &str) -> GfxDescriptorChunk {
        let storage = match kind {
            GfxDescriptorKind::CpuView => ChunkStorage::CpuView {
                views: vec![vk::ImageView::null(); capacity as usize],
            },
            GfxDescriptorKind::GpuView => {
                let (layout, pool, set) = self.create_bindless_set(
                    &[
                        (BINDING_SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE),
                        (BINDING_STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE),
                        (BINDING_UNIFORM_BUFFER, vk::DescriptorType::UNIFORM_BUFFER),
                        (BINDING_STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER),
                    ],
                    capacity,
                    debug_name,
                );
                ChunkStorage::GpuSet {
                    layout,
                    pool,
                    set,
                    slot_views: vec![vk::ImageView::null(); capacity as usize],
                }
            }
            GfxDescriptorKind::Sampler => {
                let (layout, pool, set) =
                    self.create_bindless_set(&[(0, vk::DescriptorType::SAMPLER)], capacity, debug_name);
                ChunkStorage::Sampler {
                    layout,
                    pool,
                    set,
                    slot_samplers: vec![vk::Sampler::null(); capacity as usize],
                }
            }
        };

        let id = self.alloc_id();
        self.tables.borrow_mut().chunks.insert(id, storage);
        log::debug!("descriptor chunk '{}' ({:?}, capacity {})", debug_name, kind, capacity);
        GfxDescriptorChunk::from_raw(id)
    }

    fn destroy_descriptor_chunk(&self, chunk: GfxDescriptorChunk) {
        let storage = self.tables.borrow_mut().chunks.remove(&chunk.as_raw()).expect("unknown descriptor chunk");
        self.destroy_chunk_storage(storage);
    }

    fn write_descriptor(&self, chunk: GfxDescriptorChunk, slot: u32, view: &GfxViewDesc) {
        let mut tables = self.tables.borrow_mut();
        let storage = tables.chunks.get_mut(&chunk.as_raw()).expect("unknown descriptor chunk");

        match storage {
            ChunkStorage::CpuView { views } => {
                let slot_view = &mut views[slot as usize];
                if !slot_view.is_null() {
                    unsafe { self.device.destroy_image_view(*slot_view, None) };
                    *slot_view = vk::ImageView::null();
                }
                match view {
                    GfxViewDesc::Null => {}
                    GfxViewDesc::RenderTarget { image, format } | GfxViewDesc::DepthStencil { image, format } => {
                        *slot_view = self.create_image_view_2d(*image, *format, 1, 1);
                    }
                    _ => panic!("view kind not allowed in CPU descriptor chunk: {:?}", view),
                }
            }
            ChunkStorage::GpuSet { set, slot_views, .. } => {
                let set = *set;
                self.write_gpu_descriptor(set, slot, view, &mut slot_views[slot as usize]);
            }
            ChunkStorage::Sampler { set, slot_samplers, .. } => {
                let GfxViewDesc::Sampler(sampler_desc) = view else {
                    panic!("view kind not allowed in sampler descriptor chunk: {:?}", view)
                };
                let slot_sampler = &mut slot_samplers[slot as usize];
                if !slot_sampler.is_null() {
                    unsafe { self.device.destroy_sampler(*slot_sampler, None) };
                }
                *slot_sampler = self.create_sampler(sampler_desc);

                let image_info = vk::DescriptorImageInfo::default().sampler(*slot_sampler);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(*set)
                    .dst_binding(0)
                    .dst_array_element(slot)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(std::slice::from_ref(&image_info));
                unsafe {
                    self.device.update_descriptor_sets(std::slice::from_ref(&write), &[]);
                }
            }
        }
    }

    fn descriptor_view(&self, chunk: GfxDescriptorChunk, slot: u32) -> vk::ImageView {
        let tables = self.tables.borrow();
        match tables.chunks.get(&chunk.as_raw()) {
            Some(ChunkStorage::CpuView { views }) => views[slot as usize],
            Some(_) => panic!("descriptor_view is only valid on CPU view chunks"),
            None => panic!("unknown descriptor chunk {:?}", chunk),
        }
    }

    fn queue_signal(&self, value: u64) {
        let semaphore_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&semaphore_info));
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())
                .unwrap_or_else(|e| self.native_fatal("queue_submit2(signal)", e));
        }
    }

    fn queue_wait(&self, value: u64) {
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe {
            self.device
                .wait_semaphores(&wait_info, u64::MAX)
                .unwrap_or_else(|e| self.native_fatal("wait_semaphores", e));
        }
    }
}
