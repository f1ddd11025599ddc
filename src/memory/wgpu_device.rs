use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::memory::device::{DeviceMemory, DeviceMemoryBackend, MappedMemoryRange};
use crate::memory::{
    align_up, DeviceLimits, DeviceSize, MemoryHeap, MemoryHeapFlags, MemoryProperties,
    MemoryPropertyFlags, MemoryType,
};

/// A backend in which every device memory object is one `wgpu::Buffer`.
///
/// wgpu hides real memory types, so the device exposes a single device-local heap of the given
/// size. Buffers are never mapped; contents move through the queue.
pub struct WgpuMemoryDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    usage: wgpu::BufferUsages,
    properties: MemoryProperties,
    limits: DeviceLimits,
    next_id: AtomicU64,
    buffers: Mutex<HashMap<u64, Arc<wgpu::Buffer>>>,
}

impl WgpuMemoryDevice {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        heap_size: DeviceSize,
        usage: wgpu::BufferUsages,
    ) -> Self {
        let properties = MemoryProperties {
            memory_types: vec![MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            memory_heaps: vec![MemoryHeap {
                size: heap_size,
                flags: MemoryHeapFlags::DEVICE_LOCAL,
            }],
        };

        Self {
            device,
            queue,
            usage: usage | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            properties,
            limits: DeviceLimits {
                buffer_image_granularity: 1,
                non_coherent_atom_size: wgpu::COPY_BUFFER_ALIGNMENT,
                max_memory_allocation_count: 4096,
            },
            next_id: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the default adapter without a surface.
    pub async fn request(heap_size: DeviceSize) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::default(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
        {
            Some(adapter) => adapter,
            None => return Err(Error::Backend(String::from("Failed to retrieve adapter."))),
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    label: Some("SUBALLOCATOR_DEVICE"),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|error| Error::Backend(error.to_string()))?;

        log::info!("Using wgpu adapter: {}", adapter.get_info().name);

        Ok(Self::new(
            Arc::new(device),
            Arc::new(queue),
            heap_size,
            wgpu::BufferUsages::STORAGE,
        ))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<wgpu::Buffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buffer(&self, memory: DeviceMemory) -> Option<Arc<wgpu::Buffer>> {
        self.lock().get(&memory.0).cloned()
    }

    fn require_buffer(&self, memory: DeviceMemory) -> Result<Arc<wgpu::Buffer>> {
        match self.buffer(memory) {
            Some(buffer) => Ok(buffer),
            None => Err(Error::invalid_handle(format!(
                "Unknown device memory: {}",
                memory.0
            ))),
        }
    }

    pub fn write(&self, memory: DeviceMemory, offset: DeviceSize, data: &[u8]) -> Result<()> {
        let buffer = self.require_buffer(memory)?;

        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0
        {
            return Err(Error::invalid_argument(format!(
                "Buffer writes must be aligned to {} bytes",
                wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }

        self.queue.write_buffer(&buffer, offset, data);
        self.queue.submit([]);

        Ok(())
    }

    pub fn copy(
        &self,
        src: DeviceMemory,
        src_offset: DeviceSize,
        dst: DeviceMemory,
        dst_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<()> {
        let src_buffer = self.require_buffer(src)?;
        let dst_buffer = self.require_buffer(dst)?;

        if [src_offset, dst_offset, size]
            .iter()
            .any(|value| value % wgpu::COPY_BUFFER_ALIGNMENT != 0)
        {
            return Err(Error::invalid_argument(format!(
                "Buffer copies must be aligned to {} bytes",
                wgpu::COPY_BUFFER_ALIGNMENT
            )));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("DEFRAGMENTATION_COPY_ENCODER"),
            });
        encoder.copy_buffer_to_buffer(&src_buffer, src_offset, &dst_buffer, dst_offset, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        Ok(())
    }
}

impl DeviceMemoryBackend for WgpuMemoryDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate_memory(&self, memory_type_index: u32, size: DeviceSize) -> Result<DeviceMemory> {
        if memory_type_index != 0 {
            return Err(Error::invalid_argument(format!(
                "The given memory type index is invalid: {memory_type_index}"
            )));
        }

        let size = align_up(size, wgpu::COPY_BUFFER_ALIGNMENT);
        if size > self.device.limits().max_buffer_size {
            return Err(Error::OutOfDeviceMemory);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("DEVICE_MEMORY_BLOCK_{id}");

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size,
            usage: self.usage,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::debug!("wgpu rejected buffer of {size} bytes: {error}");
            buffer.destroy();
            return Err(Error::OutOfDeviceMemory);
        }

        self.lock().insert(id, Arc::new(buffer));

        Ok(DeviceMemory(id))
    }

    fn free_memory(&self, memory: DeviceMemory) {
        match self.lock().remove(&memory.0) {
            Some(buffer) => buffer.destroy(),
            None => log::warn!("Ignoring free of unknown device memory: {}", memory.0),
        }
    }

    fn map_memory(&self, _memory: DeviceMemory) -> Result<NonNull<u8>> {
        Err(Error::MemoryMapFailed)
    }

    fn unmap_memory(&self, _memory: DeviceMemory) {}

    fn flush_memory_ranges(&self, _ranges: &[MappedMemoryRange]) -> Result<()> {
        Ok(())
    }

    fn invalidate_memory_ranges(&self, _ranges: &[MappedMemoryRange]) -> Result<()> {
        Ok(())
    }
}
