#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use gpu_suballocator::allocator::{Allocator, AllocatorCreateInfo};
use gpu_suballocator::memory::host::HostMemoryDevice;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

pub fn host_allocator() -> (Arc<HostMemoryDevice>, Allocator) {
    host_allocator_with(AllocatorCreateInfo::default())
}

pub fn host_allocator_with(create_info: AllocatorCreateInfo) -> (Arc<HostMemoryDevice>, Allocator) {
    let device = Arc::new(HostMemoryDevice::discrete_gpu());
    let allocator = Allocator::new(device.clone(), create_info).unwrap();
    (device, allocator)
}

pub fn scenario_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}
