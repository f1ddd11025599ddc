mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use common::{host_allocator, host_allocator_with, KIB, MIB};
use gpu_suballocator::allocator::{
    Allocation, AllocationCreateFlags, AllocationCreateInfo, Allocator, AllocatorCreateInfo,
    DeviceMemoryCallbacks, MemoryUsage, PoolCreateFlags, PoolCreateInfo,
};
use gpu_suballocator::memory::device::{DeviceMemory, DeviceMemoryBackend};
use gpu_suballocator::memory::host::HostMemoryDevice;
use gpu_suballocator::memory::{MemoryRequirements, WHOLE_SIZE};
use gpu_suballocator::Error;

#[derive(Clone, Debug)]
enum Op {
    Allocate { size: u64, alignment_shift: u32 },
    Free { index: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..64 * KIB, 0..12u32)
            .prop_map(|(size, alignment_shift)| Op::Allocate { size, alignment_shift }),
        1 => any::<usize>().prop_map(|index| Op::Free { index }),
    ]
}

fn check_live_allocations(allocator: &Allocator, live: &HashMap<Allocation, (u64, u64)>) {
    let mut ranges: Vec<(u64, u64, u64)> = vec![];

    for (allocation, (size, alignment)) in live.iter() {
        let info = allocator.allocation_info(*allocation).unwrap();
        assert_eq!(info.size, *size);
        assert_eq!(info.offset % alignment, 0, "{info:?} is not aligned to {alignment}");
        ranges.push((info.device_memory.0, info.offset, info.offset + info.size));
    }

    ranges.sort();
    for pair in ranges.windows(2) {
        let (memory_a, _, end_a) = pair[0];
        let (memory_b, start_b, _) = pair[1];
        if memory_a == memory_b {
            assert!(end_a <= start_b, "Overlapping allocations: {pair:?}");
        }
    }

    let stats = allocator.calculate_statistics().total.statistics;
    let live_bytes: u64 = live.values().map(|(size, _)| size).sum();
    assert_eq!(stats.allocation_count as usize, live.len());
    assert!(stats.allocation_bytes >= live_bytes);
    assert!(stats.allocation_bytes <= stats.block_bytes);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocations_never_overlap_and_stay_aligned(ops in prop::collection::vec(op(), 1..80)) {
        let (device, allocator) = host_allocator();
        let mut live: HashMap<Allocation, (u64, u64)> = HashMap::new();
        let mut order: Vec<Allocation> = vec![];

        for op in ops {
            match op {
                Op::Allocate { size, alignment_shift } => {
                    let alignment = 1 << alignment_shift;
                    let allocation = allocator
                        .allocate_memory_for_buffer(
                            &MemoryRequirements::new(size, alignment),
                            &AllocationCreateInfo {
                                usage: MemoryUsage::GpuOnly,
                                ..Default::default()
                            },
                        )
                        .unwrap();
                    live.insert(allocation, (size, alignment));
                    order.push(allocation);
                }
                Op::Free { index } => {
                    if order.is_empty() {
                        continue;
                    }
                    let allocation = order.remove(index % order.len());
                    live.remove(&allocation);
                    allocator.free_memory(allocation).unwrap();
                }
            }

            check_live_allocations(&allocator, &live);
        }

        allocator.free_memory_pages(&order).unwrap();
        let stats = allocator.calculate_statistics().total.statistics;
        prop_assert_eq!(stats.allocation_count, 0);
        drop(allocator);
        prop_assert_eq!(device.memory_object_count(), 0);
    }
}

#[test]
fn freed_handles_are_rejected() {
    let (_, allocator) = host_allocator();
    let allocation = allocator
        .allocate_memory(&MemoryRequirements::new(256, 16), &AllocationCreateInfo::default())
        .unwrap();

    allocator.free_memory(allocation).unwrap();

    assert!(matches!(allocator.free_memory(allocation), Err(Error::InvalidHandle(_))));
    assert!(matches!(allocator.allocation_info(allocation), Err(Error::InvalidHandle(_))));
}

#[test]
fn pool_respects_block_limits() {
    let (_, allocator) = host_allocator();
    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * KIB,
            max_block_count: 2,
            ..Default::default()
        })
        .unwrap();

    let create_info = AllocationCreateInfo {
        pool: Some(pool),
        ..Default::default()
    };
    let requirements = MemoryRequirements::new(32 * KIB, 256);

    let allocations = allocator
        .allocate_memory_pages(&requirements, &create_info, 4)
        .unwrap();
    assert_eq!(allocator.pool_statistics(pool).unwrap().block_count, 2);

    assert_eq!(
        allocator.allocate_memory(&requirements, &create_info),
        Err(Error::OutOfDeviceMemory)
    );

    assert!(matches!(allocator.destroy_pool(pool), Err(Error::InvalidArgument(_))));
    allocator.free_memory_pages(&allocations).unwrap();
    allocator.destroy_pool(pool).unwrap();
}

#[test]
fn linear_pool_serves_double_stack() {
    let (_, allocator) = host_allocator();
    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type_index: 1,
            flags: PoolCreateFlags::LINEAR_ALGORITHM,
            block_size: 64 * KIB,
            max_block_count: 1,
            ..Default::default()
        })
        .unwrap();

    let low = allocator
        .allocate_memory(
            &MemoryRequirements::new(KIB, 1),
            &AllocationCreateInfo {
                pool: Some(pool),
                ..Default::default()
            },
        )
        .unwrap();
    let high = allocator
        .allocate_memory(
            &MemoryRequirements::new(KIB, 1),
            &AllocationCreateInfo {
                pool: Some(pool),
                flags: AllocationCreateFlags::UPPER_ADDRESS,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(allocator.allocation_info(low).unwrap().offset, 0);
    assert_eq!(allocator.allocation_info(high).unwrap().offset, 63 * KIB);
}

#[test]
fn mapped_allocations_are_written_through() {
    let (_, allocator) = host_allocator();
    let allocation = allocator
        .allocate_memory(
            &MemoryRequirements::new(16, 4),
            &AllocationCreateInfo {
                usage: MemoryUsage::CpuToGpu,
                flags: AllocationCreateFlags::MAPPED,
                ..Default::default()
            },
        )
        .unwrap();

    assert!(allocator.allocation_info(allocation).unwrap().mapped_data.is_some());

    allocator
        .write_mapped_pod(allocation, 0, &[1u32, 2, 3, 4])
        .unwrap();
    assert_eq!(
        allocator.read_mapped_pod::<u32>(allocation, 4, 3).unwrap(),
        vec![2, 3, 4]
    );
}

#[test]
fn budget_tracks_heap_usage() {
    let (_, allocator) = host_allocator();
    let allocation = allocator
        .allocate_memory(
            &MemoryRequirements::new(MIB, 256),
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();

    let budgets = allocator.heap_budgets();
    assert_eq!(budgets[0].statistics.allocation_bytes, MIB);
    assert_eq!(budgets[0].statistics.block_count, 1);
    assert!(budgets[0].usage >= budgets[0].statistics.block_bytes);
    assert!(budgets[0].budget <= 256 * MIB);

    allocator.free_memory(allocation).unwrap();
    assert_eq!(allocator.heap_budgets()[0].statistics.allocation_bytes, 0);
}

#[test]
fn within_budget_stops_at_the_heap_budget() {
    let device = Arc::new(HostMemoryDevice::discrete_gpu_with_heap_sizes(16 * MIB, 16 * MIB));
    let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();

    let requirements = MemoryRequirements {
        memory_type_bits: 1,
        ..MemoryRequirements::new(MIB, 256)
    };
    let within_budget = AllocationCreateInfo {
        usage: MemoryUsage::GpuOnly,
        flags: AllocationCreateFlags::WITHIN_BUDGET,
        ..Default::default()
    };

    let mut allocations = vec![];
    let error = loop {
        assert!(allocations.len() < 16, "The budget was never reached");
        match allocator.allocate_memory(&requirements, &within_budget) {
            Ok(allocation) => allocations.push(allocation),
            Err(error) => break error,
        }
    };
    assert_eq!(error, Error::OutOfDeviceMemory);
    assert!(allocations.len() >= 8);

    let budget = &allocator.heap_budgets()[0];
    assert!(budget.usage + MIB > budget.budget);

    // Without the flag the heap itself is the only limit.
    allocator
        .allocate_memory(
            &requirements,
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn debug_initialization_marks_created_and_freed_memory() {
    let (device, allocator) = host_allocator_with(AllocatorCreateInfo {
        debug_initialize_allocations: true,
        ..Default::default()
    });
    let create_info = AllocationCreateInfo {
        usage: MemoryUsage::CpuOnly,
        ..Default::default()
    };

    let first = allocator
        .allocate_memory_for_buffer(&MemoryRequirements::new(256, 16), &create_info)
        .unwrap();
    let _second = allocator
        .allocate_memory_for_buffer(&MemoryRequirements::new(256, 16), &create_info)
        .unwrap();

    let mut data = vec![0; 256];
    allocator.read_mapped(first, 0, &mut data).unwrap();
    assert!(data.iter().all(|byte| *byte == 0xDC));

    let (memory, offset) = allocator.memory_binding(first).unwrap();
    allocator.free_memory(first).unwrap();

    let pointer = device.map_memory(memory).unwrap();
    let freed = unsafe { std::slice::from_raw_parts(pointer.as_ptr().add(offset as usize), 256) };
    assert!(freed.iter().all(|byte| *byte == 0xEF));
    device.unmap_memory(memory);
}

#[test]
fn failed_pages_release_the_ones_already_made() {
    let (_, allocator) = host_allocator();
    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * KIB,
            max_block_count: 1,
            ..Default::default()
        })
        .unwrap();

    let result = allocator.allocate_memory_pages(
        &MemoryRequirements::new(32 * KIB, 256),
        &AllocationCreateInfo {
            pool: Some(pool),
            ..Default::default()
        },
        3,
    );
    assert_eq!(result, Err(Error::OutOfDeviceMemory));

    let stats = allocator.pool_statistics(pool).unwrap();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.allocation_bytes, 0);
    allocator.destroy_pool(pool).unwrap();
}

#[test]
fn overwritten_margins_are_reported() {
    let (_, allocator) = host_allocator_with(AllocatorCreateInfo {
        debug_margin: 16,
        detect_corruption: true,
        ..Default::default()
    });

    let allocation = allocator
        .allocate_memory_for_buffer(
            &MemoryRequirements::new(256, 16),
            &AllocationCreateInfo {
                usage: MemoryUsage::CpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocator.check_corruption(u32::MAX), Ok(()));

    let pointer = allocator.map_memory(allocation).unwrap();
    unsafe { pointer.as_ptr().add(256).write(0) };
    allocator.unmap_memory(allocation).unwrap();

    assert!(matches!(
        allocator.check_corruption(u32::MAX),
        Err(Error::CorruptionDetected(_))
    ));

    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type_index: 1,
            block_size: 64 * KIB,
            ..Default::default()
        })
        .unwrap();
    let pooled = allocator
        .allocate_memory(
            &MemoryRequirements::new(256, 16),
            &AllocationCreateInfo {
                pool: Some(pool),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocator.check_pool_corruption(pool), Ok(()));

    let pointer = allocator.map_memory(pooled).unwrap();
    unsafe { pointer.as_ptr().sub(1).write(0) };
    allocator.unmap_memory(pooled).unwrap();

    assert!(matches!(
        allocator.check_pool_corruption(pool),
        Err(Error::CorruptionDetected(_))
    ));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "Memory corruption detected")]
fn freeing_a_corrupted_allocation_panics_in_debug_builds() {
    let (_, allocator) = host_allocator_with(AllocatorCreateInfo {
        debug_margin: 16,
        detect_corruption: true,
        ..Default::default()
    });
    let allocation = allocator
        .allocate_memory_for_buffer(
            &MemoryRequirements::new(64, 16),
            &AllocationCreateInfo {
                usage: MemoryUsage::CpuOnly,
                ..Default::default()
            },
        )
        .unwrap();

    let pointer = allocator.map_memory(allocation).unwrap();
    unsafe { pointer.as_ptr().add(64).write(0) };
    allocator.unmap_memory(allocation).unwrap();

    let _ = allocator.free_memory(allocation);
}

#[test]
fn batched_flushes_reach_the_device_in_one_call() {
    let (device, allocator) = host_allocator();

    // Memory type 3 is host visible without being coherent.
    let requirements = MemoryRequirements {
        memory_type_bits: 1 << 3,
        ..MemoryRequirements::new(100, 64)
    };
    let first = allocator
        .allocate_memory_for_buffer(&requirements, &AllocationCreateInfo::default())
        .unwrap();
    let second = allocator
        .allocate_memory_for_buffer(&requirements, &AllocationCreateInfo::default())
        .unwrap();
    let bindings = [
        allocator.memory_binding(first).unwrap(),
        allocator.memory_binding(second).unwrap(),
    ];
    device.take_flushed_ranges();
    device.take_invalidated_ranges();

    let ranges = [(first, 0, WHOLE_SIZE), (second, 0, WHOLE_SIZE)];

    allocator.flush_allocations(&ranges).unwrap();
    let flushed = device.take_flushed_ranges();
    assert_eq!(flushed.len(), 2);
    for (range, (memory, offset)) in flushed.iter().zip(bindings) {
        assert_eq!((range.memory, range.offset, range.size), (memory, offset, 128));
    }

    allocator.invalidate_allocations(&ranges).unwrap();
    let invalidated = device.take_invalidated_ranges();
    assert_eq!(invalidated, flushed);
}

#[test]
fn device_memory_callbacks_see_every_block() {
    let allocated = Arc::new(AtomicU32::new(0));
    let freed = Arc::new(AtomicU32::new(0));
    let allocated_bytes = Arc::new(AtomicU64::new(0));
    let freed_bytes = Arc::new(AtomicU64::new(0));

    let callbacks = DeviceMemoryCallbacks {
        allocate: Some(Box::new({
            let (count, bytes) = (allocated.clone(), allocated_bytes.clone());
            move |_: u32, _: DeviceMemory, size: u64| {
                count.fetch_add(1, Ordering::SeqCst);
                bytes.fetch_add(size, Ordering::SeqCst);
            }
        })),
        free: Some(Box::new({
            let (count, bytes) = (freed.clone(), freed_bytes.clone());
            move |_: u32, _: DeviceMemory, size: u64| {
                count.fetch_add(1, Ordering::SeqCst);
                bytes.fetch_add(size, Ordering::SeqCst);
            }
        })),
    };

    let (device, allocator) = host_allocator_with(AllocatorCreateInfo {
        device_memory_callbacks: Some(callbacks),
        ..Default::default()
    });

    let allocation = allocator
        .allocate_memory(
            &MemoryRequirements::new(KIB, 256),
            &AllocationCreateInfo {
                usage: MemoryUsage::GpuOnly,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocated.load(Ordering::SeqCst), 1);
    assert_eq!(device.memory_object_count(), 1);

    allocator.free_memory(allocation).unwrap();
    drop(allocator);

    assert_eq!(freed.load(Ordering::SeqCst), 1);
    assert_eq!(
        freed_bytes.load(Ordering::SeqCst),
        allocated_bytes.load(Ordering::SeqCst)
    );
    assert_eq!(device.memory_object_count(), 0);
}

#[test]
fn allocation_info_reports_priority() {
    let (_, allocator) = host_allocator();

    let dedicated = allocator
        .allocate_memory(
            &MemoryRequirements::new(KIB, 256),
            &AllocationCreateInfo {
                flags: AllocationCreateFlags::DEDICATED_MEMORY,
                priority: 0.5,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocator.allocation_info(dedicated).unwrap().priority, 0.5);

    let pool = allocator
        .create_pool(&PoolCreateInfo {
            memory_type_index: 1,
            priority: 0.25,
            ..Default::default()
        })
        .unwrap();
    let pooled = allocator
        .allocate_memory(
            &MemoryRequirements::new(KIB, 256),
            &AllocationCreateInfo {
                pool: Some(pool),
                priority: 1.0,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(allocator.allocation_info(pooled).unwrap().priority, 0.25);
}
