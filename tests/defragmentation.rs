mod common;

use common::{host_allocator, KIB};
use gpu_suballocator::allocator::{
    Allocation, AllocationCreateFlags, AllocationCreateInfo, DefragmentationContext,
    DefragmentationFlags, DefragmentationInfo, DefragmentationMoveOperation,
    DefragmentationStats, MemoryUsage, PassStatus,
};
use gpu_suballocator::memory::host::HostMemoryDevice;
use gpu_suballocator::memory::MemoryRequirements;
use gpu_suballocator::Allocator;

const SIZE: u64 = 512 * KIB;

fn host_visible_allocation(allocator: &Allocator, pattern: u8) -> Allocation {
    host_visible_allocation_with(allocator, pattern, AllocationCreateFlags::empty())
}

fn host_visible_allocation_with(
    allocator: &Allocator,
    pattern: u8,
    flags: AllocationCreateFlags,
) -> Allocation {
    let allocation = allocator
        .allocate_memory_for_buffer(
            &MemoryRequirements::new(SIZE, 256),
            &AllocationCreateInfo {
                usage: MemoryUsage::CpuOnly,
                flags,
                ..Default::default()
            },
        )
        .unwrap();
    allocator
        .write_mapped(allocation, 0, &vec![pattern; SIZE as usize])
        .unwrap();
    allocation
}

/// Runs passes until the context reports success, copying every move on the host.
fn run_to_completion(
    device: &HostMemoryDevice,
    allocator: &Allocator,
    context: &mut DefragmentationContext,
    mut on_move: impl FnMut(Allocation),
) {
    loop {
        let pass = context.begin_pass().unwrap();
        for planned in pass.moves.iter() {
            on_move(planned.src_allocation);
            let (src_memory, src_offset) = allocator.memory_binding(planned.src_allocation).unwrap();
            let (dst_memory, dst_offset) =
                allocator.memory_binding(planned.dst_tmp_allocation).unwrap();
            device
                .copy(src_memory, src_offset, dst_memory, dst_offset, SIZE)
                .unwrap();
        }

        if context.end_pass(pass).unwrap() == PassStatus::Success {
            break;
        }
    }
}

#[test]
fn full_defragmentation_compacts_and_preserves_contents() {
    let (device, allocator) = host_allocator();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation(&allocator, index))
        .collect();
    assert_eq!(allocator.calculate_statistics().total.statistics.block_count, 2);

    let mut live = vec![];
    for (index, allocation) in allocations.into_iter().enumerate() {
        match index % 2 {
            0 => live.push((index as u8, allocation)),
            _ => allocator.free_memory(allocation).unwrap(),
        }
    }

    let mut context = allocator
        .begin_defragmentation(&DefragmentationInfo {
            flags: DefragmentationFlags::ALGORITHM_FULL,
            ..Default::default()
        })
        .unwrap();

    loop {
        let pass = context.begin_pass().unwrap();
        for planned in pass.moves.iter() {
            assert_eq!(planned.operation, DefragmentationMoveOperation::Copy);
            let (src_memory, src_offset) = allocator.memory_binding(planned.src_allocation).unwrap();
            let (dst_memory, dst_offset) =
                allocator.memory_binding(planned.dst_tmp_allocation).unwrap();
            device
                .copy(src_memory, src_offset, dst_memory, dst_offset, SIZE)
                .unwrap();
        }

        if context.end_pass(pass).unwrap() == PassStatus::Success {
            break;
        }
    }

    let stats = context.end();
    assert!(stats.allocations_moved >= 4);
    assert_eq!(stats.device_memory_blocks_freed, 1);
    assert!(stats.bytes_freed > 0);

    let total = allocator.calculate_statistics().total.statistics;
    assert_eq!(total.block_count, 1);
    assert_eq!(total.allocation_count, 8);

    for (pattern, allocation) in live {
        let mut data = vec![0; SIZE as usize];
        allocator.read_mapped(allocation, 0, &mut data).unwrap();
        assert!(data.iter().all(|byte| *byte == pattern), "Lost contents of {pattern}");
    }
}

#[test]
fn per_pass_limits_split_the_work() {
    let (device, allocator) = host_allocator();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation(&allocator, index))
        .collect();
    for allocation in allocations.iter().skip(1).step_by(2) {
        allocator.free_memory(*allocation).unwrap();
    }

    let mut context = allocator
        .begin_defragmentation(&DefragmentationInfo {
            flags: DefragmentationFlags::ALGORITHM_FAST,
            max_allocations_per_pass: 1,
            ..Default::default()
        })
        .unwrap();

    let mut passes = 0;
    loop {
        let pass = context.begin_pass().unwrap();
        assert!(pass.moves.len() <= 1);
        passes += 1;

        for planned in pass.moves.iter() {
            let (src_memory, src_offset) = allocator.memory_binding(planned.src_allocation).unwrap();
            let (dst_memory, dst_offset) =
                allocator.memory_binding(planned.dst_tmp_allocation).unwrap();
            device
                .copy(src_memory, src_offset, dst_memory, dst_offset, SIZE)
                .unwrap();
        }

        if context.end_pass(pass).unwrap() == PassStatus::Success {
            break;
        }
    }

    let stats = context.end();
    assert!(passes >= 4);
    assert_eq!(stats.allocations_moved, 4);
    assert_eq!(allocator.calculate_statistics().total.statistics.block_count, 1);
}

#[test]
fn abandoned_context_releases_reservations() {
    let (_, allocator) = host_allocator();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation(&allocator, index))
        .collect();
    for allocation in allocations.iter().step_by(2) {
        allocator.free_memory(*allocation).unwrap();
    }

    {
        let mut context = allocator
            .begin_defragmentation(&DefragmentationInfo::default())
            .unwrap();
        let pass = context.begin_pass().unwrap();
        assert!(!pass.moves.is_empty());
    }

    assert_eq!(allocator.calculate_statistics().total.statistics.allocation_count, 8);
}

#[test]
fn pass_too_small_for_any_allocation_ends_defragmentation() {
    let (_, allocator) = host_allocator();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation(&allocator, index))
        .collect();
    for allocation in allocations.iter().skip(1).step_by(2) {
        allocator.free_memory(*allocation).unwrap();
    }

    let mut context = allocator
        .begin_defragmentation(&DefragmentationInfo {
            flags: DefragmentationFlags::ALGORITHM_FAST,
            max_bytes_per_pass: 256,
            ..Default::default()
        })
        .unwrap();

    let pass = context.begin_pass().unwrap();
    assert!(pass.moves.is_empty());
    assert_eq!(context.end_pass(pass), Ok(PassStatus::Success));
    assert_eq!(context.end(), DefragmentationStats::default());
    assert_eq!(allocator.calculate_statistics().total.statistics.block_count, 2);
}

#[test]
fn persistent_mappings_follow_moved_allocations() {
    let (device, allocator) = host_allocator();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation_with(&allocator, index, AllocationCreateFlags::MAPPED))
        .collect();

    let mut live = vec![];
    for (index, allocation) in allocations.into_iter().enumerate() {
        match index % 2 {
            0 => allocator.free_memory(allocation).unwrap(),
            _ => live.push((index as u8, allocation)),
        }
    }

    let mut context = allocator
        .begin_defragmentation(&DefragmentationInfo {
            flags: DefragmentationFlags::ALGORITHM_FULL,
            ..Default::default()
        })
        .unwrap();
    run_to_completion(&device, &allocator, &mut context, |_| {});
    assert!(context.end().allocations_moved > 0);

    for (pattern, allocation) in live {
        let info = allocator.allocation_info(allocation).unwrap();
        assert!(device.is_mapped(info.device_memory));

        let mapped = info.mapped_data.expect("Mapping was lost by the move");
        let data = unsafe { std::slice::from_raw_parts(mapped.as_ptr(), SIZE as usize) };
        assert!(data.iter().all(|byte| *byte == pattern), "Lost contents of {pattern}");
    }
}

#[test]
fn dedicated_allocations_stay_in_place() {
    let (device, allocator) = host_allocator();

    let dedicated =
        host_visible_allocation_with(&allocator, 0xAA, AllocationCreateFlags::DEDICATED_MEMORY);
    let binding = allocator.memory_binding(dedicated).unwrap();

    let allocations: Vec<_> = (0..16u8)
        .map(|index| host_visible_allocation(&allocator, index))
        .collect();
    for allocation in allocations.iter().step_by(2) {
        allocator.free_memory(*allocation).unwrap();
    }

    let mut context = allocator
        .begin_defragmentation(&DefragmentationInfo {
            flags: DefragmentationFlags::ALGORITHM_FULL,
            ..Default::default()
        })
        .unwrap();
    let mut moved = vec![];
    run_to_completion(&device, &allocator, &mut context, |src| moved.push(src));
    context.end();

    assert!(!moved.is_empty());
    assert!(!moved.contains(&dedicated));
    assert_eq!(allocator.memory_binding(dedicated).unwrap(), binding);

    let mut data = vec![0; SIZE as usize];
    allocator.read_mapped(dedicated, 0, &mut data).unwrap();
    assert!(data.iter().all(|byte| *byte == 0xAA));
}
