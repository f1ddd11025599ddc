use serde_json::{json, Map, Value};

use crate::allocator::allocation::{AllocationRecord, Placement};
use crate::allocator::block_vector::BlockVector;
use crate::allocator::{Allocator, AllocatorState, Pool};
use crate::metadata::{BlockMetadata, Suballocation};

impl Allocator {
    /// Describes the allocator's state as a JSON document. With `detailed_map` every block is
    /// listed with all of its suballocations.
    pub fn build_stats_string(&self, detailed_map: bool) -> String {
        let mut state = self.lock();
        let properties = &self.context.properties;
        let limits = &self.context.limits;

        let total = self.calculate_statistics_locked(&state);

        let budgets: Vec<_> = (0..properties.memory_heaps.len() as u32)
            .map(|heap_index| {
                state
                    .budget
                    .budget(self.context.backend.as_ref(), properties, heap_index)
            })
            .collect();

        let mut memory_info = Map::new();
        for (heap_index, heap) in properties.memory_heaps.iter().enumerate() {
            let mut memory_pools = Map::new();
            for (type_index, memory_type) in properties.memory_types.iter().enumerate() {
                if memory_type.heap_index as usize != heap_index {
                    continue;
                }
                memory_pools.insert(
                    format!("Type {type_index}"),
                    json!({
                        "Flags": flag_names(memory_type.property_flags),
                        "Stats": total.memory_type[type_index],
                    }),
                );
            }

            memory_info.insert(
                format!("Heap {heap_index}"),
                json!({
                    "Flags": flag_names(heap.flags),
                    "Size": heap.size,
                    "Budget": {
                        "BudgetBytes": budgets[heap_index].budget,
                        "UsageBytes": budgets[heap_index].usage,
                    },
                    "Stats": total.memory_heap[heap_index],
                    "MemoryPools": memory_pools,
                }),
            );
        }

        let mut document = json!({
            "General": {
                "MemoryHeapCount": properties.memory_heaps.len(),
                "MemoryTypeCount": properties.memory_types.len(),
                "BufferImageGranularity": self.context.buffer_image_granularity,
                "NonCoherentAtomSize": limits.non_coherent_atom_size,
                "MaxMemoryAllocationCount": limits.max_memory_allocation_count,
                "CurrentFrameIndex": state.frame_index,
            },
            "Total": total.total,
            "MemoryInfo": memory_info,
        });

        if detailed_map {
            let state = &*state;

            let mut default_pools = Map::new();
            for vector in state.default_vectors.iter() {
                let type_index = vector.memory_type_index;
                let dedicated: Vec<_> = state
                    .dedicated_allocations(Some(None))
                    .into_iter()
                    .filter(|(_, record)| record.memory_type_index == type_index)
                    .map(|(id, record)| dedicated_json(id, record))
                    .collect();

                default_pools.insert(
                    format!("Type {type_index}"),
                    vector_json(state, vector, None, dedicated),
                );
            }

            let mut custom_pools = Map::new();
            for (pool_id, entry) in state.pools.iter() {
                let dedicated: Vec<_> = state
                    .dedicated_allocations(Some(Some(Pool(*pool_id))))
                    .into_iter()
                    .map(|(id, record)| dedicated_json(id, record))
                    .collect();

                let pools = custom_pools
                    .entry(format!("Type {}", entry.vector.memory_type_index))
                    .or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(pools) = pools {
                    let mut pool = vector_json(state, &entry.vector, entry.name.as_deref(), dedicated);
                    pool["Id"] = json!(pool_id);
                    pools.push(pool);
                }
            }

            document["DefaultPools"] = Value::Object(default_pools);
            document["CustomPools"] = Value::Object(custom_pools);
        }

        format!("{document:#}")
    }
}

fn flag_names<F: bitflags::Flags>(flags: F) -> Vec<&'static str> {
    flags.iter_names().map(|(name, _)| name).collect()
}

fn vector_json(
    state: &AllocatorState,
    vector: &BlockVector,
    name: Option<&str>,
    dedicated: Vec<Value>,
) -> Value {
    let mut blocks = Map::new();
    for block in vector.blocks.iter() {
        let mut value = metadata_json(block.metadata.as_ref(), |suballocation| {
            let mut entry = json!(suballocation);
            if let Some(record) = state.allocations.get(&suballocation.user_data) {
                entry["UserData"] = json!(record.user_data);
                if let Some(name) = record.name.as_ref() {
                    entry["Name"] = json!(name);
                }
            }
            entry
        });
        value["MapRefCount"] = json!(block.map_count());
        blocks.insert(block.id.to_string(), value);
    }

    let mut value = json!({
        "PreferredBlockSize": vector.preferred_block_size,
        "Priority": vector.priority,
        "Blocks": blocks,
        "DedicatedAllocations": dedicated,
    });
    if let Some(name) = name {
        value["Name"] = json!(name);
    }
    value
}

fn dedicated_json(id: u64, record: &AllocationRecord) -> Value {
    let mut value = json!({
        "Id": id,
        "Type": record.kind.name(),
        "Size": record.size,
        "UserData": record.user_data,
        "Mapped": matches!(record.placement, Placement::Dedicated { mapped: Some(_), .. }),
        "Priority": record.priority,
    });
    if let Some(name) = record.name.as_ref() {
        value["Name"] = json!(name);
    }
    value
}

/// Lists the regions of one block. `describe` renders each live suballocation.
pub(crate) fn metadata_json(
    metadata: &dyn BlockMetadata,
    describe: impl Fn(&Suballocation) -> Value,
) -> Value {
    let suballocations: Vec<_> = metadata
        .regions()
        .iter()
        .map(|region| match region.is_free() {
            true => json!(region),
            false => describe(region),
        })
        .collect();

    json!({
        "TotalBytes": metadata.size(),
        "UnusedBytes": metadata.sum_free_size(),
        "Allocations": metadata.allocation_count(),
        "UnusedRanges": metadata.free_region_count(),
        "Suballocations": suballocations,
    })
}
