//! Integration tests for the block manager.

use paged_scheduler::core::block_manager::BlockManager;
use paged_scheduler::core::sequence::SequenceGroup;

fn make_group(request_id: u64, prompt_len: usize) -> SequenceGroup {
    let prompt_ids: Vec<u32> = (100..100 + prompt_len as u32).collect();
    SequenceGroup::new(request_id, prompt_ids, request_id)
}

#[test]
fn test_allocate_and_free() {
    let mut manager = BlockManager::new(8, false, 4);
    assert_eq!(manager.num_free_blocks(), 8);
    assert!(manager.can_allocate_blocks(8));
    assert!(!manager.can_allocate_blocks(9));

    let prompt: Vec<u32> = (0..12).collect();
    manager.allocate(0, 3, &prompt).unwrap();
    assert_eq!(manager.num_free_blocks(), 5);
    assert!(manager.has_block_table(0));
    assert_eq!(manager.get_block_table(0).len(), 3);

    manager.free_sequence(0);
    assert_eq!(manager.num_free_blocks(), 8);
    assert!(!manager.has_block_table(0));
    assert!(manager.get_block_table(0).is_empty());
}

#[test]
fn test_used_percentage() {
    let mut manager = BlockManager::new(10, false, 4);
    assert_eq!(manager.get_used_percentage(), 0.0);

    manager.allocate(0, 3, &[1; 12]).unwrap();
    assert_eq!(manager.get_used_percentage(), 30.0);

    manager.free_sequence(0);
    assert_eq!(manager.get_used_percentage(), 0.0);
}

#[test]
fn test_fork_then_free_child_restores_free_count() {
    let mut manager = BlockManager::new(8, false, 4);
    manager.allocate(0, 3, &[1; 12]).unwrap();
    let free_before_fork = manager.num_free_blocks();

    manager.fork_sequence(0, 1);
    // Shared blocks: the fork itself consumes nothing.
    assert_eq!(manager.num_free_blocks(), free_before_fork);
    assert_eq!(manager.get_block_table(1), manager.get_block_table(0));

    manager.free_sequence(1);
    assert_eq!(manager.num_free_blocks(), free_before_fork);
    assert!(manager.has_block_table(0));

    manager.free_sequence(0);
    assert_eq!(manager.num_free_blocks(), 8);
}

#[test]
fn test_append_slots_grows_table_to_logical_length() {
    let mut manager = BlockManager::new(8, false, 4);
    let mut group = make_group(0, 9);
    group.schedule_tokens(9);

    let copy_map = manager.append_slots(&group);
    assert!(copy_map.is_empty());
    assert_eq!(manager.get_block_table(0).len(), 3);
    assert_eq!(manager.num_free_blocks(), 5);
}

#[test]
fn test_required_blocks_for_fresh_group() {
    let manager = BlockManager::new(8, false, 4);
    let mut group = make_group(0, 9);
    group.schedule_tokens(9);

    assert_eq!(manager.required_blocks_count(&group), 3);
    assert!(manager.can_append_slots(&group));
}

#[test]
fn test_append_slots_copies_shared_partial_block() {
    let mut manager = BlockManager::new(8, false, 4);
    let mut group = make_group(0, 6);
    manager.allocate(0, 2, group.prompt_ids()).unwrap();
    group.schedule_tokens(6);
    group.finish_iteration();

    let child = group.sequences()[0].fork(1);
    group.add_sequence(child);
    manager.fork_sequence(0, 1);
    assert_eq!(manager.num_free_blocks(), 6);

    // Both siblings want to write into the shared, half-filled last block.
    group.schedule_tokens(1);
    assert_eq!(manager.required_blocks_count(&group), 2);
    assert!(manager.can_append_slots(&group));

    let copy_map = manager.append_slots(&group);

    // One sibling diverges onto a private copy, the other keeps the original.
    assert_eq!(copy_map.len(), 1);
    let (src, dst_indices) = copy_map.iter().next().unwrap();
    assert_eq!(dst_indices.len(), 1);
    assert_eq!(manager.num_free_blocks(), 5);

    let table0 = manager.get_block_table(0);
    let table1 = manager.get_block_table(1);
    assert_eq!(table0[0], table1[0]);
    assert_ne!(table0[1], table1[1]);
    assert!(table0[1] == *src || table1[1] == *src);
    assert!(table0[1] == dst_indices[0] || table1[1] == dst_indices[0]);
}

#[test]
fn test_free_group_partially_trims_from_tail() {
    let mut manager = BlockManager::new(8, false, 4);
    let mut group = make_group(0, 10);
    manager.allocate(0, 3, group.prompt_ids()).unwrap();
    group.schedule_tokens(10);
    group.finish_iteration();
    assert_eq!(manager.num_free_blocks(), 5);

    let released = manager.free_group_partially(&group, 1);
    assert_eq!(released, 1);
    assert_eq!(manager.num_free_blocks(), 6);
    assert_eq!(manager.get_block_table(0).len(), 2);

    // Asking for more than the group holds empties it and reports what came out.
    let released = manager.free_group_partially(&group, 10);
    assert_eq!(released, 2);
    assert_eq!(manager.num_free_blocks(), 8);
    assert!(manager.get_block_table(0).is_empty());
}

#[test]
fn test_occupied_blocks_counts_unique_blocks_once() {
    let mut manager = BlockManager::new(8, false, 4);
    let mut group = make_group(0, 8);
    manager.allocate(0, 2, group.prompt_ids()).unwrap();

    let child = group.sequences()[0].fork(1);
    group.add_sequence(child);
    manager.fork_sequence(0, 1);

    assert_eq!(manager.get_number_of_blocks_occupied_by_sequence(&group), 2);
}

#[test]
fn test_prefix_cache_shares_blocks_across_requests() {
    let mut manager = BlockManager::new(8, true, 4);
    let prompt: Vec<u32> = (0..8).collect();

    let first = SequenceGroup::new(0, prompt.clone(), 0);
    manager.allocate(0, 2, first.prompt_ids()).unwrap();
    assert_eq!(manager.num_free_blocks(), 6);

    // A second request with the same prompt reuses both blocks and only needs
    // the final prompt token recomputed.
    let mut second = SequenceGroup::new(1, prompt.clone(), 1);
    manager.restore_cached_blocks(&mut second);
    assert_eq!(second.num_processed_tokens(), 7);
    assert_eq!(manager.get_block_table(1), manager.get_block_table(0));
    assert_eq!(manager.num_free_blocks(), 6);

    // A diverging prompt only reuses the shared leading block.
    let mut diverging: Vec<u32> = prompt.clone();
    diverging[5] = 999;
    let mut third = SequenceGroup::new(2, diverging, 2);
    manager.restore_cached_blocks(&mut third);
    assert_eq!(third.num_processed_tokens(), 4);
    assert_eq!(manager.get_block_table(2).len(), 1);
    assert_eq!(manager.get_block_table(2)[0], manager.get_block_table(0)[0]);
}

#[test]
fn test_prefix_cache_allocation_hit_consumes_no_free_blocks() {
    let mut manager = BlockManager::new(8, true, 4);
    let prompt: Vec<u32> = (0..8).collect();

    manager.allocate(0, 2, &prompt).unwrap();
    assert_eq!(manager.num_free_blocks(), 6);

    manager.allocate(1, 2, &prompt).unwrap();
    assert_eq!(manager.num_free_blocks(), 6);
    assert_eq!(manager.get_block_table(1), manager.get_block_table(0));

    // Freeing one owner keeps the shared blocks alive for the other.
    manager.free_sequence(0);
    assert_eq!(manager.num_free_blocks(), 6);
    manager.free_sequence(1);
    assert_eq!(manager.num_free_blocks(), 8);
}

#[test]
fn test_prefix_cache_entries_die_with_their_blocks() {
    let mut manager = BlockManager::new(8, true, 4);
    let prompt: Vec<u32> = (0..8).collect();

    manager.allocate(0, 2, &prompt).unwrap();
    manager.free_sequence(0);
    assert_eq!(manager.num_free_blocks(), 8);

    // The blocks went back to the pool, so there is nothing left to restore.
    let mut group = SequenceGroup::new(1, prompt, 1);
    manager.restore_cached_blocks(&mut group);
    assert_eq!(group.num_processed_tokens(), 0);
    assert!(!manager.has_block_table(1));
}

#[test]
fn test_restore_does_not_attach_partial_blocks() {
    let mut manager = BlockManager::new(8, true, 4);
    let prompt: Vec<u32> = (0..10).collect();

    // Only the two full blocks are hashed; the 2-token tail is not cacheable.
    manager.allocate(0, 3, &prompt).unwrap();

    let mut group = SequenceGroup::new(1, prompt, 1);
    manager.restore_cached_blocks(&mut group);
    assert_eq!(group.num_processed_tokens(), 8);
    assert_eq!(manager.get_block_table(1).len(), 2);
}
