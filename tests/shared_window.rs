mod common;

use common::{ctx_for, run_ranks};
use quorum::{ClusterTopology, CommScope, QuorumError, SharedWindowManager};

/// Each node-local rank contributes 16 bytes; siblings see each other's
/// regions through the same window and read what the owner wrote after
/// a fence (barrier) separates the write and read phases.
#[test]
fn test_window_regions_visible_across_ranks() {
    run_ranks(&[2], |ep| {
        let (ctx, _) = ctx_for(&ep);
        let rank = ep.rank();

        let window = ctx.allocate_shared_window(16, 1, CommScope::Local).unwrap();
        let mine = ctx.query_shared_window(window, rank).unwrap();
        let sibling = ctx.query_shared_window(window, 1 - rank).unwrap();
        assert_eq!(mine.size, 16);
        assert_eq!(sibling.size, 16);
        assert_ne!(mine.base, sibling.base);

        unsafe {
            std::ptr::write_bytes(mine.base as *mut u8, 0x10 + rank as u8, 16);
        }
        ctx.barrier(CommScope::Local).unwrap();

        let seen = unsafe { std::slice::from_raw_parts(sibling.base as *const u8, 16) }.to_vec();
        assert_eq!(seen, vec![0x10 + (1 - rank) as u8; 16], "rank {rank}");

        // Keep the window alive until every rank has read.
        ctx.barrier(CommScope::Local).unwrap();
        ctx.free_shared_window(window, CommScope::Local).unwrap();

        // The copy taken before the free survives it.
        assert_eq!(seen[0], 0x10 + (1 - rank) as u8);
    });
}

#[test]
fn test_manager_query_before_ensure_fails() {
    run_ranks(&[1], |ep| {
        let (ctx, _) = ctx_for(&ep);
        let manager = SharedWindowManager::new();
        assert!(manager.handle().is_none());
        assert!(matches!(
            manager.query(&ctx, 0),
            Err(QuorumError::WindowNotAllocated)
        ));
    });
}

#[test]
fn test_manager_shutdown_idempotent() {
    run_ranks(&[1], |ep| {
        let (ctx, topology) = ctx_for(&ep);
        let mut manager = SharedWindowManager::new();
        manager
            .ensure(&ctx, CommScope::Local, 64, 4, topology.local_rank())
            .unwrap();
        assert!(manager.handle().is_some());

        manager.shutdown(&ctx, CommScope::Local).unwrap();
        assert!(manager.handle().is_none());
        // Second shutdown is a no-op, not a double free.
        manager.shutdown(&ctx, CommScope::Local).unwrap();
    });
}

#[test]
fn test_manager_reuses_window_when_large_enough() {
    run_ranks(&[1], |ep| {
        let (ctx, topology) = ctx_for(&ep);
        let mut manager = SharedWindowManager::new();
        let local = topology.local_rank();

        let first = manager.ensure(&ctx, CommScope::Local, 64, 4, local).unwrap();
        let second = manager.ensure(&ctx, CommScope::Local, 32, 4, local).unwrap();
        assert_eq!(first, second);

        let third = manager.ensure(&ctx, CommScope::Local, 128, 4, local).unwrap();
        assert_ne!(first, third);

        manager.shutdown(&ctx, CommScope::Local).unwrap();
    });
}
