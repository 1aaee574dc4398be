//! 指令缓存同步测试

mod common;

use common::{Event, EventLog, map, platform_config, recording_mmu};
use std::sync::{Arc, Barrier};
use vm_hpt::{
    Access, AccessKind, AddressSpace, CoherencyPolicy, HptPerms, PagePerms, PlatformCaps,
    StorageKind,
};

fn user_rx() -> PagePerms {
    PagePerms::READ | PagePerms::EXEC | PagePerms::USER
}

fn flushes_of(log: &EventLog, pfn: u64) -> usize {
    log.lock()
        .iter()
        .filter(|e| **e == Event::Flush { pfn })
        .count()
}

#[test]
fn test_shared_frame_flushed_once_across_spaces() {
    let (mmu, log) = recording_mmu(platform_config(64, 8), false);
    let spaces: Vec<AddressSpace> = (1..=6).map(AddressSpace::user).collect();
    for (i, space) in spaces.iter().enumerate() {
        map(space, 0x10_0000 + ((i as u64) << 12), 0x777, user_rx());
    }

    for (i, space) in spaces.iter().enumerate() {
        let ea = 0x10_0000 + ((i as u64) << 12);
        let outcome = mmu.fill(space, ea, Access::user(AccessKind::Execute)).expect("fill");
        assert!(outcome.is_inserted());
    }

    assert_eq!(flushes_of(&log, 0x777), 1);
    assert_eq!(mmu.coherency().flush_count(), 1);
}

#[test]
fn test_flush_precedes_first_exec_entry() {
    let (mmu, log) = recording_mmu(platform_config(64, 8), false);
    let space = AddressSpace::user(1);
    map(&space, 0x2000, 0x99, user_rx());

    mmu.fill(&space, 0x2000, Access::user(AccessKind::Read)).expect("fill");

    let events = log.lock().clone();
    let flush = events
        .iter()
        .position(|e| *e == Event::Flush { pfn: 0x99 })
        .expect("flushed");
    let insert = events
        .iter()
        .position(|e| matches!(e, Event::Insert { pfn: 0x99, perms, .. } if perms.contains(HptPerms::EXEC)))
        .expect("exec entry inserted");
    assert!(flush < insert);
}

#[test]
fn test_concurrent_exec_faults_flush_once() {
    let (mmu, log) = recording_mmu(platform_config(256, 8), false);
    let threads = 8;
    let spaces: Vec<AddressSpace> = (1..=threads as u32).map(AddressSpace::user).collect();
    for space in &spaces {
        for page in 0..16u64 {
            map(space, page << 12, 0x500 + page % 4, user_rx());
        }
    }
    let barrier = Arc::new(Barrier::new(threads));

    std::thread::scope(|s| {
        for space in &spaces {
            let barrier = Arc::clone(&barrier);
            let mmu = &mmu;
            s.spawn(move || {
                barrier.wait();
                for page in 0..16u64 {
                    let outcome = mmu
                        .fill(space, page << 12, Access::user(AccessKind::Execute))
                        .expect("fill");
                    assert!(outcome.is_inserted());
                    // 返回时该页帧必须已经同步
                    assert!(mmu.coherency().is_synced(0x500 + page % 4));
                }
            });
        }
    });

    for pfn in 0x500..0x504 {
        assert_eq!(flushes_of(&log, pfn), 1, "pfn {pfn:#x}");
    }
}

#[test]
fn test_deferred_until_instruction_fetch() {
    let config = platform_config(64, 8).with_platform(PlatformCaps {
        storage: StorageKind::PlatformOwned,
        ifetch_faults_distinguished: true,
        coherent_icache_on_data_fill: true,
        ..PlatformCaps::default()
    });
    let (mmu, log) = recording_mmu(config, false);
    assert_eq!(mmu.coherency().policy(), CoherencyPolicy::DeferUntilFetch);
    let space = AddressSpace::user(1);
    map(&space, 0x3000, 0x42, user_rx());

    mmu.fill(&space, 0x3000, Access::user(AccessKind::Read)).expect("fill");
    assert_eq!(flushes_of(&log, 0x42), 0);
    assert!(log.lock().iter().all(|e| match e {
        Event::Insert { perms, .. } => !perms.contains(HptPerms::EXEC),
        _ => true,
    }));

    mmu.fill(&space, 0x3000, Access::user(AccessKind::Execute)).expect("fill");
    assert_eq!(flushes_of(&log, 0x42), 1);
    assert!(
        log.lock()
            .iter()
            .any(|e| matches!(e, Event::Update { perms, .. } if perms.contains(HptPerms::EXEC)))
    );
    assert_eq!(mmu.stats().snapshot().deferred_exec, 1);

    // 已同步的页帧在其他空间中直接授予执行权限
    let other = AddressSpace::user(2);
    map(&other, 0x8000, 0x42, user_rx());
    mmu.fill(&other, 0x8000, Access::user(AccessKind::Read)).expect("fill");
    assert_eq!(flushes_of(&log, 0x42), 1);
    assert_eq!(mmu.stats().snapshot().deferred_exec, 1);
}

#[test]
fn test_rewritten_frame_flushed_again() {
    let (mmu, log) = recording_mmu(platform_config(64, 8), false);
    let a = AddressSpace::user(1);
    let b = AddressSpace::user(2);
    map(&a, 0x1000, 0x31, user_rx());
    map(&b, 0x1000, 0x31, user_rx());

    mmu.fill(&a, 0x1000, Access::user(AccessKind::Execute)).expect("fill");
    mmu.coherency().mark_frame_dirty(0x31);
    mmu.fill(&b, 0x1000, Access::user(AccessKind::Execute)).expect("fill");

    assert_eq!(flushes_of(&log, 0x31), 2);
}
