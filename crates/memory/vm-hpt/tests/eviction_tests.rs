//! 淘汰与致命错误测试

mod common;

use common::{Event, FullPlatform, assert_invariant, init_logging, map, platform_config, recording_mmu, user_rw};
use vm_hpt::{
    Access, AccessKind, AddressSpace, HashEngine, HashMmuBuilder, HptError, WhichHash,
};

fn read() -> Access {
    Access::user(AccessKind::Read)
}

fn evictions(log: &common::EventLog) -> usize {
    log.lock().iter().filter(|e| matches!(e, Event::Evict { .. })).count()
}

#[test]
fn test_full_table_then_one_eviction() {
    // 4 组 x 8 槽：32 个连续页恰好填满所有组，第 33 页的主次两组都满
    let (mmu, log) = recording_mmu(platform_config(4, 8), false);
    let space = AddressSpace::user(3);
    let pages: Vec<u64> = (0..33u64).map(|i| i << 12).collect();
    for &ea in &pages {
        map(&space, ea, 0x100 + (ea >> 12), user_rw());
    }

    for &ea in &pages[..32] {
        let outcome = mmu.fill(&space, ea, read()).expect("no fatal error");
        assert_eq!(outcome.placement().map(|p| p.which), Some(WhichHash::Primary));
    }
    assert_eq!(evictions(&log), 0);

    let last = mmu.fill(&space, pages[32], read()).expect("no fatal error");
    assert!(last.is_inserted());
    assert_eq!(evictions(&log), 1);
    assert_eq!(mmu.stats().snapshot().evictions, 1);
    assert_invariant(&mmu, &[(&space, pages.clone())]);
}

#[test]
fn test_one_group_pair_evicts_once_per_overflow() {
    // 所有页落在同一对主/次组上：前 16 页不淘汰，之后每页恰好淘汰一次
    let (mmu, log) = recording_mmu(platform_config(4, 8), false);
    let space = AddressSpace::user(7);
    let tag0 = space.tag_for(0, vm_hpt::PageSize::Base);
    let pages: Vec<u64> = (0..20u64)
        .map(|i| (i * 4) << 12)
        .filter(|&ea| {
            let tag = space.tag_for(ea, vm_hpt::PageSize::Base);
            HashEngine::primary_hash(&tag) & 3 == HashEngine::primary_hash(&tag0) & 3
        })
        .collect();
    assert_eq!(pages.len(), 20);

    for (i, &ea) in pages.iter().enumerate() {
        map(&space, ea, 0x200 + i as u64, user_rw());
        mmu.fill(&space, ea, read()).expect("no fatal error");
        assert_eq!(evictions(&log), i.saturating_sub(15));
    }
    assert_invariant(&mmu, &[(&space, pages)]);
}

#[test]
fn test_evicted_page_refills() {
    let (mmu, log) = recording_mmu(platform_config(2, 1), false);
    let space = AddressSpace::user(1);
    let pages = [0x0000u64, 0x1000, 0x2000, 0x3000];
    for (i, &ea) in pages.iter().enumerate() {
        map(&space, ea, 0x40 + i as u64, user_rw());
    }

    // 两个槽位，四个页轮流访问，每次都能成功
    for round in 0..3 {
        for &ea in &pages {
            let outcome = mmu.fill(&space, ea, read()).expect("no fatal error");
            assert!(outcome.is_inserted(), "round {round} page {ea:#x}");
            assert!(mmu.placement_of(&space, ea).is_some());
        }
    }
    assert!(evictions(&log) > 0);
    assert!(mmu.stats().snapshot().stale_fallbacks > 0);
    assert_invariant(&mmu, &[(&space, pages.to_vec())]);
}

#[test]
fn test_stale_placement_does_not_disturb_new_owner() {
    let (mmu, _log) = recording_mmu(platform_config(1, 1), false);
    let space = AddressSpace::user(1);
    map(&space, 0x1000, 1, user_rw());
    map(&space, 0x2000, 2, user_rw());

    let first = mmu.fill(&space, 0x1000, read()).expect("fill").placement().expect("inserted");
    let second = mmu.fill(&space, 0x2000, read()).expect("fill").placement().expect("inserted");
    assert_eq!(first.slot, second.slot);

    // 0x1000 的放置已过期，失效它不能删除 0x2000 的条目
    assert_eq!(mmu.invalidate_one(&space, 0x1000, 0, vm_hpt::FlushScope::Global), 0);
    assert_eq!(mmu.placement_of(&space, 0x2000), Some(second));
    assert_invariant(&mmu, &[(&space, vec![0x1000, 0x2000])]);
}

#[test]
fn test_no_progress_is_fatal() {
    init_logging();
    let mmu = HashMmuBuilder::new(platform_config(4, 8))
        .platform_service(Box::new(FullPlatform))
        .build()
        .expect("build");
    let space = AddressSpace::user(1);
    map(&space, 0x5000, 9, user_rw());

    let err = mmu.fill(&space, 0x5000, read()).unwrap_err();
    assert!(matches!(err, HptError::TableFull { .. }));
    assert!(err.is_fatal());
    assert!(mmu.placement_of(&space, 0x5000).is_none());
}

#[test]
fn test_bolted_entries_survive_pressure() {
    use vm_hpt::{HptConfig, KernelImage};

    init_logging();
    let config = HptConfig::default()
        .with_group_count(64)
        .with_kernel_image(KernelImage {
            phys_start: 0,
            size: 0x40_000,
        });
    let mmu = HashMmuBuilder::new(config).build().expect("build");
    let bolted = mmu.directory().bolted_entries();
    assert_eq!(bolted, 64);

    let space = AddressSpace::user(11);
    for i in 0..2048u64 {
        map(&space, i << 12, i, user_rw());
        mmu.fill(&space, i << 12, read()).expect("no fatal error");
    }
    let still_bolted = mmu.table_entries().iter().filter(|(_, e)| e.bolted).count();
    assert_eq!(still_bolted, bolted);
}
