//! 集成测试的公共工具
//!
//! 记录调用的平台原语、记录刷新的 i-cache 原语，以及不变量检查。

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use vm_hpt::{
    AddressSpace, CanonicalPte, FlushScope, HashGeometry, HashMmu, HashMmuBuilder, HashPte,
    HptConfig, HptPerms, IcacheFlusher, InsertResult, NativeHashTable, PagePerms, PlatformCaps,
    PteService, Slot, StorageKind, UpdateOutcome, VirtTag,
};

/// 平台原语与 i-cache 刷新的调用记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Insert { slot: Slot, pfn: u64, perms: HptPerms },
    Update { slot: Slot, perms: HptPerms },
    Remove { slot: Slot, scope: FlushScope },
    BulkRemove { count: usize, scope: FlushScope },
    Evict { slot: Slot },
    Flush { pfn: u64 },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// 包装 `NativeHashTable` 并记录每次成功的修改
pub struct RecordingService {
    table: NativeHashTable,
    log: EventLog,
    bulk: bool,
}

impl RecordingService {
    pub fn new(table: NativeHashTable, log: EventLog, bulk: bool) -> Self {
        Self { table, log, bulk }
    }

    fn record(&self, event: Event) {
        self.log.lock().push(event);
    }
}

impl PteService for RecordingService {
    fn insert(&mut self, group: usize, entry: HashPte) -> InsertResult {
        let result = self.table.insert(group, entry);
        if let InsertResult::Inserted(slot) = result {
            self.record(Event::Insert {
                slot,
                pfn: entry.pfn,
                perms: entry.perms,
            });
        }
        result
    }

    fn remove(&mut self, slot: Slot, tag: VirtTag, scope: FlushScope) -> bool {
        let removed = self.table.remove(slot, tag, scope);
        if removed {
            self.record(Event::Remove { slot, scope });
        }
        removed
    }

    fn update_permission(
        &mut self,
        slot: Slot,
        tag: VirtTag,
        perms: HptPerms,
        scope: FlushScope,
    ) -> UpdateOutcome {
        let outcome = self.table.update_permission(slot, tag, perms, scope);
        if outcome == UpdateOutcome::Updated {
            self.record(Event::Update { slot, perms });
        }
        outcome
    }

    fn evict_one(&mut self, group: usize, hint: usize) -> Option<(Slot, VirtTag)> {
        let victim = self.table.evict_one(group, hint);
        if let Some((slot, _)) = victim {
            self.record(Event::Evict { slot });
        }
        victim
    }

    fn free_slot(&mut self, slot: Slot) {
        self.table.free_slot(slot);
    }

    fn read(&self, slot: Slot) -> Option<HashPte> {
        self.table.read(slot)
    }

    fn has_bulk_remove(&self) -> bool {
        self.bulk
    }

    fn remove_batch(&mut self, batch: &[(Slot, VirtTag)], scope: FlushScope) -> usize {
        let mut removed = 0;
        for &(slot, tag) in batch {
            if self.table.remove(slot, tag, scope) {
                removed += 1;
            }
        }
        self.record(Event::BulkRemove {
            count: removed,
            scope,
        });
        removed
    }
}

/// 永远满的平台表，用于触发致命错误
pub struct FullPlatform;

impl PteService for FullPlatform {
    fn insert(&mut self, _group: usize, _entry: HashPte) -> InsertResult {
        InsertResult::Full
    }

    fn remove(&mut self, _slot: Slot, _tag: VirtTag, _scope: FlushScope) -> bool {
        false
    }

    fn update_permission(
        &mut self,
        _slot: Slot,
        _tag: VirtTag,
        _perms: HptPerms,
        _scope: FlushScope,
    ) -> UpdateOutcome {
        UpdateOutcome::Stale
    }

    fn evict_one(&mut self, _group: usize, _hint: usize) -> Option<(Slot, VirtTag)> {
        None
    }

    fn free_slot(&mut self, _slot: Slot) {}

    fn read(&self, _slot: Slot) -> Option<HashPte> {
        None
    }
}

/// 把刷新写进同一份调用记录，便于检查先后顺序
pub struct RecordingFlusher {
    log: EventLog,
}

impl IcacheFlusher for RecordingFlusher {
    fn flush_frame(&self, pfn: u64) {
        self.log.lock().push(Event::Flush { pfn });
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 平台持有存储的小表配置
pub fn platform_config(groups: usize, slots_per_group: usize) -> HptConfig {
    HptConfig::default()
        .with_group_count(groups)
        .with_slots_per_group(slots_per_group)
        .with_platform(PlatformCaps {
            storage: StorageKind::PlatformOwned,
            ..PlatformCaps::default()
        })
}

/// 使用记录型平台原语构建 MMU
pub fn recording_mmu(config: HptConfig, bulk: bool) -> (HashMmu, EventLog) {
    init_logging();
    let log = EventLog::default();
    let geometry = HashGeometry::from_config(&config).expect("geometry");
    let table = NativeHashTable::new(&geometry).expect("table");
    let mmu = HashMmuBuilder::new(config)
        .platform_service(Box::new(RecordingService::new(table, log.clone(), bulk)))
        .icache_flusher(Arc::new(RecordingFlusher { log: log.clone() }))
        .build()
        .expect("build mmu");
    (mmu, log)
}

pub fn map(space: &AddressSpace, ea: u64, pfn: u64, perms: PagePerms) {
    space.lock().map(ea, CanonicalPte::new(pfn, perms));
}

pub fn pte_of(space: &AddressSpace, ea: u64) -> Option<CanonicalPte> {
    space.lock().lookup_mut(ea).copied()
}

pub fn user_rw() -> PagePerms {
    PagePerms::READ | PagePerms::WRITE | PagePerms::USER
}

/// 非固定条目数
pub fn live_entries(mmu: &HashMmu) -> usize {
    mmu.table_entries().iter().filter(|(_, e)| !e.bolted).count()
}

/// 放置元数据与哈希表内容一致
///
/// 每个有效放置都指向标签匹配、PFN 与权限为规范页表项投影的条目，
/// 并且表中没有无主条目。
pub fn assert_invariant(mmu: &HashMmu, spaces: &[(&AddressSpace, Vec<u64>)]) {
    let mut placed = 0;
    for (space, eas) in spaces {
        for &ea in eas {
            let Some(placement) = mmu.placement_of(space, ea) else {
                continue;
            };
            let pte = pte_of(space, ea).expect("placed page is mapped");
            let entry = mmu
                .table_entries()
                .into_iter()
                .find(|(slot, _)| *slot == placement.slot)
                .map(|(_, entry)| entry)
                .expect("placement points at a live entry");
            assert_eq!(entry.tag, space.tag_for(ea, pte.size));
            assert_eq!(entry.pfn, pte.pfn);
            assert_eq!(entry.which, placement.which);
            assert!(entry.perms.contains(HptPerms::READ));
            assert_eq!(
                entry.perms.contains(HptPerms::WRITE),
                pte.perms.contains(PagePerms::WRITE) && pte.dirty
            );
            placed += 1;
        }
    }
    assert_eq!(live_entries(mmu), placed, "table holds entries no page owns");
}
