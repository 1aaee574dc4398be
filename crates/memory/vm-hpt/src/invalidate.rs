// 哈希条目失效
//
// 删除规范页表项之前必须先使其哈希条目失效。删除按记录的 which_hash
// 重新计算组，并按标签核对槽位内容，槽位已被淘汰或重用时不做任何事。
//
// 批量失效先在定长数组中收集，满 TLB_BATCH_NR 条或结束时一次下发，
// 平台提供批量删除时使用批量删除。

use crate::directory::TranslationDirectory;
use crate::hash::HashEngine;
use crate::platform::{FlushScope, PteService};
use crate::space::AddressSpace;
use crate::stats::HptStats;
use crate::types::{CanonicalPte, Slot, VirtTag};
use crate::TLB_BATCH_NR;
use log::{debug, trace, warn};

/// 待下发的失效批次
struct Batch {
    entries: [(Slot, VirtTag); TLB_BATCH_NR],
    len: usize,
}

impl Batch {
    fn new() -> Self {
        Self {
            entries: [(Slot::default(), VirtTag::default()); TLB_BATCH_NR],
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == TLB_BATCH_NR
    }

    fn push(&mut self, slot: Slot, tag: VirtTag) {
        self.entries[self.len] = (slot, tag);
        self.len += 1;
    }

    fn as_slice(&self) -> &[(Slot, VirtTag)] {
        &self.entries[..self.len]
    }
}

/// 失效服务
pub struct InvalidationService<'a> {
    directory: &'a TranslationDirectory,
    engine: &'a HashEngine,
    stats: &'a HptStats,
}

impl<'a> InvalidationService<'a> {
    pub fn new(directory: &'a TranslationDirectory, engine: &'a HashEngine, stats: &'a HptStats) -> Self {
        Self {
            directory,
            engine,
            stats,
        }
    }

    /// 使 `ea` 所在页的哈希条目失效
    ///
    /// 没有记录放置时什么也不做。返回实际删除的条目数（0 或 1）。
    pub fn invalidate_one(&self, space: &AddressSpace, ea: u64, cpu: usize, scope: FlushScope) -> usize {
        let scope = self.effective_scope(space, cpu, scope);
        let mut guard = space.lock();
        let mut table = guard.lock_table(self.directory.table());
        let (page_table, service) = table.split();

        let Some((slot, tag)) = page_table.lookup_mut(ea).and_then(|pte| self.take(space, ea, pte)) else {
            return 0;
        };
        let removed = usize::from(service.remove(slot, tag, scope));
        self.stats.record_flush(scope);
        self.stats.record_invalidations(removed);
        trace!("invalidate {ea:#x}: slot {} removed={removed}", slot.0);
        removed
    }

    /// 批量失效，结果与逐个调用 `invalidate_one` 相同
    pub fn invalidate_batch(&self, space: &AddressSpace, eas: &[u64], cpu: usize, scope: FlushScope) -> usize {
        let scope = self.effective_scope(space, cpu, scope);
        let mut guard = space.lock();
        let mut table = guard.lock_table(self.directory.table());
        let (page_table, service) = table.split();

        let mut batch = Batch::new();
        let mut removed = 0;
        for &ea in eas {
            if let Some((slot, tag)) = page_table.lookup_mut(ea).and_then(|pte| self.take(space, ea, pte)) {
                batch.push(slot, tag);
                if batch.is_full() {
                    removed += self.flush(service, &mut batch, scope);
                }
            }
        }
        removed += self.flush(service, &mut batch, scope);
        debug!("invalidated {removed} of {} addresses ({scope:?})", eas.len());
        removed
    }

    /// 使 `[start, end)` 内所有已放置的条目失效
    pub fn invalidate_range(
        &self,
        space: &AddressSpace,
        start: u64,
        end: u64,
        cpu: usize,
        scope: FlushScope,
    ) -> usize {
        let scope = self.effective_scope(space, cpu, scope);
        let mut guard = space.lock();
        let mut table = guard.lock_table(self.directory.table());
        let (page_table, service) = table.split();

        let mut batch = Batch::new();
        let mut removed = 0;
        page_table.for_each_in_range(start, end, &mut |ea, pte| {
            if let Some((slot, tag)) = self.take(space, ea, pte) {
                batch.push(slot, tag);
                if batch.is_full() {
                    removed += self.flush(service, &mut batch, scope);
                }
            }
        });
        removed += self.flush(service, &mut batch, scope);
        debug!("invalidated {removed} entries in {start:#x}..{end:#x} ({scope:?})");
        removed
    }

    /// 取出并清除放置，返回待删除的槽位与标签
    fn take(&self, space: &AddressSpace, ea: u64, pte: &mut CanonicalPte) -> Option<(Slot, VirtTag)> {
        let placement = pte.placement.get()?;
        pte.placement.clear();
        let tag = space.tag_for(ea, pte.size);
        debug_assert_eq!(
            self.engine.group_for(&tag, placement.which),
            placement.slot.group_base(self.engine.slots_per_group()),
        );
        Some((placement.slot, tag))
    }

    fn flush(&self, service: &mut dyn PteService, batch: &mut Batch, scope: FlushScope) -> usize {
        if batch.len == 0 {
            return 0;
        }
        let removed = if service.has_bulk_remove() {
            self.stats.record_bulk_batch();
            service.remove_batch(batch.as_slice(), scope)
        } else {
            let mut removed = 0;
            for &(slot, tag) in batch.as_slice() {
                if service.remove(slot, tag, scope) {
                    removed += 1;
                }
            }
            removed
        };
        self.stats.record_flush(scope);
        self.stats.record_invalidations(removed);
        batch.len = 0;
        removed
    }

    /// 发起失效的 `cpu` 不是该空间中唯一运行的 CPU 时，Local 请求升级为 Global
    fn effective_scope(&self, space: &AddressSpace, cpu: usize, scope: FlushScope) -> FlushScope {
        if scope == FlushScope::Local && FlushScope::for_space(space, cpu) == FlushScope::Global {
            warn!(
                "local flush requested by cpu {cpu} for context {} with {} active cpus, using global",
                space.context(),
                space.active_cpu_count()
            );
            self.stats.record_scope_upgrade();
            return FlushScope::Global;
        }
        scope
    }
}
