// 缺页填充
//
// 状态机：Idle -> PteResolved -> (FastPathUpdate | HashComputed -> Inserted) | Rejected
//
// 整个 PteResolved..Inserted 过程持有地址空间结构锁，同一页的并发缺页被串行化，
// 后到者看到已记录的放置并走原地更新路径。表级锁只在修改哈希表时持有。
// 填充路径不分配内存、不睡眠。

use crate::coherency::{CacheCoherencyTracker, CoherencyPolicy};
use crate::directory::TranslationDirectory;
use crate::error::{HptResult, RejectReason};
use crate::hash::HashEngine;
use crate::platform::{FlushScope, HashPte, UpdateOutcome};
use crate::region::Region;
use crate::space::AddressSpace;
use crate::stats::HptStats;
use crate::types::{Access, AccessKind, CanonicalPte, HptPerms, PagePerms, PageSize, Placement, WhichHash};
use log::trace;

/// 一次填充的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// 哈希表中已有可用条目
    Inserted(Placement),
    /// 普通缺页，交由上层处理
    Rejected(RejectReason),
}

impl FillOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, FillOutcome::Inserted(_))
    }

    pub fn placement(&self) -> Option<Placement> {
        match self {
            FillOutcome::Inserted(placement) => Some(*placement),
            FillOutcome::Rejected(_) => None,
        }
    }
}

/// 内核各区域的地址空间
#[derive(Clone, Copy)]
pub struct KernelSpaces<'a> {
    pub kernel_direct: &'a AddressSpace,
    pub vmalloc: &'a AddressSpace,
    pub ioremap: &'a AddressSpace,
}

impl<'a> KernelSpaces<'a> {
    pub fn get(&self, region: Region) -> Option<&'a AddressSpace> {
        match region {
            Region::User => None,
            Region::KernelDirect => Some(self.kernel_direct),
            Region::Vmalloc => Some(self.vmalloc),
            Region::IoRemap => Some(self.ioremap),
        }
    }
}

/// 填充控制器
pub struct FillController<'a> {
    directory: &'a TranslationDirectory,
    engine: &'a HashEngine,
    coherency: &'a CacheCoherencyTracker,
    stats: &'a HptStats,
    kernel: KernelSpaces<'a>,
}

impl<'a> FillController<'a> {
    pub fn new(
        directory: &'a TranslationDirectory,
        engine: &'a HashEngine,
        coherency: &'a CacheCoherencyTracker,
        stats: &'a HptStats,
        kernel: KernelSpaces<'a>,
    ) -> Self {
        Self {
            directory,
            engine,
            coherency,
            stats,
            kernel,
        }
    }

    /// 处理一次缺页
    ///
    /// `current` 为当前 CPU 上运行的用户地址空间。`Err` 只在表无法前进时返回，
    /// 调用者应当停机。
    pub fn fill(&self, current: &AddressSpace, ea: u64, access: Access) -> HptResult<FillOutcome> {
        self.stats.record_fill();

        let Some(region) = Region::classify(ea) else {
            return Ok(self.reject(ea, RejectReason::Unsupported));
        };
        let space = match region {
            Region::User if current.region() == Region::User => current,
            Region::User => return Ok(self.reject(ea, RejectReason::NoMapping)),
            kernel => match self.kernel.get(kernel) {
                Some(space) => space,
                None => return Ok(self.reject(ea, RejectReason::Unsupported)),
            },
        };

        let mut guard = space.lock();

        // PteResolved
        let pte = match guard.lookup_mut(ea) {
            Some(pte) if pte.present => pte,
            _ => return Ok(self.reject(ea, RejectReason::NoMapping)),
        };
        if !pte.permits(access) {
            return Ok(self.reject(ea, RejectReason::ProtectionViolation));
        }
        pte.accessed = true;
        if access.is_write() {
            pte.dirty = true;
        }
        let resolved = *pte;
        trace!("fill {ea:#x} {:?}: resolved pfn {:#x}", access.kind, resolved.pfn);

        let perms = self.derive_perms(&resolved, region, access);
        let tag = space.tag_for(ea, resolved.size);
        let mut table = guard.lock_table(self.directory.table());

        // FastPathUpdate
        if let Some(placement) = resolved.placement.get() {
            match table
                .service()
                .update_permission(placement.slot, tag, perms, FlushScope::Global)
            {
                UpdateOutcome::Updated => {
                    self.stats.record_fast_path();
                    trace!("fill {ea:#x}: updated slot {} in place", placement.slot.0);
                    return Ok(FillOutcome::Inserted(placement));
                }
                UpdateOutcome::Stale => {
                    self.stats.record_stale();
                    log::debug!("fill {ea:#x}: slot {} stale, reinserting", placement.slot.0);
                    if let Some(pte) = table.page_table().lookup_mut(ea) {
                        pte.placement.clear();
                    }
                }
            }
        }

        // 内核映像的固定条目已覆盖该页，不能再插入同标签的第二个条目
        if region == Region::KernelDirect {
            let bolted = [PageSize::Base, PageSize::Large].into_iter().find_map(|size| {
                self.engine
                    .find_bolted(table.service(), &space.tag_for(ea, size))
            });
            if let Some(placement) = bolted {
                trace!("fill {ea:#x}: covered by bolted slot {}", placement.slot.0);
                return Ok(FillOutcome::Inserted(placement));
            }
        }

        // HashComputed -> Inserted
        let entry = HashPte::new(tag, resolved.pfn, perms, WhichHash::Primary);
        let placement = self.engine.insert(table.service(), entry, self.stats)?;
        if let Some(pte) = table.page_table().lookup_mut(ea) {
            pte.placement.record(placement);
        }
        trace!(
            "fill {ea:#x}: inserted slot {} ({:?})",
            placement.slot.0, placement.which
        );
        Ok(FillOutcome::Inserted(placement))
    }

    fn reject(&self, ea: u64, reason: RejectReason) -> FillOutcome {
        self.stats.record_rejection(reason);
        trace!("fill {ea:#x}: rejected ({reason})");
        FillOutcome::Rejected(reason)
    }

    /// 由规范页表项推导哈希条目权限
    ///
    /// 未置脏的可写页以只读插入，首次写入再次缺页时升级。
    fn derive_perms(&self, pte: &CanonicalPte, region: Region, access: Access) -> HptPerms {
        let mut perms = HptPerms::READ;
        if pte.perms.contains(PagePerms::WRITE) && pte.dirty {
            perms |= HptPerms::WRITE;
        }
        if pte.perms.contains(PagePerms::USER) {
            perms |= HptPerms::USER;
        }
        if region == Region::IoRemap || pte.perms.contains(PagePerms::NO_CACHE) {
            perms |= HptPerms::NO_CACHE | HptPerms::GUARDED;
        }
        if pte.perms.contains(PagePerms::EXEC) && self.grant_exec(pte, access) {
            perms |= HptPerms::EXEC;
        }
        perms
    }

    /// 授予执行权限前确保页内所有页帧的指令缓存已同步
    fn grant_exec(&self, pte: &CanonicalPte, access: Access) -> bool {
        let mut frames = pte.pfn..pte.pfn.saturating_add(pte.size.frames());
        if self.coherency.policy() == CoherencyPolicy::Eager || access.kind == AccessKind::Execute {
            for pfn in frames {
                self.coherency.on_first_exec_fill(pfn);
            }
            return true;
        }
        // 延迟策略：未同步的页先以不可执行插入，等待取指缺页
        let synced = frames.all(|pfn| self.coherency.is_synced(pfn));
        if !synced {
            self.stats.record_deferred_exec();
        }
        synced
    }
}
