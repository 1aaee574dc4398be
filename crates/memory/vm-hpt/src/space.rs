// 地址空间与规范页表
//
// 每个地址空间持有自己的规范页表和结构锁。结构锁必须先于表级锁获取，
// 表级锁只能通过已持有的 `SpaceGuard` 取得。

use crate::directory::{TableGuard, TableLock};
use crate::region::Region;
use crate::types::{CanonicalPte, PageSize, VirtTag};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// 规范页表接口
///
/// 由映射代码维护；翻译缓存只读写放置元数据和访问/脏位。
pub trait CanonicalPageTable: Send {
    /// 查找覆盖 `ea` 的表项
    fn lookup_mut(&mut self, ea: u64) -> Option<&mut CanonicalPte>;

    /// 建立映射，`ea` 按表项页大小对齐
    fn map(&mut self, ea: u64, pte: CanonicalPte);

    /// 删除映射。调用者需先使对应的哈希条目失效。
    fn unmap(&mut self, ea: u64) -> Option<CanonicalPte>;

    /// 遍历与 `[start, end)` 重叠的表项
    fn for_each_in_range(&mut self, start: u64, end: u64, f: &mut dyn FnMut(u64, &mut CanonicalPte));
}

/// 基于 `BTreeMap` 的规范页表
#[derive(Debug, Default)]
pub struct SoftPageTable {
    entries: BTreeMap<u64, CanonicalPte>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CanonicalPageTable for SoftPageTable {
    fn lookup_mut(&mut self, ea: u64) -> Option<&mut CanonicalPte> {
        let base = PageSize::Base.align_down(ea);
        if self.entries.contains_key(&base) {
            return self.entries.get_mut(&base);
        }
        self.entries
            .get_mut(&PageSize::Large.align_down(ea))
            .filter(|pte| pte.size == PageSize::Large)
    }

    fn map(&mut self, ea: u64, pte: CanonicalPte) {
        self.entries.insert(pte.size.align_down(ea), pte);
    }

    fn unmap(&mut self, ea: u64) -> Option<CanonicalPte> {
        let key = self
            .entries
            .contains_key(&PageSize::Base.align_down(ea))
            .then(|| PageSize::Base.align_down(ea))
            .unwrap_or_else(|| PageSize::Large.align_down(ea));
        self.entries.remove(&key)
    }

    fn for_each_in_range(&mut self, start: u64, end: u64, f: &mut dyn FnMut(u64, &mut CanonicalPte)) {
        if start >= end {
            return;
        }
        // 大页可能起始于 start 之前
        let from = PageSize::Large.align_down(start);
        for (&ea, pte) in self.entries.range_mut(from..end) {
            if ea.saturating_add(pte.size.bytes()) > start {
                f(ea, pte);
            }
        }
    }
}

/// 地址空间
pub struct AddressSpace {
    context: u32,
    region: Region,
    table: Mutex<Box<dyn CanonicalPageTable>>,
    /// 当前在该地址空间中运行的 CPU 位图
    active_cpus: AtomicU64,
}

impl AddressSpace {
    /// 创建用户地址空间
    pub fn user(context: u32) -> Self {
        Self::with_table(context, Region::User, SoftPageTable::new())
    }

    pub fn with_table(context: u32, region: Region, table: impl CanonicalPageTable + 'static) -> Self {
        Self {
            context,
            region,
            table: Mutex::new(Box::new(table)),
            active_cpus: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// 获取结构锁
    pub fn lock(&self) -> SpaceGuard<'_> {
        SpaceGuard {
            space: self,
            table: self.table.lock(),
        }
    }

    /// `ea` 在本空间中的哈希标签
    pub fn tag_for(&self, ea: u64, size: PageSize) -> VirtTag {
        VirtTag::new(self.context, self.region, ea, size)
    }

    /// CPU 切换进入本空间
    pub fn activate(&self, cpu: usize) {
        self.active_cpus.fetch_or(cpu_bit(cpu), Ordering::AcqRel);
    }

    /// CPU 离开本空间
    pub fn deactivate(&self, cpu: usize) {
        self.active_cpus.fetch_and(!cpu_bit(cpu), Ordering::AcqRel);
    }

    pub fn active_cpu_count(&self) -> u32 {
        self.active_cpus.load(Ordering::Acquire).count_ones()
    }

    /// `cpu` 是否是唯一在本空间运行的 CPU
    pub fn is_sole_cpu(&self, cpu: usize) -> bool {
        let mask = self.active_cpus.load(Ordering::Acquire);
        mask & !cpu_bit(cpu) == 0
    }
}

fn cpu_bit(cpu: usize) -> u64 {
    1 << (cpu % 64)
}

/// 已持有的地址空间结构锁
pub struct SpaceGuard<'s> {
    space: &'s AddressSpace,
    table: MutexGuard<'s, Box<dyn CanonicalPageTable>>,
}

impl<'s> SpaceGuard<'s> {
    pub fn space(&self) -> &'s AddressSpace {
        self.space
    }

    /// 在持有结构锁的前提下获取表级锁
    pub fn lock_table<'g>(&'g mut self, table: &'g TableLock) -> TableGuard<'g> {
        table.acquire(&mut **self.table)
    }
}

impl Deref for SpaceGuard<'_> {
    type Target = dyn CanonicalPageTable;

    fn deref(&self) -> &Self::Target {
        &**self.table
    }
}

impl DerefMut for SpaceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.table
    }
}
