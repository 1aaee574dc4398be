// 平台 PTE 原语
//
// 裸机与虚拟化平台插入/更新/删除哈希表条目的方式不同。
// 启动时选定一个 `PteService` 注入翻译目录，之后的填充路径不再判断平台类型。

use crate::space::AddressSpace;
use crate::types::{HptPerms, Slot, VirtTag, WhichHash};

/// 一条哈希表条目
///
/// 槽位里存在条目即视为有效。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPte {
    pub tag: VirtTag,
    pub pfn: u64,
    pub perms: HptPerms,
    pub which: WhichHash,
    /// 启动时固定插入的条目，不会被淘汰
    pub bolted: bool,
}

impl HashPte {
    pub fn new(tag: VirtTag, pfn: u64, perms: HptPerms, which: WhichHash) -> Self {
        Self {
            tag,
            pfn,
            perms,
            which,
            bolted: false,
        }
    }

    pub fn bolted(mut self) -> Self {
        self.bolted = true;
        self
    }
}

/// 插入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted(Slot),
    Full,
}

/// 原地更新权限的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// 槽位已被淘汰或被其他页占用
    Stale,
}

/// 失效广播范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushScope {
    /// 仅当前 CPU
    Local,
    /// 所有共享该地址空间的 CPU
    Global,
}

impl FlushScope {
    /// 按地址空间的活跃 CPU 集合选择范围
    pub fn for_space(space: &AddressSpace, cpu: usize) -> Self {
        if space.is_sole_cpu(cpu) {
            FlushScope::Local
        } else {
            FlushScope::Global
        }
    }
}

/// 平台提供的哈希表原语
///
/// 所有方法都在表级锁内调用。`group` 为组首槽位下标。
pub trait PteService: Send {
    /// 在组内找空槽插入，组满返回 `Full`
    fn insert(&mut self, group: usize, entry: HashPte) -> InsertResult;

    /// 删除 `slot` 上标签为 `tag` 的条目
    ///
    /// 槽位为空或标签不符时不做任何事并返回 `false`。
    fn remove(&mut self, slot: Slot, tag: VirtTag, scope: FlushScope) -> bool;

    /// 原地更新权限
    fn update_permission(
        &mut self,
        slot: Slot,
        tag: VirtTag,
        perms: HptPerms,
        scope: FlushScope,
    ) -> UpdateOutcome;

    /// 从组内淘汰一个非固定条目，`hint` 决定起始槽位
    fn evict_one(&mut self, group: usize, hint: usize) -> Option<(Slot, VirtTag)>;

    /// 无条件释放槽位
    fn free_slot(&mut self, slot: Slot);

    /// 读取槽位内容
    fn read(&self, slot: Slot) -> Option<HashPte>;

    /// 平台是否提供批量删除
    fn has_bulk_remove(&self) -> bool {
        false
    }

    /// 批量删除，返回实际删除的条目数
    fn remove_batch(&mut self, batch: &[(Slot, VirtTag)], scope: FlushScope) -> usize {
        let mut removed = 0;
        for &(slot, tag) in batch {
            if self.remove(slot, tag, scope) {
                removed += 1;
            }
        }
        removed
    }
}
