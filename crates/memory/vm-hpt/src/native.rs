// 裸机哈希表
//
// 裸机模式下内核自行持有连续的槽位数组，组内线性扫描空槽。

use crate::directory::HashGeometry;
use crate::error::{HptError, HptResult};
use crate::platform::{FlushScope, HashPte, InsertResult, PteService, UpdateOutcome};
use crate::types::{HptPerms, Slot, VirtTag};
use log::trace;

/// 裸机模式的 `PteService`
pub struct NativeHashTable {
    slots: Box<[Option<HashPte>]>,
    slots_per_group: usize,
}

impl NativeHashTable {
    /// 按几何参数分配槽位数组，分配失败返回错误而不是中止
    pub fn new(geometry: &HashGeometry) -> HptResult<Self> {
        let total = geometry.total_slots();
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(total)
            .map_err(|_| HptError::AllocationFailed {
                bytes: total.saturating_mul(std::mem::size_of::<Option<HashPte>>()),
            })?;
        slots.resize(total, None);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            slots_per_group: geometry.slots_per_group,
        })
    }

    /// 有效条目数
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn group_range(&self, group: usize) -> std::ops::Range<usize> {
        group..group + self.slots_per_group
    }

    fn matching_mut(&mut self, slot: Slot, tag: VirtTag) -> Option<&mut HashPte> {
        self.slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .filter(|entry| entry.tag == tag)
    }
}

impl PteService for NativeHashTable {
    fn insert(&mut self, group: usize, entry: HashPte) -> InsertResult {
        for index in self.group_range(group) {
            if self.slots[index].is_none() {
                self.slots[index] = Some(entry);
                // 槽位总数在创建目录时已校验不超过 u32
                return InsertResult::Inserted(Slot(index as u32));
            }
        }
        InsertResult::Full
    }

    fn remove(&mut self, slot: Slot, tag: VirtTag, scope: FlushScope) -> bool {
        if self.matching_mut(slot, tag).is_none() {
            return false;
        }
        self.slots[slot.index()] = None;
        trace!("native: removed slot {} ({:?})", slot.0, scope);
        true
    }

    fn update_permission(
        &mut self,
        slot: Slot,
        tag: VirtTag,
        perms: HptPerms,
        _scope: FlushScope,
    ) -> UpdateOutcome {
        match self.matching_mut(slot, tag) {
            Some(entry) => {
                entry.perms = perms;
                UpdateOutcome::Updated
            }
            None => UpdateOutcome::Stale,
        }
    }

    fn evict_one(&mut self, group: usize, hint: usize) -> Option<(Slot, VirtTag)> {
        let n = self.slots_per_group;
        for i in 0..n {
            let index = group + (hint + i) % n;
            if let Some(entry) = self.slots[index].filter(|e| !e.bolted) {
                self.slots[index] = None;
                return Some((Slot(index as u32), entry.tag));
            }
        }
        None
    }

    fn free_slot(&mut self, slot: Slot) {
        if let Some(entry) = self.slots.get_mut(slot.index()) {
            *entry = None;
        }
    }

    fn read(&self, slot: Slot) -> Option<HashPte> {
        self.slots.get(slot.index()).copied().flatten()
    }
}
