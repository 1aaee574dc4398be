// 哈希引擎
//
// 主哈希由 VSID 与段内页号异或得到，次哈希为主哈希取反。
// 删除时只需记录的 which_hash 即可重新算出所在组。
//
// 插入顺序：主组 -> 次组 -> 在候选组中淘汰一个条目后重试一次。
// 淘汰不挑选对象，被淘汰的页下次访问时重新缺页填充。

use crate::directory::HashGeometry;
use crate::error::{HptError, HptResult};
use crate::platform::{HashPte, InsertResult, PteService};
use crate::stats::HptStats;
use crate::types::{Placement, Slot, VirtTag, WhichHash};
use crate::HPT_HASH_MASK;
use log::{debug, error};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 哈希引擎
#[derive(Debug)]
pub struct HashEngine {
    group_mask: u64,
    slots_per_group: usize,
    /// 粗粒度计数器，决定淘汰哪个候选组
    evict_clock: AtomicUsize,
}

impl HashEngine {
    pub fn new(geometry: &HashGeometry) -> Self {
        Self {
            group_mask: geometry.group_mask,
            slots_per_group: geometry.slots_per_group,
            evict_clock: AtomicUsize::new(0),
        }
    }

    /// 主哈希
    pub fn primary_hash(tag: &VirtTag) -> u64 {
        (tag.vsid ^ tag.page) & HPT_HASH_MASK
    }

    /// 次哈希
    pub fn secondary_hash(hash: u64) -> u64 {
        !hash
    }

    pub fn hash_for(tag: &VirtTag, which: WhichHash) -> u64 {
        let hash = Self::primary_hash(tag);
        match which {
            WhichHash::Primary => hash,
            WhichHash::Secondary => Self::secondary_hash(hash),
        }
    }

    /// 哈希值对应组的首槽位
    pub fn group_of(&self, hash: u64) -> usize {
        // group_mask 来自 usize 组数，截断不会丢位
        (hash & self.group_mask) as usize * self.slots_per_group
    }

    /// 标签的主组与次组
    pub fn groups(&self, tag: &VirtTag) -> (usize, usize) {
        (
            self.group_of(Self::hash_for(tag, WhichHash::Primary)),
            self.group_of(Self::hash_for(tag, WhichHash::Secondary)),
        )
    }

    /// 由记录的 which_hash 重新计算条目所在的组
    pub fn group_for(&self, tag: &VirtTag, which: WhichHash) -> usize {
        self.group_of(Self::hash_for(tag, which))
    }

    pub fn slots_per_group(&self) -> usize {
        self.slots_per_group
    }

    /// 在单个组内尝试插入
    pub fn try_insert(&self, service: &mut dyn PteService, group: usize, entry: HashPte) -> InsertResult {
        service.insert(group, entry)
    }

    /// 完整插入流程：主组、次组、淘汰一次后重试
    ///
    /// 重试后仍然失败说明表已无法前进，返回致命错误。
    pub fn insert(
        &self,
        service: &mut dyn PteService,
        entry: HashPte,
        stats: &HptStats,
    ) -> HptResult<Placement> {
        let (primary, secondary) = self.groups(&entry.tag);
        if let Some(placement) = self.insert_either(service, entry, primary, secondary) {
            stats.record_insert(placement.which);
            return Ok(placement);
        }

        let tick = self.evict_clock.fetch_add(1, Ordering::Relaxed);
        let (victim_group, which) = if tick & 1 == 0 {
            (primary, WhichHash::Primary)
        } else {
            (secondary, WhichHash::Secondary)
        };
        match service.evict_one(victim_group, tick) {
            Some((slot, victim)) => {
                stats.record_eviction();
                debug!(
                    "evicted slot {} (vsid {:#x} page {:#x}) for vsid {:#x} page {:#x}",
                    slot.0, victim.vsid, victim.page, entry.tag.vsid, entry.tag.page
                );
            }
            None => debug!("group {} has no evictable entry", victim_group / self.slots_per_group),
        }

        if let InsertResult::Inserted(slot) =
            self.try_insert(service, victim_group, HashPte { which, ..entry })
        {
            stats.record_insert(which);
            return Ok(Placement { slot, which });
        }

        let err = HptError::TableFull {
            primary_group: primary / self.slots_per_group,
            secondary_group: secondary / self.slots_per_group,
        };
        error!("vsid {:#x} page {:#x}: {}", entry.tag.vsid, entry.tag.page, err);
        Err(err)
    }

    /// 固定条目插入，不淘汰
    pub fn insert_bolted(&self, service: &mut dyn PteService, entry: HashPte) -> Option<Placement> {
        let (primary, secondary) = self.groups(&entry.tag);
        self.insert_either(service, entry.bolted(), primary, secondary)
    }

    /// 在主次两组中查找标签相同的固定条目
    pub fn find_bolted(&self, service: &dyn PteService, tag: &VirtTag) -> Option<Placement> {
        [WhichHash::Primary, WhichHash::Secondary]
            .into_iter()
            .find_map(|which| {
                let base = self.group_for(tag, which);
                (base..base + self.slots_per_group).find_map(|index| {
                    // 槽位总数在 HashGeometry::new 中已限制在 u32 范围内
                    let slot = Slot(index as u32);
                    service
                        .read(slot)
                        .filter(|entry| entry.bolted && entry.tag == *tag)
                        .map(|_| Placement { slot, which })
                })
            })
    }

    /// 无条件释放槽位，重复调用无副作用
    pub fn remove(&self, service: &mut dyn PteService, slot: Slot) {
        service.free_slot(slot);
    }

    fn insert_either(
        &self,
        service: &mut dyn PteService,
        entry: HashPte,
        primary: usize,
        secondary: usize,
    ) -> Option<Placement> {
        for (group, which) in [(primary, WhichHash::Primary), (secondary, WhichHash::Secondary)] {
            if let InsertResult::Inserted(slot) = self.try_insert(service, group, HashPte { which, ..entry }) {
                return Some(Placement { slot, which });
            }
        }
        None
    }
}
