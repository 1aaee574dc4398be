// 翻译目录
//
// 启动时按物理内存大小确定哈希表几何参数，选定存储归属，
// 并把内核映像固定插入哈希表。创建之后几何参数不再变化。

use crate::config::{HptConfig, KernelImage, PlatformCaps, StorageKind};
use crate::error::{HptError, HptResult};
use crate::hash::HashEngine;
use crate::native::NativeHashTable;
use crate::platform::{HashPte, PteService};
use crate::region::{KERNEL_BASE, KERNEL_CONTEXT, Region};
use crate::space::CanonicalPageTable;
use crate::types::{HptPerms, PageSize, VirtTag, WhichHash};
use crate::{PAGE_SHIFT, PAGE_SIZE};
use log::{error, info, warn};
use parking_lot::{Mutex, MutexGuard};

/// 哈希表几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashGeometry {
    /// 组数（2 的幂）
    pub group_count: usize,
    pub group_mask: u64,
    pub slots_per_group: usize,
}

impl HashGeometry {
    pub fn new(group_count: usize, slots_per_group: usize) -> HptResult<Self> {
        if group_count == 0 || !group_count.is_power_of_two() {
            return Err(HptError::InvalidConfig(format!(
                "group count {group_count} is not a power of two"
            )));
        }
        if slots_per_group == 0 {
            return Err(HptError::InvalidConfig("slots_per_group must be non-zero".to_string()));
        }
        // 槽位下标以 u32 记录在规范页表项中
        let fits = group_count
            .checked_mul(slots_per_group)
            .is_some_and(|total| total as u64 <= u64::from(u32::MAX) + 1);
        if !fits {
            return Err(HptError::InvalidConfig(format!(
                "{group_count} groups x {slots_per_group} slots exceeds the slot index range"
            )));
        }
        Ok(Self {
            group_count,
            group_mask: group_count as u64 - 1,
            slots_per_group,
        })
    }

    /// 按内存大小确定组数：组数约为页数的一半，向上取 2 的幂
    pub fn from_config(config: &HptConfig) -> HptResult<Self> {
        let groups = match config.group_count {
            Some(groups) => groups,
            None => {
                let pages = config.total_memory >> PAGE_SHIFT;
                let target = usize::try_from((pages / 2).max(1)).map_err(|_| {
                    HptError::InvalidConfig(format!("memory size {:#x} too large", config.total_memory))
                })?;
                target
                    .checked_next_power_of_two()
                    .ok_or_else(|| HptError::InvalidConfig("group count overflow".to_string()))?
                    .max(config.min_group_count)
            }
        };
        Self::new(groups, config.slots_per_group)
    }

    pub fn total_slots(&self) -> usize {
        self.group_count * self.slots_per_group
    }
}

/// 哈希表存储归属
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// 内核持有的连续存储
    BareMetalOwned { slots: usize },
    /// 存储由平台管理，对内核不透明
    PlatformOwned,
}

/// 表级锁
///
/// 只能通过 `SpaceGuard::lock_table` 获取，保证先结构锁后表级锁的顺序。
pub struct TableLock {
    service: Mutex<Box<dyn PteService>>,
}

impl TableLock {
    fn new(service: Box<dyn PteService>) -> Self {
        Self {
            service: Mutex::new(service),
        }
    }

    pub(crate) fn acquire<'g>(
        &'g self,
        page_table: &'g mut (dyn CanonicalPageTable + 'static),
    ) -> TableGuard<'g> {
        TableGuard {
            page_table,
            service: self.service.lock(),
        }
    }

    /// 只读查看表内容（诊断用）
    pub fn inspect<R>(&self, f: impl FnOnce(&dyn PteService) -> R) -> R {
        let service = self.service.lock();
        f(&**service)
    }
}

/// 同时持有结构锁与表级锁
pub struct TableGuard<'g> {
    page_table: &'g mut (dyn CanonicalPageTable + 'static),
    service: MutexGuard<'g, Box<dyn PteService>>,
}

impl TableGuard<'_> {
    pub fn service(&mut self) -> &mut dyn PteService {
        &mut **self.service
    }

    pub fn page_table(&mut self) -> &mut dyn CanonicalPageTable {
        &mut *self.page_table
    }

    /// 同时借出页表与表原语，遍历页表时可直接删除条目
    pub fn split(&mut self) -> (&mut dyn CanonicalPageTable, &mut dyn PteService) {
        (&mut *self.page_table, &mut **self.service)
    }
}

/// 翻译目录
pub struct TranslationDirectory {
    geometry: HashGeometry,
    storage_mode: StorageMode,
    table: TableLock,
    bolted: usize,
}

impl TranslationDirectory {
    /// 创建目录并固定插入内核映像
    ///
    /// 存储分配失败或固定插入失败都是致命错误。
    pub fn init(config: &HptConfig, platform: Option<Box<dyn PteService>>) -> HptResult<Self> {
        config.validate()?;
        let geometry = HashGeometry::from_config(config)?;

        let (storage_mode, mut service): (StorageMode, Box<dyn PteService>) =
            match (config.platform.storage, platform) {
                (StorageKind::BareMetal, supplied) => {
                    if supplied.is_some() {
                        warn!("bare-metal storage selected, ignoring supplied platform service");
                    }
                    let table = NativeHashTable::new(&geometry)
                        .inspect_err(|e| error!("hash table storage: {e}"))?;
                    (
                        StorageMode::BareMetalOwned {
                            slots: geometry.total_slots(),
                        },
                        Box::new(table),
                    )
                }
                (StorageKind::PlatformOwned, Some(service)) => (StorageMode::PlatformOwned, service),
                (StorageKind::PlatformOwned, None) => return Err(HptError::MissingPlatformService),
            };

        let engine = HashEngine::new(&geometry);
        let bolted = match config.kernel_image {
            Some(image) => bolt_kernel_image(&engine, service.as_mut(), image, &config.platform)?,
            None => 0,
        };

        info!(
            "hash table: {} groups x {} slots, {:?}, {} bolted entries",
            geometry.group_count, geometry.slots_per_group, storage_mode, bolted
        );

        Ok(Self {
            geometry,
            storage_mode,
            table: TableLock::new(service),
            bolted,
        })
    }

    pub fn geometry(&self) -> &HashGeometry {
        &self.geometry
    }

    pub fn group_count(&self) -> usize {
        self.geometry.group_count
    }

    pub fn group_mask(&self) -> u64 {
        self.geometry.group_mask
    }

    pub fn slots_per_group(&self) -> usize {
        self.geometry.slots_per_group
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn table(&self) -> &TableLock {
        &self.table
    }

    /// 启动时固定插入的条目数
    pub fn bolted_entries(&self) -> usize {
        self.bolted
    }
}

/// 以线性映射固定插入内核映像
///
/// 低端 `bolt_base_region` 以内使用基本页，其余对齐的部分使用大页。
fn bolt_kernel_image(
    engine: &HashEngine,
    service: &mut dyn PteService,
    image: KernelImage,
    caps: &PlatformCaps,
) -> HptResult<usize> {
    let large = PageSize::Large.bytes();
    let start = PageSize::Base.align_down(image.phys_start);
    let end = (image.phys_start + image.size).next_multiple_of(PAGE_SIZE);
    let perms = HptPerms::READ | HptPerms::WRITE | HptPerms::EXEC;

    let (mut base_pages, mut large_pages) = (0usize, 0usize);
    let mut pa = start;
    while pa < end {
        let size = if caps.large_pages
            && pa >= caps.bolt_base_region
            && pa % large == 0
            && pa + large <= end
        {
            PageSize::Large
        } else {
            PageSize::Base
        };
        let ea = KERNEL_BASE + pa;
        let tag = VirtTag::new(KERNEL_CONTEXT, Region::KernelDirect, ea, size);
        let entry = HashPte::new(tag, pa >> PAGE_SHIFT, perms, WhichHash::Primary);
        if engine.insert_bolted(service, entry).is_none() {
            let err = HptError::BoltFailed { ea, size };
            error!("{err}");
            return Err(err);
        }
        match size {
            PageSize::Base => base_pages += 1,
            PageSize::Large => large_pages += 1,
        }
        pa += size.bytes();
    }

    info!(
        "bolted kernel image {:#x}..{:#x}: {} base pages, {} large pages",
        start, end, base_pages, large_pages
    );
    Ok(base_pages + large_pages)
}
