// 哈希 MMU 门面
//
// 组合翻译目录、哈希引擎、指令缓存同步跟踪器和内核地址空间，
// 向内核其他部分提供缺页填充与失效操作。

use crate::coherency::{CacheCoherencyTracker, CoherencyPolicy, FenceFlusher, IcacheFlusher};
use crate::config::HptConfig;
use crate::directory::TranslationDirectory;
use crate::error::HptResult;
use crate::fill::{FillController, FillOutcome, KernelSpaces};
use crate::hash::HashEngine;
use crate::invalidate::InvalidationService;
use crate::platform::{FlushScope, HashPte, PteService};
use crate::region::{KERNEL_CONTEXT, Region};
use crate::space::{AddressSpace, SoftPageTable};
use crate::stats::HptStats;
use crate::types::{Access, Placement, Slot};
use crate::PAGE_SHIFT;
use log::info;
use std::sync::Arc;

/// Builder for [`HashMmu`]
///
/// # Examples
///
/// ```rust
/// use vm_hpt::{HashMmuBuilder, HptConfig};
///
/// let mmu = HashMmuBuilder::new(HptConfig::default().with_group_count(64))
///     .build()
///     .expect("bare-metal table");
/// assert_eq!(mmu.directory().group_count(), 64);
/// ```
pub struct HashMmuBuilder {
    config: HptConfig,
    platform: Option<Box<dyn PteService>>,
    flusher: Option<Arc<dyn IcacheFlusher>>,
}

impl HashMmuBuilder {
    pub fn new(config: HptConfig) -> Self {
        Self {
            config,
            platform: None,
            flusher: None,
        }
    }

    /// Platform PTE primitives, required for platform-owned storage
    pub fn platform_service(mut self, service: Box<dyn PteService>) -> Self {
        self.platform = Some(service);
        self
    }

    /// I-cache flush primitive, defaults to [`FenceFlusher`]
    pub fn icache_flusher(mut self, flusher: Arc<dyn IcacheFlusher>) -> Self {
        self.flusher = Some(flusher);
        self
    }

    /// Size the table, bolt the kernel image and allocate the per-frame
    /// coherency state. Every allocation the MMU needs happens here.
    pub fn build(self) -> HptResult<HashMmu> {
        let directory = TranslationDirectory::init(&self.config, self.platform)?;
        let engine = HashEngine::new(directory.geometry());

        let caps = &self.config.platform;
        let policy = if caps.ifetch_faults_distinguished && caps.coherent_icache_on_data_fill {
            CoherencyPolicy::DeferUntilFetch
        } else {
            CoherencyPolicy::Eager
        };
        let flusher = self.flusher.unwrap_or_else(|| Arc::new(FenceFlusher));
        let coherency =
            CacheCoherencyTracker::new(self.config.total_memory >> PAGE_SHIFT, policy, flusher)?;

        info!(
            "hash mmu ready: {:?} i-cache policy over {} frames",
            policy,
            coherency.tracked_frames()
        );

        Ok(HashMmu {
            directory,
            engine,
            coherency,
            kernel_direct: kernel_space(Region::KernelDirect),
            vmalloc: kernel_space(Region::Vmalloc),
            ioremap: kernel_space(Region::IoRemap),
            stats: HptStats::default(),
        })
    }
}

fn kernel_space(region: Region) -> AddressSpace {
    AddressSpace::with_table(KERNEL_CONTEXT, region, SoftPageTable::new())
}

/// Hash-table MMU translation cache
pub struct HashMmu {
    directory: TranslationDirectory,
    engine: HashEngine,
    coherency: CacheCoherencyTracker,
    kernel_direct: AddressSpace,
    vmalloc: AddressSpace,
    ioremap: AddressSpace,
    stats: HptStats,
}

impl HashMmu {
    fn kernel_spaces(&self) -> KernelSpaces<'_> {
        KernelSpaces {
            kernel_direct: &self.kernel_direct,
            vmalloc: &self.vmalloc,
            ioremap: &self.ioremap,
        }
    }

    fn invalidation(&self) -> InvalidationService<'_> {
        InvalidationService::new(&self.directory, &self.engine, &self.stats)
    }

    /// Handle a translation miss at `ea`
    ///
    /// `current` is the user address space running on the faulting CPU;
    /// kernel-region addresses resolve against the kernel spaces. An `Err`
    /// means the table can make no progress and the caller must halt.
    pub fn fill(&self, current: &AddressSpace, ea: u64, access: Access) -> HptResult<FillOutcome> {
        FillController::new(
            &self.directory,
            &self.engine,
            &self.coherency,
            &self.stats,
            self.kernel_spaces(),
        )
        .fill(current, ea, access)
    }

    /// Remove the hash entry backing `ea`, if any
    ///
    /// `cpu` is the CPU issuing the request. A `Local` request is upgraded
    /// to `Global` unless `cpu` is the only CPU active in `space`.
    pub fn invalidate_one(&self, space: &AddressSpace, ea: u64, cpu: usize, scope: FlushScope) -> usize {
        self.invalidation().invalidate_one(space, ea, cpu, scope)
    }

    pub fn invalidate_batch(&self, space: &AddressSpace, eas: &[u64], cpu: usize, scope: FlushScope) -> usize {
        self.invalidation().invalidate_batch(space, eas, cpu, scope)
    }

    /// Remove every placed entry in `[start, end)`, used on teardown
    pub fn invalidate_range(
        &self,
        space: &AddressSpace,
        start: u64,
        end: u64,
        cpu: usize,
        scope: FlushScope,
    ) -> usize {
        self.invalidation().invalidate_range(space, start, end, cpu, scope)
    }

    /// The placement recorded for `ea`, but only while the table still
    /// holds a matching entry in that slot
    pub fn placement_of(&self, space: &AddressSpace, ea: u64) -> Option<Placement> {
        let mut guard = space.lock();
        let (placement, size) = guard
            .lookup_mut(ea)
            .and_then(|pte| pte.placement.get().map(|p| (p, pte.size)))?;
        let tag = space.tag_for(ea, size);
        let mut table = guard.lock_table(self.directory.table());
        table
            .service()
            .read(placement.slot)
            .filter(|entry| entry.tag == tag && entry.which == placement.which)
            .map(|_| placement)
    }

    /// Address space backing a kernel region
    pub fn kernel_space(&self, region: Region) -> Option<&AddressSpace> {
        self.kernel_spaces().get(region)
    }

    pub fn directory(&self) -> &TranslationDirectory {
        &self.directory
    }

    pub fn engine(&self) -> &HashEngine {
        &self.engine
    }

    pub fn coherency(&self) -> &CacheCoherencyTracker {
        &self.coherency
    }

    pub fn stats(&self) -> &HptStats {
        &self.stats
    }

    /// Snapshot of every live table entry, for diagnostics
    pub fn table_entries(&self) -> Vec<(Slot, HashPte)> {
        let total = self.directory.geometry().total_slots();
        self.directory.table().inspect(|service| {
            (0..total)
                .filter_map(|index| {
                    let slot = Slot(u32::try_from(index).ok()?);
                    service.read(slot).map(|entry| (slot, entry))
                })
                .collect()
        })
    }
}
