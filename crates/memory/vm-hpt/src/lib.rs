//! vm-hpt: 哈希页表 MMU 的翻译缓存
//!
//! 为基于哈希页表的 MMU 管理软件维护的翻译缓存，包括：
//! - 翻译目录（表大小与存储归属）
//! - 主/次哈希与组内槽位查找
//! - 缺页驱动的填充状态机
//! - 单条/批量失效（Local/Global 范围）
//! - 指令缓存的惰性同步
//!
//! 规范页表是权威记录，哈希表只是可随时重建的派生缓存。

pub mod coherency;
pub mod config;
pub mod directory;
pub mod error;
pub mod fill;
pub mod hash;
pub mod invalidate;
pub mod mmu;
pub mod native;
pub mod platform;
pub mod region;
pub mod space;
pub mod stats;
pub mod types;

// 重新导出主要类型
pub use coherency::{CacheCoherencyTracker, CoherencyPolicy, FenceFlusher, IcacheFlusher};
pub use config::{HptConfig, KernelImage, PlatformCaps, StorageKind};
pub use directory::{HashGeometry, StorageMode, TableGuard, TableLock, TranslationDirectory};
pub use error::{HptError, HptResult, RejectReason};
pub use fill::{FillController, FillOutcome, KernelSpaces};
pub use hash::HashEngine;
pub use invalidate::InvalidationService;
pub use mmu::{HashMmu, HashMmuBuilder};
pub use native::NativeHashTable;
pub use platform::{FlushScope, HashPte, InsertResult, PteService, UpdateOutcome};
pub use region::Region;
pub use space::{AddressSpace, CanonicalPageTable, SoftPageTable, SpaceGuard};
pub use stats::{HptStats, HptStatsSnapshot};
pub use types::{
    Access, AccessKind, CanonicalPte, HashPlacement, HptPerms, PagePerms, PageSize, Placement,
    Slot, VirtTag, WhichHash,
};

// ============================================================================
// 页大小与哈希常量
// ============================================================================

/// 基本页偏移位数（4KB）
pub const PAGE_SHIFT: u32 = 12;
/// 基本页大小
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// 大页偏移位数（16MB）
pub const LARGE_PAGE_SHIFT: u32 = 24;
/// 段偏移位数（256MB 段）
pub const SEGMENT_SHIFT: u32 = 28;
/// 哈希值有效位宽
pub const HPT_HASH_BITS: u32 = 39;
/// 哈希值掩码
pub const HPT_HASH_MASK: u64 = (1 << HPT_HASH_BITS) - 1;
/// 每组默认槽位数
pub const DEFAULT_SLOTS_PER_GROUP: usize = 8;
/// 最小组数（256KB 的表）
pub const MIN_GROUP_COUNT: usize = 1 << 11;
/// 单次批量失效的最大条目数
pub const TLB_BATCH_NR: usize = 192;
