//! 翻译缓存统计信息

use crate::error::RejectReason;
use crate::platform::FlushScope;
use crate::types::WhichHash;
use std::sync::atomic::{AtomicU64, Ordering};

/// 统计计数器，全部使用 Relaxed 原子操作
#[derive(Debug, Default)]
pub struct HptStats {
    pub fills: AtomicU64,
    pub fast_path_updates: AtomicU64,
    pub stale_fallbacks: AtomicU64,
    pub primary_inserts: AtomicU64,
    pub secondary_inserts: AtomicU64,
    pub evictions: AtomicU64,
    pub rejected_unsupported: AtomicU64,
    pub rejected_no_mapping: AtomicU64,
    pub rejected_protection: AtomicU64,
    pub invalidations: AtomicU64,
    pub bulk_batches: AtomicU64,
    pub local_flushes: AtomicU64,
    pub global_flushes: AtomicU64,
    pub scope_upgrades: AtomicU64,
    /// 延迟授予执行权限的填充次数
    pub deferred_exec: AtomicU64,
}

impl HptStats {
    pub(crate) fn record_fill(&self) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fast_path(&self) {
        self.fast_path_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_insert(&self, which: WhichHash) {
        match which {
            WhichHash::Primary => self.primary_inserts.fetch_add(1, Ordering::Relaxed),
            WhichHash::Secondary => self.secondary_inserts.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Unsupported => &self.rejected_unsupported,
            RejectReason::NoMapping => &self.rejected_no_mapping,
            RejectReason::ProtectionViolation => &self.rejected_protection,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bulk_batch(&self) {
        self.bulk_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, scope: FlushScope) {
        match scope {
            FlushScope::Local => self.local_flushes.fetch_add(1, Ordering::Relaxed),
            FlushScope::Global => self.global_flushes.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_scope_upgrade(&self) {
        self.scope_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferred_exec(&self) {
        self.deferred_exec.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取统计信息快照
    pub fn snapshot(&self) -> HptStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        HptStatsSnapshot {
            fills: load(&self.fills),
            fast_path_updates: load(&self.fast_path_updates),
            stale_fallbacks: load(&self.stale_fallbacks),
            primary_inserts: load(&self.primary_inserts),
            secondary_inserts: load(&self.secondary_inserts),
            evictions: load(&self.evictions),
            rejected_unsupported: load(&self.rejected_unsupported),
            rejected_no_mapping: load(&self.rejected_no_mapping),
            rejected_protection: load(&self.rejected_protection),
            invalidations: load(&self.invalidations),
            bulk_batches: load(&self.bulk_batches),
            local_flushes: load(&self.local_flushes),
            global_flushes: load(&self.global_flushes),
            scope_upgrades: load(&self.scope_upgrades),
            deferred_exec: load(&self.deferred_exec),
        }
    }
}

/// 统计信息快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HptStatsSnapshot {
    pub fills: u64,
    pub fast_path_updates: u64,
    pub stale_fallbacks: u64,
    pub primary_inserts: u64,
    pub secondary_inserts: u64,
    pub evictions: u64,
    pub rejected_unsupported: u64,
    pub rejected_no_mapping: u64,
    pub rejected_protection: u64,
    pub invalidations: u64,
    pub bulk_batches: u64,
    pub local_flushes: u64,
    pub global_flushes: u64,
    pub scope_upgrades: u64,
    pub deferred_exec: u64,
}

impl HptStatsSnapshot {
    /// 插入总数
    pub fn inserts(&self) -> u64 {
        self.primary_inserts + self.secondary_inserts
    }

    pub fn rejections(&self) -> u64 {
        self.rejected_unsupported + self.rejected_no_mapping + self.rejected_protection
    }
}

impl std::fmt::Display for HptStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "哈希表统计信息")?;
        writeln!(f, "  填充次数: {}", self.fills)?;
        writeln!(f, "  原地更新: {}", self.fast_path_updates)?;
        writeln!(f, "  过期回退: {}", self.stale_fallbacks)?;
        writeln!(f, "  插入: {} (主 {}, 次 {})", self.inserts(), self.primary_inserts, self.secondary_inserts)?;
        writeln!(f, "  淘汰: {}", self.evictions)?;
        writeln!(f, "  拒绝: {}", self.rejections())?;
        writeln!(f, "  失效: {}", self.invalidations)?;
        writeln!(f, "  刷新: local {}, global {}", self.local_flushes, self.global_flushes)
    }
}
