// 指令缓存惰性同步
//
// 每个物理页帧一个同步状态，所有映射该页帧的地址空间共享。
// 页帧首次以可执行方式填充时刷新指令缓存，之后不再重复。
//
// 状态：UNSYNCED -> SYNCING -> SYNCED。只有把状态从 UNSYNCED 改为 SYNCING 的
// CPU 执行刷新，其余 CPU 等待 SYNCED 后再继续，保证刷新先于首次取指。
// 刷新期间页帧被改写时状态转为 REWRITTEN，刷新者据此再刷一次。

use crate::error::{HptError, HptResult};
use log::trace;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8, AtomicU64, Ordering};

const UNSYNCED: u8 = 0;
const SYNCING: u8 = 1;
const SYNCED: u8 = 2;
const REWRITTEN: u8 = 3;

/// 刷新单个页帧指令缓存的平台操作
pub trait IcacheFlusher: Send + Sync {
    fn flush_frame(&self, pfn: u64);
}

/// 宿主机 I/D 缓存一致，只需一道全屏障
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceFlusher;

impl IcacheFlusher for FenceFlusher {
    fn flush_frame(&self, _pfn: u64) {
        atomic::fence(Ordering::SeqCst);
    }
}

/// 同步策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyPolicy {
    /// 授予执行权限时立即同步
    Eager,
    /// 推迟到真正的取指缺页
    DeferUntilFetch,
}

/// 指令缓存同步跟踪器
pub struct CacheCoherencyTracker {
    frames: Box<[AtomicU8]>,
    policy: CoherencyPolicy,
    flusher: Arc<dyn IcacheFlusher>,
    flushes: AtomicU64,
}

impl CacheCoherencyTracker {
    /// 为 `total_frames` 个页帧分配状态，只在启动时调用
    pub fn new(
        total_frames: u64,
        policy: CoherencyPolicy,
        flusher: Arc<dyn IcacheFlusher>,
    ) -> HptResult<Self> {
        let count = usize::try_from(total_frames).map_err(|_| HptError::AllocationFailed {
            bytes: usize::MAX,
        })?;
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(count)
            .map_err(|_| HptError::AllocationFailed { bytes: count })?;
        frames.resize_with(count, || AtomicU8::new(UNSYNCED));
        Ok(Self {
            frames: frames.into_boxed_slice(),
            policy,
            flusher,
            flushes: AtomicU64::new(0),
        })
    }

    pub fn policy(&self) -> CoherencyPolicy {
        self.policy
    }

    fn state(&self, pfn: u64) -> Option<&AtomicU8> {
        usize::try_from(pfn).ok().and_then(|i| self.frames.get(i))
    }

    /// 页帧是否已同步；不在跟踪范围内的页帧（设备内存）视为无需同步
    pub fn is_synced(&self, pfn: u64) -> bool {
        self.state(pfn)
            .is_none_or(|state| state.load(Ordering::Acquire) == SYNCED)
    }

    /// 页帧首次可执行填充
    ///
    /// 返回本次调用是否执行了刷新。
    pub fn on_first_exec_fill(&self, pfn: u64) -> bool {
        let Some(state) = self.state(pfn) else {
            return false;
        };
        loop {
            match state.compare_exchange(UNSYNCED, SYNCING, Ordering::Acquire, Ordering::Acquire) {
                Ok(_) => {
                    loop {
                        self.flusher.flush_frame(pfn);
                        self.flushes.fetch_add(1, Ordering::Relaxed);
                        // 失败只可能是 REWRITTEN，只有刷新者会把它改回 SYNCING
                        match state.compare_exchange(SYNCING, SYNCED, Ordering::AcqRel, Ordering::Acquire) {
                            Ok(_) => break,
                            Err(_) => state.store(SYNCING, Ordering::Release),
                        }
                    }
                    trace!("icache synced for pfn {pfn:#x}");
                    return true;
                }
                Err(SYNCED) => return false,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// 页帧内容被改写后需要重新同步
    ///
    /// 正在刷新的页帧标记为 REWRITTEN，由刷新者补刷。
    pub fn mark_frame_dirty(&self, pfn: u64) {
        let Some(state) = self.state(pfn) else {
            return;
        };
        let previous = state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
            SYNCED => Some(UNSYNCED),
            SYNCING => Some(REWRITTEN),
            _ => None,
        });
        if previous == Ok(SYNCING) {
            trace!("pfn {pfn:#x} rewritten during icache flush");
        }
    }

    /// 已执行的刷新次数
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn tracked_frames(&self) -> usize {
        self.frames.len()
    }
}
