//! 翻译缓存的公共类型

use crate::region::{self, Region};
use crate::{LARGE_PAGE_SHIFT, PAGE_SHIFT, SEGMENT_SHIFT};
use bitflags::bitflags;

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// 一次缺页访问
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// 访问类型
    pub kind: AccessKind,
    /// 是否来自用户态
    pub from_user: bool,
}

impl Access {
    /// 用户态访问
    pub const fn user(kind: AccessKind) -> Self {
        Self {
            kind,
            from_user: true,
        }
    }

    /// 内核态访问
    pub const fn kernel(kind: AccessKind) -> Self {
        Self {
            kind,
            from_user: false,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind == AccessKind::Write
    }
}

bitflags! {
    /// 规范页表项上的权限
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PagePerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        /// 设备内存，插入时禁用缓存
        const NO_CACHE = 1 << 4;
    }
}

bitflags! {
    /// 下发到哈希表条目的权限位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HptPerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const NO_CACHE = 1 << 4;
        const GUARDED = 1 << 5;
    }
}

/// 页大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageSize {
    /// 4KB
    #[default]
    Base,
    /// 16MB
    Large,
}

impl PageSize {
    pub const fn shift(self) -> u32 {
        match self {
            PageSize::Base => PAGE_SHIFT,
            PageSize::Large => LARGE_PAGE_SHIFT,
        }
    }

    pub const fn bytes(self) -> u64 {
        1u64 << self.shift()
    }

    /// 覆盖的基本页帧数
    pub const fn frames(self) -> u64 {
        1u64 << (self.shift() - PAGE_SHIFT)
    }

    /// 向下对齐到本页大小
    pub const fn align_down(self, addr: u64) -> u64 {
        addr & !(self.bytes() - 1)
    }
}

/// 条目使用的哈希函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WhichHash {
    #[default]
    Primary,
    Secondary,
}

/// 哈希表中的全局槽位下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Slot(pub u32);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// 槽位所在组的首槽位
    pub fn group_base(self, slots_per_group: usize) -> usize {
        self.index() - self.index() % slots_per_group
    }
}

/// 哈希表条目的虚拟标签
///
/// `vsid` 区分地址空间与段，`page` 是段内以 `size` 为粒度的页号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VirtTag {
    pub vsid: u64,
    pub page: u64,
    pub size: PageSize,
}

impl VirtTag {
    /// 计算 `ea` 在给定上下文中的标签
    pub fn new(context: u32, region: Region, ea: u64, size: PageSize) -> Self {
        let segment_offset = ea & ((1 << SEGMENT_SHIFT) - 1);
        Self {
            vsid: region::vsid(context, region, ea),
            page: segment_offset >> size.shift(),
            size,
        }
    }
}

/// 条目在哈希表中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    pub slot: Slot,
    pub which: WhichHash,
}

/// 记录在规范页表项旁的放置元数据
///
/// `has_hash_entry` 为真时 `slot`/`which_hash` 才有意义。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashPlacement {
    pub has_hash_entry: bool,
    pub slot: u32,
    pub which_hash: WhichHash,
}

impl HashPlacement {
    pub fn get(&self) -> Option<Placement> {
        self.has_hash_entry.then_some(Placement {
            slot: Slot(self.slot),
            which: self.which_hash,
        })
    }

    pub fn record(&mut self, placement: Placement) {
        self.has_hash_entry = true;
        self.slot = placement.slot.0;
        self.which_hash = placement.which;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// 规范页表项
///
/// 页表本身由映射代码维护，这里只关心翻译缓存需要读写的字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalPte {
    /// 物理页帧号（以 4KB 为单位）
    pub pfn: u64,
    pub perms: PagePerms,
    pub size: PageSize,
    pub present: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub placement: HashPlacement,
}

impl CanonicalPte {
    pub fn new(pfn: u64, perms: PagePerms) -> Self {
        Self {
            pfn,
            perms,
            size: PageSize::Base,
            present: true,
            accessed: false,
            dirty: false,
            placement: HashPlacement::default(),
        }
    }

    /// 大页映射，`pfn` 需按大页对齐
    pub fn large(pfn: u64, perms: PagePerms) -> Self {
        Self {
            size: PageSize::Large,
            ..Self::new(pfn, perms)
        }
    }

    /// 访问是否在本项权限之内
    pub fn permits(&self, access: Access) -> bool {
        if access.from_user && !self.perms.contains(PagePerms::USER) {
            return false;
        }
        let required = match access.kind {
            AccessKind::Read => PagePerms::READ,
            AccessKind::Write => PagePerms::WRITE,
            AccessKind::Execute => PagePerms::EXEC,
        };
        self.perms.contains(required)
    }

    /// `ea` 所在页对应的物理页帧号
    pub fn frame_for(&self, ea: u64) -> u64 {
        self.pfn + ((ea & (self.size.bytes() - 1)) >> PAGE_SHIFT)
    }
}
