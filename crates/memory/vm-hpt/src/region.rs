// 有效地址区域划分
//
// 有效地址的最高 4 位决定区域：
// - 0x0 用户空间
// - 0xC 内核线性映射
// - 0xD 低半部分为 vmalloc，高半部分为 ioremap
//
// 每个区域各自拥有规范页表和结构锁。

use crate::SEGMENT_SHIFT;

/// 区域编号的位偏移
pub const REGION_SHIFT: u32 = 60;
/// 区域内偏移掩码
pub const REGION_OFFSET_MASK: u64 = (1 << REGION_SHIFT) - 1;

pub const USER_REGION_ID: u64 = 0x0;
pub const KERNEL_REGION_ID: u64 = 0xC;
pub const VMALLOC_REGION_ID: u64 = 0xD;

/// 用户地址上限（64TB）
pub const USER_ADDR_LIMIT: u64 = 1 << 46;
/// 线性映射区起始地址
pub const KERNEL_BASE: u64 = KERNEL_REGION_ID << REGION_SHIFT;
/// 线性映射区大小
pub const KERNEL_REGION_SIZE: u64 = 1 << 46;
/// vmalloc 区起始地址
pub const VMALLOC_BASE: u64 = VMALLOC_REGION_ID << REGION_SHIFT;
pub const VMALLOC_SIZE: u64 = 1 << 45;
/// ioremap 区紧跟在 vmalloc 之后
pub const IOREMAP_BASE: u64 = VMALLOC_BASE + VMALLOC_SIZE;
pub const IOREMAP_SIZE: u64 = 1 << 45;

/// 内核区域共用的上下文号
pub const KERNEL_CONTEXT: u32 = 0;

/// VSID 打散乘数（素数）
pub const VSID_MULTIPLIER: u64 = 268_435_399;
pub const VSID_BITS: u32 = 36;
pub const VSID_MODULUS: u64 = (1 << VSID_BITS) - 1;

/// 地址所属区域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    User,
    KernelDirect,
    Vmalloc,
    IoRemap,
}

impl Region {
    /// 划分有效地址，不支持的地址返回 `None`
    pub fn classify(ea: u64) -> Option<Region> {
        let offset = ea & REGION_OFFSET_MASK;
        match ea >> REGION_SHIFT {
            USER_REGION_ID if ea < USER_ADDR_LIMIT => Some(Region::User),
            KERNEL_REGION_ID if offset < KERNEL_REGION_SIZE => Some(Region::KernelDirect),
            VMALLOC_REGION_ID if offset < VMALLOC_SIZE => Some(Region::Vmalloc),
            VMALLOC_REGION_ID if offset < VMALLOC_SIZE + IOREMAP_SIZE => Some(Region::IoRemap),
            _ => None,
        }
    }

    /// 区域编号（EA 高 4 位）
    pub fn id(self) -> u64 {
        match self {
            Region::User => USER_REGION_ID,
            Region::KernelDirect => KERNEL_REGION_ID,
            Region::Vmalloc | Region::IoRemap => VMALLOC_REGION_ID,
        }
    }

    pub fn is_kernel(self) -> bool {
        self != Region::User
    }
}

/// 由上下文、区域和段号生成 VSID
///
/// 原始 VSID 为 `context | region | esid`，乘以素数后对 2^36-1 取模，
/// 使相邻上下文和段分散到不同的哈希组。
pub fn vsid(context: u32, region: Region, ea: u64) -> u64 {
    let esid = (ea & REGION_OFFSET_MASK) >> SEGMENT_SHIFT;
    let proto = (u128::from(context) << 40) | (u128::from(region.id()) << 36) | u128::from(esid);
    let scrambled = (proto * u128::from(VSID_MULTIPLIER)) % u128::from(VSID_MODULUS);
    // 模数小于 2^36，结果必然落在 u64 内
    scrambled as u64
}
