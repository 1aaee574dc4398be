// 启动期配置
//
// 翻译目录只在启动时创建一次，配置在此之后不再变化。

use crate::error::{HptError, HptResult};
use crate::{DEFAULT_SLOTS_PER_GROUP, MIN_GROUP_COUNT, PAGE_SIZE};
use serde::Deserialize;

/// 哈希表存储的归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// 裸机：内核自行分配连续存储
    #[default]
    BareMetal,
    /// 虚拟化平台：存储完全交给平台原语
    PlatformOwned,
}

/// 平台能力
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlatformCaps {
    pub storage: StorageKind,
    /// 是否支持 16MB 大页
    pub large_pages: bool,
    /// 低端以基本页固定映射的区域大小，其上部分使用大页
    pub bolt_base_region: u64,
    /// 硬件能否区分取指缺页与数据缺页
    pub ifetch_faults_distinguished: bool,
    /// 普通数据路径填充后 I/D 缓存是否保持一致
    pub coherent_icache_on_data_fill: bool,
}

impl Default for PlatformCaps {
    fn default() -> Self {
        Self {
            storage: StorageKind::BareMetal,
            large_pages: true,
            bolt_base_region: 16 * 1024 * 1024,
            ifetch_faults_distinguished: false,
            coherent_icache_on_data_fill: false,
        }
    }
}

/// 内核映像的物理范围，启动时以线性映射固定插入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KernelImage {
    pub phys_start: u64,
    pub size: u64,
}

/// 翻译缓存配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HptConfig {
    /// 物理内存总量（字节）
    pub total_memory: u64,
    /// 每组槽位数
    pub slots_per_group: usize,
    /// 指定组数，不指定时按内存大小计算
    pub group_count: Option<usize>,
    /// 按内存计算时的组数下限
    pub min_group_count: usize,
    pub platform: PlatformCaps,
    pub kernel_image: Option<KernelImage>,
}

impl Default for HptConfig {
    fn default() -> Self {
        Self {
            total_memory: 256 * 1024 * 1024,
            slots_per_group: DEFAULT_SLOTS_PER_GROUP,
            group_count: None,
            min_group_count: MIN_GROUP_COUNT,
            platform: PlatformCaps::default(),
            kernel_image: None,
        }
    }
}

impl HptConfig {
    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(text: &str) -> HptResult<Self> {
        let config: HptConfig =
            toml::from_str(text).map_err(|e| HptError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> HptResult<()> {
        if self.total_memory < PAGE_SIZE {
            return Err(HptError::InvalidConfig(format!(
                "total_memory {:#x} is smaller than one page",
                self.total_memory
            )));
        }
        if self.slots_per_group == 0 || !self.slots_per_group.is_power_of_two() {
            return Err(HptError::InvalidConfig(format!(
                "slots_per_group {} must be a non-zero power of two",
                self.slots_per_group
            )));
        }
        if let Some(groups) = self.group_count {
            if groups == 0 || !groups.is_power_of_two() {
                return Err(HptError::InvalidConfig(format!(
                    "group_count {groups} must be a non-zero power of two"
                )));
            }
        }
        if self.min_group_count == 0 || !self.min_group_count.is_power_of_two() {
            return Err(HptError::InvalidConfig(format!(
                "min_group_count {} must be a non-zero power of two",
                self.min_group_count
            )));
        }
        if let Some(image) = self.kernel_image {
            let end = image.phys_start.checked_add(image.size);
            if image.size == 0 || end.is_none_or(|end| end > self.total_memory) {
                return Err(HptError::InvalidConfig(format!(
                    "kernel image {:#x}+{:#x} lies outside physical memory",
                    image.phys_start, image.size
                )));
            }
        }
        Ok(())
    }

    pub fn with_group_count(mut self, groups: usize) -> Self {
        self.group_count = Some(groups);
        self
    }

    pub fn with_slots_per_group(mut self, slots: usize) -> Self {
        self.slots_per_group = slots;
        self
    }

    pub fn with_kernel_image(mut self, image: KernelImage) -> Self {
        self.kernel_image = Some(image);
        self
    }

    pub fn with_platform(mut self, platform: PlatformCaps) -> Self {
        self.platform = platform;
        self
    }
}
