// 错误类型
//
// 普通缺页失败不是错误，以 RejectReason 的形式放在 FillOutcome 中返回。
// HptError 只包含致命错误（调用者应当停机）和配置错误。

use crate::types::PageSize;
use thiserror::Error;

/// Why a fill was rejected. Handled by the general fault handler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("address is outside every supported region")]
    Unsupported,

    #[error("no present canonical mapping")]
    NoMapping,

    #[error("access exceeds the mapping's permissions")]
    ProtectionViolation,
}

/// Fatal and configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HptError {
    #[error("hash groups {primary_group} and {secondary_group} still full after eviction")]
    TableFull {
        primary_group: usize,
        secondary_group: usize,
    },

    #[error("translation table allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },

    #[error("failed to bolt kernel mapping at {ea:#x} ({size:?} page)")]
    BoltFailed { ea: u64, size: PageSize },

    #[error("platform-owned storage selected but no platform service supplied")]
    MissingPlatformService,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),
}

impl HptError {
    /// Whether forward progress is impossible and the system must halt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HptError::TableFull { .. } | HptError::AllocationFailed { .. } | HptError::BoltFailed { .. }
        )
    }
}

pub type HptResult<T> = Result<T, HptError>;
