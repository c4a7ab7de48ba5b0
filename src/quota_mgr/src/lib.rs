mod disk_probe;
mod mem_backend;
mod projid_allocator;
mod quota_mgr;
mod quota_provider;
#[cfg(target_os = "linux")]
mod xfs_quota;

pub use disk_probe::*;
pub use mem_backend::*;
pub use projid_allocator::*;
pub use quota_mgr::*;
pub use quota_provider::*;
#[cfg(target_os = "linux")]
pub use xfs_quota::*;
