pub mod retry;
pub mod size;

pub use retry::{OpError, OpResult, Pipeline, RetryPolicy, retry_async};
pub use size::{ceil_to_gib, normalize_size_for_proxmox, parse_size_bytes};

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;
pub const GB: u64 = MB * 1024;
pub const TB: u64 = GB * 1024;
