mod error;
mod file;
mod interface;
mod lock;
mod memory;
mod registry;

pub use error::*;
pub use file::*;
pub use interface::*;
pub use lock::LockRetry;
pub(crate) use lock::with_lock;
pub use memory::*;
pub use registry::*;
