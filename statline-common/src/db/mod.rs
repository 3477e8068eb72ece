//! Run-log database initialization and helpers

pub mod init;
pub mod retry;

pub use init::*;
pub use retry::retry_on_lock;
