//! Remote execution against fleet servers

pub mod executor;
pub mod memory;
pub mod ssh;
