//! Background services for CapyDash.
//!
//! - `worker` - periodic panel workers on their own threads
//! - `system_info` - CPU / RAM / network sampling via sysinfo
//! - `shutdown` - Ctrl-C and run-duration listener

pub mod shutdown;
pub mod system_info;
pub mod worker;
