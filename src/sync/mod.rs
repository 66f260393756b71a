pub mod monitor;
pub mod shared_flag;

pub use monitor::{Monitor, MonitorGuard};
pub use shared_flag::SharedFlag;
