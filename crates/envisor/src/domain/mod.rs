pub mod device_lock;
pub mod enforcement;
pub mod fleet;
