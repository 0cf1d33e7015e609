pub mod flock;
pub mod logging;
pub mod process;
pub mod version;
