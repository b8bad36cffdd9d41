pub mod backup;
pub mod bridge;
pub mod device;
pub mod utils;
