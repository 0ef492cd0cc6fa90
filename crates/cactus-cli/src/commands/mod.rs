pub mod complete;
pub mod device;
