pub mod device;
pub mod raid;
