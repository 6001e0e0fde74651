pub mod block_device;
pub mod ex_flash;
pub mod fs;
#[cfg(any(test, feature = "std"))]
pub mod sim;
