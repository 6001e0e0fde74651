pub mod clock;
#[cfg(feature = "esp32c6")]
pub mod http_server;
pub mod link;
pub mod proximity;
#[cfg(feature = "esp32c6")]
pub mod wifi;
