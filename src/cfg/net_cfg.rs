// WIFI configuration constants
pub const WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(ssid) => ssid,
    None => "AlarmClock",
};
pub const WIFI_PSWD: &str = match option_env!("WIFI_PSWD") {
    Some(pswd) => pswd,
    None => "alarmclock",
};
// Station connect attempts before falling back to access point mode
pub const WIFI_MAX_RETRY: u8 = 5;
pub const WIFI_AP_SSID: &str = "ESP32_AP";
pub const WIFI_AP_CHANNEL: u8 = 1;
// HTTP server configuration constants
pub const HTTP_PORT: u16 = 80;
pub const HTTP_RX_BUFFER: usize = 2048;
pub const HTTP_TX_BUFFER: usize = 2048;
pub const HTTP_SOCKET_TIMEOUT_SECS: u64 = 10;
