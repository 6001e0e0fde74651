use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};
use esp_hal::delay::Delay;
use esp_hal::gpio::Output;
use esp_hal::spi::master::Spi;
use esp_hal::Blocking;
use log::{debug, info, warn};

use crate::cfg::net_cfg::{HTTP_PORT, HTTP_RX_BUFFER, HTTP_SOCKET_TIMEOUT_SECS, HTTP_TX_BUFFER};
use crate::mem::block_device::FlashBlockDevice;
use crate::mem::fs::FlashFs;
use crate::net::http::HttpServer;
use crate::net::HttpError;
use crate::task::clock::TimeRequests;
use crate::task::link::{LinkMode, LinkReady};

pub type FlashSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, NoDelay>;
pub type FlashDevice = FlashBlockDevice<FlashSpi, Delay>;
pub type SharedFs = Mutex<CriticalSectionRawMutex, FlashFs<FlashDevice>>;

/// HTTP accept loop on whichever interface the Wi-Fi task brought up.
#[embassy_executor::task]
pub async fn http_server(
    station: Stack<'static>,
    access_point: Stack<'static>,
    link: &'static LinkReady,
    fs: &'static SharedFs,
    time: &'static TimeRequests,
) {
    let stack = match link.wait().await {
        LinkMode::Station => station,
        LinkMode::AccessPoint => access_point,
    };
    stack.wait_config_up().await;
    if let Some(config) = stack.config_v4() {
        info!(
            "[HTTP] Listening on {}:{HTTP_PORT}",
            config.address.address()
        );
    }

    let server = HttpServer::new(fs, time);
    let mut rx_buffer = [0u8; HTTP_RX_BUFFER];
    let mut tx_buffer = [0u8; HTTP_TX_BUFFER];
    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(HTTP_SOCKET_TIMEOUT_SECS)));

        if let Err(e) = socket.accept(HTTP_PORT).await {
            warn!("[HTTP] Accept failed: {e:?}");
            Timer::after(Duration::from_millis(200)).await;
            continue;
        }
        match server.serve(&mut socket).await {
            Ok(status) => debug!("[HTTP] Answered {}", status.code()),
            Err(HttpError::Closed) => debug!("[HTTP] Client closed without a request"),
            Err(e) => warn!("[HTTP] Connection error: {e}"),
        }
        socket.close();
        if let Err(e) = socket.flush().await {
            debug!("[HTTP] Flush on close failed: {e:?}");
        }
        socket.abort();
    }
}
