use crate::cfg::net_cfg::{WIFI_AP_CHANNEL, WIFI_AP_SSID, WIFI_MAX_RETRY, WIFI_PSWD, WIFI_SSID};
use crate::task::link::{LinkMode, LinkReady, NextStep, StationRetry};
use embassy_net::Runner;
use embassy_time::{Duration, Timer};
use esp_wifi::wifi::WifiState;
use esp_wifi::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, WifiController,
    WifiDevice, WifiEvent,
};
use log::{error, info, warn};

const RETRY_DELAY_MS: u64 = 5000;

fn station_config() -> Option<Configuration> {
    // ClientConfiguration wants String<32> for the SSID and String<64> for the password
    let ssid = match WIFI_SSID.try_into() {
        Ok(ssid) => ssid,
        Err(e) => {
            error!("[WiFi] Invalid SSID format: {e:?}");
            return None;
        }
    };
    let password = match WIFI_PSWD.try_into() {
        Ok(pwd) => pwd,
        Err(e) => {
            error!("[WiFi] Invalid password format: {e:?}");
            return None;
        }
    };
    Some(Configuration::Client(ClientConfiguration {
        ssid,
        password,
        ..Default::default()
    }))
}

fn access_point_config() -> Option<Configuration> {
    let ssid = WIFI_AP_SSID.try_into().ok()?;
    Some(Configuration::AccessPoint(AccessPointConfiguration {
        ssid,
        channel: WIFI_AP_CHANNEL,
        auth_method: AuthMethod::None,
        max_connections: 4,
        ..Default::default()
    }))
}

/// Try the configured network, retrying up to `WIFI_MAX_RETRY` times.
/// Returns once the station has given up.
async fn run_station(controller: &mut WifiController<'static>, link: &LinkReady) {
    let Some(client_config) = station_config() else {
        return;
    };
    let mut retry = StationRetry::new(WIFI_MAX_RETRY);
    loop {
        if esp_wifi::wifi::wifi_state() == WifiState::StaConnected {
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            warn!("[WiFi] Disconnected. Reconnecting in 5 seconds...");
            Timer::after(Duration::from_millis(RETRY_DELAY_MS)).await
        }
        if !matches!(controller.is_started(), Ok(true)) {
            if let Err(e) = controller.set_configuration(&client_config) {
                error!("[WiFi] Failed to set WiFi configuration: {e:?}");
                return;
            }
            info!("[WiFi] Starting WiFi STA for SSID: {WIFI_SSID}");
            if let Err(e) = controller.start_async().await {
                error!("[WiFi] Failed to start controller: {e:?}");
                return;
            }
        }

        info!("[WiFi] Attempting to connect to SSID: {WIFI_SSID}...");
        match controller.connect_async().await {
            Ok(()) => {
                info!("[WiFi] Connected to SSID: {WIFI_SSID}");
                retry.connected();
                link.signal(LinkMode::Station);
            }
            Err(e) => {
                warn!(
                    "[WiFi] Connect attempt {} failed: {e:?}",
                    retry.failures() + 1
                );
                if retry.failed() == NextStep::FallBackToAccessPoint {
                    return;
                }
                Timer::after(Duration::from_millis(RETRY_DELAY_MS)).await
            }
        }
    }
}

/// Wi-Fi bring-up task.
///
/// Starts in station mode. If the station cannot associate, the radio is
/// switched to an open access point so the file endpoint stays reachable.
#[embassy_executor::task]
pub async fn connection(mut controller: WifiController<'static>, link: &'static LinkReady) {
    info!("[WiFi] Connection task started");
    if let Err(e) = controller.set_power_saving(esp_wifi::config::PowerSaveMode::None) {
        warn!("[WiFi] Failed to disable power saving mode: {e:?}");
    }

    run_station(&mut controller, link).await;

    warn!("[WiFi] Falling back to access point {WIFI_AP_SSID}");
    if matches!(controller.is_started(), Ok(true)) {
        if let Err(e) = controller.stop_async().await {
            warn!("[WiFi] Failed to stop station: {e:?}");
        }
    }
    let Some(ap_config) = access_point_config() else {
        error!("[WiFi] Invalid access point SSID");
        return;
    };
    if let Err(e) = controller.set_configuration(&ap_config) {
        error!("[WiFi] Failed to configure access point: {e:?}");
        return;
    }
    if let Err(e) = controller.start_async().await {
        error!("[WiFi] Failed to start access point: {e:?}");
        return;
    }
    info!("[WiFi] Access point {WIFI_AP_SSID} up on channel {WIFI_AP_CHANNEL}");
    link.signal(LinkMode::AccessPoint);

    loop {
        controller.wait_for_event(WifiEvent::ApStaconnected).await;
        info!("[WiFi] Client joined the access point");
    }
}

/// Network stack runner task
#[embassy_executor::task(pool_size = 2)]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    info!("[WiFi] Network task started");
    runner.run().await
}
