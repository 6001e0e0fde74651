#![no_std]
#![no_main]

use core::cell::RefCell;

use alarm_clock::cfg::board_cfg::{FLASH_SPI_KHZ, I2C_KHZ};
use alarm_clock::drivers::ds1307::Ds1307;
use alarm_clock::drivers::tm1637::Tm1637;
use alarm_clock::drivers::vcnl4010::Vcnl4010;
use alarm_clock::mem::block_device::FlashBlockDevice;
use alarm_clock::mem::ex_flash::W25Q128;
use alarm_clock::mem::fs::FlashFs;
use alarm_clock::sync::display_guard::GuardedDisplay;
use alarm_clock::task::clock::{self, TimeRequests};
use alarm_clock::task::http_server::{http_server, SharedFs};
use alarm_clock::task::link::LinkReady;
use alarm_clock::task::proximity::{self, ProximityIrq};
use alarm_clock::task::wifi::{connection, net_task};
use alarm_clock::util::fault::{signal_forever, FaultSource};

use critical_section::Mutex as CsMutex;
use embassy_embedded_hal::shared_bus::asynch::i2c::I2cDevice;
use embassy_executor::Spawner;
use embassy_net::{Ipv4Address, Ipv4Cidr, StackResources, StaticConfigV4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Delay as AsyncDelay, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_backtrace as _;
use esp_hal::delay::Delay;
#[cfg(feature = "wdg")]
use esp_hal::rtc_cntl::{Rtc, RwdtStage};
use esp_hal::time::RateExtU32;
use esp_hal::{
    clock::CpuClock,
    gpio::{Event, Input, Io, Level, Output, Pull},
    handler,
    i2c::master::{Config as I2cConfig, I2c},
    rng::Rng,
    spi::{
        master::{Config as SpiConfig, Spi},
        Mode,
    },
    timer::timg::TimerGroup,
    Async,
};
use esp_wifi::{init, EspWifiController};
use log::{error, info, warn};

type I2cBus = Mutex<CriticalSectionRawMutex, I2c<'static, Async>>;
type BusDevice = I2cDevice<'static, CriticalSectionRawMutex, I2c<'static, Async>>;
type Display = GuardedDisplay<CriticalSectionRawMutex, Tm1637<Output<'static>, Output<'static>, AsyncDelay>>;

static TIME_REQUESTS: TimeRequests = Signal::new();
static LINK_READY: LinkReady = Signal::new();
static PROXIMITY_IRQ: ProximityIrq<CriticalSectionRawMutex> = ProximityIrq::new();
static PROXIMITY_PIN: CsMutex<RefCell<Option<Input<'static>>>> = CsMutex::new(RefCell::new(None));

macro_rules! mk_static {
    ($t:ty,$val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write(($val));
        x
    }};
}

#[handler]
fn gpio_handler() {
    critical_section::with(|cs| {
        if let Some(pin) = PROXIMITY_PIN.borrow_ref_mut(cs).as_mut() {
            if pin.is_interrupt_set() {
                pin.clear_interrupt();
                PROXIMITY_IRQ.notify_from_isr();
            }
        }
    });
}

#[embassy_executor::task]
async fn clock_task(mut rtc: Ds1307<BusDevice>, display: &'static Display) {
    loop {
        let e = clock::run(&mut rtc, display, &TIME_REQUESTS).await;
        error!("[CLOCK] Stopped ({e}), restarting in 1 second");
        Timer::after_secs(1).await;
    }
}

#[embassy_executor::task]
async fn proximity_task(mut sensor: Vcnl4010<BusDevice>, mut led: Output<'static>) {
    proximity::run(&PROXIMITY_IRQ, &mut sensor, &mut led, &mut AsyncDelay).await
}

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();
    let peripherals = esp_hal::init({
        let mut config = esp_hal::Config::default();
        config.cpu_clock = CpuClock::max();
        config
    });
    info!("Alarm clock started");
    esp_alloc::heap_allocator!(72 * 1024);
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    esp_hal_embassy::init(timg1.timer0);

    #[cfg(feature = "wdg")]
    let mut rtc_cntl = {
        let mut rtc = Rtc::new(peripherals.LPWR);
        rtc.rwdt.enable();
        rtc.rwdt.set_timeout(RwdtStage::Stage0, 5.secs());
        rtc
    };

    let mut led = Output::new(peripherals.GPIO2, Level::Low);

    // External flash on SPI2, chip select driven in software
    let spi = match Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(FLASH_SPI_KHZ.kHz())
            .with_mode(Mode::_0),
    ) {
        Ok(spi) => spi
            .with_sck(peripherals.GPIO18)
            .with_mosi(peripherals.GPIO19)
            .with_miso(peripherals.GPIO20),
        Err(e) => {
            error!("[FLASH] SPI configuration rejected: {e:?}");
            signal_forever(&mut led, &mut AsyncDelay, FaultSource::Littlefs).await
        }
    };
    let cs = Output::new(peripherals.GPIO3, Level::High);
    let spi_device = match ExclusiveDevice::new_no_delay(spi, cs) {
        Ok(device) => device,
        Err(never) => match never {},
    };
    let mut flash = W25Q128::new(spi_device, Delay::new());
    if let Err(e) = flash.init() {
        error!("[FLASH] Init failed: {e:?}");
        signal_forever(&mut led, &mut AsyncDelay, FaultSource::Littlefs).await
    }
    let device = match FlashBlockDevice::new(flash) {
        Ok(device) => device,
        Err(e) => {
            error!("[FLASH] Geometry rejected: {e}");
            signal_forever(&mut led, &mut AsyncDelay, FaultSource::Littlefs).await
        }
    };
    let mut fs = FlashFs::new(device);
    if let Err(e) = fs.mount() {
        error!("[FS] {e}");
        signal_forever(&mut led, &mut AsyncDelay, FaultSource::Littlefs).await
    }
    let fs = &*mk_static!(SharedFs, Mutex::new(fs));

    // RTC and proximity sensor share I2C0
    let i2c = match I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(I2C_KHZ.kHz()),
    ) {
        Ok(i2c) => i2c
            .with_sda(peripherals.GPIO6)
            .with_scl(peripherals.GPIO7)
            .into_async(),
        Err(e) => {
            error!("[I2C] Configuration rejected: {e:?}");
            signal_forever(&mut led, &mut AsyncDelay, FaultSource::I2c).await
        }
    };
    let bus = &*mk_static!(I2cBus, Mutex::new(i2c));

    let mut rtc = Ds1307::new(I2cDevice::new(bus));
    if let Err(e) = rtc.init().await {
        error!("[DS1307] Init failed: {e}");
        signal_forever(&mut led, &mut AsyncDelay, FaultSource::Ds1307).await
    }
    let mut sensor = Vcnl4010::new(I2cDevice::new(bus));
    if let Err(e) = sensor.init().await {
        error!("[VCNL4010] Init failed: {e}");
        signal_forever(&mut led, &mut AsyncDelay, FaultSource::Vcnl4010).await
    }

    let wire = Tm1637::new(
        Output::new(peripherals.GPIO10, Level::High),
        Output::new(peripherals.GPIO11, Level::High),
        AsyncDelay,
    );
    let display = &*mk_static!(Display, GuardedDisplay::new(wire));
    if let Err(e) = display.init().await {
        error!("[TM1637] Init failed: {e}");
        signal_forever(&mut led, &mut AsyncDelay, FaultSource::Tm1637).await
    }

    // Proximity interrupt: open-drain output of the sensor, active low
    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(gpio_handler);
    let mut prox_pin = Input::new(peripherals.GPIO23, Pull::Up);
    critical_section::with(|cs| {
        prox_pin.listen(Event::FallingEdge);
        PROXIMITY_PIN.borrow_ref_mut(cs).replace(prox_pin);
    });

    spawner.spawn(clock_task(rtc, display)).ok();
    spawner.spawn(proximity_task(sensor, led)).ok();

    // Without Wi-Fi the clock keeps running; only the file endpoint is lost
    'wifi_tasks: {
        let rng = Rng::new(peripherals.RNG);
        let init = match init(timg0.timer0, rng, peripherals.RADIO_CLK) {
            Ok(init) => &*mk_static!(EspWifiController<'static>, init),
            Err(e) => {
                warn!("Failed to initialize controller: {e:?}");
                break 'wifi_tasks;
            }
        };
        let (controller, interfaces) = match esp_wifi::wifi::new(init, peripherals.WIFI) {
            Ok((c, w)) => (c, w),
            Err(e) => {
                warn!("Failed to initialize WiFi: {e:?}");
                break 'wifi_tasks;
            }
        };

        let ap_config = embassy_net::Config::ipv4_static(StaticConfigV4 {
            address: Ipv4Cidr::new(Ipv4Address::new(192, 168, 4, 1), 24),
            gateway: Some(Ipv4Address::new(192, 168, 4, 1)),
            dns_servers: Default::default(),
        });
        let seed = (rng.random() as u64) << 32 | rng.random() as u64;
        let (sta_stack, sta_runner) = embassy_net::new(
            interfaces.sta,
            embassy_net::Config::dhcpv4(Default::default()),
            mk_static!(StackResources<3>, StackResources::<3>::new()),
            seed,
        );
        let (ap_stack, ap_runner) = embassy_net::new(
            interfaces.ap,
            ap_config,
            mk_static!(StackResources<3>, StackResources::<3>::new()),
            seed.rotate_left(17),
        );
        spawner.spawn(connection(controller, &LINK_READY)).ok();
        spawner.spawn(net_task(sta_runner)).ok();
        spawner.spawn(net_task(ap_runner)).ok();
        spawner
            .spawn(http_server(sta_stack, ap_stack, &LINK_READY, fs, &TIME_REQUESTS))
            .ok();
    }

    // WDG feed task
    loop {
        Timer::after_secs(2).await;
        #[cfg(feature = "wdg")]
        rtc_cntl.rwdt.feed();
    }
}
