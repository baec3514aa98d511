//! CANBell sensor node
//!
//! Rides on a swinging bell. A hall-effect sensor sees the bell's magnet
//! pass once per swing; the node broadcasts a predicted strike delay over
//! CAN on every pass and answers the receiver's echo, ident and bell
//! assignment commands.

#![no_std]
#![no_main]

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

use canbell::board;
use canbell::bus::Bus;
use canbell::comm::VERSION;
use canbell::error::TransportError;
use canbell::node::SensorNode;
use canbell::protocol::{DeviceIdentity, Frame};
use canbell::sensor::{DebounceConfig, Level};
use canbell::settings::FlashSettings;

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Instant, Timer};
use embedded_can::{Frame as _, Id, StandardId};
use esp_hal::gpio::{Input, InputConfig, Level as PinLevel, Output, OutputConfig, Pull};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::twai::filter::SingleStandardFilter;
use esp_hal::twai::{self, EspTwaiFrame, TwaiMode, TwaiRx, TwaiTx};
use esp_hal::Async;
use esp_storage::FlashStorage;

// ── Channels ──────────────────────────────────────────────────────────

type RxChannel = Channel<CriticalSectionRawMutex, Frame, 8>;

/// Frames from the TWAI receive task, in arrival order
static RX_CHANNEL: RxChannel = Channel::new();

fn now_us() -> u64 {
    Instant::now().as_micros()
}

// ── Bus adapter ───────────────────────────────────────────────────────

/// TWAI transmit half plus the receive queue, as seen by the node.
struct TwaiBus {
    tx: TwaiTx<'static, Async>,
}

impl Bus for TwaiBus {
    fn try_send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let id = StandardId::new(frame.id()).ok_or(TransportError::InvalidFrame)?;
        let out = EspTwaiFrame::new(id, frame.data()).ok_or(TransportError::InvalidFrame)?;
        // Never wait for the mailbox; the next pass retries naturally
        self.tx.transmit(&out).map_err(|_| TransportError::Busy)
    }

    fn poll(&mut self) -> Option<Frame> {
        RX_CHANNEL.try_receive().ok()
    }
}

/// Receive task: converts TWAI frames and queues them for the node.
#[embassy_executor::task]
async fn bus_rx_task(mut rx: TwaiRx<'static, Async>) {
    loop {
        match rx.receive_async().await {
            Ok(f) => {
                let Id::Standard(id) = f.id() else {
                    continue;
                };
                let Some(frame) = Frame::new(id.as_raw(), f.data()) else {
                    continue;
                };
                if RX_CHANNEL.try_send(frame).is_err() {
                    log::warn!("Receive queue full, frame dropped");
                }
            }
            Err(e) => log::warn!("CAN receive error: {:?}", e),
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // esp-rtos needs a heap; the node itself never allocates
    esp_alloc::heap_allocator!(size: 16 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("CANBell sensor v{} starting on {}", VERSION, board::BOARD_NAME);

    // Hardware identity: factory MAC from efuse
    let mac = esp_hal::efuse::Efuse::read_base_mac_address();
    let identity = DeviceIdentity::new(&mac).expect("MAC is 6 bytes");

    let flash = FlashStorage::new(peripherals.FLASH);
    let settings = FlashSettings::new(flash, board::SETTINGS_FLASH_OFFSET);
    let mut node = SensorNode::start(identity, DebounceConfig::new(), settings);

    // ── Pins ─────────────────────────────────────────────────────────

    #[cfg(feature = "board-xiao")]
    let (can_rx_pin, can_tx_pin, sensor_pin, led_pin) =
        (peripherals.GPIO6, peripherals.GPIO5, peripherals.GPIO2, peripherals.GPIO21);
    #[cfg(feature = "board-devkitc")]
    let (can_rx_pin, can_tx_pin, sensor_pin, led_pin) =
        (peripherals.GPIO4, peripherals.GPIO5, peripherals.GPIO21, peripherals.GPIO18);

    let mut sensor = Input::new(sensor_pin, InputConfig::default().with_pull(Pull::Up));
    let (led_on, led_off) = if board::LED_ACTIVE_LOW {
        (PinLevel::Low, PinLevel::High)
    } else {
        (PinLevel::High, PinLevel::Low)
    };
    let mut led = Output::new(led_pin, led_off, OutputConfig::default());

    // ── CAN ──────────────────────────────────────────────────────────

    let mut twai_config = twai::TwaiConfiguration::new(
        peripherals.TWAI0,
        can_rx_pin,
        can_tx_pin,
        twai::BaudRate::B125K,
        TwaiMode::Normal,
    )
    .into_async();

    // Receiver commands only (0x080..=0x0FF): mask 0x780, filter 0x080
    twai_config.set_filter(SingleStandardFilter::new(
        b"0001xxxxxxx",
        b"x",
        [b"xxxxxxxx", b"xxxxxxxx"],
    ));

    let (rx, tx) = twai_config.start().split();
    let mut bus = TwaiBus { tx };

    spawner.spawn(bus_rx_task(rx)).unwrap();

    log::info!(
        "Listening on CAN at {} bit/s, bell {}",
        board::CAN_BITRATE,
        node.config().bell
    );

    // ── Event loop ───────────────────────────────────────────────────
    //
    // Sensor edge, received frame and debounce deadline, whichever is
    // first. The sensor pulls low while the magnet is in range.

    loop {
        let awaiting = node.awaiting();
        let deadline = node.deadline();

        let edge = async {
            match awaiting {
                Some(Level::Active) => {
                    sensor.wait_for_low().await;
                    Level::Active
                }
                Some(Level::Inactive) => {
                    sensor.wait_for_high().await;
                    Level::Inactive
                }
                None => core::future::pending().await,
            }
        };
        let timer = async {
            match deadline {
                Some(at) => Timer::at(Instant::from_micros(at)).await,
                None => core::future::pending::<()>().await,
            }
        };

        let event = select3(edge, RX_CHANNEL.receive(), timer).await;
        match event {
            Either3::First(Level::Active) => {
                if node.on_activate(now_us(), &mut bus).is_some() {
                    led.set_level(led_on);
                }
            }
            Either3::First(Level::Inactive) => {
                node.on_deactivate(now_us());
            }
            Either3::Second(frame) => {
                node.handle_frame(&frame, &mut bus);
            }
            Either3::Third(()) => {
                if let Some(delay) = node.poll(now_us()) {
                    led.set_level(led_off);
                    log::debug!("Next delay {} ms", delay);
                }
            }
        }
    }
}
