//! CANBell receiver: ESP-IDF std firmware
//!
//! Listens to every sensor on the bus, replays each strike after the
//! installation's per-bell delay, streams NDJSON reports on the console and
//! records touches to a rotating log on SPIFFS.
//!
//! Thread layout, all connected by bounded `std::sync::mpsc` channels:
//! - bus (main thread): the only CAN writer. Receives frames, runs the
//!   scheduler, bell assignment and the self-test generator.
//! - logger: drains fired strikes into touches, owns the touch log and
//!   answers listing requests.
//! - console: reads NDJSON commands.
//! - output: writes reports to the console log.

mod can;

use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use canbell::board;
use canbell::bus::send_or_drop;
use canbell::comm::{self, HostCommand, LineReader, MsgBuffer, Report, VERSION};
use canbell::commission::{Commissioner, Step};
use canbell::config::{self, ReceiverConfig, DELAYS_FILE, RECEIVER_FILE};
use canbell::logger::{self, LogSender, TouchLogger};
use canbell::protocol::Message;
use canbell::rounds::Rounds;
use canbell::scheduler::{DelayTable, Scheduler, StrikeEvent};
use canbell::storage::{TouchLog, TouchStore, TouchSummary};
use canbell::touch::ENTRY_LEN;

use can::EspCanBus;
use esp_idf_svc::hal::can::{config::Config as CanConfig, config::Timing, CanDriver};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::sys::{esp, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register};

const MOUNT_POINT: &str = "/spiffs";
const LOG_DIR: &str = "/spiffs/log";

/// Longest the bus thread blocks on the CAN driver before checking
/// commands and timers again
const MAX_WAIT: Duration = Duration::from_millis(20);

/// Periodic status report interval
const STATUS_INTERVAL_MS: u64 = 30_000;

/// Internal RAM alone cannot be trusted with a larger touch buffer
const MAX_INTERNAL_TOUCH_BYTES: usize = 48 * 1024;

const _: () = assert!(
    board::HAS_PSRAM || board::TOUCH_CAPACITY * ENTRY_LEN <= MAX_INTERNAL_TOUCH_BYTES
);

/// Boot time, captured once in main
static BOOT_INSTANT: OnceLock<Instant> = OnceLock::new();

fn uptime_ms() -> u64 {
    BOOT_INSTANT.get().map_or(0, |boot| boot.elapsed().as_millis() as u64)
}

fn emit(output_tx: &SyncSender<MsgBuffer>, report: &Report) {
    if let Some(buf) = comm::report_buffer(report) {
        let _ = output_tx.try_send(buf);
    }
}

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let _ = BOOT_INSTANT.set(Instant::now());

    log::info!("CANBell receiver v{} starting on {} (std)", VERSION, board::BOARD_NAME);

    // ── Configuration ────────────────────────────────────────────────

    if let Err(e) = mount_spiffs() {
        log::warn!("SPIFFS mount failed: {}", e);
    }

    let read = |name: &str| std::fs::read(Path::new(MOUNT_POINT).join(name)).ok();
    let table = config::load_delay_table(read(DELAYS_FILE).as_deref());
    let cfg = config::load_receiver_config(read(RECEIVER_FILE).as_deref());

    log::info!(
        "{} bells installed, idle timeout {} s, keeping {} touches",
        table.total_bells(),
        cfg.idle_timeout_secs,
        cfg.log_depth
    );

    // ── Channels ─────────────────────────────────────────────────────

    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);
    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);

    // ── Logger thread ────────────────────────────────────────────────
    //
    // No bells means nothing is ever scheduled, so nothing to log. Without
    // a logger the bus thread keeps the log itself for listings.

    let touch_log = match TouchLog::open(LOG_DIR, cfg.log_depth as usize) {
        Ok(log) => Some(log),
        Err(e) => {
            log::error!("Touch log unavailable: {}", e);
            None
        }
    };

    let (log_tx, local_log) = match touch_log {
        Some(store) if !table.is_empty() => {
            match spawn_logger(store.clone(), &cfg, output_tx.clone()) {
                Ok(tx) => (Some(tx), None),
                Err(e) => {
                    log::error!("Touch logging disabled: {}", e);
                    (None, Some(store))
                }
            }
        }
        other => (None, other),
    };

    // ── Output thread ────────────────────────────────────────────────

    thread::Builder::new()
        .name("output".into())
        .stack_size(4096)
        .spawn(move || {
            output_thread(output_rx);
        })?;
    log::info!("Output thread spawned");

    // ── Console thread ───────────────────────────────────────────────

    thread::Builder::new()
        .name("console".into())
        .stack_size(4096)
        .spawn(move || {
            console_thread(cmd_tx);
        })?;
    log::info!("Console thread spawned");

    // ── CAN ──────────────────────────────────────────────────────────

    let peripherals = Peripherals::take()?;
    let can_config = CanConfig::new().timing(Timing::B125K);

    #[cfg(feature = "xiao")]
    let mut driver = CanDriver::new(
        peripherals.can,
        peripherals.pins.gpio5,
        peripherals.pins.gpio6,
        &can_config,
    )?;
    #[cfg(all(feature = "devkitc", not(feature = "xiao")))]
    let mut driver = CanDriver::new(
        peripherals.can,
        peripherals.pins.gpio5,
        peripherals.pins.gpio4,
        &can_config,
    )?;

    driver.start()?;
    log::info!("CAN started at {} bit/s", board::CAN_BITRATE);

    let bus = EspCanBus::new(driver);
    bus_main(bus, table, cfg, log_tx, local_log, output_tx, cmd_rx);
}

/// Allocate the touch buffer up front and start draining. An allocation
/// failure leaves the receiver running without a logger.
fn spawn_logger(
    store: TouchLog,
    cfg: &ReceiverConfig,
    output_tx: SyncSender<MsgBuffer>,
) -> anyhow::Result<LogSender> {
    let mut logger = TouchLogger::new(store, board::TOUCH_CAPACITY)?;
    log::info!(
        "Touch buffer of {} strikes in {}",
        board::TOUCH_CAPACITY,
        if board::HAS_PSRAM { "PSRAM" } else { "internal RAM" }
    );

    let (tx, rx) = logger::log_queue();
    let idle = Duration::from_secs(cfg.idle_timeout_secs as u64);
    thread::Builder::new()
        .name("logger".into())
        .stack_size(8192)
        .spawn(move || {
            logger.run(&rx, idle, |summaries| report_touches(summaries, &output_tx));
        })?;
    log::info!("Logger thread spawned");
    Ok(tx)
}

fn mount_spiffs() -> anyhow::Result<()> {
    let conf = esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: std::ptr::null(),
        max_files: 5,
        format_if_mount_failed: true,
    };
    esp!(unsafe { esp_vfs_spiffs_register(&conf) })?;
    Ok(())
}

// ── Bus thread ───────────────────────────────────────────────────────

struct BusLoop {
    bus: EspCanBus<'static>,
    scheduler: Scheduler,
    commissioner: Option<Commissioner>,
    rounds: Option<Rounds>,
    log_tx: Option<LogSender>,
    /// The touch log, when no logger thread owns it
    local_log: Option<TouchLog>,
    output_tx: SyncSender<MsgBuffer>,
}

fn bus_main(
    bus: EspCanBus<'static>,
    table: DelayTable,
    cfg: ReceiverConfig,
    log_tx: Option<LogSender>,
    local_log: Option<TouchLog>,
    output_tx: SyncSender<MsgBuffer>,
    cmd_rx: Receiver<HostCommand>,
) -> ! {
    let rounds = if cfg.self_test {
        log::info!("Self-test: ringing rounds on {} bells", table.total_bells());
        Rounds::new(table.total_bells(), uptime_ms())
    } else {
        None
    };

    let mut state = BusLoop {
        bus,
        scheduler: Scheduler::new(table),
        commissioner: None,
        rounds,
        log_tx,
        local_log,
        output_tx,
    };
    let mut next_status = STATUS_INTERVAL_MS;

    loop {
        // Sleep on the driver until the nearest timer, bounded so console
        // commands stay responsive
        let now = uptime_ms();
        let wait = state
            .next_deadline()
            .map_or(MAX_WAIT, |at| Duration::from_millis(at.saturating_sub(now)))
            .min(MAX_WAIT);

        if let Some(frame) = state.bus.receive_within(wait) {
            let arrival = uptime_ms();
            match Message::decode(&frame) {
                Ok(msg) => state.on_message(&msg, arrival),
                Err(e) => log::warn!("Discarded frame: {}", e),
            }
        }

        let now = uptime_ms();
        state.fire_due(now);
        state.tick(now);

        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => state.on_command(cmd, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        if now >= next_status {
            next_status = now + STATUS_INTERVAL_MS;
            state.status(now);
        }
    }
}

impl BusLoop {
    fn next_deadline(&self) -> Option<u64> {
        [
            self.scheduler.next_deadline(),
            self.commissioner.as_ref().and_then(Commissioner::deadline),
            self.rounds.as_ref().map(Rounds::next_at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_message(&mut self, msg: &Message, arrival: u64) {
        log::debug!("{}", msg);

        if let Some(c) = self.commissioner.as_mut() {
            let step = c.on_message(msg);
            self.apply(step);
        }

        match msg {
            Message::Bell { .. } => {
                self.scheduler.handle_message(msg, arrival);
            }
            Message::Ack { bell, identity } => {
                let id = comm::format_identity(identity);
                emit(&self.output_tx, &Report::Ack { bell: bell.get(), id: &id });
            }
            _ => {}
        }
    }

    /// Fire every due strike: console first, then the logger queue.
    fn fire_due(&mut self, now: u64) {
        while let Some(ev) = self.scheduler.pop_due(now) {
            self.strike(ev);
        }
    }

    fn strike(&mut self, ev: StrikeEvent) {
        emit(
            &self.output_tx,
            &Report::Strike {
                bell: ev.bell.get(),
                sym: ev.bell.symbol_str(),
                delay: ev.predicted_delay_ms,
                ts: ev.fired_at_ms,
            },
        );
        if let Some(tx) = &self.log_tx {
            logger::offer(tx, ev);
        }
    }

    fn tick(&mut self, now: u64) {
        if let Some(c) = self.commissioner.as_mut() {
            let step = c.poll(now);
            self.apply(step);
        }
        if let Some(rounds) = self.rounds.as_mut() {
            while let Some(msg) = rounds.pop_due(now) {
                self.scheduler.handle_message(&msg, now);
            }
        }
    }

    fn apply(&mut self, step: Step) {
        let Some(target) = self.commissioner.as_ref().map(|c| c.target().get()) else {
            return;
        };
        let report = |state, from| Report::Commission {
            state,
            bell: target,
            from,
        };
        match step {
            Step::Idle => return,
            Step::Send(msg) => {
                send_or_drop(&mut self.bus, &msg);
                emit(&self.output_tx, &report("swing", None));
            }
            Step::Assigned { from, to, set } => {
                send_or_drop(&mut self.bus, &set);
                log::info!("Bell {} assigned (was {})", to, from);
                emit(&self.output_tx, &report("assigned", Some(from.get())));
            }
            Step::Failed(e) => {
                log::warn!("Bell assignment failed: {}", e);
                emit(&self.output_tx, &report("failed", None));
            }
        }
        if self.commissioner.as_ref().is_some_and(Commissioner::is_done) {
            self.commissioner = None;
        }
    }

    fn on_command(&mut self, cmd: HostCommand, now: u64) {
        match cmd {
            HostCommand::Echo => {
                send_or_drop(&mut self.bus, &Message::EchoRequest);
            }
            HostCommand::Ident => {
                send_or_drop(&mut self.bus, &Message::IdentRequest);
            }
            HostCommand::SetBell { bell } => {
                if self.commissioner.is_some() {
                    log::warn!("Bell assignment already in progress");
                    return;
                }
                match Commissioner::new(bell, now) {
                    Ok(c) => {
                        self.commissioner = Some(c);
                        emit(
                            &self.output_tx,
                            &Report::Commission {
                                state: "checking",
                                bell,
                                from: None,
                            },
                        );
                    }
                    Err(e) => {
                        log::warn!("{}", e);
                        emit(
                            &self.output_tx,
                            &Report::Commission {
                                state: "failed",
                                bell,
                                from: None,
                            },
                        );
                    }
                }
            }
            HostCommand::Status => self.status(now),
            HostCommand::Touches => match (&self.log_tx, &self.local_log) {
                (Some(tx), _) => {
                    logger::request_listing(tx);
                }
                (None, Some(store)) => report_touches(&store.summaries(), &self.output_tx),
                (None, None) => log::warn!("Touch log unavailable"),
            },
        }
    }

    fn status(&self, now: u64) {
        emit(
            &self.output_tx,
            &Report::Status {
                bells: self.scheduler.table().total_bells() as u8,
                pending: self.scheduler.pending().min(u8::MAX as usize) as u8,
                uptime: (now / 1000) as u32,
                board: board::BOARD_NAME,
                version: VERSION,
            },
        );
    }
}

// ── Console thread ───────────────────────────────────────────────────

fn console_thread(cmd_tx: SyncSender<HostCommand>) {
    log::info!("Console thread started");

    let mut reader = LineReader::new();
    let mut stdin = std::io::stdin();
    let mut byte = [0u8; 1];

    loop {
        match stdin.read(&mut byte) {
            Ok(1) => {}
            // Console not ready yet
            _ => {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        }
        let Some(line) = reader.feed(byte[0]) else {
            continue;
        };
        match comm::parse_command(line) {
            Some(cmd) => {
                if cmd_tx.try_send(cmd).is_err() {
                    log::warn!("Command queue full, dropped {:?}", cmd);
                }
            }
            None => log::warn!("Unrecognised command"),
        }
    }
}

fn report_touches(summaries: &[TouchSummary], output_tx: &SyncSender<MsgBuffer>) {
    for summary in summaries {
        log::info!("{}", summary);
        emit(
            output_tx,
            &Report::Touch {
                n: (summary.slot + 1) as u8,
                strikes: summary.strikes as u32,
                secs: summary.secs(),
            },
        );
    }
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: Receiver<MsgBuffer>) {
    log::info!("Output thread started");

    while let Ok(msg) = output_rx.recv() {
        if let Ok(s) = std::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}
