//! CANBell library: bell strike sensing, signalling and logging.
//!
//! Sensor nodes ride on swinging bells and broadcast a predicted strike
//! delay over CAN each time the bell passes the sensor. A receiver replays
//! every strike after a per-bell delay and records continuous ringing as
//! touches. This crate holds everything that is not hardware access, so it
//! is testable on any host with `cargo test`. Platform binaries (the ESP32
//! sensor firmware in `src/main.rs`, the ESP-IDF receiver in `receiver/`)
//! are thin consumers that provide the CAN driver, pins and flash.
//!
//! The library is organized in two layers:
//! - **Core** (always built): `protocol`, `bus`, `sensor`, `node`,
//!   `settings`, `scheduler`, `commission`, `rounds`, `config`, `comm`,
//!   `board`. `no_std`, no allocator.
//! - **Log** (`std` feature): `touch`, `storage`, `logger`. Needs a
//!   filesystem and a bounded channel, so it only runs on the receiver.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod board;
pub mod bus;
pub mod comm;
pub mod commission;
pub mod config;
pub mod error;
pub mod node;
pub mod protocol;
pub mod rounds;
pub mod scheduler;
pub mod sensor;
pub mod settings;

#[cfg(feature = "std")]
pub mod logger;
#[cfg(feature = "std")]
pub mod storage;
#[cfg(feature = "std")]
pub mod touch;
