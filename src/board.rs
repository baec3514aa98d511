//! Hardware abstraction for supported boards.
//!
//! Each board module defines pin assignments, memory capabilities and the
//! flash location of the settings record, selected at compile time via
//! feature flags. The CAN transceiver hangs off the TWAI TX/RX pins; the
//! hall-effect sensor pulls its pin low while the bell's magnet is in range.

/// Bus bit rate shared by every node and the receiver
pub const CAN_BITRATE: u32 = 125_000;

#[cfg(feature = "board-xiao")]
mod hw {
    pub const CAN_TX_PIN: u8 = 5;
    pub const CAN_RX_PIN: u8 = 6;
    pub const SENSOR_PIN: u8 = 2;
    pub const LED_PIN: u8 = 21; // user LED, active low
    pub const LED_ACTIVE_LOW: bool = true;
    pub const HAS_PSRAM: bool = true;
    /// Receiver touch buffer in strikes: an hour at six strikes a second,
    /// 108 KB held in PSRAM
    pub const TOUCH_CAPACITY: usize = 3600 * 6;
    /// Start of the NVS partition in the default partition table
    pub const SETTINGS_FLASH_OFFSET: u32 = 0x9000;
    pub const BOARD_NAME: &str = "xiao_esp32s3";
}

#[cfg(feature = "board-devkitc")]
mod hw {
    pub const CAN_TX_PIN: u8 = 5;
    pub const CAN_RX_PIN: u8 = 4;
    pub const SENSOR_PIN: u8 = 21;
    pub const LED_PIN: u8 = 18;
    pub const LED_ACTIVE_LOW: bool = false;
    pub const HAS_PSRAM: bool = false;
    /// Twenty minutes at six strikes a second, 36 KB of internal RAM
    pub const TOUCH_CAPACITY: usize = 1200 * 6;
    pub const SETTINGS_FLASH_OFFSET: u32 = 0x9000;
    pub const BOARD_NAME: &str = "esp32_devkitc";
}

#[cfg(not(any(feature = "board-xiao", feature = "board-devkitc")))]
mod hw {
    pub const BOARD_NAME: &str = "unknown";
}

pub use hw::*;
