//! ESP-IDF TWAI driver behind the library's [`Bus`] seam.

use std::time::Duration;

use canbell::bus::Bus;
use canbell::error::TransportError;
use canbell::protocol::Frame;

use esp_idf_svc::hal::can::{CanDriver, Flags, Frame as CanFrame};
use esp_idf_svc::hal::delay::{TickType, NON_BLOCK};
use esp_idf_svc::sys::{ESP_ERR_INVALID_STATE, ESP_ERR_TIMEOUT};

pub struct EspCanBus<'d> {
    driver: CanDriver<'d>,
}

impl<'d> EspCanBus<'d> {
    pub fn new(driver: CanDriver<'d>) -> Self {
        Self { driver }
    }

    /// Block for at most `wait` for the next frame.
    pub fn receive_within(&mut self, wait: Duration) -> Option<Frame> {
        let ticks = TickType::new_millis(wait.as_millis() as u64).ticks();
        // Timeout surfaces as an error; either way there is no frame
        let raw = self.driver.receive(ticks).ok()?;
        to_frame(&raw)
    }
}

/// Extended and oversized frames are not ours.
fn to_frame(raw: &CanFrame) -> Option<Frame> {
    let id = u16::try_from(raw.identifier()).ok()?;
    Frame::new(id, raw.data())
}

impl Bus for EspCanBus<'_> {
    fn try_send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let out = CanFrame::new(frame.id() as u32, Flags::None, frame.data())
            .ok_or(TransportError::InvalidFrame)?;
        self.driver.transmit(&out, NON_BLOCK).map_err(|e| match e.code() as u32 {
            ESP_ERR_TIMEOUT => TransportError::Busy,
            ESP_ERR_INVALID_STATE => TransportError::BusOff,
            _ => TransportError::NoAck,
        })
    }

    fn poll(&mut self) -> Option<Frame> {
        let raw = self.driver.receive(NON_BLOCK).ok()?;
        to_frame(&raw)
    }
}
