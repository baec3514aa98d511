/// Bus transport seam.
///
/// The CAN driver lives in the platform binaries. The core only needs a
/// non-blocking send that may fail and a non-blocking receive poll.
use crate::error::TransportError;
use crate::protocol::{Frame, Message};

/// Addressed frame transport. Frames are delivered in arrival order.
pub trait Bus {
    /// Queue a frame for transmission. Never retries.
    fn try_send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Next received frame, if any.
    fn poll(&mut self) -> Option<Frame>;
}

/// Hardware-style acceptance filter: an id passes when
/// `id & mask == filter & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub mask: u16,
    pub filter: u16,
}

impl AcceptanceFilter {
    /// Sensor nodes: only receiver commands (0x080..=0x0FF).
    pub const RECEIVER_COMMANDS: Self = Self {
        mask: 0x780,
        filter: 0x080,
    };

    pub const fn accepts(&self, id: u16) -> bool {
        id & self.mask == self.filter & self.mask
    }
}

/// Encode and send, logging and dropping the frame on failure.
/// Returns whether the driver accepted it.
pub fn send_or_drop<B: Bus + ?Sized>(bus: &mut B, msg: &Message) -> bool {
    match bus.try_send(&msg.encode()) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Dropped {} frame: {}", msg.kind(), e);
            false
        }
    }
}

#[cfg(feature = "std")]
pub use loopback::LoopbackBus;

#[cfg(feature = "std")]
mod loopback {
    use std::collections::VecDeque;

    use super::Bus;
    use crate::error::TransportError;
    use crate::protocol::Frame;

    /// In-memory bus for host tests and wiring nodes to a receiver.
    ///
    /// Sent frames land in `sent`; frames pushed with [`LoopbackBus::deliver`]
    /// come back from `poll` in order.
    #[derive(Debug, Default)]
    pub struct LoopbackBus {
        pub sent: Vec<Frame>,
        inbox: VecDeque<Frame>,
        fail_sends: usize,
    }

    impl LoopbackBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a frame for the next `poll`.
        pub fn deliver(&mut self, frame: Frame) {
            self.inbox.push_back(frame);
        }

        /// Make the next `n` sends fail with `Busy`.
        pub fn fail_next_sends(&mut self, n: usize) {
            self.fail_sends = n;
        }

        /// Take everything sent so far.
        pub fn drain_sent(&mut self) -> Vec<Frame> {
            core::mem::take(&mut self.sent)
        }
    }

    impl Bus for LoopbackBus {
        fn try_send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            if self.fail_sends > 0 {
                self.fail_sends -= 1;
                return Err(TransportError::Busy);
            }
            self.sent.push(frame.clone());
            Ok(())
        }

        fn poll(&mut self) -> Option<Frame> {
            self.inbox.pop_front()
        }
    }
}
