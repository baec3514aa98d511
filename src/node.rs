/// Sensor node: debounce FSM plus the node side of the bus protocol.
///
/// The node is event driven. The firmware feeds it sensor edges, received
/// frames and timer expiries; the node decides what to broadcast. Sends go
/// through [`send_or_drop`], so a busy bus never stalls the FSM.
use crate::bus::{send_or_drop, AcceptanceFilter, Bus};
use crate::protocol::{BellNumber, DeviceIdentity, Frame, Message};
use crate::sensor::{DebounceConfig, Debouncer, Level};
use crate::settings::{load_bell, NodeSettings, SettingsStore};

/// Bell assignment plus hardware identity, built once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub bell: BellNumber,
    pub identity: DeviceIdentity,
}

impl NodeConfig {
    fn ack(&self) -> Message {
        Message::Ack {
            bell: self.bell,
            identity: self.identity.clone(),
        }
    }
}

pub struct SensorNode<S> {
    config: NodeConfig,
    debounce: Debouncer,
    filter: AcceptanceFilter,
    ident_armed: bool,
    store: S,
}

impl<S: SettingsStore> SensorNode<S> {
    pub fn new(config: NodeConfig, debounce: DebounceConfig, store: S) -> Self {
        Self {
            config,
            debounce: Debouncer::new(debounce),
            filter: AcceptanceFilter::RECEIVER_COMMANDS,
            ident_armed: false,
            store,
        }
    }

    /// Load the persisted bell (unassigned on any error) and build the node.
    pub fn start(identity: DeviceIdentity, debounce: DebounceConfig, mut store: S) -> Self {
        let bell = load_bell(&mut store);
        log::info!("Sensor node id {} on bell {}", identity, bell);
        Self::new(NodeConfig { bell, identity }, debounce, store)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ident_armed(&self) -> bool {
        self.ident_armed
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sensor activation edge (µs). Broadcasts the previous cycle's
    /// prediction, or an Ack instead when identification is armed.
    pub fn on_activate<B: Bus + ?Sized>(&mut self, now_us: u64, bus: &mut B) -> Option<Message> {
        let delay_ms = self.debounce.activate(now_us)?;
        let msg = if self.ident_armed {
            self.ident_armed = false;
            self.config.ack()
        } else {
            Message::Bell {
                bell: self.config.bell,
                delay_ms,
            }
        };
        send_or_drop(bus, &msg);
        Some(msg)
    }

    /// Sensor deactivation edge (µs).
    pub fn on_deactivate(&mut self, now_us: u64) {
        self.debounce.deactivate(now_us);
    }

    /// Timer expiry (µs). Returns a freshly computed prediction.
    pub fn poll(&mut self, now_us: u64) -> Option<u16> {
        self.debounce.poll(now_us)
    }

    pub fn deadline(&self) -> Option<u64> {
        self.debounce.deadline()
    }

    pub fn awaiting(&self) -> Option<Level> {
        self.debounce.awaiting()
    }

    /// Dispatch a received frame. Returns the reply sent, if any.
    pub fn handle_frame<B: Bus + ?Sized>(&mut self, frame: &Frame, bus: &mut B) -> Option<Message> {
        if !self.filter.accepts(frame.id()) {
            return None;
        }
        let msg = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Discarded frame: {}", e);
                return None;
            }
        };

        let reply = match msg {
            Message::Bell { .. } | Message::Ack { .. } => return None,
            Message::EchoRequest => self.config.ack(),
            Message::IdentRequest => {
                log::debug!("Ident armed");
                self.ident_armed = true;
                return None;
            }
            Message::BellSet { bell, identity } => {
                if identity != self.config.identity || !bell.is_assigned() {
                    return None;
                }
                self.assign(bell);
                self.config.ack()
            }
        };
        send_or_drop(bus, &reply);
        Some(reply)
    }

    fn assign(&mut self, bell: BellNumber) {
        log::info!("Bell changed from {} to {}", self.config.bell, bell);
        self.config = NodeConfig {
            bell,
            identity: self.config.identity.clone(),
        };
        if let Err(e) = self.store.save(&NodeSettings { bell: bell.get() }) {
            log::warn!("Bell {} not persisted: {}", bell, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::error::ConfigError;
    use crate::sensor::HOLD_OFF_US;

    #[derive(Default)]
    struct MemStore {
        saved: Option<NodeSettings>,
        fail_save: bool,
    }

    impl SettingsStore for MemStore {
        fn load(&mut self) -> Result<NodeSettings, ConfigError> {
            self.saved.ok_or(ConfigError::Missing)
        }

        fn save(&mut self, settings: &NodeSettings) -> Result<(), ConfigError> {
            if self.fail_save {
                return Err(ConfigError::Unreadable);
            }
            self.saved = Some(*settings);
            Ok(())
        }
    }

    const ID: [u8; 6] = [0xE6, 0x61, 0x41, 0x03, 0xE7, 0x5A];

    fn node(bell: u8) -> SensorNode<MemStore> {
        let store = MemStore {
            saved: Some(NodeSettings { bell }),
            fail_save: false,
        };
        SensorNode::start(DeviceIdentity::new(&ID).unwrap(), DebounceConfig::new(), store)
    }

    fn set_frame(bell: u8, id: &[u8]) -> Frame {
        Message::BellSet {
            bell: BellNumber::new(bell).unwrap(),
            identity: DeviceIdentity::new(id).unwrap(),
        }
        .encode()
    }

    fn pass(
        n: &mut SensorNode<MemStore>,
        start: u64,
        width: u64,
        bus: &mut LoopbackBus,
    ) -> Option<Message> {
        let sent = n.on_activate(start, bus);
        n.on_deactivate(start + width);
        n.poll(start + width + HOLD_OFF_US);
        sent
    }

    // ── Start-up ───────────────────────────────────────────────────

    #[test]
    fn start_loads_bell() {
        assert_eq!(node(4).config().bell.get(), 4);
    }

    #[test]
    fn start_without_settings_is_unassigned() {
        let n = SensorNode::start(
            DeviceIdentity::new(&ID).unwrap(),
            DebounceConfig::new(),
            MemStore::default(),
        );
        assert_eq!(n.config().bell, BellNumber::UNASSIGNED);
    }

    // ── Strikes ────────────────────────────────────────────────────

    #[test]
    fn strikes_broadcast_previous_prediction() {
        let mut n = node(3);
        let mut bus = LoopbackBus::new();
        pass(&mut n, 0, 60_000, &mut bus);
        pass(&mut n, 1_000_000, 80_000, &mut bus);
        let sent = bus.drain_sent();
        assert_eq!(sent.len(), 2);
        let bell = BellNumber::new(3).unwrap();
        assert_eq!(sent[0], Message::Bell { bell, delay_ms: 0 }.encode());
        assert_eq!(sent[1], Message::Bell { bell, delay_ms: 30 }.encode());
    }

    #[test]
    fn failed_broadcast_still_updates_prediction() {
        let mut n = node(3);
        let mut bus = LoopbackBus::new();
        bus.fail_next_sends(1);
        pass(&mut n, 0, 60_000, &mut bus);
        assert!(bus.sent.is_empty());
        let msg = pass(&mut n, 1_000_000, 60_000, &mut bus);
        assert_eq!(
            msg,
            Some(Message::Bell { bell: BellNumber::new(3).unwrap(), delay_ms: 30 })
        );
        assert_eq!(bus.sent.len(), 1);
    }

    // ── Echo / Ident ───────────────────────────────────────────────

    #[test]
    fn echo_replies_with_ack() {
        let mut n = node(5);
        let mut bus = LoopbackBus::new();
        let reply = n.handle_frame(&Message::EchoRequest.encode(), &mut bus);
        let expected = Message::Ack {
            bell: BellNumber::new(5).unwrap(),
            identity: DeviceIdentity::new(&ID).unwrap(),
        };
        assert_eq!(reply, Some(expected.clone()));
        assert_eq!(bus.drain_sent(), vec![expected.encode()]);
    }

    #[test]
    fn ident_replaces_next_strike_only() {
        let mut n = node(2);
        let mut bus = LoopbackBus::new();
        assert_eq!(n.handle_frame(&Message::IdentRequest.encode(), &mut bus), None);
        assert!(n.ident_armed());
        assert!(bus.sent.is_empty());

        let first = pass(&mut n, 0, 40_000, &mut bus).unwrap();
        assert!(matches!(first, Message::Ack { bell, .. } if bell.get() == 2));
        assert!(!n.ident_armed());

        let second = pass(&mut n, 1_000_000, 40_000, &mut bus).unwrap();
        assert!(matches!(second, Message::Bell { delay_ms: 20, .. }));
    }

    // ── Set ────────────────────────────────────────────────────────

    #[test]
    fn set_with_matching_identity_assigns_and_persists() {
        let mut n = node(0);
        let mut bus = LoopbackBus::new();
        let reply = n.handle_frame(&set_frame(9, &ID), &mut bus);
        assert_eq!(n.config().bell.get(), 9);
        assert_eq!(n.store().saved, Some(NodeSettings { bell: 9 }));
        assert!(matches!(reply, Some(Message::Ack { bell, .. }) if bell.get() == 9));
        assert_eq!(bus.sent.len(), 1);
    }

    #[test]
    fn set_with_other_identity_never_mutates() {
        let mut n = node(4);
        let mut bus = LoopbackBus::new();
        let near_miss = [0xE6u8, 0x61, 0x41, 0x03, 0xE7, 0x5B];
        let stranger = [1u8, 2, 3, 4, 5, 6, 7, 8];
        for other in [&near_miss[..], &ID[..5], &stranger[..]] {
            assert_eq!(n.handle_frame(&set_frame(9, other), &mut bus), None);
        }
        assert_eq!(n.config().bell.get(), 4);
        assert_eq!(n.store().saved, Some(NodeSettings { bell: 4 }));
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn set_to_zero_ignored() {
        let mut n = node(4);
        let mut bus = LoopbackBus::new();
        assert_eq!(n.handle_frame(&set_frame(0, &ID), &mut bus), None);
        assert_eq!(n.config().bell.get(), 4);
    }

    #[test]
    fn set_survives_persist_failure() {
        let mut n = node(1);
        n.store.fail_save = true;
        let mut bus = LoopbackBus::new();
        assert!(n.handle_frame(&set_frame(6, &ID), &mut bus).is_some());
        assert_eq!(n.config().bell.get(), 6);
        assert_eq!(n.store().saved, Some(NodeSettings { bell: 1 }));
    }

    // ── Filtering ──────────────────────────────────────────────────

    #[test]
    fn sensor_traffic_is_filtered() {
        let mut n = node(1);
        let mut bus = LoopbackBus::new();
        let other = Message::Bell { bell: BellNumber::new(2).unwrap(), delay_ms: 5 }.encode();
        assert_eq!(n.handle_frame(&other, &mut bus), None);
        let ack = Message::Ack {
            bell: BellNumber::new(2).unwrap(),
            identity: DeviceIdentity::new(&ID).unwrap(),
        };
        assert_eq!(n.handle_frame(&ack.encode(), &mut bus), None);
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn unknown_command_discarded() {
        let mut n = node(1);
        let mut bus = LoopbackBus::new();
        let frame = Frame::new(0x0C0, &[1]).unwrap();
        assert_eq!(n.handle_frame(&frame, &mut bus), None);
        let frame = Frame::new(0x0A1, &[]).unwrap();
        assert_eq!(n.handle_frame(&frame, &mut bus), None);
        assert_eq!(n.config().bell.get(), 1);
    }
}
