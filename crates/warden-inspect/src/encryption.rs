//! Encryption detection by well-known port
//!
//! Marks outbound connections to TLS-only service ports as encrypted. The
//! payload is never looked at and the inspector never takes a side on the
//! verdict.

use crate::error::Result;
use crate::registry::{Inspector, InspectorRegistry};
use warden_common::{Connection, Decision, Packet};

/// Registered name
pub const NAME: &str = "Encryption Detection";

/// Registered order
pub const ORDER: i32 = 0;

/// HTTPS, SMTPS, IMAPS, POP3S
pub const ENCRYPTED_PORTS: [u16; 4] = [443, 465, 993, 995];

/// Port based encryption detector
#[derive(Debug, Default)]
pub struct EncryptionDetector;

impl Inspector for EncryptionDetector {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_packet(&mut self, conn: &mut Connection, _packet: &Packet) -> Result<Decision> {
        if !conn.is_inbound() && ENCRYPTED_PORTS.contains(&conn.entity.port) && !conn.encrypted {
            conn.encrypted = true;
            conn.request_save();
        }
        Ok(Decision::undeterminable())
    }
}

/// Factory producing one detector per connection
pub fn detector_factory(_conn: &Connection, _packet: &Packet) -> Result<Option<Box<dyn Inspector>>> {
    Ok(Some(Box::new(EncryptionDetector)))
}

/// Register the detector
pub fn register(registry: &mut InspectorRegistry) -> Result<()> {
    registry.register(NAME, ORDER, detector_factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use warden_common::{Direction, Endpoint, Entity, PacketInfo, Verdict};

    fn conn(direction: Direction, remote_port: u16) -> Connection {
        let local = Endpoint {
            ip: "10.0.0.2".parse().unwrap(),
            port: 49152,
        };
        let entity = Entity {
            ip: "203.0.113.5".parse().unwrap(),
            port: remote_port,
            domain: None,
        };
        match direction {
            Direction::Outbound => Connection::outbound("enc", 6, local, entity),
            Direction::Inbound => Connection::inbound("enc", 6, local, entity),
        }
    }

    fn packet() -> Packet {
        Packet::new(
            PacketInfo {
                direction: Direction::Outbound,
                protocol: 6,
                src: "10.0.0.2".parse().unwrap(),
                dst: "203.0.113.5".parse().unwrap(),
                src_port: 49152,
                dst_port: 443,
            },
            &b"\x16\x03\x01"[..],
        )
    }

    #[test]
    fn test_outbound_tls_ports_marked() {
        for port in ENCRYPTED_PORTS {
            let mut c = conn(Direction::Outbound, port);
            let decision = EncryptionDetector.handle_packet(&mut c, &packet()).unwrap();
            assert_eq!(decision.verdict, Verdict::Undeterminable);
            assert!(c.encrypted, "port {}", port);
            assert!(c.take_save_request());
        }
    }

    #[test]
    fn test_inbound_and_other_ports_untouched() {
        let cases = [(Direction::Inbound, 443), (Direction::Outbound, 80), (Direction::Outbound, 8443)];
        for (direction, port) in cases {
            let mut c = conn(direction, port);
            let decision = EncryptionDetector.handle_packet(&mut c, &packet()).unwrap();
            assert_eq!(decision, Decision::undeterminable());
            assert!(!c.encrypted);
            assert!(!c.take_save_request());
        }
    }

    #[test]
    fn test_registered_detector_saves_once() {
        let saves = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&saves);
        let mut registry = InspectorRegistry::default().with_saver(move |_: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        register(&mut registry).unwrap();
        assert_eq!(registry.names(), vec![NAME]);

        let mut c = conn(Direction::Outbound, 993);
        let mut session = registry.session();
        for _ in 0..3 {
            assert_eq!(session.handle_packet(&mut c, &packet()), Decision::undeterminable());
        }
        assert!(c.encrypted);
        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert_eq!(c.verdict(), Verdict::Undecided);
    }
}
