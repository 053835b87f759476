//! Interface-change bridge.
//!
//! The host routing layer announces address additions and removals as
//! variable-length messages: a fixed header naming the event type and the
//! interface index, followed by a bitmask-selected list of socket
//! addresses padded to pointer alignment. The bridge parses out the
//! interface address, re-resolves the matching live address record (the
//! raw notification lacks the address flags), and relays the event to the
//! protocol engine's address-change handler.
//!
//! Events that cannot be matched to a live interface address are logged
//! and dropped: they cannot correspond to a protocol-relevant change.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use crate::engine::{IfAddrRecord, ProtocolEngine};

/// Address-list slots of a routing notification, in wire order.
pub const RTAX_MAX: usize = 8;

/// Slot carrying the interface address itself.
pub const RTAX_IFA: usize = 5;

/// Notification types acted on (host routing-socket codes).
const RTM_NEWADDR: u8 = 0x0c;
const RTM_DELADDR: u8 = 0x0d;

/// Wire codes of the address families appearing in notifications.
const AF_INET_WIRE: u8 = 2;
const AF_INET6_WIRE: u8 = 30;

/// Socket addresses in the list are padded to this alignment.
const SA_ALIGN: usize = 8;

/// Byte length of the fixed notification header.
pub const ADDR_MSG_HDR_LEN: usize = 20;

/// Fixed header of an address notification (host byte order on the wire).
#[derive(Debug, Clone, Copy)]
pub struct AddrMsgHeader {
    pub msglen: u16,
    pub kind: u8,
    /// Bitmask naming which address-list slots are present.
    pub addrs: u32,
    pub if_index: u16,
}

fn parse_header(buf: &[u8]) -> Option<AddrMsgHeader> {
    if buf.len() < ADDR_MSG_HDR_LEN {
        return None;
    }
    Some(AddrMsgHeader {
        msglen: u16::from_ne_bytes([buf[0], buf[1]]),
        kind: buf[3],
        addrs: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        if_index: u16::from_ne_bytes([buf[12], buf[13]]),
    })
}

/// One socket address parsed from a notification's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireAddr {
    pub family: u8,
    /// Decoded address; `None` for families this bridge does not carry.
    pub addr: Option<IpAddr>,
}

/// Walk the bitmask-selected address list. Entries are `sa_len`-prefixed
/// and rounded up to [`SA_ALIGN`]; a zero `sa_len` still advances one
/// alignment unit.
pub fn parse_rtaddrs(mask: u32, mut buf: &[u8]) -> [Option<WireAddr>; RTAX_MAX] {
    let mut out = [None; RTAX_MAX];
    for (i, slot) in out.iter_mut().enumerate() {
        if mask & (1 << i) == 0 {
            continue;
        }
        if buf.is_empty() {
            break;
        }
        let sa_len = buf[0] as usize;
        let family = if buf.len() > 1 { buf[1] } else { 0 };
        let addr = match family {
            AF_INET_WIRE if buf.len() >= 8 => Some(IpAddr::V4(Ipv4Addr::new(
                buf[4], buf[5], buf[6], buf[7],
            ))),
            AF_INET6_WIRE if buf.len() >= 24 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[8..24]);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        };
        *slot = Some(WireAddr { family, addr });

        let adv = if sa_len == 0 {
            SA_ALIGN
        } else {
            (sa_len + SA_ALIGN - 1) & !(SA_ALIGN - 1)
        };
        buf = if adv >= buf.len() { &[] } else { &buf[adv..] };
    }
    out
}

/// Live view of the host's interfaces. The bridge re-resolves every
/// notification against this, both to reject stale events and to pick up
/// the address flags the notification does not carry.
pub trait IfTable: Send + Sync {
    /// Address records of the interface with this index, or `None` when
    /// the index is unknown.
    fn addrs(&self, if_index: u32) -> Option<Vec<IfAddrRecord>>;
}

/// Parse one notification and relay it to the engine if it matches a live
/// interface address.
pub fn process_notification(engine: &dyn ProtocolEngine, iftable: &dyn IfTable, msg: &[u8]) {
    let Some(hdr) = parse_header(msg) else {
        debug!("address monitor: short notification, ignoring");
        return;
    };
    let added = match hdr.kind {
        RTM_NEWADDR => true,
        RTM_DELADDR => false,
        _ => return, // not an address event
    };

    let rti = parse_rtaddrs(hdr.addrs, &msg[ADDR_MSG_HDR_LEN..]);
    let Some(ifa) = rti[RTAX_IFA].and_then(|w| w.addr) else {
        warn!(
            if_index = hdr.if_index,
            "address monitor: notification without a usable interface address"
        );
        return;
    };
    let Some(records) = iftable.addrs(hdr.if_index as u32) else {
        warn!(
            if_index = hdr.if_index,
            "address monitor: unknown interface index, dropping event"
        );
        return;
    };
    let Some(record) = records.into_iter().find(|r| r.addr == ifa) else {
        warn!(
            if_index = hdr.if_index,
            addr = %ifa,
            "address monitor: address not present on interface, dropping event"
        );
        return;
    };

    debug!(if_index = hdr.if_index, addr = %ifa, added, "address monitor: relaying change");
    engine.address_changed(&record, added);
}

/// The monitor thread: drains raw notifications from the host feed and
/// relays the matching ones.
pub struct AddrMonitor {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl AddrMonitor {
    pub fn start(
        engine: Arc<dyn ProtocolEngine>,
        iftable: Arc<dyn IfTable>,
        feed: Receiver<Vec<u8>>,
    ) -> AddrMonitor {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("sctp-addr-monitor".into())
            .spawn(move || loop {
                select! {
                    recv(feed) -> msg => {
                        match msg {
                            Ok(msg) => process_notification(&*engine, &*iftable, &msg),
                            Err(_) => break, // feed closed
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            })
            .expect("spawn address monitor thread");
        AddrMonitor {
            stop: stop_tx,
            thread: Some(thread),
        }
    }

    /// Stop the monitor thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for AddrMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// [`IfTable`] backed by the host's interface list.
#[cfg(unix)]
pub struct SystemIfTable;

#[cfg(unix)]
impl IfTable for SystemIfTable {
    fn addrs(&self, if_index: u32) -> Option<Vec<IfAddrRecord>> {
        let mut out = Vec::new();
        let mut known = false;
        unsafe {
            let mut list: *mut libc::ifaddrs = std::ptr::null_mut();
            if libc::getifaddrs(&mut list) != 0 {
                return None;
            }
            let mut cur = list;
            while !cur.is_null() {
                let ifa = &*cur;
                cur = ifa.ifa_next;
                if ifa.ifa_name.is_null() {
                    continue;
                }
                if libc::if_nametoindex(ifa.ifa_name) != if_index {
                    continue;
                }
                known = true;
                if ifa.ifa_addr.is_null() {
                    continue;
                }
                match (*ifa.ifa_addr).sa_family as libc::c_int {
                    libc::AF_INET => {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        out.push(IfAddrRecord {
                            if_index,
                            addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                            flags: ifa.ifa_flags as u32,
                        });
                    }
                    libc::AF_INET6 => {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        out.push(IfAddrRecord {
                            if_index,
                            addr: IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                            flags: ifa.ifa_flags as u32,
                        });
                    }
                    _ => {}
                }
            }
            libc::freeifaddrs(list);
        }
        known.then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Chain;
    use crate::error::Result;
    use crate::handle::{AssocId, Handle, HandleGuard};
    use parking_lot::Mutex;

    /// Engine stub recording address events.
    #[derive(Default)]
    struct RecordingEngine {
        events: Mutex<Vec<(IfAddrRecord, bool)>>,
    }

    impl ProtocolEngine for RecordingEngine {
        fn can_extract(&self, _: &HandleGuard<'_>, _: AssocId) -> Result<()> {
            unreachable!("not used by the bridge")
        }

        fn extract_subconnection(
            &self,
            _: &mut HandleGuard<'_>,
            _: AssocId,
        ) -> Result<Arc<Handle>> {
            unreachable!("not used by the bridge")
        }

        fn packet_input(&self, _: Chain, _: usize, _: u16) {}

        fn address_changed(&self, record: &IfAddrRecord, added: bool) {
            self.events.lock().push((record.clone(), added));
        }
    }

    struct StaticIfTable(Vec<IfAddrRecord>);

    impl IfTable for StaticIfTable {
        fn addrs(&self, if_index: u32) -> Option<Vec<IfAddrRecord>> {
            let recs: Vec<_> = self
                .0
                .iter()
                .filter(|r| r.if_index == if_index)
                .cloned()
                .collect();
            (!recs.is_empty()).then_some(recs)
        }
    }

    /// Notification with only the interface-address slot present.
    fn build_msg(kind: u8, if_index: u16, addr: Ipv4Addr) -> Vec<u8> {
        let mut msg = vec![0u8; ADDR_MSG_HDR_LEN];
        msg[3] = kind;
        msg[4..8].copy_from_slice(&(1u32 << RTAX_IFA).to_ne_bytes());
        msg[12..14].copy_from_slice(&if_index.to_ne_bytes());
        // sockaddr_in: len, family, port, address, zero pad
        let mut sa = vec![0u8; 16];
        sa[0] = 16;
        sa[1] = AF_INET_WIRE;
        sa[4..8].copy_from_slice(&addr.octets());
        msg.extend_from_slice(&sa);
        let total_len = msg.len() as u16;
        msg[0..2].copy_from_slice(&total_len.to_ne_bytes());
        msg
    }

    fn record(if_index: u32, addr: Ipv4Addr, flags: u32) -> IfAddrRecord {
        IfAddrRecord {
            if_index,
            addr: IpAddr::V4(addr),
            flags,
        }
    }

    #[test]
    fn parse_rtaddrs_walks_masked_slots() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        let msg = build_msg(RTM_NEWADDR, 2, addr);
        let rti = parse_rtaddrs(1 << RTAX_IFA, &msg[ADDR_MSG_HDR_LEN..]);

        for (i, slot) in rti.iter().enumerate() {
            if i == RTAX_IFA {
                assert_eq!(slot.unwrap().addr, Some(IpAddr::V4(addr)));
            } else {
                assert!(slot.is_none());
            }
        }
    }

    #[test]
    fn parse_rtaddrs_advances_past_earlier_slots() {
        // two entries: slot 0 (16 bytes) then the interface address
        let a = Ipv4Addr::new(192, 0, 2, 1);
        let b = Ipv4Addr::new(192, 0, 2, 2);
        let mut buf = Vec::new();
        for addr in [a, b] {
            let mut sa = vec![0u8; 16];
            sa[0] = 16;
            sa[1] = AF_INET_WIRE;
            sa[4..8].copy_from_slice(&addr.octets());
            buf.extend_from_slice(&sa);
        }
        let mask = (1 << 0) | (1 << RTAX_IFA);
        let rti = parse_rtaddrs(mask, &buf);
        assert_eq!(rti[0].unwrap().addr, Some(IpAddr::V4(a)));
        assert_eq!(rti[RTAX_IFA].unwrap().addr, Some(IpAddr::V4(b)));
    }

    #[test]
    fn matched_notification_reaches_the_engine() {
        let engine = RecordingEngine::default();
        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let table = StaticIfTable(vec![record(3, addr, 0x41)]);

        process_notification(&engine, &table, &build_msg(RTM_NEWADDR, 3, addr));
        process_notification(&engine, &table, &build_msg(RTM_DELADDR, 3, addr));

        let events = engine.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0.flags, 0x41, "flags come from the live record");
        assert!(events[0].1);
        assert!(!events[1].1);
    }

    #[test]
    fn unknown_interface_index_is_dropped() {
        let engine = RecordingEngine::default();
        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let table = StaticIfTable(vec![record(3, addr, 0)]);

        process_notification(&engine, &table, &build_msg(RTM_NEWADDR, 9, addr));
        assert!(engine.events.lock().is_empty());
    }

    #[test]
    fn unmatched_address_is_dropped() {
        let engine = RecordingEngine::default();
        let table = StaticIfTable(vec![record(3, Ipv4Addr::new(10, 0, 0, 1), 0)]);

        process_notification(
            &engine,
            &table,
            &build_msg(RTM_NEWADDR, 3, Ipv4Addr::new(10, 0, 0, 2)),
        );
        assert!(engine.events.lock().is_empty());
    }

    #[test]
    fn non_address_events_are_ignored() {
        let engine = RecordingEngine::default();
        let addr = Ipv4Addr::new(10, 1, 2, 3);
        let table = StaticIfTable(vec![record(3, addr, 0)]);

        process_notification(&engine, &table, &build_msg(0x01, 3, addr));
        assert!(engine.events.lock().is_empty());
    }
}
