//! Per-port flow classification.
//!
//! Four dense tables, one per family and transport protocol, hold one
//! verdict byte per local port. A flow is classified lazily on its first
//! interesting packet (the TCP SYN, or any UDP packet) by consulting the
//! destination-IP filter and the owning process resolved from the kernel
//! connection tables. Verdicts stick until a TCP FIN or the UDP reset
//! timer returns the slot to unknown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::conntable::ConnTables;
use crate::filter::{AppFilter, IpFilter};
use crate::packet::{self, IpPacket, IpVersion};
use crate::timer::ResetScheduler;

/// Classification slot states.
pub mod state {
    pub const UNKNOWN: u8 = 0;
    pub const ALLOW: u8 = 1;
    pub const DIVERT: u8 = 2;
}

const TABLE_SLOTS: usize = 1 << 16;

/// One 65,536-slot verdict table, indexed by local port.
///
/// Slots are relaxed atomics: the receive loop and the reset scheduler
/// both store, and a stale `UNKNOWN` read only causes a re-classification.
pub struct PortTable {
    slots: Box<[AtomicU8]>,
}

impl PortTable {
    pub fn new() -> Self {
        let slots = (0..TABLE_SLOTS)
            .map(|_| AtomicU8::new(state::UNKNOWN))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn get(&self, port: u16) -> u8 {
        self.slots[port as usize].load(Ordering::Relaxed)
    }

    pub fn set(&self, port: u16, state: u8) {
        self.slots[port as usize].store(state, Ordering::Relaxed);
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Proto {
    Tcp,
    Udp,
}

/// The per-flow divert/allow decision engine.
pub struct FlowClassifier {
    tcp4: Arc<PortTable>,
    udp4: Arc<PortTable>,
    tcp6: Arc<PortTable>,
    udp6: Arc<PortTable>,
    ip_filter: Arc<IpFilter>,
    app_filter: Arc<AppFilter>,
    conntables: Arc<dyn ConnTables>,
    resets: ResetScheduler,
}

impl FlowClassifier {
    pub fn new(
        ip_filter: Arc<IpFilter>,
        app_filter: Arc<AppFilter>,
        conntables: Arc<dyn ConnTables>,
        resets: ResetScheduler,
    ) -> Self {
        Self {
            tcp4: Arc::new(PortTable::new()),
            udp4: Arc::new(PortTable::new()),
            tcp6: Arc::new(PortTable::new()),
            udp6: Arc::new(PortTable::new()),
            ip_filter,
            app_filter,
            conntables,
            resets,
        }
    }

    /// Verdict for one IPv4 packet. `true` diverts to the user stack,
    /// `false` re-injects unchanged.
    pub fn classify_v4(&self, pkt: &IpPacket<'_>) -> bool {
        match pkt.protocol() {
            packet::PROTO_TCP => self.classify_tcp(pkt, &self.tcp4),
            packet::PROTO_UDP => self.classify_udp(pkt, &self.udp4),
            _ => self.ip_filter.lookup(pkt.dst_ip()),
        }
    }

    /// Verdict for one IPv6 packet.
    pub fn classify_v6(&self, pkt: &IpPacket<'_>) -> bool {
        match pkt.protocol() {
            packet::PROTO_TCP => self.classify_tcp(pkt, &self.tcp6),
            packet::PROTO_UDP => self.classify_udp(pkt, &self.udp6),
            _ => self.ip_filter.lookup(pkt.dst_ip()),
        }
    }

    fn classify_tcp(&self, pkt: &IpPacket<'_>, table: &Arc<PortTable>) -> bool {
        let Some(port) = pkt.src_port() else {
            // Not enough transport bytes to classify. Pass through
            // without latching a verdict.
            return false;
        };

        match table.get(port) {
            state::UNKNOWN => {
                let Some(flags) = pkt.tcp_flags() else {
                    return false;
                };
                // The decision latches at the SYN; anything else in this
                // state belongs to a flow whose window was missed.
                if flags & packet::TCP_SYN != packet::TCP_SYN {
                    table.set(port, state::ALLOW);
                    return false;
                }
                if self.ip_filter.lookup(pkt.dst_ip()) {
                    table.set(port, state::DIVERT);
                    return true;
                }
                if self.owner_match(pkt, port, Proto::Tcp) {
                    table.set(port, state::DIVERT);
                    return true;
                }
                table.set(port, state::ALLOW);
                false
            }
            state::ALLOW => {
                if self.is_fin(pkt) {
                    table.set(port, state::UNKNOWN);
                }
                false
            }
            _ => {
                if self.is_fin(pkt) {
                    table.set(port, state::UNKNOWN);
                }
                true
            }
        }
    }

    fn classify_udp(&self, pkt: &IpPacket<'_>, table: &Arc<PortTable>) -> bool {
        let Some(port) = pkt.src_port() else {
            return false;
        };

        match table.get(port) {
            state::UNKNOWN => {
                if self.ip_filter.lookup(pkt.dst_ip()) {
                    table.set(port, state::DIVERT);
                    self.resets.schedule(table, port);
                    return true;
                }
                if self.owner_match(pkt, port, Proto::Udp) {
                    table.set(port, state::DIVERT);
                    self.resets.schedule(table, port);
                    return true;
                }
                // DNS always goes to the user stack and is never latched,
                // so every query is re-evaluated.
                if pkt.dst_port() == Some(packet::DNS_PORT) {
                    return true;
                }
                table.set(port, state::ALLOW);
                self.resets.schedule(table, port);
                false
            }
            state::ALLOW => false,
            _ => true,
        }
    }

    fn is_fin(&self, pkt: &IpPacket<'_>) -> bool {
        pkt.tcp_flags()
            .is_some_and(|flags| flags & packet::TCP_FIN == packet::TCP_FIN)
    }

    /// Scans the matching connection-table snapshot for the packet's
    /// local endpoint and checks the owning pid against the app filter.
    fn owner_match(&self, pkt: &IpPacket<'_>, port: u16, proto: Proto) -> bool {
        let records = match (pkt.version(), proto) {
            (IpVersion::V4, Proto::Tcp) => self.conntables.tcp_v4(),
            (IpVersion::V4, Proto::Udp) => self.conntables.udp_v4(),
            (IpVersion::V6, Proto::Tcp) => self.conntables.tcp_v6(),
            (IpVersion::V6, Proto::Udp) => self.conntables.udp_v6(),
        };
        let src = pkt.src_ip();
        // UDP sockets are commonly bound to the wildcard address.
        let wildcard = matches!(proto, Proto::Udp);

        for record in &records {
            if record.local_port != port {
                continue;
            }
            if record.local_addr == src || (wildcard && record.local_addr.is_unspecified()) {
                return self.app_filter.lookup(record.pid);
            }
        }
        false
    }
}
