//! Batch walk of received packets.
//!
//! The walk mutates the receive buffer and metadata in place so the
//! whole batch can be re-injected as received: diverted packets are
//! copied to the upstream sink, marked as out-of-band copies in their
//! metadata, and have their TTL zeroed so a leaked copy dies at the
//! first hop. Pass-through packets are untouched.

use std::io;

use tracing::trace;

use crate::device::DivertStats;
use crate::driver::{PacketMeta, FLAG_FRAGMENT, FLAG_IMPOSTOR, FLAG_LOOPBACK, FLAG_SNIFFED};
use crate::error::DivertResult;
use crate::flow::FlowClassifier;
use crate::packet::{self, IpPacket, IpVersion, PacketError};

/// Flag bits OR-ed into a diverted packet's metadata before re-injection.
pub const DIVERT_FLAGS: u8 = FLAG_SNIFFED | FLAG_IMPOSTOR | FLAG_LOOPBACK | FLAG_FRAGMENT;

/// Classifies every packet of one received batch.
///
/// `buf` holds exactly the received bytes and `metas` one record per
/// packet. Returns the number of bytes delivered to the upstream sink.
/// A packet that cannot be interpreted aborts the walk with
/// `MalformedPacket`.
pub(crate) fn process_batch<W: io::Write>(
    buf: &mut [u8],
    metas: &mut [PacketMeta],
    classifier: &FlowClassifier,
    stats: &DivertStats,
    sink: &mut W,
) -> DivertResult<usize> {
    let mut offset = 0usize;
    let mut delivered = 0usize;

    for meta in metas.iter_mut() {
        let (len, verdict) = {
            let pkt = IpPacket::new(&buf[offset..])?;
            let len = pkt.total_len();
            if len < pkt.header_len() || len > buf.len() - offset {
                return Err(PacketError::Truncated {
                    have: buf.len() - offset,
                    need: len,
                }
                .into());
            }
            let verdict = match pkt.version() {
                IpVersion::V4 => classifier.classify_v4(&pkt),
                IpVersion::V6 => classifier.classify_v6(&pkt),
            };
            (len, verdict)
        };

        stats.add_received(1);
        if verdict {
            sink.write_all(&buf[offset..offset + len])?;
            meta.flags |= DIVERT_FLAGS;
            packet::zero_ttl(&mut buf[offset..offset + len]);
            stats.add_diverted(1);
            delivered += len;
            trace!(offset, len, "packet diverted to user stack");
        } else {
            stats.add_passed(1);
        }
        offset += len;
    }

    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::conntable::{ConnRecord, ConnTables};
    use crate::filter::{AppFilter, IpFilter};
    use crate::packet::{PROTO_TCP, PROTO_UDP, TCP_ACK, TCP_SYN};
    use crate::timer::ResetScheduler;

    struct EmptyTables;

    impl ConnTables for EmptyTables {
        fn tcp_v4(&self) -> Vec<ConnRecord> {
            Vec::new()
        }

        fn udp_v4(&self) -> Vec<ConnRecord> {
            Vec::new()
        }

        fn tcp_v6(&self) -> Vec<ConnRecord> {
            Vec::new()
        }

        fn udp_v6(&self) -> Vec<ConnRecord> {
            Vec::new()
        }
    }

    fn classifier() -> FlowClassifier {
        let ip_filter = Arc::new(IpFilter::new());
        ip_filter.add_addr("8.8.8.8".parse().unwrap());
        FlowClassifier::new(
            ip_filter,
            Arc::new(AppFilter::new()),
            Arc::new(EmptyTables),
            ResetScheduler::with_delay(Duration::from_secs(60)),
        )
    }

    fn v4_tcp(dst: [u8; 4], sport: u16, flags: u8, len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        p[8] = 64;
        p[9] = PROTO_TCP;
        p[12..16].copy_from_slice(&[10, 0, 0, 2]);
        p[16..20].copy_from_slice(&dst);
        p[20..22].copy_from_slice(&sport.to_be_bytes());
        p[22..24].copy_from_slice(&443u16.to_be_bytes());
        p[33] = flags;
        p
    }

    fn meta() -> PacketMeta {
        PacketMeta {
            flags: 0,
            interface_index: 4,
            sub_interface_index: 0,
            outbound: true,
            ipv6: false,
        }
    }

    #[test]
    fn test_diverted_packets_reach_the_sink_marked_and_neutered() {
        let divert = v4_tcp([8, 8, 8, 8], 55001, TCP_SYN, 48);
        let pass = v4_tcp([1, 1, 1, 1], 55002, TCP_ACK, 52);

        let mut buf = Vec::new();
        buf.extend_from_slice(&divert);
        buf.extend_from_slice(&pass);
        let original = buf.clone();
        let mut metas = vec![meta(), meta()];

        let c = classifier();
        let stats = DivertStats::default();
        let mut sink = Vec::new();
        let delivered =
            process_batch(&mut buf, &mut metas, &c, &stats, &mut sink).unwrap();

        // Exactly the first packet's bytes, nothing around them.
        assert_eq!(delivered, divert.len());
        assert_eq!(sink, divert);

        // Metadata count is preserved and only the diverted slot is
        // marked.
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].flags, DIVERT_FLAGS);
        assert_eq!(metas[1].flags, 0);

        // The diverted packet's TTL is zeroed in the batch buffer; the
        // pass-through packet is byte-identical.
        assert_eq!(buf[8], 0);
        assert_eq!(&buf[divert.len()..], &original[divert.len()..]);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.diverted, 1);
        assert_eq!(snap.passed, 1);
    }

    #[test]
    fn test_v6_divert_zeroes_the_hop_limit() {
        let mut p = vec![0u8; 60];
        p[0] = 0x60;
        p[4..6].copy_from_slice(&20u16.to_be_bytes());
        p[6] = PROTO_UDP;
        p[7] = 64;
        p[8] = 0xfd;
        p[23] = 1;
        p[24] = 0x20;
        p[25] = 0x01;
        p[39] = 1;
        p[40..42].copy_from_slice(&55005u16.to_be_bytes());
        p[42..44].copy_from_slice(&53u16.to_be_bytes());

        let mut buf = p.clone();
        let mut metas = vec![PacketMeta {
            ipv6: true,
            ..meta()
        }];
        let c = classifier();
        let stats = DivertStats::default();
        let mut sink = Vec::new();
        process_batch(&mut buf, &mut metas, &c, &stats, &mut sink).unwrap();

        // DNS rule diverts; hop limit is zeroed only in the batch copy
        // bound for re-injection, after the sink saw the original.
        assert_eq!(sink, p);
        assert_eq!(buf[7], 0);
        assert_eq!(metas[0].flags, DIVERT_FLAGS);
    }

    #[test]
    fn test_bad_version_aborts_the_batch() {
        let mut buf = vec![0x00u8; 40];
        let mut metas = vec![meta()];
        let c = classifier();
        let stats = DivertStats::default();
        let mut sink = Vec::new();

        let err = process_batch(&mut buf, &mut metas, &c, &stats, &mut sink).unwrap_err();
        assert!(matches!(err, crate::error::DivertError::MalformedPacket(_)));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_claimed_length_beyond_buffer_aborts() {
        let mut packet = v4_tcp([1, 1, 1, 1], 55002, TCP_ACK, 40);
        packet[2..4].copy_from_slice(&200u16.to_be_bytes());
        let mut metas = vec![meta()];
        let c = classifier();
        let stats = DivertStats::default();
        let mut sink = Vec::new();

        let err = process_batch(&mut packet, &mut metas, &c, &stats, &mut sink).unwrap_err();
        assert!(matches!(err, crate::error::DivertError::MalformedPacket(_)));
    }

    #[test]
    fn test_pass_through_batch_is_untouched() {
        let a = v4_tcp([1, 1, 1, 1], 55002, TCP_ACK, 44);
        let b = v4_tcp([2, 2, 2, 2], 55003, TCP_ACK, 40);
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        let original = buf.clone();
        let mut metas = vec![meta(), meta()];

        let c = classifier();
        let stats = DivertStats::default();
        let mut sink = Vec::new();
        let delivered =
            process_batch(&mut buf, &mut metas, &c, &stats, &mut sink).unwrap();

        assert_eq!(delivered, 0);
        assert!(sink.is_empty());
        assert_eq!(buf, original);
        assert!(metas.iter().all(|m| m.flags == 0));
    }
}
