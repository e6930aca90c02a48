//! Diversion-driver handle ownership and batched packet I/O.
//!
//! The handle is shared between the receive pipeline and the write
//! coalescer. Receives are only ever issued from one thread and take no
//! lock; every send goes through the handle's exclusive send lock.
//!
//! Only this module talks to the driver. The rest of the crate works on
//! plain buffers and [`PacketMeta`] records, so everything above this
//! seam builds and tests on any platform; off Windows the handle is a
//! stub that reports [`DivertError::Unsupported`].

use crate::error::{DivertError, DivertResult};

/// Packets per batched driver exchange.
pub const BATCH_CAPACITY: usize = 64;

/// Per-packet payload sizing for the reusable batch buffers.
pub const MTU: usize = 1500;

/// Byte length of one reusable batch buffer.
pub const BATCH_BUFFER_LEN: usize = BATCH_CAPACITY * MTU;

/// Address flag bits, following the driver's definitions.
pub const FLAG_SNIFFED: u8 = 0x80;
pub const FLAG_IMPOSTOR: u8 = 0x40;
pub const FLAG_LOOPBACK: u8 = 0x20;
pub const FLAG_FRAGMENT: u8 = 0x08;

/// Documented driver maxima for the three queue parameters.
const QUEUE_LENGTH_MAX: u64 = 16384;
const QUEUE_TIME_MAX: u64 = 16000;
const QUEUE_SIZE_MAX: u64 = 33554432;

/// Per-packet address metadata exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMeta {
    pub flags: u8,
    pub interface_index: u32,
    pub sub_interface_index: u32,
    pub outbound: bool,
    pub ipv6: bool,
}

pub use imp::DriverHandle;

#[cfg(windows)]
mod imp {
    use parking_lot::Mutex;
    use tracing::debug;
    use windivert::address::WinDivertAddress;
    use windivert::error::WinDivertError;
    use windivert::layer::NetworkLayer;
    use windivert::packet::WinDivertPacket;
    use windivert::prelude::*;
    use windivert::WinDivert;

    use super::*;
    use crate::packet::IpPacket;

    /// Owner of the network-layer diversion handle.
    pub struct DriverHandle {
        handle: WinDivert<NetworkLayer>,
        send_lock: Mutex<()>,
    }

    impl DriverHandle {
        /// Opens the handle at default priority and tunes the queue
        /// parameters to their maxima. A tuning failure releases the
        /// handle and names the failed parameter.
        pub fn open(filter: &str) -> DivertResult<Self> {
            debug!(filter, "opening diversion handle");
            let mut handle = WinDivert::network(filter, 0, WinDivertFlags::new())
                .map_err(|e| DivertError::DriverOpen(e.to_string()))?;

            let params = [
                (WinDivertParam::QueueLength, QUEUE_LENGTH_MAX, "queue length"),
                (WinDivertParam::QueueTime, QUEUE_TIME_MAX, "queue time"),
                (WinDivertParam::QueueSize, QUEUE_SIZE_MAX, "queue size"),
            ];
            for (param, max, name) in params {
                handle
                    .set_param(param, max)
                    .map_err(|e| DivertError::DriverParam {
                        param: name,
                        message: e.to_string(),
                    })?;
            }

            Ok(Self {
                handle,
                send_lock: Mutex::new(()),
            })
        }

        /// One batched receive into `buf`. Packets are packed
        /// contiguously from the start of the buffer; one metadata
        /// record is returned per packet, in receive order.
        pub fn recv_batch(&self, buf: &mut [u8]) -> DivertResult<(usize, Vec<PacketMeta>)> {
            let packets = self
                .handle
                .recv_ex(Some(buf), BATCH_CAPACITY as u8)
                .map_err(map_recv_err)?;

            let mut nbytes = 0usize;
            let mut metas = Vec::with_capacity(packets.len());
            for packet in &packets {
                nbytes += packet.data.len();
                metas.push(meta_from_address(&packet.address));
            }
            Ok((nbytes, metas))
        }

        /// One batched send of `metas.len()` packets packed in `buf`,
        /// serialized under the send lock. Host-unreachable results are
        /// discarded.
        pub fn send_batch(&self, buf: &[u8], metas: &[PacketMeta]) -> DivertResult<()> {
            let mut packets = Vec::with_capacity(metas.len());
            let mut offset = 0usize;
            for meta in metas {
                let view = IpPacket::new(&buf[offset..])?;
                let len = view.total_len();
                if len < view.header_len() || len > buf.len() - offset {
                    return Err(crate::packet::PacketError::Truncated {
                        have: buf.len() - offset,
                        need: len,
                    }
                    .into());
                }
                packets.push(WinDivertPacket {
                    address: address_from_meta(meta),
                    data: (&buf[offset..offset + len]).into(),
                });
                offset += len;
            }

            let _guard = self.send_lock.lock();
            match self.handle.send_ex(&packets) {
                Ok(_) => Ok(()),
                Err(e) if is_host_unreachable(&e) => Ok(()),
                Err(e) => Err(DivertError::Send(e.to_string())),
            }
        }

        /// Shuts both directions down, unblocking a pending receive.
        pub fn shutdown(&self) -> DivertResult<()> {
            self.handle
                .shutdown(WinDivertShutdownMode::Both)
                .map_err(|e| DivertError::DriverShutdown(e.to_string()))
        }
    }

    fn meta_from_address(addr: &WinDivertAddress<NetworkLayer>) -> PacketMeta {
        let mut flags = 0u8;
        if addr.sniffed() {
            flags |= FLAG_SNIFFED;
        }
        if addr.impostor() {
            flags |= FLAG_IMPOSTOR;
        }
        if addr.loopback() {
            flags |= FLAG_LOOPBACK;
        }
        PacketMeta {
            flags,
            interface_index: addr.interface_index(),
            sub_interface_index: addr.subinterface_index(),
            outbound: addr.outbound(),
            ipv6: addr.ipv6(),
        }
    }

    fn address_from_meta(meta: &PacketMeta) -> WinDivertAddress<NetworkLayer> {
        let mut addr = WinDivertAddress::<NetworkLayer>::default();
        addr.set_outbound(meta.outbound);
        addr.set_interface_index(meta.interface_index);
        addr.set_subinterface_index(meta.sub_interface_index);
        addr.set_sniffed(meta.flags & FLAG_SNIFFED != 0);
        addr.set_impostor(meta.flags & FLAG_IMPOSTOR != 0);
        addr.set_loopback(meta.flags & FLAG_LOOPBACK != 0);
        addr.set_ipv6(meta.ipv6);
        addr
    }

    fn map_recv_err(e: WinDivertError) -> DivertError {
        let text = format!("{e:?}");
        if text.contains("NoData") {
            DivertError::NoData
        } else {
            DivertError::Recv(e.to_string())
        }
    }

    fn is_host_unreachable(e: &WinDivertError) -> bool {
        format!("{e:?}").contains("HostUnreachable")
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;

    /// Stub handle for non-Windows builds. Construction fails at
    /// runtime, mirroring the Windows-only capture backends.
    pub struct DriverHandle;

    impl DriverHandle {
        pub fn open(_filter: &str) -> DivertResult<Self> {
            Err(DivertError::Unsupported)
        }

        pub fn recv_batch(&self, _buf: &mut [u8]) -> DivertResult<(usize, Vec<PacketMeta>)> {
            Err(DivertError::Unsupported)
        }

        pub fn send_batch(&self, _buf: &[u8], _metas: &[PacketMeta]) -> DivertResult<()> {
            Err(DivertError::Unsupported)
        }

        pub fn shutdown(&self) -> DivertResult<()> {
            Ok(())
        }
    }
}

impl crate::coalesce::BatchSink for DriverHandle {
    fn send_batch(&self, buf: &[u8], metas: &[PacketMeta]) -> DivertResult<()> {
        DriverHandle::send_batch(self, buf, metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divert_flag_bits_match_the_driver_layout() {
        assert_eq!(FLAG_SNIFFED, 0x80);
        assert_eq!(FLAG_IMPOSTOR, 0x40);
        assert_eq!(FLAG_LOOPBACK, 0x20);
        assert_eq!(FLAG_FRAGMENT, 0x08);
    }

    #[test]
    fn test_meta_defaults_are_inert() {
        let meta = PacketMeta::default();
        assert_eq!(meta.flags, 0);
        assert!(!meta.outbound);
        assert!(!meta.ipv6);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_stub_handle_reports_unsupported() {
        assert!(matches!(
            DriverHandle::open("outbound"),
            Err(DivertError::Unsupported)
        ));
    }
}
