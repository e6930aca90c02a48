//! Outbound-interface discovery.
//!
//! The driver needs the interface and sub-interface indices of the
//! default route before the real handle opens. A sniff-only handle
//! watches for a DNS dial the probe itself induces and lifts both
//! indices from the first packet's address metadata.

#[cfg(windows)]
pub use self::windows::interface_index;

#[cfg(not(windows))]
pub use self::stub::interface_index;

#[cfg(windows)]
mod windows {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};
    use std::thread;
    use std::time::Duration;

    use tracing::debug;
    use windivert::prelude::*;
    use windivert::WinDivert;

    use crate::driver::MTU;
    use crate::error::{DivertError, DivertResult};

    /// Sniffs outbound DNS dials to two well-known anchors.
    const PROBE_FILTER: &str = "not loopback and outbound and \
        (ip.DstAddr = 8.8.8.8 or ipv6.DstAddr = 2001:4860:4860::8888) and tcp.DstPort = 53";

    const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

    /// Resolves `(interface_index, sub_interface_index)` for the
    /// outbound route.
    pub fn interface_index() -> DivertResult<(u32, u32)> {
        let handle = WinDivert::network(PROBE_FILTER, 0, WinDivertFlags::new().set_sniff())
            .map_err(|e| DivertError::InterfaceProbe(format!("open sniff handle: {e}")))?;

        let anchors: [SocketAddr; 2] = [
            SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53).into(),
            SocketAddrV6::new(
                Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888),
                53,
                0,
                0,
            )
            .into(),
        ];

        // Fire-and-forget dials; only the sniffed packet matters, so a
        // refused or unreachable anchor is fine.
        let dials: Vec<_> = anchors
            .into_iter()
            .map(|anchor| {
                thread::spawn(move || {
                    if let Ok(conn) = TcpStream::connect_timeout(&anchor, DIAL_TIMEOUT) {
                        drop(conn);
                    }
                })
            })
            .collect();

        let mut buf = vec![0u8; MTU];
        let (if_idx, sub_if_idx) = {
            let packet = handle
                .recv(Some(&mut buf))
                .map_err(|e| DivertError::InterfaceProbe(format!("sniff probe packet: {e}")))?;
            (
                packet.address.interface_index(),
                packet.address.subinterface_index(),
            )
        };

        handle
            .shutdown(WinDivertShutdownMode::Both)
            .map_err(|e| DivertError::InterfaceProbe(format!("shutdown sniff handle: {e}")))?;

        for dial in dials {
            let _ = dial.join();
        }

        debug!(if_idx, sub_if_idx, "resolved outbound interface");
        Ok((if_idx, sub_if_idx))
    }
}

#[cfg(not(windows))]
mod stub {
    use crate::error::{DivertError, DivertResult};

    pub fn interface_index() -> DivertResult<(u32, u32)> {
        Err(DivertError::Unsupported)
    }
}
