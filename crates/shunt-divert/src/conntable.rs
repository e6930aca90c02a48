//! Snapshots of the kernel's connection tables.
//!
//! The classifier resolves the process owning a flow by scanning one of
//! four snapshots (TCP/UDP, v4/v6) for the packet's local port. Ports in
//! the kernel tables are stored in network byte order; records returned
//! here carry host-order ports so both sides of the comparison are true
//! port values.

use std::net::IpAddr;

/// One row of a connection-table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRecord {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub pid: u32,
}

/// Source of connection-table snapshots.
///
/// A failed snapshot is reported as an empty table; the classifier then
/// finds no owner and falls through to the allow verdict.
pub trait ConnTables: Send + Sync {
    fn tcp_v4(&self) -> Vec<ConnRecord>;
    fn udp_v4(&self) -> Vec<ConnRecord>;
    fn tcp_v6(&self) -> Vec<ConnRecord>;
    fn udp_v6(&self) -> Vec<ConnRecord>;
}

/// Converts a table port dword to a host-order port. The dword holds the
/// 16-bit port in network byte order in its low bytes.
pub fn table_port(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

/// Snapshots backed by the operating system's extended tables.
pub struct SystemConnTables;

#[cfg(windows)]
impl ConnTables for SystemConnTables {
    fn tcp_v4(&self) -> Vec<ConnRecord> {
        sys::tcp_v4()
    }

    fn udp_v4(&self) -> Vec<ConnRecord> {
        sys::udp_v4()
    }

    fn tcp_v6(&self) -> Vec<ConnRecord> {
        sys::tcp_v6()
    }

    fn udp_v6(&self) -> Vec<ConnRecord> {
        sys::udp_v6()
    }
}

#[cfg(not(windows))]
impl ConnTables for SystemConnTables {
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

#[cfg(windows)]
mod sys {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, GetExtendedUdpTable, MIB_TCP6TABLE_OWNER_PID,
        MIB_TCPTABLE_OWNER_PID, MIB_UDP6TABLE_OWNER_PID, MIB_UDPTABLE_OWNER_PID,
        TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID,
    };
    use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

    use super::{table_port, ConnRecord};

    enum Table {
        Tcp,
        Udp,
    }

    /// Two-call size-then-fetch snapshot of one extended table. Returns
    /// `None` on any failure.
    fn snapshot(family: u32, table: Table) -> Option<Vec<u8>> {
        unsafe {
            let mut size = 0u32;
            let _ = match table {
                Table::Tcp => {
                    GetExtendedTcpTable(None, &mut size, false, family, TCP_TABLE_OWNER_PID_ALL, 0)
                }
                Table::Udp => {
                    GetExtendedUdpTable(None, &mut size, false, family, UDP_TABLE_OWNER_PID, 0)
                }
            };
            if size == 0 {
                return None;
            }

            let mut buffer = vec![0u8; size as usize];
            let result = match table {
                Table::Tcp => GetExtendedTcpTable(
                    Some(buffer.as_mut_ptr() as *mut _),
                    &mut size,
                    false,
                    family,
                    TCP_TABLE_OWNER_PID_ALL,
                    0,
                ),
                Table::Udp => GetExtendedUdpTable(
                    Some(buffer.as_mut_ptr() as *mut _),
                    &mut size,
                    false,
                    family,
                    UDP_TABLE_OWNER_PID,
                    0,
                ),
            };
            if result.is_err() {
                return None;
            }
            Some(buffer)
        }
    }

    pub(super) fn tcp_v4() -> Vec<ConnRecord> {
        let Some(buffer) = snapshot(AF_INET.0 as u32, Table::Tcp) else {
            return Vec::new();
        };
        unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
            let rows =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            rows.iter()
                .map(|row| ConnRecord {
                    local_addr: Ipv4Addr::from(row.dwLocalAddr.to_ne_bytes()).into(),
                    local_port: table_port(row.dwLocalPort),
                    pid: row.dwOwningPid,
                })
                .collect()
        }
    }

    pub(super) fn udp_v4() -> Vec<ConnRecord> {
        let Some(buffer) = snapshot(AF_INET.0 as u32, Table::Udp) else {
            return Vec::new();
        };
        unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_UDPTABLE_OWNER_PID);
            let rows =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            rows.iter()
                .map(|row| ConnRecord {
                    local_addr: Ipv4Addr::from(row.dwLocalAddr.to_ne_bytes()).into(),
                    local_port: table_port(row.dwLocalPort),
                    pid: row.dwOwningPid,
                })
                .collect()
        }
    }

    pub(super) fn tcp_v6() -> Vec<ConnRecord> {
        let Some(buffer) = snapshot(AF_INET6.0 as u32, Table::Tcp) else {
            return Vec::new();
        };
        unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID);
            let rows =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            rows.iter()
                .map(|row| ConnRecord {
                    local_addr: Ipv6Addr::from(row.ucLocalAddr).into(),
                    local_port: table_port(row.dwLocalPort),
                    pid: row.dwOwningPid,
                })
                .collect()
        }
    }

    pub(super) fn udp_v6() -> Vec<ConnRecord> {
        let Some(buffer) = snapshot(AF_INET6.0 as u32, Table::Udp) else {
            return Vec::new();
        };
        unsafe {
            let table = &*(buffer.as_ptr() as *const MIB_UDP6TABLE_OWNER_PID);
            let rows =
                std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize);
            rows.iter()
                .map(|row| ConnRecord {
                    local_addr: Ipv6Addr::from(row.ucLocalAddr).into(),
                    local_port: table_port(row.dwLocalPort),
                    pid: row.dwOwningPid,
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ports_are_byte_swapped() {
        // Port 443 (0x01bb) sits in the dword low bytes in network order,
        // which reads back as 0xbb01 on a little-endian host.
        assert_eq!(table_port(0x0000_bb01), 443);
        assert_eq!(table_port(0x0000_3500), 53);
        assert_eq!(table_port(0), 0);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_stub_tables_are_empty() {
        let tables = SystemConnTables;
        assert!(tables.tcp_v4().is_empty());
        assert!(tables.udp_v4().is_empty());
        assert!(tables.tcp_v6().is_empty());
        assert!(tables.udp_v6().is_empty());
    }
}
