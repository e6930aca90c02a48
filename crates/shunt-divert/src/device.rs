//! The diversion device.
//!
//! One `Device` owns the driver handle, the filters, the classifier and
//! the background threads for the lifetime of the process. Diverted
//! packets flow out through [`Device::write_to`]; the user stack pushes
//! packets back down through [`Device::write`].

use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::coalesce;
use crate::conntable::SystemConnTables;
use crate::driver::{DriverHandle, PacketMeta, BATCH_BUFFER_LEN};
use crate::error::{DivertError, DivertResult};
use crate::filter::{AppFilter, IpFilter};
use crate::flow::FlowClassifier;
use crate::pipeline;
use crate::probe;
use crate::timer::ResetScheduler;

/// Options recognized by the diversion core. In-process only; there is
/// no environment or on-disk state at this layer.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Driver filter expression. The probed interface predicate is
    /// prepended automatically.
    pub filter: String,

    /// Process ids whose flows are diverted.
    pub divert_pids: Vec<u32>,

    /// Destination networks whose flows are diverted.
    pub divert_networks: Vec<IpNet>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            filter: "outbound and (ip or ipv6)".to_string(),
            divert_pids: Vec::new(),
            divert_networks: Vec::new(),
        }
    }
}

/// Relaxed counters kept by the pipelines.
#[derive(Debug, Default)]
pub struct DivertStats {
    received: AtomicU64,
    diverted: AtomicU64,
    passed: AtomicU64,
    flushed: AtomicU64,
}

/// Point-in-time copy of [`DivertStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets drained from the driver.
    pub received: u64,
    /// Packets handed to the user stack.
    pub diverted: u64,
    /// Packets re-injected unchanged.
    pub passed: u64,
    /// Upstream packets flushed back to the driver.
    pub flushed: u64,
}

impl DivertStats {
    pub(crate) fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_diverted(&self, n: u64) {
        self.diverted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_passed(&self, n: u64) {
        self.passed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_flushed(&self, n: u64) {
        self.flushed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            diverted: self.diverted.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

/// The root object of the diversion core.
pub struct Device {
    driver: Arc<DriverHandle>,
    ip_filter: Arc<IpFilter>,
    app_filter: Arc<AppFilter>,
    classifier: FlowClassifier,
    stats: Arc<DivertStats>,
    write_tx: Sender<Vec<u8>>,
    shutdown_rx: Receiver<Infallible>,
    shutdown_tx: Mutex<Option<Sender<Infallible>>>,
    coalescer: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Probes the outbound interface, opens the driver handle with the
    /// interface predicate prepended to `config.filter`, seeds the
    /// filters and starts the write coalescer.
    pub fn new(config: DeviceConfig) -> DivertResult<Self> {
        let (if_idx, sub_if_idx) = probe::interface_index()?;
        let filter = format!("ifIdx = {if_idx} and {}", config.filter);
        let driver = Arc::new(DriverHandle::open(&filter)?);
        info!(if_idx, sub_if_idx, filter, "diversion handle open");

        let template = PacketMeta {
            flags: 0,
            interface_index: if_idx,
            sub_interface_index: sub_if_idx,
            outbound: true,
            ipv6: false,
        };

        let ip_filter = Arc::new(IpFilter::new());
        for net in &config.divert_networks {
            ip_filter.add(*net);
        }
        let app_filter = Arc::new(AppFilter::new());
        for pid in &config.divert_pids {
            app_filter.add(*pid);
        }

        let classifier = FlowClassifier::new(
            Arc::clone(&ip_filter),
            Arc::clone(&app_filter),
            Arc::new(SystemConnTables),
            ResetScheduler::new(),
        );

        let stats = Arc::new(DivertStats::default());
        let (shutdown_tx, shutdown_rx) = bounded::<Infallible>(0);
        let (write_tx, write_rx) = bounded::<Vec<u8>>(1);
        let coalescer = coalesce::spawn(
            Arc::clone(&driver),
            template,
            write_rx,
            shutdown_rx.clone(),
            Arc::clone(&stats),
        );

        Ok(Self {
            driver,
            ip_filter,
            app_filter,
            classifier,
            stats,
            write_tx,
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            coalescer: Mutex::new(Some(coalescer)),
        })
    }

    pub fn ip_filter(&self) -> &IpFilter {
        &self.ip_filter
    }

    pub fn app_filter(&self) -> &AppFilter {
        &self.app_filter
    }

    pub fn stats(&self) -> &DivertStats {
        &self.stats
    }

    /// Runs the receive pipeline, delivering diverted packets to
    /// `writer` one packet per call and re-injecting every received
    /// packet. Blocks until shutdown or a fatal error; returns the
    /// number of bytes drained from the driver.
    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> DivertResult<u64> {
        let mut buf = vec![0u8; BATCH_BUFFER_LEN];
        let mut total = 0u64;

        loop {
            let (nbytes, mut metas) = match self.driver.recv_batch(&mut buf) {
                Ok(batch) => batch,
                Err(DivertError::NoData) => {
                    if self.is_closed() {
                        return Ok(total);
                    }
                    continue;
                }
                Err(e) => {
                    if self.is_closed() {
                        return Ok(total);
                    }
                    return Err(e);
                }
            };
            if nbytes == 0 || metas.is_empty() {
                continue;
            }
            total += nbytes as u64;

            if let Err(e) = pipeline::process_batch(
                &mut buf[..nbytes],
                &mut metas,
                &self.classifier,
                &self.stats,
                writer,
            ) {
                if self.is_closed() {
                    return Ok(total);
                }
                return Err(e);
            }

            if let Err(e) = self.driver.send_batch(&buf[..nbytes], &metas) {
                if self.is_closed() {
                    return Ok(total);
                }
                return Err(e);
            }
        }
    }

    /// Queues one IP packet from the user stack for coalesced
    /// re-injection. Returns `WriteClosed` once the device is shut down.
    pub fn write(&self, packet: &[u8]) -> DivertResult<usize> {
        if self.is_closed() {
            return Err(DivertError::WriteClosed);
        }

        select! {
            send(self.write_tx, packet.to_vec()) -> res => {
                res.map_err(|_| DivertError::WriteClosed)?;
            }
            recv(self.shutdown_rx) -> _ => return Err(DivertError::WriteClosed),
        }
        Ok(packet.len())
    }

    /// Shuts the device down. The first call broadcasts the shutdown
    /// signal, closes the IP filter, unblocks the receive pipeline and
    /// joins the coalescer; later calls are no-ops.
    pub fn close(&self) -> DivertResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.lock().take() else {
            return Ok(());
        };
        info!("closing diversion device");
        drop(shutdown_tx);

        self.ip_filter.close();

        let result = self.driver.shutdown();
        if let Err(ref e) = result {
            warn!(error = %e, "driver shutdown reported an error");
        }

        if let Some(handle) = self.coalescer.lock().take() {
            let _ = handle.join();
        }
        result
    }

    fn is_closed(&self) -> bool {
        matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert_eq!(config.filter, "outbound and (ip or ipv6)");
        assert!(config.divert_pids.is_empty());
        assert!(config.divert_networks.is_empty());
    }

    #[test]
    fn test_stats_accumulate_and_snapshot() {
        let stats = DivertStats::default();
        stats.add_received(3);
        stats.add_diverted(1);
        stats.add_passed(2);
        stats.add_flushed(5);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 3);
        assert_eq!(snap.diverted, 1);
        assert_eq!(snap.passed, 2);
        assert_eq!(snap.flushed, 5);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_construction_is_windows_only() {
        assert!(matches!(
            Device::new(DeviceConfig::default()),
            Err(DivertError::Unsupported)
        ));
    }
}
