//! Upstream write coalescing.
//!
//! Packets written by the user stack arrive one at a time; handing each
//! one to the driver individually would waste a syscall per packet. A
//! dedicated thread collects them into a driver-sized batch and flushes
//! on batch-full or on a millisecond tick, bounding added latency.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, TryRecvError};
use tracing::{debug, error};

use crate::device::DivertStats;
use crate::driver::{
    PacketMeta, BATCH_BUFFER_LEN, BATCH_CAPACITY, FLAG_IMPOSTOR, FLAG_LOOPBACK, FLAG_SNIFFED,
};
use crate::error::DivertResult;

/// Flush cadence when a batch is only partially full.
const TICK: Duration = Duration::from_millis(1);

/// Destination of a coalesced batch. The driver handle is the production
/// implementation; tests substitute a collecting sink.
pub trait BatchSink: Send + Sync {
    fn send_batch(&self, buf: &[u8], metas: &[PacketMeta]) -> DivertResult<()>;
}

type Never = std::convert::Infallible;

/// Spawns the coalescer thread. It drains `packets` until the channel or
/// the shutdown signal closes.
pub(crate) fn spawn<S: BatchSink + 'static>(
    sink: Arc<S>,
    template: PacketMeta,
    packets: Receiver<Vec<u8>>,
    shutdown: Receiver<Never>,
    stats: Arc<DivertStats>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("shunt-coalesce".into())
        .spawn(move || run(sink, template, packets, shutdown, stats))
        .expect("spawn write coalescer thread")
}

fn run<S: BatchSink>(
    sink: Arc<S>,
    template: PacketMeta,
    packets: Receiver<Vec<u8>>,
    shutdown: Receiver<Never>,
    stats: Arc<DivertStats>,
) {
    // Every outgoing packet is injected as an out-of-band copy.
    let outgoing = PacketMeta {
        flags: template.flags | FLAG_SNIFFED | FLAG_IMPOSTOR | FLAG_LOOPBACK,
        ..template
    };
    let metas = vec![outgoing; BATCH_CAPACITY];
    let mut buf = vec![0u8; BATCH_BUFFER_LEN];
    let ticker = crossbeam_channel::tick(TICK);

    // Bytes and packets accumulated in the current batch.
    let mut nbytes = 0usize;
    let mut count = 0usize;

    let flush = |nbytes: &mut usize, count: &mut usize, buf: &[u8]| -> bool {
        match sink.send_batch(&buf[..*nbytes], &metas[..*count]) {
            Ok(()) => {
                stats.add_flushed(*count as u64);
                *nbytes = 0;
                *count = 0;
                true
            }
            Err(e) => {
                // A failed flush during shutdown is the handle closing
                // under us, not a fault worth reporting.
                if !matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                    error!(error = %e, "write coalescer flush failed, stopping");
                }
                false
            }
        }
    };

    loop {
        select! {
            recv(ticker) -> _ => {
                if count > 0 && !flush(&mut nbytes, &mut count, &buf) {
                    return;
                }
            }
            recv(packets) -> msg => {
                let packet = match msg {
                    Ok(packet) => packet,
                    Err(_) => {
                        // Writer side is gone; push out what is pending.
                        if count > 0 {
                            flush(&mut nbytes, &mut count, &buf);
                        }
                        return;
                    }
                };
                if packet.is_empty() {
                    continue;
                }
                if packet.len() > buf.len() {
                    debug!(len = packet.len(), "dropping oversized upstream packet");
                    continue;
                }
                if nbytes + packet.len() > buf.len()
                    && !flush(&mut nbytes, &mut count, &buf)
                {
                    return;
                }

                buf[nbytes..nbytes + packet.len()].copy_from_slice(&packet);
                nbytes += packet.len();
                count += 1;

                if count == BATCH_CAPACITY && !flush(&mut nbytes, &mut count, &buf) {
                    return;
                }
            }
            recv(shutdown) -> _ => return,
        }
    }
}
