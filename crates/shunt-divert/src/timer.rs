//! Scheduled classification-slot resets.
//!
//! UDP verdicts hold for sixty seconds and then fall back to unknown. A
//! single timer thread owns a deadline heap and performs the relaxed slot
//! stores; the classifier only enqueues. Overlapping resets for the same
//! slot are allowed, the last store wins.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::flow::{state, PortTable};

/// Default hold time for a UDP classification slot.
pub const UDP_RESET_DELAY: Duration = Duration::from_secs(60);

struct Job {
    at: Instant,
    seq: u64,
    table: Arc<PortTable>,
    port: u16,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest deadline sits on top of the max-heap.
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Handle for scheduling one-shot slot resets.
pub struct ResetScheduler {
    tx: Sender<Job>,
    delay: Duration,
    seq: std::sync::atomic::AtomicU64,
}

impl ResetScheduler {
    pub fn new() -> Self {
        Self::with_delay(UDP_RESET_DELAY)
    }

    /// Scheduler with a custom hold time. Tests use short delays.
    pub fn with_delay(delay: Duration) -> Self {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new()
            .name("shunt-reset".into())
            .spawn(move || run(rx))
            .expect("spawn reset scheduler thread");
        Self {
            tx,
            delay,
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Schedules `table[port] := UNKNOWN` once, after the configured delay.
    pub fn schedule(&self, table: &Arc<PortTable>, port: u16) {
        let job = Job {
            at: Instant::now() + self.delay,
            seq: self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            table: Arc::clone(table),
            port,
        };
        let _ = self.tx.send(job);
    }
}

impl Default for ResetScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn run(rx: Receiver<Job>) {
    let mut heap: BinaryHeap<Job> = BinaryHeap::new();
    let mut disconnected = false;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|job| job.at <= now) {
            if let Some(job) = heap.pop() {
                job.table.set(job.port, state::UNKNOWN);
            }
        }

        match heap.peek().map(|job| job.at) {
            None if disconnected => return,
            None => match rx.recv() {
                Ok(job) => heap.push(job),
                Err(_) => return,
            },
            Some(at) if disconnected => {
                thread::sleep(at.saturating_duration_since(Instant::now()));
            }
            Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(job) => heap.push(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => disconnected = true,
            },
        }
    }
}
