//! Error types for the diversion core.

use thiserror::Error;

use crate::packet::PacketError;

/// Errors surfaced by the diversion device and its pipelines.
#[derive(Debug, Error)]
pub enum DivertError {
    /// The outbound-interface probe failed before a packet was sniffed.
    #[error("interface probe failed: {0}")]
    InterfaceProbe(String),

    /// Opening the diversion handle failed.
    #[error("open diversion handle: {0}")]
    DriverOpen(String),

    /// Tuning a queue parameter after open failed. The handle is released.
    #[error("set driver parameter {param}: {message}")]
    DriverParam {
        param: &'static str,
        message: String,
    },

    /// Shutting the diversion handle down failed.
    #[error("shutdown diversion handle: {0}")]
    DriverShutdown(String),

    /// A batched receive failed for a reason other than the no-data sentinel.
    #[error("batched receive: {0}")]
    Recv(String),

    /// The driver reported no queued data. Expected while shutting down.
    #[error("no data queued on diversion handle")]
    NoData,

    /// A batched send failed. Host-unreachable sends are discarded before
    /// this is ever constructed.
    #[error("batched send: {0}")]
    Send(String),

    /// A packet in the current batch could not be interpreted; the batch
    /// walk stops.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),

    /// The upstream sink rejected a diverted packet.
    #[error("upstream sink: {0}")]
    Sink(#[from] std::io::Error),

    /// `write` was called after the device shut down.
    #[error("device is closed")]
    WriteClosed,

    /// Packet diversion is only available on Windows.
    #[error("packet diversion requires Windows")]
    Unsupported,
}

impl DivertError {
    /// True for the driver sentinel that signals an empty queue rather
    /// than a fault.
    pub fn is_no_data(&self) -> bool {
        matches!(self, DivertError::NoData)
    }
}

/// Result type for diversion operations.
pub type DivertResult<T> = Result<T, DivertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_data_is_recognized() {
        assert!(DivertError::NoData.is_no_data());
        assert!(!DivertError::WriteClosed.is_no_data());
        assert!(!DivertError::Recv("boom".into()).is_no_data());
    }

    #[test]
    fn test_packet_errors_convert() {
        let err: DivertError = PacketError::BadVersion(0xf).into();
        assert!(matches!(err, DivertError::MalformedPacket(_)));
    }
}
