//! Boundary to the raw USB transport.
//!
//! The driver core never touches an endpoint itself: bulk transfers and
//! device enumeration live behind [`CcidPort`]. The trait mirrors the four
//! primitives the core consumes: a bulk write, a bulk read matched against a
//! sequence number, and the interrupt pipe for slot change notifications.

use crate::error::IfdError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single port operation.
///
/// `NoSuchDevice` must be reported when the reader disappeared (unplug,
/// suspend): the driver surfaces it as-is and never retries. `CommNak` is a
/// transient negative acknowledge seen on some serial readers right after
/// startup.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("no such device")]
    NoSuchDevice,
    #[error("negative acknowledge from the reader")]
    CommNak,
    #[error("transport failure")]
    Failed,
}

impl From<PortError> for IfdError {
    fn from(value: PortError) -> Self {
        match value {
            PortError::NoSuchDevice => IfdError::NoSuchDevice,
            _ => IfdError::Communication,
        }
    }
}

/// A notification received on the interrupt pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// RDR_to_PC_NotifySlotChange or RDR_to_PC_HardwareError.
    pub bMessageType: u8,
    /// For RDR_to_PC_NotifySlotChange, the bmSlotICCState bits for the
    /// current slot: bit 0 = ICC present, bit 1 = state changed.
    pub bmSlotICCState: u8,
}

/// One attached CCID reader as seen by the driver core.
pub trait CcidPort {
    /// Write one fully framed CCID command to the bulk-out endpoint.
    fn write(&mut self, buffer: &[u8]) -> Result<(), PortError>;

    /// Read one CCID response into `buffer`, returning the number of bytes
    /// stored. `expected_seq` is the bSeq of the command the caller is
    /// waiting for so the transport can discard stale responses; `None`
    /// accepts the next response whatever its sequence.
    fn read(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
        expected_seq: Option<u8>,
    ) -> Result<usize, PortError>;

    /// Block until a notification arrives on the interrupt pipe.
    fn interrupt_read(&mut self, timeout: Duration) -> Result<Notification, PortError>;

    /// Abort a pending `interrupt_read`.
    fn interrupt_stop(&mut self);
}
