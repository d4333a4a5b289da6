//! Transport session: per-reader state plus the request/response primitive
//! every command is built on.

use crate::ccid::CcidDescriptor;
use crate::ccid_frame;
use crate::error::{IfdError, IfdResult};
use crate::transport::{CcidPort, Notification, PortError};
use std::time::Duration;

/// One attached reader: its capability descriptor and the port talking to
/// it. Commands on the same session must be serialized by the caller; the
/// sequence counter is the only piece of state safe to touch concurrently.
#[derive(Debug)]
pub struct CcidSession<P: CcidPort> {
    pub(crate) descriptor: CcidDescriptor,
    pub(crate) port: P,
}

impl<P: CcidPort> CcidSession<P> {
    pub fn new(descriptor: CcidDescriptor, port: P) -> CcidSession<P> {
        CcidSession { descriptor, port }
    }

    pub fn descriptor(&self) -> &CcidDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut CcidDescriptor {
        &mut self.descriptor
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Current adaptive bulk-in timeout.
    pub fn read_timeout(&self) -> Duration {
        self.descriptor.readTimeout
    }

    pub(crate) fn set_read_timeout(&mut self, timeout: Duration) {
        self.descriptor.readTimeout = timeout;
    }

    /// Write one framed command, mapping a vanished device to its own error.
    pub(crate) fn write_port(&mut self, frame: &[u8]) -> IfdResult<()> {
        self.port.write(frame).map_err(IfdError::from)
    }

    /// Read one response with the current adaptive timeout. NAK is folded
    /// into a communication error here; callers that replay on NAK use
    /// [`Self::read_port_raw`].
    pub(crate) fn read_port(&mut self, buffer: &mut [u8], expected_seq: Option<u8>) -> IfdResult<usize> {
        self.read_port_raw(buffer, expected_seq)
            .map_err(IfdError::from)
    }

    pub(crate) fn read_port_raw(
        &mut self,
        buffer: &mut [u8],
        expected_seq: Option<u8>,
    ) -> Result<usize, PortError> {
        let timeout = self.descriptor.readTimeout;
        self.port.read(buffer, timeout, expected_seq)
    }

    /// Issue one command: allocate the sequence number, frame the payload,
    /// write it and read the matching response into `response`. Returns the
    /// number of response bytes read.
    pub(crate) fn issue(
        &mut self,
        bMessageType: u8,
        abCtrl: [u8; 3],
        payload: &[u8],
        response: &mut [u8],
    ) -> IfdResult<usize> {
        let bSeq = self.descriptor.next_seq();
        let frame = ccid_frame::encode_command(
            bMessageType,
            self.descriptor.bCurrentSlotIndex,
            bSeq,
            abCtrl,
            payload,
        );
        self.write_port(&frame)?;
        self.read_port(response, Some(bSeq))
    }

    /// Wait for a slot change notification on the interrupt pipe.
    pub fn wait_slot_change(&mut self, timeout: Duration) -> IfdResult<Notification> {
        self.port.interrupt_read(timeout).map_err(IfdError::from)
    }

    /// Abort a pending `wait_slot_change`.
    pub fn stop_slot_change(&mut self) {
        self.port.interrupt_stop();
    }
}
