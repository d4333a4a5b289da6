//! CCID frame codec.
//!
//! Every CCID message starts with the same 10 byte header: message type,
//! 4 byte little endian payload length, slot, sequence number and three
//! command specific bytes. This module is pure data transformation, no I/O.

use crate::ccid_const;
use crate::error::{IfdError, IfdResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::error;

/// Encode one CCID command frame: fixed header followed by the payload
/// copied verbatim.
pub fn encode_command(
    bMessageType: u8,
    bSlot: u8,
    bSeq: u8,
    abCtrl: [u8; 3],
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ccid_const::CCID_HEADER_SIZE + payload.len());
    frame
        .write_u8(bMessageType)
        .expect("CcidFrame: Failed to write message type");
    frame
        .write_u32::<LittleEndian>(payload.len() as u32)
        .expect("CcidFrame: Failed to write message length");
    frame
        .write_u8(bSlot)
        .expect("CcidFrame: Failed to write slot id");
    frame
        .write_u8(bSeq)
        .expect("CcidFrame: Failed to write sequence number");
    frame.extend_from_slice(&abCtrl);
    frame.extend_from_slice(payload);
    frame
}

/// Decoded bStatus register of a response header.
///
/// The ICC state lives in the low two bits; command-failed and
/// time-extension are independent flags in the high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub icc: IccState,
    pub command_failed: bool,
    pub time_extension: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccState {
    PresentActive,
    PresentInactive,
    Absent,
    Rfu,
}

impl SlotStatus {
    pub fn decode(bStatus: u8) -> SlotStatus {
        let icc = match bStatus & ccid_const::CCID_ICC_STATUS_MASK {
            ccid_const::CCID_ICC_PRESENT_ACTIVE => IccState::PresentActive,
            ccid_const::CCID_ICC_PRESENT_INACTIVE => IccState::PresentInactive,
            ccid_const::CCID_ICC_ABSENT => IccState::Absent,
            _ => IccState::Rfu,
        };
        SlotStatus {
            icc,
            command_failed: bStatus & ccid_const::CCID_COMMAND_FAILED != 0,
            time_extension: bStatus & ccid_const::CCID_TIME_EXTENSION != 0,
        }
    }
}

/// The fixed header of a response, with status and error bytes pulled out
/// of their fixed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub bMessageType: u8,
    pub dwLength: u32,
    pub bSlot: u8,
    pub bSeq: u8,
    pub bStatus: u8,
    pub bError: u8,
    /// Byte 9: bChainParameter for RDR_to_PC_DataBlock, bClockStatus for
    /// RDR_to_PC_SlotStatus, bProtocolNum for RDR_to_PC_Parameters.
    pub bParameter: u8,
}

impl ResponseHeader {
    /// Decode the fixed header. Anything shorter than the header size is a
    /// communication error.
    pub fn decode(buffer: &[u8]) -> IfdResult<ResponseHeader> {
        if buffer.len() < ccid_const::CCID_RESPONSE_HEADER_SIZE {
            error!("Not enough data received: {} bytes", buffer.len());
            return Err(IfdError::Communication);
        }
        Ok(ResponseHeader {
            bMessageType: buffer[0],
            dwLength: LittleEndian::read_u32(&buffer[1..5]),
            bSlot: buffer[5],
            bSeq: buffer[6],
            bStatus: buffer[ccid_const::STATUS_OFFSET],
            bError: buffer[ccid_const::ERROR_OFFSET],
            bParameter: buffer[ccid_const::CHAIN_PARAMETER_OFFSET],
        })
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus::decode(self.bStatus)
    }

    pub fn declared_len(&self) -> usize {
        self.dwLength as usize
    }
}

/// Copy the payload of a received frame into the caller's buffer, clamping
/// to its capacity. Returns the number of bytes copied and whether the
/// device declared more data than the caller could hold.
pub fn copy_payload(frame: &[u8], header: &ResponseHeader, out: &mut [u8]) -> (usize, bool) {
    let declared = header.declared_len();
    let available = frame.len().saturating_sub(ccid_const::CCID_HEADER_SIZE);
    let len = declared.min(available);
    let truncated = len > out.len();
    let copied = len.min(out.len());
    out[..copied].copy_from_slice(
        &frame[ccid_const::CCID_HEADER_SIZE..ccid_const::CCID_HEADER_SIZE + copied],
    );
    (copied, truncated)
}
