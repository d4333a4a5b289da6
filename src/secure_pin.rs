//! Conversion of PC/SC Part 10 PIN blocks into the CCID wire layout.
//!
//! The wire format drops a few fields the PC/SC structure carries
//! (bTimeOut2, the ulDataLength field, and for modification the message
//! index bytes that are conditional on bNumberMessage), so the block is
//! copied field by field rather than verbatim.
//!
//! Callers on big endian hosts historically passed the three multi-byte
//! fields in host order. The fixup probes whether reading ulDataLength as
//! big endian reconciles the declared structure size and, if so, swaps all
//! three fields. A data length that is a palindrome under byte swap is
//! inherently ambiguous; such a block is taken as already little endian.

use crate::error::{IfdError, IfdResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::info;
use std::time::Duration;

/// Fixed part of the PC/SC PIN verification structure, up to and including
/// ulDataLength.
const VERIFY_FIXED_SIZE: usize = 19;
/// Same for the PIN modification structure.
const MODIFY_FIXED_SIZE: usize = 24;
/// The shortest APDU that can follow the fixed part.
const MIN_APDU_SIZE: usize = 4;

/// Offset of ulDataLength in each structure.
const VERIFY_LENGTH_OFFSET: usize = 15;
const MODIFY_LENGTH_OFFSET: usize = 20;

/// A PC_to_RDR_Secure payload ready to be framed, along with the read
/// timeout the secure entry requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SecurePinCommand {
    /// abData of the Secure frame: bPINOperation followed by the converted
    /// structure.
    pub(crate) payload: Vec<u8>,
    /// At least 90 seconds, or the caller's bTimeOut plus 10 seconds.
    pub(crate) read_timeout: Duration,
}

/// Secure entry can take as long as the user dawdles at the PIN pad.
fn pin_timeout(bTimeOut: u8) -> Duration {
    Duration::from_secs(u64::from(bTimeOut).saturating_add(10).max(90))
}

/// Swap the byte order of wPINMaxExtraDigit, wLangId and ulDataLength when
/// the block was built in big endian host order.
fn fix_byte_order(
    buffer: &mut [u8],
    fixed_size: usize,
    length_offset: usize,
    extra_digit_offset: usize,
    lang_id_offset: usize,
) {
    let le = LittleEndian::read_u32(&buffer[length_offset..length_offset + 4]) as usize;
    let be = BigEndian::read_u32(&buffer[length_offset..length_offset + 4]) as usize;

    if le + fixed_size != buffer.len() && be + fixed_size == buffer.len() {
        info!("Reversing order from big to little endian");
        /* if ulDataLength is big endian, assume the others are too */
        buffer.swap(extra_digit_offset, extra_digit_offset + 1); /* wPINMaxExtraDigit */
        buffer.swap(lang_id_offset, lang_id_offset + 1); /* wLangId */
        buffer[length_offset..length_offset + 4].reverse();
    }
}

/// Check that ulDataLength agrees with the actual block size.
fn check_length_coherency(
    buffer: &[u8],
    fixed_size: usize,
    length_offset: usize,
) -> IfdResult<()> {
    let declared = LittleEndian::read_u32(&buffer[length_offset..length_offset + 4]) as usize;
    if declared + fixed_size != buffer.len() {
        info!("Wrong lengths: {} {}", declared + fixed_size, buffer.len());
        return Err(IfdError::NotSupported);
    }
    Ok(())
}

/// Clamp bEntryValidationCondition to a safe default. Some readers (the
/// Cherry XX44 among them) crash on out-of-range values.
fn fix_entry_validation_condition(buffer: &mut [u8], offset: usize) {
    if 0x00 == buffer[offset] || buffer[offset] > 0x07 {
        info!(
            "Fix bEntryValidationCondition (was 0x{:02X})",
            buffer[offset]
        );
        buffer[offset] = 0x02;
    }
}

/// Build the Secure payload for a PIN verification.
pub(crate) fn build_verify(tx: &[u8]) -> IfdResult<SecurePinCommand> {
    if tx.len() < VERIFY_FIXED_SIZE + MIN_APDU_SIZE {
        info!(
            "Command too short: {} < {}",
            tx.len(),
            VERIFY_FIXED_SIZE + MIN_APDU_SIZE
        );
        return Err(IfdError::NotSupported);
    }

    let mut tx = tx.to_vec();
    fix_byte_order(&mut tx, VERIFY_FIXED_SIZE, VERIFY_LENGTH_OFFSET, 5, 9);
    check_length_coherency(&tx, VERIFY_FIXED_SIZE, VERIFY_LENGTH_OFFSET)?;
    fix_entry_validation_condition(&mut tx, 7);

    /* build the CCID block from the PC/SC Part 10 block */
    let mut payload = Vec::with_capacity(1 + tx.len());
    payload.push(0x00); /* bPINOperation: PIN verification */
    for (b, &byte) in tx.iter().enumerate() {
        if 1 == b {
            /* bTimeOut2: ignored, nothing we can do with it */
            continue;
        }
        if (VERIFY_LENGTH_OFFSET..VERIFY_LENGTH_OFFSET + 4).contains(&b) {
            /* ulDataLength is not present in the CCID frame */
            continue;
        }
        payload.push(byte);
    }

    Ok(SecurePinCommand {
        payload,
        read_timeout: pin_timeout(tx[0]),
    })
}

/// Build the Secure payload for a PIN modification.
pub(crate) fn build_modify(tx: &[u8]) -> IfdResult<SecurePinCommand> {
    if tx.len() < MODIFY_FIXED_SIZE + MIN_APDU_SIZE {
        info!(
            "Command too short: {} < {}",
            tx.len(),
            MODIFY_FIXED_SIZE + MIN_APDU_SIZE
        );
        return Err(IfdError::NotSupported);
    }

    let mut tx = tx.to_vec();
    fix_byte_order(&mut tx, MODIFY_FIXED_SIZE, MODIFY_LENGTH_OFFSET, 7, 12);
    check_length_coherency(&tx, MODIFY_FIXED_SIZE, MODIFY_LENGTH_OFFSET)?;

    /* 0xFF is the default value for bNumberMessage */
    let bNumberMessage = tx[11];
    if bNumberMessage > 3 && bNumberMessage != 0xFF {
        info!("Wrong bNumberMessage: {}", bNumberMessage);
        return Err(IfdError::NotSupported);
    }

    fix_entry_validation_condition(&mut tx, 10);

    let mut payload = Vec::with_capacity(1 + tx.len());
    payload.push(0x01); /* bPINOperation: PIN modification */
    for (b, &byte) in tx.iter().enumerate() {
        if 1 == b {
            /* bTimeOut2: ignored, nothing we can do with it */
            continue;
        }
        if 15 == b && 0 == bNumberMessage {
            /* bMsgIndex2 is present only if bNumberMessage != 0 */
            continue;
        }
        if 16 == b && bNumberMessage < 3 {
            /* bMsgIndex3 is present only if bNumberMessage == 3 */
            continue;
        }
        if (MODIFY_LENGTH_OFFSET..MODIFY_LENGTH_OFFSET + 4).contains(&b) {
            /* ulDataLength is not present in the CCID frame */
            continue;
        }
        payload.push(byte);
    }

    Ok(SecurePinCommand {
        payload,
        read_timeout: pin_timeout(tx[0]),
    })
}
