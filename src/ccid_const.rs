// Command messages (PC to reader)

pub const PC_to_RDR_IccPowerOn: u8 = 0x62;
pub const PC_to_RDR_IccPowerOff: u8 = 0x63;
pub const PC_to_RDR_GetSlotStatus: u8 = 0x65;
pub const PC_to_RDR_XfrBlock: u8 = 0x6F;
pub const PC_to_RDR_SetParameters: u8 = 0x61;
pub const PC_to_RDR_Escape: u8 = 0x6B;
pub const PC_to_RDR_Secure: u8 = 0x69;

// Response messages (reader to PC)

pub const RDR_to_PC_DataBlock: u8 = 0x80;
pub const RDR_to_PC_SlotStatus: u8 = 0x81;
pub const RDR_to_PC_Parameters: u8 = 0x82;
pub const RDR_to_PC_Escape: u8 = 0x83;
pub const RDR_to_PC_NotifySlotChange: u8 = 0x50;
pub const RDR_to_PC_HardwareError: u8 = 0x51;

// CCID response message error constants (bError register)

pub const CMD_ABORTED: u8 = 0xFF;
pub const ICC_MUTE: u8 = 0xFE;
pub const XFR_PARITY_ERROR: u8 = 0xFD;
pub const XFR_OVERRUN: u8 = 0xFC;
pub const HW_ERROR: u8 = 0xFB;
pub const BAD_ATR_TS: u8 = 0xF8;
pub const BAD_ATR_TCK: u8 = 0xF7;
pub const ICC_PROTOCOL_NOT_SUPPORTED: u8 = 0xF6;
pub const ICC_CLASS_NOT_SUPPORTED: u8 = 0xF5;
pub const PROCEDURE_BYTE_CONFLICT: u8 = 0xF4;
pub const DEACTIVATED_PROTOCOL: u8 = 0xF3;
pub const BUSY_WITH_AUTO_SEQUENCE: u8 = 0xF2;
pub const PIN_TIMEOUT: u8 = 0xF0;
pub const PIN_CANCELLED: u8 = 0xEF;
pub const CMD_SLOT_BUSY: u8 = 0xE0;
pub const CMD_NOT_SUPPORTED: u8 = 0x00;

// Fixed layout of every CCID message

/// Size of the fixed CCID header, commands and responses alike.
pub const CCID_HEADER_SIZE: usize = 10;
pub const CCID_RESPONSE_HEADER_SIZE: usize = 10;

pub const STATUS_OFFSET: usize = 7;
pub const ERROR_OFFSET: usize = 8;
pub const CHAIN_PARAMETER_OFFSET: usize = 9;

// bStatus register, see CCID specs ch. 4.2.1

pub const CCID_ICC_PRESENT_ACTIVE: u8 = 0x00; /* 00 0000 00 */
pub const CCID_ICC_PRESENT_INACTIVE: u8 = 0x01; /* 00 0000 01 */
pub const CCID_ICC_ABSENT: u8 = 0x02; /* 00 0000 10 */
pub const CCID_ICC_STATUS_MASK: u8 = 0x03; /* 00 0000 11 */

pub const CCID_COMMAND_FAILED: u8 = 0x40; /* 01 0000 00 */
pub const CCID_TIME_EXTENSION: u8 = 0x80; /* 10 0000 00 */

// Features from dwFeatures

pub const CCID_CLASS_AUTO_CONF_ATR: u32 = 0x0000_0002;
pub const CCID_CLASS_AUTO_ACTIVATION: u32 = 0x0000_0004;
pub const CCID_CLASS_AUTO_VOLTAGE: u32 = 0x0000_0008;
pub const CCID_CLASS_AUTO_BAUD: u32 = 0x0000_0020;
pub const CCID_CLASS_AUTO_PPS_PROP: u32 = 0x0000_0040;
pub const CCID_CLASS_AUTO_PPS_CUR: u32 = 0x0000_0080;
pub const CCID_CLASS_AUTO_IFSD: u32 = 0x0000_0400;
pub const CCID_CLASS_CHARACTER: u32 = 0x0000_0000;
pub const CCID_CLASS_TPDU: u32 = 0x0001_0000;
pub const CCID_CLASS_SHORT_APDU: u32 = 0x0002_0000;
pub const CCID_CLASS_EXTENDED_APDU: u32 = 0x0004_0000;
pub const CCID_CLASS_EXCHANGE_MASK: u32 = 0x0007_0000;

// Features from bPINSupport

pub const CCID_CLASS_PIN_VERIFY: u8 = 0x01;
pub const CCID_CLASS_PIN_MODIFY: u8 = 0x02;

// Voltage codes used by PC_to_RDR_IccPowerOn (bPowerSelect)

pub const VOLTAGE_AUTO: u8 = 0;
pub const VOLTAGE_5V: u8 = 1;
pub const VOLTAGE_3V: u8 = 2;
pub const VOLTAGE_1_8V: u8 = 3;

// Driver buffer sizes

/// Largest short-APDU exchange the driver will carry in one CCID frame.
pub const CMD_BUF_SIZE: usize = 271;
/// Longest Answer To Reset a card may return.
pub const MAX_ATR_SIZE: usize = 33;
