//! Per-reader capability descriptor and the driver session registry.

use crate::ccid_const;
use crate::session::CcidSession;
use crate::transport::CcidPort;
use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Default bulk-in timeout before any card asked for more time.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Voltage requested in PC_to_RDR_IccPowerOn (bPowerSelect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum IccVoltage {
    Auto = 0,
    V5 = 1,
    V3 = 2,
    V1_8 = 3,
}

/// Card protocol negotiated at power up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum IccProtocol {
    T0 = 0,
    T1 = 1,
}

/// Exchange level granted by dwFeatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeClass {
    Character,
    Tpdu,
    ShortApdu,
    ExtendedApdu,
}

/// Capabilities of one attached reader, built from its USB class descriptor
/// when the reader is attached and owned by its session until detach.
///
/// The sequence counter is the only field mutated concurrently with command
/// construction; everything else is only touched under the per-reader
/// serialization the caller already provides.
#[derive(Debug)]
pub struct CcidDescriptor {
    /// CCID sequence number, one increment per command issued.
    bSeq: AtomicU8,

    /// VendorID << 16 + ProductID
    pub readerID: u32,

    /// Maximum CCID message length accepted by the reader.
    pub dwMaxCCIDMessageLength: u32,

    /// Maximum IFSD the reader will grant.
    pub dwMaxIFSD: u32,

    /// Feature bits, directly from the class descriptor.
    pub dwFeatures: u32,

    /// PIN support bits, directly from the class descriptor.
    pub bPINSupport: u8,

    /// Display dimensions of the reader.
    pub wLcdLayout: u16,

    pub dwDefaultClock: u32,
    pub dwMaxDataRate: u32,

    /// Index of the last slot (slot count - 1).
    pub bMaxSlotIndex: u8,
    pub bMaxCCIDBusySlots: u8,

    /// Slot in use.
    pub bCurrentSlotIndex: u8,

    /// Data rates supported by the reader, empty when the descriptor lists
    /// none.
    pub arrayOfSupportedDataRates: Vec<u32>,

    /// Bulk-in timeout. Evolves dynamically when the card requests time
    /// extensions; always restored to its pre-command value afterwards.
    pub(crate) readTimeout: Duration,

    /// Protocol negotiated with the current card, if any.
    pub cardProtocol: Option<IccProtocol>,

    /// Protocols announced by the reader (dwProtocols).
    pub dwProtocols: u32,

    /// Supported voltages: 1 = 5V, 2 = 3V, 4 = 1.8V.
    pub bVoltageSupport: u8,

    pub sIFD_serial_number: Option<String>,
    pub sIFD_iManufacturer: Option<String>,
    pub IFD_bcdDevice: u16,
}

impl CcidDescriptor {
    pub fn new(readerID: u32) -> CcidDescriptor {
        CcidDescriptor {
            bSeq: AtomicU8::new(0),
            readerID,
            dwMaxCCIDMessageLength: (ccid_const::CMD_BUF_SIZE + ccid_const::CCID_HEADER_SIZE)
                as u32,
            dwMaxIFSD: 254,
            dwFeatures: 0,
            bPINSupport: 0,
            wLcdLayout: 0,
            dwDefaultClock: 0,
            dwMaxDataRate: 0,
            bMaxSlotIndex: 0,
            bMaxCCIDBusySlots: 1,
            bCurrentSlotIndex: 0,
            arrayOfSupportedDataRates: Vec::new(),
            readTimeout: DEFAULT_READ_TIMEOUT,
            cardProtocol: None,
            dwProtocols: 0,
            bVoltageSupport: 0,
            sIFD_serial_number: None,
            sIFD_iManufacturer: None,
            IFD_bcdDevice: 0,
        }
    }

    /// Allocate the next sequence number. Wraps at 255; the transport uses
    /// the value to correlate the response with its command.
    pub fn next_seq(&self) -> u8 {
        self.bSeq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn has_auto_voltage(&self) -> bool {
        self.dwFeatures & ccid_const::CCID_CLASS_AUTO_VOLTAGE != 0
    }

    pub fn has_auto_activation(&self) -> bool {
        self.dwFeatures & ccid_const::CCID_CLASS_AUTO_ACTIVATION != 0
    }

    pub fn has_auto_ifsd(&self) -> bool {
        self.dwFeatures & ccid_const::CCID_CLASS_AUTO_IFSD != 0
    }

    pub fn exchange_class(&self) -> ExchangeClass {
        match self.dwFeatures & ccid_const::CCID_CLASS_EXCHANGE_MASK {
            ccid_const::CCID_CLASS_TPDU => ExchangeClass::Tpdu,
            ccid_const::CCID_CLASS_SHORT_APDU => ExchangeClass::ShortApdu,
            ccid_const::CCID_CLASS_EXTENDED_APDU => ExchangeClass::ExtendedApdu,
            _ => ExchangeClass::Character,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.readTimeout
    }
}

/// Explicit reader table, indexed by the integer handle the host hands the
/// driver. Populated on attach, erased on detach; passed by reference into
/// the components that need a reader instead of being looked up through
/// process-global state.
#[derive(Debug)]
pub struct DriverSession<P: CcidPort> {
    readers: HashMap<u32, CcidSession<P>>,
}

impl<P: CcidPort> Default for DriverSession<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CcidPort> DriverSession<P> {
    pub fn new() -> DriverSession<P> {
        DriverSession {
            readers: HashMap::new(),
        }
    }

    /// Register a newly attached reader under `reader_index`. Replaces any
    /// stale entry left by a detach the host never delivered.
    pub fn attach(
        &mut self,
        reader_index: u32,
        descriptor: CcidDescriptor,
        port: P,
    ) -> &mut CcidSession<P> {
        let session = CcidSession::new(descriptor, port);
        match self.readers.entry(reader_index) {
            Entry::Occupied(mut entry) => {
                entry.insert(session);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(session),
        }
    }

    /// Remove a reader, stopping its interrupt pipe first.
    pub fn detach(&mut self, reader_index: u32) -> Option<CcidSession<P>> {
        let mut session = self.readers.remove(&reader_index)?;
        session.stop_slot_change();
        Some(session)
    }

    pub fn reader(&mut self, reader_index: u32) -> Option<&mut CcidSession<P>> {
        self.readers.get_mut(&reader_index)
    }

    pub fn is_attached(&self, reader_index: u32) -> bool {
        self.readers.contains_key(&reader_index)
    }
}
