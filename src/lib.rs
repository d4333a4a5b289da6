//! USB CCID smart-card reader driver core.
//!
//! The crate is layered the way the wire protocol is: [`ccid_frame`]
//! encodes and decodes raw CCID messages, [`session`] owns one attached
//! reader and the request/response primitive, [`commands`] implements the
//! CCID command set on top of it (power management, APDU exchange, escape,
//! secure PIN entry) and [`proto_t1`] runs the ISO 7816-3 T=1 block
//! protocol for TPDU-level readers.
//!
//! The USB transport itself stays behind the [`transport::CcidPort`] trait
//! so the protocol logic can be driven by any bulk-pipe implementation.

#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![allow(clippy::upper_case_acronyms)]

pub mod ccid;
pub mod ccid_const;
pub mod ccid_frame;
mod commands;
pub mod error;
pub mod proto_t1;
mod secure_pin;
pub mod session;
pub mod transport;

pub use ccid::{CcidDescriptor, DriverSession, ExchangeClass, IccProtocol, IccVoltage};
pub use ccid_frame::{IccState, ResponseHeader, SlotStatus};
pub use error::{IfdError, IfdResult};
pub use proto_t1::{T1Link, T1Param, T1ProtocolState, T1State};
pub use session::CcidSession;
pub use transport::{CcidPort, Notification, PortError};
