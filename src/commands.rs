//! Command layer: one operation per CCID command, every one following the
//! same template: build frame, issue, validate the response header, branch
//! on the status byte.

use crate::ccid::{ExchangeClass, IccProtocol, IccVoltage};
use crate::ccid_const;
use crate::ccid_frame::{self, IccState, ResponseHeader, SlotStatus};
use crate::error::{ccid_error, ErrorSeverity, IfdError, IfdResult};
use crate::secure_pin::{self, SecurePinCommand};
use crate::session::CcidSession;
use crate::transport::{CcidPort, PortError};
use log::{debug, error, info};
use std::time::Duration;

/// Indexed by voltage code; entry 0 is the wrap target logged when stepping
/// down from 1.8V.
const VOLTAGE_NAME: [&str; 4] = ["1.8V", "5V", "3V", "1.8V"];

impl<P: CcidPort> CcidSession<P> {
    /// Power the card up, iterating over the supported voltages until the
    /// reader accepts one. Returns the ATR length; the ATR itself is copied
    /// into `atr`, truncated to its capacity.
    pub fn power_on(&mut self, voltage: IccVoltage, atr: &mut [u8]) -> IfdResult<usize> {
        let mut voltage = voltage as u8;

        if self.descriptor.has_auto_voltage() || self.descriptor.has_auto_activation() {
            /* automatic voltage selection */
            voltage = ccid_const::VOLTAGE_AUTO;
        } else {
            let bVoltageSupport = self.descriptor.bVoltageSupport;
            loop {
                if ccid_const::VOLTAGE_5V == voltage && bVoltageSupport & 1 == 0 {
                    info!("5V requested but not supported by reader");
                    voltage = ccid_const::VOLTAGE_3V;
                }

                if ccid_const::VOLTAGE_3V == voltage && bVoltageSupport & 2 == 0 {
                    info!("3V requested but not supported by reader");
                    voltage = ccid_const::VOLTAGE_1_8V;
                }

                if ccid_const::VOLTAGE_1_8V == voltage && bVoltageSupport & 4 == 0 {
                    info!("1.8V requested but not supported by reader");
                    voltage = ccid_const::VOLTAGE_5V;

                    /* do not loop forever if bVoltageSupport == 0 */
                    if bVoltageSupport != 0 {
                        continue;
                    }
                }
                break;
            }
        }
        let init_voltage = voltage;

        loop {
            let mut resp =
                [0u8; ccid_const::CCID_RESPONSE_HEADER_SIZE + ccid_const::MAX_ATR_SIZE];
            let n = self.issue(
                ccid_const::PC_to_RDR_IccPowerOn,
                [voltage, 0, 0],
                &[],
                &mut resp,
            )?;
            let header = ResponseHeader::decode(&resp[..n])?;

            if header.status().command_failed {
                ccid_error(ErrorSeverity::Error, header.bError, "PowerOn");

                /* continue with the other voltage values */
                if voltage != ccid_const::VOLTAGE_AUTO {
                    info!(
                        "Power up with {} failed. Try with {}.",
                        VOLTAGE_NAME[voltage as usize],
                        VOLTAGE_NAME[voltage as usize - 1]
                    );
                    voltage -= 1;

                    /* loop from 5V to 1.8V */
                    if 0 == voltage {
                        voltage = ccid_const::VOLTAGE_1_8V;
                    }

                    /* continue until we tried every value */
                    if voltage != init_voltage {
                        continue;
                    }
                }

                return Err(IfdError::Communication);
            }

            /* extract the ATR */
            let (atr_len, _) = ccid_frame::copy_payload(&resp[..n], &header, atr);
            return Ok(atr_len);
        }
    }

    pub fn power_off(&mut self) -> IfdResult<()> {
        let mut resp = [0u8; ccid_const::CCID_RESPONSE_HEADER_SIZE];
        let n = self.issue(ccid_const::PC_to_RDR_IccPowerOff, [0, 0, 0], &[], &mut resp)?;
        let header = ResponseHeader::decode(&resp[..n])?;

        if header.status().command_failed {
            ccid_error(ErrorSeverity::Error, header.bError, "PowerOff");
            return Err(IfdError::Communication);
        }

        Ok(())
    }

    /// Query the slot. A mute or absent card is a normal condition here,
    /// not a failure of the reader: bError 0xFE with the ICC-absent bits
    /// set reports the empty slot, the same code with a card present is a
    /// real communication error.
    pub fn get_slot_status(&mut self) -> IfdResult<SlotStatus> {
        let mut resp = [0u8; ccid_const::CCID_RESPONSE_HEADER_SIZE];
        let n = self.issue(
            ccid_const::PC_to_RDR_GetSlotStatus,
            [0, 0, 0],
            &[],
            &mut resp,
        )?;
        let header = ResponseHeader::decode(&resp[..n])?;
        let status = header.status();

        if status.command_failed {
            if ccid_const::ICC_MUTE == header.bError && IccState::Absent == status.icc {
                return Ok(status);
            }
            ccid_error(ErrorSeverity::Error, header.bError, "GetSlotStatus");
            return Err(IfdError::Communication);
        }

        Ok(status)
    }

    /// Send one XfrBlock frame. `rx_length` is the expected response length
    /// hint, used in character mode only; `bBWI` extends the block waiting
    /// timeout on the card side.
    pub fn transmit(&mut self, tx: &[u8], rx_length: u16, bBWI: u8) -> IfdResult<()> {
        let bSeq = self.descriptor.next_seq();
        let frame = ccid_frame::encode_command(
            ccid_const::PC_to_RDR_XfrBlock,
            self.descriptor.bCurrentSlotIndex,
            bSeq,
            [bBWI, rx_length as u8, (rx_length >> 8) as u8],
            tx,
        );
        self.write_port(&frame)
    }

    /// Read one data block from the card, transparently honoring time
    /// extension requests. `chain_parameter` receives byte 9 of the
    /// response so multi-frame reassembly can proceed for readers that
    /// chain RDR_to_PC_DataBlock frames.
    pub fn receive(
        &mut self,
        rx: &mut [u8],
        chain_parameter: Option<&mut u8>,
    ) -> IfdResult<usize> {
        let base_timeout = self.descriptor.readTimeout;
        let result = self.receive_inner(rx, chain_parameter, base_timeout);
        self.descriptor.readTimeout = base_timeout;
        result
    }

    fn receive_inner(
        &mut self,
        rx: &mut [u8],
        chain_parameter: Option<&mut u8>,
        base_timeout: Duration,
    ) -> IfdResult<usize> {
        let mut frame = vec![0u8; ccid_const::CCID_HEADER_SIZE + ccid_const::CMD_BUF_SIZE];

        loop {
            let n = self.read_port(&mut frame, None)?;
            self.descriptor.readTimeout = base_timeout;
            let header = ResponseHeader::decode(&frame[..n])?;
            let status = header.status();

            if status.time_extension {
                debug!("Time extension requested: 0x{:02X}", header.bError);

                /* compute the new value of the read timeout */
                if header.bError > 0 {
                    self.descriptor.readTimeout = base_timeout * u32::from(header.bError);
                }

                debug!("New timeout: {:?}", self.descriptor.readTimeout);
                continue;
            }

            if status.command_failed {
                ccid_error(ErrorSeverity::Error, header.bError, "Receive");
                return match header.bError {
                    ccid_const::PIN_CANCELLED => {
                        if rx.len() < 2 {
                            return Err(IfdError::InsufficientBuffer(0));
                        }
                        rx[0] = 0x64;
                        rx[1] = 0x01;
                        Ok(2)
                    }
                    ccid_const::PIN_TIMEOUT => {
                        if rx.len() < 2 {
                            return Err(IfdError::InsufficientBuffer(0));
                        }
                        rx[0] = 0x64;
                        rx[1] = 0x00;
                        Ok(2)
                    }
                    ccid_const::XFR_PARITY_ERROR => Err(IfdError::ParityError),
                    ccid_const::ICC_MUTE => {
                        if IccState::Absent == status.icc {
                            Err(IfdError::IccNotPresent)
                        } else {
                            Err(IfdError::Communication)
                        }
                    }
                    _ => Err(IfdError::Communication),
                };
            }

            /* we have read less (or more) data than the frame declares */
            if n - ccid_const::CCID_HEADER_SIZE != header.declared_len() {
                error!(
                    "Can't read all data ({} out of {} expected)",
                    n - ccid_const::CCID_HEADER_SIZE,
                    header.declared_len()
                );
                return Err(IfdError::Communication);
            }

            let (len, truncated) = ccid_frame::copy_payload(&frame[..n], &header, rx);
            if let Some(chain) = chain_parameter {
                /* only meaningful for RDR_to_PC_DataBlock frames */
                *chain = header.bParameter;
            }
            if truncated {
                error!("overrun by {} bytes", header.declared_len() - len);
                return Err(IfdError::InsufficientBuffer(len));
            }
            return Ok(len);
        }
    }

    /// Exchange one APDU with the card, dispatching on the exchange level
    /// the reader announced. TPDU-level readers running T=1 go through
    /// [`crate::proto_t1::T1State::transceive`] instead, with the session
    /// as the link.
    pub fn xfr_block(&mut self, tx: &[u8], rx: &mut [u8]) -> IfdResult<usize> {
        match self.descriptor.exchange_class() {
            ExchangeClass::ShortApdu | ExchangeClass::ExtendedApdu => {
                self.xfr_block_tpdu_t0(tx, rx)
            }
            ExchangeClass::Character | ExchangeClass::Tpdu => {
                match self.descriptor.cardProtocol {
                    Some(IccProtocol::T0) => self.xfr_block_tpdu_t0(tx, rx),
                    _ => {
                        error!("unsupported exchange for this reader class");
                        Err(IfdError::NotSupported)
                    }
                }
            }
        }
    }

    fn xfr_block_tpdu_t0(&mut self, tx: &[u8], rx: &mut [u8]) -> IfdResult<usize> {
        debug!("T=0: {} bytes", tx.len());

        let max_length = self.descriptor.dwMaxCCIDMessageLength as usize
            - ccid_const::CCID_HEADER_SIZE;

        /* command too long for the CCID reader? */
        if tx.len() > max_length {
            /* the firmware of some SCM readers reports
             * dwMaxCCIDMessageLength = 263 instead of 270, refusing a full
             * length short APDU the reader actually accepts */
            if 263 == self.descriptor.dwMaxCCIDMessageLength {
                info!(
                    "Command too long ({} bytes) for max: {} bytes. SCM reader with bogus firmware?",
                    tx.len(),
                    max_length
                );
            } else {
                error!(
                    "Command too long ({} bytes) for max: {} bytes",
                    tx.len(),
                    max_length
                );
                return Err(IfdError::Communication);
            }
        }

        /* command too long for the CCID driver? */
        if tx.len() > ccid_const::CMD_BUF_SIZE {
            error!(
                "Command too long ({} bytes) for max: {} bytes",
                tx.len(),
                ccid_const::CMD_BUF_SIZE
            );
            return Err(IfdError::Communication);
        }

        self.transmit(tx, 0, 0)?;
        self.receive(rx, None)
    }

    /// Send a raw vendor command to the reader.
    pub fn escape(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        timeout: Option<Duration>,
    ) -> IfdResult<usize> {
        self.escape_check(tx, rx, timeout, false)
    }

    /// Same as [`Self::escape`] but `mayfail` marks the command as allowed
    /// to fail: the bError log is downgraded to info while the returned
    /// error is unchanged.
    pub fn escape_check(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        timeout: Option<Duration>,
        mayfail: bool,
    ) -> IfdResult<usize> {
        /* a timeout of None keeps the default read timeout */
        let old_timeout = self.descriptor.readTimeout;
        if let Some(timeout) = timeout {
            self.descriptor.readTimeout = timeout;
        }
        let result = self.escape_inner(tx, rx, mayfail);
        self.descriptor.readTimeout = old_timeout;
        result
    }

    fn escape_inner(&mut self, tx: &[u8], rx: &mut [u8], mayfail: bool) -> IfdResult<usize> {
        let mut frame = vec![0u8; ccid_const::CCID_HEADER_SIZE + ccid_const::CMD_BUF_SIZE];
        let mut nak_replayed = false;

        'replay: loop {
            let bSeq = self.descriptor.next_seq();
            let cmd = ccid_frame::encode_command(
                ccid_const::PC_to_RDR_Escape,
                self.descriptor.bCurrentSlotIndex,
                bSeq,
                [0, 0, 0],
                tx,
            );
            self.write_port(&cmd)?;

            let n = loop {
                match self.read_port_raw(&mut frame, Some(bSeq)) {
                    /* replay the command on NAK. This (generally) happens
                     * only for the first command sent to the reader with
                     * the serial protocol, so one replay is enough. */
                    Err(PortError::CommNak) if !nak_replayed => {
                        debug!("NAK on read, replaying the escape command");
                        nak_replayed = true;
                        continue 'replay;
                    }
                    Err(e) => return Err(e.into()),
                    Ok(n) => {
                        let header = ResponseHeader::decode(&frame[..n])?;
                        if header.status().time_extension {
                            debug!("Time extension requested: 0x{:02X}", header.bError);
                            continue;
                        }
                        break n;
                    }
                }
            };

            let header = ResponseHeader::decode(&frame[..n])?;
            let failed = header.status().command_failed;
            if failed {
                /* mayfail: the error may be expected and not fatal */
                ccid_error(
                    if mayfail {
                        ErrorSeverity::Info
                    } else {
                        ErrorSeverity::Error
                    },
                    header.bError,
                    "Escape",
                );
            }

            /* copy the response */
            let (len, truncated) = ccid_frame::copy_payload(&frame[..n], &header, rx);
            if truncated {
                return Err(IfdError::InsufficientBuffer(len));
            }
            if failed {
                return Err(IfdError::Communication);
            }
            return Ok(len);
        }
    }

    /// Push protocol parameters to the reader. A reader rejecting one
    /// specific parameter (bError 1..=127) simply cannot change it, which
    /// is not a failure.
    pub fn set_parameters(&mut self, protocol: u8, data: &[u8]) -> IfdResult<()> {
        debug!("length: {} bytes", data.len());

        let mut resp = vec![0u8; ccid_const::CCID_HEADER_SIZE + data.len().max(32)];
        let n = self.issue(
            ccid_const::PC_to_RDR_SetParameters,
            [protocol, 0, 0],
            data,
            &mut resp,
        )?;
        let header = ResponseHeader::decode(&resp[..n])?;

        if header.status().command_failed {
            ccid_error(ErrorSeverity::Error, header.bError, "SetParameters");
            return match header.bError {
                /* command not supported */
                0x00 => Err(IfdError::NotSupported),
                /* a parameter is not changeable */
                0x01..=0x7F => Ok(()),
                _ => Err(IfdError::Communication),
            };
        }

        Ok(())
    }

    /// Secure PIN verification: the PC/SC Part 10 block in `tx` is
    /// reformatted into the CCID wire layout and the card's response read
    /// with the long PIN-entry timeout.
    pub fn secure_pin_verify(&mut self, tx: &[u8], rx: &mut [u8]) -> IfdResult<usize> {
        let cmd = secure_pin::build_verify(tx)?;
        self.secure_exchange(&cmd, rx)
    }

    /// Secure PIN modification, same wire conversion rules as
    /// [`Self::secure_pin_verify`] plus the message-index fields that are
    /// only present for some message counts.
    pub fn secure_pin_modify(&mut self, tx: &[u8], rx: &mut [u8]) -> IfdResult<usize> {
        let cmd = secure_pin::build_modify(tx)?;
        self.secure_exchange(&cmd, rx)
    }

    fn secure_exchange(&mut self, cmd: &SecurePinCommand, rx: &mut [u8]) -> IfdResult<usize> {
        let old_timeout = self.descriptor.readTimeout;
        self.descriptor.readTimeout = cmd.read_timeout;
        let result = self.secure_exchange_inner(cmd, rx);
        /* restore the initial timeout */
        self.descriptor.readTimeout = old_timeout;
        result
    }

    fn secure_exchange_inner(
        &mut self,
        cmd: &SecurePinCommand,
        rx: &mut [u8],
    ) -> IfdResult<usize> {
        let bSeq = self.descriptor.next_seq();
        let frame = ccid_frame::encode_command(
            ccid_const::PC_to_RDR_Secure,
            self.descriptor.bCurrentSlotIndex,
            bSeq,
            [0, 0, 0], /* bBWI, wLevelParameter */
            &cmd.payload,
        );
        self.write_port(&frame)?;
        self.receive(rx, None)
    }
}
