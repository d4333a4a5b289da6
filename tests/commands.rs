//! Command layer tests against a scripted port.

use ccid_ifd::ccid::DEFAULT_READ_TIMEOUT;
use ccid_ifd::ccid_const;
use ccid_ifd::ccid_frame::encode_command;
use ccid_ifd::{
    CcidDescriptor, CcidPort, CcidSession, DriverSession, IccState, IccVoltage, IfdError,
    Notification, PortError,
};
use std::collections::VecDeque;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A port fed from a script of canned responses. Every write and every
/// read timeout is recorded for the assertions.
#[derive(Debug, Default)]
struct MockPort {
    responses: VecDeque<Result<Vec<u8>, PortError>>,
    writes: Vec<Vec<u8>>,
    read_timeouts: Vec<Duration>,
    interrupt_stopped: bool,
}

impl MockPort {
    fn scripted(responses: Vec<Result<Vec<u8>, PortError>>) -> MockPort {
        MockPort {
            responses: responses.into(),
            ..MockPort::default()
        }
    }
}

impl CcidPort for MockPort {
    fn write(&mut self, buffer: &[u8]) -> Result<(), PortError> {
        self.writes.push(buffer.to_vec());
        Ok(())
    }

    fn read(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
        expected_seq: Option<u8>,
    ) -> Result<usize, PortError> {
        self.read_timeouts.push(timeout);
        let mut frame = self
            .responses
            .pop_front()
            .expect("script exhausted, unexpected read")?;
        if let Some(seq) = expected_seq {
            frame[6] = seq;
        }
        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn interrupt_read(&mut self, _timeout: Duration) -> Result<Notification, PortError> {
        Err(PortError::Failed)
    }

    fn interrupt_stop(&mut self) {
        self.interrupt_stopped = true;
    }
}

/// A response frame uses the same fixed layout as a command: the three
/// control bytes land at the bStatus, bError and bParameter offsets.
fn response(bMessageType: u8, bStatus: u8, bError: u8, payload: &[u8]) -> Result<Vec<u8>, PortError> {
    Ok(encode_command(bMessageType, 0, 0, [bStatus, bError, 0], payload))
}

fn session(dwFeatures: u32, responses: Vec<Result<Vec<u8>, PortError>>) -> CcidSession<MockPort> {
    let mut descriptor = CcidDescriptor::new(0x08E6_3437);
    descriptor.dwFeatures = dwFeatures;
    descriptor.bVoltageSupport = 7;
    CcidSession::new(descriptor, MockPort::scripted(responses))
}

#[test]
fn sequence_numbers_increment_and_wrap() {
    let descriptor = CcidDescriptor::new(0);
    for expected in 0..=255u8 {
        assert_eq!(descriptor.next_seq(), expected);
    }
    // wrap around
    assert_eq!(descriptor.next_seq(), 0);
}

#[test]
fn power_on_walks_the_voltage_cycle() {
    init();
    let failed = ccid_const::CCID_COMMAND_FAILED;
    let mut s = session(
        0,
        vec![
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::BAD_ATR_TS, &[]),
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::BAD_ATR_TS, &[]),
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::BAD_ATR_TS, &[]),
        ],
    );

    let mut atr = [0u8; 33];
    assert_eq!(
        s.power_on(IccVoltage::V5, &mut atr),
        Err(IfdError::Communication)
    );

    // 5V first, then wrapping down through 1.8V and 3V before giving up
    let voltages: Vec<u8> = s.port().writes.iter().map(|w| w[7]).collect();
    assert_eq!(voltages, vec![1, 3, 2]);
}

#[test]
fn power_on_prefers_automatic_voltage() {
    let atr = [0x3B, 0x8F, 0x80, 0x01];
    let mut s = session(
        ccid_const::CCID_CLASS_AUTO_VOLTAGE,
        vec![response(ccid_const::RDR_to_PC_DataBlock, 0, 0, &atr)],
    );

    let mut buffer = [0u8; 33];
    let n = s.power_on(IccVoltage::V5, &mut buffer).unwrap();
    assert_eq!(&buffer[..n], &atr);
    assert_eq!(s.port().writes[0][7], ccid_const::VOLTAGE_AUTO);
}

#[test]
fn power_on_skips_unsupported_voltages() {
    let mut s = session(
        0,
        vec![response(ccid_const::RDR_to_PC_DataBlock, 0, 0, &[0x3B, 0x00])],
    );
    // reader only supplies 1.8V
    s.descriptor_mut().bVoltageSupport = 4;

    let mut atr = [0u8; 33];
    s.power_on(IccVoltage::V5, &mut atr).unwrap();
    assert_eq!(s.port().writes[0][7], ccid_const::VOLTAGE_1_8V);
}

#[test]
fn slot_status_tolerates_an_empty_slot() {
    let failed_absent = ccid_const::CCID_COMMAND_FAILED | ccid_const::CCID_ICC_ABSENT;
    let mut s = session(
        0,
        vec![response(
            ccid_const::RDR_to_PC_SlotStatus,
            failed_absent,
            ccid_const::ICC_MUTE,
            &[],
        )],
    );

    let status = s.get_slot_status().unwrap();
    assert_eq!(status.icc, IccState::Absent);
    assert!(status.command_failed);
}

#[test]
fn slot_status_mute_with_card_present_is_an_error() {
    let mut s = session(
        0,
        vec![response(
            ccid_const::RDR_to_PC_SlotStatus,
            ccid_const::CCID_COMMAND_FAILED,
            ccid_const::ICC_MUTE,
            &[],
        )],
    );

    assert_eq!(s.get_slot_status(), Err(IfdError::Communication));
}

#[test]
fn receive_honors_time_extensions_and_restores_the_timeout() {
    init();
    let mut s = session(
        ccid_const::CCID_CLASS_SHORT_APDU,
        vec![
            // the card asks for 4 times the waiting time, twice
            response(
                ccid_const::RDR_to_PC_DataBlock,
                ccid_const::CCID_TIME_EXTENSION,
                4,
                &[],
            ),
            response(
                ccid_const::RDR_to_PC_DataBlock,
                ccid_const::CCID_TIME_EXTENSION,
                4,
                &[],
            ),
            response(ccid_const::RDR_to_PC_DataBlock, 0, 0, &[0x90, 0x00]),
        ],
    );

    let mut rx = [0u8; 64];
    let n = s.xfr_block(&[0x00, 0xA4, 0x04, 0x00], &mut rx).unwrap();
    assert_eq!(&rx[..n], &[0x90, 0x00]);

    // the first read uses the base timeout, the next ones the extended one
    assert_eq!(
        s.port().read_timeouts,
        vec![
            DEFAULT_READ_TIMEOUT,
            DEFAULT_READ_TIMEOUT * 4,
            DEFAULT_READ_TIMEOUT * 4
        ]
    );
    assert_eq!(s.read_timeout(), DEFAULT_READ_TIMEOUT);
}

#[test]
fn receive_injects_status_words_for_pin_outcomes() {
    let failed = ccid_const::CCID_COMMAND_FAILED;
    let mut s = session(
        0,
        vec![
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::PIN_CANCELLED, &[]),
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::PIN_TIMEOUT, &[]),
        ],
    );

    let mut rx = [0u8; 8];
    assert_eq!(s.receive(&mut rx, None), Ok(2));
    assert_eq!(&rx[..2], &[0x64, 0x01]);

    assert_eq!(s.receive(&mut rx, None), Ok(2));
    assert_eq!(&rx[..2], &[0x64, 0x00]);
}

#[test]
fn receive_maps_card_side_failures() {
    let failed = ccid_const::CCID_COMMAND_FAILED;
    let failed_absent = failed | ccid_const::CCID_ICC_ABSENT;
    let mut s = session(
        0,
        vec![
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::XFR_PARITY_ERROR, &[]),
            response(ccid_const::RDR_to_PC_DataBlock, failed_absent, ccid_const::ICC_MUTE, &[]),
            response(ccid_const::RDR_to_PC_DataBlock, failed, ccid_const::ICC_MUTE, &[]),
        ],
    );

    let mut rx = [0u8; 8];
    assert_eq!(s.receive(&mut rx, None), Err(IfdError::ParityError));
    assert_eq!(s.receive(&mut rx, None), Err(IfdError::IccNotPresent));
    assert_eq!(s.receive(&mut rx, None), Err(IfdError::Communication));
}

#[test]
fn receive_rejects_a_length_mismatch() {
    // header declares 5 payload bytes, only 2 follow
    let mut frame = encode_command(ccid_const::RDR_to_PC_DataBlock, 0, 0, [0, 0, 0], &[0x90, 0x00]);
    frame[1] = 5;
    let mut s = session(0, vec![Ok(frame)]);

    let mut rx = [0u8; 8];
    assert_eq!(s.receive(&mut rx, None), Err(IfdError::Communication));
}

#[test]
fn receive_surfaces_the_chain_parameter() {
    let mut frame = encode_command(ccid_const::RDR_to_PC_DataBlock, 0, 0, [0, 0, 0], &[0xAB]);
    frame[ccid_const::CHAIN_PARAMETER_OFFSET] = 0x01; // more data to come
    let mut s = session(0, vec![Ok(frame)]);

    let mut rx = [0u8; 8];
    let mut chain = 0u8;
    assert_eq!(s.receive(&mut rx, Some(&mut chain)), Ok(1));
    assert_eq!(chain, 0x01);
}

#[test]
fn xfr_block_rejects_oversized_commands() {
    let mut s = session(ccid_const::CCID_CLASS_SHORT_APDU, vec![]);
    let tx = [0u8; ccid_const::CMD_BUF_SIZE + 1];
    let mut rx = [0u8; 8];
    assert_eq!(s.xfr_block(&tx, &mut rx), Err(IfdError::Communication));
    assert!(s.port().writes.is_empty());
}

#[test]
fn xfr_block_tolerates_scm_bogus_length() {
    let mut s = session(
        ccid_const::CCID_CLASS_SHORT_APDU,
        vec![response(ccid_const::RDR_to_PC_DataBlock, 0, 0, &[0x90, 0x00])],
    );
    s.descriptor_mut().dwMaxCCIDMessageLength = 263;

    // longer than the reader claims to accept, shorter than it really does
    let tx = [0u8; 260];
    let mut rx = [0u8; 8];
    assert_eq!(s.xfr_block(&tx, &mut rx), Ok(2));
}

#[test]
fn escape_replays_once_on_nak() {
    init();
    let mut s = session(
        0,
        vec![
            Err(PortError::CommNak),
            response(ccid_const::RDR_to_PC_Escape, 0, 0, &[0x01]),
        ],
    );

    let mut rx = [0u8; 8];
    assert_eq!(s.escape(&[0x1E], &mut rx, None), Ok(1));

    // the command was written twice, with distinct sequence numbers
    let writes = &s.port().writes;
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0][0], ccid_const::PC_to_RDR_Escape);
    assert_eq!(writes[1][0], ccid_const::PC_to_RDR_Escape);
    assert_ne!(writes[0][6], writes[1][6]);
}

#[test]
fn escape_gives_up_on_a_second_nak() {
    let mut s = session(0, vec![Err(PortError::CommNak), Err(PortError::CommNak)]);
    let mut rx = [0u8; 8];
    assert_eq!(
        s.escape(&[0x1E], &mut rx, None),
        Err(IfdError::Communication)
    );
}

#[test]
fn escape_timeout_override_is_restored() {
    let mut s = session(
        0,
        vec![response(
            ccid_const::RDR_to_PC_Escape,
            ccid_const::CCID_COMMAND_FAILED,
            ccid_const::CMD_NOT_SUPPORTED,
            &[],
        )],
    );

    let mut rx = [0u8; 8];
    let result = s.escape_check(&[0x1E], &mut rx, Some(Duration::from_secs(30)), true);
    assert_eq!(result, Err(IfdError::Communication));
    assert_eq!(s.port().read_timeouts, vec![Duration::from_secs(30)]);
    assert_eq!(s.read_timeout(), DEFAULT_READ_TIMEOUT);
}

#[test]
fn escape_reports_truncation_over_failure() {
    let mut s = session(
        0,
        vec![response(
            ccid_const::RDR_to_PC_Escape,
            ccid_const::CCID_COMMAND_FAILED,
            0x01,
            &[1, 2, 3, 4],
        )],
    );

    let mut rx = [0u8; 2];
    assert_eq!(
        s.escape(&[0x1E], &mut rx, None),
        Err(IfdError::InsufficientBuffer(2))
    );
    assert_eq!(rx, [1, 2]);
}

#[test]
fn set_parameters_distinguishes_unsupported_from_unchangeable() {
    let failed = ccid_const::CCID_COMMAND_FAILED;
    let t1_params = [0x11, 0x10, 0x00, 0x4D, 0x00, 0x14, 0x00];
    let mut s = session(
        0,
        vec![
            response(ccid_const::RDR_to_PC_Parameters, failed, 0x00, &[]),
            response(ccid_const::RDR_to_PC_Parameters, failed, 0x05, &[]),
            response(ccid_const::RDR_to_PC_Parameters, failed, ccid_const::HW_ERROR, &[]),
            response(ccid_const::RDR_to_PC_Parameters, 0, 0, &t1_params),
        ],
    );

    // command not supported at all
    assert_eq!(s.set_parameters(1, &t1_params), Err(IfdError::NotSupported));
    // one parameter is read only: not a failure
    assert_eq!(s.set_parameters(1, &t1_params), Ok(()));
    assert_eq!(s.set_parameters(1, &t1_params), Err(IfdError::Communication));
    assert_eq!(s.set_parameters(1, &t1_params), Ok(()));
}

/// PC/SC Part 10 PIN verification block with a 4 byte APDU.
fn pin_verify_block() -> Vec<u8> {
    let apdu = [0x00u8, 0x20, 0x00, 0x80];
    let mut block = vec![
        0x00, 0x00, 0x82, 0x04, 0x00, // timeouts and format
        0x08, 0x04, // wPINMaxExtraDigit
        0x02, 0x01, // validation condition, number of messages
        0x04, 0x09, // wLangId
        0x00, // bMsgIndex
        0x00, 0x00, 0x00, // bTeoPrologue
    ];
    block.extend_from_slice(&(apdu.len() as u32).to_le_bytes());
    block.extend_from_slice(&apdu);
    block
}

#[test]
fn secure_verify_runs_with_the_pin_entry_timeout() {
    let mut s = session(
        0,
        vec![response(ccid_const::RDR_to_PC_DataBlock, 0, 0, &[0x90, 0x00])],
    );

    let mut rx = [0u8; 8];
    let n = s.secure_pin_verify(&pin_verify_block(), &mut rx).unwrap();
    assert_eq!(&rx[..n], &[0x90, 0x00]);

    // PIN entry waits for the user, not for the card
    assert_eq!(s.port().read_timeouts, vec![Duration::from_secs(90)]);
    assert_eq!(s.read_timeout(), DEFAULT_READ_TIMEOUT);

    let frame = &s.port().writes[0];
    assert_eq!(frame[0], ccid_const::PC_to_RDR_Secure);
    // abData starts with bPINOperation = verification
    assert_eq!(frame[10], 0x00);
}

#[test]
fn secure_verify_timeout_is_restored_on_failure() {
    let mut s = session(
        0,
        vec![response(
            ccid_const::RDR_to_PC_DataBlock,
            ccid_const::CCID_COMMAND_FAILED,
            ccid_const::HW_ERROR,
            &[],
        )],
    );

    let mut rx = [0u8; 8];
    assert_eq!(
        s.secure_pin_verify(&pin_verify_block(), &mut rx),
        Err(IfdError::Communication)
    );
    assert_eq!(s.read_timeout(), DEFAULT_READ_TIMEOUT);
}

#[test]
fn power_off_reports_reader_failures() {
    let mut s = session(
        0,
        vec![
            response(ccid_const::RDR_to_PC_SlotStatus, 0, 0, &[]),
            response(
                ccid_const::RDR_to_PC_SlotStatus,
                ccid_const::CCID_COMMAND_FAILED,
                ccid_const::HW_ERROR,
                &[],
            ),
        ],
    );

    assert_eq!(s.power_off(), Ok(()));
    assert_eq!(s.power_off(), Err(IfdError::Communication));
}

#[test]
fn detach_stops_the_interrupt_pipe() {
    let mut driver: DriverSession<MockPort> = DriverSession::new();
    driver.attach(3, CcidDescriptor::new(0), MockPort::default());
    assert!(driver.is_attached(3));

    let removed = driver.detach(3).unwrap();
    assert!(removed.port().interrupt_stopped);
    assert!(!driver.is_attached(3));
    assert!(driver.detach(3).is_none());
}
