//! ISO 7816-3 T=1 block protocol.
//!
//! Half-duplex exchange of Information, Receive-ready and Supervisory
//! blocks, layered above the command layer's raw transmit/receive
//! primitives. The engine owns block sequencing, chaining, checksums and
//! error recovery; the reader below it only moves opaque blocks.

use crate::error::{IfdError, IfdResult};
use crate::session::CcidSession;
use crate::transport::CcidPort;
use log::{debug, error, info};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/* block kinds, discriminated by the top bits of the PCB */
pub const T1_I_BLOCK: u8 = 0x00;
pub const T1_R_BLOCK: u8 = 0x80;
pub const T1_S_BLOCK: u8 = 0xC0;
pub const T1_MORE_BLOCKS: u8 = 0x20;

/* I block */
const T1_I_SEQ_SHIFT: u8 = 6;

/* R block */
const T1_R_SEQ_SHIFT: u8 = 4;
const T1_EDC_ERROR: u8 = 0x01;
const T1_OTHER_ERROR: u8 = 0x02;

/* S block */
const T1_S_RESPONSE: u8 = 0x20;

/* prologue field offsets */
const NAD: usize = 0;
const PCB: usize = 1;
const LEN: usize = 2;
const DATA: usize = 3;

/* prologue + largest information field + CRC */
const T1_BUFFER_SIZE: usize = 3 + 254 + 2;

/* block resend attempts before escalating to resynchronization */
const MAX_RETRIES: usize = 3;
/* resynchronization rounds before the channel is declared dead */
const MAX_RESYNC: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
enum SBlockType {
    Resync = 0x00,
    Ifs = 0x01,
    Abort = 0x02,
    Wtx = 0x03,
}

/// Internal protocol state. Must never be `Dead` right after init or
/// reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T1ProtocolState {
    Sending,
    Receiving,
    Resynch,
    Dead,
}

/// Trailer protecting every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// XOR of all preceding bytes, 1 byte.
    Lrc,
    /// CRC16, 2 bytes big endian.
    Crc,
}

impl ChecksumKind {
    pub fn rc_bytes(self) -> usize {
        match self {
            ChecksumKind::Lrc => 1,
            ChecksumKind::Crc => 2,
        }
    }
}

fn csum_lrc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn csum_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Typed protocol parameters, set before or during operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T1Param {
    ChecksumLrc,
    ChecksumCrc,
    Ifsc(usize),
    Ifsd(usize),
    State(T1ProtocolState),
    More(bool),
    Nad(u8),
}

/// Raw block exchange the engine runs on: one transmit of a fully built
/// block followed by the read of the card's answer. `wtx` is the waiting
/// time extension multiplier granted to the card for this exchange only
/// (0 or 1 means none).
pub trait T1Link {
    fn exchange(&mut self, block: &[u8], response: &mut [u8], wtx: u8) -> IfdResult<usize>;
}

impl<P: CcidPort> T1Link for CcidSession<P> {
    fn exchange(&mut self, block: &[u8], response: &mut [u8], wtx: u8) -> IfdResult<usize> {
        self.transmit(block, 0, wtx)?;
        let old_timeout = self.read_timeout();
        if wtx > 1 {
            /* the card asked for more time for this block only */
            self.set_read_timeout(old_timeout * u32::from(wtx));
        }
        let result = self.receive(response, None);
        self.set_read_timeout(old_timeout);
        result
    }
}

/// T=1 channel state for one logical unit.
#[derive(Debug)]
pub struct T1State {
    lun: u32,
    state: T1ProtocolState,

    ifsc: usize,
    ifsd: usize,

    nad: u8,

    /// Our send sequence number N(S).
    ns: u8,
    /// Next expected receive sequence number N(R).
    nr: u8,

    /// Pending waiting time extension multiplier, consumed by the next
    /// exchange.
    wtx: u8,

    checksum: ChecksumKind,

    /// More-data bit of the I-block currently in flight.
    more: bool,

    retries: usize,

    /// The last sent R-block, kept for verbatim retransmission.
    previous_block: [u8; 4],
}

impl T1State {
    /// Attach the protocol for one logical unit. The defaults are LRC and
    /// an information field of 32 bytes, as negotiated-free cards expect.
    pub fn new(lun: u32) -> T1State {
        T1State {
            lun,
            state: T1ProtocolState::Sending,
            ifsc: 32,
            ifsd: 32,
            nad: 0,
            ns: 0,
            nr: 0,
            wtx: 0,
            checksum: ChecksumKind::Lrc,
            more: false,
            retries: MAX_RETRIES,
            previous_block: [0; 4],
        }
    }

    /// Back to the post-attach state, sequence numbers included.
    pub fn reset(&mut self) {
        self.state = T1ProtocolState::Sending;
        self.ns = 0;
        self.nr = 0;
        self.wtx = 0;
        self.more = false;
    }

    pub fn state(&self) -> T1ProtocolState {
        self.state
    }

    pub fn lun(&self) -> u32 {
        self.lun
    }

    pub fn ifsc(&self) -> usize {
        self.ifsc
    }

    pub fn ifsd(&self) -> usize {
        self.ifsd
    }

    pub fn set_param(&mut self, param: T1Param) {
        match param {
            T1Param::ChecksumLrc => self.checksum = ChecksumKind::Lrc,
            T1Param::ChecksumCrc => self.checksum = ChecksumKind::Crc,
            T1Param::Ifsc(value) => self.ifsc = value,
            T1Param::Ifsd(value) => self.ifsd = value,
            T1Param::State(state) => self.state = state,
            T1Param::More(more) => self.more = more,
            T1Param::Nad(nad) => self.nad = nad,
        }
    }

    fn block_type(pcb: u8) -> u8 {
        match pcb & 0xC0 {
            T1_R_BLOCK => T1_R_BLOCK,
            T1_S_BLOCK => T1_S_BLOCK,
            _ => T1_I_BLOCK,
        }
    }

    fn seq_of(pcb: u8) -> u8 {
        match Self::block_type(pcb) {
            T1_R_BLOCK => (pcb >> T1_R_SEQ_SHIFT) & 1,
            _ => (pcb >> T1_I_SEQ_SHIFT) & 1,
        }
    }

    fn i_pcb(&self) -> u8 {
        let mut pcb = T1_I_BLOCK | (self.ns << T1_I_SEQ_SHIFT);
        if self.more {
            pcb |= T1_MORE_BLOCKS;
        }
        pcb
    }

    fn r_pcb(&self, error: u8) -> u8 {
        T1_R_BLOCK | (self.nr << T1_R_SEQ_SHIFT) | error
    }

    /// Build one outbound block: prologue, data, trailer. The last sent
    /// R-block is cached for verbatim retransmission.
    fn build(&mut self, pcb: u8, data: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(DATA + data.len() + 2);
        block.resize(DATA, 0);
        block[NAD] = self.nad;
        block[PCB] = pcb;
        block[LEN] = data.len() as u8;
        block.extend_from_slice(data);
        match self.checksum {
            ChecksumKind::Lrc => {
                let lrc = csum_lrc(&block);
                block.push(lrc);
            }
            ChecksumKind::Crc => {
                let crc = csum_crc(&block);
                block.extend_from_slice(&crc.to_be_bytes());
            }
        }
        if Self::block_type(pcb) == T1_R_BLOCK {
            /* a CRC trailer does not fit the cache; the prologue does, and
             * is enough to rebuild the block */
            let cached = block.len().min(self.previous_block.len());
            self.previous_block[..cached].copy_from_slice(&block[..cached]);
        }
        block
    }

    /// Resend the last R-block, from the cache when it holds the complete
    /// block (a CRC trailer does not fit it).
    fn resend_previous(&mut self) -> Vec<u8> {
        let pcb = self.previous_block[PCB];
        if Self::block_type(pcb) == T1_R_BLOCK && self.checksum.rc_bytes() == 1 {
            return self.previous_block.to_vec();
        }
        self.build(pcb, &[])
    }

    fn verify_checksum(&self, block: &[u8]) -> bool {
        let rc = self.checksum.rc_bytes();
        if block.len() < DATA + rc {
            return false;
        }
        if block.len() != DATA + block[LEN] as usize + rc {
            return false;
        }
        match self.checksum {
            ChecksumKind::Lrc => csum_lrc(&block[..block.len() - 1]) == block[block.len() - 1],
            ChecksumKind::Crc => {
                let received =
                    u16::from_be_bytes([block[block.len() - 2], block[block.len() - 1]]);
                csum_crc(&block[..block.len() - 2]) == received
            }
        }
    }

    /// Exchange one logical APDU with the card: send `snd` (chained over
    /// as many I-blocks as IFSC requires), accumulate the possibly chained
    /// response into `rcv` and return its length.
    pub fn transceive<L: T1Link>(
        &mut self,
        link: &mut L,
        snd: &[u8],
        rcv: &mut [u8],
    ) -> IfdResult<usize> {
        if self.state == T1ProtocolState::Dead {
            error!("lun {}: T=1 channel is dead", self.lun);
            return Err(IfdError::Communication);
        }

        self.state = T1ProtocolState::Sending;
        self.more = snd.len() > self.ifsc;
        let mut sent = 0usize;
        let mut window = snd.len().min(self.ifsc);
        let mut retries = self.retries;
        let mut resyncs = MAX_RESYNC;
        let mut assembled: Vec<u8> = Vec::new();

        let mut block = self.build(self.i_pcb(), &snd[..window]);

        let result = loop {
            if retries == 0 {
                if resyncs == 0 {
                    error!("lun {}: too many errors, channel is dead", self.lun);
                    self.state = T1ProtocolState::Dead;
                    break Err(IfdError::Communication);
                }
                resyncs -= 1;
                match self.resynchronize(link) {
                    Ok(()) => {
                        /* sequence numbers are reset: resend from the start
                         * and throw away whatever we had assembled */
                        assembled.clear();
                        retries = self.retries;
                        sent = 0;
                        window = snd.len().min(self.ifsc);
                        self.more = snd.len() > self.ifsc;
                        block = self.build(self.i_pcb(), &snd[..window]);
                    }
                    Err(e) => break Err(e),
                }
            }

            let mut resp = [0u8; T1_BUFFER_SIZE];
            let wtx = std::mem::take(&mut self.wtx);
            let n = match link.exchange(&block, &mut resp, wtx) {
                Ok(n) => n,
                Err(IfdError::ParityError) => {
                    debug!("lun {}: parity error, requesting retransmission", self.lun);
                    retries -= 1;
                    block = self.build(self.r_pcb(T1_EDC_ERROR), &[]);
                    continue;
                }
                Err(IfdError::NoSuchDevice) => {
                    self.state = T1ProtocolState::Dead;
                    break Err(IfdError::NoSuchDevice);
                }
                Err(e) => {
                    self.state = T1ProtocolState::Dead;
                    break Err(e);
                }
            };
            let resp = &resp[..n];

            if !self.verify_checksum(resp) {
                debug!("lun {}: block checksum failed", self.lun);
                retries -= 1;
                block = self.build(self.r_pcb(T1_EDC_ERROR), &[]);
                continue;
            }

            let pcb = resp[PCB];
            match Self::block_type(pcb) {
                T1_R_BLOCK => {
                    if resp[LEN] != 0 {
                        debug!("lun {}: R-block with a data field", self.lun);
                        retries -= 1;
                        block = self.build(self.r_pcb(T1_OTHER_ERROR), &[]);
                        continue;
                    }

                    if pcb & 0x0F == T1_EDC_ERROR || pcb & 0x0F == T1_OTHER_ERROR {
                        debug!("lun {}: R-block reports error 0x{:02X}", self.lun, pcb & 0x0F);
                        retries -= 1;
                        block = if self.state == T1ProtocolState::Receiving {
                            self.resend_previous()
                        } else {
                            /* resend the I-block in flight, bytes unchanged */
                            self.build(self.i_pcb(), &snd[sent..sent + window])
                        };
                        continue;
                    }

                    if self.state == T1ProtocolState::Receiving {
                        /* the card should be sending an I-block by now;
                         * repeat our request */
                        retries -= 1;
                        block = self.resend_previous();
                        continue;
                    }

                    if Self::seq_of(pcb) != self.ns && self.more {
                        /* our I-block is acknowledged, send the next part
                         * of the chain */
                        self.ns ^= 1;
                        sent += window;
                        window = (snd.len() - sent).min(self.ifsc);
                        self.more = snd.len() - sent > self.ifsc;
                        retries = self.retries;
                        block = self.build(self.i_pcb(), &snd[sent..sent + window]);
                        continue;
                    }

                    /* the card wants the same block again */
                    debug!("lun {}: retransmission requested", self.lun);
                    retries -= 1;
                    block = self.build(self.i_pcb(), &snd[sent..sent + window]);
                    continue;
                }

                T1_S_BLOCK => {
                    let request = pcb & T1_S_RESPONSE == 0;
                    match (request, SBlockType::from_u8(pcb & 0x0F)) {
                        (true, Some(SBlockType::Ifs)) if resp[LEN] == 1 => {
                            let ifsc = resp[DATA];
                            debug!("lun {}: IFSC adjusted to {}", self.lun, ifsc);
                            self.ifsc = ifsc as usize;
                            block = self.build(
                                T1_S_BLOCK | T1_S_RESPONSE | SBlockType::Ifs as u8,
                                &[ifsc],
                            );
                            continue;
                        }
                        (true, Some(SBlockType::Wtx)) if resp[LEN] == 1 => {
                            let multiplier = resp[DATA];
                            debug!(
                                "lun {}: waiting time extension x{} requested",
                                self.lun, multiplier
                            );
                            /* grant it for the next exchange only */
                            self.wtx = multiplier;
                            block = self.build(
                                T1_S_BLOCK | T1_S_RESPONSE | SBlockType::Wtx as u8,
                                &[multiplier],
                            );
                            continue;
                        }
                        (true, Some(SBlockType::Abort)) => {
                            info!("lun {}: abort requested by the card", self.lun);
                            let ack = self.build(
                                T1_S_BLOCK | T1_S_RESPONSE | SBlockType::Abort as u8,
                                &[],
                            );
                            let mut scratch = [0u8; T1_BUFFER_SIZE];
                            let _ = link.exchange(&ack, &mut scratch, 0);
                            break Err(IfdError::Communication);
                        }
                        _ => {
                            /* a resync request from the card, an
                             * unsolicited response or a malformed block */
                            debug!("lun {}: unexpected S-block 0x{:02X}", self.lun, pcb);
                            retries -= 1;
                            block = self.build(self.r_pcb(T1_OTHER_ERROR), &[]);
                            continue;
                        }
                    }
                }

                /* I block */
                _ => {
                    if self.state == T1ProtocolState::Sending {
                        if self.more {
                            debug!(
                                "lun {}: I-block received while the chain is not finished",
                                self.lun
                            );
                            retries -= 1;
                            block = self.build(self.r_pcb(T1_OTHER_ERROR), &[]);
                            continue;
                        }
                        /* implicit acknowledgment of our last I-block */
                        self.ns ^= 1;
                        self.state = T1ProtocolState::Receiving;
                    }

                    if Self::seq_of(pcb) != self.nr {
                        debug!("lun {}: I-block out of sequence", self.lun);
                        retries -= 1;
                        block = self.build(self.r_pcb(T1_OTHER_ERROR), &[]);
                        continue;
                    }

                    retries = self.retries;
                    self.nr ^= 1;
                    let dlen = resp[LEN] as usize;
                    assembled.extend_from_slice(&resp[DATA..DATA + dlen]);

                    if pcb & T1_MORE_BLOCKS != 0 {
                        /* ask for the next part of the chained response */
                        block = self.build(self.r_pcb(0), &[]);
                        continue;
                    }

                    break Ok(());
                }
            }
        };

        result?;

        let len = assembled.len().min(rcv.len());
        rcv[..len].copy_from_slice(&assembled[..len]);
        if assembled.len() > rcv.len() {
            error!(
                "lun {}: receive buffer too small ({} < {})",
                self.lun,
                rcv.len(),
                assembled.len()
            );
            return Err(IfdError::InsufficientBuffer(len));
        }
        Ok(len)
    }

    /// Send S(RESYNC) until the card acknowledges, then restart with fresh
    /// sequence numbers. Failure leaves the channel dead.
    fn resynchronize<L: T1Link>(&mut self, link: &mut L) -> IfdResult<()> {
        self.state = T1ProtocolState::Resynch;
        info!("lun {}: resynchronization", self.lun);

        for _ in 0..MAX_RESYNC {
            let block = self.build(T1_S_BLOCK | SBlockType::Resync as u8, &[]);
            let mut resp = [0u8; T1_BUFFER_SIZE];
            let n = match link.exchange(&block, &mut resp, 0) {
                Ok(n) => n,
                Err(IfdError::NoSuchDevice) => {
                    self.state = T1ProtocolState::Dead;
                    return Err(IfdError::NoSuchDevice);
                }
                Err(_) => continue,
            };
            if !self.verify_checksum(&resp[..n]) {
                continue;
            }
            if resp[PCB] == T1_S_BLOCK | T1_S_RESPONSE | SBlockType::Resync as u8
                && resp[LEN] == 0
            {
                self.ns = 0;
                self.nr = 0;
                self.more = false;
                self.state = T1ProtocolState::Sending;
                return Ok(());
            }
        }

        error!("lun {}: resynchronization failed", self.lun);
        self.state = T1ProtocolState::Dead;
        Err(IfdError::Communication)
    }

    /// Propose our IFSD to the card with an S(IFS) request. Returns the
    /// value the card granted.
    pub fn negotiate_ifsd<L: T1Link>(&mut self, link: &mut L, ifsd: usize) -> IfdResult<usize> {
        for _ in 0..self.retries {
            let block = self.build(T1_S_BLOCK | SBlockType::Ifs as u8, &[ifsd as u8]);
            let mut resp = [0u8; T1_BUFFER_SIZE];
            let n = match link.exchange(&block, &mut resp, 0) {
                Ok(n) => n,
                Err(IfdError::NoSuchDevice) => return Err(IfdError::NoSuchDevice),
                Err(_) => continue,
            };
            let resp = &resp[..n];
            if !self.verify_checksum(resp) {
                continue;
            }
            if resp[PCB] == T1_S_BLOCK | T1_S_RESPONSE | SBlockType::Ifs as u8 && resp[LEN] == 1
            {
                self.ifsd = resp[DATA] as usize;
                return Ok(self.ifsd);
            }
        }

        error!("lun {}: IFSD negotiation failed", self.lun);
        Err(IfdError::Communication)
    }
}
