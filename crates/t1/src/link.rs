//! T=1 link state machine
//!
//! [`Link`] drives a [`Channel`] through the half-duplex block protocol:
//! it owns the sequence counters, the negotiated information-field sizes and
//! the retry budget, and turns one `transceive` call into the full exchange
//! of I-, R- and S-blocks the protocol requires. Transport faults inside an
//! exchange are recovered with retransmission requests; a silent chip is
//! recovered through resynchronization; both draw from the same bounded
//! retry budget so no fault pattern can loop forever.

use std::time::Duration;

use bytes::Bytes;
use selink_core::{Channel, ChannelError, Error};
use tracing::{debug, trace};

use crate::atr;
use crate::block::{Block, EdcMode, MAX_INF, Pcb, RError, SKind};
use crate::chain::{Assembler, Chunker};

/// Configuration for a T=1 link
///
/// All values have protocol defaults; override them with the `with_*`
/// builder methods before handing the configuration to [`Link::new`].
#[derive(Debug, Clone)]
pub struct T1Config {
    edc_mode: EdcMode,
    ifsc: u8,
    ifsd: u8,
    bwt: Duration,
    atr_timeout: Duration,
    retries: u8,
}

impl Default for T1Config {
    fn default() -> Self {
        Self {
            edc_mode: EdcMode::Lrc,
            ifsc: 32,
            ifsd: 32,
            bwt: Duration::from_millis(300),
            atr_timeout: Duration::from_secs(1),
            retries: 3,
        }
    }
}

impl T1Config {
    /// Create a configuration with protocol defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the error-detection mode used for every block of the session
    pub const fn with_edc_mode(mut self, mode: EdcMode) -> Self {
        self.edc_mode = mode;
        self
    }

    /// Set the initial information field size of the chip
    pub const fn with_ifsc(mut self, ifsc: u8) -> Self {
        self.ifsc = ifsc;
        self
    }

    /// Set the initial information field size of the host
    pub const fn with_ifsd(mut self, ifsd: u8) -> Self {
        self.ifsd = ifsd;
        self
    }

    /// Set the block waiting time: how long the chip may stay silent
    pub const fn with_bwt(mut self, bwt: Duration) -> Self {
        self.bwt = bwt;
        self
    }

    /// Set the deadline for the answer to reset
    pub const fn with_atr_timeout(mut self, timeout: Duration) -> Self {
        self.atr_timeout = timeout;
        self
    }

    /// Set the retry budget of a single exchange
    pub const fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// Error-detection mode of the session
    pub const fn edc_mode(&self) -> EdcMode {
        self.edc_mode
    }

    /// Initial information field size of the chip
    pub const fn ifsc(&self) -> u8 {
        self.ifsc
    }

    /// Initial information field size of the host
    pub const fn ifsd(&self) -> u8 {
        self.ifsd
    }

    /// Block waiting time
    pub const fn bwt(&self) -> Duration {
        self.bwt
    }

    /// Deadline for the answer to reset
    pub const fn atr_timeout(&self) -> Duration {
        self.atr_timeout
    }

    /// Retry budget of a single exchange
    pub const fn retries(&self) -> u8 {
        self.retries
    }
}

/// Lifecycle state of a [`Link`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The channel has been released; the link no longer exchanges
    Closed,
    /// Reset pulse sent, answer to reset not yet received
    AwaitingAtr,
    /// Ready for an exchange
    Idle,
    /// An exchange is in progress
    Exchanging,
    /// A resynchronization is in progress
    Resynchronizing,
    /// A reset did not complete; another reset is required
    Failed,
}

/// A T=1 link over a byte channel
///
/// The link is strictly half-duplex and synchronous: every method completes
/// the full block exchange before returning. A fresh link starts in
/// [`LinkState::Idle`] and is immediately ready to exchange; no answer to
/// reset is fetched until the caller asks for one via
/// [`reset`](Self::reset). A failed exchange rolls the sequence state back
/// to its value at the start of the call and returns the link to `Idle`, so
/// the session stays usable for further exchanges; only a failed reset
/// leaves the link in [`LinkState::Failed`] until a reset succeeds.
#[derive(Debug)]
pub struct Link<C: Channel> {
    channel: C,
    config: T1Config,
    state: LinkState,
    nad_tx: u8,
    nad_rx: u8,
    ns: bool,
    nr: bool,
    ifsc: usize,
    ifsd: usize,
    atr: Vec<u8>,
}

impl<C: Channel> Link<C> {
    /// Create a link over `channel` with the default host/chip addressing
    pub fn new(channel: C, config: T1Config) -> Self {
        let ifsc = usize::from(config.ifsc);
        let ifsd = usize::from(config.ifsd);
        let mut link = Self {
            channel,
            config,
            state: LinkState::Idle,
            nad_tx: 0,
            nad_rx: 0,
            ns: false,
            nr: false,
            ifsc,
            ifsd,
            atr: Vec::new(),
        };
        link.bind(0x2, 0x1);
        link
    }

    /// Set the node addresses carried by every block
    ///
    /// `sad` is the host's address, `dad` the chip's; only the low three
    /// bits of each are significant.
    pub fn bind(&mut self, sad: u8, dad: u8) {
        self.nad_tx = ((dad & 0x7) << 4) | (sad & 0x7);
        self.nad_rx = ((sad & 0x7) << 4) | (dad & 0x7);
    }

    /// Current lifecycle state
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Answer to reset captured by the last [`reset`](Self::reset)
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Information field size the chip currently accepts
    pub const fn ifsc(&self) -> usize {
        self.ifsc
    }

    /// Information field size the host currently advertises
    pub const fn ifsd(&self) -> usize {
        self.ifsd
    }

    /// Configuration the link was created with
    pub const fn config(&self) -> &T1Config {
        &self.config
    }

    /// Release the link and recover the underlying channel
    pub fn release(self) -> C {
        self.channel
    }

    /// Pulse the chip's reset line and capture its answer to reset
    ///
    /// Resets the sequence counters and renegotiated field sizes to their
    /// configured values, clearing any previous failure.
    pub fn reset(&mut self) -> Result<&[u8], Error> {
        self.channel.assert_reset()?;
        self.state = LinkState::AwaitingAtr;
        match atr::read_atr(&mut self.channel, self.config.atr_timeout) {
            Ok(bytes) => {
                self.atr = bytes;
                self.ns = false;
                self.nr = false;
                self.ifsc = usize::from(self.config.ifsc);
                self.ifsd = usize::from(self.config.ifsd);
                self.state = LinkState::Idle;
                debug!(atr = %hex::encode(&self.atr), "link reset");
                Ok(&self.atr)
            }
            Err(e) => {
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    /// Advertise a new host-side information field size to the chip
    pub fn set_ifsd(&mut self, ifsd: u8) -> Result<(), Error> {
        if ifsd == 0 || usize::from(ifsd) > MAX_INF {
            return Err(Error::InvalidArgument(
                "information field size must be between 1 and 254",
            ));
        }
        self.ensure_idle()?;
        self.state = LinkState::Exchanging;
        match self.negotiate_ifsd(ifsd) {
            Ok(()) => {
                self.ifsd = usize::from(ifsd);
                self.state = LinkState::Idle;
                debug!(ifsd, "host information field size advertised");
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Idle;
                Err(e)
            }
        }
    }

    /// Send one APDU and return the chip's reassembled response
    ///
    /// Chains the APDU over as many I-blocks as the chip's information field
    /// size requires and reassembles a chained response transparently. On
    /// error the sequence bits roll back to their value before the call and
    /// the link returns to [`LinkState::Idle`]; a renegotiated IFS sticks,
    /// since that exchange completed.
    #[tracing::instrument(level = "trace", skip_all, fields(len = apdu.len()))]
    pub fn transceive(&mut self, apdu: &[u8]) -> Result<Bytes, Error> {
        if apdu.is_empty() {
            return Err(Error::InvalidArgument("cannot transmit an empty APDU"));
        }
        self.ensure_idle()?;
        self.state = LinkState::Exchanging;
        let (ns, nr) = (self.ns, self.nr);
        match self.run_exchange(apdu) {
            Ok(response) => {
                self.state = LinkState::Idle;
                Ok(response)
            }
            Err(e) => {
                self.ns = ns;
                self.nr = nr;
                self.state = LinkState::Idle;
                Err(e)
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        match self.state {
            LinkState::Idle => Ok(()),
            LinkState::Closed => Err(Error::InvalidArgument("link is closed")),
            LinkState::Failed => Err(Error::InvalidArgument(
                "link requires a reset after a failure",
            )),
            LinkState::AwaitingAtr | LinkState::Exchanging | LinkState::Resynchronizing => {
                Err(Error::Other("link is busy"))
            }
        }
    }

    /// Full exchange with resynchronization on silence
    ///
    /// Transport faults inside an attempt are recovered with retransmission
    /// requests; only a block waiting time expiry reaches this level, where
    /// it costs one retry and restarts the exchange after a resync.
    fn run_exchange(&mut self, apdu: &[u8]) -> Result<Bytes, Error> {
        let mut retries = self.config.retries;
        loop {
            match self.run_exchange_once(apdu, &mut retries) {
                Err(Error::Timeout) => {
                    consume_retry(&mut retries, Error::Timeout)?;
                    self.resynchronize()?;
                }
                other => return other,
            }
        }
    }

    fn run_exchange_once(&mut self, apdu: &[u8], retries: &mut u8) -> Result<Bytes, Error> {
        let mut chunker = Chunker::new(apdu, self.ifsc);
        let first = loop {
            let Some((chunk, more)) = chunker.peek() else {
                return Err(Error::Other("no data left to transmit"));
            };
            let block = Block::with_inf(
                self.nad_tx,
                Pcb::Info { seq: self.ns, more },
                Bytes::copy_from_slice(chunk),
            );
            self.send_block(&block)?;

            let reply = self.read_reply(retries)?;
            match reply.pcb {
                Pcb::ReceiveReady { seq, error } => {
                    // Only an error-free R-block naming the next bit is an
                    // acknowledgement; a negative R-block asks for a
                    // retransmission whatever bit it carries.
                    if error == RError::None && seq != self.ns && more {
                        self.ns = !self.ns;
                        chunker.advance(chunk.len());
                        continue;
                    }
                    // A non-EDC rejection mid-chain means the chip cannot
                    // take blocks this large.
                    if error == RError::Other && more {
                        chunker.halve();
                        debug!(size = chunker.size(), "chunk size halved after rejection");
                    }
                    let fault = match error {
                        RError::None => Error::SequenceError {
                            expected: u8::from(!self.ns),
                            actual: u8::from(seq),
                        },
                        RError::Edc => {
                            Error::Chip("chip rejected the block citing an error-detection fault")
                        }
                        RError::Other => {
                            Error::Chip("chip rejected the block citing a receive error")
                        }
                    };
                    consume_retry(retries, fault)?;
                }
                Pcb::Info { .. } if more => {
                    return Err(Error::Chip("chip responded before the chain completed"));
                }
                Pcb::Info { .. } => {
                    // The response implicitly acknowledges our final block.
                    self.ns = !self.ns;
                    break reply;
                }
                _ => return Err(Error::Chip("unexpected block during transmission")),
            }
        };
        self.receive_chained(first, retries)
    }

    /// Receive the chip's possibly chained response, first block in hand
    fn receive_chained(&mut self, first: Block, retries: &mut u8) -> Result<Bytes, Error> {
        let mut assembler = Assembler::new();
        let mut block = first;
        loop {
            let Pcb::Info { seq, more } = block.pcb else {
                return Err(Error::Chip("expected an information block"));
            };
            if seq != self.nr {
                consume_retry(
                    retries,
                    Error::SequenceError {
                        expected: u8::from(self.nr),
                        actual: u8::from(seq),
                    },
                )?;
                self.send_r(RError::Other)?;
                block = self.read_reply(retries)?;
                continue;
            }
            assembler.push(&block.inf);
            self.nr = !self.nr;
            if !more {
                break;
            }
            self.send_r(RError::None)?;
            block = self.read_reply(retries)?;
        }
        Ok(assembler.finish())
    }

    /// Read the next block meant for this exchange
    ///
    /// Decode faults cost a retry and trigger a retransmission request.
    /// Supervisory requests from the chip (waiting-time extension, IFS
    /// adjustment, abort) are answered here and never surface to the
    /// exchange logic; a waiting time expiry is propagated for the
    /// resynchronization path to handle.
    fn read_reply(&mut self, retries: &mut u8) -> Result<Block, Error> {
        let mut wait = self.config.bwt;
        loop {
            let block = match self.read_block(wait) {
                Ok(block) => block,
                Err(e) if e.is_transient() && !matches!(e, Error::Timeout) => {
                    let code = if matches!(e, Error::ChecksumMismatch { .. }) {
                        RError::Edc
                    } else {
                        RError::Other
                    };
                    consume_retry(retries, e)?;
                    self.send_r(code)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if block.nad != self.nad_rx {
                return Err(Error::Chip("block addressed to a foreign node"));
            }

            match block.pcb {
                Pcb::Supervisory { response: false, kind: SKind::Wtx } => {
                    let mult = block.inf.first().copied().unwrap_or(1).max(1);
                    self.send_s(true, SKind::Wtx, block.inf.clone())?;
                    wait = self.config.bwt * u32::from(mult);
                    debug!(multiplier = mult, "waiting-time extension granted");
                }
                Pcb::Supervisory { response: false, kind: SKind::Ifs } => {
                    match block.inf.first().copied() {
                        Some(size) if block.inf.len() == 1 && usize::from(size) <= MAX_INF && size > 0 => {
                            self.ifsc = usize::from(size);
                            self.send_s(true, SKind::Ifs, block.inf.clone())?;
                            debug!(ifsc = size, "chip adjusted its information field size");
                        }
                        _ => {
                            consume_retry(retries, Error::Chip("malformed IFS request"))?;
                            self.send_r(RError::Other)?;
                        }
                    }
                }
                Pcb::Supervisory { response: false, kind: SKind::Abort } => {
                    self.send_s(true, SKind::Abort, Bytes::new())?;
                    return Err(Error::Chip("chip aborted the exchange"));
                }
                Pcb::Unknown(_) | Pcb::Supervisory { .. } => {
                    consume_retry(retries, Error::Chip("undefined or unsolicited block"))?;
                    self.send_r(RError::Other)?;
                }
                Pcb::Info { .. } | Pcb::ReceiveReady { .. } => return Ok(block),
            }
        }
    }

    /// One-shot resynchronization after the chip went silent
    ///
    /// On success both sides start over with sequence number zero and the
    /// configured field sizes; any other outcome fails the exchange outright.
    fn resynchronize(&mut self) -> Result<(), Error> {
        self.state = LinkState::Resynchronizing;
        debug!("resynchronizing the link");
        self.send_s(false, SKind::Resync, Bytes::new())?;
        let block = self.read_block(self.config.bwt)?;
        if block.nad != self.nad_rx {
            return Err(Error::Chip("block addressed to a foreign node"));
        }
        match block.pcb {
            Pcb::Supervisory { response: true, kind: SKind::Resync } => {
                self.ns = false;
                self.nr = false;
                self.ifsc = usize::from(self.config.ifsc);
                self.state = LinkState::Exchanging;
                Ok(())
            }
            _ => Err(Error::Chip("chip did not answer the resynchronization request")),
        }
    }

    fn negotiate_ifsd(&mut self, ifsd: u8) -> Result<(), Error> {
        let mut retries = self.config.retries;
        loop {
            self.send_s(false, SKind::Ifs, Bytes::copy_from_slice(&[ifsd]))?;
            match self.read_block(self.config.bwt) {
                Ok(block)
                    if block.nad == self.nad_rx
                        && matches!(
                            block.pcb,
                            Pcb::Supervisory { response: true, kind: SKind::Ifs }
                        )
                        && block.inf.as_ref() == [ifsd] =>
                {
                    return Ok(());
                }
                Ok(_) => {
                    consume_retry(&mut retries, Error::Chip("unexpected answer to IFS negotiation"))?;
                }
                Err(e) if e.is_transient() => consume_retry(&mut retries, e)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn send_block(&mut self, block: &Block) -> Result<(), Error> {
        let frame = block.encode(self.config.edc_mode)?;
        trace!(frame = %hex::encode(&frame), "tx");
        self.channel.write(&frame)?;
        Ok(())
    }

    fn send_r(&mut self, error: RError) -> Result<(), Error> {
        self.send_block(&Block::new(
            self.nad_tx,
            Pcb::ReceiveReady { seq: self.nr, error },
        ))
    }

    fn send_s(&mut self, response: bool, kind: SKind, inf: Bytes) -> Result<(), Error> {
        self.send_block(&Block::with_inf(
            self.nad_tx,
            Pcb::Supervisory { response, kind },
            inf,
        ))
    }

    /// Read one complete frame: prologue first, then the length it declares
    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let mut frame = vec![0u8; crate::block::PROLOGUE_LEN];
        self.channel.read(&mut frame, timeout).map_err(read_err)?;
        let declared = usize::from(frame[2]);
        if declared > MAX_INF {
            return Err(Error::MalformedLength { declared, actual: 0 });
        }
        let total = frame.len() + declared + self.config.edc_mode.len();
        frame.resize(total, 0);
        self.channel
            .read(&mut frame[crate::block::PROLOGUE_LEN..], timeout)
            .map_err(read_err)?;
        trace!(frame = %hex::encode(&frame), "rx");
        Ok(frame)
    }

    fn read_block(&mut self, timeout: Duration) -> Result<Block, Error> {
        let frame = self.read_frame(timeout)?;
        Block::decode(&frame, self.config.edc_mode)
    }
}

/// Spend one retry, or surface `fault` once the budget is gone
fn consume_retry(retries: &mut u8, fault: Error) -> Result<(), Error> {
    if *retries == 0 {
        return Err(fault);
    }
    *retries -= 1;
    Ok(())
}

fn read_err(e: ChannelError) -> Error {
    match e {
        ChannelError::Timeout => Error::Timeout,
        other => Error::Channel(other),
    }
}
