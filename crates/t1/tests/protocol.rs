//! End-to-end protocol scenarios against a simulated chip
//!
//! `SimChip` implements [`Channel`] with a miniature chip-side T=1 state
//! machine: it assembles host chains, serves chunked responses, answers
//! resynchronization and IFS requests, and can inject corruption, silence
//! and supervisory requests to exercise the recovery paths.

use std::collections::VecDeque;
use std::time::Duration;

use selink_core::channel::{Channel, ChannelError};
use selink_core::Error;
use selink_t1::{Block, EdcMode, Link, LinkState, Pcb, RError, SKind, T1Config};

#[derive(Debug)]
struct SimChip {
    edc: EdcMode,
    atr: Vec<u8>,
    respond: fn(&[u8]) -> Vec<u8>,
    /// Chunk size the chip uses for its own responses
    ifs: usize,
    seq_tx: bool,
    seq_rx: bool,
    assembling: Vec<u8>,
    pending: VecDeque<(Vec<u8>, bool)>,
    outgoing: VecDeque<u8>,
    /// Every block the host sent, decoded
    frames_rx: Vec<Block>,
    /// Clean copy of the last emitted frame, replayed on retransmission
    /// requests
    last_tx: Vec<u8>,
    /// Corrupt the EDC of the next n emitted frames
    corrupt_next: usize,
    /// Swallow the next n emitted frames so the host times out
    drop_next: usize,
    /// Request a waiting-time extension before the next response
    wtx_next: Option<u8>,
    /// Request a new IFS before the next response
    ifs_request: Option<u8>,
    /// Reject incoming I-blocks with these R-blocks, front to back
    nack_next: VecDeque<(bool, RError)>,
    /// Largest I-block the chip accepts; anything bigger is rejected
    max_chunk: Option<usize>,
    /// First response chunk is held until the host answers the S request
    deferred: bool,
}

impl SimChip {
    fn new(respond: fn(&[u8]) -> Vec<u8>) -> Self {
        Self {
            edc: EdcMode::Lrc,
            atr: vec![0x3B, 0x00],
            respond,
            ifs: 32,
            seq_tx: false,
            seq_rx: false,
            assembling: Vec::new(),
            pending: VecDeque::new(),
            outgoing: VecDeque::new(),
            frames_rx: Vec::new(),
            last_tx: Vec::new(),
            corrupt_next: 0,
            drop_next: 0,
            wtx_next: None,
            ifs_request: None,
            nack_next: VecDeque::new(),
            max_chunk: None,
            deferred: false,
        }
    }

    fn emit_raw(&mut self, mut frame: Vec<u8>) {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return;
        }
        if self.corrupt_next > 0 {
            self.corrupt_next -= 1;
            if let Some(last) = frame.last_mut() {
                *last ^= 0x01;
            }
        }
        self.outgoing.extend(frame);
    }

    fn emit_block(&mut self, pcb: Pcb, inf: &[u8]) {
        let frame = Block::with_inf(0x21, pcb, inf.to_vec())
            .encode(self.edc)
            .expect("chip frame encodes")
            .to_vec();
        self.last_tx = frame.clone();
        self.emit_raw(frame);
    }

    fn send_next_chunk(&mut self) {
        if let Some((chunk, more)) = self.pending.pop_front() {
            let seq = self.seq_tx;
            self.seq_tx = !self.seq_tx;
            self.emit_block(Pcb::Info { seq, more }, &chunk);
        }
    }

    fn start_response(&mut self) {
        let apdu = std::mem::take(&mut self.assembling);
        let response = (self.respond)(&apdu);
        let chunks: Vec<&[u8]> = response.chunks(self.ifs).collect();
        let count = chunks.len();
        self.pending = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c.to_vec(), i + 1 < count))
            .collect();

        if let Some(mult) = self.wtx_next.take() {
            self.deferred = true;
            self.emit_block(Pcb::Supervisory { response: false, kind: SKind::Wtx }, &[mult]);
        } else if let Some(size) = self.ifs_request.take() {
            self.deferred = true;
            self.emit_block(Pcb::Supervisory { response: false, kind: SKind::Ifs }, &[size]);
        } else {
            self.send_next_chunk();
        }
    }
}

impl Channel for SimChip {
    fn write(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let block = Block::decode(buf, self.edc).expect("host sent a well-formed frame");
        self.frames_rx.push(block.clone());
        match block.pcb {
            Pcb::Info { more, .. } => {
                if let Some((seq, error)) = self.nack_next.pop_front() {
                    self.emit_block(Pcb::ReceiveReady { seq, error }, &[]);
                    return Ok(());
                }
                if self.max_chunk.is_some_and(|max| block.inf.len() > max) {
                    self.emit_block(
                        Pcb::ReceiveReady { seq: self.seq_rx, error: RError::Other },
                        &[],
                    );
                    return Ok(());
                }
                self.assembling.extend_from_slice(&block.inf);
                self.seq_rx = !self.seq_rx;
                if more {
                    self.emit_block(
                        Pcb::ReceiveReady { seq: self.seq_rx, error: RError::None },
                        &[],
                    );
                } else {
                    self.start_response();
                }
            }
            Pcb::ReceiveReady { error: RError::None, .. } => self.send_next_chunk(),
            Pcb::ReceiveReady { .. } => {
                let frame = self.last_tx.clone();
                self.emit_raw(frame);
            }
            Pcb::Supervisory { response: false, kind: SKind::Resync } => {
                self.seq_tx = false;
                self.seq_rx = false;
                self.assembling.clear();
                self.pending.clear();
                self.deferred = false;
                self.emit_block(Pcb::Supervisory { response: true, kind: SKind::Resync }, &[]);
            }
            Pcb::Supervisory { response: false, kind: SKind::Ifs } => {
                let inf = block.inf.to_vec();
                self.emit_block(Pcb::Supervisory { response: true, kind: SKind::Ifs }, &inf);
            }
            Pcb::Supervisory { response: true, .. } => {
                if self.deferred {
                    self.deferred = false;
                    self.send_next_chunk();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), ChannelError> {
        if self.outgoing.len() < buf.len() {
            return Err(ChannelError::Timeout);
        }
        for byte in buf.iter_mut() {
            *byte = self.outgoing.pop_front().ok_or(ChannelError::Timeout)?;
        }
        Ok(())
    }

    fn assert_reset(&mut self) -> Result<(), ChannelError> {
        self.seq_tx = false;
        self.seq_rx = false;
        self.assembling.clear();
        self.pending.clear();
        self.outgoing.clear();
        self.deferred = false;
        let atr = self.atr.clone();
        self.outgoing.extend(atr);
        Ok(())
    }
}

fn status_ok(_: &[u8]) -> Vec<u8> {
    vec![0x90, 0x00]
}

fn echo(apdu: &[u8]) -> Vec<u8> {
    let mut response = apdu.to_vec();
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

fn big_response(_: &[u8]) -> Vec<u8> {
    let mut response: Vec<u8> = (0..100u8).collect();
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

fn setup(chip: SimChip) -> Link<SimChip> {
    let mut link = Link::new(chip, T1Config::default().with_bwt(Duration::from_millis(50)));
    link.reset().expect("reset succeeds");
    link
}

/// Host I-blocks as (seq, more, inf length)
fn host_info_frames(chip: &SimChip) -> Vec<(bool, bool, usize)> {
    chip.frames_rx
        .iter()
        .filter_map(|b| match b.pcb {
            Pcb::Info { seq, more } => Some((seq, more, b.inf.len())),
            _ => None,
        })
        .collect()
}

fn host_r_frames(chip: &SimChip) -> Vec<(bool, RError)> {
    chip.frames_rx
        .iter()
        .filter_map(|b| match b.pcb {
            Pcb::ReceiveReady { seq, error } => Some((seq, error)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_simple_exchange() {
    let mut link = setup(SimChip::new(status_ok));
    let response = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
    assert_eq!(link.state(), LinkState::Idle);

    let chip = link.release();
    assert_eq!(host_info_frames(&chip), vec![(false, false, 4)]);
}

#[test]
fn test_sequence_bits_alternate_across_exchanges() {
    let mut link = setup(SimChip::new(status_ok));
    link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    link.transceive(&[0x00, 0xB0, 0x00, 0x00]).unwrap();
    link.transceive(&[0x00, 0xB0, 0x00, 0x08]).unwrap();

    let chip = link.release();
    let seqs: Vec<bool> = host_info_frames(&chip).iter().map(|f| f.0).collect();
    assert_eq!(seqs, vec![false, true, false]);
}

#[test]
fn test_corrupt_reply_recovered_with_one_retransmission() {
    let mut chip = SimChip::new(status_ok);
    chip.corrupt_next = 1;
    let mut link = setup(chip);

    let response = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);

    let chip = link.release();
    // Exactly one EDC rejection, no more.
    assert_eq!(host_r_frames(&chip), vec![(false, RError::Edc)]);
    assert_eq!(host_info_frames(&chip).len(), 1);
}

#[test]
fn test_persistent_corruption_exhausts_retry_budget() {
    let mut chip = SimChip::new(status_ok);
    // The response and every replay of it arrive corrupted.
    chip.corrupt_next = 4;
    let mut link = setup(chip);

    let err = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
    // The session rolled back and stays usable.
    assert_eq!(link.state(), LinkState::Idle);

    // One I-block plus a rejection per retry, then the fault surfaces.
    {
        let chip = link.release();
        assert_eq!(host_info_frames(&chip).len(), 1);
        assert_eq!(host_r_frames(&chip).len(), 3);
        link = setup(chip);
    }

    // A reset realigns both sides and the exchange goes through.
    let response = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
}

#[test]
fn test_long_apdu_is_chained() {
    let apdu: Vec<u8> = (0..70u8).collect();
    let mut link = setup(SimChip::new(echo));
    let response = link.transceive(&apdu).unwrap();
    assert_eq!(&response[..70], &apdu[..]);
    assert_eq!(&response[70..], &[0x90, 0x00]);

    let chip = link.release();
    let flags: Vec<(bool, usize)> = host_info_frames(&chip)
        .iter()
        .map(|f| (f.1, f.2))
        .collect();
    assert_eq!(flags, vec![(true, 32), (true, 32), (false, 6)]);
}

#[test]
fn test_negative_ack_with_toggled_bit_retransmits() {
    let apdu: Vec<u8> = (0..70u8).collect();
    let mut chip = SimChip::new(echo);
    // The chip rejects the first chunk while already naming the next
    // sequence bit; the toggled bit must not be read as an acknowledgement.
    chip.nack_next.push_back((true, RError::Edc));
    let mut link = setup(chip);

    let response = link.transceive(&apdu).unwrap();
    assert_eq!(&response[..70], &apdu[..]);

    let chip = link.release();
    let frames = host_info_frames(&chip);
    // The rejected chunk goes out again before the chain moves on.
    assert_eq!(
        frames,
        vec![(false, true, 32), (false, true, 32), (true, true, 32), (false, false, 6)]
    );
}

#[test]
fn test_mid_chain_size_rejection_halves_chunks() {
    let apdu: Vec<u8> = (0..70u8).collect();
    let mut chip = SimChip::new(echo);
    chip.max_chunk = Some(16);
    let mut link = setup(chip);

    let response = link.transceive(&apdu).unwrap();
    assert_eq!(&response[..70], &apdu[..]);

    let chip = link.release();
    // The first 32-byte chunk is rejected; the chain restarts it at half
    // the size and keeps that size to the end.
    let lens: Vec<usize> = host_info_frames(&chip).iter().map(|f| f.2).collect();
    assert_eq!(lens, vec![32, 16, 16, 16, 16, 6]);
}

#[test]
fn test_exhausted_rejections_surface_the_cited_cause() {
    let mut chip = SimChip::new(status_ok);
    for _ in 0..4 {
        chip.nack_next.push_back((false, RError::Edc));
    }
    let mut link = setup(chip);

    let err = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
    assert!(matches!(err, Error::Chip(cause) if cause.contains("error-detection")));
    assert_eq!(link.state(), LinkState::Idle);
}

#[test]
fn test_chained_response_is_reassembled() {
    let mut link = setup(SimChip::new(big_response));
    let response = link.transceive(&[0x00, 0xB0, 0x00, 0x00]).unwrap();
    assert_eq!(response.len(), 102);
    assert_eq!(&response[..100], &(0..100u8).collect::<Vec<u8>>()[..]);

    let chip = link.release();
    // 102 bytes at IFS 32 arrive in four blocks; all but the last are
    // acknowledged with an error-free R-block.
    let acks = host_r_frames(&chip);
    assert_eq!(acks.len(), 3);
    assert!(acks.iter().all(|(_, error)| *error == RError::None));
}

#[test]
fn test_waiting_time_extension_is_honored() {
    let mut chip = SimChip::new(status_ok);
    chip.wtx_next = Some(2);
    let mut link = setup(chip);

    let response = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);

    let chip = link.release();
    let granted = chip.frames_rx.iter().any(|b| {
        matches!(b.pcb, Pcb::Supervisory { response: true, kind: SKind::Wtx })
            && b.inf.as_ref() == [2]
    });
    assert!(granted, "host must echo the waiting-time extension");
}

#[test]
fn test_chip_ifs_request_is_honored() {
    let mut chip = SimChip::new(echo);
    chip.ifs_request = Some(16);
    let mut link = setup(chip);

    link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(link.ifsc(), 16);

    // Subsequent chains respect the renegotiated size.
    let apdu: Vec<u8> = (0..40u8).collect();
    link.transceive(&apdu).unwrap();

    let chip = link.release();
    let echoed = chip.frames_rx.iter().any(|b| {
        matches!(b.pcb, Pcb::Supervisory { response: true, kind: SKind::Ifs })
            && b.inf.as_ref() == [16]
    });
    assert!(echoed, "host must echo the IFS adjustment");

    let lens: Vec<usize> = host_info_frames(&chip)
        .iter()
        .skip(1)
        .map(|f| f.2)
        .collect();
    assert_eq!(lens, vec![16, 16, 8]);
}

#[test]
fn test_silent_chip_recovered_through_resynchronization() {
    let mut chip = SimChip::new(status_ok);
    chip.drop_next = 1;
    let mut link = setup(chip);

    let response = link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x90, 0x00]);
    assert_eq!(link.state(), LinkState::Idle);

    let chip = link.release();
    let resyncs = chip
        .frames_rx
        .iter()
        .filter(|b| matches!(b.pcb, Pcb::Supervisory { response: false, kind: SKind::Resync }))
        .count();
    assert_eq!(resyncs, 1);
    // The exchange restarted from sequence zero after the resync.
    assert_eq!(host_info_frames(&chip), vec![(false, false, 4), (false, false, 4)]);
}

#[test]
fn test_set_ifsd_negotiation() {
    let mut link = setup(SimChip::new(status_ok));
    link.set_ifsd(64).unwrap();
    assert_eq!(link.ifsd(), 64);
    assert_eq!(link.state(), LinkState::Idle);

    let chip = link.release();
    let requested = chip.frames_rx.iter().any(|b| {
        matches!(b.pcb, Pcb::Supervisory { response: false, kind: SKind::Ifs })
            && b.inf.as_ref() == [64]
    });
    assert!(requested);
}

#[test]
fn test_reset_restarts_sequence_numbering() {
    let mut link = setup(SimChip::new(status_ok));
    link.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    link.reset().unwrap();
    link.transceive(&[0x00, 0xB0, 0x00, 0x00]).unwrap();

    let chip = link.release();
    let seqs: Vec<bool> = host_info_frames(&chip).iter().map(|f| f.0).collect();
    assert_eq!(seqs, vec![false, false]);
}
