//! T=1 block codec
//!
//! A block travels on the wire as `[NAD][PCB][LEN][INF…][EDC]`. The control
//! byte (PCB) is decoded exactly once, here, into a tagged [`Pcb`] variant;
//! everything above this module matches on the tag and never re-inspects raw
//! bits. Error detection is a one-byte XOR LRC or a two-byte CRC-16/X.25
//! trailer, fixed per session.

use bytes::{BufMut, Bytes, BytesMut};
use selink_core::Error;

/// Hard upper bound on the INF field of a single block
///
/// This is a codec-level limit of the length byte (0xFF is reserved),
/// independent of the negotiated IFS.
pub const MAX_INF: usize = 254;

/// Length of the `[NAD][PCB][LEN]` prologue
pub const PROLOGUE_LEN: usize = 3;

/// Error code carried by a receive-ready (R) block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RError {
    /// Error-free: positive acknowledgement
    None,
    /// The acknowledged block failed its error-detection code
    Edc,
    /// Any other receive error
    Other,
}

/// Sub-type of a supervisory (S) block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SKind {
    /// Resynchronization: both sides reset their sequence counters
    Resync,
    /// Information-field-size negotiation
    Ifs,
    /// Abort of the current chain
    Abort,
    /// Waiting-time extension
    Wtx,
}

impl SKind {
    const fn code(self) -> u8 {
        match self {
            Self::Resync => 0,
            Self::Ifs => 1,
            Self::Abort => 2,
            Self::Wtx => 3,
        }
    }
}

/// Decoded protocol control byte
///
/// Classification is a total function over all 256 byte values; patterns the
/// protocol does not define decode as [`Pcb::Unknown`] and their disposal is
/// left to the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pcb {
    /// Information block carrying (part of) an APDU
    Info {
        /// Send-sequence bit N(S)
        seq: bool,
        /// Chaining bit: more blocks of the same APDU follow
        more: bool,
    },
    /// Receive-ready block acknowledging (or rejecting) an I-block
    ReceiveReady {
        /// Sequence bit N(R) of the next expected I-block
        seq: bool,
        /// Error code; [`RError::None`] makes this a positive acknowledgement
        error: RError,
    },
    /// Supervisory block: resynchronization, IFS, abort or waiting-time
    /// extension, as a strict request/response pair
    Supervisory {
        /// Response bit: set on the answering side of the pair
        response: bool,
        /// Sub-type of the supervisory exchange
        kind: SKind,
    },
    /// Bit pattern the protocol does not define
    Unknown(u8),
}

impl Pcb {
    /// Classify a raw control byte
    pub const fn from_byte(byte: u8) -> Self {
        if byte & 0x80 == 0 {
            // I-block: 0b0nm0_0000
            if byte & 0x1F == 0 {
                Self::Info {
                    seq: byte & 0x40 != 0,
                    more: byte & 0x20 != 0,
                }
            } else {
                Self::Unknown(byte)
            }
        } else if byte & 0xC0 == 0x80 {
            // R-block: 0b100n_00ee
            let error = match byte & 0x2F {
                0x00 => RError::None,
                0x01 => RError::Edc,
                0x02 => RError::Other,
                _ => return Self::Unknown(byte),
            };
            Self::ReceiveReady {
                seq: byte & 0x10 != 0,
                error,
            }
        } else {
            // S-block: 0b11rk_kkkk
            let kind = match byte & 0x1F {
                0 => SKind::Resync,
                1 => SKind::Ifs,
                2 => SKind::Abort,
                3 => SKind::Wtx,
                _ => return Self::Unknown(byte),
            };
            Self::Supervisory {
                response: byte & 0x20 != 0,
                kind,
            }
        }
    }

    /// Wire representation of this control byte
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Info { seq, more } => ((seq as u8) << 6) | ((more as u8) << 5),
            Self::ReceiveReady { seq, error } => {
                let code = match error {
                    RError::None => 0,
                    RError::Edc => 1,
                    RError::Other => 2,
                };
                0x80 | ((seq as u8) << 4) | code
            }
            Self::Supervisory { response, kind } => 0xC0 | ((response as u8) << 5) | kind.code(),
            Self::Unknown(byte) => byte,
        }
    }
}

/// Error-detection mode of a session, fixed at setup and never negotiated
/// per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdcMode {
    /// One-byte XOR longitudinal redundancy check (ISO default)
    #[default]
    Lrc,
    /// Two-byte CRC-16/X.25, transmitted least-significant byte first
    Crc,
}

impl EdcMode {
    /// Number of trailer bytes this mode appends to a block
    pub const fn len(self) -> usize {
        match self {
            Self::Lrc => 1,
            Self::Crc => 2,
        }
    }

    /// Compute the EDC over the given prologue + INF bytes
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Self::Lrc => u16::from(lrc(data)),
            Self::Crc => crc16(data),
        }
    }
}

/// XOR of all bytes
fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// CRC-16/X.25: poly 0x1021 reflected, init 0xFFFF, final xor 0xFFFF
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    crc ^ 0xFFFF
}

/// One T=1 protocol block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Node address byte: source in b1-b3, destination in b5-b7
    pub nad: u8,
    /// Decoded control byte
    pub pcb: Pcb,
    /// Information field, bounded by [`MAX_INF`]
    pub inf: Bytes,
}

impl Block {
    /// Create a block with an empty information field
    pub const fn new(nad: u8, pcb: Pcb) -> Self {
        Self {
            nad,
            pcb,
            inf: Bytes::new(),
        }
    }

    /// Create a block carrying an information field
    pub fn with_inf(nad: u8, pcb: Pcb, inf: impl Into<Bytes>) -> Self {
        Self {
            nad,
            pcb,
            inf: inf.into(),
        }
    }

    /// Serialize to wire bytes
    ///
    /// Fails, without writing anything, iff the information field exceeds
    /// [`MAX_INF`].
    pub fn encode(&self, mode: EdcMode) -> Result<Bytes, Error> {
        if self.inf.len() > MAX_INF {
            return Err(Error::InvalidArgument(
                "information field exceeds the protocol maximum",
            ));
        }

        let mut buf = BytesMut::with_capacity(PROLOGUE_LEN + self.inf.len() + mode.len());
        buf.put_u8(self.nad);
        buf.put_u8(self.pcb.to_byte());
        buf.put_u8(self.inf.len() as u8);
        buf.put_slice(&self.inf);

        let edc = mode.compute(&buf);
        match mode {
            EdcMode::Lrc => buf.put_u8(edc as u8),
            EdcMode::Crc => {
                buf.put_u8(edc as u8);
                buf.put_u8((edc >> 8) as u8);
            }
        }

        Ok(buf.freeze())
    }

    /// Parse a complete wire frame
    ///
    /// Reports [`Error::MalformedLength`] when the declared length does not
    /// match the received payload size and [`Error::ChecksumMismatch`] when
    /// the error-detection codes differ. An undefined control byte decodes
    /// as [`Pcb::Unknown`], never as an error.
    pub fn decode(frame: &[u8], mode: EdcMode) -> Result<Self, Error> {
        if frame.len() < PROLOGUE_LEN + mode.len() {
            return Err(Error::MalformedLength {
                declared: frame.get(2).copied().map_or(0, usize::from),
                actual: frame.len().saturating_sub(PROLOGUE_LEN + mode.len()),
            });
        }

        let declared = usize::from(frame[2]);
        let actual = frame.len() - PROLOGUE_LEN - mode.len();
        if declared != actual {
            return Err(Error::MalformedLength { declared, actual });
        }

        let payload_end = PROLOGUE_LEN + declared;
        let expected = mode.compute(&frame[..payload_end]);
        let received = match mode {
            EdcMode::Lrc => u16::from(frame[payload_end]),
            EdcMode::Crc => {
                u16::from(frame[payload_end]) | (u16::from(frame[payload_end + 1]) << 8)
            }
        };
        if expected != received {
            return Err(Error::ChecksumMismatch {
                expected,
                actual: received,
            });
        }

        Ok(Self {
            nad: frame[0],
            pcb: Pcb::from_byte(frame[1]),
            inf: Bytes::copy_from_slice(&frame[PROLOGUE_LEN..payload_end]),
        })
    }
}
