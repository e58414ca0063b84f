//! ISO/IEC 7816-3 T=1 block protocol engine
//!
//! This crate implements the half-duplex block transmission protocol used to
//! carry APDUs between a host and a secure-element chip over a raw serial
//! link. It covers:
//!
//! - The block codec: framing `[NAD][PCB][LEN][INF…][EDC]` with an XOR LRC
//!   or CRC-16/X.25 error-detection trailer ([`block`])
//! - Answer-to-reset retrieval after a physical reset pulse ([`atr`])
//! - Chaining: splitting long APDUs into IFS-bounded I-blocks and
//!   reassembling chained responses ([`chain`])
//! - The link state machine: sequence numbering, acknowledgement,
//!   retransmission, resynchronization, waiting-time extension and IFS
//!   negotiation ([`link`])
//!
//! The engine is transport-agnostic: it drives any
//! [`selink_core::Channel`]. The user-facing session and context surface
//! lives in the `selink` crate.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod atr;
pub mod block;
pub mod chain;
pub mod link;

pub use atr::MAX_ATR_LEN;
pub use block::{Block, EdcMode, MAX_INF, Pcb, RError, SKind};
pub use link::{Link, LinkState, T1Config};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::block::{Block, EdcMode, Pcb};
    pub use crate::link::{Link, LinkState, T1Config};
    pub use selink_core::prelude::*;
}
