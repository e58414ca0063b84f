//! Core traits and types for secure-element link drivers
//!
//! This crate provides the foundational pieces shared by the selink driver
//! stack for secure-element chips wired to the host over a raw serial link
//! (SPI, I2C or similar):
//!
//! - The [`Channel`] trait, a blocking full-duplex byte transport with a
//!   physical reset line
//! - The [`Error`] taxonomy used by every layer above the channel
//! - A scripted [`channel::mock::MockChannel`] for tests and examples
//!
//! The block protocol itself (ISO/IEC 7816-3 T=1) lives in the `selink-t1`
//! crate; the user-facing session and context surface in `selink`.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod channel;
pub mod error;

pub use channel::{Channel, ChannelError};
pub use error::{Error, ResultExt};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{Bytes, BytesMut, Error, ResultExt};

    pub use crate::channel::{Channel, ChannelError};
}
