//! High-level driver for secure-element chips over a raw serial link
//!
//! This crate is the user-facing surface of the selink stack. A [`Session`]
//! wraps a T=1 link over any [`selink_core::Channel`] and exchanges whole
//! APDUs; a [`Context`] adds the library-style lifecycle around it: device
//! naming, an application log hook, opaque user data and idempotent
//! open/close.
//!
//! ```no_run
//! use selink::Context;
//! use selink_core::channel::mock::MockChannel;
//!
//! # fn main() -> Result<(), selink_core::Error> {
//! let mut ctx = Context::new();
//! ctx.open(MockChannel::new())?;
//! let response = ctx.transceive(&[0x00, 0xA4, 0x04, 0x00])?;
//! println!("{response:02X?}");
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod context;
pub mod session;

pub use context::Context;
pub use session::{CHIP_ADDRESS, HOST_ADDRESS, Session};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::session::Session;
    pub use selink_t1::prelude::*;
}
