//! APDU session over a T=1 link
//!
//! A [`Session`] owns the link for one chip and exchanges whole APDUs,
//! hiding blocks, chaining and recovery entirely. Argument contracts are
//! enforced before any I/O so that a rejected call leaves no trace on the
//! wire.

use bytes::Bytes;
use selink_core::{Channel, Error};
use selink_t1::{Link, T1Config};
use tracing::debug;

/// Node address of the host side of the link
pub const HOST_ADDRESS: u8 = 0x2;

/// Node address of the chip side of the link
pub const CHIP_ADDRESS: u8 = 0x1;

/// An open APDU exchange session with a secure-element chip
///
/// Created over any byte channel without touching the wire; the session is
/// immediately ready to exchange, and [`reset`](Self::reset) is only needed
/// to power-cycle the chip or fetch its answer to reset. Closing the session
/// recovers the channel, and a closed session rejects every exchange.
#[derive(Debug)]
pub struct Session<C: Channel> {
    link: Option<Link<C>>,
}

impl<C: Channel> Session<C> {
    /// Create a session over `channel` with the standard host/chip
    /// addressing
    pub fn open(channel: C, config: T1Config) -> Self {
        let mut link = Link::new(channel, config);
        link.bind(HOST_ADDRESS, CHIP_ADDRESS);
        Self { link: Some(link) }
    }

    fn link_mut(&mut self) -> Result<&mut Link<C>, Error> {
        self.link
            .as_mut()
            .ok_or(Error::InvalidArgument("session is closed"))
    }

    /// Power-cycle the chip and return its answer to reset
    pub fn reset(&mut self) -> Result<&[u8], Error> {
        self.link_mut()?.reset()
    }

    /// Answer to reset captured by the last [`reset`](Self::reset)
    pub fn atr(&self) -> Option<&[u8]> {
        self.link.as_ref().map(Link::atr)
    }

    /// Advertise a new host-side information field size to the chip
    pub fn set_ifsd(&mut self, ifsd: u8) -> Result<(), Error> {
        self.link_mut()?.set_ifsd(ifsd)
    }

    /// Send one APDU and return the chip's complete response
    ///
    /// The APDU must carry at least the four-byte header; the response
    /// always ends in a status word, and anything shorter is reported as
    /// [`Error::ShortResponse`].
    pub fn transceive(&mut self, apdu: &[u8]) -> Result<Bytes, Error> {
        if apdu.len() < 4 {
            return Err(Error::InvalidArgument(
                "APDU must carry at least the four-byte header",
            ));
        }
        let response = self.link_mut()?.transceive(apdu)?;
        if response.len() < 2 {
            return Err(Error::ShortResponse(response.len()));
        }
        Ok(response)
    }

    /// Send one APDU and copy the response into a caller-supplied buffer
    ///
    /// Returns the number of response bytes written. The buffer must hold
    /// at least a status word; a response larger than the buffer is
    /// reported as [`Error::BufferTooSmall`] without partial writes.
    pub fn transmit(&mut self, apdu: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        if response.len() < 2 {
            return Err(Error::InvalidArgument(
                "response buffer must hold at least a status word",
            ));
        }
        let received = self.transceive(apdu)?;
        if received.len() > response.len() {
            return Err(Error::BufferTooSmall {
                needed: received.len(),
                capacity: response.len(),
            });
        }
        response[..received.len()].copy_from_slice(&received);
        Ok(received.len())
    }

    /// Whether the session has been closed
    pub const fn is_closed(&self) -> bool {
        self.link.is_none()
    }

    /// Close the session and recover the channel
    ///
    /// Idempotent: a second close returns `None` and is not an error.
    pub fn close(&mut self) -> Option<C> {
        let channel = self.link.take().map(Link::release);
        if channel.is_some() {
            debug!("session closed");
        }
        channel
    }
}

/// Split a response into its data bytes and the trailing status word
///
/// Returns `None` for responses shorter than a status word.
pub fn split_status(response: &[u8]) -> Option<(&[u8], u16)> {
    let (data, sw) = response.split_at_checked(response.len().checked_sub(2)?)?;
    Some((data, (u16::from(sw[0]) << 8) | u16::from(sw[1])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_status() {
        assert_eq!(split_status(&[0x90, 0x00]), Some((&[][..], 0x9000)));
        assert_eq!(
            split_status(&[0x01, 0x02, 0x61, 0x10]),
            Some((&[0x01, 0x02][..], 0x6110))
        );
        assert_eq!(split_status(&[0x90]), None);
        assert_eq!(split_status(&[]), None);
    }
}
