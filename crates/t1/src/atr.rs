//! Answer-to-reset retrieval
//!
//! After the physical reset pulse the chip pushes its ATR unsolicited: TS,
//! the format byte T0, interface bytes announced by the TD chain, historical
//! bytes, and a TCK check byte whenever any TD announces a protocol other
//! than T=0. Retrieval is bounded by [`MAX_ATR_LEN`] and a generous timeout;
//! it is not part of the retry-budgeted exchange protocol, so a malformed
//! ATR is reported, never retried.

use std::time::Duration;

use selink_core::{Channel, ChannelError, Error};

/// Maximum number of ATR bytes the protocol allows
pub const MAX_ATR_LEN: usize = 32;

/// Valid values of the initial TS byte (direct and inverse convention)
const TS_DIRECT: u8 = 0x3B;
const TS_INVERSE: u8 = 0x3F;

/// Read one ATR byte, accounting for the overall length bound
fn next_byte<C: Channel>(channel: &mut C, atr: &mut Vec<u8>, timeout: Duration) -> Result<u8, Error> {
    if atr.len() >= MAX_ATR_LEN {
        return Err(Error::Chip("answer-to-reset exceeds the protocol maximum"));
    }
    let mut byte = [0u8; 1];
    channel.read(&mut byte, timeout).map_err(|e| match e {
        ChannelError::Timeout => Error::Timeout,
        other => Error::Channel(other),
    })?;
    atr.push(byte[0]);
    Ok(byte[0])
}

/// Read and validate the chip's answer to reset
///
/// Returns the raw ATR bytes, TS included.
pub fn read_atr<C: Channel>(channel: &mut C, timeout: Duration) -> Result<Vec<u8>, Error> {
    let mut atr = Vec::with_capacity(MAX_ATR_LEN);

    let ts = next_byte(channel, &mut atr, timeout)?;
    if ts != TS_DIRECT && ts != TS_INVERSE {
        return Err(Error::Chip("answer-to-reset starts with an invalid TS byte"));
    }

    let t0 = next_byte(channel, &mut atr, timeout)?;
    let historical = usize::from(t0 & 0x0F);

    // Walk the TD chain: each presence nibble announces TA/TB/TC/TD.
    let mut presence = t0 >> 4;
    let mut needs_tck = false;
    loop {
        for bit in [0x1, 0x2, 0x4] {
            if presence & bit != 0 {
                next_byte(channel, &mut atr, timeout)?;
            }
        }
        if presence & 0x8 == 0 {
            break;
        }
        let td = next_byte(channel, &mut atr, timeout)?;
        if td & 0x0F != 0 {
            needs_tck = true;
        }
        presence = td >> 4;
    }

    for _ in 0..historical {
        next_byte(channel, &mut atr, timeout)?;
    }

    if needs_tck {
        next_byte(channel, &mut atr, timeout)?;
        // TCK makes the XOR of everything after TS vanish.
        if atr[1..].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
            return Err(Error::Chip("answer-to-reset fails its check byte"));
        }
    }

    Ok(atr)
}
