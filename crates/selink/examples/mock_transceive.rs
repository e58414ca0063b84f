//! Drive a full APDU exchange against the scripted mock channel.
//!
//! Run with `RUST_LOG=trace` (or `SELINK_LOG=debug`) to watch the block
//! traffic:
//!
//! ```text
//! cargo run --example mock_transceive
//! ```

use selink::{Context, session::split_status};
use selink_core::Error;
use selink_core::channel::mock::MockChannel;
use selink_t1::{Block, EdcMode, Pcb};

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).init();

    // Script the chip side: an answer to reset, then one I-block response.
    let mut channel = MockChannel::new();
    channel.push_read(vec![0x3B, 0x00]);
    channel.push_read(
        Block::with_inf(
            0x21,
            Pcb::Info { seq: false, more: false },
            vec![0x6F, 0x10, 0x84, 0x08, 0x90, 0x00],
        )
        .encode(EdcMode::Lrc)?
        .to_vec(),
    );

    let mut ctx = Context::new();
    ctx.open(channel)?;
    // Opening performs no I/O; power-cycle the chip to fetch its answer
    // to reset before the first exchange.
    ctx.reset()?;
    println!("atr: {}", hex::encode(ctx.atr().unwrap_or_default()));

    let select = [0x00, 0xA4, 0x04, 0x00];
    let response = ctx.transceive(&select)?;
    let (data, sw) = split_status(&response).ok_or(Error::ShortResponse(response.len()))?;
    println!("data: {}", hex::encode(data));
    println!("status: {sw:04X}");

    ctx.close();
    Ok(())
}
