//! Session surface tests over a scripted channel

use selink::session::{Session, split_status};
use selink_core::Error;
use selink_core::channel::mock::MockChannel;
use selink_t1::{Block, EdcMode, Pcb, T1Config};

/// Frame as the chip would send it
fn chip_frame(inf: &[u8], seq: bool) -> Vec<u8> {
    Block::with_inf(0x21, Pcb::Info { seq, more: false }, inf.to_vec())
        .encode(EdcMode::Lrc)
        .unwrap()
        .to_vec()
}

fn opened(script: &[&[u8]]) -> Session<MockChannel> {
    let mut ch = MockChannel::new();
    ch.push_read(vec![0x3B, 0x00]);
    for frame in script {
        ch.push_read(frame.to_vec());
    }
    let mut session = Session::open(ch, T1Config::default());
    session.reset().unwrap();
    session
}

#[test]
fn test_exchange_without_reset() {
    let mut ch = MockChannel::new();
    ch.push_read(chip_frame(&[0x90, 0x00], false));

    // Opening performs no I/O and a reset is optional; the first APDU can
    // go out straight away.
    let mut session = Session::open(ch, T1Config::default());
    let response = session.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(split_status(&response), Some((&[][..], 0x9000)));

    let ch = session.close().unwrap();
    assert_eq!(ch.resets, 0);
}

#[test]
fn test_scripted_exchange() {
    let mut session = opened(&[&chip_frame(&[0x61, 0x07, 0x90, 0x00], false)]);
    let response = session.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response.as_ref(), &[0x61, 0x07, 0x90, 0x00]);
    assert_eq!(split_status(&response), Some((&[0x61, 0x07][..], 0x9000)));
}

#[test]
fn test_short_apdu_rejected_before_io() {
    let mut session = Session::open(MockChannel::new(), T1Config::default());
    assert!(matches!(
        session.transceive(&[0x00, 0xA4, 0x04]),
        Err(Error::InvalidArgument(_))
    ));
    let ch = session.close().unwrap();
    assert_eq!(ch.io_count(), 0);
}

#[test]
fn test_small_response_buffer_rejected_before_io() {
    let mut session = Session::open(MockChannel::new(), T1Config::default());
    let mut response = [0u8; 1];
    assert!(matches!(
        session.transmit(&[0x00, 0xA4, 0x04, 0x00], &mut response),
        Err(Error::InvalidArgument(_))
    ));
    let ch = session.close().unwrap();
    assert_eq!(ch.io_count(), 0);
}

#[test]
fn test_transmit_copies_into_buffer() {
    let mut session = opened(&[&chip_frame(&[0x01, 0x02, 0x90, 0x00], false)]);
    let mut response = [0u8; 8];
    let len = session
        .transmit(&[0x00, 0xB0, 0x00, 0x00], &mut response)
        .unwrap();
    assert_eq!(len, 4);
    assert_eq!(&response[..len], &[0x01, 0x02, 0x90, 0x00]);
}

#[test]
fn test_transmit_reports_undersized_buffer() {
    let mut session = opened(&[&chip_frame(&[0x01, 0x02, 0x90, 0x00], false)]);
    let mut response = [0u8; 2];
    assert!(matches!(
        session.transmit(&[0x00, 0xB0, 0x00, 0x00], &mut response),
        Err(Error::BufferTooSmall {
            needed: 4,
            capacity: 2
        })
    ));
}

#[test]
fn test_short_response_surfaced() {
    let mut session = opened(&[&chip_frame(&[0x90], false)]);
    assert!(matches!(
        session.transceive(&[0x00, 0xA4, 0x04, 0x00]),
        Err(Error::ShortResponse(1))
    ));
}

#[test]
fn test_close_is_idempotent() {
    let mut session = opened(&[]);
    assert!(!session.is_closed());
    assert!(session.close().is_some());
    assert!(session.is_closed());
    assert!(session.close().is_none());
    assert!(matches!(
        session.transceive(&[0x00, 0xA4, 0x04, 0x00]),
        Err(Error::InvalidArgument(_))
    ));
}
