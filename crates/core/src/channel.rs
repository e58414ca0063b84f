//! Byte-channel abstraction over the physical transport
//!
//! The block protocol never touches the wire directly; it talks to a
//! [`Channel`], a blocking duplex byte pipe with a physical reset line.
//! Concrete implementations (an SPI device, an I2C slave, a socket to a chip
//! simulator) live outside this crate.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Error type returned by channel implementations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The read deadline passed before the requested bytes arrived
    #[error("channel read timed out")]
    Timeout,

    /// The channel has been released and can no longer be used
    #[error("channel is closed")]
    Closed,

    /// The underlying device failed
    #[error("device error: {0}")]
    Device(String),
}

impl ChannelError {
    /// Create a new device error
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self::Device(message.into())
    }
}

/// Trait for blocking byte transports to a secure-element chip
///
/// A channel moves raw bytes; it has no knowledge of blocks, checksums or
/// sequencing. Reads and writes are the only suspension points of the driver
/// stack, bounded by the timeout passed to [`Channel::read`].
pub trait Channel: Send + fmt::Debug {
    /// Write the whole buffer to the chip
    fn write(&mut self, buf: &[u8]) -> Result<(), ChannelError>;

    /// Fill the whole buffer with bytes from the chip
    ///
    /// Must return [`ChannelError::Timeout`] when the deadline passes before
    /// `buf.len()` bytes arrived.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), ChannelError>;

    /// Pulse the physical reset line of the chip
    fn assert_reset(&mut self) -> Result<(), ChannelError>;
}

/// Scripted channel for tests and examples
pub mod mock {
    use super::*;

    /// One scripted step served by [`MockChannel::read`]
    #[derive(Debug)]
    pub enum ReadStep {
        /// Bytes handed out to the reader
        Data(Vec<u8>),
        /// Fault returned to the reader in place of data
        Fault(ChannelError),
    }

    /// A channel that serves scripted reads and records everything written
    ///
    /// Reads consume the scripted queue front to back, concatenating `Data`
    /// steps as needed; an empty queue reads as a timeout. Useful for driving
    /// the protocol stack without hardware.
    #[derive(Debug, Default)]
    pub struct MockChannel {
        /// Scripted read steps
        pub script: VecDeque<ReadStep>,
        /// Every buffer passed to `write`, in order
        pub written: Vec<Vec<u8>>,
        /// Number of reset pulses seen
        pub resets: usize,
    }

    impl MockChannel {
        /// Create an empty mock channel
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes to be served by subsequent reads
        pub fn push_read(&mut self, bytes: impl Into<Vec<u8>>) {
            self.script.push_back(ReadStep::Data(bytes.into()));
        }

        /// Queue a fault to be served in place of the next read
        pub fn push_fault(&mut self, fault: ChannelError) {
            self.script.push_back(ReadStep::Fault(fault));
        }

        /// Total number of I/O calls observed (writes plus resets)
        pub fn io_count(&self) -> usize {
            self.written.len() + self.resets
        }
    }

    impl Channel for MockChannel {
        fn write(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
            self.written.push(buf.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), ChannelError> {
            let mut filled = 0;
            while filled < buf.len() {
                match self.script.front_mut() {
                    None => return Err(ChannelError::Timeout),
                    Some(ReadStep::Fault(_)) => {
                        let Some(ReadStep::Fault(fault)) = self.script.pop_front() else {
                            unreachable!()
                        };
                        return Err(fault);
                    }
                    Some(ReadStep::Data(data)) => {
                        let take = data.len().min(buf.len() - filled);
                        buf[filled..filled + take].copy_from_slice(&data[..take]);
                        data.drain(..take);
                        filled += take;
                        if data.is_empty() {
                            self.script.pop_front();
                        }
                    }
                }
            }
            Ok(())
        }

        fn assert_reset(&mut self) -> Result<(), ChannelError> {
            self.resets += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChannel;
    use super::*;

    #[test]
    fn test_mock_serves_scripted_reads_across_steps() {
        let mut ch = MockChannel::new();
        ch.push_read(vec![0x01, 0x02]);
        ch.push_read(vec![0x03]);

        let mut buf = [0u8; 3];
        ch.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_mock_empty_script_times_out() {
        let mut ch = MockChannel::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            ch.read(&mut buf, Duration::from_millis(10)),
            Err(ChannelError::Timeout)
        ));
    }

    #[test]
    fn test_mock_records_writes_and_resets() {
        let mut ch = MockChannel::new();
        ch.write(&[0xAA, 0xBB]).unwrap();
        ch.assert_reset().unwrap();
        assert_eq!(ch.written, vec![vec![0xAA, 0xBB]]);
        assert_eq!(ch.resets, 1);
        assert_eq!(ch.io_count(), 2);
    }

    #[test]
    fn test_mock_scripted_fault() {
        let mut ch = MockChannel::new();
        ch.push_fault(ChannelError::Device("bus error".into()));
        ch.push_read(vec![0x01]);

        let mut buf = [0u8; 1];
        assert!(matches!(
            ch.read(&mut buf, Duration::from_millis(10)),
            Err(ChannelError::Device(_))
        ));
        // The fault is consumed; the next read succeeds.
        ch.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf, [0x01]);
    }
}
