//! Library context: device naming, logging hook and session lifecycle
//!
//! [`Context`] is the long-lived handle an application keeps around: it
//! carries the configuration, an application-owned log callback, opaque user
//! data and at most one open [`Session`]. The log verbosity is seeded from
//! the `SELINK_LOG` environment variable so deployed applications can be
//! made chatty without a rebuild.

use std::any::Any;
use std::env;
use std::fmt;

use bytes::Bytes;
use selink_core::{Channel, Error};
use selink_t1::T1Config;

use crate::session::Session;

/// Device path used when the application never names one
pub const DEFAULT_DEVICE: &str = "/dev/spidev0.0";

/// Environment variable seeding the log verbosity
pub const LOG_ENV: &str = "SELINK_LOG";

const DEFAULT_LOG_LEVEL: u8 = 2;
const MAX_LOG_LEVEL: u8 = 4;

type LogFn = Box<dyn Fn(u8, &str) + Send + Sync>;

/// Parse a `SELINK_LOG` value into a verbosity level
///
/// Accepts a bare number or one of the named levels `err`, `info` and
/// `debug`; anything else is ignored by the caller.
fn parse_log_level(value: &str) -> Option<u8> {
    let value = value.trim();
    if let Ok(level) = value.parse::<i64>() {
        return Some(level.clamp(0, i64::from(MAX_LOG_LEVEL)) as u8);
    }
    match value {
        "err" => Some(0),
        "info" => Some(3),
        "debug" => Some(MAX_LOG_LEVEL),
        _ => None,
    }
}

/// Long-lived library handle for one secure-element device
pub struct Context<C: Channel> {
    userdata: Option<Box<dyn Any + Send>>,
    log_level: u8,
    log_fn: LogFn,
    device: String,
    config: T1Config,
    session: Option<Session<C>>,
}

impl<C: Channel> Context<C> {
    /// Create a context with defaults, seeding the log verbosity from the
    /// environment
    pub fn new() -> Self {
        let log_level = env::var(LOG_ENV)
            .ok()
            .and_then(|value| parse_log_level(&value))
            .unwrap_or(DEFAULT_LOG_LEVEL);
        Self {
            userdata: None,
            log_level,
            log_fn: Box::new(|level, message| eprintln!("selink <{level}>: {message}")),
            device: DEFAULT_DEVICE.to_owned(),
            config: T1Config::default(),
            session: None,
        }
    }

    /// Opaque application data stored on the context
    pub fn userdata(&self) -> Option<&(dyn Any + Send)> {
        self.userdata.as_deref()
    }

    /// Store opaque application data on the context
    pub fn set_userdata(&mut self, data: Box<dyn Any + Send>) {
        self.userdata = Some(data);
    }

    /// Take the opaque application data back out of the context
    pub fn take_userdata(&mut self) -> Option<Box<dyn Any + Send>> {
        self.userdata.take()
    }

    /// Current log verbosity, `0` (errors only) to `4` (debug)
    pub const fn log_level(&self) -> u8 {
        self.log_level
    }

    /// Set the log verbosity, clamped to the supported range
    pub fn set_log_level(&mut self, level: i32) {
        self.log_level = level.clamp(0, i32::from(MAX_LOG_LEVEL)) as u8;
    }

    /// Replace the log callback
    pub fn set_log_fn(&mut self, log_fn: impl Fn(u8, &str) + Send + Sync + 'static) {
        self.log_fn = Box::new(log_fn);
    }

    /// Device path this context is bound to
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Bind the context to a device path
    pub fn set_device(&mut self, device: impl Into<String>) {
        self.device = device.into();
    }

    /// Link configuration applied by the next [`open`](Self::open)
    pub const fn config(&self) -> &T1Config {
        &self.config
    }

    /// Replace the link configuration; takes effect on the next open
    pub fn set_config(&mut self, config: T1Config) {
        self.config = config;
    }

    /// Whether a session is currently open
    pub const fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The open session, if any
    pub const fn session(&self) -> Option<&Session<C>> {
        self.session.as_ref()
    }

    /// The open session, mutably, if any
    pub fn session_mut(&mut self) -> Option<&mut Session<C>> {
        self.session.as_mut()
    }

    /// Open a session over `channel`
    ///
    /// Performs no I/O: the chip is not power-cycled and no answer to reset
    /// is read until the application calls [`reset`](Self::reset).
    pub fn open(&mut self, channel: C) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::InvalidArgument("context is already open"));
        }
        self.session = Some(Session::open(channel, self.config.clone()));
        self.log(3, "device opened");
        Ok(())
    }

    /// Send one APDU over the open session
    pub fn transceive(&mut self, apdu: &[u8]) -> Result<Bytes, Error> {
        let session = self
            .session
            .as_mut()
            .ok_or(Error::InvalidArgument("context is not open"))?;
        let result = session.transceive(apdu);
        match &result {
            Ok(response) => self.log(4, &format!("exchanged {} for {} bytes", apdu.len(), response.len())),
            Err(_) => self.log(0, "apdu exchange failed"),
        }
        result
    }

    /// Send one APDU and copy the response into a caller-supplied buffer
    pub fn transmit(&mut self, apdu: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        self.session
            .as_mut()
            .ok_or(Error::InvalidArgument("context is not open"))?
            .transmit(apdu, response)
    }

    /// Power-cycle the chip of the open session and return its answer to
    /// reset
    pub fn reset(&mut self) -> Result<&[u8], Error> {
        self.session
            .as_mut()
            .ok_or(Error::InvalidArgument("context is not open"))?
            .reset()
    }

    /// Answer to reset of the open session
    pub fn atr(&self) -> Option<&[u8]> {
        self.session.as_ref().and_then(Session::atr)
    }

    /// Close the session and recover the channel
    ///
    /// Idempotent: a second close returns `None` and is not an error.
    pub fn close(&mut self) -> Option<C> {
        let channel = self.session.take().and_then(|mut session| session.close());
        if channel.is_some() {
            self.log(3, "device closed");
        }
        channel
    }

    fn log(&self, level: u8, message: &str) {
        if level <= self.log_level {
            (self.log_fn)(level, message);
        }
    }
}

impl<C: Channel> Default for Context<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Channel> fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("log_level", &self.log_level)
            .field("device", &self.device)
            .field("config", &self.config)
            .field("session", &self.session)
            .field("has_userdata", &self.userdata.is_some())
            .finish_non_exhaustive()
    }
}
