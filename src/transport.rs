//! Blocking TCP transport ports
//!
//! The console needs two independent connections to the same host: it will
//! not echo a command back on the connection that issued it, so one port
//! carries outbound commands (and their echoes) while the second delivers
//! asynchronous notifications. Writes on a port are serialized under a
//! mutex; a broken pipe closes the port and surfaces a fatal error.
//!
//! Port 51325 is the plain port; configuring credentials switches to 51327
//! and performs the `<profile><password>` -> `"AuthOK"` handshake.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::framing::{MidiStream, RawMidi};
use crate::config::MixrackConfig;
use crate::surface::StatusBoard;
use crate::{Result, SurfaceError};

/// TCP port for unauthenticated sessions
pub const PORT_PLAIN: u16 = 51325;
/// TCP port for credential-protected sessions
pub const PORT_AUTH: u16 = 51327;

/// Anything that accepts encoded command bytes.
///
/// The session writes through this seam so tests can capture traffic without
/// a socket.
pub trait CommandSink: Send + Sync {
    /// Write one encoded command. Returns `Ok(false)` when the write was
    /// dropped by rate limiting.
    fn send_bytes(&self, bytes: &[u8]) -> Result<bool>;
}

/// Sliding-window outbound rate limiter.
///
/// Estimates the rate over the last second from the previous window's count
/// weighted by overlap plus the current window's count; writes that would
/// push the estimate over capacity are dropped, not retried.
struct RateLimiter {
    capacity: f32,
    window: Duration,
    window_start: Instant,
    previous_count: f32,
    current_count: f32,
}

impl RateLimiter {
    fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as f32,
            window: Duration::from_secs(1),
            window_start: Instant::now(),
            previous_count: capacity as f32,
            current_count: 0.0,
        }
    }

    fn admit(&mut self) -> bool {
        let now = Instant::now();

        if now.duration_since(self.window_start) > self.window {
            self.window_start = now;
            self.previous_count = self.current_count;
            self.current_count = 0.0;
        }

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        let overlap = (self.window.as_secs_f32() - elapsed) / self.window.as_secs_f32();
        let estimated = self.previous_count * overlap + self.current_count;

        if estimated > self.capacity {
            return false;
        }

        self.current_count += 1.0;
        true
    }
}

/// One blocking TCP connection to the mixrack.
pub struct MixrackPort {
    stream: Mutex<TcpStream>,
    limiter: Mutex<Option<RateLimiter>>,
    status: Arc<StatusBoard>,
    closed: AtomicBool,
}

impl MixrackPort {
    /// Connect (and authenticate, when credentials are configured).
    pub fn connect(config: &MixrackConfig, status: Arc<StatusBoard>) -> Result<Self> {
        let port = if config.auth.is_some() {
            PORT_AUTH
        } else {
            PORT_PLAIN
        };

        let mut stream =
            TcpStream::connect((config.ip.as_str(), port)).map_err(|error| {
                SurfaceError::Connection(format!("cannot reach {}:{port}: {error}", config.ip))
            })?;
        stream.set_nodelay(true)?;

        if let Some(auth) = &config.auth {
            Self::authenticate(&mut stream, &auth.user_profile, &auth.user_password)?;
        }

        tracing::info!(host = %config.ip, port, "connected to mixrack");

        Ok(Self {
            stream: Mutex::new(stream),
            limiter: Mutex::new(None),
            status,
            closed: AtomicBool::new(false),
        })
    }

    fn authenticate(stream: &mut TcpStream, profile: &str, password: &str) -> Result<()> {
        stream.write_all(format!("{profile}{password}").as_bytes())?;

        let mut ack = [0u8; 6];
        stream.read_exact(&mut ack).map_err(|error| {
            SurfaceError::Auth(format!("no handshake reply: {error}"))
        })?;

        if &ack != b"AuthOK" {
            return Err(SurfaceError::Auth("console rejected credentials".into()));
        }

        Ok(())
    }

    /// Enable outbound rate limiting with the given per-second capacity.
    pub fn enable_rate_limiting(&self, capacity: u32) {
        tracing::info!(capacity, "outbound rate limiting enabled");
        *self.limiter.lock() = Some(RateLimiter::new(capacity));
    }

    /// Whether a broken pipe has closed this port.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A reader over this port's inbound byte stream, with its own framer.
    pub fn reader(&self) -> Result<PortReader> {
        let stream = self.stream.lock().try_clone()?;
        Ok(PortReader {
            stream,
            framer: MidiStream::new(),
            pending: Vec::new(),
        })
    }
}

impl CommandSink for MixrackPort {
    fn send_bytes(&self, bytes: &[u8]) -> Result<bool> {
        if self.is_closed() {
            return Err(SurfaceError::Connection("port is closed".into()));
        }

        if let Some(limiter) = self.limiter.lock().as_mut() {
            if !limiter.admit() {
                self.status.set_status("! Overload !");
                return Ok(false);
            }
        }

        let mut stream = self.stream.lock();
        match stream.write_all(bytes).and_then(|_| stream.flush()) {
            Ok(()) => Ok(true),
            Err(error) => {
                if error.kind() == std::io::ErrorKind::BrokenPipe {
                    self.closed.store(true, Ordering::SeqCst);
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(SurfaceError::Connection(
                        "broken pipe, the console disconnected".into(),
                    ));
                }

                Err(SurfaceError::Io(error))
            }
        }
    }
}

/// Blocking reader over one port's byte stream.
pub struct PortReader {
    stream: TcpStream,
    framer: MidiStream,
    pending: Vec<RawMidi>,
}

impl PortReader {
    /// Read the next framed MIDI message, blocking on the socket.
    ///
    /// Returns `Err(Connection)` once the peer closes the stream.
    pub fn next_message(&mut self) -> Result<RawMidi> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.pending.remove(0));
            }

            let mut buffer = [0u8; 1024];
            let read = self.stream.read(&mut buffer)?;
            if read == 0 {
                return Err(SurfaceError::Connection(
                    "console closed the connection".into(),
                ));
            }

            self.pending = self.framer.feed(&buffer[..read]);
        }
    }
}
