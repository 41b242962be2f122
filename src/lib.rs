//! Control-plane core for a MIDI-over-TCP digital mixing console
//!
//! Talks the mixrack's MIDI dialect over two blocking TCP connections,
//! reconciles the optimistically-mirrored wire protocol into authoritative
//! in-process state, and multiplexes a bank of 16 physical fader strips onto
//! logical views (sends-on-fader, per-output mixes, masters) by recalling
//! scenes and rebinding fader mappings on the fly.
//!
//! # Layers
//! - Identifier model: channel identity, banks, levels, colors, labels
//! - Codec: streaming MIDI framing plus the mixrack sysex dialect, including
//!   two known firmware quirks
//! - Transport: framed bidirectional TCP ports with optional credentials
//! - Tracked values: per-attribute state cells with outstanding-request
//!   queues and staleness purging
//! - Session: the aggregated mix state and the startup `sync` protocol
//! - Layer controller & virtual strips: the scene-driven mode state machine
//!   driving the fader bank
//!
//! # Crate feature flags
//! - `s-dca` (default): relative group-fader mode over a selected set of
//!   send levels, driven by a single strip
//!
//! # Quick start
//! ```no_run
//! use std::sync::Arc;
//! use mixsurface::config::Config;
//! use mixsurface::scheduler::Scheduler;
//! use mixsurface::session::Session;
//! use mixsurface::surface::StatusBoard;
//! use mixsurface::transport::{CommandSink, MixrackPort};
//!
//! # fn run() -> mixsurface::Result<()> {
//! let config = Config::from_file("mixsurface.toml")?;
//! let scheduler = Arc::new(Scheduler::new(2));
//! let status = Arc::new(StatusBoard::new());
//!
//! // one port for commands and their echoes, one for notifications
//! let outbound = Arc::new(MixrackPort::connect(&config.mixrack, Arc::clone(&status))?);
//! let inbound = Arc::new(MixrackPort::connect(&config.mixrack, Arc::clone(&status))?);
//!
//! let session = Arc::new(Session::new(
//!     &config,
//!     Arc::clone(&outbound) as Arc<dyn CommandSink>,
//!     scheduler,
//!     status,
//! )?);
//! session.listen(vec![outbound.reader()?, inbound.reader()?]);
//! session.sync()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

// Domain modules
pub mod codec; // Wire dialect: framing, decoding, encoding
pub mod config; // TOML configuration loading
pub mod entity; // Channel identity and value types
pub mod event; // In-process multicast events (sync + async)
pub mod layers; // Scene-driven layer state machine
pub mod scheduler; // Named timed/interval jobs with cancellation
pub mod session; // Aggregated mix state and sync protocol
pub mod strip; // Virtual fader strip binder
pub mod surface; // Contracts consumed by the UI layer and the REPL
pub mod tracking; // Tracked-value reconciliation cells
pub mod transport; // Blocking TCP ports

/// Error types for control-surface operations
#[derive(thiserror::Error, Debug)]
pub enum SurfaceError {
    /// Invalid or incomplete configuration; fatal at startup
    #[error("Config error: {0}")]
    Config(String),

    /// Socket setup or I/O failure on a transport port
    #[error("Connection error: {0}")]
    Connection(String),

    /// The mixrack rejected the credential handshake
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Malformed or unintelligible wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A value outside the range the console accepts
    #[error("Range error: {0}")]
    Range(String),

    /// IO error from a socket or the filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for SurfaceError {
    /// Converts a String into `SurfaceError::Other`.
    ///
    /// Convenience for generic string errors; prefer the specific variant
    /// constructors where the error class is known.
    fn from(msg: String) -> Self {
        SurfaceError::Other(msg)
    }
}

impl From<&str> for SurfaceError {
    /// Converts a string slice into `SurfaceError::Other`.
    fn from(msg: &str) -> Self {
        SurfaceError::Other(msg.to_string())
    }
}

/// Result type for control-surface operations
pub type Result<T> = std::result::Result<T, SurfaceError>;

// Public API exports
pub use codec::{Decoder, DecoderShared, Encoder, Message};
pub use entity::{Bank, ChannelIdentifier, Color, Label, Level, Scene};
pub use event::{AsyncEvent, Event};
pub use scheduler::Scheduler;
pub use session::Session;
pub use tracking::{TrackedValue, ValueRegistry};
pub use transport::MixrackPort;
