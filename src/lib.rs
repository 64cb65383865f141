//! # riptide-ws: WebSocket protocol engine
//!
//! An implementation of the RFC 6455 wire protocol plus the
//! permessage-deflate extension (RFC 7692), sitting above any reliable
//! byte transport (`AsyncRead + AsyncWrite`) and below application code
//! exchanging discrete text or binary messages.
//!
//! The engine covers:
//!
//! - **Frame codec**: bit-exact header encode/decode with canonical length
//!   forms and mask handling
//! - **Receive state machine**: fragmented message reassembly, interleaved
//!   control frames, protocol invariant enforcement
//! - **Send pipeline**: fragmentation, per-frame masking, write buffering
//! - **Permessage-deflate**: per-message raw DEFLATE with context-takeover
//!   policy and the `00 00 FF FF` trailing-block rule
//! - **Close handshake**: bidirectional termination and
//!   fail-the-connection behavior
//! - **Streaming UTF-8 validation** for text messages
//!
//! The opening HTTP upgrade is left to the caller; a [`Session`] is created
//! from its outcome (a [`Role`] and, optionally, a negotiated
//! [`PmdConfig`]).
//!
//! ## Example
//!
//! ```ignore
//! use riptide_ws::{Options, Role, Session};
//!
//! async fn echo(io: tokio::net::TcpStream) -> riptide_ws::Result<()> {
//!     let mut session = Session::new(io, Role::Server, Options::default());
//!     let mut buf = bytes::BytesMut::new();
//!     loop {
//!         let frame = session.read(&mut buf).await?;
//!         if frame.fin {
//!             session.write(&buf.split()).await?;
//!         }
//!     }
//! }
//! ```

pub mod bits;
pub mod close;
pub mod error;
pub mod frame;
pub mod mask;
pub mod recv;
pub mod send;
pub mod session;
pub mod utf8;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

pub use error::{CloseReason, Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use recv::FrameInfo;
pub use session::{PongCallback, Reader, Role, Session, Writer};

#[cfg(feature = "permessage-deflate")]
pub use deflate::{Deflater, Inflater, PmdConfig, SERVER_ACCEPT_TOKEN};

/// Maximum frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable with the 7-bit length form
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest payload encodable with the 16-bit length form
pub const MEDIUM_PAYLOAD_MAX: usize = 65535;

/// Default maximum message size (16 MiB)
pub const DEFAULT_MSG_MAX: usize = 16 * 1024 * 1024;

/// Default read/write buffer size
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Session options, fixed at open.
///
/// # Example
///
/// ```
/// use riptide_ws::{OpCode, Options};
///
/// let options = Options::builder()
///     .msg_max(1024 * 1024)
///     .auto_fragment(false)
///     .default_write_opcode(OpCode::Binary)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum message size in bytes; 0 disables the limit (default: 16 MiB)
    pub msg_max: usize,
    /// Transport read buffer size (default: 4096)
    pub rd_buf_size: usize,
    /// Write buffer size, which is also the auto-fragmentation chunk size
    /// (default: 4096)
    pub wr_buf_size: usize,
    /// Split outgoing messages into buffer-sized frames (default: true)
    pub auto_fragment: bool,
    /// Opcode for messages sent through `write`/`write_some`
    /// (default: [`OpCode::Text`])
    pub default_write_opcode: OpCode,
    /// Use permessage-deflate when it was negotiated (default: true)
    pub pmd_enabled: bool,
    /// Compress outgoing messages (default: true)
    pub compress_outgoing: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            msg_max: DEFAULT_MSG_MAX,
            rd_buf_size: DEFAULT_BUF_SIZE,
            wr_buf_size: DEFAULT_BUF_SIZE,
            auto_fragment: true,
            default_write_opcode: OpCode::Text,
            pmd_enabled: true,
            compress_outgoing: true,
        }
    }
}

impl Options {
    /// Create an options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }
}

/// Builder for [`Options`]
#[derive(Debug, Clone)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    /// Set the maximum message size (0 = unlimited)
    pub fn msg_max(mut self, size: usize) -> Self {
        self.options.msg_max = size;
        self
    }

    /// Set the transport read buffer size
    pub fn rd_buf_size(mut self, size: usize) -> Self {
        self.options.rd_buf_size = size;
        self
    }

    /// Set the write buffer size
    pub fn wr_buf_size(mut self, size: usize) -> Self {
        self.options.wr_buf_size = size;
        self
    }

    /// Enable or disable automatic fragmentation
    pub fn auto_fragment(mut self, enabled: bool) -> Self {
        self.options.auto_fragment = enabled;
        self
    }

    /// Set the opcode for `write`/`write_some` messages
    ///
    /// Only [`OpCode::Text`] and [`OpCode::Binary`] are meaningful here.
    pub fn default_write_opcode(mut self, opcode: OpCode) -> Self {
        self.options.default_write_opcode = opcode;
        self
    }

    /// Enable or disable use of a negotiated permessage-deflate extension
    pub fn pmd_enabled(mut self, enabled: bool) -> Self {
        self.options.pmd_enabled = enabled;
        self
    }

    /// Enable or disable compression of outgoing messages
    pub fn compress_outgoing(mut self, enabled: bool) -> Self {
        self.options.compress_outgoing = enabled;
        self
    }

    /// Build the options
    pub fn build(self) -> Options {
        self.options
    }
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::OpCode;
    pub use crate::recv::FrameInfo;
    pub use crate::session::{Role, Session};
    pub use crate::Options;
}
