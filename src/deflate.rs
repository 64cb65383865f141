//! Per-message deflate extension (RFC 7692)
//!
//! Both codecs speak raw DEFLATE (no zlib wrapper) with negotiated window
//! bits. A message's compressed body ends in a sync-flush trailer
//! `00 00 FF FF`: the sender strips those four bytes before transmission and
//! the receiver feeds them back to the inflater after the final frame.
//! Unless no-context-takeover was negotiated for a direction, that
//! direction's LZ77 window persists across messages.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer stripped after compression and re-appended before decompression
pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum negotiable window bits
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum negotiable window bits
pub const MAX_WINDOW_BITS: u8 = 15;

/// The extension token this engine sends when accepting an offer as a server.
///
/// This server role always requires clients not to reuse context.
pub const SERVER_ACCEPT_TOKEN: &str = "permessage-deflate; client_no_context_takeover";

/// Negotiated permessage-deflate parameters, immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmdConfig {
    /// Server must reset its compressor after each message
    pub server_no_context_takeover: bool,
    /// Client must reset its compressor after each message
    pub client_no_context_takeover: bool,
    /// Window bits for server-compressed data (8..=15)
    pub server_max_window_bits: u8,
    /// Window bits for client-compressed data (8..=15)
    pub client_max_window_bits: u8,
}

impl Default for PmdConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
        }
    }
}

impl PmdConfig {
    /// Parse a `permessage-deflate` extension token.
    ///
    /// Returns `Ok(None)` if the value offers a different extension, and an
    /// error for malformed or out-of-range parameters.
    pub fn parse_offer(value: &str) -> Result<Option<Self>> {
        let value = value.trim();
        if !value.starts_with("permessage-deflate") {
            return Ok(None);
        }
        let rest = value["permessage-deflate".len()..].trim_start();
        let mut config = Self::default();
        if rest.is_empty() {
            return Ok(Some(config));
        }
        if !rest.starts_with(';') {
            return Ok(None);
        }

        for part in rest[1..].split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
                None => (part, None),
            };
            match name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "server_no_context_takeover takes no value",
                        ));
                    }
                    config.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "client_no_context_takeover takes no value",
                        ));
                    }
                    config.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    config.server_max_window_bits = parse_window_bits(value)?;
                }
                "client_max_window_bits" => {
                    // A bare parameter only signals support for the option.
                    if value.is_some() {
                        config.client_max_window_bits = parse_window_bits(value)?;
                    }
                }
                _ => {
                    return Err(Error::HandshakeFailed(
                        "unknown permessage-deflate parameter",
                    ));
                }
            }
        }

        Ok(Some(config))
    }

    /// Server-side negotiation: accept an offered token.
    ///
    /// On acceptance the response token is always [`SERVER_ACCEPT_TOKEN`] and
    /// the resulting configuration requires the client to reset context.
    pub fn negotiate_server(offer: &str) -> Result<Option<(Self, &'static str)>> {
        match Self::parse_offer(offer)? {
            Some(mut config) => {
                config.client_no_context_takeover = true;
                Ok(Some((config, SERVER_ACCEPT_TOKEN)))
            }
            None => Ok(None),
        }
    }

    /// Window bits for this endpoint's outgoing (deflate) direction.
    pub(crate) fn deflate_window_bits(&self, role: crate::session::Role) -> u8 {
        match role {
            crate::session::Role::Client => self.client_max_window_bits,
            crate::session::Role::Server => self.server_max_window_bits,
        }
    }

    /// Window bits for this endpoint's incoming (inflate) direction.
    pub(crate) fn inflate_window_bits(&self, role: crate::session::Role) -> u8 {
        match role {
            crate::session::Role::Client => self.server_max_window_bits,
            crate::session::Role::Server => self.client_max_window_bits,
        }
    }

    /// Whether this endpoint's deflater resets at each message boundary.
    pub(crate) fn deflate_resets(&self, role: crate::session::Role) -> bool {
        match role {
            crate::session::Role::Client => self.client_no_context_takeover,
            crate::session::Role::Server => self.server_no_context_takeover,
        }
    }

    /// Whether this endpoint's inflater resets at each message boundary.
    pub(crate) fn inflate_resets(&self, role: crate::session::Role) -> bool {
        match role {
            crate::session::Role::Client => self.server_no_context_takeover,
            crate::session::Role::Server => self.client_no_context_takeover,
        }
    }
}

fn parse_window_bits(value: Option<&str>) -> Result<u8> {
    let text = value.ok_or(Error::HandshakeFailed("max_window_bits requires a value"))?;
    let bits: u8 = text
        .parse()
        .map_err(|_| Error::HandshakeFailed("invalid max_window_bits value"))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::HandshakeFailed("max_window_bits out of range (8-15)"));
    }
    Ok(bits)
}

/// zlib rejects raw streams narrower than 2^9; an 8-bit negotiation still
/// decodes correctly with a 9-bit window.
fn effective_window_bits(bits: u8) -> u8 {
    bits.max(9)
}

/// Streaming decompressor for incoming compressed messages.
pub struct Inflater {
    raw: Decompress,
    reset_per_message: bool,
    msg_out: u64,
}

impl Inflater {
    pub fn new(window_bits: u8, reset_per_message: bool) -> Self {
        Self {
            raw: Decompress::new_with_window_bits(false, effective_window_bits(window_bits)),
            reset_per_message,
            msg_out: 0,
        }
    }

    /// Inflate one run of frame payload bytes into `out`.
    ///
    /// `limit` bounds the inflated size of the whole message (0 = unlimited).
    pub fn write(&mut self, mut input: &[u8], out: &mut BytesMut, limit: usize) -> Result<()> {
        while !input.is_empty() {
            if limit != 0 && self.msg_out > limit as u64 {
                return Err(Error::TooBig);
            }
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().clamp(4096, 64 * 1024));
            }

            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let start = out.len();
            let spare = out.spare_capacity_mut();
            // SAFETY: decompress() reports how many of these bytes it wrote;
            // set_len() below only covers that initialized prefix.
            let spare_slice = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
            };

            let status = self
                .raw
                .decompress(input, spare_slice, FlushDecompress::None)
                .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;

            let consumed = (self.raw.total_in() - before_in) as usize;
            let produced = (self.raw.total_out() - before_out) as usize;
            // SAFETY: exactly `produced` bytes of the spare capacity were written.
            unsafe {
                out.set_len(start + produced);
            }
            self.msg_out += produced as u64;
            input = &input[consumed..];

            match status {
                Status::Ok => {}
                Status::StreamEnd => {
                    if !input.is_empty() {
                        return Err(Error::Compression(
                            "data after deflate stream end".to_string(),
                        ));
                    }
                }
                Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Err(Error::Compression("inflate stalled".to_string()));
                    }
                }
            }
        }
        if limit != 0 && self.msg_out > limit as u64 {
            return Err(Error::TooBig);
        }
        Ok(())
    }

    /// Flush the end of a message by inflating the synthesized trailer.
    pub fn finish_message(&mut self, out: &mut BytesMut, limit: usize) -> Result<()> {
        self.write(&DEFLATE_TRAILER, out, limit)?;
        self.msg_out = 0;
        if self.reset_per_message {
            self.raw.reset(false);
        }
        Ok(())
    }
}

/// Streaming compressor for outgoing compressed messages.
pub struct Deflater {
    raw: Compress,
    reset_per_message: bool,
}

impl Deflater {
    pub fn new(window_bits: u8, reset_per_message: bool) -> Self {
        Self {
            raw: Compress::new_with_window_bits(
                Compression::default(),
                false,
                effective_window_bits(window_bits),
            ),
            reset_per_message,
        }
    }

    /// Deflate one run of message bytes into `out` without flushing.
    ///
    /// Intermediate frames stay buffered inside the compressor; only
    /// [`finish_message`](Self::finish_message) forces everything out.
    pub fn write(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<()> {
        while !input.is_empty() {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().clamp(4096, 64 * 1024));
            }

            let before_in = self.raw.total_in();
            let before_out = self.raw.total_out();
            let start = out.len();
            let spare = out.spare_capacity_mut();
            // SAFETY: compress() reports how many of these bytes it wrote;
            // set_len() below only covers that initialized prefix.
            let spare_slice = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
            };

            let status = self
                .raw
                .compress(input, spare_slice, FlushCompress::None)
                .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

            let consumed = (self.raw.total_in() - before_in) as usize;
            let produced = (self.raw.total_out() - before_out) as usize;
            // SAFETY: exactly `produced` bytes of the spare capacity were written.
            unsafe {
                out.set_len(start + produced);
            }
            input = &input[consumed..];

            if status == Status::BufError && consumed == 0 && produced == 0 {
                return Err(Error::Compression("deflate stalled".to_string()));
            }
        }
        Ok(())
    }

    /// Flush the message and strip the `00 00 FF FF` trailer.
    ///
    /// The flush preserves the LZ77 window, so context carries into the next
    /// message unless no-context-takeover was negotiated.
    pub fn finish_message(&mut self, out: &mut BytesMut) -> Result<()> {
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().clamp(4096, 64 * 1024));
            }

            let before_out = self.raw.total_out();
            let start = out.len();
            let spare = out.spare_capacity_mut();
            let spare_len = spare.len();
            // SAFETY: as in write().
            let spare_slice = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare_len)
            };

            self.raw
                .compress(&[], spare_slice, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

            let produced = (self.raw.total_out() - before_out) as usize;
            // SAFETY: exactly `produced` bytes of the spare capacity were written.
            unsafe {
                out.set_len(start + produced);
            }

            // Flush is complete once output space was left over.
            if produced < spare_len {
                break;
            }
        }

        if out.len() >= 4 && out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - 4);
        } else {
            return Err(Error::Compression("sync flush produced no trailer".to_string()));
        }

        if self.reset_per_message {
            self.raw.reset();
        }
        Ok(())
    }
}
