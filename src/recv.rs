//! Receive path: transport bytes to data frames
//!
//! A frame is consumed in three states: the fixed two-byte header prefix,
//! the extended header (length and mask key), then the payload. The machine
//! is fed from a transport buffer and yields back whenever the next state
//! cannot be served; suspension is legal only at those boundaries.
//!
//! Message size accounting runs against the header, before any payload byte
//! is copied. Control frames are surfaced whole to the driver; data payload
//! is unmasked, optionally inflated, UTF-8 checked for text, and appended to
//! the caller's buffer one frame at a time.

use bytes::{Buf, BytesMut};

#[cfg(feature = "permessage-deflate")]
use crate::deflate::Inflater;
use crate::error::{Error, Result};
use crate::frame::{self, Fh1, FrameHeader, OpCode};
use crate::mask::KeySchedule;
use crate::session::Role;
use crate::utf8::Utf8Validator;

/// What a completed read operation delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Opcode of the message this frame belongs to ([`OpCode::Text`] or
    /// [`OpCode::Binary`])
    pub opcode: OpCode,
    /// Whether this frame completes the message
    pub fin: bool,
}

/// A fully buffered, unmasked control frame.
#[derive(Debug)]
pub(crate) struct ControlFrame {
    pub opcode: OpCode,
    pub payload: BytesMut,
}

/// Outcome of one state machine step.
pub(crate) enum Step {
    /// The next state needs more transport bytes.
    NeedInput,
    /// A data frame completed; its bytes were appended to the caller buffer.
    Data(FrameInfo),
    /// A control frame arrived between data frames.
    Control(ControlFrame),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Fh1,
    Fh2(Fh1),
    Payload,
}

pub(crate) struct ReceivePath {
    role: Role,
    pmd_active: bool,
    msg_max: usize,
    rd_buf_size: usize,
    /// Unconsumed transport bytes.
    buf: BytesMut,

    phase: Phase,
    // Current frame.
    frame_opcode: OpCode,
    frame_fin: bool,
    frame_left: u64,
    key: Option<KeySchedule>,
    // Current message.
    expecting_continuation: bool,
    msg_opcode: OpCode,
    msg_size: u64,
    msg_compressed: bool,
    utf8: Utf8Validator,
    #[cfg(feature = "permessage-deflate")]
    inflater: Option<Inflater>,
}

impl ReceivePath {
    pub fn new(role: Role, msg_max: usize, rd_buf_size: usize) -> Self {
        Self {
            role,
            pmd_active: false,
            msg_max,
            rd_buf_size,
            buf: BytesMut::with_capacity(rd_buf_size),
            phase: Phase::Fh1,
            frame_opcode: OpCode::Continuation,
            frame_fin: false,
            frame_left: 0,
            key: None,
            expecting_continuation: false,
            msg_opcode: OpCode::Binary,
            msg_size: 0,
            msg_compressed: false,
            utf8: Utf8Validator::new(),
            #[cfg(feature = "permessage-deflate")]
            inflater: None,
        }
    }

    #[cfg(feature = "permessage-deflate")]
    pub fn set_inflater(&mut self, inflater: Inflater) {
        self.pmd_active = true;
        self.inflater = Some(inflater);
    }

    /// Transport buffer the session reads into; capacity for one read chunk
    /// is kept reserved.
    pub fn transport_buf(&mut self) -> &mut BytesMut {
        self.buf.reserve(self.rd_buf_size);
        &mut self.buf
    }

    /// Run the machine until it produces an event or runs out of input.
    pub fn advance(&mut self, out: &mut BytesMut) -> Result<Step> {
        loop {
            match self.phase {
                Phase::Fh1 => {
                    if self.buf.len() < 2 {
                        return Ok(Step::NeedInput);
                    }
                    let fh1 = frame::decode_fh1(
                        [self.buf[0], self.buf[1]],
                        self.role,
                        self.pmd_active,
                        self.expecting_continuation,
                    )?;
                    self.buf.advance(2);
                    self.phase = Phase::Fh2(fh1);
                }

                Phase::Fh2(fh1) => {
                    let need = fh1.remaining();
                    if self.buf.len() < need {
                        return Ok(Step::NeedInput);
                    }
                    let header = frame::decode_fh2(fh1, &self.buf[..need])?;
                    self.buf.advance(need);
                    self.begin_frame(&header)?;
                    self.phase = Phase::Payload;
                }

                Phase::Payload => {
                    if self.frame_opcode.is_control() {
                        // Control payload is at most 125 bytes; buffer it whole.
                        if (self.buf.len() as u64) < self.frame_left {
                            return Ok(Step::NeedInput);
                        }
                        let mut payload = self.buf.split_to(self.frame_left as usize);
                        if let Some(key) = self.key.as_mut() {
                            key.apply(&mut payload);
                        }
                        let opcode = self.frame_opcode;
                        self.phase = Phase::Fh1;
                        return Ok(Step::Control(ControlFrame { opcode, payload }));
                    }

                    if self.frame_left > 0 && self.buf.is_empty() {
                        return Ok(Step::NeedInput);
                    }
                    let take = (self.frame_left as usize).min(self.buf.len());
                    let mut chunk = self.buf.split_to(take);
                    if let Some(key) = self.key.as_mut() {
                        key.apply(&mut chunk);
                    }
                    self.frame_left -= take as u64;
                    let frame_done = self.frame_left == 0;

                    self.deliver(&chunk, frame_done, out)?;

                    if !frame_done {
                        continue;
                    }
                    let fin = self.frame_fin;
                    if fin {
                        if self.msg_opcode == OpCode::Text && !self.utf8.finish() {
                            return Err(Error::BadPayload("truncated utf-8 sequence"));
                        }
                        self.expecting_continuation = false;
                        self.msg_size = 0;
                        self.msg_compressed = false;
                        self.utf8.reset();
                    } else {
                        self.expecting_continuation = true;
                    }
                    self.phase = Phase::Fh1;
                    return Ok(Step::Data(FrameInfo {
                        opcode: self.msg_opcode,
                        fin,
                    }));
                }
            }
        }
    }

    /// Header-time frame setup and message size accounting.
    fn begin_frame(&mut self, fh: &FrameHeader) -> Result<()> {
        self.key = fh.mask.map(KeySchedule::new);
        self.frame_opcode = fh.opcode;
        self.frame_fin = fh.fin;
        self.frame_left = fh.payload_len;

        if fh.opcode.is_control() {
            return Ok(());
        }
        if fh.opcode == OpCode::Continuation {
            self.msg_size = self
                .msg_size
                .checked_add(fh.payload_len)
                .ok_or(Error::TooBig)?;
        } else {
            self.msg_opcode = fh.opcode;
            self.msg_size = fh.payload_len;
            self.msg_compressed = fh.rsv1;
        }
        if self.msg_max != 0 && self.msg_size > self.msg_max as u64 {
            return Err(Error::TooBig);
        }
        Ok(())
    }

    /// Route one unmasked payload chunk into the caller buffer.
    fn deliver(&mut self, chunk: &[u8], frame_done: bool, out: &mut BytesMut) -> Result<()> {
        let start = out.len();

        #[cfg(feature = "permessage-deflate")]
        if self.msg_compressed {
            let inflater = self
                .inflater
                .as_mut()
                .ok_or(Error::Protocol("rsv1 set without negotiated extension"))?;
            inflater.write(chunk, out, self.msg_max)?;
            if frame_done && self.frame_fin {
                inflater.finish_message(out, self.msg_max)?;
            }
        } else {
            out.extend_from_slice(chunk);
        }

        #[cfg(not(feature = "permessage-deflate"))]
        {
            let _ = frame_done;
            out.extend_from_slice(chunk);
        }

        if self.msg_opcode == OpCode::Text && !self.utf8.write(&out[start..]) {
            return Err(Error::BadPayload("invalid utf-8 in text message"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_path() -> ReceivePath {
        ReceivePath::new(Role::Server, 0, 4096)
    }

    fn client_path() -> ReceivePath {
        ReceivePath::new(Role::Client, 0, 4096)
    }

    fn feed(path: &mut ReceivePath, bytes: &[u8]) {
        path.transport_buf().extend_from_slice(bytes);
    }

    #[test]
    fn unfragmented_text() {
        let mut path = client_path();
        let mut out = BytesMut::new();
        feed(&mut path, &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);

        match path.advance(&mut out).unwrap() {
            Step::Data(info) => {
                assert_eq!(info.opcode, OpCode::Text);
                assert!(info.fin);
            }
            _ => panic!("expected a data frame"),
        }
        assert_eq!(&out[..], b"hello");
        assert!(matches!(path.advance(&mut out).unwrap(), Step::NeedInput));
    }

    #[test]
    fn masked_payload_is_unmasked() {
        let mut path = server_path();
        let mut out = BytesMut::new();
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut payload = *b"Hello";
        crate::mask::apply_mask(&mut payload, mask);

        feed(&mut path, &[0x81, 0x85]);
        feed(&mut path, &mask);
        feed(&mut path, &payload);

        assert!(matches!(path.advance(&mut out).unwrap(), Step::Data(_)));
        assert_eq!(&out[..], b"Hello");
    }

    #[test]
    fn fragmented_message_yields_per_frame() {
        let mut path = client_path();
        let mut out = BytesMut::new();

        feed(&mut path, &[0x01, 0x02, b'H', b'e']);
        match path.advance(&mut out).unwrap() {
            Step::Data(info) => {
                assert_eq!(info.opcode, OpCode::Text);
                assert!(!info.fin);
            }
            _ => panic!("expected first fragment"),
        }

        feed(&mut path, &[0x80, 0x03, b'l', b'l', b'o']);
        match path.advance(&mut out).unwrap() {
            Step::Data(info) => {
                assert_eq!(info.opcode, OpCode::Text);
                assert!(info.fin);
            }
            _ => panic!("expected final fragment"),
        }
        assert_eq!(&out[..], b"Hello");
    }

    #[test]
    fn control_frame_between_fragments() {
        let mut path = client_path();
        let mut out = BytesMut::new();

        feed(&mut path, &[0x01, 0x02, b'H', b'e']);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::Data(_)));

        feed(&mut path, &[0x89, 0x00]);
        match path.advance(&mut out).unwrap() {
            Step::Control(ctl) => {
                assert_eq!(ctl.opcode, OpCode::Ping);
                assert!(ctl.payload.is_empty());
            }
            _ => panic!("expected interleaved ping"),
        }

        feed(&mut path, &[0x80, 0x03, b'l', b'l', b'o']);
        assert!(matches!(
            path.advance(&mut out).unwrap(),
            Step::Data(FrameInfo { fin: true, .. })
        ));
        assert_eq!(&out[..], b"Hello");
    }

    #[test]
    fn header_split_across_reads() {
        let mut path = client_path();
        let mut out = BytesMut::new();

        feed(&mut path, &[0x82]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::NeedInput));
        feed(&mut path, &[126]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::NeedInput));
        feed(&mut path, &[0x00]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::NeedInput));
        feed(&mut path, &[0x80]);

        // 128 payload bytes, delivered in two runs.
        feed(&mut path, &[0xAB; 100]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::NeedInput));
        feed(&mut path, &[0xAB; 28]);
        assert!(matches!(
            path.advance(&mut out).unwrap(),
            Step::Data(FrameInfo { fin: true, .. })
        ));
        assert_eq!(out.len(), 128);
    }

    #[test]
    fn message_size_cap_hits_before_payload() {
        let mut path = ReceivePath::new(Role::Client, 8, 4096);
        let mut out = BytesMut::new();
        // 9-byte frame header alone must trip the cap.
        feed(&mut path, &[0x82, 0x09]);
        assert!(matches!(path.advance(&mut out), Err(Error::TooBig)));
    }

    #[test]
    fn fragment_sizes_accumulate_toward_cap() {
        let mut path = ReceivePath::new(Role::Client, 8, 4096);
        let mut out = BytesMut::new();
        feed(&mut path, &[0x02, 0x05, 1, 2, 3, 4, 5]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::Data(_)));
        feed(&mut path, &[0x80, 0x05]);
        assert!(matches!(path.advance(&mut out), Err(Error::TooBig)));
    }

    #[test]
    fn invalid_utf8_rejected_mid_message() {
        let mut path = client_path();
        let mut out = BytesMut::new();
        feed(&mut path, &[0x81, 0x01, 0xFF]);
        assert!(matches!(path.advance(&mut out), Err(Error::BadPayload(_))));
    }

    #[test]
    fn utf8_split_across_fragments_is_fine() {
        let bytes = "é".as_bytes();
        let mut path = client_path();
        let mut out = BytesMut::new();
        feed(&mut path, &[0x01, 0x01, bytes[0]]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::Data(_)));
        feed(&mut path, &[0x80, 0x01, bytes[1]]);
        assert!(matches!(path.advance(&mut out).unwrap(), Step::Data(_)));
        assert_eq!(&out[..], bytes);
    }

    #[test]
    fn utf8_dangling_at_fin_rejected() {
        let bytes = "é".as_bytes();
        let mut path = client_path();
        let mut out = BytesMut::new();
        feed(&mut path, &[0x81, 0x01, bytes[0]]);
        assert!(matches!(path.advance(&mut out), Err(Error::BadPayload(_))));
    }

    #[test]
    fn rsv1_without_extension_rejected() {
        let mut path = client_path();
        let mut out = BytesMut::new();
        feed(&mut path, &[0xC1, 0x00]);
        assert!(matches!(path.advance(&mut out), Err(Error::Protocol(_))));
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn compressed_message_inflates() {
        use crate::deflate::{Deflater, Inflater};

        let mut deflater = Deflater::new(15, false);
        let mut wire = BytesMut::new();
        deflater.write(b"Hello", &mut wire).unwrap();
        deflater.finish_message(&mut wire).unwrap();

        let mut path = client_path();
        path.set_inflater(Inflater::new(15, false));
        let mut out = BytesMut::new();

        let mut bytes = vec![0xC1, wire.len() as u8];
        bytes.extend_from_slice(&wire);
        feed(&mut path, &bytes);

        match path.advance(&mut out).unwrap() {
            Step::Data(info) => {
                assert_eq!(info.opcode, OpCode::Text);
                assert!(info.fin);
            }
            _ => panic!("expected inflated text frame"),
        }
        assert_eq!(&out[..], b"Hello");
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn compressed_fragments_inflate_across_frames() {
        use crate::deflate::{Deflater, Inflater};

        let mut deflater = Deflater::new(15, false);
        let mut wire = BytesMut::new();
        deflater
            .write(b"fragmented compressed payload", &mut wire)
            .unwrap();
        deflater.finish_message(&mut wire).unwrap();

        let split = wire.len() / 2;
        let mut path = client_path();
        path.set_inflater(Inflater::new(15, false));
        let mut out = BytesMut::new();

        let mut first = vec![0x41, split as u8];
        first.extend_from_slice(&wire[..split]);
        feed(&mut path, &first);
        assert!(matches!(
            path.advance(&mut out).unwrap(),
            Step::Data(FrameInfo { fin: false, .. })
        ));

        let mut second = vec![0x80, (wire.len() - split) as u8];
        second.extend_from_slice(&wire[split..]);
        feed(&mut path, &second);
        assert!(matches!(
            path.advance(&mut out).unwrap(),
            Step::Data(FrameInfo { fin: true, .. })
        ));
        assert_eq!(&out[..], b"fragmented compressed payload");
    }
}
