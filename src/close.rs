//! Close handshake tracking
//!
//! The engine is terminal once both close frames have crossed the wire, or
//! immediately upon failing the connection. Flags live in atomics so the
//! reader and writer halves of a split session can consult them without
//! taking the frame write lock.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::utf8;

/// Close handshake state shared by both halves of a session.
#[derive(Debug)]
pub(crate) struct CloseEngine {
    close_sent: AtomicBool,
    close_received: AtomicBool,
    failed: AtomicBool,
    received_reason: Mutex<Option<CloseReason>>,
}

impl CloseEngine {
    pub fn new() -> Self {
        Self {
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            received_reason: Mutex::new(None),
        }
    }

    /// Reject reads on a terminal session.
    pub fn check_readable(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Failed);
        }
        if self.close_received.load(Ordering::Acquire) {
            return Err(Error::Closed(self.received_reason()));
        }
        Ok(())
    }

    /// Reject writes once a close frame has gone out.
    pub fn check_writable(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Failed);
        }
        if self.close_sent.load(Ordering::Acquire) {
            return Err(Error::Closed(self.received_reason()));
        }
        Ok(())
    }

    /// Claim the right to emit the close frame.
    ///
    /// Exactly one caller wins; everyone else must not write another close.
    pub fn try_claim_send(&self) -> bool {
        self.close_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    pub fn mark_received(&self, reason: Option<CloseReason>) {
        if let Ok(mut slot) = self.received_reason.lock() {
            *slot = reason;
        }
        self.close_received.store(true, Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn received_reason(&self) -> Option<CloseReason> {
        self.received_reason
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }
}

/// Decode a close frame payload.
///
/// Accepts an empty payload, or a big-endian status code optionally followed
/// by a UTF-8 reason. A one-byte payload, a code outside the acceptable set,
/// or a malformed reason are protocol errors.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() == 1 {
        return Err(Error::Protocol("close payload of one byte"));
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !CloseReason::is_valid_code(code) {
        return Err(Error::Protocol("invalid close code"));
    }
    let reason = &payload[2..];
    if !utf8::validate(reason) {
        return Err(Error::Protocol("close reason not valid utf-8"));
    }
    Ok(Some(CloseReason::new(
        code,
        String::from_utf8_lossy(reason).into_owned(),
    )))
}

/// Encode a close frame payload.
pub(crate) fn encode_close_payload(reason: Option<&CloseReason>, buf: &mut BytesMut) {
    if let Some(r) = reason {
        buf.reserve(2 + r.reason.len());
        buf.put_u16(r.code);
        buf.put_slice(r.reason.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_no_reason() {
        assert_eq!(parse_close_payload(&[]).unwrap(), None);
    }

    #[test]
    fn one_byte_payload_rejected() {
        assert!(parse_close_payload(&[0x03]).is_err());
    }

    #[test]
    fn code_and_reason_roundtrip() {
        let reason = CloseReason::new(1000, "bye");
        let mut buf = BytesMut::new();
        encode_close_payload(Some(&reason), &mut buf);
        assert_eq!(&buf[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(parse_close_payload(&buf).unwrap(), Some(reason));
    }

    #[test]
    fn application_range_accepted() {
        assert_eq!(
            parse_close_payload(&[0x0F, 0xA0]).unwrap(),
            Some(CloseReason::new(4000, ""))
        );
    }

    #[test]
    fn reserved_codes_rejected() {
        for code in [0u16, 999, 1004, 1005, 1006, 1016, 2999, 5000] {
            let bytes = code.to_be_bytes();
            assert!(parse_close_payload(&bytes).is_err(), "code {}", code);
        }
    }

    #[test]
    fn invalid_reason_utf8_rejected() {
        assert!(parse_close_payload(&[0x03, 0xE8, 0xFF]).is_err());
    }

    #[test]
    fn engine_lifecycle() {
        let engine = CloseEngine::new();
        assert!(engine.check_readable().is_ok());
        assert!(engine.check_writable().is_ok());

        assert!(engine.try_claim_send());
        assert!(!engine.try_claim_send());
        assert!(matches!(engine.check_writable(), Err(Error::Closed(_))));
        assert!(engine.check_readable().is_ok());

        engine.mark_received(Some(CloseReason::new(1000, "")));
        assert!(matches!(engine.check_readable(), Err(Error::Closed(_))));
        assert_eq!(engine.received_reason(), Some(CloseReason::new(1000, "")));
    }

    #[test]
    fn failed_wins_over_closed() {
        let engine = CloseEngine::new();
        engine.mark_received(None);
        engine.mark_failed();
        assert!(matches!(engine.check_readable(), Err(Error::Failed)));
        assert!(matches!(engine.check_writable(), Err(Error::Failed)));
    }
}
