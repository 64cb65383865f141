//! UTF-8 validation for text payloads
//!
//! Unfragmented text messages take the `simdutf8` whole-buffer fast path.
//! Fragmented (or inflated) text arrives in arbitrary runs, so
//! [`Utf8Validator`] validates incrementally: up to three bytes of a pending
//! multi-byte sequence carry over between writes. Surrogate code points and
//! overlong encodings are rejected at the earliest byte that rules out every
//! valid continuation.

/// Validate a complete buffer.
#[inline]
pub fn validate(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Incremental UTF-8 validator.
///
/// `write` accepts payload bytes as they are delivered; `finish` must pass on
/// the last byte of the last frame of a text message.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// Bytes of an incomplete sequence carried over from the previous write.
    pending: [u8; 4],
    pending_len: u8,
}

impl Utf8Validator {
    /// Create a validator in the clean state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next run of bytes.
    ///
    /// Returns `false` at the first byte that makes every extension of the
    /// input invalid. Once `false` is returned the validator state is
    /// unspecified; the session is failing anyway.
    pub fn write(&mut self, mut input: &[u8]) -> bool {
        // Finish a sequence split across the previous write boundary.
        while self.pending_len > 0 && !input.is_empty() {
            self.pending[self.pending_len as usize] = input[0];
            self.pending_len += 1;
            input = &input[1..];
            match std::str::from_utf8(&self.pending[..self.pending_len as usize]) {
                Ok(_) => {
                    self.pending_len = 0;
                }
                Err(e) if e.error_len().is_none() => {}
                Err(_) => return false,
            }
        }
        if input.is_empty() {
            return true;
        }

        match simdutf8::compat::from_utf8(input) {
            Ok(_) => true,
            Err(e) => {
                // A hard error is fatal; a truncated trailing sequence is
                // stashed and completed by the next write.
                if e.error_len().is_some() {
                    return false;
                }
                let tail = &input[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len() as u8;
                true
            }
        }
    }

    /// Check that no multi-byte sequence is left hanging.
    pub fn finish(&mut self) -> bool {
        let complete = self.pending_len == 0;
        self.pending_len = 0;
        complete
    }

    /// Reset to the clean state for the next message.
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepts_partitioned(data: &[u8], split: usize) -> bool {
        let mut v = Utf8Validator::new();
        let (a, b) = data.split_at(split.min(data.len()));
        v.write(a) && v.write(b) && v.finish()
    }

    #[test]
    fn whole_buffer_validation() {
        assert!(validate(b"Hello, World!"));
        assert!(validate("日本語".as_bytes()));
        assert!(validate(b""));
        assert!(!validate(&[0xFF]));
        assert!(!validate(&[0xC0, 0x80])); // overlong NUL
        assert!(!validate(&[0xED, 0xA0, 0x80])); // U+D800
    }

    #[test]
    fn incremental_ascii() {
        let mut v = Utf8Validator::new();
        assert!(v.write(b"hello"));
        assert!(v.write(b" world"));
        assert!(v.finish());
    }

    #[test]
    fn incremental_any_split_of_valid_input() {
        let data = "aé日本🎉z".as_bytes();
        for split in 0..=data.len() {
            assert!(accepts_partitioned(data, split), "split at {}", split);
        }
    }

    #[test]
    fn split_inside_every_sequence_width() {
        // 2-, 3-, and 4-byte sequences each split mid-character.
        for s in ["é", "日", "🎉"] {
            let bytes = s.as_bytes();
            for split in 1..bytes.len() {
                assert!(accepts_partitioned(bytes, split), "{:?} at {}", s, split);
            }
        }
    }

    #[test]
    fn rejects_at_earliest_invalid_byte() {
        let mut v = Utf8Validator::new();
        // 0xE0 0x80 is overlong regardless of the third byte.
        assert!(v.write(&[0xE0]));
        assert!(!v.write(&[0x80]));

        let mut v = Utf8Validator::new();
        // Surrogate lead: 0xED followed by 0xA0 can never be valid.
        assert!(v.write(&[0xED]));
        assert!(!v.write(&[0xA0]));

        let mut v = Utf8Validator::new();
        // Beyond U+10FFFF.
        assert!(!v.write(&[0xF5]));
    }

    #[test]
    fn rejects_bare_continuation() {
        let mut v = Utf8Validator::new();
        assert!(!v.write(&[0x80]));
    }

    #[test]
    fn finish_rejects_dangling_sequence() {
        let mut v = Utf8Validator::new();
        assert!(v.write(&[0xE4, 0xB8]));
        assert!(!v.finish());
    }

    #[test]
    fn finish_resets_for_next_message() {
        let mut v = Utf8Validator::new();
        assert!(v.write("完".as_bytes()));
        assert!(v.finish());
        assert!(v.write(b"next"));
        assert!(v.finish());
    }

    #[test]
    fn pending_sequence_rejoined_across_three_writes() {
        let bytes = "🎉".as_bytes(); // 4 bytes
        let mut v = Utf8Validator::new();
        assert!(v.write(&bytes[..1]));
        assert!(v.write(&bytes[1..2]));
        assert!(v.write(&bytes[2..]));
        assert!(v.finish());
    }
}
