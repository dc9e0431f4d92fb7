//! String pool and relocation records
//!
//! String literals are interned here as they are lowered; the payload is
//! appended to the buffer at footer time and every recorded displacement
//! slot patched to point at it. Escape decoding happens at interning, not
//! in the parser; raw literals bypass it.

use crate::diag::n_error;
use crate::Result;

/// Addressing mode of a pending reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// PC-relative, sign-extended, 8 bits.
    Rel8,
    /// PC-relative, sign-extended, 16 bits.
    Rel16,
    /// PC-relative, sign-extended, 32 bits.
    Rel32,
    /// PC-relative, sign-extended, 64 bits.
    Rel64,
    /// Absolute 64-bit address within the image.
    Abs64,
    /// arm64 ADR, 21-bit PC-relative immediate split across the word.
    Adr21,
}

/// One interned string literal.
#[derive(Debug, Clone)]
pub struct StringEntry {
    /// Decoded payload bytes.
    pub bytes: Vec<u8>,
    /// Offset of the displacement field that must point at the payload.
    pub ref_pos: usize,
    pub kind: RelocKind,
}

#[derive(Debug, Default)]
pub struct StringPool {
    pub entries: Vec<StringEntry>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending string reference and return its handle.
    pub fn allocate(&mut self, bytes: Vec<u8>, ref_pos: usize, kind: RelocKind) -> usize {
        self.entries.push(StringEntry {
            bytes,
            ref_pos,
            kind,
        });
        self.entries.len() - 1
    }
}

/// Decode the escape sequences of a string literal into raw bytes.
///
/// Handled: `\\`, `\'`, `\"`, `\a \b \f \n \r \t \v`, `\uXXXX` (encoded as
/// little-endian UTF-16 without surrogate pairing), `\xHH`, and octal
/// `\0`…`\777`. Anything else after a backslash is fatal.
pub fn decode_escapes(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        let esc = chars
            .next()
            .ok_or_else(|| n_error("trailing backslash in string literal"))?;
        match esc {
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0C),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0B),
            'u' => {
                let mut val: u16 = 0;
                for _ in 0..4 {
                    let d = chars
                        .next()
                        .and_then(|c| c.to_digit(16))
                        .ok_or_else(|| n_error("invalid \\u escape: expected 4 hex digits"))?;
                    val = (val << 4) | d as u16;
                }
                out.extend_from_slice(&val.to_le_bytes());
            }
            'x' => {
                let mut val: u8 = 0;
                for _ in 0..2 {
                    let d = chars
                        .next()
                        .and_then(|c| c.to_digit(16))
                        .ok_or_else(|| n_error("invalid \\x escape: expected 2 hex digits"))?;
                    val = (val << 4) | d as u8;
                }
                out.push(val);
            }
            '0'..='7' => {
                // The match arm already pins `esc` to an octal digit.
                let mut val: u32 = esc as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            chars.next();
                            val = (val << 3) | d;
                        }
                        None => break,
                    }
                }
                if val > 0xFF {
                    return Err(n_error(format!("octal escape out of range: \\{val:o}")));
                }
                out.push(val as u8);
            }
            other => {
                return Err(n_error(format!("invalid escape sequence: \\{other}")));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_passthrough() {
        assert_eq!(decode_escapes("Hello, World!").unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_c_escapes() {
        assert_eq!(
            decode_escapes("a\\n\\t\\\\b").unwrap(),
            vec![b'a', b'\n', b'\t', b'\\', b'b']
        );
        assert_eq!(decode_escapes("\\a\\v\\f").unwrap(), vec![0x07, 0x0B, 0x0C]);
    }

    #[test]
    fn test_hex_and_octal() {
        assert_eq!(decode_escapes("\\x41").unwrap(), vec![0x41]);
        assert_eq!(decode_escapes("\\101").unwrap(), vec![0o101]);
        assert_eq!(decode_escapes("\\0").unwrap(), vec![0]);
        // Octal stops after three digits.
        assert_eq!(decode_escapes("\\1019").unwrap(), vec![0o101, b'9']);
    }

    #[test]
    fn test_unicode_is_utf16_le() {
        assert_eq!(decode_escapes("\\u0042").unwrap(), vec![0x42, 0x00]);
        assert_eq!(decode_escapes("\\u20AC").unwrap(), vec![0xAC, 0x20]);
    }

    #[test]
    fn test_scenario_string() {
        // "\x41B\101" reads ABA once the UTF-16 NUL is invisible.
        assert_eq!(
            decode_escapes("\\x41\\u0042\\101").unwrap(),
            vec![0x41, 0x42, 0x00, 0x41]
        );
    }

    #[test]
    fn test_invalid_escape_is_fatal() {
        assert!(decode_escapes("\\q").is_err());
        assert!(decode_escapes("\\x4").is_err());
        assert!(decode_escapes("\\u12").is_err());
        assert!(decode_escapes("tail\\").is_err());
    }

    #[test]
    fn test_multibyte_source_chars() {
        assert_eq!(decode_escapes("é").unwrap(), "é".as_bytes());
    }
}
