//! Decoder and encoder for the legacy serialized-value text format.
//!
//! The format is self-describing and length-prefixed:
//!
//! ```text
//! N;                     null
//! b:1;                   bool
//! i:-3;                  integer
//! d:0.5;                 float
//! s:6:"pstype";          byte string, length counted in bytes
//! a:1:{i:0;s:1:"x";}     ordered key/value pairs
//! ```
//!
//! Decoding is a single left-to-right pass over the input. Encoding is total
//! and recomputes every length and count from the value itself.

use std::borrow::Cow;

/// Nesting ceiling applied when the caller does not configure one.
pub const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("malformed length at byte {offset}: {reason}")]
    MalformedLength { offset: usize, reason: String },
    #[error("unknown type tag {tag:?} at byte {offset}")]
    UnknownTag { offset: usize, tag: char },
    #[error("unexpected byte {found:?} at byte {offset}; expected {expected:?}")]
    UnexpectedByte { offset: usize, expected: char, found: char },
    #[error("invalid number {text:?} at byte {offset}")]
    InvalidNumber { offset: usize, text: String },
    #[error("invalid array key at byte {offset}: keys MUST be integers or strings")]
    InvalidKey { offset: usize },
    #[error("{remaining} trailing bytes after the top-level value at byte {offset}")]
    TrailingData { offset: usize, remaining: usize },
    #[error("array nesting exceeds the configured ceiling of {max_depth}")]
    DepthExceeded { max_depth: usize },
}

/// A float together with the digit text it was decoded from.
///
/// The text is kept so that `1.50` or `1.0E+25` re-encode exactly as they
/// were read. Floats built in code carry no text and render canonically.
#[derive(Debug, Clone)]
pub struct Float {
    value: f64,
    text: Option<String>,
}

impl Float {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self { value, text: None }
    }

    /// Parse float text in the legacy spelling, keeping the text for rendering.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        parse_float(text.as_bytes()).map(|value| Self { value, text: Some(text.to_string()) })
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    #[must_use]
    pub fn render(&self) -> Cow<'_, str> {
        match &self.text {
            Some(text) => Cow::Borrowed(text),
            None => Cow::Owned(canonical_float_text(self.value)),
        }
    }
}

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.value.to_bits() == other.value.to_bits() && self.text == other.text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(Float),
    Str(Vec<u8>),
    Array(Vec<(SerializedValue, SerializedValue)>),
}

impl SerializedValue {
    #[must_use]
    pub fn str(value: impl AsRef<[u8]>) -> Self {
        Self::Str(value.as_ref().to_vec())
    }

    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Float(Float::new(value))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(value.value()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// String payload as UTF-8, when it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[(SerializedValue, SerializedValue)]> {
        match self {
            Self::Array(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// First value stored under `key`. Duplicate keys are legal; later ones
    /// are only reachable through [`SerializedValue::as_array`].
    #[must_use]
    pub fn get(&self, key: &SerializedValue) -> Option<&SerializedValue> {
        self.as_array()?.iter().find(|(candidate, _)| candidate == key).map(|(_, value)| value)
    }

    /// Shorthand for [`SerializedValue::get`] with a string key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&SerializedValue> {
        self.as_array()?
            .iter()
            .find(|(candidate, _)| candidate.as_bytes() == Some(key.as_bytes()))
            .map(|(_, value)| value)
    }

    /// Drop preserved float text so every float renders canonically.
    #[must_use]
    pub fn canonicalize(self) -> Self {
        match self {
            Self::Float(float) => Self::Float(Float::new(float.value)),
            Self::Array(pairs) => Self::Array(
                pairs.into_iter().map(|(key, value)| (key.canonicalize(), value.canonicalize())).collect(),
            ),
            other => other,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub max_depth: usize,
    pub allow_trailing_data: bool,
    /// Reject arrays that close before their declared pair count.
    pub strict_array_counts: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, allow_trailing_data: false, strict_array_counts: false }
    }
}

/// Decode one complete value with default options.
///
/// # Errors
/// Returns a [`CodecError`] when the input is not one well-formed value.
pub fn decode(input: &[u8]) -> Result<SerializedValue, CodecError> {
    decode_with(input, &DecodeOptions::default())
}

/// Decode one value, applying the trailing-data policy from `options`.
///
/// # Errors
/// Returns a [`CodecError`] when the input is malformed, nests deeper than
/// `options.max_depth`, or carries trailing bytes the options do not allow.
pub fn decode_with(input: &[u8], options: &DecodeOptions) -> Result<SerializedValue, CodecError> {
    let (value, consumed) = decode_prefix(input, options)?;
    if consumed < input.len() && !options.allow_trailing_data {
        return Err(CodecError::TrailingData { offset: consumed, remaining: input.len() - consumed });
    }
    Ok(value)
}

/// Decode the value at the start of `input` and report how many bytes it used.
///
/// # Errors
/// Returns a [`CodecError`] when the leading value is malformed or too deep.
pub fn decode_prefix(
    input: &[u8],
    options: &DecodeOptions,
) -> Result<(SerializedValue, usize), CodecError> {
    let mut cursor = Cursor {
        input,
        pos: 0,
        max_depth: options.max_depth,
        strict_array_counts: options.strict_array_counts,
    };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

#[must_use]
pub fn encode(value: &SerializedValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &SerializedValue, out: &mut Vec<u8>) {
    match value {
        SerializedValue::Null => out.extend_from_slice(b"N;"),
        SerializedValue::Bool(flag) => {
            out.extend_from_slice(if *flag { b"b:1;" } else { b"b:0;" });
        }
        SerializedValue::Int(number) => {
            out.extend_from_slice(b"i:");
            out.extend_from_slice(number.to_string().as_bytes());
            out.push(b';');
        }
        SerializedValue::Float(float) => {
            out.extend_from_slice(b"d:");
            out.extend_from_slice(float.render().as_bytes());
            out.push(b';');
        }
        SerializedValue::Str(bytes) => {
            out.extend_from_slice(b"s:");
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.extend_from_slice(b":\"");
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\";");
        }
        SerializedValue::Array(pairs) => {
            out.extend_from_slice(b"a:");
            out.extend_from_slice(pairs.len().to_string().as_bytes());
            out.extend_from_slice(b":{");
            for (key, item) in pairs {
                encode_into(key, out);
                encode_into(item, out);
            }
            out.push(b'}');
        }
    }
}

/// Cheap lexical probe: does `text` look like an encoded value at all?
///
/// Only the leading tag and the closing delimiter are inspected, after
/// surrounding ASCII whitespace is set aside. Such padding still fails a
/// strict decode, so padded blobs surface as invalid rather than unchecked.
#[must_use]
pub fn looks_serialized(text: &[u8]) -> bool {
    let start = text.iter().position(|byte| !byte.is_ascii_whitespace()).unwrap_or(text.len());
    let end = text.iter().rposition(|byte| !byte.is_ascii_whitespace()).map_or(start, |index| index + 1);
    match &text[start..end] {
        b"N;" => true,
        [tag, b':', .., last] => match tag {
            b'a' => *last == b'}',
            b'b' | b'i' | b'd' | b's' => *last == b';',
            _ => false,
        },
        _ => false,
    }
}

fn canonical_float_text(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() { "INF" } else { "-INF" }.to_string()
    } else {
        value.to_string()
    }
}

fn parse_float(text: &[u8]) -> Option<f64> {
    match text {
        b"INF" => Some(f64::INFINITY),
        b"-INF" => Some(f64::NEG_INFINITY),
        b"NAN" => Some(f64::NAN),
        _ => {
            if !text.iter().any(u8::is_ascii_digit)
                || !text.iter().all(|byte| byte.is_ascii_digit() || b"+-.eE".contains(byte))
            {
                return None;
            }
            std::str::from_utf8(text).ok()?.parse::<f64>().ok()
        }
    }
}

fn parse_int(text: &[u8]) -> Option<i64> {
    std::str::from_utf8(text).ok()?.parse::<i64>().ok()
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    max_depth: usize,
    strict_array_counts: bool,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn next_byte(&mut self) -> Result<u8, CodecError> {
        let byte = self.peek().ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), CodecError> {
        let offset = self.pos;
        let found = self.next_byte()?;
        if found != expected {
            return Err(CodecError::UnexpectedByte {
                offset,
                expected: char::from(expected),
                found: char::from(found),
            });
        }
        Ok(())
    }

    /// Bytes up to (not including) `terminator`; the terminator is consumed.
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8], CodecError> {
        let input: &'a [u8] = self.input;
        let rest = input.get(self.pos..).unwrap_or_default();
        let Some(len) = rest.iter().position(|byte| *byte == terminator) else {
            return Err(CodecError::UnexpectedEof { offset: input.len() });
        };
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    /// Unsigned decimal length or count, followed by `delimiter`.
    fn length(&mut self, delimiter: u8) -> Result<usize, CodecError> {
        let offset = self.pos;
        let digits = self.input[offset..].iter().take_while(|byte| byte.is_ascii_digit()).count();
        self.pos += digits;

        match self.peek() {
            None => return Err(CodecError::UnexpectedEof { offset: self.pos }),
            Some(byte) if digits == 0 || byte != delimiter => {
                return Err(CodecError::MalformedLength {
                    offset,
                    reason: format!(
                        "expected decimal digits followed by {:?}, found {:?}",
                        char::from(delimiter),
                        char::from(byte)
                    ),
                });
            }
            Some(_) => {}
        }

        let text = &self.input[offset..self.pos];
        self.pos += 1;
        std::str::from_utf8(text).ok().and_then(|text| text.parse::<usize>().ok()).ok_or_else(|| {
            CodecError::MalformedLength {
                offset,
                reason: "length does not fit in a machine word".to_string(),
            }
        })
    }

    fn value(&mut self, depth: usize) -> Result<SerializedValue, CodecError> {
        let offset = self.pos;
        match self.next_byte()? {
            b'N' => {
                self.expect(b';')?;
                Ok(SerializedValue::Null)
            }
            b'b' => self.boolean(),
            b'i' => {
                self.expect(b':')?;
                let start = self.pos;
                let text = self.take_until(b';')?;
                parse_int(text).map(SerializedValue::Int).ok_or_else(|| CodecError::InvalidNumber {
                    offset: start,
                    text: String::from_utf8_lossy(text).into_owned(),
                })
            }
            b'd' => {
                self.expect(b':')?;
                let start = self.pos;
                let text = self.take_until(b';')?;
                let invalid = || CodecError::InvalidNumber {
                    offset: start,
                    text: String::from_utf8_lossy(text).into_owned(),
                };
                let value = parse_float(text).ok_or_else(invalid)?;
                let text = std::str::from_utf8(text).map_err(|_| invalid())?;
                Ok(SerializedValue::Float(Float { value, text: Some(text.to_string()) }))
            }
            b's' => self.string(),
            b'a' => self.array(depth),
            other => Err(CodecError::UnknownTag { offset, tag: char::from(other) }),
        }
    }

    fn boolean(&mut self) -> Result<SerializedValue, CodecError> {
        self.expect(b':')?;
        let offset = self.pos;
        let flag = match self.next_byte()? {
            b'0' => false,
            b'1' => true,
            other => {
                return Err(CodecError::InvalidNumber {
                    offset,
                    text: char::from(other).to_string(),
                })
            }
        };
        self.expect(b';')?;
        Ok(SerializedValue::Bool(flag))
    }

    fn string(&mut self) -> Result<SerializedValue, CodecError> {
        self.expect(b':')?;
        let len = self.length(b':')?;
        self.expect(b'"')?;

        let start = self.pos;
        let available = self.remaining();
        if len > available {
            return Err(CodecError::MalformedLength {
                offset: start,
                reason: format!("declared {len} bytes but only {available} remain"),
            });
        }

        let end = start + len;
        if self.input.get(end..end + 2) != Some(b"\";".as_slice()) {
            return Err(CodecError::MalformedLength {
                offset: start,
                reason: format!("payload of declared length {len} is not followed by `\";`"),
            });
        }

        self.pos = end + 2;
        Ok(SerializedValue::Str(self.input[start..end].to_vec()))
    }

    fn array(&mut self, depth: usize) -> Result<SerializedValue, CodecError> {
        let depth = depth + 1;
        if depth > self.max_depth {
            return Err(CodecError::DepthExceeded { max_depth: self.max_depth });
        }

        self.expect(b':')?;
        let count_offset = self.pos;
        let count = self.length(b':')?;
        self.expect(b'{')?;

        // The smallest pair (`i:0;N;`) is six bytes; the declared count alone
        // never sizes the allocation.
        let mut pairs = Vec::with_capacity(count.min(self.remaining() / 6));
        while pairs.len() < count {
            let key_offset = self.pos;
            match self.peek() {
                None => return Err(CodecError::UnexpectedEof { offset: key_offset }),
                Some(b'}') if self.strict_array_counts => {
                    return Err(CodecError::MalformedLength {
                        offset: count_offset,
                        reason: format!("declared {count} pairs but only {} present", pairs.len()),
                    });
                }
                Some(b'}') => break,
                Some(b'i' | b's') => {}
                Some(_) => return Err(CodecError::InvalidKey { offset: key_offset }),
            }

            let key = self.value(depth)?;
            let item = self.value(depth)?;
            pairs.push((key, item));
        }

        match self.peek() {
            None => Err(CodecError::UnexpectedEof { offset: self.pos }),
            Some(b'}') => {
                self.pos += 1;
                Ok(SerializedValue::Array(pairs))
            }
            Some(_) => Err(CodecError::MalformedLength {
                offset: count_offset,
                reason: format!("array holds more than the declared {count} pairs"),
            }),
        }
    }
}
