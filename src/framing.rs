//! Wire framing codec.
//!
//! A [`FramingConfig`] is derived once from the configured mode string and then shared read-only by every
//! connection. The mode character selects the header representation, and repeating it sets the header width:
//!
//! | Mode | Header |
//! |------|--------|
//! | `l` / `L` | little-endian length, excluding / including its own width |
//! | `b` / `B` | big-endian length, excluding / including its own width |
//! | `a` / `A` | zero-padded ASCII decimal length, excluding / including its own width |
//! | `d` | no header, message terminated by the stop delimiter |
//! | `D` | no header, message enclosed in start and stop delimiters |
//!
//! So `"llll"` is a four byte little-endian length that does not count itself, and `"AAAAAA"` is a six digit
//! decimal length that does.
//!
//! Integer headers are built and read byte by byte in the configured order, never through the machine's native
//! endianness. The optional half-swap exchanges the two halves of the header region on both encode and decode,
//! so it is its own inverse.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ConfigError, FrameError};

/// Header representation selected by the framing mode character.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FramingMode {
    /// Binary little-endian length.
    LittleEndian,
    /// Binary big-endian length.
    BigEndian,
    /// ASCII decimal length.
    Ascii,
    /// Stop delimiter only.
    Delimited,
    /// Start and stop delimiters.
    StartStopDelimited,
}

impl FramingMode {
    /// Returns `true` for the delimiter modes, which carry no length header.
    pub fn is_delimited(&self) -> bool {
        matches!(self, FramingMode::Delimited | FramingMode::StartStopDelimited)
    }
}

/// Immutable framing parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramingConfig {
    mode: FramingMode,
    width: usize,
    includes_header: bool,
    offset: usize,
    half_swap: bool,
    keep_header: bool,
    max_len: Option<usize>,
    start: u8,
    stop: u8,
}

impl FramingConfig {
    /// Parses a mode string such as `"llll"`, `"BB"` or `"d"`.
    pub fn parse(framing: &str) -> Result<Self, ConfigError> {
        let mut chars = framing.chars();
        let first = chars
            .next()
            .ok_or_else(|| ConfigError::Framing(framing.to_string()))?;
        if chars.any(|c| c != first) {
            return Err(ConfigError::Framing(framing.to_string()));
        }

        let width = framing.len();
        let (mode, includes_header) = match first {
            'l' => (FramingMode::LittleEndian, false),
            'L' => (FramingMode::LittleEndian, true),
            'b' => (FramingMode::BigEndian, false),
            'B' => (FramingMode::BigEndian, true),
            'a' => (FramingMode::Ascii, false),
            'A' => (FramingMode::Ascii, true),
            'd' if width == 1 => (FramingMode::Delimited, false),
            'D' if width == 1 => (FramingMode::StartStopDelimited, false),
            _ => return Err(ConfigError::Framing(framing.to_string())),
        };

        Ok(FramingConfig {
            mode,
            width: if mode.is_delimited() { 0 } else { width },
            includes_header,
            offset: 0,
            half_swap: false,
            keep_header: false,
            max_len: None,
            start: 0x02,
            stop: 0x03,
        })
    }

    /// Sets the number of reserved leading header bytes.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Enables the header half-swap.
    pub fn with_half_swap(mut self, half_swap: bool) -> Self {
        self.half_swap = half_swap;
        self
    }

    /// Keeps the header as part of the logical message.
    pub fn with_keep_header(mut self, keep_header: bool) -> Self {
        self.keep_header = keep_header;
        self
    }

    /// Sets the maximum payload length.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Sets the start and stop delimiters.
    pub fn with_delimiters(mut self, start: u8, stop: u8) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    /// Checks that the parameters describe a representable header.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode.is_delimited() {
            if self.offset != 0 || self.half_swap || self.keep_header {
                return Err(ConfigError::Invalid(
                    "delimiter framing takes no offset, half-swap or header retention".into(),
                ));
            }
            if self.mode == FramingMode::StartStopDelimited && self.start == self.stop {
                return Err(ConfigError::Invalid(
                    "start and stop delimiters must differ".into(),
                ));
            }
            return Ok(());
        }

        if self.offset >= self.width {
            return Err(ConfigError::Invalid(format!(
                "framing offset {} leaves no room in a {} byte header",
                self.offset, self.width
            )));
        }
        if self.half_swap && self.width % 2 != 0 {
            return Err(ConfigError::Invalid(
                "half-swap requires an even header width".into(),
            ));
        }
        let field = self.width - self.offset;
        let limit = match self.mode {
            FramingMode::Ascii => 19,
            _ => 8,
        };
        if field > limit {
            return Err(ConfigError::Invalid(format!(
                "length field of {field} bytes is wider than {limit}"
            )));
        }
        Ok(())
    }

    /// Header representation.
    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Header width in bytes; zero in delimiter modes.
    pub fn header_width(&self) -> usize {
        self.width
    }

    /// Reserved leading header bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the declared length counts the header itself.
    pub fn includes_header(&self) -> bool {
        self.includes_header
    }

    /// Whether decoded messages keep their header.
    pub fn keeps_header(&self) -> bool {
        self.keep_header
    }

    /// Maximum payload length, if any.
    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Returns `true` if a decoded message carries no payload and must be treated as a keep-alive.
    pub fn is_keepalive(&self, message: &[u8]) -> bool {
        message.len() == self.retained_header_len()
    }

    /// The frame written as a keep-alive.
    pub fn keepalive_frame(&self) -> Result<Bytes, FrameError> {
        self.encode(&vec![0; self.retained_header_len()])
    }

    fn retained_header_len(&self) -> usize {
        if self.keep_header {
            self.width
        } else {
            0
        }
    }

    /// Encodes a logical message into the bytes to write.
    ///
    /// With header retention the message must start with `header_width` bytes; the reserved offset bytes are
    /// taken from it and the length field is overwritten.
    pub fn encode(&self, message: &[u8]) -> Result<Bytes, FrameError> {
        if self.mode.is_delimited() {
            self.check_max(message.len() as u64)?;
            self.check_delimiters(message)?;
            let mut out = BytesMut::with_capacity(message.len() + 2);
            if self.mode == FramingMode::StartStopDelimited {
                out.put_u8(self.start);
            }
            out.put_slice(message);
            out.put_u8(self.stop);
            return Ok(out.freeze());
        }

        let (mut header, payload) = if self.keep_header {
            if message.len() < self.width {
                return Err(FrameError::MissingHeader {
                    len: message.len(),
                    header: self.width,
                });
            }
            let (header, payload) = message.split_at(self.width);
            (header.to_vec(), payload)
        } else {
            (vec![0; self.width], message)
        };
        self.check_max(payload.len() as u64)?;

        let declared = if self.includes_header {
            payload.len() + self.width
        } else {
            payload.len()
        };
        self.write_length(&mut header[self.offset..], declared)?;
        if self.half_swap {
            half_swap(&mut header);
        }

        let mut out = BytesMut::with_capacity(self.width + payload.len());
        out.put_slice(&header);
        out.put_slice(payload);
        Ok(out.freeze())
    }

    fn write_length(&self, field: &mut [u8], len: usize) -> Result<(), FrameError> {
        let n = field.len();
        let unencodable = || FrameError::Unencodable { len, width: n };
        let value = len as u64;
        match self.mode {
            FramingMode::LittleEndian | FramingMode::BigEndian => {
                if n < 8 && value >> (8 * n) != 0 {
                    return Err(unencodable());
                }
                for i in 0..n {
                    let byte = (value >> (8 * i)) as u8;
                    match self.mode {
                        FramingMode::LittleEndian => field[i] = byte,
                        _ => field[n - 1 - i] = byte,
                    }
                }
            }
            FramingMode::Ascii => {
                let digits = value.to_string();
                if digits.len() > n {
                    return Err(unencodable());
                }
                let pad = n - digits.len();
                field[..pad].fill(b'0');
                field[pad..].copy_from_slice(digits.as_bytes());
            }
            FramingMode::Delimited | FramingMode::StartStopDelimited => {}
        }
        Ok(())
    }

    /// Reads the next logical message from `reader`.
    ///
    /// Zero-payload messages are returned as-is; callers discard them with [`is_keepalive`](Self::is_keepalive).
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Bytes, FrameError>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.mode.is_delimited() {
            self.decode_delimited(reader).await
        } else {
            self.decode_length(reader).await
        }
    }

    async fn decode_length<R>(&self, reader: &mut R) -> Result<Bytes, FrameError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut header = vec![0; self.width];
        reader.read_exact(&mut header).await.map_err(eof)?;

        let mut raw = header.clone();
        if self.half_swap {
            half_swap(&mut raw);
        }
        let declared = self.read_length(&raw[self.offset..])?;
        let len = if self.includes_header {
            declared
                .checked_sub(self.width as u64)
                .ok_or(FrameError::NegativeLength {
                    declared,
                    header: self.width,
                })?
        } else {
            declared
        };
        self.check_max(len)?;

        let mut buf = Vec::new();
        if self.keep_header {
            buf.extend_from_slice(&header);
        }
        let read = (&mut *reader).take(len).read_to_end(&mut buf).await?;
        if (read as u64) < len {
            return Err(FrameError::Eof);
        }
        Ok(Bytes::from(buf))
    }

    fn read_length(&self, field: &[u8]) -> Result<u64, FrameError> {
        match self.mode {
            FramingMode::BigEndian => field.iter().try_fold(0u64, |acc, &byte| {
                if acc > u64::MAX >> 8 {
                    return Err(FrameError::MalformedHeader("length overflows".into()));
                }
                Ok(acc << 8 | u64::from(byte))
            }),
            FramingMode::LittleEndian => {
                field
                    .iter()
                    .enumerate()
                    .try_fold(0u64, |acc, (i, &byte)| match i {
                        0..=7 => Ok(acc | u64::from(byte) << (8 * i)),
                        _ if byte == 0 => Ok(acc),
                        _ => Err(FrameError::MalformedHeader("length overflows".into())),
                    })
            }
            FramingMode::Ascii => {
                if !field.iter().all(u8::is_ascii_digit) {
                    return Err(FrameError::MalformedHeader(format!(
                        "non-decimal header {:?}",
                        String::from_utf8_lossy(field)
                    )));
                }
                // Digits only, so the slice is valid UTF-8.
                std::str::from_utf8(field)
                    .ok()
                    .and_then(|digits| digits.parse::<u64>().ok())
                    .ok_or_else(|| FrameError::MalformedHeader("length overflows".into()))
            }
            FramingMode::Delimited | FramingMode::StartStopDelimited => Ok(0),
        }
    }

    async fn decode_delimited<R>(&self, reader: &mut R) -> Result<Bytes, FrameError>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.mode == FramingMode::StartStopDelimited {
            let found = reader.read_u8().await.map_err(eof)?;
            if found != self.start {
                return Err(FrameError::DelimiterMismatch {
                    expected: self.start,
                    found,
                });
            }
        }

        // One byte beyond the ceiling leaves room for the stop delimiter.
        let limit = self
            .max_len
            .map(|max| max as u64 + 1)
            .unwrap_or(u64::MAX);
        let mut buf = Vec::new();
        let read = (&mut *reader)
            .take(limit)
            .read_until(self.stop, &mut buf)
            .await?;
        if buf.last() != Some(&self.stop) {
            if read as u64 == limit {
                return Err(FrameError::TooLong {
                    len: read as u64,
                    max: self.max_len.unwrap_or(usize::MAX),
                });
            }
            return Err(FrameError::Eof);
        }
        buf.pop();
        Ok(Bytes::from(buf))
    }

    // A delimiter inside the payload would split or shift the frame on the peer's side.
    fn check_delimiters(&self, message: &[u8]) -> Result<(), FrameError> {
        let start = (self.mode == FramingMode::StartStopDelimited).then_some(self.start);
        match message
            .iter()
            .position(|byte| *byte == self.stop || Some(*byte) == start)
        {
            Some(position) => Err(FrameError::DelimiterInPayload {
                byte: message[position],
                position,
            }),
            None => Ok(()),
        }
    }

    fn check_max(&self, len: u64) -> Result<(), FrameError> {
        match self.max_len {
            Some(max) if len > max as u64 => Err(FrameError::TooLong { len, max }),
            _ => Ok(()),
        }
    }
}

fn half_swap(header: &mut [u8]) {
    let (front, back) = header.split_at_mut(header.len() / 2);
    front.swap_with_slice(back);
}

fn eof(err: std::io::Error) -> FrameError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::Eof,
        _ => FrameError::Io(err),
    }
}
