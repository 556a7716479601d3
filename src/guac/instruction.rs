//! Instruction codec for the guacd wire protocol.
//!
//! An instruction is a comma-separated list of elements terminated by `;`.
//! Every element is `<len>.<value>` where `len` is the UTF-8 byte length of
//! `value`. The first element is the opcode, the remaining ones are args:
//!
//! ```text
//! 4.size,4.1024,3.768,2.96;
//! ```
//!
//! Lengths are authoritative. A value may contain `,`, `.` or `;` and is
//! still framed correctly.

use std::fmt;
use std::sync::OnceLock;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use super::error::{ProtocolError, TunnelError};

/// Terminates every instruction.
pub const DELIMITER: u8 = b';';

/// Opcode of relay-internal instructions (never forwarded to guacd).
pub const INTERNAL_OPCODE: &str = "";

/// Upper bound on a single frame read from guacd (default 8 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// A decoded instruction. Serialization is computed once and cached.
#[derive(Debug, Clone)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
    encoded: OnceLock<String>,
}

impl Instruction {
    pub fn new<O, I, A>(opcode: O, args: I) -> Self
    where
        O: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
            encoded: OnceLock::new(),
        }
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Wire form of this instruction, including the trailing `;`.
    pub fn encode(&self) -> &str {
        self.encoded
            .get_or_init(|| encode(&self.opcode, &self.args))
    }

    pub fn is_internal(&self) -> bool {
        self.opcode == INTERNAL_OPCODE
    }
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode && self.args == other.args
    }
}

impl Eq for Instruction {}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Encode an opcode and its arguments.
pub fn encode<S: AsRef<str>>(opcode: &str, args: &[S]) -> String {
    let mut out = String::with_capacity(
        opcode.len() + args.iter().map(|a| a.as_ref().len() + 8).sum::<usize>() + 8,
    );
    push_element(&mut out, opcode);
    for arg in args {
        out.push(',');
        push_element(&mut out, arg.as_ref());
    }
    out.push(char::from(DELIMITER));
    out
}

fn push_element(out: &mut String, value: &str) {
    out.push_str(&value.len().to_string());
    out.push('.');
    out.push_str(value);
}

/// Decode one frame. The trailing `;` is optional.
pub fn decode(frame: &str) -> Result<Instruction, ProtocolError> {
    let mut elements: Vec<String> = Vec::new();
    let mut rest = frame;

    loop {
        let dot = rest
            .find('.')
            .ok_or_else(|| ProtocolError::Malformed(format!("missing length prefix in {frame:?}")))?;
        let digits = &rest[..dot];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::Malformed(format!(
                "invalid length {digits:?} in {frame:?}"
            )));
        }
        let len: usize = digits.parse().map_err(|_| ProtocolError::LengthOverflow)?;
        let start = dot + 1;
        let end = start.checked_add(len).ok_or(ProtocolError::LengthOverflow)?;
        let value = rest.get(start..end).ok_or_else(|| {
            ProtocolError::Malformed(format!("element of length {len} overruns {frame:?}"))
        })?;
        elements.push(value.to_string());

        match rest.as_bytes().get(end) {
            Some(b',') => rest = &rest[end + 1..],
            Some(&DELIMITER) if end + 1 == rest.len() => break,
            None => break,
            Some(other) => {
                return Err(ProtocolError::Malformed(format!(
                    "unexpected {:?} after element in {frame:?}",
                    char::from(*other)
                )))
            }
        }
    }

    let opcode = elements.remove(0);
    Ok(Instruction {
        opcode,
        args: elements,
        encoded: OnceLock::new(),
    })
}

/// How frames are delimited when reading from guacd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Follow the declared element lengths.
    #[default]
    LengthPrefixed,
    /// Read up to the next `;` and apply [`legacy_audio_shim`].
    Delimited,
}

// Frames produced by old guacd builds when the `audio/L16` mimetype's own
// `;` is mistaken for the instruction terminator.
const LEGACY_RATE_44100: &str = "rate=44100,channels=2;";
const LEGACY_RATE_22050: &str = "rate=22050,channels=2;";
const LEGACY_AUDIO_L16: &str = "5.audio,1.1,31.audio/L16;";

/// Compatibility rewrite for delimited reads against legacy guacd builds.
///
/// Exact-match only: the two bare rate fragments become empty (no-op) frames
/// and the truncated `audio` frame gets its 44.1 kHz parameters back.
pub fn legacy_audio_shim(frame: String) -> String {
    match frame.as_str() {
        LEGACY_RATE_44100 | LEGACY_RATE_22050 => String::new(),
        LEGACY_AUDIO_L16 => frame + LEGACY_RATE_44100,
        _ => frame,
    }
}

/// Reads one instruction frame at a time from a byte stream.
pub struct InstructionReader<R> {
    inner: BufReader<R>,
    mode: ReadMode,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> InstructionReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_mode(inner, ReadMode::default(), DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_mode(inner: R, mode: ReadMode, max_frame_size: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            mode,
            max_frame_size,
        }
    }

    /// Read the next raw frame, including its `;`.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary. In delimited mode a
    /// frame may come back empty (see [`legacy_audio_shim`]).
    pub async fn read_frame(&mut self) -> Result<Option<String>, TunnelError> {
        match self.mode {
            ReadMode::LengthPrefixed => self.read_length_prefixed().await,
            ReadMode::Delimited => self.read_delimited().await,
        }
    }

    /// Read and decode the next non-empty frame.
    pub async fn read_instruction(&mut self) -> Result<Option<Instruction>, TunnelError> {
        loop {
            match self.read_frame().await? {
                None => return Ok(None),
                Some(frame) if frame.is_empty() => continue,
                Some(frame) => return Ok(Some(decode(&frame)?)),
            }
        }
    }

    async fn read_length_prefixed(&mut self) -> Result<Option<String>, TunnelError> {
        let mut frame: Vec<u8> = Vec::new();

        loop {
            let mut len: usize = 0;
            let mut digits = 0usize;
            loop {
                let byte = match self.inner.read_u8().await {
                    Ok(b) => b,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::UnexpectedEof && frame.is_empty() =>
                    {
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                };
                frame.push(byte);
                match byte {
                    b'0'..=b'9' => {
                        len = len
                            .checked_mul(10)
                            .and_then(|l| l.checked_add(usize::from(byte - b'0')))
                            .ok_or(ProtocolError::LengthOverflow)?;
                        digits += 1;
                    }
                    b'.' if digits > 0 => break,
                    _ => {
                        return Err(ProtocolError::Malformed(format!(
                            "unexpected byte {byte:#04x} in length prefix"
                        ))
                        .into())
                    }
                }
            }

            if frame.len().saturating_add(len).saturating_add(1) > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    max: self.max_frame_size,
                }
                .into());
            }

            let start = frame.len();
            frame.resize(start + len, 0);
            self.inner.read_exact(&mut frame[start..]).await?;

            let terminator = self.inner.read_u8().await?;
            frame.push(terminator);
            match terminator {
                b',' => {}
                DELIMITER => break,
                other => {
                    return Err(ProtocolError::Malformed(format!(
                        "unexpected byte {other:#04x} after element"
                    ))
                    .into())
                }
            }
        }

        String::from_utf8(frame)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    async fn read_delimited(&mut self) -> Result<Option<String>, TunnelError> {
        // One byte past the limit is enough to tell an oversized frame apart.
        let limit = u64::try_from(self.max_frame_size)
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        let mut frame: Vec<u8> = Vec::new();
        let n = (&mut self.inner)
            .take(limit)
            .read_until(DELIMITER, &mut frame)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                max: self.max_frame_size,
            }
            .into());
        }
        if frame.last() != Some(&DELIMITER) {
            return Err(TunnelError::Closed);
        }
        let text = String::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Some(legacy_audio_shim(text)))
    }
}

/// Split a buffer of complete instructions into one slice per instruction,
/// following the element lengths.
pub fn split_frames(buffer: &str) -> Result<Vec<&str>, ProtocolError> {
    let bytes = buffer.as_bytes();
    let mut frames = Vec::new();
    let mut start = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        let dot = bytes[pos..]
            .iter()
            .position(|&b| b == b'.')
            .map(|i| pos + i)
            .ok_or_else(|| ProtocolError::Malformed(format!("missing length prefix in {buffer:?}")))?;
        let digits = &buffer[pos..dot];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::Malformed(format!(
                "invalid length {digits:?} in {buffer:?}"
            )));
        }
        let len: usize = digits.parse().map_err(|_| ProtocolError::LengthOverflow)?;
        let end = (dot + 1)
            .checked_add(len)
            .ok_or(ProtocolError::LengthOverflow)?;
        match bytes.get(end) {
            Some(b',') => pos = end + 1,
            Some(&DELIMITER) => {
                frames.push(&buffer[start..=end]);
                pos = end + 1;
                start = pos;
            }
            _ => {
                return Err(ProtocolError::Malformed(format!(
                    "element of length {len} is not terminated in {buffer:?}"
                )))
            }
        }
    }

    if start != bytes.len() {
        return Err(ProtocolError::Malformed(format!(
            "incomplete instruction in {buffer:?}"
        )));
    }
    Ok(frames)
}
