//! Frame codec: big-endian 32-bit integers and floats, length-prefixed strings.
//!
//! A string is an `i32` byte count followed by the raw bytes. A negative count marks the end
//! of the stream.

use std::io::{self, Read};

use crate::protocol::{Command, Frame, Opcode, UnknownOpcode};

/// Largest string or payload length accepted from the wire.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Error decoding from a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("end of stream")]
    EndOfStream,
    /// A negative length; the sender uses this to mark the end of its stream.
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("field too large: {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    UnknownOpcode(#[from] UnknownOpcode),
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl DecodeError {
    /// True for the two ways a peer ends its stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DecodeError::EndOfStream | DecodeError::NegativeLength(_))
    }
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DecodeError::EndOfStream
        } else {
            DecodeError::Io(e)
        }
    }
}

pub fn encode_i32(v: i32) -> [u8; 4] {
    v.to_be_bytes()
}

pub fn encode_f32(v: f32) -> [u8; 4] {
    v.to_bits().to_be_bytes()
}

/// Length-prefixed string.
pub fn encode_str(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&encode_i32(bytes.len() as i32));
    out.extend_from_slice(bytes);
    out
}

/// Join byte sequences in order.
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// Encode one link frame.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let op = [frame.opcode().to_byte()];
    match frame {
        Frame::RequestDegree
        | Frame::RequestLight
        | Frame::FileEmpty
        | Frame::Command(_) => op.to_vec(),
        Frame::RequestFile { name } => concat(&[&op, &encode_str(name)]),
        // An unnamed whole file carries no length or body.
        Frame::FileWhole { name, .. } if name.is_empty() => concat(&[&op, &encode_str(name)]),
        Frame::Degree(v) | Frame::Light(v) => concat(&[&op, &encode_f32(*v)]),
        Frame::FileWhole { name, data } => concat(&[
            &op,
            &encode_str(name),
            &encode_i32(data.len() as i32),
            data,
        ]),
        Frame::FilePart {
            total_parts,
            name,
            data,
        } => concat(&[
            &op,
            &encode_i32(*total_parts),
            &encode_str(name),
            &encode_i32(data.len() as i32),
            data,
        ]),
    }
}

/// Read one byte, or `None` if the stream ended cleanly before it.
pub fn read_u8_or_eof<R: Read + ?Sized>(src: &mut R) -> Result<Option<u8>, DecodeError> {
    let mut b = [0u8; 1];
    loop {
        match src.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn read_i32<R: Read + ?Sized>(src: &mut R) -> Result<i32, DecodeError> {
    let mut b = [0u8; 4];
    src.read_exact(&mut b)?;
    Ok(i32::from_be_bytes(b))
}

/// Read an `i32`, or `None` if the stream ended cleanly before its first byte.
pub fn read_i32_or_eof<R: Read + ?Sized>(src: &mut R) -> Result<Option<i32>, DecodeError> {
    let Some(first) = read_u8_or_eof(src)? else {
        return Ok(None);
    };
    let mut rest = [0u8; 3];
    src.read_exact(&mut rest)?;
    Ok(Some(i32::from_be_bytes([first, rest[0], rest[1], rest[2]])))
}

pub fn read_f32<R: Read + ?Sized>(src: &mut R) -> Result<f32, DecodeError> {
    let mut b = [0u8; 4];
    src.read_exact(&mut b)?;
    Ok(f32::from_bits(u32::from_be_bytes(b)))
}

/// Validate a length read from the wire.
pub fn checked_len(len: i32) -> Result<usize, DecodeError> {
    if len < 0 {
        return Err(DecodeError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_FIELD_LEN {
        return Err(DecodeError::TooLarge(len));
    }
    Ok(len)
}

pub fn read_bytes<R: Read + ?Sized>(src: &mut R, len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a string whose length prefix has already been consumed.
pub fn read_string_body<R: Read + ?Sized>(src: &mut R, len: i32) -> Result<String, DecodeError> {
    let len = checked_len(len)?;
    let bytes = read_bytes(src, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn read_string<R: Read + ?Sized>(src: &mut R) -> Result<String, DecodeError> {
    let len = read_i32(src)?;
    read_string_body(src, len)
}

/// Consume and drop `len` bytes.
pub fn skip<R: Read + ?Sized>(src: &mut R, len: usize) -> Result<(), DecodeError> {
    let copied = io::copy(&mut src.take(len as u64), &mut io::sink())?;
    if (copied as usize) < len {
        return Err(DecodeError::EndOfStream);
    }
    Ok(())
}

/// Read the body of a frame whose opcode has already been consumed, keeping file payloads
/// in memory.
pub fn read_frame_body<R: Read + ?Sized>(op: Opcode, src: &mut R) -> Result<Frame, DecodeError> {
    let frame = match op {
        Opcode::RequestDegree => Frame::RequestDegree,
        Opcode::RequestLight => Frame::RequestLight,
        Opcode::RequestFile => Frame::RequestFile {
            name: read_string(src)?,
        },
        Opcode::SendDegree => Frame::Degree(read_f32(src)?),
        Opcode::SendLight => Frame::Light(read_f32(src)?),
        Opcode::SendFileEmpty => Frame::FileEmpty,
        Opcode::SendFileWhole => {
            let name = read_string(src)?;
            let data = if name.is_empty() {
                Vec::new()
            } else {
                let len = checked_len(read_i32(src)?)?;
                read_bytes(src, len)?
            };
            Frame::FileWhole { name, data }
        }
        Opcode::SendFilePart => {
            let total_parts = read_i32(src)?;
            let name = read_string(src)?;
            let len = checked_len(read_i32(src)?)?;
            Frame::FilePart {
                total_parts,
                name,
                data: read_bytes(src, len)?,
            }
        }
        Opcode::Close => Frame::Command(Command::Close),
        Opcode::CloseAck => Frame::Command(Command::CloseAck),
        Opcode::CloseDecline => Frame::Command(Command::CloseDecline),
    };
    Ok(frame)
}

/// Read a whole frame, or `None` at a clean end of stream.
pub fn read_frame<R: Read + ?Sized>(src: &mut R) -> Result<Option<Frame>, DecodeError> {
    let Some(b) = read_u8_or_eof(src)? else {
        return Ok(None);
    };
    let op = Opcode::from_byte(b)?;
    read_frame_body(op, src).map(Some)
}
