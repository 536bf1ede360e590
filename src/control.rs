//! Wire protocol for the control channel.
//!
//! Client to server: a 16-bit little-endian argument count, then per argument
//! a 16-bit little-endian length and that many bytes. Server to client: the
//! command's output bytes terminated by a single `0x00`, a `0x00` readiness
//! ack from the client, then a 7-byte trailer of [`EXIT_CODE_MAGIC`] followed
//! by the 16-bit little-endian exit code.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
};

use crate::{error::ProtocolError, paths::Paths};

/// Magic bytes preceding the exit code in the response trailer.
pub const EXIT_CODE_MAGIC: [u8; 5] = [0x00, 0xFF, 0x55, 0xAA, 0x00];

/// Terminates the streamed output of a response.
pub const OUTPUT_TERMINATOR: u8 = 0x00;

/// Upper bound on an encoded argument frame.
pub const MAX_FRAME_BYTES: usize = 65536;

/// Encodes an argument vector into one frame.
pub fn encode_args(args: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(args.len() as u16).to_le_bytes());
    for arg in args {
        buf.extend_from_slice(&(arg.len() as u16).to_le_bytes());
        buf.extend_from_slice(arg.as_bytes());
    }
    buf
}

/// Attempts to decode one argument frame. `Ok(None)` means the buffer does
/// not yet hold a complete frame.
pub fn decode_args(buf: &[u8]) -> Result<Option<Vec<String>>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let count = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let mut args = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        if buf.len() < at + 2 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([buf[at], buf[at + 1]]) as usize;
        at += 2;
        if buf.len() < at + len {
            return Ok(None);
        }
        let arg = std::str::from_utf8(&buf[at..at + len])
            .map_err(|_| ProtocolError::BadEncoding)?;
        args.push(arg.to_string());
        at += len;
    }
    Ok(Some(args))
}

/// Reads one argument frame from the stream.
pub fn read_frame(stream: &mut UnixStream) -> Result<Vec<String>, ProtocolError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(args) = decode_args(&buf)? {
            return Ok(args);
        }
        if buf.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Malformed("frame too large"));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Completes a response after the output has been streamed: terminator,
/// client ack, exit-code trailer.
pub fn finish_response(stream: &mut UnixStream, code: u16) -> Result<(), ProtocolError> {
    stream.write_all(&[OUTPUT_TERMINATOR])?;
    stream.flush()?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack)?;
    let mut trailer = [0u8; 7];
    trailer[..5].copy_from_slice(&EXIT_CODE_MAGIC);
    trailer[5..].copy_from_slice(&code.to_le_bytes());
    stream.write_all(&trailer)?;
    stream.flush()?;
    Ok(())
}

/// Client side of one command: sends argv, streams output into `out`, and
/// returns the server's exit code.
pub fn exchange(
    stream: &mut UnixStream,
    args: &[String],
    out: &mut dyn Write,
) -> Result<u16, ProtocolError> {
    stream.write_all(&encode_args(args))?;
    stream.flush()?;

    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        if let Some(end) = chunk[..n].iter().position(|b| *b == OUTPUT_TERMINATOR) {
            out.write_all(&chunk[..end])?;
            break;
        }
        out.write_all(&chunk[..n])?;
    }
    out.flush()?;

    stream.write_all(&[OUTPUT_TERMINATOR])?;
    stream.flush()?;

    let mut trailer = [0u8; 7];
    stream.read_exact(&mut trailer)?;
    if trailer[..5] != EXIT_CODE_MAGIC {
        return Err(ProtocolError::BadTrailer);
    }
    Ok(u16::from_le_bytes([trailer[5], trailer[6]]))
}

/// Connects to the supervisor and runs one command end to end.
pub fn send_command(
    paths: &Paths,
    args: &[String],
    out: &mut dyn Write,
) -> Result<u16, ProtocolError> {
    let mut stream = UnixStream::connect(paths.control_socket())?;
    exchange(&mut stream, args, out)
}
