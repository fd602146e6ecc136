use std::io::{Read, Write};

use log::trace;

use crate::error::Error;

/// Caps a single frame's payload so a corrupt length prefix can't trigger an
/// unbounded allocation.
const MAX_FRAME_PAYLOAD: u32 = 256 * 1024 * 1024;

/// One `{ u32 tag, u32 length, payload[length] }` unit off the wire, before
/// the payload has been interpreted as a [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u32, payload: Vec<u8>) -> Self {
        Frame { tag, payload }
    }
}

/// Writes one frame: tag, length, payload, all little-endian. The length
/// prefix lets the reader know exactly how many payload bytes to pull off
/// the stream before attempting to parse a message.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<(), Error> {
    if frame.payload.len() as u64 > MAX_FRAME_PAYLOAD as u64 {
        return Err(Error::FrameTooLarge(frame.payload.len() as u32));
    }
    w.write_all(&frame.tag.to_le_bytes())?;
    w.write_all(&(frame.payload.len() as u32).to_le_bytes())?;
    w.write_all(&frame.payload)?;
    trace!("wrote frame tag={} len={}", frame.tag, frame.payload.len());
    Ok(())
}

/// Reads one frame, blocking on `r` until the header and full payload have
/// arrived or the stream ends. A zero-byte read at the start of a header
/// (not mid-header, not mid-payload) yields `Ok(None)`, signaling a clean
/// disconnect rather than truncation.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Frame>, Error> {
    let mut header = [0u8; 8];
    if !read_exact_or_eof(r, &mut header)? {
        return Ok(None);
    }
    let tag = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let length = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if length > MAX_FRAME_PAYLOAD {
        return Err(Error::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    r.read_exact(&mut payload)?;
    trace!("read frame tag={} len={}", tag, length);
    Ok(Some(Frame { tag, payload }))
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of an
/// `UnexpectedEof` error when the stream ends before any byte of `buf` has
/// been filled, so callers can distinguish "peer hung up between frames"
/// from "peer hung up mid-frame".
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended mid-frame-header",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips_through_a_buffer() {
        let frame = Frame::new(7, vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(read_back, frame);
    }

    #[test]
    fn empty_stream_reads_as_clean_disconnect() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::new(1, vec![9; 16])).unwrap();
        buf.truncate(buf.len() - 4);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(read_frame(&mut cursor), Err(Error::Io(_))));
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocating() {
        let mut header = Vec::new();
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_le_bytes());
        let mut cursor = Cursor::new(header);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn two_frames_sequentially_on_the_same_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::new(1, vec![1])).unwrap();
        write_frame(&mut buf, &Frame::new(2, vec![2, 2])).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap().tag, 1);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap().tag, 2);
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }
}
