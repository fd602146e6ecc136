use std::io::{self, Read, Write};

use mio::net::TcpStream;
use profiler_protocol::{Frame, Message, Tag};

use crate::error::{Error, Result};

/// Frame length prefixes above this are rejected before the session's read
/// buffer is asked to grow to accommodate them. Mirrors `MAX_FRAME_PAYLOAD`
/// in `profiler-protocol`, which is private to that crate, so a session
/// can't lean on it directly when buffering incrementally.
const MAX_FRAME_PAYLOAD: usize = 256 * 1024 * 1024;

/// Accumulates bytes across non-blocking reads and peels off complete
/// frames as they become available. Kept separate from the socket it reads
/// from so the peeling logic can be exercised without a real connection.
#[derive(Default)]
struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn try_extract_frame(&mut self) -> Result<Option<Frame>> {
        if self.bytes.len() < 8 {
            return Ok(None);
        }
        let tag = u32::from_le_bytes(self.bytes[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(self.bytes[4..8].try_into().unwrap()) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol(profiler_protocol::Error::FrameTooLarge(
                length as u32,
            )));
        }
        if self.bytes.len() < 8 + length {
            return Ok(None);
        }
        let payload = self.bytes[8..8 + length].to_vec();
        self.bytes.drain(0..8 + length);
        Ok(Some(Frame::new(tag, payload)))
    }
}

/// One accepted connection. Buffers bytes across non-blocking reads until a
/// full frame is available, since `profiler_protocol::read_frame` is written
/// for blocking `Read` streams and would block the whole apartment on a
/// half-delivered frame.
pub struct Session {
    pub socket: TcpStream,
    read_buf: FrameBuffer,
    write_buf: Vec<u8>,
}

impl Session {
    pub fn new(socket: TcpStream) -> Self {
        Session {
            socket,
            read_buf: FrameBuffer::default(),
            write_buf: Vec::new(),
        }
    }

    /// Pulls whatever bytes are currently available without blocking and
    /// decodes every complete frame found. Returns `Ok(false)` once the peer
    /// has cleanly closed its write half.
    pub fn poll_readable(&mut self, out: &mut Vec<Message>) -> Result<bool> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        while let Some(frame) = self.read_buf.try_extract_frame()? {
            let tag = Tag::from_u32(frame.tag)?;
            out.push(Message::decode(tag, &frame.payload)?);
        }
        Ok(true)
    }

    /// Queues a message for writing and opportunistically flushes what the
    /// socket accepts right now; anything left over waits for the next
    /// writable-readiness event.
    pub fn queue(&mut self, message: &Message) {
        let tag = message.tag().as_u32();
        let payload = message.encode_payload();
        self.write_buf.extend_from_slice(&tag.to_le_bytes());
        self.write_buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.write_buf.extend_from_slice(&payload);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn poll_writable(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.drain(0..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracting_a_frame_drains_exactly_its_bytes_and_leaves_the_rest() {
        let mut buf = Vec::new();
        profiler_protocol::write_frame(&mut buf, &Frame::new(3, vec![1, 2, 3])).unwrap();
        buf.extend_from_slice(&9u32.to_le_bytes());

        let mut frames = FrameBuffer::default();
        frames.extend(&buf);

        let frame = frames.try_extract_frame().unwrap().unwrap();
        assert_eq!(frame.tag, 3);
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert_eq!(frames.bytes, 9u32.to_le_bytes().to_vec());
        assert!(frames.try_extract_frame().unwrap().is_none());
    }

    #[test]
    fn partial_frame_yields_none_until_the_rest_arrives() {
        let mut buf = Vec::new();
        profiler_protocol::write_frame(&mut buf, &Frame::new(1, vec![1, 2, 3, 4])).unwrap();

        let mut frames = FrameBuffer::default();
        frames.extend(&buf[..6]);
        assert!(frames.try_extract_frame().unwrap().is_none());

        frames.extend(&buf[6..]);
        let frame = frames.try_extract_frame().unwrap().unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn two_frames_back_to_back_are_both_extracted() {
        let mut buf = Vec::new();
        profiler_protocol::write_frame(&mut buf, &Frame::new(1, vec![1])).unwrap();
        profiler_protocol::write_frame(&mut buf, &Frame::new(2, vec![2, 2])).unwrap();

        let mut frames = FrameBuffer::default();
        frames.extend(&buf);
        assert_eq!(frames.try_extract_frame().unwrap().unwrap().tag, 1);
        assert_eq!(frames.try_extract_frame().unwrap().unwrap().tag, 2);
        assert!(frames.try_extract_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut frames = FrameBuffer::default();
        let mut header = Vec::new();
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_le_bytes());
        frames.extend(&header);
        assert!(frames.try_extract_frame().is_err());
    }
}
