//! pkt-line framing
//!
//! Every packet starts with four lower-case hex digits giving the total
//! packet length, header included. Two lengths are sentinels with no
//! payload: `0000` (flush) ends a message and `0001` (delimiter) separates
//! an argument block from what follows. Lengths 2 and 3 are never valid.

use std::io::{self, Read, Write};

use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::request::{Request, RequestBody};

/// Largest payload a single packet can carry.
pub const MAX_PACKET_DATA: usize = lfs_core::config::MAX_CHUNK_SIZE;

const HEADER_LEN: usize = 4;
const FLUSH_LEN: usize = 0;
const DELIMITER_LEN: usize = 1;

const UPLOAD_COMMAND: &str = "put-object";

/// One framed unit read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Flush,
    Delimiter,
    Data(Vec<u8>),
}

/// Reading half of a pkt-line channel
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the 4-byte header. `None` means the stream ended cleanly on a
    /// packet boundary.
    fn read_header(&mut self) -> ProtocolResult<Option<usize>> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(ProtocolError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !header.iter().all(u8::is_ascii_hexdigit) {
            return Err(ProtocolError::InvalidHeader(
                String::from_utf8_lossy(&header).into_owned(),
            ));
        }
        let text = String::from_utf8_lossy(&header);
        let len = usize::from_str_radix(&text, 16)
            .map_err(|_| ProtocolError::InvalidHeader(text.to_string()))?;
        if len == 2 || len == 3 {
            return Err(ProtocolError::InvalidHeader(text.to_string()));
        }
        Ok(Some(len))
    }

    /// Read one packet. `None` on clean end of stream.
    pub fn read_packet(&mut self) -> ProtocolResult<Option<Packet>> {
        let len = match self.read_header()? {
            Some(len) => len,
            None => return Ok(None),
        };
        let packet = match len {
            FLUSH_LEN => Packet::Flush,
            DELIMITER_LEN => Packet::Delimiter,
            _ => {
                let mut payload = vec![0u8; len - HEADER_LEN];
                self.inner.read_exact(&mut payload).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        ProtocolError::UnexpectedEof
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;
                Packet::Data(payload)
            }
        };
        trace!("read packet of length {}", len);
        Ok(Some(packet))
    }

    /// Read one packet as text, along with its declared length.
    ///
    /// Sentinels come back as an empty string with length 0 (flush) or 1
    /// (delimiter). A single trailing newline is stripped from text.
    pub fn read_line_with_length(&mut self) -> ProtocolResult<Option<(String, usize)>> {
        let packet = match self.read_packet()? {
            Some(packet) => packet,
            None => return Ok(None),
        };
        match packet {
            Packet::Flush => Ok(Some((String::new(), FLUSH_LEN))),
            Packet::Delimiter => Ok(Some((String::new(), DELIMITER_LEN))),
            Packet::Data(mut payload) => {
                let len = payload.len() + HEADER_LEN;
                if payload.last() == Some(&b'\n') {
                    payload.pop();
                }
                let text = String::from_utf8(payload).map_err(|_| ProtocolError::InvalidText)?;
                Ok(Some((text, len)))
            }
        }
    }

    /// Read one complete request.
    ///
    /// Argument lines run until a flush (no body) or a delimiter (list lines
    /// follow, up to the next flush). An upload switches the body to raw
    /// data packets: its argument block must end in a delimiter, and the
    /// returned request borrows this reader until the payload is consumed.
    pub fn read_request(&mut self) -> ProtocolResult<Option<Request<'_, R>>> {
        let mut args: Vec<String> = Vec::new();
        loop {
            let (line, len) = match self.read_line_with_length()? {
                Some(next) => next,
                None if args.is_empty() => return Ok(None),
                None => return Err(ProtocolError::UnexpectedEof),
            };
            let upload = args
                .first()
                .is_some_and(|first| first.starts_with(UPLOAD_COMMAND));
            match len {
                FLUSH_LEN if upload => return Err(ProtocolError::UnexpectedFlush),
                FLUSH_LEN => {
                    return Ok(Some(Request {
                        args,
                        body: RequestBody::Empty,
                    }));
                }
                DELIMITER_LEN if upload => {
                    return Ok(Some(Request {
                        args,
                        body: RequestBody::Data(PacketDataReader::new(self)),
                    }));
                }
                DELIMITER_LEN => break,
                _ => args.push(line),
            }
        }

        let mut lines = Vec::new();
        loop {
            match self.read_line_with_length()? {
                None => return Err(ProtocolError::UnexpectedEof),
                Some((_, FLUSH_LEN)) => {
                    return Ok(Some(Request {
                        args,
                        body: RequestBody::Lines(lines),
                    }));
                }
                Some((_, DELIMITER_LEN)) => return Err(ProtocolError::UnexpectedDelimiter),
                Some((line, _)) => lines.push(line),
            }
        }
    }
}

/// Streams the payload of an upload as plain bytes.
///
/// The flush packet after the payload reads as end of file. A delimiter or
/// end of stream inside the payload is an I/O error.
#[derive(Debug)]
pub struct PacketDataReader<'a, R> {
    reader: &'a mut PacketReader<R>,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<'a, R: Read> PacketDataReader<'a, R> {
    fn new(reader: &'a mut PacketReader<R>) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// True once the terminating flush has been read.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Discard whatever is left of the payload, up to and including the
    /// terminating flush.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.pos >= self.buf.len() && !self.done {
            match self.reader.read_packet()? {
                Some(Packet::Data(payload)) => {
                    self.buf = payload;
                    self.pos = 0;
                }
                Some(Packet::Flush) => self.done = true,
                Some(Packet::Delimiter) => return Err(ProtocolError::UnexpectedDelimiter.into()),
                None => return Err(ProtocolError::UnexpectedEof.into()),
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for PacketDataReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.fill()?;
        let available = &self.buf[self.pos.min(self.buf.len())..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Writing half of a pkt-line channel
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
}

impl<W: Write> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write one raw packet. Empty buffers are skipped since a zero-length
    /// payload would read back as a flush.
    pub fn write_bytes(&mut self, buf: &[u8]) -> ProtocolResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > MAX_PACKET_DATA {
            return Err(ProtocolError::PacketTooLarge {
                size: buf.len(),
                max: MAX_PACKET_DATA,
            });
        }
        write!(self.inner, "{:04x}", buf.len() + HEADER_LEN)?;
        self.inner.write_all(buf)?;
        Ok(())
    }

    /// Write `text` followed by a newline as one packet.
    pub fn write_line(&mut self, text: &str) -> ProtocolResult<()> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(b'\n');
        self.write_bytes(&payload)
    }

    pub fn write_delimiter(&mut self) -> ProtocolResult<()> {
        self.inner.write_all(b"0001")?;
        Ok(())
    }

    /// Write a flush packet and push everything buffered to the peer.
    pub fn write_flush(&mut self) -> ProtocolResult<()> {
        self.inner.write_all(b"0000")?;
        self.inner.flush()?;
        Ok(())
    }
}
