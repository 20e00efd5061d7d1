//! Origin side of a proxied exchange: connect, send the (possibly
//! augmented) request, and receive the response with the right body
//! framing, relaying every read to the client as-is.

use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::{self, Framing, Response, BUFFER_SIZE};
use crate::Error;

/// Resolve `(host, port)` and open a TCP connection.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    Ok(TcpStream::connect((host, port)).await?)
}

pub async fn send_request<W>(origin: &mut W, raw: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    origin.write_all(raw).await?;
    origin.flush().await?;
    Ok(())
}

/// The first stretch of an origin response: at least the full header block,
/// and possibly the beginning of the body.
pub struct FirstRead {
    buf: Vec<u8>,
    header_end: usize,
}

impl FirstRead {
    /// Everything received so far, exactly as the origin sent it.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The header block, including the terminating blank line.
    pub fn header(&self) -> &[u8] {
        &self.buf[..self.header_end + 4]
    }

    /// Body bytes that arrived in the same reads as the header.
    pub fn body(&self) -> &[u8] {
        &self.buf[self.header_end + 4..]
    }
}

/// Read from the origin until the full header block (CRLF-CRLF) has been
/// observed. A close before that point, or a header block larger than the
/// receive buffer, fails the request.
pub async fn read_header_block<R>(origin: &mut R) -> Result<FirstRead, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut filled = 0;
    loop {
        let n = origin.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::TruncatedResponse);
        }
        filled += n;
        if let Some(header_end) = http::find_header_end(&buf[..filled]) {
            buf.truncate(filled);
            return Ok(FirstRead { buf, header_end });
        }
        if filled == buf.len() {
            return Err(Error::HeaderTooLarge);
        }
    }
}

/// Stream the rest of the body after `first` has already been relayed,
/// forwarding each read to the client and keeping it as a segment. Returns
/// the parsed response with all body segments collected.
pub async fn stream_body<R, W>(
    origin: &mut R,
    client: &mut W,
    first: FirstRead,
    url: &str,
) -> Result<Response, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let fields = http::parse_header_fields(first.header());
    let framing = Framing::detect(&fields);
    let header = Bytes::copy_from_slice(first.header());
    let mut segments: Vec<Bytes> = Vec::new();
    if !first.body().is_empty() {
        segments.push(Bytes::copy_from_slice(first.body()));
    }
    let mut scratch = vec![0u8; BUFFER_SIZE];
    match framing {
        Framing::ContentLength(total) => {
            let mut received = first.body().len();
            while received < total {
                let n = relay(origin, client, &mut scratch, &mut segments).await?;
                if n == 0 {
                    return Err(Error::TruncatedResponse);
                }
                received += n;
            }
        }
        Framing::Chunked => {
            let mut scanner = ChunkScanner::new();
            let mut done = scanner.advance(first.body())?;
            while !done {
                let n = relay(origin, client, &mut scratch, &mut segments).await?;
                if n == 0 {
                    return Err(Error::TruncatedResponse);
                }
                done = scanner.advance(&scratch[..n])?;
            }
        }
        Framing::Close => loop {
            let n = relay(origin, client, &mut scratch, &mut segments).await?;
            if n == 0 {
                break;
            }
        },
    }
    client.flush().await?;
    Response::parse(url, header, segments, SystemTime::now())
}

async fn relay<R, W>(
    origin: &mut R,
    client: &mut W,
    scratch: &mut [u8],
    segments: &mut Vec<Bytes>,
) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = origin.read(scratch).await?;
    if n > 0 {
        client.write_all(&scratch[..n]).await?;
        segments.push(Bytes::copy_from_slice(&scratch[..n]));
    }
    Ok(n)
}

/// Incremental scanner over a chunked transfer encoding. It consumes raw
/// bytes as they arrive, tracking chunk-size lines, data, and the trailer
/// section after the terminating zero-length chunk, so the end of the body
/// is detected exactly even when chunk boundaries straddle reads.
pub(crate) struct ChunkScanner {
    state: ScanState,
    size: usize,
    seen_digit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    TrailerCr,
    FinalLf,
    Done,
}

impl ChunkScanner {
    pub(crate) fn new() -> ChunkScanner {
        ChunkScanner {
            state: ScanState::Size,
            size: 0,
            seen_digit: false,
        }
    }

    /// Feed the next stretch of raw bytes. Returns true once the
    /// terminating chunk and its trailer section have been fully consumed.
    pub(crate) fn advance(&mut self, buf: &[u8]) -> Result<bool, Error> {
        let mut idx = 0;
        while idx < buf.len() {
            match self.state {
                ScanState::Size => {
                    let byte = buf[idx];
                    if let Some(digit) = (byte as char).to_digit(16) {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|size| size.checked_add(digit as usize))
                            .ok_or(Error::InvalidChunkLength)?;
                        self.seen_digit = true;
                    } else if byte == b';' {
                        self.state = ScanState::Extension;
                    } else if byte == b'\r' {
                        if !self.seen_digit {
                            return Err(Error::InvalidChunkLength);
                        }
                        self.state = ScanState::SizeLf;
                    } else {
                        return Err(Error::InvalidChunkLength);
                    }
                    idx += 1;
                }
                ScanState::Extension => {
                    if buf[idx] == b'\r' {
                        if !self.seen_digit {
                            return Err(Error::InvalidChunkLength);
                        }
                        self.state = ScanState::SizeLf;
                    }
                    idx += 1;
                }
                ScanState::SizeLf => {
                    if buf[idx] != b'\n' {
                        return Err(Error::InvalidChunkLength);
                    }
                    self.state = if self.size == 0 {
                        ScanState::TrailerStart
                    } else {
                        ScanState::Data
                    };
                    idx += 1;
                }
                ScanState::Data => {
                    let take = self.size.min(buf.len() - idx);
                    self.size -= take;
                    idx += take;
                    if self.size == 0 {
                        self.state = ScanState::DataCr;
                    }
                }
                ScanState::DataCr => {
                    if buf[idx] != b'\r' {
                        return Err(Error::InvalidChunkLength);
                    }
                    self.state = ScanState::DataLf;
                    idx += 1;
                }
                ScanState::DataLf => {
                    if buf[idx] != b'\n' {
                        return Err(Error::InvalidChunkLength);
                    }
                    self.state = ScanState::Size;
                    self.seen_digit = false;
                    idx += 1;
                }
                ScanState::TrailerStart => {
                    self.state = if buf[idx] == b'\r' {
                        ScanState::FinalLf
                    } else {
                        ScanState::TrailerLine
                    };
                    idx += 1;
                }
                ScanState::TrailerLine => {
                    if buf[idx] == b'\r' {
                        self.state = ScanState::TrailerCr;
                    }
                    idx += 1;
                }
                ScanState::TrailerCr => {
                    if buf[idx] != b'\n' {
                        return Err(Error::InvalidChunkLength);
                    }
                    self.state = ScanState::TrailerStart;
                    idx += 1;
                }
                ScanState::FinalLf => {
                    if buf[idx] != b'\n' {
                        return Err(Error::InvalidChunkLength);
                    }
                    self.state = ScanState::Done;
                    idx += 1;
                }
                ScanState::Done => return Ok(true),
            }
        }
        Ok(self.state == ScanState::Done)
    }
}
