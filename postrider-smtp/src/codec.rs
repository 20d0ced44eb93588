//! Line-oriented SMTP framing over an async byte stream.
//!
//! Input tolerates bare LF line endings; output always emits CRLF. DATA
//! framing applies dot-stuffing on the way out and dot-unstuffing on the
//! way in (RFC 5321 section 4.5.2).

use postrider_common::Reply;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SmtpError};

/// Upper bound on a single command or reply line, far above the RFC 5321
/// 512/998 limits but low enough to bound a hostile peer.
const MAX_LINE: usize = 8192;

const READ_CHUNK: usize = 4096;

/// Marker trait for the byte streams sessions run over, so that plain TCP
/// and TLS-wrapped streams can share one session type.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Buffered SMTP line framing over a stream.
#[derive(Debug)]
pub struct SmtpStream<S> {
    stream: S,
    rbuf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> SmtpStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            rbuf: Vec::new(),
        }
    }

    /// Give up the inner stream, e.g. for a STARTTLS upgrade. Any bytes
    /// buffered ahead of the upgrade are discarded, as RFC 3207 requires.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Whether bytes are already buffered ahead of the next read.
    #[must_use]
    pub fn has_buffered_input(&self) -> bool {
        !self.rbuf.is_empty()
    }

    /// Read one line, stripping the CRLF (or bare LF) terminator.
    ///
    /// # Errors
    /// `ConnectionLost` when the peer closes before a terminator arrives.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(nl) = memchr::memchr(b'\n', &self.rbuf) {
                let mut line: Vec<u8> = self.rbuf.drain(..=nl).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            if self.rbuf.len() > MAX_LINE {
                return Err(SmtpError::LineTooLong(MAX_LINE));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(SmtpError::ConnectionLost);
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write one line, appending CRLF.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.stream.write_all(line).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a reply, one or more lines. Continuation lines carry `-`
    /// between code and text, the final line a space.
    pub async fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let lines: Vec<String> = reply.lines().collect();
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            let rendered = format!("{}{}{}", reply.code(), sep, line);
            self.stream.write_all(rendered.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Read a complete (possibly multi-line) reply.
    ///
    /// # Errors
    /// `BadReply` on lines that do not match `NNN[- ]text` or on code
    /// changes within a multi-line reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut code: Option<u16> = None;
        let mut text = String::new();

        loop {
            let line = self.read_line().await?;
            let line = String::from_utf8_lossy(&line).into_owned();
            if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                return Err(SmtpError::BadReply(line));
            }
            let line_code: u16 = line[..3]
                .parse()
                .map_err(|_| SmtpError::BadReply(line.clone()))?;
            let (is_last, rest) = match line.as_bytes().get(3) {
                None => (true, ""),
                Some(b' ') => (true, &line[4..]),
                Some(b'-') => (false, &line[4..]),
                Some(_) => return Err(SmtpError::BadReply(line.clone())),
            };
            match code {
                None => code = Some(line_code),
                Some(c) if c != line_code => {
                    return Err(SmtpError::BadReply(line));
                }
                Some(_) => {}
            }
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(rest);
            if is_last {
                let code = code.unwrap_or(0);
                return Ok(Reply::new(code, text));
            }
        }
    }

    /// Read a dot-terminated DATA body, unstuffing leading dots and
    /// normalizing line endings to CRLF.
    ///
    /// On overflow the rest of the body is drained up to the terminator
    /// before `MessageTooBig` is returned, so the session can reject with
    /// 552 and continue.
    pub async fn read_data(&mut self, max_size: Option<usize>) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut too_big = false;

        loop {
            let line = self.read_line().await?;
            if line == b"." {
                break;
            }
            let line = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line[..]
            };
            if let Some(max) = max_size {
                if !too_big && body.len() + line.len() + 2 > max {
                    too_big = true;
                    body.clear();
                }
            }
            if !too_big {
                body.extend_from_slice(line);
                body.extend_from_slice(b"\r\n");
            }
        }

        if too_big {
            return Err(SmtpError::MessageTooBig(max_size.unwrap_or(0)));
        }
        Ok(body)
    }

    /// Write a DATA body with dot-stuffing and the final terminator.
    pub async fn send_data(&mut self, body: &[u8]) -> Result<()> {
        let stuffed = dot_stuff(body);
        self.stream.write_all(&stuffed).await?;
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Dot-stuff a body for transmission: CRLF-normalize line endings, double
/// any line-leading dot, and guarantee a trailing CRLF so the terminator
/// stands on its own line.
#[must_use]
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    for line in lines_inclusive(body) {
        let line = trim_line_ending(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Undo [`dot_stuff`]: strip one leading dot per line. The terminator
/// line is not part of the input.
#[must_use]
pub fn dot_unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for line in lines_inclusive(data) {
        let stripped = trim_line_ending(line);
        let stripped = if stripped.first() == Some(&b'.') {
            &stripped[1..]
        } else {
            stripped
        };
        out.extend_from_slice(stripped);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn lines_inclusive(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos >= data.len() {
            return None;
        }
        let end = memchr::memchr(b'\n', &data[pos..]).map_or(data.len(), |i| pos + i + 1);
        let line = &data[pos..end];
        pos = end;
        Some(line)
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
