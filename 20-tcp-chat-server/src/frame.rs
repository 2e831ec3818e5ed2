use std::{fmt, io};

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead};

const COMMAND_PREFIX: &str = "CMD:";

/// One logical protocol unit. On the wire every frame is a single UTF-8 line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `CMD:JOIN:<username>`
    Join { username: String },
    /// `CMD:LEAVE:<username>`
    Leave { username: String },
    /// `CMD:USERS:<name1>,<name2>,...`
    Users { usernames: Vec<String> },
    /// Anything without the `CMD:` prefix, relayed verbatim.
    Chat { text: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{0}' is missing its payload")]
    MissingPayload(String),

    #[error("invalid username '{0}'")]
    InvalidUsername(String),
}

impl Frame {
    /// Parses a single line with its terminator already stripped.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let Some(command) = line.strip_prefix(COMMAND_PREFIX) else {
            return Ok(Frame::Chat {
                text: line.to_string(),
            });
        };

        // The payload keeps any further colons.
        let (name, payload) = command
            .split_once(':')
            .ok_or_else(|| FrameError::MissingPayload(command.to_string()))?;

        match name {
            "JOIN" => Ok(Frame::Join {
                username: parse_username(payload)?,
            }),
            "LEAVE" => Ok(Frame::Leave {
                username: parse_username(payload)?,
            }),
            "USERS" => Ok(Frame::Users {
                usernames: payload
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Join { username } => write!(f, "{COMMAND_PREFIX}JOIN:{username}"),
            Frame::Leave { username } => write!(f, "{COMMAND_PREFIX}LEAVE:{username}"),
            Frame::Users { usernames } => {
                write!(f, "{COMMAND_PREFIX}USERS:{}", usernames.join(","))
            }
            Frame::Chat { text } => f.write_str(text),
        }
    }
}

/// Usernames end up inside the comma separated roster, so commas are rejected.
fn parse_username(raw: &str) -> Result<String, FrameError> {
    let username = raw.trim();
    if username.is_empty() || username.contains(',') {
        return Err(FrameError::InvalidUsername(raw.to_string()));
    }
    Ok(username.to_string())
}

/// Splits a byte stream into newline terminated UTF-8 lines.
///
/// Trailing `\r`/`\n` are stripped and blank lines are skipped. `max_len`
/// bounds a line's content, terminator excluded. A longer line, or one that is
/// not UTF-8, is reported as [`io::ErrorKind::InvalidData`]. At end of stream
/// an unterminated final line is still returned.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_len: usize,
    /// Bytes of the buffer already searched for a newline.
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
        }
    }

    fn finish(&self, raw: &[u8]) -> io::Result<Option<String>> {
        let mut content = raw;
        while let [rest @ .., b'\r' | b'\n'] = content {
            content = rest;
        }

        if content.len() > self.max_len {
            return Err(too_long(self.max_len));
        }
        if content.is_empty() {
            return Ok(None);
        }

        String::from_utf8(content.to_vec())
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                // One spare byte: a pending '\r' may still turn out to be part of the terminator.
                if src.len() > self.max_len.saturating_add(1) {
                    return Err(too_long(self.max_len));
                }
                return Ok(None);
            };

            let end = self.next_index + offset + 1;
            self.next_index = 0;
            let raw = src.split_to(end);
            if let Some(line) = self.finish(&raw)? {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        let raw = src.split();
        self.finish(&raw)
    }
}

fn too_long(max_len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame exceeds {max_len} bytes"),
    )
}

/// Line stream over the read half of a connection.
pub type LineReader<R> = FramedRead<R, LineCodec>;

pub fn line_reader<R: AsyncRead>(reader: R, max_len: usize) -> LineReader<R> {
    FramedRead::new(reader, LineCodec::new(max_len))
}

/// Next line from `lines`, `Ok(None)` at end of stream.
///
/// Cancel safe: partially received lines stay buffered in the reader, so this
/// can sit in a `select!` next to other branches.
pub async fn next_line<R>(lines: &mut LineReader<R>) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    lines.next().await.transpose()
}

/// Renders a frame as a newline terminated line, ready to be queued or written.
pub fn encode(frame: &Frame) -> String {
    let mut encoded = frame.to_string();
    encoded.push('\n');
    encoded
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encode(frame).as_bytes()).await?;
    writer.flush().await
}
