use crate::error::LinkError;
use crate::models::{ArgValue, Command, Event, RemoteFailure};

/// Wire protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard ceiling on a single frame; an unterminated line past this point means
/// the stream can no longer be trusted to resynchronize.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One fully-framed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { version: u32 },
    Response(Response),
    Event(Event),
}

/// A decoded response frame, success or remote failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub result: Result<Vec<ArgValue>, RemoteFailure>,
}

/// Renders the client hello sent immediately after connecting.
pub fn encode_hello() -> String {
    format!("H {}\n", PROTOCOL_VERSION)
}

/// Renders a command frame: `C <id> <name> <arg>*`.
///
/// Deterministic and lossless; every token is percent-escaped so the frame
/// stays one line regardless of argument content.
pub fn encode_command(id: u64, command: &Command) -> String {
    let mut out = String::with_capacity(32);
    out.push_str("C ");
    out.push_str(&id.to_string());
    out.push(' ');
    out.push_str(&escape(command.name()));
    for arg in command.args() {
        out.push(' ');
        encode_arg(&mut out, arg);
    }
    out.push('\n');
    out
}

fn encode_arg(out: &mut String, arg: &ArgValue) {
    match arg {
        ArgValue::Int(v) => {
            out.push_str("i:");
            out.push_str(&v.to_string());
        }
        ArgValue::Float(v) => {
            out.push_str("f:");
            out.push_str(&v.to_string());
        }
        ArgValue::Str(v) => {
            out.push_str("s:");
            out.push_str(&escape(v));
        }
        ArgValue::Coord(x, y, z) => {
            out.push_str(&format!("c:{},{},{}", x, y, z));
        }
        ArgValue::Opaque { tag, raw } => {
            out.push_str(tag);
            out.push(':');
            out.push_str(raw);
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hi = chars.next().ok_or("truncated escape")?;
        let lo = chars.next().ok_or("truncated escape")?;
        let byte = u8::from_str_radix(&format!("{}{}", hi, lo), 16)
            .map_err(|_| format!("bad escape %{}{}", hi, lo))?;
        out.push(byte as char);
    }
    Ok(out)
}

fn parse_arg(token: &str) -> Result<ArgValue, String> {
    let (tag, body) = token
        .split_once(':')
        .ok_or_else(|| format!("argument without type tag: {:?}", token))?;
    match tag {
        "i" => body
            .parse::<i64>()
            .map(ArgValue::Int)
            .map_err(|_| format!("bad integer: {:?}", body)),
        "f" => body
            .parse::<f64>()
            .map(ArgValue::Float)
            .map_err(|_| format!("bad float: {:?}", body)),
        "s" => unescape(body).map(ArgValue::Str),
        "c" => {
            let mut parts = body.splitn(3, ',');
            let mut next = |axis: &str| {
                parts
                    .next()
                    .and_then(|p| p.parse::<i64>().ok())
                    .ok_or_else(|| format!("bad {} in coordinate: {:?}", axis, body))
            };
            Ok(ArgValue::Coord(next("x")?, next("y")?, next("z")?))
        }
        // Unknown argument types ride through untouched so a newer remote
        // does not break this client's parsing of the rest of the stream.
        _ => Ok(ArgValue::Opaque {
            tag: tag.to_string(),
            raw: body.to_string(),
        }),
    }
}

fn parse_args(tokens: &[&str]) -> Result<Vec<ArgValue>, String> {
    tokens.iter().map(|t| parse_arg(t)).collect()
}

fn parse_line(line: &str) -> Result<Message, String> {
    let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
    let (kind, rest) = tokens.split_first().ok_or("empty frame")?;

    match *kind {
        "H" => {
            let [version] = rest else {
                return Err(format!("hello frame with {} tokens", rest.len()));
            };
            let version = version
                .parse::<u32>()
                .map_err(|_| format!("bad protocol version: {:?}", version))?;
            Ok(Message::Hello { version })
        }
        "R" => {
            let (id, rest) = rest.split_first().ok_or("response without id")?;
            let id = id
                .parse::<u64>()
                .map_err(|_| format!("bad correlation id: {:?}", id))?;
            let (status, rest) = rest.split_first().ok_or("response without status")?;
            let result = match *status {
                "ok" => Ok(parse_args(rest)?),
                "err" => {
                    let (code, rest) = rest.split_first().ok_or("error response without code")?;
                    let message = rest.first().map(|m| unescape(m)).transpose()?.unwrap_or_default();
                    Err(RemoteFailure {
                        code: unescape(code)?,
                        message,
                    })
                }
                other => return Err(format!("bad response status: {:?}", other)),
            };
            Ok(Message::Response(Response { id, result }))
        }
        "E" => {
            let (target, rest) = rest.split_first().ok_or("event without target")?;
            let (name, rest) = rest.split_first().ok_or("event without name")?;
            Ok(Message::Event(Event {
                target: unescape(target)?,
                name: unescape(name)?,
                args: parse_args(rest)?,
            }))
        }
        other => Err(format!("unknown frame type: {:?}", other)),
    }
}

/// Incremental frame decoder for one connection.
///
/// Bytes go in via [`extend`](Self::extend); fully-framed messages come out
/// of [`next_message`](Self::next_message). Partial lines are buffered across
/// reads. A malformed line is consumed and reported as a recoverable
/// `MalformedFrame`, so the next call resumes at the following frame
/// boundary; a line that outgrows [`MAX_FRAME_LEN`] without terminating is a
/// fatal `StreamCorrupted`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, LinkError> {
        let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_FRAME_LEN {
                return Err(LinkError::StreamCorrupted(format!(
                    "unterminated frame of {} bytes",
                    self.buf.len()
                )));
            }
            return Ok(None);
        };

        let line_bytes: Vec<u8> = self.buf.drain(..=newline).collect();
        let line = match std::str::from_utf8(&line_bytes[..newline]) {
            Ok(s) => s.trim_end_matches('\r'),
            Err(e) => {
                return Err(LinkError::MalformedFrame(format!("invalid UTF-8: {}", e)));
            }
        };

        if line.is_empty() {
            // Blank keepalive line between frames.
            return self.next_message();
        }

        parse_line(line)
            .map(Some)
            .map_err(LinkError::MalformedFrame)
    }
}
