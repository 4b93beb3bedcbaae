use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Field delimiter for every control-channel payload and frame header.
pub const DELIMITER: char = '|';

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Request kinds understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CreateGroup,
    JoinGroup,
    Send,
    Unknown,
}

impl MessageKind {
    fn parse(token: &str) -> Self {
        match token {
            "CREATE_GROUP" => MessageKind::CreateGroup,
            "JOIN_GROUP" => MessageKind::JoinGroup,
            "SEND" => MessageKind::Send,
            _ => MessageKind::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::CreateGroup => "CREATE_GROUP",
            MessageKind::JoinGroup => "JOIN_GROUP",
            MessageKind::Send => "SEND",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

/// One control-channel request: `TYPE|USER|GROUP|TEXT` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub user: String,
    pub group: String,
    pub text: String,
}

impl Message {
    pub fn create_group(user: &str, group: &str) -> Self {
        Self {
            kind: MessageKind::CreateGroup,
            user: user.to_string(),
            group: group.to_string(),
            text: String::new(),
        }
    }

    pub fn join_group(user: &str, group: &str) -> Self {
        Self {
            kind: MessageKind::JoinGroup,
            user: user.to_string(),
            group: group.to_string(),
            text: String::new(),
        }
    }

    pub fn send(user: &str, group: &str, text: &str) -> Self {
        Self {
            kind: MessageKind::Send,
            user: user.to_string(),
            group: group.to_string(),
            text: text.to_string(),
        }
    }

    /// Joins the four fields with the delimiter. No escaping is performed;
    /// only the `text` field may safely contain the delimiter itself.
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.kind.as_str(),
            self.user,
            self.group,
            self.text,
            d = DELIMITER,
        )
    }

    /// Decodes one request line. Decoding is total: a line with fewer than
    /// three fields yields the zero-value `Unknown` message instead of an
    /// error.
    ///
    /// The first three fields are whitespace-trimmed; everything after the
    /// third delimiter is the text, kept verbatim so embedded delimiters
    /// survive.
    pub fn decode(line: &str) -> Self {
        let fields: Vec<&str> = line.splitn(4, DELIMITER).collect();
        if fields.len() < 3 {
            return Self {
                kind: MessageKind::Unknown,
                user: String::new(),
                group: String::new(),
                text: String::new(),
            };
        }

        Self {
            kind: MessageKind::parse(fields[0].trim()),
            user: fields[1].trim().to_string(),
            group: fields[2].trim().to_string(),
            text: fields.get(3).copied().unwrap_or_default().to_string(),
        }
    }
}

/// Reason codes carried by error replies. The set is closed; the server
/// never invents new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    InvalidArgs,
    GroupExistsOrInvalid,
    NoSuchGroup,
    NotAMember,
    UnknownCommand,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::InvalidArgs => "invalid_args",
            ErrorReason::GroupExistsOrInvalid => "group_exists_or_invalid",
            ErrorReason::NoSuchGroup => "no_such_group",
            ErrorReason::NotAMember => "not_a_member",
            ErrorReason::UnknownCommand => "unknown_command",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "invalid_args" => Some(ErrorReason::InvalidArgs),
            "group_exists_or_invalid" => Some(ErrorReason::GroupExistsOrInvalid),
            "no_such_group" => Some(ErrorReason::NoSuchGroup),
            "not_a_member" => Some(ErrorReason::NotAMember),
            "unknown_command" => Some(ErrorReason::UnknownCommand),
            _ => None,
        }
    }
}

/// One control-channel reply: `OK` or `ERROR|<reason>` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error(ErrorReason),
}

impl Reply {
    pub fn encode(self) -> String {
        match self {
            Reply::Ok => "OK".to_string(),
            Reply::Error(reason) => format!("ERROR{}{}", DELIMITER, reason.as_str()),
        }
    }

    /// Decodes a reply line; `None` for anything outside the closed reply
    /// set, which callers should surface rather than guess at.
    pub fn decode(line: &str) -> Option<Self> {
        if line == "OK" {
            return Some(Reply::Ok);
        }
        match line.split_once(DELIMITER) {
            Some(("ERROR", reason)) => ErrorReason::parse(reason).map(Reply::Error),
            _ => None,
        }
    }
}

/// One line on the broadcast channel. `more` mirrors the multipart flag of
/// classic messaging sockets: a conforming broadcast unit is an `M|topic`
/// frame followed by an `F|body` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub more: bool,
}

impl Frame {
    pub fn more(payload: &str) -> Self {
        Self {
            payload: payload.to_string(),
            more: true,
        }
    }

    pub fn last(payload: &str) -> Self {
        Self {
            payload: payload.to_string(),
            more: false,
        }
    }

    pub fn encode(&self) -> String {
        let marker = if self.more { 'M' } else { 'F' };
        format!("{}{}{}", marker, DELIMITER, self.payload)
    }

    /// Decodes one frame line. Lenient: a line without a recognized marker
    /// header is treated as a final frame whose payload is the whole line,
    /// so single-frame producers still get through.
    pub fn decode(line: &str) -> Self {
        match line.split_once(DELIMITER) {
            Some(("M", payload)) => Frame::more(payload),
            Some(("F", payload)) => Frame::last(payload),
            _ => Frame::last(line),
        }
    }
}

/// Reads one line, with line endings trimmed. Returns `None` on a cleanly
/// closed connection.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes `line` plus a newline delimiter and flushes so peers see it
/// promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Writes one two-frame broadcast unit, flushing once so both frames leave
/// together.
pub async fn write_unit<W>(writer: &mut W, topic: &str, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(Frame::more(topic).encode().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(Frame::last(body).encode().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
