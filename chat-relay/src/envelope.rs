use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Version stamped into every frame as the `v` field.
pub const PROTOCOL_VERSION: u64 = 1;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// The unit exchanged between clients and the relay, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    RegisterRequest {
        username: String,
    },
    RegisterResult {
        ok: bool,
    },
    /// Full roster after a change, plus who caused it.
    RosterDelta {
        users: Vec<String>,
        #[serde(default)]
        joined: Option<String>,
        #[serde(default)]
        left: Option<String>,
    },
    /// `from` and `sent_at` may be omitted by clients; the relay fills them in.
    Chat {
        #[serde(default)]
        from: String,
        body: String,
        #[serde(default)]
        sent_at: String,
        #[serde(default)]
        to_self: bool,
    },
    Whisper {
        from: String,
        body: String,
        sent_at: String,
        to: String,
    },
}

impl Envelope {
    pub fn chat(from: impl Into<String>, body: impl Into<String>, to_self: bool) -> Self {
        Envelope::Chat {
            from: from.into(),
            body: body.into(),
            sent_at: timestamp(),
            to_self,
        }
    }

    pub fn whisper(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Envelope::Whisper {
            from: from.into(),
            body: body.into(),
            sent_at: timestamp(),
            to: to.into(),
        }
    }

    pub fn joined(users: Vec<String>, username: impl Into<String>) -> Self {
        Envelope::RosterDelta {
            users,
            joined: Some(username.into()),
            left: None,
        }
    }

    pub fn left(users: Vec<String>, username: impl Into<String>) -> Self {
        Envelope::RosterDelta {
            users,
            joined: None,
            left: Some(username.into()),
        }
    }
}

/// Local wall-clock time as `HH:MM:SS`.
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    v: u64,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

/// Reads the next envelope, or `None` once the peer has closed the stream.
pub async fn read_envelope<R>(reader: &mut R) -> io::Result<Option<Envelope>>
where
    R: AsyncBufRead + Unpin,
{
    // One JSON object per line, so netcat can speak the protocol by hand.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        return decode_frame(trimmed).map(Some);
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = encode_frame(envelope)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_frame(envelope: &Envelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(&OutboundFrame {
        v: PROTOCOL_VERSION,
        envelope,
    })
    .map_err(to_io_error)
}

fn decode_frame(line: &str) -> io::Result<Envelope> {
    let value: Value = serde_json::from_str(line).map_err(to_io_error)?;
    match value.get("v").and_then(Value::as_u64) {
        Some(PROTOCOL_VERSION) => {}
        Some(other) => {
            return Err(invalid_data(format!(
                "unsupported protocol version {other}"
            )));
        }
        None => return Err(invalid_data("frame is missing protocol version")),
    }
    serde_json::from_value(value).map_err(to_io_error)
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
