use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    command::LEAVE,
    envelope::{Envelope, read_envelope, timestamp, write_envelope},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut stdin = BufReader::new(tokio::io::stdin());

    let Some(username) =
        register(&mut reader, &mut writer, &mut stdin, args.username.clone()).await?
    else {
        shutdown_connection(&mut writer).await;
        return Ok(());
    };
    write_stdout(&format!("*** connected as {username}")).await?;

    let mut input = String::new();
    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Offers `username`, asking stdin for another one while the relay refuses.
/// Returns `None` if stdin runs dry before a name is accepted.
async fn register<R, W, I>(
    reader: &mut R,
    writer: &mut W,
    stdin: &mut I,
    mut username: String,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    loop {
        write_envelope(
            writer,
            &Envelope::RegisterRequest {
                username: username.clone(),
            },
        )
        .await?;

        if await_register_result(reader).await? {
            return Ok(Some(username));
        }

        write_stderr(&format!("!!! username '{username}' is not available, enter another:"))
            .await?;
        let mut line = String::new();
        if stdin.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        username = line.trim().to_string();
    }
}

async fn await_register_result<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_envelope(reader).await? {
            Some(Envelope::RegisterResult { ok }) => return Ok(ok),
            Some(_) => continue,
            None => bail!("relay closed the connection during registration"),
        }
    }
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            inbound = read_envelope(reader) => {
                if !handle_inbound(inbound).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                send_leave(writer).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_inbound(envelope: io::Result<Option<Envelope>>) -> Result<bool> {
    match envelope? {
        Some(envelope) => {
            for line in render_envelope(&envelope) {
                write_stdout(&line).await?;
            }
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        send_leave(writer).await?;
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    if text == LEAVE {
        send_leave(writer).await?;
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_envelope(writer, &outgoing_chat(text)).await?;
    Ok(true)
}

async fn send_leave(writer: &mut OwnedWriteHalf) -> io::Result<()> {
    write_envelope(writer, &outgoing_chat(LEAVE)).await
}

fn outgoing_chat(body: &str) -> Envelope {
    Envelope::Chat {
        from: String::new(),
        body: body.to_string(),
        sent_at: timestamp(),
        to_self: false,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn render_envelope(envelope: &Envelope) -> Vec<String> {
    match envelope {
        Envelope::Chat {
            from,
            body,
            sent_at,
            ..
        } => vec![format!("[{sent_at}] <{from}> {body}")],
        Envelope::Whisper {
            from,
            body,
            sent_at,
            ..
        } => vec![format!("[{sent_at}] *{from}* {body}")],
        Envelope::RosterDelta {
            users,
            joined,
            left,
        } => {
            let mut lines = Vec::new();
            if let Some(name) = joined {
                lines.push(format!("*** {name} joined the chat"));
            }
            if let Some(name) = left {
                lines.push(format!("*** {name} left the chat"));
            }
            lines.push(format!("*** online: {}", users.join(", ")));
            lines
        }
        Envelope::RegisterRequest { .. } | Envelope::RegisterResult { .. } => Vec::new(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
