use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    protocol::{Message, Reply, read_line, write_line},
    receiver::{self, ReceiverControl},
};

const HELP: &str = "Commands:\n  create_group <group>\n  join_group <group>\n  \
    send <group> <text>\n  help\n  exit";

/// One parsed line of raw interactive input; the line terminator is
/// stripped before tokenizing. The first two tokens are
/// whitespace-delimited; send text is the rest of the line, left-trimmed.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    CreateGroup { group: String },
    JoinGroup { group: String },
    Send { group: String, text: String },
    Help,
    Exit,
    Unknown,
}

impl Command {
    fn parse(line: &str) -> Self {
        // Stdin lines arrive with their terminator still attached.
        let line = line.trim_end_matches(['\r', '\n']);
        let (command, rest) = split_token(line);
        match command {
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            "create_group" => match split_token(rest).0 {
                "" => Command::Unknown,
                group => Command::CreateGroup {
                    group: group.to_string(),
                },
            },
            "join_group" => match split_token(rest).0 {
                "" => Command::Unknown,
                group => Command::JoinGroup {
                    group: group.to_string(),
                },
            },
            "send" => {
                let (group, text) = split_token(rest);
                if group.is_empty() {
                    return Command::Unknown;
                }
                Command::Send {
                    group: group.to_string(),
                    text: text.trim_start().to_string(),
                }
            }
            _ => Command::Unknown,
        }
    }
}

/// First whitespace-delimited token and everything after it. The remainder
/// keeps its leading whitespace so callers choose whether to trim.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], &s[end..]),
        None => (s, ""),
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = connect_control(&args).await?;
    let feed = connect_broadcast(&args).await?;

    let control = Arc::new(ReceiverControl::new());
    let receiver_task = tokio::spawn(receiver::run(
        Arc::clone(&control),
        feed,
        tokio::io::stdout(),
    ));

    write_stderr(HELP).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        prompt().await?;
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                let keep_going = handle_input(
                    bytes_read,
                    &input,
                    &args.user,
                    &mut reader,
                    &mut writer,
                    &control,
                )
                .await?;
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    control.request_stop();
    await_receiver(receiver_task).await;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn connect_control(
    args: &ClientArgs,
) -> Result<(
    BufReader<tokio::net::tcp::OwnedReadHalf>,
    tokio::net::tcp::OwnedWriteHalf,
)> {
    let stream = TcpStream::connect(args.control)
        .await
        .with_context(|| format!("failed to connect to control endpoint {}", args.control))?;

    debug!("control channel connected to {}", args.control);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn connect_broadcast(args: &ClientArgs) -> Result<BufReader<TcpStream>> {
    let stream = TcpStream::connect(args.broadcast)
        .await
        .with_context(|| format!("failed to connect to broadcast endpoint {}", args.broadcast))?;

    debug!("broadcast channel connected to {}", args.broadcast);

    Ok(BufReader::new(stream))
}

async fn handle_input(
    bytes_read: io::Result<usize>,
    input: &str,
    user: &str,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    control: &ReceiverControl,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        // Closed stdin behaves like `exit`.
        return Ok(false);
    }

    match Command::parse(input) {
        Command::Help => {
            write_stderr(HELP).await?;
            Ok(true)
        }
        Command::Exit => Ok(false),
        Command::Unknown => {
            write_stdout("Unknown command. Type 'help'.").await?;
            Ok(true)
        }
        Command::CreateGroup { group } => {
            enter_group(Message::create_group(user, &group), &group, reader, writer, control).await
        }
        Command::JoinGroup { group } => {
            enter_group(Message::join_group(user, &group), &group, reader, writer, control).await
        }
        Command::Send { group, text } => {
            match round_trip(reader, writer, &Message::send(user, &group, &text)).await {
                Ok(reply) => write_stdout(&reply).await?,
                Err(error) => write_stderr(&format!("request failed: {error:#}")).await?,
            }
            Ok(true)
        }
    }
}

/// Round trip for create_group and join_group, subscribing to the group on
/// a successful reply.
async fn enter_group(
    message: Message,
    group: &str,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    control: &ReceiverControl,
) -> Result<bool> {
    let reply = match round_trip(reader, writer, &message).await {
        Ok(reply) => reply,
        Err(error) => {
            write_stderr(&format!("request failed: {error:#}")).await?;
            return Ok(true);
        }
    };
    write_stdout(&reply).await?;

    if Reply::decode(&reply) == Some(Reply::Ok) {
        // Broadcasts published before the filter takes effect are still
        // missed (slow joiner).
        control.request_subscribe(group);
        write_stdout(&format!("Subscribed to '{group}'")).await?;
    }
    Ok(true)
}

/// One strict send-then-receive exchange on the control channel. There is
/// no deadline: an unresponsive server blocks the command path.
async fn round_trip(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &Message,
) -> Result<String> {
    write_line(writer, &message.encode()).await?;
    match read_line(reader).await? {
        Some(reply) => Ok(reply),
        None => anyhow::bail!("server closed the control connection"),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn await_receiver(task: tokio::task::JoinHandle<Result<()>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(?error, "receiver loop ended with error"),
        Err(error) => warn!(?error, "receiver task failed"),
    }
}

async fn shutdown_connection(writer: &mut tokio::net::tcp::OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown control writer cleanly");
    }
}

async fn prompt() -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(b"> ").await?;
    stderr.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(format!("{line}\n").as_bytes()).await?;
    stderr.flush().await
}
