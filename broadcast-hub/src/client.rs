use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reader = SplitStream<Socket>;
type Writer = SplitSink<Socket, Message>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(Writer, Reader)> {
    let url = args.url();
    let (socket, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {}", args.server);

    Ok(socket.split())
}

// `next_line` is cancellation safe, so a server frame arriving mid-line does
// not lose the part of the line read so far.
async fn run_client_loop<R>(
    reader: &mut Reader,
    writer: &mut Writer,
    stdin: &mut Lines<R>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            frame = reader.next() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Some(text) = outgoing_text(line?) else {
                    write_stdout("*** leaving chat").await?;
                    break;
                };
                if !text.is_empty() {
                    writer
                        .send(Message::text(text))
                        .await
                        .context("failed to send message")?;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            write_stdout(text.as_str()).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(error)) => Err(error).context("connection to hub failed"),
    }
}

/// What to send for one line of stdin; `None` means the user is leaving.
/// Empty lines come back empty and are not sent.
fn outgoing_text(line: Option<String>) -> Option<String> {
    let line = line?;
    let text = line.trim_end_matches('\r');
    if text.eq_ignore_ascii_case("/quit") {
        return None;
    }
    Some(text.to_owned())
}

async fn handle_ctrl_c(result: io::Result<()>) -> io::Result<()> {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
    write_stdout("*** leaving chat").await
}

async fn shutdown_connection(writer: &mut Writer) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close websocket cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
