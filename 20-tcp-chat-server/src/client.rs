use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    frame::{Frame, LineReader, line_reader, next_line, write_frame},
    server::ServerConfig,
};

/// Usernames currently online, as last reported by the server.
#[derive(Debug, Default)]
struct Roster {
    users: Vec<String>,
}

impl Roster {
    fn replace(&mut self, usernames: Vec<String>) {
        self.users = usernames;
    }

    fn add(&mut self, username: &str) -> bool {
        if self.users.iter().any(|user| user == username) {
            return false;
        }
        self.users.push(username.to_string());
        true
    }

    fn remove(&mut self, username: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|user| user != username);
        self.users.len() != before
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut lines, mut writer) = establish_connection(&args).await?;
    write_frame(
        &mut writer,
        &Frame::Join {
            username: args.username.clone(),
        },
    )
    .await
    .context("failed to send join")?;

    let max_frame_len = ServerConfig::default().max_frame_len;
    let mut stdin = line_reader(tokio::io::stdin(), max_frame_len);
    let mut roster = Roster::default();

    let leaving =
        run_client_loop(&mut lines, &mut writer, &mut stdin, &mut roster, &args.username).await?;
    if leaving {
        send_leave(&mut writer, &args.username).await;
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(LineReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    let max_frame_len = ServerConfig::default().max_frame_len;
    Ok((line_reader(reader, max_frame_len), writer))
}

/// Returns `true` when the user asked to leave, `false` when the server hung up.
async fn run_client_loop(
    lines: &mut LineReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut LineReader<Stdin>,
    roster: &mut Roster,
    username: &str,
) -> Result<bool> {
    // Both line readers buffer partial input internally, so losing a race
    // in this select! drops nothing.
    loop {
        select! {
            server_line = next_line(lines) => {
                if !handle_server_line(server_line, roster).await? {
                    return Ok(false);
                }
            }
            input = next_line(stdin) => {
                if !handle_stdin_input(input, writer, username).await? {
                    return Ok(true);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(true);
            }
        }
    }
}

async fn handle_server_line(line: io::Result<Option<String>>, roster: &mut Roster) -> Result<bool> {
    match line? {
        Some(line) => {
            match Frame::parse(&line) {
                Ok(frame) => render_frame(frame, roster).await?,
                Err(error) => warn!(%error, "ignoring malformed frame from server"),
            }
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
    username: &str,
) -> Result<bool> {
    let Some(input) = input? else {
        return Ok(false);
    };

    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_frame(
        writer,
        &Frame::Chat {
            text: format!("{username}: {text}"),
        },
    )
    .await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn send_leave(writer: &mut OwnedWriteHalf, username: &str) {
    let leave = Frame::Leave {
        username: username.to_string(),
    };
    if let Err(error) = write_frame(writer, &leave).await {
        warn!(?error, "failed to send leave");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_frame(frame: Frame, roster: &mut Roster) -> io::Result<()> {
    match frame {
        Frame::Users { usernames } => {
            roster.replace(usernames);
            write_stdout(&format!("*** currently online: {}", roster.users.join(", "))).await
        }
        Frame::Join { username } => {
            if !roster.add(&username) {
                return Ok(());
            }
            write_stdout(&format!("*** {username} joined the chat")).await
        }
        Frame::Leave { username } => {
            if !roster.remove(&username) {
                return Ok(());
            }
            write_stdout(&format!("*** {username} left the chat")).await
        }
        Frame::Chat { text } => write_stdout(&text).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_tracks_presence_events() {
        let mut roster = Roster::default();
        roster.replace(vec!["alice".into(), "bob".into()]);

        assert!(!roster.add("bob"));
        assert!(roster.add("carol"));
        assert!(roster.remove("alice"));
        assert!(!roster.remove("alice"));
        assert_eq!(roster.users, vec!["bob".to_string(), "carol".to_string()]);
    }
}
