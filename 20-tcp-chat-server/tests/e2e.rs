mod common;

use std::{net::SocketAddr, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use common::TestClient;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const STDOUT_TIMEOUT: Duration = Duration::from_secs(3);

/// A terminal client process driven through its stdin and stdout.
struct Terminal {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Terminal {
    async fn spawn(binary: &Path, username: &str, addr: SocketAddr) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--username", username, "--server"])
            .arg(addr.to_string())
            .env("RUST_LOG", "error")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn client {username}"))?;

        let stdin = child.stdin.take().context("client stdin")?;
        let stdout = child.stdout.take().context("client stdout")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn type_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn shows(&mut self, expected: &str) -> Result<()> {
        let line = timeout(STDOUT_TIMEOUT, self.stdout.next_line())
            .await
            .map_err(|_| anyhow!("timed out waiting for '{expected}'"))??
            .ok_or_else(|| anyhow!("stdout closed while waiting for '{expected}'"))?;
        anyhow::ensure!(line == expected, "expected '{expected}', got '{line}'");
        Ok(())
    }
}

/// Starts the server on an ephemeral port and returns the address it logged.
async fn spawn_server(binary: &Path) -> Result<(Child, SocketAddr)> {
    let mut child = Command::new(binary)
        .args(["server", "--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("spawn server")?;

    let mut logs = BufReader::new(child.stdout.take().context("server stdout")?).lines();
    let addr = timeout(STDOUT_TIMEOUT, listening_addr(&mut logs))
        .await
        .context("waiting for server banner")??;

    // Keep the log pipe drained for the rest of the run.
    tokio::spawn(async move { while let Ok(Some(_)) = logs.next_line().await {} });

    Ok((child, addr))
}

async fn listening_addr(logs: &mut Lines<BufReader<ChildStdout>>) -> Result<SocketAddr> {
    while let Some(line) = logs.next_line().await? {
        if let Some((_, addr)) = line.split_once("listening on ") {
            return Ok(addr.trim().parse()?);
        }
    }
    Err(anyhow!("server exited before listening"))
}

#[tokio::test]
async fn terminal_clients_talk_through_the_server() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("tcp-chat-server");
    let (mut server, addr) = spawn_server(binary).await?;

    // A raw protocol client watches everything from the server's side.
    let (mut carol, roster) = TestClient::join(addr, "carol").await?;
    assert_eq!(roster, "CMD:USERS:carol");

    let mut alice = Terminal::spawn(binary, "alice", addr).await?;
    alice.shows("*** currently online: carol, alice").await?;
    assert_eq!(carol.expect_line().await?, "CMD:JOIN:alice");

    carol.send("carol: hi alice").await?;
    alice.shows("carol: hi alice").await?;
    alice.type_line("hello carol").await?;
    assert_eq!(carol.expect_line().await?, "alice: hello carol");

    let mut bob = Terminal::spawn(binary, "bob", addr).await?;
    bob.shows("*** currently online: carol, alice, bob").await?;
    alice.shows("*** bob joined the chat").await?;
    assert_eq!(carol.expect_line().await?, "CMD:JOIN:bob");

    // Killing the process skips the leave frame; the server notices the closed socket.
    alice.child.kill().await?;
    bob.shows("*** alice left the chat").await?;
    assert_eq!(carol.expect_line().await?, "CMD:LEAVE:alice");

    bob.type_line("/quit").await?;
    bob.shows("*** leaving chat").await?;
    assert_eq!(carol.expect_line().await?, "CMD:LEAVE:bob");
    // The client's blocking stdin read only returns once the pipe closes.
    drop(bob.stdin);
    let status = timeout(STDOUT_TIMEOUT, bob.child.wait()).await??;
    assert!(status.success(), "bob exited with {status}");

    carol.expect_silence().await?;
    server.kill().await?;
    Ok(())
}
