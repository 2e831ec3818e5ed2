//! TCP test client shared by the integration tests.
#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Connects, joins as `username` and consumes the roster reply.
    pub async fn join(addr: SocketAddr, username: &str) -> Result<(Self, String)> {
        let mut client = Self::connect(addr).await?;
        client.send(&format!("CMD:JOIN:{username}")).await?;
        let roster = client.expect_line().await?;
        Ok((client, roster))
    }

    pub async fn send(&mut self, line: &str) -> Result<()> {
        self.send_raw(&format!("{line}\n")).await
    }

    pub async fn send_raw(&mut self, bytes: &str) -> Result<()> {
        self.writer.write_all(bytes.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn expect_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for a line"))??;
        if bytes == 0 {
            return Err(anyhow!("connection closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    pub async fn expect_silence(&mut self) -> Result<()> {
        let mut line = String::new();
        match timeout(QUIET_PERIOD, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(()),
            Ok(result) => Err(anyhow!("expected silence, got {result:?} '{line}'")),
        }
    }

    pub async fn expect_closed(&mut self) -> Result<()> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for close"))??;
        if bytes != 0 {
            return Err(anyhow!("expected close, got '{line}'"));
        }
        Ok(())
    }
}

