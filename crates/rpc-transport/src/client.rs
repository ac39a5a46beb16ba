//! Minimal line-framed client, used by tooling and end-to-end tests.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::server::{TransportError, write_line};

/// A connected client. Requests are answered in order, one line each.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send a request object and wait for its response object.
    pub async fn call(&mut self, request: &Value) -> Result<Value, TransportError> {
        let line = self.send_raw(serde_json::to_string(request)?).await?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Send an arbitrary payload line and return the raw reply line.
    pub async fn send_raw(&mut self, payload: impl AsRef<[u8]>) -> Result<String, TransportError> {
        write_line(&mut self.writer, payload.as_ref()).await?;
        self.read_line().await
    }

    /// Read one reply line without sending anything (e.g. a connect-time rejection).
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(TransportError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}
