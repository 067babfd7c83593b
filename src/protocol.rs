//! Control protocol
//!
//! servdctl talks to the daemon over a unix socket with one JSON object
//! per line in each direction.  The shapes here are the whole contract;
//! both sides are in this repository.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Control socket path
pub const SOCKET_PATH: &str = "/run/servd.sock";

/// Request from servdctl to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Health check
    Ping,
    /// List all services with state
    List,
    /// Status of one service
    Status { ident: String },
    /// Start a service; clears manual and crashing blocks
    Start { ident: String },
    /// Stop a service; sets the manual block
    Stop { ident: String },
    /// Stop/start cycle of a running service
    Restart { ident: String },
    /// Re-read configuration files
    Reload,
    /// Switch runlevel
    Runlevel { level: u8 },
    /// Dump the condition store
    Conditions,
}

/// One service as reported to the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcInfo {
    pub ident: String,
    pub kind: String,
    pub state: String,
    pub block: String,
    pub pid: i32,
    pub runlevels: String,
    pub command: String,
    pub description: String,
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    Error(String),
    Services(Vec<SvcInfo>),
    Conditions(Vec<(String, String)>),
    Runlevel { current: String, previous: String },
}

/// Write one request/response as a JSON line
pub async fn send<T: Serialize>(stream: &mut UnixStream, msg: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await
}

/// Read one JSON line into a message
pub async fn recv<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> std::io::Result<T> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    serde_json::from_str(&line).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            Request::Ping,
            Request::List,
            Request::Start {
                ident: "sshd".into(),
            },
            Request::Runlevel { level: 3 },
        ];

        for req in requests {
            let encoded = serde_json::to_string(&req).unwrap();
            let decoded: Request = serde_json::from_str(&encoded).unwrap();
            assert_eq!(format!("{:?}", req), format!("{:?}", decoded));
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            Response::Ok,
            Response::Error("no such service".into()),
            Response::Services(vec![SvcInfo {
                ident: "sshd".into(),
                kind: "service".into(),
                state: "running".into(),
                block: "none".into(),
                pid: 4711,
                runlevels: "[2345]".into(),
                command: "/usr/sbin/sshd".into(),
                description: "SSH daemon".into(),
            }]),
        ];

        for resp in responses {
            let encoded = serde_json::to_string(&resp).unwrap();
            let decoded: Response = serde_json::from_str(&encoded).unwrap();
            assert_eq!(format!("{:?}", resp), format!("{:?}", decoded));
        }
    }
}
