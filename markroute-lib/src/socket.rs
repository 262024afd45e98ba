//! Control-socket client: one JSON command per connection, write side
//! shut down to signal end-of-command, response read to EOF.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use std::io;
use std::path::{Path, PathBuf};

use crate::command::{Command, Response};

pub const DEFAULT_PATH: &str = "/var/run/markroute.sock";
pub const ENV_VAR: &str = "MARKROUTE_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path}`: {error}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing to socket: {0}")]
    WriteSocketIO(io::Error),
    #[error("error reading from socket: {0}")]
    ReadSocketIO(io::Error),
}

pub async fn process_cmd(socket_path: &Path, cmd: &Command) -> Result<Response, Error> {
    check_path(socket_path)?;

    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|error| Error::ConnectSocketIO {
            socket_path: socket_path.to_path_buf(),
            error,
        })?;

    let json_cmd = serde_json::to_string(cmd)?;
    stream
        .write_all(json_cmd.as_bytes())
        .await
        .map_err(Error::WriteSocketIO)?;
    // flushing is not enough: shut down the write half so the server
    // sees EOF and knows the whole command arrived
    stream.shutdown().await.map_err(Error::WriteSocketIO)?;

    let mut raw = String::new();
    stream
        .read_to_string(&mut raw)
        .await
        .map_err(Error::ReadSocketIO)?;
    Ok(serde_json::from_str(&raw)?)
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(error) => Err(Error::SocketPathIO {
            socket_path: socket_path.to_path_buf(),
            error,
        }),
    }
}
