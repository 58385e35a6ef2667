// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request/reply client for the arbiter control socket.

use std::path::PathBuf;

use thiserror::Error;
use tokio::net::UnixStream;

use corral_daemon::protocol::{self, Reply, Request, WireError, IPC_TIMEOUT};

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach the arbiter at {0} (is corrald running?)")]
    NotRunning(PathBuf),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("io error: {0}")]
    Io(std::io::Error),
}

/// One connection per command, like the wire protocol expects.
pub struct ControlClient {
    endpoint: PathBuf,
}

impl ControlClient {
    pub fn new(endpoint: PathBuf) -> Self {
        ControlClient { endpoint }
    }

    pub async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        let stream = match UnixStream::connect(&self.endpoint).await {
            Ok(stream) => stream,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                return Err(ClientError::NotRunning(self.endpoint.clone()));
            }
            Err(e) => return Err(ClientError::Io(e)),
        };
        let (mut reader, mut writer) = stream.into_split();

        protocol::send_timed(&mut writer, &request, IPC_TIMEOUT).await?;
        Ok(protocol::recv_timed(&mut reader, IPC_TIMEOUT).await?)
    }
}
