//! russh shell channel adapter
//!
//! A russh `Channel` is an async object owned by one task. The pump task
//! below owns it and bridges it to the [`RemoteReader`]/[`RemoteWriter`]
//! halves:
//!
//! ```text
//!  SshShellWriter ──ShellCommand──▶ pump task ──▶ channel.data / window_change
//!  SshShellReader ◀──Bytes (bounded)── pump task ◀── channel.wait()
//! ```
//!
//! The pump only pulls the next channel message once the previous chunk has
//! been handed to the reader, so a slow browser back-pressures the SSH
//! window instead of buffering without bound.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::TerminalGeometry;
use super::remote::{RemoteHandle, RemoteReader, RemoteWriter};

/// Chunks buffered between the pump and the blocking reader
const SHELL_OUTPUT_BUFFER: usize = 32;

const SHELL_COMMAND_BUFFER: usize = 256;

/// How long `shutdown_channel` waits for the pump before aborting it
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands accepted by the pump task
#[derive(Debug)]
pub(crate) enum ShellCommand {
    Data(Bytes),
    Resize(TerminalGeometry),
    Close,
}

/// Wrap an open shell channel into the two remote halves
pub(crate) fn into_remote(
    handle: Handle<ClientHandler>,
    channel: Channel<client::Msg>,
    label: String,
) -> RemoteHandle {
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(SHELL_OUTPUT_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel::<ShellCommand>(SHELL_COMMAND_BUFFER);

    let pump = tokio::spawn(run_pump(channel, cmd_rx, out_tx, label.clone()));

    RemoteHandle::new(
        Box::new(SshShellReader::new(out_rx)),
        Box::new(SshShellWriter {
            label,
            cmd_tx,
            pump: Some(pump),
            handle: Some(handle),
            channel_closed: false,
        }),
    )
}

async fn run_pump(
    mut channel: Channel<client::Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    out_tx: mpsc::Sender<Bytes>,
    label: String,
) {
    debug!("Shell pump started for {}", label);

    let mut pending: Option<Bytes> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            warn!("Failed to send data to SSH channel for {}: {}", label, e);
                            break;
                        }
                    }
                    Some(ShellCommand::Resize(geometry)) => {
                        if let Err(e) = channel
                            .window_change(geometry.cols, geometry.rows, 0, 0)
                            .await
                        {
                            // Not fatal, the shell keeps its old size
                            warn!("Failed to resize PTY for {}: {}", label, e);
                        } else {
                            debug!("PTY resized to {}x{} for {}", geometry.cols, geometry.rows, label);
                        }
                    }
                    Some(ShellCommand::Close) | None => {
                        debug!("Close requested for {}", label);
                        if let Err(e) = channel.eof().await {
                            debug!("Channel EOF for {} failed: {}", label, e);
                        }
                        if let Err(e) = channel.close().await {
                            debug!("Channel close for {} failed: {}", label, e);
                        }
                        break;
                    }
                }
            }

            permit = out_tx.reserve(), if pending.is_some() => {
                match permit {
                    Ok(permit) => {
                        if let Some(chunk) = pending.take() {
                            permit.send(chunk);
                        }
                    }
                    // Reader gone: keep draining the channel so the server is not stalled
                    Err(_) => pending = None,
                }
            }

            msg = channel.wait(), if pending.is_none() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        pending = Some(Bytes::copy_from_slice(&data));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // stderr shares the terminal
                        if ext == 1 {
                            pending = Some(Bytes::copy_from_slice(&data));
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        info!("SSH channel EOF for {}", label);
                        break;
                    }
                    Some(ChannelMsg::Close) | None => {
                        info!("SSH channel closed for {}", label);
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("Remote shell exited with status {} for {}", exit_status, label);
                    }
                    Some(_) => {}
                }
            }
        }
    }

    // Dropping out_tx ends the reader with Ok(0) once buffered chunks are consumed
    debug!("Shell pump terminated for {}", label);
}

/// Blocking read half. Must only be used from a blocking thread.
pub struct SshShellReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl SshShellReader {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl RemoteReader for SshShellReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// Write/control half, owns the russh client handle
pub struct SshShellWriter {
    label: String,
    cmd_tx: mpsc::Sender<ShellCommand>,
    pump: Option<JoinHandle<()>>,
    handle: Option<Handle<ClientHandler>>,
    channel_closed: bool,
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "SSH channel closed")
}

#[async_trait]
impl RemoteWriter for SshShellWriter {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.channel_closed {
            return Err(channel_gone());
        }
        self.cmd_tx
            .send(ShellCommand::Data(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| channel_gone())
    }

    async fn resize(&mut self, geometry: TerminalGeometry) -> io::Result<()> {
        if self.channel_closed {
            return Err(channel_gone());
        }
        self.cmd_tx
            .send(ShellCommand::Resize(geometry))
            .await
            .map_err(|_| channel_gone())
    }

    async fn shutdown_channel(&mut self) -> io::Result<()> {
        if self.channel_closed {
            return Ok(());
        }
        self.channel_closed = true;

        // The pump may already be gone (remote EOF); that is fine
        let _ = self.cmd_tx.try_send(ShellCommand::Close);

        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(PUMP_JOIN_TIMEOUT, &mut pump).await.is_err() {
                warn!("Shell pump for {} did not stop in time, aborting", self.label);
                pump.abort();
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.shutdown_channel().await?;

        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            debug!("SSH client disconnected for {}", self.label);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel_closed && self.handle.is_none()
    }
}

impl Drop for SshShellWriter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            let _ = self.cmd_tx.try_send(ShellCommand::Close);
            pump.abort();
        }
    }
}
