//! Live connection to an external key-frame editor.

pub mod protocol;

use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use protocol::{ClientCommand, ServerCommand, CLIENT_GREETING, SERVER_GREETING};

use crate::{config::SyncConfig, tracks::KeyframeTrackStore, DemoSyncError, Result};

const READ_CHUNK: usize = 4096;

/// Playback controls the editor drives.
pub trait Transport {
    fn pause(&mut self, paused: bool);
    fn set_row(&mut self, row: u32);
    fn is_playing(&self) -> bool;
}

/// TCP client of the editor. Blocks only inside [`LiveSyncSession::connect`];
/// [`LiveSyncSession::update`] never waits on the socket.
#[derive(Debug)]
pub struct LiveSyncSession {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    /// Newest row not yet queued; replaced while the socket is backed up.
    pending_row: Option<u32>,
    last_row: Option<u32>,
}

impl LiveSyncSession {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
            stream: None,
            inbound: Vec::with_capacity(READ_CHUNK),
            outbound: Vec::new(),
            pending_row: None,
            last_row: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.stream.is_some()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connects and greets the editor, then queues a track request for every
    /// track in `store`.
    pub fn connect(&mut self, store: &mut KeyframeTrackStore) -> Result<()> {
        self.drop_connection();
        let stream = match self.open() {
            Ok(stream) => stream,
            Err(err) => {
                tracing::info!(server = %self.address(), %err, "could not connect to sync editor");
                return Err(err);
            }
        };

        self.stream = Some(stream);
        store.reset_announcements();
        self.request_tracks(store);
        tracing::info!(server = %self.address(), tracks = store.len(), "connected to sync editor");
        Ok(())
    }

    fn open(&self) -> Result<TcpStream> {
        let address = self.address();
        let candidates = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| DemoSyncError::ProtocolDisconnect(format!("{address}: {err}")))?;

        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.timeout) {
                Ok(mut stream) => {
                    self.handshake(&mut stream)?;
                    return Ok(stream);
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(DemoSyncError::ProtocolDisconnect(match last_error {
            Some(err) => format!("{address}: {err}"),
            None => format!("{address}: no addresses resolved"),
        }))
    }

    fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(CLIENT_GREETING)?;

        let mut reply = [0_u8; SERVER_GREETING.len()];
        stream.read_exact(&mut reply)?;
        if reply != SERVER_GREETING {
            return Err(DemoSyncError::Protocol(format!(
                "unexpected greeting {:?}",
                String::from_utf8_lossy(&reply)
            )));
        }

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(())
    }

    /// Re-reads tracks from disk, keeping edited ones, then connects again.
    pub fn reconnect(&mut self, store: &mut KeyframeTrackStore) -> Result<()> {
        self.drop_connection();
        store.reload_from_disk()?;
        self.connect(store)
    }

    /// Saves the tracks and closes the connection.
    pub fn disconnect(&mut self, store: &KeyframeTrackStore) {
        if !self.is_online() {
            return;
        }
        if let Err(err) = store.save() {
            tracing::error!(%err, "could not save tracks on disconnect");
        }
        self.drop_connection();
        tracing::info!(server = %self.address(), "disconnected from sync editor");
    }

    /// One non-blocking exchange with the editor: applies every complete
    /// inbound command, requests new tracks and reports the playing row.
    ///
    /// A lost connection takes the session offline and returns
    /// [`DemoSyncError::ProtocolDisconnect`]; tracks stay as they are.
    pub fn update(
        &mut self,
        row: f64,
        store: &mut KeyframeTrackStore,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        if !self.is_online() {
            return Ok(());
        }

        self.request_tracks(store);
        // Commands that arrived before a hang-up still apply.
        let received = self.receive();
        if let Err(err) = self.dispatch(store, transport).and(received) {
            return Err(self.lost(err));
        }

        if transport.is_playing() {
            let row = row.max(0.0).floor() as u32;
            if self.last_row != Some(row) {
                self.pending_row = Some(row);
                self.last_row = Some(row);
            }
        }

        self.stage_row();
        match self.flush() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.lost(err)),
        }
    }

    fn request_tracks(&mut self, store: &mut KeyframeTrackStore) {
        for (index, name) in store.take_unannounced() {
            tracing::trace!(track = %name, index, "requesting track");
            ClientCommand::RequestTrack(name).encode(&mut self.outbound);
        }
    }

    /// Queues the pending row once everything before it has been written, so
    /// a stalled editor holds at most one stale row.
    fn stage_row(&mut self) {
        if !self.outbound.is_empty() {
            return;
        }
        if let Some(row) = self.pending_row.take() {
            ClientCommand::SetRow(row).encode(&mut self.outbound);
        }
    }

    fn receive(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(DemoSyncError::ProtocolDisconnect(
                        "connection closed by editor".into(),
                    ))
                }
                Ok(read) => self.inbound.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(DemoSyncError::ProtocolDisconnect(err.to_string())),
            }
        }
    }

    fn dispatch(&mut self, store: &mut KeyframeTrackStore, transport: &mut dyn Transport) -> Result<()> {
        let mut consumed = 0;
        while let Some((command, used)) = ServerCommand::decode(&self.inbound[consumed..])? {
            consumed += used;
            match command {
                ServerCommand::SetKey { track, key } => {
                    if !store.set_key(track as usize, key) {
                        tracing::warn!(track, row = key.row, "key for unknown track ignored");
                    }
                }
                ServerCommand::DeleteKey { track, row } => {
                    store.delete_key(track as usize, row);
                }
                ServerCommand::SetRow(row) => {
                    self.pending_row = None;
                    self.last_row = Some(row);
                    transport.set_row(row);
                }
                ServerCommand::Pause(paused) => transport.pause(paused),
                ServerCommand::Save => {
                    if let Err(err) = store.save() {
                        tracing::error!(%err, "could not save tracks");
                    }
                }
            }
        }
        self.inbound.drain(..consumed);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut written = 0;
        while written < self.outbound.len() {
            match stream.write(&self.outbound[written..]) {
                Ok(0) => {
                    return Err(DemoSyncError::ProtocolDisconnect(
                        "connection closed by editor".into(),
                    ))
                }
                Ok(count) => written += count,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(DemoSyncError::ProtocolDisconnect(err.to_string())),
            }
        }
        self.outbound.drain(..written);
        Ok(())
    }

    fn lost(&mut self, err: DemoSyncError) -> DemoSyncError {
        tracing::warn!(server = %self.address(), %err, "lost connection to sync editor");
        self.drop_connection();
        match err {
            DemoSyncError::ProtocolDisconnect(_) => err,
            other => DemoSyncError::ProtocolDisconnect(other.to_string()),
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.inbound.clear();
        self.outbound.clear();
        self.pending_row = None;
        self.last_row = None;
    }
}
