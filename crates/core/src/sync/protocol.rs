//! Wire format shared with the key-frame editor.
//!
//! Every command is a tag byte followed by a fixed big-endian payload. The
//! only variable-length field is the track name of a request, prefixed by its
//! `u32` byte length.

use crate::{
    tracks::{Interpolation, TrackKey},
    DemoSyncError, Result,
};

pub const CLIENT_GREETING: &[u8] = b"hello, synctracker!";
pub const SERVER_GREETING: &[u8] = b"hello, demo!";

const SET_KEY: u8 = 0;
const DELETE_KEY: u8 = 1;
const GET_TRACK: u8 = 2;
const SET_ROW: u8 = 3;
const PAUSE: u8 = 4;
const SAVE_TRACKS: u8 = 5;

/// Longest track name accepted from the wire.
const MAX_NAME_LEN: usize = 4096;

/// Editor to player.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    SetKey { track: u32, key: TrackKey },
    DeleteKey { track: u32, row: u32 },
    SetRow(u32),
    Pause(bool),
    Save,
}

/// Player to editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    RequestTrack(String),
    SetRow(u32),
}

impl ServerCommand {
    /// Decodes the command at the front of `buf`, returning it with the
    /// number of bytes it used, or `None` while it is incomplete.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((&tag, payload)) = buf.split_first() else {
            return Ok(None);
        };
        let needed = match tag {
            SET_KEY => 13,
            DELETE_KEY => 8,
            SET_ROW => 4,
            PAUSE => 1,
            SAVE_TRACKS => 0,
            other => return Err(DemoSyncError::Protocol(format!("unknown command tag {other}"))),
        };
        if payload.len() < needed {
            return Ok(None);
        }

        let command = match tag {
            SET_KEY => {
                let interpolation = Interpolation::from_code(payload[12]).ok_or_else(|| {
                    DemoSyncError::Protocol(format!("unknown interpolation {}", payload[12]))
                })?;
                ServerCommand::SetKey {
                    track: read_u32(&payload[0..4]),
                    key: TrackKey {
                        row: read_u32(&payload[4..8]),
                        value: f32::from_bits(read_u32(&payload[8..12])),
                        interpolation,
                    },
                }
            }
            DELETE_KEY => ServerCommand::DeleteKey {
                track: read_u32(&payload[0..4]),
                row: read_u32(&payload[4..8]),
            },
            SET_ROW => ServerCommand::SetRow(read_u32(&payload[0..4])),
            PAUSE => ServerCommand::Pause(payload[0] != 0),
            _ => ServerCommand::Save,
        };
        Ok(Some((command, 1 + needed)))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ServerCommand::SetKey { track, key } => {
                out.push(SET_KEY);
                out.extend_from_slice(&track.to_be_bytes());
                out.extend_from_slice(&key.row.to_be_bytes());
                out.extend_from_slice(&key.value.to_bits().to_be_bytes());
                out.push(key.interpolation.code());
            }
            ServerCommand::DeleteKey { track, row } => {
                out.push(DELETE_KEY);
                out.extend_from_slice(&track.to_be_bytes());
                out.extend_from_slice(&row.to_be_bytes());
            }
            ServerCommand::SetRow(row) => {
                out.push(SET_ROW);
                out.extend_from_slice(&row.to_be_bytes());
            }
            ServerCommand::Pause(paused) => {
                out.push(PAUSE);
                out.push(u8::from(*paused));
            }
            ServerCommand::Save => out.push(SAVE_TRACKS),
        }
    }
}

impl ClientCommand {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ClientCommand::RequestTrack(name) => {
                out.push(GET_TRACK);
                out.extend_from_slice(&(name.len() as u32).to_be_bytes());
                out.extend_from_slice(name.as_bytes());
            }
            ClientCommand::SetRow(row) => {
                out.push(SET_ROW);
                out.extend_from_slice(&row.to_be_bytes());
            }
        }
    }

    /// Editor side of [`ClientCommand::encode`].
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some((&tag, payload)) = buf.split_first() else {
            return Ok(None);
        };
        match tag {
            GET_TRACK => {
                if payload.len() < 4 {
                    return Ok(None);
                }
                let len = read_u32(&payload[0..4]) as usize;
                if len > MAX_NAME_LEN {
                    return Err(DemoSyncError::Protocol(format!("track name of {len} bytes")));
                }
                let Some(name) = payload.get(4..4 + len) else {
                    return Ok(None);
                };
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| DemoSyncError::Protocol("track name is not UTF-8".into()))?;
                Ok(Some((ClientCommand::RequestTrack(name), 5 + len)))
            }
            SET_ROW => Ok(payload
                .get(0..4)
                .map(|row| (ClientCommand::SetRow(read_u32(row)), 5))),
            other => Err(DemoSyncError::Protocol(format!("unknown command tag {other}"))),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
