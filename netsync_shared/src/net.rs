//! Networking primitives.
//!
//! Goals:
//! - Named-message envelopes (`{"event": ..., "data": ...}`) for both directions.
//! - A reliable TCP frame codec: `u32` length, one flag byte, payload.
//! - Optional zstd compression of payloads above a size threshold.

use std::collections::BTreeMap;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{math::Vec3, status::ServerStatusSnapshot};

/// Largest accepted frame (after the length prefix).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Reason string servers send for administrative closes.
pub const SERVER_CLOSE_REASON: &str = "server-close";

/// Errors raised by transports and the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server address {0:?}")]
    InvalidAddress(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("compression: {0}")]
    Compression(std::io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("empty frame")]
    EmptyFrame,
    #[error("transport not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("connect timed out")]
    Timeout,
}

bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSED = 0b0000_0001;
    }
}

// ─── Outbound ───

/// Client -> server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMsg {
    Join { name: String, team: String },
    UpdatePosition(PoseUpdate),
    RequestServerStatus {},
    Shoot(serde_json::Value),
    CaptureFlag(serde_json::Value),
    ScoreFlag(serde_json::Value),
    Message { text: String, timestamp: i64 },
}

impl ClientMsg {
    /// Wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMsg::Join { .. } => "join",
            ClientMsg::UpdatePosition(_) => "updatePosition",
            ClientMsg::RequestServerStatus {} => "requestServerStatus",
            ClientMsg::Shoot(_) => "shoot",
            ClientMsg::CaptureFlag(_) => "captureFlag",
            ClientMsg::ScoreFlag(_) => "scoreFlag",
            ClientMsg::Message { .. } => "message",
        }
    }
}

/// Partial pose update. Channels that did not change are omitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PoseUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec3>,
}

impl PoseUpdate {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.rotation.is_none()
    }
}

// ─── Inbound ───

/// Server -> client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMsg {
    QueueUpdate(QueueUpdateMsg),
    ServerStatus(ServerStatusSnapshot),
    Players(PlayerMap),
    JoinSuccess(JoinSuccess),
    /// Sent right before a server-initiated close.
    Disconnect { reason: String },
    PlayerKilled(serde_json::Value),
    FlagCaptured(serde_json::Value),
    FlagReturned(serde_json::Value),
    FlagScored(serde_json::Value),
    GameStart(serde_json::Value),
    GameOver(serde_json::Value),
    HealthUpdate(serde_json::Value),
    StartRespawnTimer(serde_json::Value),
    PlayerRespawned(serde_json::Value),
    StatsUpdate(serde_json::Value),
}

impl ServerMsg {
    /// Splits relay-only game events from the messages this layer interprets.
    pub fn into_relay(self) -> Result<(RelayKind, serde_json::Value), ServerMsg> {
        let relayed = match self {
            ServerMsg::PlayerKilled(v) => (RelayKind::PlayerKilled, v),
            ServerMsg::FlagCaptured(v) => (RelayKind::FlagCaptured, v),
            ServerMsg::FlagReturned(v) => (RelayKind::FlagReturned, v),
            ServerMsg::FlagScored(v) => (RelayKind::FlagScored, v),
            ServerMsg::GameStart(v) => (RelayKind::GameStart, v),
            ServerMsg::GameOver(v) => (RelayKind::GameOver, v),
            ServerMsg::HealthUpdate(v) => (RelayKind::HealthUpdate, v),
            ServerMsg::StartRespawnTimer(v) => (RelayKind::StartRespawnTimer, v),
            ServerMsg::PlayerRespawned(v) => (RelayKind::PlayerRespawned, v),
            ServerMsg::StatsUpdate(v) => (RelayKind::StatsUpdate, v),
            other => return Err(other),
        };
        Ok(relayed)
    }
}

/// Game events this layer forwards to the bus without interpreting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelayKind {
    PlayerKilled,
    FlagCaptured,
    FlagReturned,
    FlagScored,
    GameStart,
    GameOver,
    HealthUpdate,
    StartRespawnTimer,
    PlayerRespawned,
    StatsUpdate,
}

/// Admission queue notification. `position == 0` means admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdateMsg {
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait_time: Option<WaitEstimate>,
}

/// Servers send either a number of seconds or a preformatted label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WaitEstimate {
    Seconds(u64),
    Label(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinSuccess {
    pub id: String,
    pub team: String,
    pub name: String,
    #[serde(default)]
    pub total_players: u32,
}

/// One entry of a `players` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemotePlayer {
    #[serde(default)]
    pub position: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub team: String,
    /// Game fields this layer carries but does not interpret (health, score, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Player id -> state.
pub type PlayerMap = BTreeMap<String, RemotePlayer>;

// ─── Framing ───

/// Encodes a message into a complete frame.
///
/// Payloads longer than `compression_threshold` are zstd-compressed when
/// that makes them smaller.
pub fn encode_frame<T: Serialize>(
    msg: &T,
    compression_threshold: Option<usize>,
) -> Result<Bytes, TransportError> {
    let json = serde_json::to_vec(msg)?;
    let (flags, payload) = match compression_threshold {
        Some(limit) if json.len() > limit => {
            let packed = zstd::bulk::compress(&json, 3).map_err(TransportError::Compression)?;
            if packed.len() < json.len() {
                (FrameFlags::COMPRESSED, packed)
            } else {
                (FrameFlags::empty(), json)
            }
        }
        _ => (FrameFlags::empty(), json),
    };

    let body_len = payload.len() + 1;
    if body_len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body_len));
    }
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(flags.bits());
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a frame body (everything after the length prefix).
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransportError> {
    let Some((&flag_byte, payload)) = body.split_first() else {
        return Err(TransportError::EmptyFrame);
    };
    let flags = FrameFlags::from_bits_truncate(flag_byte);
    if flags.contains(FrameFlags::COMPRESSED) {
        let json =
            zstd::bulk::decompress(payload, MAX_FRAME_LEN).map_err(TransportError::Compression)?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Writes one frame.
pub async fn write_frame<W, T>(
    w: &mut W,
    msg: &T,
    compression_threshold: Option<usize>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg, compression_threshold)?;
    w.write_all(&frame).await?;
    Ok(())
}

/// Reads one frame body (flag byte + payload) without decoding it.
/// `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame_bytes<R>(r: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(TransportError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Reads and decodes one frame. `Ok(None)` on a clean EOF.
pub async fn read_frame<R, T>(r: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame_bytes(r).await? {
        Some(body) => decode_frame(&body).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_event_and_data() {
        let msg = ClientMsg::Join {
            name: "ann".into(),
            team: "red".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "join");
        assert_eq!(json["data"]["name"], "ann");
        assert_eq!(msg.event_name(), "join");
    }

    #[test]
    fn partial_pose_update_omits_unchanged_channel() {
        let msg = ClientMsg::UpdatePosition(PoseUpdate {
            position: Some(Vec3::new(1.0, 2.0, 3.0)),
            rotation: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "updatePosition");
        assert_eq!(json["data"]["position"], serde_json::json!([1.0, 2.0, 3.0]));
        assert!(json["data"].get("rotation").is_none());
    }

    #[test]
    fn queue_update_accepts_number_or_label() {
        let a: ServerMsg =
            serde_json::from_str(r#"{"event":"queueUpdate","data":{"position":3}}"#).unwrap();
        assert_eq!(
            a,
            ServerMsg::QueueUpdate(QueueUpdateMsg {
                position: 3,
                estimated_wait_time: None
            })
        );
        let b: ServerMsg = serde_json::from_str(
            r#"{"event":"queueUpdate","data":{"position":2,"estimatedWaitTime":"~5 minutes"}}"#,
        )
        .unwrap();
        let ServerMsg::QueueUpdate(q) = b else {
            panic!("expected queueUpdate");
        };
        assert_eq!(
            q.estimated_wait_time,
            Some(WaitEstimate::Label("~5 minutes".into()))
        );
    }

    #[test]
    fn legacy_server_status_inside_envelope() {
        let msg: ServerMsg = serde_json::from_str(
            r#"{"event":"serverStatus","data":{"current_players":5,"max_players":20,"queue_length":1,"has_space":true}}"#,
        )
        .unwrap();
        let ServerMsg::ServerStatus(snap) = msg else {
            panic!("expected serverStatus");
        };
        assert_eq!(snap.current_players, 5);
        assert_eq!(snap.queue_length, 1);
    }

    #[test]
    fn players_keep_unknown_fields() {
        let msg: ServerMsg = serde_json::from_str(
            r#"{"event":"players","data":{"p1":{"position":[1,2,3],"rotation":[0,0,0],"name":"a","team":"blue","health":80}}}"#,
        )
        .unwrap();
        let ServerMsg::Players(players) = msg else {
            panic!("expected players");
        };
        let p1 = &players["p1"];
        assert_eq!(p1.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(p1.extra["health"], 80);
    }

    #[test]
    fn relay_events_split_off() {
        let msg = ServerMsg::FlagScored(serde_json::json!({"team": "red"}));
        let (kind, payload) = msg.into_relay().unwrap();
        assert_eq!(kind, RelayKind::FlagScored);
        assert_eq!(payload["team"], "red");
        assert!(ServerMsg::Disconnect {
            reason: SERVER_CLOSE_REASON.into()
        }
        .into_relay()
        .is_err());
    }

    #[test]
    fn large_payloads_are_compressed() {
        let big = ClientMsg::Message {
            text: "a".repeat(8 * 1024),
            timestamp: 1,
        };
        let frame = encode_frame(&big, Some(1024)).unwrap();
        assert!(frame.len() < 1024);
        assert_eq!(frame[4], FrameFlags::COMPRESSED.bits());
        let back: ClientMsg = decode_frame(&frame[4..]).unwrap();
        assert_eq!(back, big);

        let plain = encode_frame(&big, None).unwrap();
        assert_eq!(plain[4], 0);
    }

    #[tokio::test]
    async fn frames_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = ServerMsg::Disconnect {
            reason: SERVER_CLOSE_REASON.into(),
        };
        write_frame(&mut a, &msg, Some(16)).await.unwrap();
        drop(a);
        let got: Option<ServerMsg> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(msg));
        let eof: Option<ServerMsg> = read_frame(&mut b).await.unwrap();
        assert_eq!(eof, None);
    }
}
