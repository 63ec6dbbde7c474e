//! relay-fabric/src/codec.rs
//! Framed message codec: length-prefixed command+payload framing used on every
//! relay stream, client<->proxy and proxy<->proxy alike.

use crate::error::{FabricError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire command codes, numbered with a stable, sequential encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    FetchClientData = 0,
    FetchOldData = 1,
    SendFreshData = 2,
    ClientType = 3,
    ClientPriority = 4,
    RecvfromNum = 5,
    ClientId = 6,
    ClusterIp = 7,
    TransferFinished = 8,
    ClientData = 9,
    ClientExit = 10,
    TransferData = 11,
    TransferEnd = 12,
    CreateConnBetweenServerAndNode = 13,
    ClientDataToLocal = 14,
    DisconnBetweenServerAndNode = 15,
}

impl TryFrom<u32> for Command {
    type Error = FabricError;

    fn try_from(v: u32) -> Result<Self> {
        use Command::*;
        Ok(match v {
            0 => FetchClientData,
            1 => FetchOldData,
            2 => SendFreshData,
            3 => ClientType,
            4 => ClientPriority,
            5 => RecvfromNum,
            6 => ClientId,
            7 => ClusterIp,
            8 => TransferFinished,
            9 => ClientData,
            10 => ClientExit,
            11 => TransferData,
            12 => TransferEnd,
            13 => CreateConnBetweenServerAndNode,
            14 => ClientDataToLocal,
            15 => DisconnBetweenServerAndNode,
            other => return Err(FabricError::protocol(format!("unknown command code {other}"))),
        })
    }
}

/// Role string carried by the `ClientType` frame.
pub const ROLE_SENDER: &str = "sender";
pub const ROLE_RECEIVER: &str = "receiver";

/// Writes one frame: `[totalLen: u32 LE][cmd: u32 LE][payload bytes]`.
pub async fn send<W>(conn: &mut W, cmd: Command, payload: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = payload.as_bytes();
    let total_len = 4 + payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + total_len as usize);
    buf.extend_from_slice(&total_len.to_le_bytes());
    buf.extend_from_slice(&(cmd as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    conn.write_all(&buf).await?;
    Ok(())
}

/// Reads one frame, looping on short reads until the declared length is satisfied.
/// EOF or a read error mid-frame is a fatal protocol error.
pub async fn recv<R>(conn: &mut R) -> Result<(Command, String)>
where
    R: AsyncRead + Unpin,
{
    let total_len = conn.read_u32_le().await? as usize;
    if total_len < 4 {
        return Err(FabricError::protocol(format!(
            "frame length {total_len} shorter than the cmd field"
        )));
    }
    let mut rest = vec![0u8; total_len];
    conn.read_exact(&mut rest).await?;
    let cmd = u32::from_le_bytes(rest[0..4].try_into().unwrap());
    let cmd = Command::try_from(cmd)?;
    let payload = String::from_utf8(rest[4..].to_vec())
        .map_err(|e| FabricError::protocol(format!("payload is not valid UTF-8: {e}")))?;
    Ok((cmd, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_cmd_and_payload() {
        let (mut a, mut b) = duplex(4096);
        send(&mut a, Command::ClientData, "hello world").await.unwrap();
        let (cmd, payload) = recv(&mut b).await.unwrap();
        assert_eq!(cmd, Command::ClientData);
        assert_eq!(payload, "hello world");
    }

    #[tokio::test]
    async fn round_trips_empty_payload() {
        let (mut a, mut b) = duplex(64);
        send(&mut a, Command::ClientExit, "").await.unwrap();
        let (cmd, payload) = recv(&mut b).await.unwrap();
        assert_eq!(cmd, Command::ClientExit);
        assert_eq!(payload, "");
    }

    #[tokio::test]
    async fn round_trips_a_sequence_of_frames() {
        let (mut a, mut b) = duplex(65536);
        let frames = [
            (Command::ClientId, "sx"),
            (Command::ClientType, ROLE_SENDER),
            (Command::ClientPriority, "5"),
            (Command::ClusterIp, "10.0.0.1"),
            (Command::ClusterIp, ""),
            (Command::ClientData, "a"),
            (Command::ClientData, "b"),
            (Command::ClientExit, ""),
        ];
        for (cmd, payload) in frames {
            send(&mut a, cmd, payload).await.unwrap();
        }
        for (cmd, payload) in frames {
            let (got_cmd, got_payload) = recv(&mut b).await.unwrap();
            assert_eq!(got_cmd, cmd);
            assert_eq!(got_payload, payload);
        }
    }

    #[tokio::test]
    async fn unknown_command_code_is_a_protocol_error() {
        let (mut a, mut b) = duplex(64);
        let payload = b"x";
        let total_len: u32 = 4 + payload.len() as u32;
        a.write_all(&total_len.to_le_bytes()).await.unwrap();
        a.write_all(&999u32.to_le_bytes()).await.unwrap();
        a.write_all(payload).await.unwrap();
        let err = recv(&mut b).await.unwrap_err();
        assert!(matches!(err, FabricError::Protocol(_)));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_io_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&100u32.to_le_bytes()).await.unwrap();
        drop(a);
        let err = recv(&mut b).await.unwrap_err();
        assert!(matches!(err, FabricError::Io(_)));
    }
}
