//! Wire messages exchanged between endpoints.
//!
//! Every datagram is one [`Message`]: a header carrying the sender's session magic
//! followed by one body variant. Hosts that bring their own transport serialize
//! these with [`codec`](crate::network::codec).

use serde::{Deserialize, Serialize};

use crate::Frame;

/// What one endpoint knows about a player's connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// The player is disconnected.
    pub disconnected: bool,
    /// Newest frame of this player's input the endpoint has.
    pub last_frame: Frame,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32,
}

/// A bundle of consecutive input frames starting at `start_frame`, delta encoded
/// against the last bundle the receiver acknowledged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectionStatus>,
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    pub ack_frame: Frame,
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("peer_connect_status", &self.peer_connect_status)
            .field("disconnect_requested", &self.disconnect_requested)
            .field("start_frame", &self.start_frame)
            .field("ack_frame", &self.ack_frame)
            .field("bytes", &HexBytes(&self.bytes))
            .finish()
    }
}

struct HexBytes<'a>(&'a [u8]);

impl std::fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// Sender's local frame advantage, clamped to `i16`.
    pub frame_advantage: i16,
    /// Sender's wall clock in milliseconds; echoed back as `pong`.
    pub ping: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct ChecksumReport {
    pub frame: Frame,
    pub checksum: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    pub magic: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    ChecksumReport(ChecksumReport),
    KeepAlive,
}

/// A datagram sent and received through a [`NonBlockingSocket`].
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

impl Message {
    /// Session magic of the sender.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.header.magic
    }

    /// Short name of the body variant, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::SyncRequest(_) => "sync_request",
            MessageBody::SyncReply(_) => "sync_reply",
            MessageBody::Input(_) => "input",
            MessageBody::InputAck(_) => "input_ack",
            MessageBody::QualityReport(_) => "quality_report",
            MessageBody::QualityReply(_) => "quality_reply",
            MessageBody::ChecksumReport(_) => "checksum_report",
            MessageBody::KeepAlive => "keep_alive",
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::codec;

    #[test]
    fn connection_status_starts_without_frames() {
        let status = ConnectionStatus::default();
        assert!(!status.disconnected);
        assert!(status.last_frame.is_null());
    }

    #[test]
    fn input_default_has_null_frames() {
        let input = Input::default();
        assert!(input.peer_connect_status.is_empty());
        assert!(!input.disconnect_requested);
        assert_eq!(input.start_frame, Frame::NULL);
        assert_eq!(input.ack_frame, Frame::NULL);
    }

    #[test]
    fn input_debug_prints_hex() {
        let input = Input {
            bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
            ..Input::default()
        };
        let debug = format!("{:?}", input);
        assert!(debug.contains("0xdeadbeef"));
        assert!(debug.contains("disconnect_requested"));
    }

    #[test]
    fn kind_names_every_body() {
        let msg = |body| Message {
            header: MessageHeader { magic: 7 },
            body,
        };
        assert_eq!(msg(MessageBody::KeepAlive).kind(), "keep_alive");
        assert_eq!(
            msg(MessageBody::ChecksumReport(ChecksumReport::default())).kind(),
            "checksum_report"
        );
        assert_eq!(msg(MessageBody::Input(Input::default())).kind(), "input");
        assert_eq!(msg(MessageBody::KeepAlive).magic(), 7);
    }

    #[test]
    fn input_message_survives_the_codec() {
        let msg = Message {
            header: MessageHeader { magic: 0xABCD },
            body: MessageBody::Input(Input {
                peer_connect_status: vec![
                    ConnectionStatus {
                        disconnected: false,
                        last_frame: Frame::new(10),
                    },
                    ConnectionStatus {
                        disconnected: true,
                        last_frame: Frame::new(20),
                    },
                ],
                disconnect_requested: false,
                start_frame: Frame::new(100),
                ack_frame: Frame::new(50),
                bytes: vec![1, 2, 3, 4, 5],
            }),
        };
        let bytes = codec::encode(&msg).unwrap();
        let decoded: Message = codec::decode_value(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
