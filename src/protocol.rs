//! Just enough of the Minecraft wire format to read the opening handshake.

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::pipeline::{ConnectionContext, Flow, Message, Stage};

/// Largest frame accepted before the backend connection is established.
pub const MAX_HANDSHAKE_FRAME: usize = 4096;

/// Server addresses carrying relay metadata are far longer than the vanilla
/// 255 character limit.
pub const MAX_SERVER_ADDRESS_CHARS: usize = 2048;

/// Pipeline name of [`MinecraftDecoder`].
pub const DECODER_STAGE: &str = "minecraft-decoder";

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const LEGACY_PING_PREFIX: u8 = 0xFE;

const MAX_VARINT_BYTES: usize = 5;
const LEGACY_READ_SIZE: usize = 512;

/// One unit read from the client before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Body of a length-prefixed frame, without the length.
    Modern(Vec<u8>),
    /// Raw bytes of a pre-1.7 server list ping, starting with `0xFE`.
    Legacy(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    /// Decodes the fields following the packet id.
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        let protocol_version = read_varint(&mut body)?;
        let server_address = read_string(&mut body, MAX_SERVER_ADDRESS_CHARS)?;
        ensure!(body.len() >= 2, "Handshake truncated before server port");
        let server_port = u16::from_be_bytes([body[0], body[1]]);
        body = &body[2..];
        let next_state = read_varint(&mut body)?;
        ensure!(body.is_empty(), "{} trailing bytes after handshake", body.len());

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    /// Writes the packet id and fields, without the frame length.
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        write_varint(out, HANDSHAKE_PACKET_ID);
        write_varint(out, self.protocol_version);
        write_string(out, &self.server_address);
        out.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(out, self.next_state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    LegacyPing(Vec<u8>),
    Unknown { id: i32, body: Vec<u8> },
}

impl Packet {
    /// Serializes the packet as it appears on the wire, length prefix included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::Handshake(handshake) => handshake.encode_body(&mut body),
            Self::LegacyPing(raw) => return raw.clone(),
            Self::Unknown { id, body: payload } => {
                write_varint(&mut body, *id);
                body.extend_from_slice(payload);
            }
        }
        frame(&body)
    }
}

impl Frame {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Modern(body) => frame(body),
            Self::Legacy(raw) => raw.clone(),
        }
    }
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + MAX_VARINT_BYTES);
    write_varint(&mut out, body.len() as i32);
    out.extend_from_slice(body);
    out
}

/// Reads one frame from `reader`. Returns `None` on a clean EOF before the
/// first byte.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }

    if first[0] == LEGACY_PING_PREFIX {
        let mut raw = vec![0u8; LEGACY_READ_SIZE];
        raw[0] = LEGACY_PING_PREFIX;
        let n = reader.read(&mut raw[1..]).await?;
        raw.truncate(n + 1);
        return Ok(Some(Frame::Legacy(raw)));
    }

    let mut length: u32 = u32::from(first[0] & 0x7F);
    let mut byte = first[0];
    let mut shift = 7;
    while byte & 0x80 != 0 {
        ensure!(shift < 7 * MAX_VARINT_BYTES as u32, "Frame length VarInt too long");
        byte = reader
            .read_u8()
            .await
            .context("Connection closed inside frame length")?;
        length |= u32::from(byte & 0x7F) << shift;
        shift += 7;
    }

    let length = length as usize;
    ensure!(
        length <= MAX_HANDSHAKE_FRAME,
        "Frame of {length} bytes exceeds the {MAX_HANDSHAKE_FRAME} byte limit"
    );
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .context("Connection closed inside frame body")?;
    Ok(Some(Frame::Modern(body)))
}

pub fn read_varint(buf: &mut &[u8]) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let (&byte, rest) = buf
            .split_first()
            .ok_or_else(|| anyhow!("Buffer ended inside VarInt"))?;
        *buf = rest;
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    bail!("VarInt longer than {MAX_VARINT_BYTES} bytes")
}

pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            out.push(value as u8);
            return;
        }
        out.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn read_string(buf: &mut &[u8], max_chars: usize) -> Result<String> {
    let len = read_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| anyhow!("Negative string length {len}"))?;
    // A UTF-8 character is at most 4 bytes, as in the vanilla codec.
    ensure!(
        len <= max_chars * 4,
        "String of {len} bytes exceeds the {max_chars} character limit"
    );
    ensure!(buf.len() >= len, "Buffer ended inside string");
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    let text = std::str::from_utf8(bytes).context("String is not valid UTF-8")?;
    ensure!(
        text.chars().count() <= max_chars,
        "String exceeds the {max_chars} character limit"
    );
    Ok(text.to_string())
}

pub fn write_string(out: &mut Vec<u8>, value: &str) {
    write_varint(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

/// Pipeline stage turning frames into packets. Only the first modern frame
/// of a connection is a handshake; later frames keep their raw body.
#[derive(Debug, Default)]
pub struct MinecraftDecoder {
    handshake_seen: bool,
}

impl Stage for MinecraftDecoder {
    fn read(&mut self, _ctx: &mut ConnectionContext, message: Message) -> Result<Flow> {
        let Message::Frame(frame) = message else {
            return Ok(Flow::Forward(message));
        };

        let packet = match frame {
            Frame::Legacy(raw) => Packet::LegacyPing(raw),
            Frame::Modern(body) => {
                let mut cursor = body.as_slice();
                let id = read_varint(&mut cursor)?;
                if id == HANDSHAKE_PACKET_ID && !self.handshake_seen {
                    self.handshake_seen = true;
                    Packet::Handshake(Handshake::decode(cursor)?)
                } else {
                    Packet::Unknown {
                        id,
                        body: cursor.to_vec(),
                    }
                }
            }
        };
        Ok(Flow::Forward(Message::Packet(packet)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn handshake() -> Handshake {
        Handshake {
            protocol_version: 765,
            server_address: "play.example.com\0FML3\0".to_string(),
            server_port: 25565,
            next_state: 2,
        }
    }

    mod codec {
        use super::*;

        #[test]
        fn varint_known_encodings() {
            let cases: [(i32, &[u8]); 5] = [
                (0, &[0x00]),
                (127, &[0x7F]),
                (300, &[0xAC, 0x02]),
                (765, &[0xFD, 0x05]),
                (-1, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
            ];
            for (value, bytes) in cases {
                let mut out = Vec::new();
                write_varint(&mut out, value);
                assert_eq!(out, bytes);

                let mut cursor = bytes;
                assert_eq!(read_varint(&mut cursor).unwrap(), value);
                assert!(cursor.is_empty());
            }
        }

        #[test]
        fn varint_too_long() {
            let mut cursor: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
            assert!(read_varint(&mut cursor).is_err());
        }

        #[test]
        fn handshake_survives_encoding() {
            let packet = Packet::Handshake(handshake());
            let wire = packet.encode();

            let mut cursor = wire.as_slice();
            let length = read_varint(&mut cursor).unwrap() as usize;
            assert_eq!(length, cursor.len());
            assert_eq!(read_varint(&mut cursor).unwrap(), HANDSHAKE_PACKET_ID);
            assert_eq!(Handshake::decode(cursor).unwrap(), handshake());
        }

        #[test]
        fn handshake_with_trailing_bytes() {
            let mut body = Vec::new();
            handshake().encode_body(&mut body);
            body.push(0);
            assert!(Handshake::decode(&body[1..]).is_err());
        }

        #[test]
        fn oversized_server_address() {
            let mut body = Vec::new();
            write_varint(&mut body, 765);
            write_string(&mut body, &"a".repeat(MAX_SERVER_ADDRESS_CHARS + 1));
            body.extend_from_slice(&25565u16.to_be_bytes());
            write_varint(&mut body, 1);
            assert!(Handshake::decode(&body).is_err());
        }
    }

    mod frames {
        use super::*;

        #[tokio::test]
        async fn reads_length_prefixed_frame() {
            let wire = Packet::Handshake(handshake()).encode();
            let mut reader = Builder::new().read(&wire[..1]).read(&wire[1..]).build();

            let Some(Frame::Modern(body)) = read_frame(&mut reader).await.unwrap() else {
                panic!("expected a modern frame");
            };
            assert_eq!(body, wire[1..]);
        }

        #[tokio::test]
        async fn reads_legacy_ping() {
            let mut reader = Builder::new().read(&[0xFE]).read(&[0x01, 0xFA]).build();
            assert_eq!(
                read_frame(&mut reader).await.unwrap(),
                Some(Frame::Legacy(vec![0xFE, 0x01, 0xFA]))
            );
        }

        #[tokio::test]
        async fn clean_eof() {
            let mut reader = Builder::new().build();
            assert_eq!(read_frame(&mut reader).await.unwrap(), None);
        }

        #[tokio::test]
        async fn truncated_body() {
            let mut reader = Builder::new().read(&[0x05, 0x00, 0x01]).build();
            assert!(read_frame(&mut reader).await.is_err());
        }

        #[tokio::test]
        async fn frame_over_limit() {
            let mut length = Vec::new();
            write_varint(&mut length, MAX_HANDSHAKE_FRAME as i32 + 1);
            let mut reader = Builder::new().read(&length).build();
            assert!(read_frame(&mut reader).await.is_err());
        }
    }

    mod decoder {
        use super::*;

        fn ctx() -> ConnectionContext {
            ConnectionContext::new("192.0.2.1:40000".parse().unwrap())
        }

        fn decode(decoder: &mut MinecraftDecoder, frame: Frame) -> Packet {
            match decoder.read(&mut ctx(), Message::Frame(frame)).unwrap() {
                Flow::Forward(Message::Packet(packet)) => packet,
                _ => panic!("decoder did not produce a packet"),
            }
        }

        #[test]
        fn only_first_frame_is_a_handshake() {
            let mut decoder = MinecraftDecoder::default();
            let mut body = Vec::new();
            handshake().encode_body(&mut body);

            assert_eq!(
                decode(&mut decoder, Frame::Modern(body.clone())),
                Packet::Handshake(handshake())
            );
            assert!(matches!(
                decode(&mut decoder, Frame::Modern(body)),
                Packet::Unknown { id: 0, .. }
            ));
        }

        #[test]
        fn legacy_ping() {
            let mut decoder = MinecraftDecoder::default();
            assert_eq!(
                decode(&mut decoder, Frame::Legacy(vec![0xFE, 0x01])),
                Packet::LegacyPing(vec![0xFE, 0x01])
            );
        }

        #[test]
        fn garbage_is_an_error() {
            let mut decoder = MinecraftDecoder::default();
            let result = decoder.read(&mut ctx(), Message::Frame(Frame::Modern(vec![0x00, 0xFF])));
            assert!(result.is_err());
        }
    }
}
