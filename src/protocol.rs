// Burrow - Reverse TCP tunnel relay exposing NAT-hidden services over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use tokio_util::codec::{Decoder, Encoder};

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, rest};
use nom::sequence::preceded;
use nom::IResult;

use crate::error::BurrowError;

/// Cap on a single frame payload. The header field is a u32, but anything
/// near that is a corrupt stream, not a real frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 8;

/// One multiplexed unit on the tunnel.
///
/// An empty payload is not data; it signals that `peer_id` disconnected
/// and is the final frame for that id in its direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub peer_id: u32,

    /// Opaque application bytes. The codec never inspects them.
    pub payload: Bytes,
}

impl Frame {
    pub fn data(peer_id: u32, payload: Bytes) -> Self {
        Self { peer_id, payload }
    }

    pub fn disconnect(peer_id: u32) -> Self {
        Self {
            peer_id,
            payload: Bytes::new(),
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Header decoded ahead of a payload that has not fully arrived yet.
struct FrameHeader {
    peer_id: u32,
    length: u32,
}

/// Codec for the framed tunnel stream.
///
/// Each frame is an 8-byte big-endian header, `peer_id: u32` then
/// `length: u32`, followed by exactly `length` payload bytes. Partial
/// reads of either part rejoin across calls.
#[derive(Default)]
pub struct FrameCodec {
    partial: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = BurrowError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, BurrowError> {
        let header = match self.partial.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }

                let peer_id = src.get_u32();
                let length = src.get_u32();

                if length as usize > MAX_FRAME_LEN {
                    return Err(BurrowError::OversizedFrame(length as usize));
                }

                FrameHeader { peer_id, length }
            }
        };

        if src.len() < header.length as usize {
            src.reserve(header.length as usize - src.len());
            self.partial = Some(header);

            return Ok(None);
        }

        let payload = src.split_to(header.length as usize).freeze();

        Ok(Some(Frame {
            peer_id: header.peer_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = BurrowError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), BurrowError> {
        if frame.payload.len() > MAX_FRAME_LEN {
            return Err(BurrowError::OversizedFrame(frame.payload.len()));
        }

        dst.reserve(HEADER_LEN + frame.payload.len());

        dst.put_u32(frame.peer_id);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// One-shot answer on the control connection.
///
/// The wire form is ASCII: the bare decimal port on success, or
/// `ERROR:<reason>` on refusal. Trailing bytes after the digits
/// (a stray newline) are tolerated.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlReply<'a> {
    /// Public port assigned to the requesting host.
    Port(u16),

    /// Request refused; the reason is free-form.
    Error(&'a str),
}

impl<'a> ControlReply<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ControlReply<'a>> {
        alt((
            map(
                preceded(tag("ERROR:"), map_res(rest, std::str::from_utf8)),
                ControlReply::Error,
            ),
            map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
                s.parse::<u16>().map(ControlReply::Port)
            }),
        ))(input)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            ControlReply::Port(port) => buf.put_slice(port.to_string().as_bytes()),
            ControlReply::Error(reason) => {
                buf.put_slice(b"ERROR:");
                buf.put_slice(reason.as_bytes());
            }
        }

        buf.freeze()
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    #[rustfmt::skip]
    fn decode_valid_frame() {
        let payload: &[u8] = &[
            0x00, 0x00, 0x00, 0x01, // peer_id = 1
            0x00, 0x00, 0x00, 0x05, // length = 5
            0x48, 0x45, 0x4c, 0x4c, 0x4f, // HELLO
        ];

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(payload);

        let frame = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.peer_id, 1);
        assert_eq!(&frame.payload[..], b"HELLO");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejoins_partial_reads() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Half a header is not a frame.
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x02]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // A full header with the payload still in flight is not one either.
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x04, 0x70, 0x6f]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x6e, 0x67]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.peer_id, 2);
        assert_eq!(&frame.payload[..], b"pong");
    }

    #[test]
    #[rustfmt::skip]
    fn decode_disconnect_frame() {
        let payload: &[u8] = &[
            0x00, 0x00, 0x00, 0x07, // peer_id = 7
            0x00, 0x00, 0x00, 0x00, // length = 0
        ];

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(payload);

        let frame = codec.decode(&mut buf).unwrap().unwrap();

        assert!(frame.is_disconnect());
        assert_eq!(frame, Frame::disconnect(7));
    }

    #[test]
    #[rustfmt::skip]
    fn decode_oversized_length() {
        let payload: &[u8] = &[
            0x00, 0x00, 0x00, 0x01,
            0xff, 0xff, 0xff, 0xff, // far beyond MAX_FRAME_LEN
        ];

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(payload);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::data(42, Bytes::from_static(b"We live in a twilight world"));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn consecutive_frames_stay_separate() {
        let first = Frame::data(1, Bytes::from_static(b"one"));
        let second = Frame::disconnect(1);
        let third = Frame::data(2, Bytes::from_static(b"two"));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();
        codec.encode(third.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), third);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn parse_port_reply() {
        let (_, reply) = ControlReply::parse(b"9001").unwrap();

        assert_eq!(reply, ControlReply::Port(9001));
    }

    #[test]
    fn parse_port_reply_trailing_newline() {
        let (_, reply) = ControlReply::parse(b"9001\n").unwrap();

        assert_eq!(reply, ControlReply::Port(9001));
    }

    #[test]
    fn parse_error_reply() {
        let (_, reply) = ControlReply::parse(b"ERROR:NoPorts").unwrap();

        assert_eq!(reply, ControlReply::Error("NoPorts"));
    }

    #[test]
    fn parse_garbage_reply() {
        assert!(ControlReply::parse(b"no port here").is_err());
    }

    #[test]
    fn control_reply_round_trip() {
        let bytes = ControlReply::Port(9042).to_bytes();

        assert_eq!(&bytes[..], b"9042");

        let (_, reply) = ControlReply::parse(&bytes).unwrap();

        assert_eq!(reply, ControlReply::Port(9042));

        let bytes = ControlReply::Error("NoPorts").to_bytes();

        assert_eq!(&bytes[..], b"ERROR:NoPorts");
    }
}
