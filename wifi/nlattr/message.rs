// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::attr::{align, Attrs, EncodeError, ParseError};
use crate::reader::Reader;
use crate::writer::Writer;
use bitflags::bitflags;
use log::debug;

/// Size of `struct nlmsghdr`
pub const NLMSG_HEADER_LEN: usize = 16;

/// Size of `struct genlmsghdr`
pub const GENL_HEADER_LEN: usize = 4;

/// Control message kinds, generic families use kinds from `NLMSG_MIN_TYPE`.
pub mod kind {
    pub const NOOP: u16 = 1;
    pub const ERROR: u16 = 2;
    pub const DONE: u16 = 3;
    pub const OVERRUN: u16 = 4;
    pub const MIN_TYPE: u16 = 0x10;
}

bitflags! {
    /// `nlmsg_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const REQUEST = 0x01;
        const MULTI = 0x02;
        const ACK = 0x04;
        const ECHO = 0x08;
        const DUMP_INTR = 0x10;
        const ROOT = 0x100;
        const MATCH = 0x200;
        const DUMP = Self::ROOT.bits() | Self::MATCH.bits();
    }
}

/// Netlink message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u32,
    pub kind: u16,
    pub flags: Flags,
    pub seq: u32,
    pub port: u32,
}

impl Header {
    fn parse(r: &mut Reader) -> Option<Self> {
        Some(Self {
            len: r.read_u32()?,
            kind: r.read_u16()?,
            flags: Flags::from_bits_retain(r.read_u16()?),
            seq: r.read_u32()?,
            port: r.read_u32()?,
        })
    }

    fn write(&self, w: &mut Writer) {
        w.write_u32(self.len);
        w.write_u16(self.kind);
        w.write_u16(self.flags.bits());
        w.write_u32(self.seq);
        w.write_u32(self.port);
    }
}

/// Generic netlink message: header, command, attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMessage {
    /// Family id, carried in the message kind
    pub family: u16,
    pub flags: Flags,
    pub seq: u32,
    pub port: u32,
    pub cmd: u8,
    pub version: u8,
    pub attrs: Attrs,
}

impl GenericMessage {
    /// Message for `family`, sequence and port left for the sender to fill in
    pub fn new(family: u16, cmd: u8, attrs: Attrs) -> Self {
        Self { family, flags: Flags::REQUEST, seq: 0, port: 0, cmd, version: 0, attrs }
    }

    /// Encode into a single datagram
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new(Vec::with_capacity(NLMSG_HEADER_LEN + GENL_HEADER_LEN));
        Header { len: 0, kind: self.family, flags: self.flags, seq: self.seq, port: self.port }
            .write(&mut w);
        w.write_u8(self.cmd);
        w.write_u8(self.version);
        w.write_u16(0);
        self.attrs.write_checked(&mut w)?;
        let len = w.len() as u32;
        w.patch_u32(0, len);
        Ok(w.into_vec())
    }
}

/// One message of a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Family message: a reply, a command echo or an event
    Generic(GenericMessage),
    /// `NLMSG_ERROR`; `errno` 0 is an acknowledgement
    Ack { seq: u32, port: u32, errno: i32 },
    /// End of a multipart dump
    Done { seq: u32 },
    /// Noop, overrun and kinds this crate has no use for
    Other { kind: u16, seq: u32 },
}

impl Packet {
    /// Sequence number the message refers to
    pub fn seq(&self) -> u32 {
        match self {
            Packet::Generic(msg) => msg.seq,
            Packet::Ack { seq, .. } | Packet::Done { seq } | Packet::Other { seq, .. } => *seq,
        }
    }

    /// Parse every message of a datagram
    pub fn parse_all(data: &[u8]) -> Result<Vec<Packet>, ParseError> {
        let mut r = Reader::new(data);
        let mut packets = Vec::new();
        while r.remaining() >= NLMSG_HEADER_LEN {
            let offset = r.position();
            let Some(header) = Header::parse(&mut r) else {
                return Err(ParseError::MalformedMessage(offset));
            };
            let len = header.len as usize;
            if len < NLMSG_HEADER_LEN {
                return Err(ParseError::MalformedMessage(offset));
            }
            let Some(body) = r.get(len - NLMSG_HEADER_LEN) else {
                return Err(ParseError::MalformedMessage(offset));
            };
            r.skip(align(len) - len);
            packets.push(Self::parse_one(header, body, offset)?);
        }
        if r.remaining() > 0 {
            debug!("ignoring {} trailing bytes of datagram", r.remaining());
        }
        Ok(packets)
    }

    fn parse_one(header: Header, body: &[u8], offset: usize) -> Result<Packet, ParseError> {
        let mut r = Reader::new(body);
        match header.kind {
            kind::ERROR => {
                // The original request header follows the error code, unused here.
                let errno = r
                    .read_i32()
                    .and_then(i32::checked_neg)
                    .ok_or(ParseError::MalformedMessage(offset))?;
                Ok(Packet::Ack { seq: header.seq, port: header.port, errno })
            }
            kind::DONE => Ok(Packet::Done { seq: header.seq }),
            k if k < kind::MIN_TYPE => {
                debug!("control message {} at offset {}", k, offset);
                Ok(Packet::Other { kind: k, seq: header.seq })
            }
            family => {
                let (Some(cmd), Some(version), Some(_)) = (r.read_u8(), r.read_u8(), r.read_bytes::<2>())
                else {
                    return Err(ParseError::MalformedMessage(offset));
                };
                let attrs = Attrs::decode(r.get(r.remaining()).unwrap_or_default())?;
                Ok(Packet::Generic(GenericMessage {
                    family,
                    flags: header.flags,
                    seq: header.seq,
                    port: header.port,
                    cmd,
                    version,
                    attrs,
                }))
            }
        }
    }

    /// Encode into a datagram, the way the kernel would send it
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let (kind, seq, port, body) = match self {
            Packet::Generic(msg) => return msg.to_bytes(),
            Packet::Ack { seq, port, errno } => {
                let mut body = errno.wrapping_neg().to_ne_bytes().to_vec();
                body.resize(4 + NLMSG_HEADER_LEN, 0);
                (kind::ERROR, *seq, *port, body)
            }
            Packet::Done { seq } => (kind::DONE, *seq, 0, 0i32.to_ne_bytes().to_vec()),
            Packet::Other { kind, seq } => (*kind, *seq, 0, vec![]),
        };
        let mut w = Writer::new(Vec::with_capacity(NLMSG_HEADER_LEN + body.len()));
        let len = (NLMSG_HEADER_LEN + body.len()) as u32;
        Header { len, kind, flags: Flags::empty(), seq, port }.write(&mut w);
        w.put(&body);
        Ok(w.into_vec())
    }
}
