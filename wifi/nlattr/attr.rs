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

use crate::reader::Reader;
use crate::writer::{Write, Writer};
use thiserror::Error;

/// Size of an attribute header: 16-bit length, then 16-bit type
pub const ATTR_HEADER_LEN: usize = 4;

/// Attributes start on 4-byte boundaries
pub const ATTR_ALIGN: usize = 4;

const F_NESTED: u16 = 1 << 15;
const F_NET_BYTEORDER: u16 = 1 << 14;
const TYPE_MASK: u16 = !(F_NESTED | F_NET_BYTEORDER);

pub(crate) const fn align(len: usize) -> usize {
    (len + ATTR_ALIGN - 1) & !(ATTR_ALIGN - 1)
}

/// Failure decoding received attributes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A required attribute is absent
    #[error("attribute {0} is missing")]
    MissingAttribute(u16),
    /// A child of the container overruns its boundary, or has an invalid header
    #[error("container {tag} is malformed at offset {offset}")]
    MalformedContainer { tag: u16, offset: usize },
    /// Not enough bytes for the declared width. `tag` is 0 when the header itself is cut.
    #[error("attribute {tag} needs {expected} bytes, {actual} available")]
    TruncatedAttribute { tag: u16, expected: usize, actual: usize },
    /// A scalar was read from a container
    #[error("attribute {0} is a container")]
    UnexpectedContainer(u16),
    /// String payload is not UTF-8
    #[error("attribute {0} is not a valid string")]
    InvalidString(u16),
    /// A list holds fewer entries than its advertised count
    #[error("list {tag} advertises {expected} entries, holds {actual}")]
    CountMismatch { tag: u16, expected: usize, actual: usize },
    /// Netlink message header is inconsistent with the datagram
    #[error("message is malformed at offset {0}")]
    MalformedMessage(usize),
}

/// Failure encoding an attribute tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The attribute does not fit the 16-bit length field
    #[error("attribute {tag} is {len} bytes long")]
    Oversized { tag: u16, len: usize },
}

/// Value carried by an attribute.
///
/// Scalars and strings are stored as their wire bytes, typing happens on access,
/// so that a decoded tree compares equal to the tree it was encoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Scalar, string or opaque bytes
    Bytes(Vec<u8>),
    /// Ordered children, flagged as nested on the wire
    Nested(Vec<Attribute>),
}

/// Typed, length-delimited node of an attribute tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    tag: u16,
    payload: Payload,
}

macro_rules! scalar {
    ($( $t:ty, $n:literal, $ctor:ident, $get:ident );* $(;)?) => {
        $(
            #[doc = concat!("Attribute holding a `", stringify!($t), "`")]
            pub fn $ctor(tag: u16, v: $t) -> Self {
                Self::bytes(tag, &v.to_ne_bytes())
            }

            #[doc = concat!("Read the payload as a `", stringify!($t), "`")]
            pub fn $get(&self) -> Result<$t, ParseError> {
                let data = self.as_bytes()?;
                let bytes = Reader::new(data).read_bytes::<$n>().ok_or(
                    ParseError::TruncatedAttribute { tag: self.tag, expected: $n, actual: data.len() },
                )?;
                Ok(<$t>::from_ne_bytes(bytes))
            }
        )*
    };
}

impl Attribute {
    /// New attribute, type flags are stripped from `tag`
    pub fn new(tag: u16, payload: Payload) -> Self {
        Self { tag: tag & TYPE_MASK, payload }
    }

    /// Attribute holding opaque bytes
    pub fn bytes(tag: u16, data: &[u8]) -> Self {
        Self::new(tag, Payload::Bytes(data.to_vec()))
    }

    /// Attribute holding a NUL-terminated string
    pub fn string(tag: u16, s: &str) -> Self {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        Self::new(tag, Payload::Bytes(data))
    }

    /// Attribute without payload, its presence carries the information
    pub fn flag(tag: u16) -> Self {
        Self::new(tag, Payload::Bytes(vec![]))
    }

    /// Container of `children`
    pub fn nested(tag: u16, children: impl IntoIterator<Item = Attribute>) -> Self {
        Self::new(tag, Payload::Nested(children.into_iter().collect()))
    }

    /// Container of entries indexed from 0, the usual encoding of vendor arrays.
    /// An array long enough for indices to wrap exceeds the container length
    /// limit, so encoding fails with [`EncodeError::Oversized`].
    pub fn array(tag: u16, entries: impl IntoIterator<Item = Vec<Attribute>>) -> Self {
        Self::nested(
            tag,
            entries.into_iter().enumerate().map(|(i, entry)| Attribute::nested(i as u16, entry)),
        )
    }

    scalar! {
        u8, 1, u8, as_u8;
        u16, 2, u16, as_u16;
        u32, 4, u32, as_u32;
        u64, 8, u64, as_u64;
        i8, 1, i8, as_i8;
        i16, 2, i16, as_i16;
        i32, 4, i32, as_i32;
        i64, 8, i64, as_i64;
    }

    /// Type tag
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Carried value
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether the attribute was built or received as a container
    pub fn is_nested(&self) -> bool {
        matches!(self.payload, Payload::Nested(_))
    }

    /// Raw payload of a non-container attribute
    pub fn as_bytes(&self) -> Result<&[u8], ParseError> {
        match self.payload {
            Payload::Bytes(ref data) => Ok(data),
            Payload::Nested(_) => Err(ParseError::UnexpectedContainer(self.tag)),
        }
    }

    /// Payload as a string, up to the first NUL
    pub fn as_str(&self) -> Result<&str, ParseError> {
        let data = self.as_bytes()?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..end]).map_err(|_| ParseError::InvalidString(self.tag))
    }

    /// Fixed-size byte array, such as a MAC address
    pub fn as_array<const N: usize>(&self) -> Result<[u8; N], ParseError> {
        let data = self.as_bytes()?;
        Reader::new(data).read_bytes::<N>().ok_or(ParseError::TruncatedAttribute {
            tag: self.tag,
            expected: N,
            actual: data.len(),
        })
    }

    /// Children of a container.
    ///
    /// Senders do not always flag nested attributes, an unflagged payload is
    /// parsed on demand.
    pub fn children(&self) -> Result<Attrs, ParseError> {
        match self.payload {
            Payload::Nested(ref children) => Ok(Attrs(children.clone())),
            Payload::Bytes(ref data) => Ok(Attrs(parse_children(data, self.tag, Mode::Lenient)?)),
        }
    }

    /// Value of the length field: header and unpadded payload
    pub fn wire_len(&self) -> usize {
        ATTR_HEADER_LEN
            + match self.payload {
                Payload::Bytes(ref data) => data.len(),
                Payload::Nested(ref children) => {
                    children.iter().map(|c| align(c.wire_len())).sum()
                }
            }
    }

    /// Encode as a root container. No padding follows the root, so that any
    /// strict prefix of the output fails to decode.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.check()?;
        let mut w = Writer::new(Vec::with_capacity(self.wire_len()));
        w.write(self);
        let mut vec = w.into_vec();
        vec.truncate(self.wire_len());
        Ok(vec)
    }

    fn check(&self) -> Result<(), EncodeError> {
        let len = self.wire_len();
        if len > u16::MAX as usize {
            return Err(EncodeError::Oversized { tag: self.tag, len });
        }
        if let Payload::Nested(ref children) = self.payload {
            children.iter().try_for_each(Attribute::check)?;
        }
        Ok(())
    }

    fn from_wire(kind: u16, data: &[u8], mode: Mode) -> Result<Self, ParseError> {
        let tag = kind & TYPE_MASK;
        let payload = if kind & F_NESTED != 0 {
            Payload::Nested(parse_children(data, tag, mode)?)
        } else {
            Payload::Bytes(data.to_vec())
        };
        Ok(Self { tag, payload })
    }
}

impl Write for Attribute {
    fn write(&self, w: &mut Writer) {
        let kind = match self.payload {
            Payload::Bytes(_) => self.tag,
            Payload::Nested(_) => self.tag | F_NESTED,
        };
        w.write_u16(self.wire_len() as u16);
        w.write_u16(kind);
        match self.payload {
            Payload::Bytes(ref data) => w.put(data),
            Payload::Nested(ref children) => children.iter().for_each(|c| w.write(c)),
        }
        w.pad(ATTR_ALIGN);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Lenient,
    Strict,
}

fn parse_children(data: &[u8], parent: u16, mode: Mode) -> Result<Vec<Attribute>, ParseError> {
    let mut r = Reader::new(data);
    let mut children = Vec::new();
    while r.remaining() > 0 {
        let offset = r.position();
        let malformed = ParseError::MalformedContainer { tag: parent, offset };
        if r.remaining() < ATTR_HEADER_LEN {
            // Trailing bytes shorter than a header, ignored the way `nla_ok()` does.
            if mode == Mode::Strict {
                return Err(malformed);
            }
            break;
        }
        let (Some(len), Some(kind)) = (r.read_u16(), r.read_u16()) else {
            return Err(malformed);
        };
        let len = len as usize;
        if len < ATTR_HEADER_LEN {
            return Err(malformed);
        }
        let Some(payload) = r.get(len - ATTR_HEADER_LEN) else {
            return Err(malformed);
        };
        r.skip(align(len) - len);
        children.push(Attribute::from_wire(kind, payload, mode)?);
    }
    Ok(children)
}

fn decode_root(data: &[u8], mode: Mode) -> Result<Attribute, ParseError> {
    let mut r = Reader::new(data);
    let (Some(len), Some(kind)) = (r.read_u16(), r.read_u16()) else {
        return Err(ParseError::TruncatedAttribute {
            tag: 0,
            expected: ATTR_HEADER_LEN,
            actual: data.len(),
        });
    };
    let (tag, len) = (kind & TYPE_MASK, len as usize);
    if len < ATTR_HEADER_LEN {
        return Err(ParseError::MalformedContainer { tag, offset: 0 });
    }
    let payload = r.get(len - ATTR_HEADER_LEN).ok_or(ParseError::TruncatedAttribute {
        tag,
        expected: len,
        actual: data.len(),
    })?;
    if mode == Mode::Strict {
        let trailing = &data[len..];
        if trailing.len() >= ATTR_ALIGN || trailing.iter().any(|&b| b != 0) {
            return Err(ParseError::MalformedContainer { tag, offset: len });
        }
    }
    Attribute::from_wire(kind, payload, mode)
}

/// Decode a root attribute. Bytes following it, and sub-header trailing bytes
/// inside containers, are ignored.
pub fn decode(data: &[u8]) -> Result<Attribute, ParseError> {
    decode_root(data, Mode::Lenient)
}

/// Decode a root attribute, rejecting anything but alignment padding after
/// the last child of every container and after the root.
pub fn decode_strict(data: &[u8]) -> Result<Attribute, ParseError> {
    decode_root(data, Mode::Strict)
}

/// Ordered attributes of a container, with typed lookup by tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(Vec<Attribute>);

macro_rules! required {
    ($( $name:ident -> $t:ty = $get:ident );* $(;)?) => {
        $(
            #[doc = concat!("Required attribute `tag`, read with [`Attribute::", stringify!($get), "`]")]
            pub fn $name(&self, tag: u16) -> Result<$t, ParseError> {
                self.require(tag)?.$get()
            }
        )*
    };
}

impl Attrs {
    /// Empty set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Decode a sequence of attributes, as found after a message header
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self(parse_children(data, 0, Mode::Lenient)?))
    }

    /// Decode a sequence of attributes, rejecting trailing bytes
    pub fn decode_strict(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self(parse_children(data, 0, Mode::Strict)?))
    }

    /// Encode the sequence, each attribute padded to alignment
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new(Vec::with_capacity(self.wire_len()));
        self.write_checked(&mut w)?;
        Ok(w.into_vec())
    }

    pub(crate) fn write_checked(&self, w: &mut Writer) -> Result<(), EncodeError> {
        for attr in self.0.iter() {
            attr.check()?;
            w.write(attr);
        }
        Ok(())
    }

    pub(crate) fn wire_len(&self) -> usize {
        self.0.iter().map(|a| align(a.wire_len())).sum()
    }

    /// Append an attribute
    pub fn push(&mut self, attr: Attribute) {
        self.0.push(attr);
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attributes in order
    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.0.iter()
    }

    /// Attribute `tag`; the last occurrence wins, as with `nla_parse()`
    pub fn get(&self, tag: u16) -> Option<&Attribute> {
        self.0.iter().rev().find(|a| a.tag == tag)
    }

    /// Attribute `tag`, or [`ParseError::MissingAttribute`]
    pub fn require(&self, tag: u16) -> Result<&Attribute, ParseError> {
        self.get(tag).ok_or(ParseError::MissingAttribute(tag))
    }

    /// Whether `tag` is present
    pub fn contains(&self, tag: u16) -> bool {
        self.get(tag).is_some()
    }

    /// Optional attribute `tag`, read with `f` when present
    pub fn optional<'a, T>(
        &'a self,
        tag: u16,
        f: impl FnOnce(&'a Attribute) -> Result<T, ParseError>,
    ) -> Result<Option<T>, ParseError> {
        self.get(tag).map(f).transpose()
    }

    required! {
        u8 -> u8 = as_u8;
        u16 -> u16 = as_u16;
        u32 -> u32 = as_u32;
        u64 -> u64 = as_u64;
        i8 -> i8 = as_i8;
        i32 -> i32 = as_i32;
        i64 -> i64 = as_i64;
        str -> &str = as_str;
        bytes -> &[u8] = as_bytes;
        nested -> Attrs = children;
    }

    /// Wrap the set into a container attribute
    pub fn into_container(self, tag: u16) -> Attribute {
        Attribute::new(tag, Payload::Nested(self.0))
    }
}

impl FromIterator<Attribute> for Attrs {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Attrs {
    type Item = Attribute;
    type IntoIter = std::vec::IntoIter<Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Attrs {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Extend<Attribute> for Attrs {
    fn extend<I: IntoIterator<Item = Attribute>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}
