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

//! Netlink attribute codec
//!
//! Encoding and decoding of the type-length-value trees carried by generic
//! netlink messages, and of the message envelopes themselves:
//!
//!    ________________ ____________ ______ _______ ______ _______
//!   |    nlmsghdr    | genlmsghdr | len  | type  | value| pad   | ...
//!   |________________|____________|______|_______|______|_______|
//!        16 bytes       4 bytes    u16    u16
//!
//! Integers use host byte order. Attributes are aligned on 4 bytes; the
//! length field covers the header and the unpadded value.

mod attr;
mod message;
mod reader;
mod writer;

pub use attr::{
    decode, decode_strict, Attribute, Attrs, EncodeError, ParseError, Payload, ATTR_ALIGN,
    ATTR_HEADER_LEN,
};
pub use message::{kind, Flags, GenericMessage, Header, Packet, GENL_HEADER_LEN, NLMSG_HEADER_LEN};
