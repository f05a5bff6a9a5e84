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

/// Cursor over a received buffer. Netlink words use host byte order.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn get(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let old_pos = self.pos;
        self.pos += n;
        Some(&self.data[old_pos..self.pos])
    }

    /// Advance up to `n` bytes, stopping at the end of the buffer.
    pub(crate) fn skip(&mut self, n: usize) {
        self.pos += n.min(self.remaining());
    }

    pub(crate) fn read_u8(&mut self) -> Option<u8> {
        Some(self.get(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Option<u16> {
        Some(u16::from_ne_bytes(self.read_bytes()?))
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_ne_bytes(self.read_bytes()?))
    }

    pub(crate) fn read_i32(&mut self) -> Option<i32> {
        Some(i32::from_ne_bytes(self.read_bytes()?))
    }

    pub(crate) fn read_bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        <[u8; N]>::try_from(self.get(N)?).ok()
    }
}
