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

pub(crate) trait Write {
    fn write(&self, w: &mut Writer);
}

pub(crate) struct Writer {
    vec: Vec<u8>,
}

impl Writer {
    pub(crate) fn new(vec: Vec<u8>) -> Self {
        Self { vec }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.vec
    }

    pub(crate) fn len(&self) -> usize {
        self.vec.len()
    }

    pub(crate) fn put(&mut self, slice: &[u8]) {
        self.vec.extend_from_slice(slice);
    }

    pub(crate) fn write<T: Write>(&mut self, v: &T) {
        v.write(self)
    }

    pub(crate) fn write_u8(&mut self, v: u8) {
        self.vec.push(v);
    }

    pub(crate) fn write_u16(&mut self, v: u16) {
        self.put(&v.to_ne_bytes());
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.put(&v.to_ne_bytes());
    }

    pub(crate) fn write_i32(&mut self, v: i32) {
        self.put(&v.to_ne_bytes());
    }

    /// Zero-fill up to the next multiple of `align`.
    pub(crate) fn pad(&mut self, align: usize) {
        let len = self.vec.len();
        self.vec.resize(len.next_multiple_of(align), 0);
    }

    /// Back-patch a length field once the enclosed content is written.
    pub(crate) fn patch_u32(&mut self, pos: usize, v: u32) {
        self.vec[pos..pos + 4].copy_from_slice(&v.to_ne_bytes());
    }
}
