// Copyright 2024 Kevin Ludwig
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

//! On-disk cluster layout: marker encoding and the two cluster header shapes.
//!
//! A cluster is either a `FileCluster` (`block_id == 0`, carrying the file's
//! name and creation time ahead of its payload) or a `DataCluster`
//! (`block_id >= 1`, payload only). Both share a `CommonHeader` prefix so the
//! marker, `obj_id`, `block_id` and `data_length` can always be read without
//! knowing which kind a cluster is.

use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum stored filename length, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CommonHeader {
    pub marker: u8,
    pub obj_id: U16,
    pub block_id: U16,
    pub data_length: U16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileClusterHeader {
    pub common: CommonHeader,
    pub filename_length: U16,
    pub filename: [u8; MAX_FILENAME_LENGTH],
    pub creation_time: U64,
}

pub const COMMON_HEADER_SIZE: usize = core::mem::size_of::<CommonHeader>();
pub const FILE_CLUSTER_HEADER_SIZE: usize = core::mem::size_of::<FileClusterHeader>();
pub const DATA_CLUSTER_HEADER_SIZE: usize = COMMON_HEADER_SIZE;

/// Markers clear bits monotonically as a cluster moves through its lifecycle:
/// `Erased -> Formatted -> Pending -> Allocated -> Orphaned`. Only the first
/// cluster of a sector ever carries `ErasedSector`/`FormattedSector`; every
/// other cluster starts directly at `ErasedSector` and moves straight to
/// `PendingCluster` on first write.
pub mod marker {
    pub const ERASED_SECTOR: u8 = 0xFF;
    pub const FORMATTED_SECTOR: u8 = 0xFE;
    pub const PENDING_CLUSTER: u8 = 0xFC;
    pub const ALLOCATED_CLUSTER: u8 = 0xF8;
    pub const ORPHANED_CLUSTER: u8 = 0xF0;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    ErasedSector,
    FormattedSector,
    PendingCluster,
    AllocatedCluster,
    OrphanedCluster,
}

impl Marker {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            marker::ERASED_SECTOR => Some(Marker::ErasedSector),
            marker::FORMATTED_SECTOR => Some(Marker::FormattedSector),
            marker::PENDING_CLUSTER => Some(Marker::PendingCluster),
            marker::ALLOCATED_CLUSTER => Some(Marker::AllocatedCluster),
            marker::ORPHANED_CLUSTER => Some(Marker::OrphanedCluster),
            _ => None,
        }
    }

    /// Free for mount-scan purposes: not yet claimed by any cluster lifecycle
    /// step. `ErasedSector` and `FormattedSector` are the only such states.
    pub fn is_free(self) -> bool {
        matches!(self, Marker::ErasedSector | Marker::FormattedSector)
    }
}

/// A `cluster_size`-byte scratch buffer, reused across operations so the
/// file system core never allocates a cluster's worth of memory per call.
pub struct ClusterBuffer {
    buf: Vec<u8>,
    max_write: usize,
}

impl ClusterBuffer {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            buf: vec![marker::ERASED_SECTOR; cluster_size],
            max_write: 0,
        }
    }

    /// Restore the erased state without reallocating.
    pub fn reset(&mut self) {
        self.buf.fill(marker::ERASED_SECTOR);
        self.max_write = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn max_write(&self) -> usize {
        self.max_write
    }

    pub fn set_max_write(&mut self, max_write: usize) {
        self.max_write = max_write;
    }

    fn common_header(&self) -> &CommonHeader {
        CommonHeader::ref_from_bytes(&self.buf[..COMMON_HEADER_SIZE])
            .expect("cluster buffer shorter than a common header")
    }

    fn common_header_mut(&mut self) -> &mut CommonHeader {
        CommonHeader::mut_from_bytes(&mut self.buf[..COMMON_HEADER_SIZE])
            .expect("cluster buffer shorter than a common header")
    }

    fn file_header(&self) -> &FileClusterHeader {
        FileClusterHeader::ref_from_bytes(&self.buf[..FILE_CLUSTER_HEADER_SIZE])
            .expect("cluster buffer shorter than a file cluster header")
    }

    fn file_header_mut(&mut self) -> &mut FileClusterHeader {
        FileClusterHeader::mut_from_bytes(&mut self.buf[..FILE_CLUSTER_HEADER_SIZE])
            .expect("cluster buffer shorter than a file cluster header")
    }

    pub fn marker(&self) -> u8 {
        self.buf[0]
    }

    pub fn set_marker(&mut self, marker: u8) {
        self.buf[0] = marker;
    }

    pub fn obj_id(&self) -> u16 {
        self.common_header().obj_id.get()
    }

    pub fn set_obj_id(&mut self, obj_id: u16) {
        self.common_header_mut().obj_id.set(obj_id);
    }

    pub fn block_id(&self) -> u16 {
        self.common_header().block_id.get()
    }

    pub fn set_block_id(&mut self, block_id: u16) {
        self.common_header_mut().block_id.set(block_id);
    }

    pub fn data_length(&self) -> u16 {
        self.common_header().data_length.get()
    }

    pub fn set_data_length(&mut self, data_length: u16) {
        self.common_header_mut().data_length.set(data_length);
    }

    pub fn filename_length(&self) -> u16 {
        self.file_header().filename_length.get()
    }

    pub fn filename_bytes(&self) -> &[u8] {
        let len = self.filename_length() as usize;
        &self.file_header().filename[..len]
    }

    pub fn set_filename(&mut self, name: &[u8]) {
        assert!(name.len() <= MAX_FILENAME_LENGTH);
        let header = self.file_header_mut();
        header.filename_length.set(name.len() as u16);
        header.filename[..name.len()].copy_from_slice(name);
        header.filename[name.len()..].fill(0);
    }

    pub fn creation_time(&self) -> u64 {
        self.file_header().creation_time.get()
    }

    pub fn set_creation_time(&mut self, creation_time: u64) {
        self.file_header_mut().creation_time.set(creation_time);
    }

    /// Header size for the given block id: a `FileCluster` (`block_id == 0`)
    /// or a `DataCluster` (`block_id >= 1`).
    pub fn header_size(block_id: u16) -> usize {
        if block_id == 0 {
            FILE_CLUSTER_HEADER_SIZE
        } else {
            DATA_CLUSTER_HEADER_SIZE
        }
    }

    pub fn payload_offset(block_id: u16) -> usize {
        Self::header_size(block_id)
    }

    pub fn payload_capacity(&self, block_id: u16) -> usize {
        self.buf.len() - Self::payload_offset(block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_roundtrip() {
        let mut buf = ClusterBuffer::new(512);
        buf.set_marker(marker::PENDING_CLUSTER);
        buf.set_obj_id(7);
        buf.set_block_id(3);
        buf.set_data_length(128);
        assert_eq!(buf.marker(), marker::PENDING_CLUSTER);
        assert_eq!(buf.obj_id(), 7);
        assert_eq!(buf.block_id(), 3);
        assert_eq!(buf.data_length(), 128);
    }

    #[test]
    fn file_header_roundtrip() {
        let mut buf = ClusterBuffer::new(512);
        buf.set_filename(b"hello.txt");
        buf.set_creation_time(1234);
        assert_eq!(buf.filename_bytes(), b"hello.txt");
        assert_eq!(buf.creation_time(), 1234);
    }

    #[test]
    fn marker_lifecycle_only_clears_bits() {
        let sequence = [
            marker::ERASED_SECTOR,
            marker::FORMATTED_SECTOR,
            marker::PENDING_CLUSTER,
            marker::ALLOCATED_CLUSTER,
            marker::ORPHANED_CLUSTER,
        ];
        for pair in sequence.windows(2) {
            assert_eq!(pair[0] & pair[1], pair[1], "{:#x} -> {:#x} sets a bit", pair[0], pair[1]);
        }
    }

    #[test]
    fn header_sizes_match_layout() {
        assert_eq!(COMMON_HEADER_SIZE, 7);
        assert_eq!(FILE_CLUSTER_HEADER_SIZE, 7 + 2 + MAX_FILENAME_LENGTH + 8);
    }
}
