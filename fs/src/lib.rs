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

//! A log-structured, wear-aware file system for NOR-flash-like block
//! devices: an append-only write-ahead log over fixed-size clusters, a
//! cluster-marker protocol that is the sole crash-safety mechanism (no
//! superblock, no journal), and a lazy compactor that reclaims orphaned
//! clusters before the device fills up.
//!
//! [`FileSystem`] is the entry point; [`BlockDriver`] (re-exported from
//! `logfs-block`) is the device it drives.

pub use logfs_block::BlockDriver;
pub use logfs_err::{Error, Result};

mod cluster;
mod core;
mod fs;
mod stream;

pub use fs::FileSystem;
pub use stream::{OpenMode, SeekFrom, Stream};
