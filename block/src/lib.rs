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

//! `BlockDriver`: the external hardware contract (§4.A).
//!
//! This crate is intentionally thin — it is the one true polymorphism point
//! of the file system (§9 "Dynamic dispatch → interface"). It never performs
//! I/O itself; `logfs-block-std` provides the one concrete implementation
//! used by hosts, examples and tests.

pub use logfs_err::{Error, Result};

/// Uniform read/write/erase over a device addressed in clusters.
///
/// A successful `write` is durable; a successful `erase_sector` leaves every
/// byte of that sector in the erased state (all-ones). `write` only clears
/// bits relative to the cluster's current contents — callers (the file
/// system core) are responsible for never asking a transition to set a bit
/// that isn't already set, and for ordering marker-byte writes so a partial
/// program never corrupts a committed marker.
///
/// The driver is assumed reliable: there is no retry path in the core (§7).
pub trait BlockDriver {
    /// Random read of `dst.len()` bytes from `cluster_id` starting at
    /// `offset` bytes into the cluster.
    fn read(&self, cluster_id: u16, offset: u16, dst: &mut [u8]) -> Result<()>;

    /// Program (bit-clearing only) `src` into `cluster_id` starting at
    /// `offset` bytes into the cluster.
    fn write(&self, cluster_id: u16, offset: u16, src: &[u8]) -> Result<()>;

    /// Restore every cluster of `sector_id` to the erased state.
    fn erase_sector(&self, sector_id: u16) -> Result<()>;

    /// Restore the entire device to the erased state.
    fn erase_chip(&self) -> Result<()>;

    /// Total device size in bytes.
    fn device_size(&self) -> u32;

    /// Erase granule, in bytes.
    fn sector_size(&self) -> u32;

    /// Program granule and logical allocation unit, in bytes.
    fn cluster_size(&self) -> u32;

    /// `sector_size() / cluster_size()`.
    fn clusters_per_sector(&self) -> u32 {
        self.sector_size() / self.cluster_size()
    }

    /// `device_size() / cluster_size()`.
    fn total_cluster_count(&self) -> u32 {
        self.device_size() / self.cluster_size()
    }
}
