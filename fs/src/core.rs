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

//! `LogCore` + `FileOps`: mount-time reconstruction, the append-only log, the
//! compactor, and the positional file operations built on top of them.
//!
//! Everything here lives behind the single coarse mutex held by
//! [`crate::fs::FileSystem`]; there is no internal locking.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use logfs_block::BlockDriver;
use logfs_err::{Error, Result};
use zerocopy::FromBytes;

use crate::cluster::{
    marker, ClusterBuffer, CommonHeader, FileClusterHeader, Marker, COMMON_HEADER_SIZE,
    DATA_CLUSTER_HEADER_SIZE, FILE_CLUSTER_HEADER_SIZE, MAX_FILENAME_LENGTH,
};

pub(crate) struct FileRef {
    pub blocks: Vec<u16>,
    pub file_size: u32,
    pub open_count: u32,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// All mutable state behind the file system's mutex: device geometry, the
/// head/tail of the log, wear-tracking counters, the in-memory name/block
/// index, and the two scratch cluster buffers every operation reuses.
pub(crate) struct Inner<D: BlockDriver> {
    driver: D,
    cluster_size: u32,
    clusters_per_sector: u32,
    total_cluster_count: u32,
    total_sectors: u16,
    min_free_clusters: u32,

    mounted: bool,
    compacting: bool,

    head_sector_id: u16,
    tail_cluster_id: u16,
    free_cluster_count: u32,
    orphaned_cluster_count: u32,
    orphaned_per_sector: Vec<u32>,
    last_obj_id: u16,

    pub(crate) files_index: HashMap<u16, FileRef>,

    cluster_buf: ClusterBuffer,
    defrag_buf: ClusterBuffer,
}

impl<D: BlockDriver> Inner<D> {
    pub fn new(driver: D) -> Self {
        let cluster_size = driver.cluster_size();
        let clusters_per_sector = driver.clusters_per_sector();
        let total_cluster_count = driver.total_cluster_count();
        let total_sectors = (total_cluster_count / clusters_per_sector) as u16;
        Self {
            driver,
            cluster_size,
            clusters_per_sector,
            total_cluster_count,
            total_sectors,
            min_free_clusters: 2 * clusters_per_sector,
            mounted: false,
            compacting: false,
            head_sector_id: 0,
            tail_cluster_id: 0,
            free_cluster_count: 0,
            orphaned_cluster_count: 0,
            orphaned_per_sector: vec![0; total_sectors as usize],
            last_obj_id: 0,
            files_index: HashMap::new(),
            cluster_buf: ClusterBuffer::new(cluster_size as usize),
            defrag_buf: ClusterBuffer::new(cluster_size as usize),
        }
    }

    pub fn require_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(Error::NotMounted)
        }
    }

    fn file_cluster_capacity(&self) -> usize {
        self.cluster_size as usize - FILE_CLUSTER_HEADER_SIZE
    }

    fn data_cluster_capacity(&self) -> usize {
        self.cluster_size as usize - DATA_CLUSTER_HEADER_SIZE
    }

    /// Split an absolute file position into `(block_id, offset within the
    /// block's cluster)`. Block 0 is the `FileCluster`, everything after it
    /// is a `DataCluster`, so the two capacities differ.
    fn block_and_offset(&self, position: u32) -> (u16, u32) {
        let f = self.file_cluster_capacity() as u32;
        if position < f {
            (0, position)
        } else {
            let adjusted = position - f;
            let d = self.data_cluster_capacity() as u32;
            (1 + (adjusted / d) as u16, adjusted % d)
        }
    }

    // ---- formatting & mount ------------------------------------------------

    pub fn check_if_formatted(&self) -> Result<bool> {
        let mut byte = [0u8; 1];
        self.driver.read(0, 0, &mut byte)?;
        Ok(Marker::from_byte(byte[0])
            .map(|m| !matches!(m, Marker::ErasedSector))
            .unwrap_or(false))
    }

    pub fn format(&mut self) -> Result<()> {
        if self.files_index.values().any(|f| f.open_count > 0) {
            return Err(Error::FileInUse);
        }
        self.driver.erase_chip()?;
        for sector_id in 0..self.total_sectors {
            let first_cluster = sector_id as u32 * self.clusters_per_sector;
            self.driver
                .write(first_cluster as u16, 0, &[marker::FORMATTED_SECTOR])?;
        }
        self.head_sector_id = 0;
        self.tail_cluster_id = 0;
        self.free_cluster_count = self.total_cluster_count;
        self.orphaned_cluster_count = 0;
        self.orphaned_per_sector.fill(0);
        self.last_obj_id = 0;
        self.files_index.clear();
        self.mounted = true;
        self.compacting = false;
        debug!(
            "formatted {} sectors ({} clusters)",
            self.total_sectors, self.total_cluster_count
        );
        Ok(())
    }

    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Ok(());
        }

        struct ScanFile {
            blocks: Vec<Option<(u16, u16)>>,
        }

        // Tracks free/occupied runs across the linear 0..total_cluster_count
        // scan of a circular log. The log has at most one contiguous free
        // arc and one contiguous occupied arc, so each transition simply
        // overwrites the previous candidate; the last one seen is correct
        // even when the arc being tracked wraps past cluster 0.
        #[derive(Default)]
        struct RunTracker {
            previous_occupied: Option<bool>,
            head_candidate: Option<u16>,
            tail_candidate: Option<u16>,
        }

        impl RunTracker {
            fn note(&mut self, occupied: bool, cluster_id: u16) {
                if let Some(prev) = self.previous_occupied {
                    if !prev && occupied {
                        self.head_candidate = Some(cluster_id);
                    }
                    if prev && !occupied {
                        self.tail_candidate = Some(cluster_id);
                    }
                }
                self.previous_occupied = Some(occupied);
            }
        }

        let mut scan_files: HashMap<u16, ScanFile> = HashMap::new();
        let mut free_cluster_count: u32 = 0;
        let mut orphaned_cluster_count: u32 = 0;
        let mut orphaned_per_sector = vec![0u32; self.total_sectors as usize];
        let mut last_obj_id: u16 = 0;
        let mut runs = RunTracker::default();

        let mut cluster_id: u32 = 0;
        while cluster_id < self.total_cluster_count {
            let sector_id = cluster_id / self.clusters_per_sector;
            let is_sector_head = cluster_id % self.clusters_per_sector == 0;

            let mut header_bytes = [0u8; COMMON_HEADER_SIZE];
            self.driver.read(cluster_id as u16, 0, &mut header_bytes)?;
            let marker_byte = header_bytes[0];
            let marker = Marker::from_byte(marker_byte).ok_or_else(|| {
                warn!("sector {sector_id} cluster {cluster_id} has an illegal marker {marker_byte:#x}");
                Error::NotFormatted {
                    sector_id: sector_id as u16,
                }
            })?;

            if is_sector_head && marker == Marker::ErasedSector {
                return Err(Error::NotFormatted {
                    sector_id: sector_id as u16,
                });
            }

            if is_sector_head && marker == Marker::FormattedSector {
                free_cluster_count += self.clusters_per_sector;
                runs.note(false, cluster_id as u16);
                cluster_id += self.clusters_per_sector;
                continue;
            }

            match marker {
                Marker::ErasedSector | Marker::FormattedSector => {
                    free_cluster_count += 1;
                    runs.note(false, cluster_id as u16);
                }
                Marker::AllocatedCluster => {
                    let common = CommonHeader::ref_from_bytes(&header_bytes)
                        .expect("header_bytes sized to CommonHeader");
                    let obj_id = common.obj_id.get();
                    let block_id = common.block_id.get();
                    let data_length = common.data_length.get();
                    last_obj_id = last_obj_id.max(obj_id);

                    let scan_file = scan_files.entry(obj_id).or_insert_with(|| ScanFile {
                        blocks: Vec::new(),
                    });
                    if block_id as usize >= scan_file.blocks.len() {
                        scan_file.blocks.resize(block_id as usize + 1, None);
                    }
                    scan_file.blocks[block_id as usize] = Some((cluster_id as u16, data_length));

                    runs.note(true, cluster_id as u16);
                }
                Marker::OrphanedCluster | Marker::PendingCluster => {
                    orphaned_cluster_count += 1;
                    orphaned_per_sector[sector_id as usize] += 1;
                    runs.note(true, cluster_id as u16);
                }
            }
            cluster_id += 1;
        }

        let head_cluster_id = runs.head_candidate.unwrap_or(0);
        let tail_cluster_id = runs.tail_candidate.unwrap_or(0);

        self.head_sector_id = (head_cluster_id as u32 / self.clusters_per_sector) as u16;
        self.tail_cluster_id = tail_cluster_id;
        self.free_cluster_count = free_cluster_count;
        self.orphaned_cluster_count = orphaned_cluster_count;
        self.orphaned_per_sector = orphaned_per_sector;
        self.last_obj_id = last_obj_id;
        self.files_index.clear();

        for (obj_id, scan_file) in scan_files {
            if scan_file.blocks.first().copied().flatten().is_none() {
                for slot in scan_file.blocks.into_iter().flatten() {
                    self.orphan_cluster(slot.0)?;
                }
                continue;
            }

            let mut blocks = Vec::new();
            let mut file_size: u32 = 0;
            for slot in &scan_file.blocks {
                match slot {
                    Some((cluster_id, data_length)) => {
                        blocks.push(*cluster_id);
                        file_size += *data_length as u32;
                    }
                    None => break,
                }
            }
            for slot in scan_file.blocks.into_iter().skip(blocks.len()).flatten() {
                self.orphan_cluster(slot.0)?;
            }

            self.files_index.insert(
                obj_id,
                FileRef {
                    blocks,
                    file_size,
                    open_count: 0,
                },
            );
        }

        self.mounted = true;
        debug!(
            "mounted: head_sector={} tail_cluster={} free={} orphaned={} files={}",
            self.head_sector_id,
            self.tail_cluster_id,
            self.free_cluster_count,
            self.orphaned_cluster_count,
            self.files_index.len()
        );
        Ok(())
    }

    // ---- append-only log ---------------------------------------------------

    fn reserve_tail_cluster(&mut self) -> Result<u16> {
        if !self.compacting && self.free_cluster_count <= self.min_free_clusters {
            self.partial_compact()?;
        }
        if self.free_cluster_count <= self.min_free_clusters {
            warn!("disk full: no free cluster available after compaction");
            return Err(Error::DiskFull);
        }
        let cluster_id = self.tail_cluster_id;
        self.tail_cluster_id = ((cluster_id as u32 + 1) % self.total_cluster_count) as u16;
        self.free_cluster_count -= 1;
        Ok(cluster_id)
    }

    fn mark_cluster_allocated(&mut self, cluster_id: u16) -> Result<()> {
        self.driver.write(cluster_id, 0, &[marker::ALLOCATED_CLUSTER])
    }

    fn orphan_cluster(&mut self, cluster_id: u16) -> Result<()> {
        self.driver.write(cluster_id, 0, &[marker::ORPHANED_CLUSTER])?;
        self.orphaned_cluster_count += 1;
        let sector_id = cluster_id as u32 / self.clusters_per_sector;
        self.orphaned_per_sector[sector_id as usize] += 1;
        Ok(())
    }

    /// Append `self.cluster_buf` (already filled in as a pending cluster) and
    /// flip it to allocated. Returns the cluster id it landed on.
    fn append_cluster_buf(&mut self) -> Result<u16> {
        let cluster_id = self.reserve_tail_cluster()?;
        let max_write = self.cluster_buf.max_write();
        self.driver
            .write(cluster_id, 0, &self.cluster_buf.as_bytes()[..max_write])?;
        self.mark_cluster_allocated(cluster_id)?;
        Ok(cluster_id)
    }

    // ---- compaction ---------------------------------------------------------

    fn sector_to_compact(&self) -> u16 {
        if self.orphaned_per_sector[self.head_sector_id as usize] > 0 {
            return self.head_sector_id;
        }
        let tail_sector = (self.tail_cluster_id as u32 / self.clusters_per_sector) as u16;
        let mut best_sector = 0u16;
        let mut best_count = 0u32;
        for (sector_id, &count) in self.orphaned_per_sector.iter().enumerate() {
            let sector_id = sector_id as u16;
            if sector_id == tail_sector {
                continue;
            }
            if count > best_count {
                best_count = count;
                best_sector = sector_id;
            }
        }
        best_sector
    }

    /// Relocate every live cluster out of `from_sector`, then erase and
    /// reformat it. No-op if `from_sector` already holds the tail.
    fn migrate_sector(&mut self, from_sector: u16) -> Result<()> {
        let dest_sector = (self.tail_cluster_id as u32 / self.clusters_per_sector) as u16;
        if dest_sector == from_sector {
            return Ok(());
        }

        let first_cluster = from_sector as u32 * self.clusters_per_sector;
        let mut reclaimed: u32 = 0;
        let mut freed_orphaned: u32 = 0;

        for i in 0..self.clusters_per_sector {
            let cluster_id = (first_cluster + i) as u16;
            let mut header_bytes = [0u8; COMMON_HEADER_SIZE];
            self.driver.read(cluster_id, 0, &mut header_bytes)?;
            let marker_byte = header_bytes[0];
            let marker = Marker::from_byte(marker_byte);

            match marker {
                Some(Marker::AllocatedCluster) => {
                    let common = CommonHeader::ref_from_bytes(&header_bytes)
                        .expect("header_bytes sized to CommonHeader");
                    let obj_id = common.obj_id.get();
                    let block_id = common.block_id.get();
                    let data_length = common.data_length.get() as usize;
                    let payload_offset = ClusterBuffer::payload_offset(block_id);
                    let total_len = payload_offset + data_length;

                    self.defrag_buf.reset();
                    self.driver
                        .read(cluster_id, 0, &mut self.defrag_buf.as_bytes_mut()[..total_len])?;
                    self.defrag_buf.set_marker(marker::PENDING_CLUSTER);
                    self.defrag_buf.set_max_write(total_len);

                    let to_cluster = self.reserve_tail_cluster()?;
                    let max_write = self.defrag_buf.max_write();
                    self.driver
                        .write(to_cluster, 0, &self.defrag_buf.as_bytes()[..max_write])?;
                    self.mark_cluster_allocated(to_cluster)?;

                    if let Some(file_ref) = self.files_index.get_mut(&obj_id) {
                        if let Some(slot) = file_ref.blocks.get_mut(block_id as usize) {
                            *slot = to_cluster;
                        } else {
                            self.orphan_cluster(to_cluster)?;
                        }
                    } else {
                        self.orphan_cluster(to_cluster)?;
                    }
                    reclaimed += 1;
                }
                Some(Marker::ErasedSector) | Some(Marker::FormattedSector) => {}
                _ => {
                    reclaimed += 1;
                    freed_orphaned += 1;
                }
            }
        }

        self.driver.erase_sector(from_sector)?;
        self.driver
            .write(first_cluster as u16, 0, &[marker::FORMATTED_SECTOR])?;
        self.orphaned_per_sector[from_sector as usize] = 0;
        self.free_cluster_count += reclaimed;
        self.orphaned_cluster_count = self.orphaned_cluster_count.saturating_sub(freed_orphaned);
        trace!("migrated sector {from_sector}: reclaimed {reclaimed} clusters");
        Ok(())
    }

    fn compact_loop(&mut self, partial: bool) -> Result<()> {
        if self.compacting {
            return Ok(());
        }
        self.compacting = true;
        let result = self.compact_loop_inner(partial);
        self.compacting = false;
        result
    }

    fn compact_loop_inner(&mut self, partial: bool) -> Result<()> {
        loop {
            if partial {
                if !(self.free_cluster_count <= self.min_free_clusters
                    && self.orphaned_cluster_count >= self.clusters_per_sector)
                {
                    break;
                }
            } else if self.orphaned_cluster_count == 0 {
                break;
            }

            let sector = self.sector_to_compact();
            let tail_sector = (self.tail_cluster_id as u32 / self.clusters_per_sector) as u16;
            if sector == tail_sector {
                break;
            }

            self.migrate_sector(sector)?;

            if sector != self.head_sector_id {
                let tail_sector_now = (self.tail_cluster_id as u32 / self.clusters_per_sector) as u16;
                if self.head_sector_id != tail_sector_now {
                    self.migrate_sector(self.head_sector_id)?;
                }
            }

            self.head_sector_id = (self.head_sector_id + 1) % self.total_sectors;
        }
        Ok(())
    }

    pub fn compact(&mut self) -> Result<()> {
        self.compact_loop(false)
    }

    fn partial_compact(&mut self) -> Result<()> {
        self.compact_loop(true)
    }

    // ---- filename lookup -----------------------------------------------------

    pub fn find_obj_id_by_name(&self, name: &str) -> Result<Option<u16>> {
        let query = name.to_ascii_uppercase();
        for (&obj_id, file_ref) in &self.files_index {
            let Some(&cluster_id) = file_ref.blocks.first() else {
                continue;
            };
            let mut header_bytes = vec![0u8; FILE_CLUSTER_HEADER_SIZE];
            self.driver.read(cluster_id, 0, &mut header_bytes)?;
            let header = FileClusterHeader::ref_from_bytes(&header_bytes)
                .expect("header_bytes sized to FileClusterHeader");
            let stored_len = (header.filename_length.get() as usize).min(MAX_FILENAME_LENGTH);
            let stored = std::str::from_utf8(&header.filename[..stored_len]).unwrap_or("");
            if stored.to_ascii_uppercase() == query {
                return Ok(Some(obj_id));
            }
        }
        Ok(None)
    }

    pub fn all_file_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(self.files_index.len());
        for file_ref in self.files_index.values() {
            let cluster_id = file_ref.blocks[0];
            let mut header_bytes = vec![0u8; FILE_CLUSTER_HEADER_SIZE];
            self.driver.read(cluster_id, 0, &mut header_bytes)?;
            let header = FileClusterHeader::ref_from_bytes(&header_bytes)
                .expect("header_bytes sized to FileClusterHeader");
            let stored_len = (header.filename_length.get() as usize).min(MAX_FILENAME_LENGTH);
            names.push(String::from_utf8_lossy(&header.filename[..stored_len]).into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn creation_time(&self, obj_id: u16) -> Result<u64> {
        let file_ref = self.files_index.get(&obj_id).ok_or(Error::FileNotFound)?;
        let cluster_id = file_ref.blocks[0];
        let mut header_bytes = vec![0u8; FILE_CLUSTER_HEADER_SIZE];
        self.driver.read(cluster_id, 0, &mut header_bytes)?;
        let header = FileClusterHeader::ref_from_bytes(&header_bytes)
            .expect("header_bytes sized to FileClusterHeader");
        Ok(header.creation_time.get())
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.free_cluster_count as u64 * self.cluster_size as u64,
            self.orphaned_cluster_count as u64 * self.cluster_size as u64,
        )
    }

    // ---- file operations -------------------------------------------------

    pub fn create(&mut self, name: &str) -> Result<u16> {
        self.require_mounted()?;
        if name.as_bytes().len() > MAX_FILENAME_LENGTH {
            return Err(Error::ArgumentOutOfRange("file name longer than 16 bytes"));
        }
        if let Some(existing) = self.find_obj_id_by_name(name)? {
            self.delete(existing)?;
        }

        self.last_obj_id = self.last_obj_id.wrapping_add(1);
        let obj_id = self.last_obj_id;

        self.cluster_buf.reset();
        self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
        self.cluster_buf.set_obj_id(obj_id);
        self.cluster_buf.set_block_id(0);
        self.cluster_buf.set_data_length(0);
        self.cluster_buf.set_filename(name.as_bytes());
        self.cluster_buf.set_creation_time(now_unix());
        self.cluster_buf.set_max_write(FILE_CLUSTER_HEADER_SIZE);

        let cluster_id = self.append_cluster_buf()?;
        self.files_index.insert(
            obj_id,
            FileRef {
                blocks: vec![cluster_id],
                file_size: 0,
                open_count: 0,
            },
        );
        debug!("create {name:?} -> obj_id {obj_id} cluster {cluster_id}");
        Ok(obj_id)
    }

    pub fn read(&mut self, obj_id: u16, position: u32, buf: &mut [u8]) -> Result<usize> {
        self.require_mounted()?;
        let file_size = self
            .files_index
            .get(&obj_id)
            .ok_or(Error::FileNotFound)?
            .file_size;
        if position >= file_size || buf.is_empty() {
            return Ok(0);
        }

        let (mut block_id, mut cluster_offset) = self.block_and_offset(position);
        let mut remaining = ((file_size - position) as usize).min(buf.len());
        let mut total_read = 0usize;

        while remaining > 0 {
            let cluster_id = {
                let file_ref = self.files_index.get(&obj_id).ok_or(Error::FileNotFound)?;
                let Some(&cluster_id) = file_ref.blocks.get(block_id as usize) else {
                    break;
                };
                cluster_id
            };

            let mut header_bytes = [0u8; COMMON_HEADER_SIZE];
            self.driver.read(cluster_id, 0, &mut header_bytes)?;
            let data_length = CommonHeader::ref_from_bytes(&header_bytes)
                .expect("header_bytes sized to CommonHeader")
                .data_length
                .get() as usize;
            if cluster_offset as usize >= data_length {
                break;
            }

            let payload_offset = ClusterBuffer::payload_offset(block_id);
            let available = data_length - cluster_offset as usize;
            let chunk = available.min(remaining);
            self.driver.read(
                cluster_id,
                (payload_offset + cluster_offset as usize) as u16,
                &mut buf[total_read..total_read + chunk],
            )?;

            total_read += chunk;
            remaining -= chunk;
            block_id += 1;
            cluster_offset = 0;
        }
        Ok(total_read)
    }

    pub fn write(&mut self, obj_id: u16, position: u32, buf: &[u8]) -> Result<usize> {
        self.require_mounted()?;
        let file_size = self
            .files_index
            .get(&obj_id)
            .ok_or(Error::FileNotFound)?
            .file_size;
        if position > file_size {
            return Err(Error::WritePastEnd);
        }

        let mut position = position;
        let mut written = 0usize;
        while written < buf.len() {
            let (block_id, cluster_offset) = self.block_and_offset(position);
            let capacity = if block_id == 0 {
                self.file_cluster_capacity()
            } else {
                self.data_cluster_capacity()
            };
            let chunk = (capacity - cluster_offset as usize).min(buf.len() - written);
            self.write_block(obj_id, block_id, cluster_offset as usize, &buf[written..written + chunk])?;
            written += chunk;
            position += chunk as u32;
        }
        Ok(written)
    }

    fn write_block(&mut self, obj_id: u16, block_id: u16, cluster_offset: usize, chunk: &[u8]) -> Result<()> {
        let existing_cluster = self
            .files_index
            .get(&obj_id)
            .ok_or(Error::FileNotFound)?
            .blocks
            .get(block_id as usize)
            .copied();
        let payload_offset = ClusterBuffer::payload_offset(block_id);

        self.cluster_buf.reset();

        let mut old_cluster_id = None;
        let size_delta: i64;

        if let Some(existing_cluster_id) = existing_cluster {
            let header_size = ClusterBuffer::header_size(block_id);
            let mut header_bytes = vec![0u8; header_size];
            self.driver.read(existing_cluster_id, 0, &mut header_bytes)?;
            let current_data_length = if block_id == 0 {
                FileClusterHeader::ref_from_bytes(&header_bytes)
                    .expect("header_bytes sized to FileClusterHeader")
                    .common
                    .data_length
                    .get() as usize
            } else {
                CommonHeader::ref_from_bytes(&header_bytes)
                    .expect("header_bytes sized to CommonHeader")
                    .data_length
                    .get() as usize
            };

            let excess = (cluster_offset + chunk.len()).saturating_sub(current_data_length);
            let data_length = current_data_length + excess;

            self.driver.read(
                existing_cluster_id,
                0,
                &mut self.cluster_buf.as_bytes_mut()[..payload_offset + current_data_length],
            )?;
            self.cluster_buf.as_bytes_mut()[payload_offset + cluster_offset..payload_offset + cluster_offset + chunk.len()]
                .copy_from_slice(chunk);

            self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
            self.cluster_buf.set_obj_id(obj_id);
            self.cluster_buf.set_block_id(block_id);
            self.cluster_buf.set_data_length(data_length as u16);
            self.cluster_buf.set_max_write(payload_offset + data_length);

            old_cluster_id = Some(existing_cluster_id);
            size_delta = excess as i64;
        } else {
            self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
            self.cluster_buf.set_obj_id(obj_id);
            self.cluster_buf.set_block_id(block_id);
            self.cluster_buf.set_data_length(chunk.len() as u16);
            self.cluster_buf.as_bytes_mut()[payload_offset..payload_offset + chunk.len()]
                .copy_from_slice(chunk);
            self.cluster_buf.set_max_write(payload_offset + chunk.len());
            size_delta = chunk.len() as i64;
        }

        let new_cluster_id = self.append_cluster_buf()?;
        if let Some(old_cluster_id) = old_cluster_id {
            self.orphan_cluster(old_cluster_id)?;
        }

        let file_ref = self.files_index.get_mut(&obj_id).ok_or(Error::FileNotFound)?;
        if (block_id as usize) < file_ref.blocks.len() {
            file_ref.blocks[block_id as usize] = new_cluster_id;
        } else {
            file_ref.blocks.push(new_cluster_id);
        }
        file_ref.file_size = (file_ref.file_size as i64 + size_delta) as u32;
        Ok(())
    }

    pub fn truncate(&mut self, obj_id: u16, position: u32) -> Result<()> {
        self.require_mounted()?;
        let file_size = self
            .files_index
            .get(&obj_id)
            .ok_or(Error::FileNotFound)?
            .file_size;
        if position > file_size {
            return Err(Error::WritePastEnd);
        }
        if position == file_size {
            return Ok(());
        }

        let (block_id, cluster_offset) = self.block_and_offset(position);
        let mut first_dropped_block = block_id;

        if cluster_offset > 0 || block_id == 0 {
            let old_cluster_id = self.files_index[&obj_id].blocks[block_id as usize];
            let header_size = ClusterBuffer::header_size(block_id);
            let payload_offset = header_size;

            self.cluster_buf.reset();
            self.driver.read(
                old_cluster_id,
                0,
                &mut self.cluster_buf.as_bytes_mut()[..payload_offset + cluster_offset as usize],
            )?;
            self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
            self.cluster_buf.set_obj_id(obj_id);
            self.cluster_buf.set_block_id(block_id);
            self.cluster_buf.set_data_length(cluster_offset as u16);
            self.cluster_buf.set_max_write(payload_offset + cluster_offset as usize);

            let new_cluster_id = self.append_cluster_buf()?;
            self.orphan_cluster(old_cluster_id)?;

            let file_ref = self.files_index.get_mut(&obj_id).ok_or(Error::FileNotFound)?;
            file_ref.blocks[block_id as usize] = new_cluster_id;
            first_dropped_block = block_id + 1;
        }

        let file_ref = self.files_index.get_mut(&obj_id).ok_or(Error::FileNotFound)?;
        let dropped: Vec<u16> = file_ref.blocks.drain(first_dropped_block as usize..).collect();
        file_ref.file_size = position;
        for cluster_id in dropped {
            self.orphan_cluster(cluster_id)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, obj_id: u16) -> Result<()> {
        self.require_mounted()?;
        let file_ref = self.files_index.get(&obj_id).ok_or(Error::FileNotFound)?;
        if file_ref.open_count > 0 {
            return Err(Error::FileInUse);
        }
        let blocks = file_ref.blocks.clone();
        for cluster_id in blocks {
            self.orphan_cluster(cluster_id)?;
        }
        self.files_index.remove(&obj_id);
        Ok(())
    }

    pub fn rename(&mut self, obj_id: u16, new_name: &str) -> Result<()> {
        self.require_mounted()?;
        if new_name.as_bytes().len() > MAX_FILENAME_LENGTH {
            return Err(Error::ArgumentOutOfRange("file name longer than 16 bytes"));
        }
        if self.find_obj_id_by_name(new_name)?.is_some() {
            return Err(Error::PathAlreadyExists);
        }

        let old_cluster_id = self
            .files_index
            .get(&obj_id)
            .ok_or(Error::FileNotFound)?
            .blocks[0];

        let mut header_bytes = vec![0u8; FILE_CLUSTER_HEADER_SIZE];
        self.driver.read(old_cluster_id, 0, &mut header_bytes)?;
        let old_data_length = FileClusterHeader::ref_from_bytes(&header_bytes)
            .expect("header_bytes sized to FileClusterHeader")
            .common
            .data_length
            .get() as usize;

        self.cluster_buf.reset();
        self.driver.read(
            old_cluster_id,
            0,
            &mut self.cluster_buf.as_bytes_mut()[..FILE_CLUSTER_HEADER_SIZE + old_data_length],
        )?;
        self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
        self.cluster_buf.set_filename(new_name.as_bytes());
        self.cluster_buf
            .set_max_write(FILE_CLUSTER_HEADER_SIZE + old_data_length);

        let new_cluster_id = self.append_cluster_buf()?;
        self.orphan_cluster(old_cluster_id)?;
        self.files_index.get_mut(&obj_id).ok_or(Error::FileNotFound)?.blocks[0] = new_cluster_id;
        Ok(())
    }

    pub fn copy(&mut self, src_obj_id: u16, dst_name: &str, overwrite: bool) -> Result<u16> {
        self.require_mounted()?;
        if dst_name.as_bytes().len() > MAX_FILENAME_LENGTH {
            return Err(Error::ArgumentOutOfRange("file name longer than 16 bytes"));
        }
        let existing = self.find_obj_id_by_name(dst_name)?;
        if let Some(existing) = existing {
            if existing != src_obj_id && !overwrite {
                return Err(Error::PathAlreadyExists);
            }
        }

        let src = self.files_index.get(&src_obj_id).ok_or(Error::FileNotFound)?;
        let src_blocks = src.blocks.clone();
        let src_file_size = src.file_size;

        self.last_obj_id = self.last_obj_id.wrapping_add(1);
        let new_obj_id = self.last_obj_id;
        let now = now_unix();

        let mut new_blocks = Vec::with_capacity(src_blocks.len());
        for (block_id, &src_cluster_id) in src_blocks.iter().enumerate() {
            let block_id = block_id as u16;
            let header_size = ClusterBuffer::header_size(block_id);

            let mut header_bytes = vec![0u8; header_size];
            self.driver.read(src_cluster_id, 0, &mut header_bytes)?;
            let data_length = if block_id == 0 {
                FileClusterHeader::ref_from_bytes(&header_bytes)
                    .expect("header_bytes sized to FileClusterHeader")
                    .common
                    .data_length
                    .get() as usize
            } else {
                CommonHeader::ref_from_bytes(&header_bytes)
                    .expect("header_bytes sized to CommonHeader")
                    .data_length
                    .get() as usize
            };

            self.cluster_buf.reset();
            self.driver.read(
                src_cluster_id,
                0,
                &mut self.cluster_buf.as_bytes_mut()[..header_size + data_length],
            )?;
            self.cluster_buf.set_marker(marker::PENDING_CLUSTER);
            self.cluster_buf.set_obj_id(new_obj_id);
            self.cluster_buf.set_block_id(block_id);
            if block_id == 0 {
                self.cluster_buf.set_filename(dst_name.as_bytes());
                self.cluster_buf.set_creation_time(now);
            }
            self.cluster_buf.set_max_write(header_size + data_length);

            let new_cluster_id = self.append_cluster_buf()?;
            new_blocks.push(new_cluster_id);
        }

        self.files_index.insert(
            new_obj_id,
            FileRef {
                blocks: new_blocks,
                file_size: src_file_size,
                open_count: 0,
            },
        );

        // Deferred until the new copy exists, so overwriting a file with a
        // copy of itself (`dst_name` already names `src_obj_id`) reads the
        // source before it is removed.
        if let Some(existing) = existing {
            self.delete(existing)?;
        }

        Ok(new_obj_id)
    }
}
