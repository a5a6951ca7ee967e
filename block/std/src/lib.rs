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

//! A `std::fs::File`-backed `BlockDriver` that honors NOR-flash program/erase
//! semantics, for hosts, examples and integration tests.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use log::{trace, warn};
use logfs_block::BlockDriver;
use logfs_err::{Error, Result};

/// A flash device backed by a regular file.
///
/// Programming (`write`) only clears bits relative to the byte already on
/// disk, matching real NOR flash; a write that would need to set a bit is
/// rejected rather than silently corrupting the simulated device.
pub struct BlockDriverFile {
    file: File,
    device_size: u32,
    sector_size: u32,
    cluster_size: u32,
}

impl BlockDriverFile {
    /// Create a fresh, fully-erased device backed by `path`.
    pub fn create(
        path: impl AsRef<Path>,
        device_size: u32,
        sector_size: u32,
        cluster_size: u32,
    ) -> Result<Self> {
        Self::validate_geometry(device_size, sector_size, cluster_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;
        file.set_len(device_size as u64)
            .map_err(|e| Error::Io(e.to_string()))?;
        let driver = Self {
            file,
            device_size,
            sector_size,
            cluster_size,
        };
        driver.erase_chip()?;
        Ok(driver)
    }

    /// Open an existing device backed by `path` without erasing it.
    pub fn open(
        path: impl AsRef<Path>,
        device_size: u32,
        sector_size: u32,
        cluster_size: u32,
    ) -> Result<Self> {
        Self::validate_geometry(device_size, sector_size, cluster_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self {
            file,
            device_size,
            sector_size,
            cluster_size,
        })
    }

    fn validate_geometry(device_size: u32, sector_size: u32, cluster_size: u32) -> Result<()> {
        if sector_size == 0 || cluster_size == 0 || sector_size % cluster_size != 0 {
            return Err(Error::ArgumentOutOfRange(
                "cluster_size must evenly divide sector_size",
            ));
        }
        if device_size % sector_size != 0 {
            return Err(Error::ArgumentOutOfRange(
                "device_size must be a whole number of sectors",
            ));
        }
        let total_cluster_count = device_size / cluster_size;
        if total_cluster_count == 0 || total_cluster_count > u32::from(u16::MAX) + 1 {
            return Err(Error::ArgumentOutOfRange(
                "total cluster count must fit in a 16-bit id",
            ));
        }
        Ok(())
    }
}

impl BlockDriver for BlockDriverFile {
    fn read(&self, cluster_id: u16, offset: u16, dst: &mut [u8]) -> Result<()> {
        let pos = cluster_id as u64 * self.cluster_size as u64 + offset as u64;
        self.file
            .read_exact_at(dst, pos)
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn write(&self, cluster_id: u16, offset: u16, src: &[u8]) -> Result<()> {
        let pos = cluster_id as u64 * self.cluster_size as u64 + offset as u64;
        let mut current = vec![0u8; src.len()];
        self.file
            .read_exact_at(&mut current, pos)
            .map_err(|e| Error::Io(e.to_string()))?;
        for (current_byte, new_byte) in current.iter().zip(src.iter()) {
            if new_byte & !current_byte != 0 {
                warn!("program at cluster {cluster_id} offset {offset} would set an erased bit");
                return Err(Error::Io(
                    "program would set a bit that is not erased".into(),
                ));
            }
        }
        trace!("program cluster {cluster_id} offset {offset} len {}", src.len());
        self.file
            .write_all_at(src, pos)
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn erase_sector(&self, sector_id: u16) -> Result<()> {
        let pos = sector_id as u64 * self.sector_size as u64;
        let erased = vec![0xFFu8; self.sector_size as usize];
        trace!("erase sector {sector_id}");
        self.file
            .write_all_at(&erased, pos)
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn erase_chip(&self) -> Result<()> {
        let sectors = self.device_size / self.sector_size;
        for sector_id in 0..sectors {
            self.erase_sector(sector_id as u16)?;
        }
        Ok(())
    }

    fn device_size(&self) -> u32 {
        self.device_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn cluster_size(&self) -> u32 {
        self.cluster_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_reads_erased() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");
        let driver = BlockDriverFile::create(&path, 4096, 4096, 512).unwrap();
        let mut buf = [0u8; 16];
        driver.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFFu8; 16]);
    }

    #[test]
    fn write_only_clears_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");
        let driver = BlockDriverFile::create(&path, 4096, 4096, 512).unwrap();
        driver.write(0, 0, &[0x0F]).unwrap();
        let mut buf = [0u8; 1];
        driver.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x0F);

        // Attempting to set a bit back to 1 without an erase must fail.
        assert!(driver.write(0, 0, &[0xFF]).is_err());
        // Clearing further bits is fine.
        driver.write(0, 0, &[0x01]).unwrap();
        driver.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x01);
    }

    #[test]
    fn erase_sector_restores_all_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");
        let driver = BlockDriverFile::create(&path, 8192, 4096, 512).unwrap();
        driver.write(0, 0, &[0x00; 4]).unwrap();
        driver.erase_sector(0).unwrap();
        let mut buf = [0u8; 4];
        driver.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }
}
