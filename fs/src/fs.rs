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

//! The public surface: a single coarse mutex guarding [`crate::core::Inner`],
//! matched by one call per operation. There is no async, no retries and no
//! rollback beyond the pending/allocated/orphaned marker protocol itself.

use std::sync::{Arc, Mutex};

use logfs_block::BlockDriver;
use logfs_err::{Error, Result};

use crate::core::Inner;
use crate::stream::{OpenMode, Stream};

pub struct FileSystem<D: BlockDriver> {
    inner: Arc<Mutex<Inner<D>>>,
}

impl<D: BlockDriver> FileSystem<D> {
    pub fn new(driver: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(driver))),
        }
    }

    /// Reads the first cluster's marker without requiring a prior mount.
    pub fn check_if_formatted(&self) -> Result<bool> {
        self.inner.lock().unwrap().check_if_formatted()
    }

    /// Erases the device and writes a fresh `FormattedSector` marker to
    /// every sector. Fails with [`Error::FileInUse`] if any file is open.
    pub fn format(&self) -> Result<()> {
        self.inner.lock().unwrap().format()
    }

    /// Reconstructs in-memory state from the on-device markers. A no-op if
    /// already mounted.
    pub fn mount(&self) -> Result<()> {
        self.inner.lock().unwrap().mount()
    }

    /// Runs a full compaction pass, relocating every orphaned cluster's
    /// sector until none remain.
    pub fn compact(&self) -> Result<()> {
        self.inner.lock().unwrap().compact()
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        Ok(inner.find_obj_id_by_name(name)?.is_some())
    }

    /// Deletes any existing file of the same name first, then creates a
    /// fresh, empty one. Use `open(name, OpenMode::CreateNew)` to fail
    /// instead when the name is already taken.
    pub fn create(&self, name: &str) -> Result<Stream<D>> {
        self.open(name, OpenMode::Create)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let obj_id = inner.find_obj_id_by_name(name)?.ok_or(Error::FileNotFound)?;
        inner.delete(obj_id)
    }

    pub fn r#move(&self, src: &str, dst: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let obj_id = inner.find_obj_id_by_name(src)?.ok_or(Error::FileNotFound)?;
        inner.rename(obj_id, dst)
    }

    pub fn copy(&self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let src_obj_id = inner.find_obj_id_by_name(src)?.ok_or(Error::FileNotFound)?;
        inner.copy(src_obj_id, dst, overwrite)?;
        Ok(())
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> Result<Stream<D>> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let existing = inner.find_obj_id_by_name(name)?;

        let obj_id = match mode {
            OpenMode::CreateNew => {
                if existing.is_some() {
                    return Err(Error::PathAlreadyExists);
                }
                inner.create(name)?
            }
            // Deletes any existing file of the same name first, then
            // creates a fresh one — `Inner::create` does both steps.
            OpenMode::Create => inner.create(name)?,
            OpenMode::Open => existing.ok_or(Error::FileNotFound)?,
            OpenMode::OpenOrCreate | OpenMode::Append => match existing {
                Some(obj_id) => obj_id,
                None => inner.create(name)?,
            },
            OpenMode::Truncate => {
                let obj_id = existing.ok_or(Error::FileNotFound)?;
                inner.truncate(obj_id, 0)?;
                obj_id
            }
        };

        let position = if mode == OpenMode::Append {
            inner.files_index[&obj_id].file_size
        } else {
            0
        };

        inner.files_index.get_mut(&obj_id).unwrap().open_count += 1;

        Ok(Stream {
            inner: self.inner.clone(),
            obj_id,
            position,
        })
    }

    pub fn read_all_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.open(name, OpenMode::Open)?;
        let len = stream.len()?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    pub fn write_all_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut stream = self.open(name, OpenMode::Create)?;
        let mut written = 0;
        while written < bytes.len() {
            written += stream.write(&bytes[written..])?;
        }
        Ok(())
    }

    pub fn get_files(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        inner.all_file_names()
    }

    pub fn get_file_size(&self, name: &str) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let obj_id = inner.find_obj_id_by_name(name)?.ok_or(Error::FileNotFound)?;
        Ok(inner.files_index[&obj_id].file_size)
    }

    pub fn get_file_creation_time(&self, name: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        let obj_id = inner.find_obj_id_by_name(name)?.ok_or(Error::FileNotFound)?;
        inner.creation_time(obj_id)
    }

    /// `(free_bytes, orphaned_bytes)`.
    pub fn get_stats(&self) -> Result<(u64, u64)> {
        let inner = self.inner.lock().unwrap();
        inner.require_mounted()?;
        Ok(inner.stats())
    }
}
