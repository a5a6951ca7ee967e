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

//! A cursor over one open file, shared with the [`crate::fs::FileSystem`] it
//! came from so `open_count` bookkeeping survives the stream's lifetime.

use std::sync::{Arc, Mutex};

use logfs_block::BlockDriver;
use logfs_err::Result;

use crate::core::Inner;

/// How [`crate::fs::FileSystem::open`] should resolve a name to an `obj_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the file exists.
    CreateNew,
    /// Create if missing; if present, delete the existing file and create a
    /// fresh one in its place.
    Create,
    /// Fail if the file is missing.
    Open,
    /// Create if missing, keep existing contents otherwise.
    OpenOrCreate,
    /// Fail if missing; truncate to empty otherwise.
    Truncate,
    /// Create if missing; position starts at end of file otherwise.
    Append,
}

#[derive(Clone, Copy, Debug)]
pub enum SeekFrom {
    Start(u32),
    Current(i64),
    End(i64),
}

pub struct Stream<D: BlockDriver> {
    pub(crate) inner: Arc<Mutex<Inner<D>>>,
    pub(crate) obj_id: u16,
    pub(crate) position: u32,
}

impl<D: BlockDriver> Stream<D> {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.read(self.obj_id, self.position, buf)?;
        self.position += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.write(self.obj_id, self.position, buf)?;
        self.position += n as u32;
        Ok(n)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u32> {
        let file_size = {
            let inner = self.inner.lock().unwrap();
            inner.files_index[&self.obj_id].file_size
        };
        let new_position = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => file_size as i64 + delta,
        };
        self.position = new_position.max(0) as u32;
        Ok(self.position)
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn len(&self) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.files_index[&self.obj_id].file_size)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn set_len(&mut self, new_len: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.truncate(self.obj_id, new_len)
    }

    /// Consumes the stream, running the same `open_count` decrement `Drop`
    /// would perform.
    pub fn close(self) {}
}

impl<D: BlockDriver> Drop for Stream<D> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(file_ref) = inner.files_index.get_mut(&self.obj_id) {
                file_ref.open_count = file_ref.open_count.saturating_sub(1);
            }
        }
    }
}
