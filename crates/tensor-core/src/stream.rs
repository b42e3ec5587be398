// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Sequential weight stream with positional reads and optional mmap.
//!
//! [`InputFile`] is read front to back once while the graph is loaded (each
//! weight record's header is parsed and its data offset remembered), and
//! then read positionally whenever a weight tensor is materialized.
//!
//! With `enable_mmap`, the whole file is also mapped read-only so that CPU
//! weight tensors can point straight into the map instead of copying.

use crate::StreamError;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A model file opened for reading.
///
/// All methods take `&self`; the cursor sits behind a mutex so the file can
/// be shared as `Arc<InputFile>` by every weight tensor.
pub struct InputFile {
    path: PathBuf,
    len: u64,
    reader: Mutex<BufReader<File>>,
    mmap: Option<memmap2::Mmap>,
}

impl InputFile {
    /// Opens `path`, mapping it when `enable_mmap` is set.
    pub fn open(path: impl AsRef<Path>, enable_mmap: bool) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| StreamError::Open {
            path: path.clone(),
            source,
        };
        let file = File::open(&path).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len();

        let mmap = if enable_mmap {
            // SAFETY: the map is read-only and the model file is not
            // modified while a model is loaded.
            let map = unsafe { memmap2::Mmap::map(&file) }.map_err(open_err)?;
            tracing::info!(
                "weight stream: mmap'd {} ({:.2} MB)",
                path.display(),
                len as f64 / (1024.0 * 1024.0)
            );
            Some(map)
        } else {
            None
        };

        Ok(Self {
            path,
            len,
            reader: Mutex::new(BufReader::new(file)),
            mmap,
        })
    }

    /// Path this stream was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for an empty file.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if the file is memory mapped.
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    fn reader(&self) -> MutexGuard<'_, BufReader<File>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Sequential access ──────────────────────────────────────

    /// Current cursor position.
    pub fn tell(&self) -> Result<u64, StreamError> {
        Ok(self.reader().stream_position()?)
    }

    /// Moves the cursor to `offset`.
    pub fn seek(&self, offset: u64) -> Result<(), StreamError> {
        self.reader().seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Advances the cursor by `n` bytes without reading.
    pub fn skip(&self, n: u64) -> Result<(), StreamError> {
        let mut reader = self.reader();
        let pos = reader.stream_position()?;
        self.check_range(pos, n as usize)?;
        reader.seek_relative(n as i64)?;
        Ok(())
    }

    /// Returns `true` once the cursor reached the end of the file.
    pub fn is_eof(&self) -> Result<bool, StreamError> {
        Ok(self.tell()? >= self.len)
    }

    /// Fills `buf` from the cursor.
    pub fn read_raw(&self, buf: &mut [u8]) -> Result<(), StreamError> {
        let mut reader = self.reader();
        let pos = reader.stream_position()?;
        self.check_range(pos, buf.len())?;
        reader.read_exact(buf)?;
        Ok(())
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&self) -> Result<u32, StreamError> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&self) -> Result<i32, StreamError> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    /// Reads a little-endian `f32`.
    pub fn read_f32(&self) -> Result<f32, StreamError> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    /// Reads `len` bytes as a UTF-8 string.
    pub fn read_string(&self, len: usize) -> Result<String, StreamError> {
        let offset = self.tell()?;
        self.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_raw(&mut buf)?;
        String::from_utf8(buf).map_err(|_| StreamError::InvalidUtf8 { offset })
    }

    // ── Positional access ──────────────────────────────────────

    /// Fills `buf` from `offset` without disturbing the cursor.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), StreamError> {
        self.check_range(offset, buf.len())?;
        if let Some(map) = &self.mmap {
            let start = offset as usize;
            buf.copy_from_slice(&map[start..start + buf.len()]);
            return Ok(());
        }

        let mut reader = self.reader();
        let cursor = reader.stream_position()?;
        reader.seek(SeekFrom::Start(offset))?;
        let read = reader.read_exact(buf);
        reader.seek(SeekFrom::Start(cursor))?;
        read?;
        Ok(())
    }

    /// Borrows `len` mapped bytes at `offset`, if the file is mapped.
    pub fn mapped(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let map = self.mmap.as_ref()?;
        let start = usize::try_from(offset).ok()?;
        map.get(start..start.checked_add(len)?)
    }

    fn check_range(&self, offset: u64, needed: usize) -> Result<(), StreamError> {
        if offset.saturating_add(needed as u64) > self.len {
            return Err(StreamError::Truncated {
                offset,
                needed,
                len: self.len,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for InputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&7u32.to_le_bytes()).unwrap();
        f.write_all(&(-3i32).to_le_bytes()).unwrap();
        f.write_all(&1.5f32.to_le_bytes()).unwrap();
        f.write_all(b"hello").unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_sequential_reads() {
        let f = sample();
        let s = InputFile::open(f.path(), false).unwrap();
        assert_eq!(s.len(), 17);
        assert_eq!(s.read_u32().unwrap(), 7);
        assert_eq!(s.read_i32().unwrap(), -3);
        assert_eq!(s.read_f32().unwrap(), 1.5);
        assert_eq!(s.tell().unwrap(), 12);
        assert_eq!(s.read_string(5).unwrap(), "hello");
        assert!(s.is_eof().unwrap());
    }

    #[test]
    fn test_read_at_keeps_cursor() {
        let f = sample();
        for mmap in [false, true] {
            let s = InputFile::open(f.path(), mmap).unwrap();
            s.skip(4).unwrap();
            let mut buf = [0u8; 5];
            s.read_at(12, &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            assert_eq!(s.read_i32().unwrap(), -3);
        }
    }

    #[test]
    fn test_truncated() {
        let f = sample();
        let s = InputFile::open(f.path(), false).unwrap();
        s.seek(15).unwrap();
        let err = s.read_u32().unwrap_err();
        assert!(matches!(err, StreamError::Truncated { offset: 15, needed: 4, .. }));
        assert!(s.skip(10).is_err());
    }

    #[test]
    fn test_oversized_string_length() {
        let f = sample();
        let s = InputFile::open(f.path(), false).unwrap();
        s.seek(12).unwrap();
        let err = s.read_string(u32::MAX as usize).unwrap_err();
        assert!(matches!(err, StreamError::Truncated { offset: 12, .. }));
        // The cursor stays put, so the real string is still readable.
        assert_eq!(s.read_string(5).unwrap(), "hello");
    }

    #[test]
    fn test_mapped_view() {
        let f = sample();
        let s = InputFile::open(f.path(), true).unwrap();
        assert!(s.is_mapped());
        assert_eq!(s.mapped(12, 5), Some(&b"hello"[..]));
        assert_eq!(s.mapped(16, 5), None);

        let plain = InputFile::open(f.path(), false).unwrap();
        assert_eq!(plain.mapped(0, 1), None);
    }

    #[test]
    fn test_open_missing() {
        let err = InputFile::open("/nonexistent/model.bin", false).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }
}
