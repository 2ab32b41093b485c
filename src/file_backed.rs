//! File-backed stream (spec.md §4.D).
//!
//! Grounded on the teacher's `raw.rs`/`raw/mod.rs` `RAW` wrapper, which is
//! already "a thin wrapper around `std::fs::File` implementing `Read` and
//! `Seek`" with a `Clone` that duplicates the file descriptor — generalized
//! here into the three open-mode contract (`read`/`truncate`/`append`) spec.md
//! requires.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Aff4Error, Aff4Result};
use crate::stream::{clamp_seek, Aff4Stream, StreamProperties};

/// The three modes a [`FileBackedObject`] may be opened in (spec.md §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Truncate,
    Append,
}

/// A clonable, seekable, OS-file-backed stream.
///
/// Mirrors the teacher's `RAW::clone` semantics: cloning duplicates the file
/// descriptor via [`File::try_clone`] so both instances share the same file
/// but keep independent cursors.
pub struct FileBackedObject {
    file: File,
    mode: OpenMode,
    /// One-shot: a stream opened in `Truncate` mode flips to `Append`
    /// after the first open, per the REDESIGN note in spec.md §9 — this is
    /// an intentional quirk of the original, preserved deliberately.
    truncated_once: bool,
    sizeable: bool,
    seekable: bool,
}

impl FileBackedObject {
    /// Opens `path` in the given mode. `truncate`/`append` create any
    /// missing intermediate directories first.
    pub fn open(path: &Path, mode: OpenMode) -> Aff4Result<Self> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Truncate => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                options.read(true).write(true).create(true).truncate(true);
            }
            OpenMode::Append => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                options.read(true).write(true).create(true);
            }
        }

        let mut file = options.open(path)?;

        let (sizeable, size) = match file.seek(SeekFrom::End(0)) {
            Ok(s) => (true, s),
            Err(_) => (false, 0),
        };
        // Probe seekability with SEEK_CUR, as the teacher/spec describe for
        // raw block devices where size cannot be determined.
        let seekable = file.stream_position().is_ok();
        if mode == OpenMode::Append {
            file.seek(SeekFrom::Start(size))?;
        } else {
            file.seek(SeekFrom::Start(0))?;
        }

        Ok(Self {
            file,
            mode,
            truncated_once: false,
            sizeable,
            seekable,
        })
    }

    /// Whether this object's mode has settled to `append` (either because
    /// it was opened that way, or because a one-shot truncate already fired).
    pub fn effective_mode(&self) -> OpenMode {
        if self.mode == OpenMode::Truncate && self.truncated_once {
            OpenMode::Append
        } else {
            self.mode
        }
    }
}

impl Clone for FileBackedObject {
    fn clone(&self) -> Self {
        Self {
            file: self
                .file
                .try_clone()
                .expect("failed to clone FileBackedObject file handle"),
            mode: self.mode,
            truncated_once: self.truncated_once,
            sizeable: self.sizeable,
            seekable: self.seekable,
        }
    }
}

impl Read for FileBackedObject {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileBackedObject {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode == OpenMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream is not writable",
            ));
        }
        let n = self.file.write(buf)?;
        if self.mode == OpenMode::Truncate {
            self.truncated_once = true;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileBackedObject {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if !self.seekable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not seekable",
            ));
        }
        if matches!(pos, SeekFrom::End(_)) && !self.sizeable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream size is unknown; SEEK_END disabled",
            ));
        }
        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.file.stream_position()? as i64 + o,
            SeekFrom::End(o) => self.file.metadata()?.len() as i64 + o,
        };
        let clamped = clamp_seek(target);
        self.file.seek(SeekFrom::Start(clamped))
    }
}

impl Aff4Stream for FileBackedObject {
    fn properties(&self) -> StreamProperties {
        StreamProperties {
            seekable: self.seekable,
            sizeable: self.sizeable,
            writable: self.mode != OpenMode::Read,
        }
    }

    fn size(&self) -> Aff4Result<u64> {
        if !self.sizeable {
            return Err(Aff4Error::NotImplemented(
                "stream size is unknown".to_string(),
            ));
        }
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&mut self) -> Aff4Result<()> {
        if !self.seekable {
            return Err(Aff4Error::NotImplemented(
                "cannot truncate a non-seekable stream".to_string(),
            ));
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn truncate_mode_flips_to_append_after_first_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.bin");
        let mut f = FileBackedObject::open(&path, OpenMode::Truncate).unwrap();
        assert_eq!(f.effective_mode(), OpenMode::Truncate);
        f.write_all(b"hello").unwrap();
        assert_eq!(f.effective_mode(), OpenMode::Append);
    }

    #[test]
    fn append_mode_seeks_to_end_and_creates_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("data.bin");
        {
            let mut f = FileBackedObject::open(&path, OpenMode::Append).unwrap();
            f.write_all(b"first").unwrap();
        }
        let mut f = FileBackedObject::open(&path, OpenMode::Append).unwrap();
        f.write_all(b"second").unwrap();
        drop(f);

        let contents = fs::read(&path).unwrap();
        assert_eq!(contents, b"firstsecond");
    }

    #[test]
    fn read_mode_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        fs::write(&path, b"data").unwrap();
        let mut f = FileBackedObject::open(&path, OpenMode::Read).unwrap();
        assert!(f.write(b"x").is_err());
    }

    #[test]
    fn truncate_resets_size_and_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut f = FileBackedObject::open(&path, OpenMode::Truncate).unwrap();
        f.write_all(b"0123456789").unwrap();
        f.truncate().unwrap();
        assert_eq!(f.size().unwrap(), 0);
    }
}
