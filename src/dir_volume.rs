//! Directory-backed volume (spec.md §4.H).
//!
//! One member per file on the host filesystem, named by
//! [`crate::urn::urn_to_member_name`]. Grounded on the same
//! `Aff4Volume` contract [`crate::zip::ZipVolume`] implements — this is
//! the corpus's equivalent of the C++ library's `AFF4Directory`
//! (`original_source/src/aff4_io.h`), minus ZIP framing: every member is
//! just a flat file under `root`, and compression is irrelevant since
//! there's no archive container applying it.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Aff4Result;
use crate::resolver::Resolver;
use crate::urn::{urn_to_member_name, Urn};
use crate::volume::Aff4Volume;

pub struct DirVolume {
    pub urn: Urn,
    root: PathBuf,
    dirty: bool,
}

impl DirVolume {
    /// Creates (or reuses) `root` as a volume directory, writing the
    /// mandatory bootstrap members immediately.
    pub fn create(root: &Path, urn: Urn) -> Aff4Result<Self> {
        fs::create_dir_all(root)?;
        let mut volume = Self {
            urn,
            root: root.to_path_buf(),
            dirty: false,
        };
        volume.write_bootstrap_members()?;
        Ok(volume)
    }

    /// Opens an existing volume directory. The volume's URN is read back
    /// from `container.description`, written by every `create`.
    pub fn open(root: &Path) -> Aff4Result<Self> {
        let description = fs::read_to_string(root.join("container.description"))?;
        let urn = Urn::new(description.trim().to_string());
        Ok(Self {
            urn,
            root: root.to_path_buf(),
            dirty: false,
        })
    }

    fn member_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn write_bootstrap_members(&mut self) -> Aff4Result<()> {
        self.put_member("container.description", format!("{}\n", self.urn).as_bytes(), false)?;
        let version = format!("major=1\nminor=1\ntool=aff4-rust {}\n", env!("CARGO_PKG_VERSION"));
        self.put_member("version.txt", version.as_bytes(), false)?;
        Ok(())
    }
}

impl Aff4Volume for DirVolume {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn has_member(&self, name: &str) -> bool {
        self.member_path(name).is_file()
    }

    fn member_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.path().is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names
    }

    fn read_member(&mut self, name: &str) -> Aff4Result<Vec<u8>> {
        Ok(fs::read(self.member_path(name))?)
    }

    fn put_member(&mut self, name: &str, data: &[u8], _compress: bool) -> Aff4Result<()> {
        let path = self.member_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        self.dirty = true;
        Ok(())
    }

    fn put_member_streamed(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
        _compress: bool,
    ) -> Aff4Result<()> {
        let path = self.member_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        std::io::copy(reader, &mut file)?;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self, resolver: &Resolver) -> Aff4Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut turtle = Vec::new();
        resolver.dump_to_turtle(&mut turtle, None, false)?;
        self.put_member("information.turtle", &turtle, false)?;
        self.dirty = false;
        Ok(())
    }
}

/// Resolves a member name for `urn` relative to a volume's own URN, the
/// way `ZipVolume` does for archive entries.
pub fn member_name_for(urn: &Urn) -> String {
    urn_to_member_name(urn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_and_reopen_round_trips_members() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol.aff4d");
        let urn = Urn::new("aff4://dir-test-1");

        {
            let mut volume = DirVolume::create(&root, urn.clone()).unwrap();
            volume.put_member("foo/bar.dat", b"hello world", false).unwrap();
            let resolver = Resolver::new();
            volume.flush(&resolver).unwrap();
        }

        let mut reopened = DirVolume::open(&root).unwrap();
        assert_eq!(reopened.urn().as_str(), urn.as_str());
        assert!(reopened.has_member("version.txt"));
        assert!(reopened.has_member("information.turtle"));
        let data = reopened.read_member("foo/bar.dat").unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn streamed_write_matches_buffered_write() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol2.aff4d");
        let mut volume = DirVolume::create(&root, Urn::new("aff4://dir-test-2")).unwrap();

        let payload = vec![7u8; 50_000];
        let mut reader = &payload[..];
        volume
            .put_member_streamed("big.bin", &mut reader, false)
            .unwrap();

        let read_back = volume.read_member("big.bin").unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn member_names_lists_written_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol3.aff4d");
        let mut volume = DirVolume::create(&root, Urn::new("aff4://dir-test-3")).unwrap();
        volume.put_member("extra.dat", b"x", false).unwrap();

        let names = volume.member_names();
        assert!(names.contains(&"extra.dat".to_string()));
        assert!(names.contains(&"version.txt".to_string()));
    }
}
