//! Read access to the EPUB's ZIP container.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::ArchiveError;
use crate::path::normalise_path;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// An opened EPUB archive. Entry names are normalised before lookup, so
/// `OEBPS/text/../ch1.html` finds `OEBPS/ch1.html`.
pub struct EpubArchive {
    path: PathBuf,
    zip: zip::ZipArchive<BufReader<File>>,
}

impl EpubArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|e| ArchiveError::Open {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        let zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::Open {
            path: path.display().to_string(),
            detail: format!("Invalid ZIP archive: {e}"),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index_of(&self, name: &str) -> Result<usize, ArchiveError> {
        let name = normalise_path(name);
        self.zip
            .index_for_name(&name)
            .ok_or(ArchiveError::MissingEntry(name))
    }

    /// Uncompressed size from the central directory, without inflating.
    pub fn inflated_size(&mut self, name: &str) -> Result<u64, ArchiveError> {
        let index = self.index_of(name)?;
        let entry = self.zip.by_index_raw(index).map_err(|e| ArchiveError::Read {
            path: name.to_string(),
            detail: e.to_string(),
        })?;
        Ok(entry.size())
    }

    /// Sizes of every file entry, keyed by entry name. Directories are skipped.
    pub fn entry_sizes(&mut self) -> Result<HashMap<String, u64>, ArchiveError> {
        let mut sizes = HashMap::with_capacity(self.zip.len());
        for i in 0..self.zip.len() {
            let entry = self.zip.by_index_raw(i).map_err(|e| ArchiveError::Read {
                path: format!("#{i}"),
                detail: e.to_string(),
            })?;
            if entry.is_dir() {
                continue;
            }
            sizes.insert(entry.name().to_string(), entry.size());
        }
        Ok(sizes)
    }

    pub fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let index = self.index_of(name)?;
        let mut entry = self.zip.by_index(index).map_err(|e| ArchiveError::Read {
            path: name.to_string(),
            detail: e.to_string(),
        })?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).map_err(|e| ArchiveError::Read {
            path: name.to_string(),
            detail: e.to_string(),
        })?;
        Ok(buf)
    }

    /// Inflate `name` into `out` in chunks of `chunk_size` bytes. A sink that
    /// accepts fewer bytes than offered aborts the stream.
    pub fn stream_to<W: Write>(
        &mut self,
        name: &str,
        out: &mut W,
        chunk_size: usize,
    ) -> Result<u64, ArchiveError> {
        let index = self.index_of(name)?;
        let mut entry = self.zip.by_index(index).map_err(|e| ArchiveError::Read {
            path: name.to_string(),
            detail: e.to_string(),
        })?;

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = entry.read(&mut buf).map_err(|e| ArchiveError::Read {
                path: name.to_string(),
                detail: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).map_err(|e| ArchiveError::Read {
                path: name.to_string(),
                detail: format!("sink rejected data: {e}"),
            })?;
            total += n as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_epub, FixtureBook};

    #[test]
    fn test_sizes_and_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        write_epub(&path, &FixtureBook::default());
        let mut archive = EpubArchive::open(&path).unwrap();

        let sizes = archive.entry_sizes().unwrap();
        let ch1 = sizes["OEBPS/text/ch1.xhtml"];
        assert_eq!(archive.inflated_size("OEBPS/text/../text/ch1.xhtml").unwrap(), ch1);

        let mut out = Vec::new();
        let streamed = archive.stream_to("OEBPS/text/ch1.xhtml", &mut out, 7).unwrap();
        assert_eq!(streamed, ch1);
        assert_eq!(out, archive.read_bytes("OEBPS/text/ch1.xhtml").unwrap());
    }

    #[test]
    fn test_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");
        write_epub(&path, &FixtureBook::default());
        let mut archive = EpubArchive::open(&path).unwrap();
        assert!(matches!(
            archive.inflated_size("nope.html"),
            Err(ArchiveError::MissingEntry(name)) if name == "nope.html"
        ));
    }

    #[test]
    fn test_open_rejects_non_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.epub");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(EpubArchive::open(&path), Err(ArchiveError::Open { .. })));
    }
}
