//! Saved reading position (`progress.bin` in the book's cache directory).
//!
//! Six bytes, little-endian: spine index, page, page count of the chapter
//! when the position was saved. Older four-byte files without the page
//! count are still read.

use std::fs;
use std::io::{self, Cursor};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

pub const PROGRESS_FILE: &str = "progress.bin";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadingPosition {
    pub spine_index: u16,
    pub page: u16,
    /// 0 when unknown.
    pub page_count: u16,
}

impl ReadingPosition {
    /// `Ok(None)` when nothing has been saved yet.
    pub fn load(cache_dir: &Path) -> io::Result<Option<Self>> {
        let bytes = match fs::read(cache_dir.join(PROGRESS_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut input = Cursor::new(bytes.as_slice());
        match bytes.len() {
            6 => Ok(Some(Self {
                spine_index: input.read_u16::<LittleEndian>()?,
                page: input.read_u16::<LittleEndian>()?,
                page_count: input.read_u16::<LittleEndian>()?,
            })),
            4 => Ok(Some(Self {
                spine_index: input.read_u16::<LittleEndian>()?,
                page: input.read_u16::<LittleEndian>()?,
                page_count: 0,
            })),
            n => {
                tracing::warn!("Ignoring {PROGRESS_FILE} of unexpected size {n}");
                Ok(None)
            }
        }
    }

    pub fn save(&self, cache_dir: &Path) -> io::Result<()> {
        let mut out = Vec::with_capacity(6);
        out.write_u16::<LittleEndian>(self.spine_index)?;
        out.write_u16::<LittleEndian>(self.page)?;
        out.write_u16::<LittleEndian>(self.page_count)?;
        fs::create_dir_all(cache_dir)?;
        fs::write(cache_dir.join(PROGRESS_FILE), out)
    }

    /// Page to open when the chapter now has `new_count` pages. The saved page
    /// keeps its relative place in the chapter if the count changed.
    pub fn page_for(&self, new_count: u16) -> u16 {
        if new_count == 0 {
            return 0;
        }
        let page = if self.page_count > 0 && self.page_count != new_count {
            let fraction = f32::from(self.page) / f32::from(self.page_count);
            (fraction * f32::from(new_count)) as u16
        } else {
            self.page
        };
        page.min(new_count - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ReadingPosition::load(dir.path()).unwrap(), None);

        let pos = ReadingPosition {
            spine_index: 3,
            page: 7,
            page_count: 20,
        };
        pos.save(dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join(PROGRESS_FILE)).unwrap().len(), 6);
        assert_eq!(ReadingPosition::load(dir.path()).unwrap(), Some(pos));
    }

    #[test]
    fn test_legacy_four_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROGRESS_FILE), [2, 0, 5, 0]).unwrap();
        let pos = ReadingPosition::load(dir.path()).unwrap().unwrap();
        assert_eq!((pos.spine_index, pos.page, pos.page_count), (2, 5, 0));
        assert_eq!(pos.page_for(40), 5);
    }

    #[test]
    fn test_page_rescales_with_new_count() {
        let pos = ReadingPosition {
            spine_index: 0,
            page: 10,
            page_count: 20,
        };
        assert_eq!(pos.page_for(40), 20);
        assert_eq!(pos.page_for(20), 10);
        assert_eq!(pos.page_for(5), 2);
        assert_eq!(pos.page_for(0), 0);

        let past_end = ReadingPosition {
            spine_index: 0,
            page: 30,
            page_count: 0,
        };
        assert_eq!(past_end.page_for(12), 11);
    }
}
