//! Records stored in the book index.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::serialization::{read_string, string_size, write_string};

/// Book-level metadata captured during the OPF pass. Empty strings mean "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: String,
    pub author: String,
    pub cover_item_href: String,
    pub text_reference_href: String,
}

impl BookMetadata {
    /// Serialized size of the four length-prefixed strings.
    pub fn serialized_size(&self) -> u32 {
        string_size(&self.title)
            + string_size(&self.author)
            + string_size(&self.cover_item_href)
            + string_size(&self.text_reference_href)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_string(out, &self.title)?;
        write_string(out, &self.author)?;
        write_string(out, &self.cover_item_href)?;
        write_string(out, &self.text_reference_href)
    }

    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            title: read_string(input)?,
            author: read_string(input)?,
            cover_item_href: read_string(input)?,
            text_reference_href: read_string(input)?,
        })
    }
}

/// One document in reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpineEntry {
    /// Archive path of the content document, normalised.
    pub href: String,
    /// Inflated bytes of every spine item up to and including this one.
    pub cumulative_size: u32,
    /// Index of the TOC entry covering this item, or -1.
    pub toc_index: i32,
}

impl SpineEntry {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            cumulative_size: 0,
            toc_index: -1,
        }
    }

    pub fn serialized_size(&self) -> u32 {
        string_size(&self.href) + 4 + 4
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_string(out, &self.href)?;
        out.write_u32::<LittleEndian>(self.cumulative_size)?;
        out.write_i32::<LittleEndian>(self.toc_index)
    }

    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            href: read_string(input)?,
            cumulative_size: input.read_u32::<LittleEndian>()?,
            toc_index: input.read_i32::<LittleEndian>()?,
        })
    }
}

impl Default for SpineEntry {
    fn default() -> Self {
        Self::new("")
    }
}

/// One navigation point of the table of contents, flattened with its depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    /// Archive path of the target document, without fragment.
    pub href: String,
    /// Fragment after `#`, possibly empty.
    pub anchor: String,
    /// Nesting depth, 1 for top-level entries.
    pub level: u8,
    /// Position of `href` in the spine, or -1 when it is not a spine item.
    pub spine_index: i32,
}

impl TocEntry {
    pub fn serialized_size(&self) -> u32 {
        string_size(&self.title) + string_size(&self.href) + string_size(&self.anchor) + 1 + 4
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_string(out, &self.title)?;
        write_string(out, &self.href)?;
        write_string(out, &self.anchor)?;
        out.write_u8(self.level)?;
        out.write_i32::<LittleEndian>(self.spine_index)
    }

    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        Ok(Self {
            title: read_string(input)?,
            href: read_string(input)?,
            anchor: read_string(input)?,
            level: input.read_u8()?,
            spine_index: input.read_i32::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn spine_entry_layout() {
        let entry = SpineEntry {
            href: "a.html".into(),
            cumulative_size: 0x0102,
            toc_index: -1,
        };
        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 6 + 4 + 4);
        assert_eq!(&buf[10..14], &[0x02, 0x01, 0, 0]);
        assert_eq!(&buf[14..18], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn metadata_size_matches_bytes_written() {
        let meta = BookMetadata {
            title: "Title".into(),
            author: "Author".into(),
            cover_item_href: String::new(),
            text_reference_href: "OEBPS/ch1.xhtml".into(),
        };
        let mut buf = Vec::new();
        meta.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u32, meta.serialized_size());
        assert_eq!(BookMetadata::read_from(&mut Cursor::new(buf)).unwrap(), meta);
    }

    proptest! {
        #[test]
        fn toc_entry_fields_survive_serialization(
            title in ".{0,40}",
            href in "[a-z/]{0,30}",
            anchor in "[a-z0-9]{0,10}",
            level in 1u8..8,
            spine_index in -1i32..5000,
        ) {
            let entry = TocEntry { title, href, anchor, level, spine_index };
            let mut buf = Vec::new();
            entry.write_to(&mut buf).unwrap();
            prop_assert_eq!(buf.len() as u32, entry.serialized_size());
            let back = TocEntry::read_from(&mut Cursor::new(buf)).unwrap();
            prop_assert_eq!(back, entry);
        }
    }
}
