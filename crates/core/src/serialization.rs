//! Little-endian record primitives shared by the book index and section caches.
//!
//! Strings are stored as a `u32` byte length followed by the UTF-8 bytes.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Bytes taken by the length prefix of a serialized string.
pub const STRING_PREFIX_SIZE: u32 = 4;

pub fn write_string<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long for record"))?;
    out.write_u32::<LittleEndian>(len)?;
    out.write_all(value.as_bytes())
}

pub fn read_string<R: Read>(input: &mut R) -> io::Result<String> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serialized size of `value` including its length prefix.
pub fn string_size(value: &str) -> u32 {
    STRING_PREFIX_SIZE + value.len() as u32
}

pub fn write_bool<W: Write>(out: &mut W, value: bool) -> io::Result<()> {
    out.write_u8(u8::from(value))
}

pub fn read_bool<R: Read>(input: &mut R) -> io::Result<bool> {
    Ok(input.read_u8()? != 0)
}
