// Helper functions for reading JDWP data types from buffers
//
// Every reader checks the remaining length first; a short buffer is a
// malformed payload, never a panic.

use crate::protocol::CodecError;
use crate::types::Location;
use bytes::Buf;

fn need(buf: &&[u8], n: usize, what: &str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Malformed(format!(
            "Not enough data for {}: need {}, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 4, "string length")?;
    let len = buf.get_u32() as usize;
    need(buf, len, "string")?;

    let bytes = &buf[..len];
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|e| CodecError::Malformed(format!("Invalid UTF-8 in string: {}", e)))?;
    buf.advance(len);
    Ok(s)
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

/// Read a u16
pub fn read_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    need(buf, 2, "u16")?;
    Ok(buf.get_u16())
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> Result<i32, CodecError> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

/// Read a i64
pub fn read_i64(buf: &mut &[u8]) -> Result<i64, CodecError> {
    need(buf, 8, "i64")?;
    Ok(buf.get_i64())
}

/// Read a location (type tag, class id, method id, index)
pub fn read_location(buf: &mut &[u8]) -> Result<Location, CodecError> {
    let type_tag = read_u8(buf)?;
    let class_id = read_u64(buf)?;
    let method_id = read_u64(buf)?;
    let index = read_u64(buf)?;

    Ok(Location {
        type_tag,
        class_id,
        method_id,
        index,
    })
}

/// Read a count prefix and reject negative values
pub fn read_count(buf: &mut &[u8]) -> Result<usize, CodecError> {
    let count = read_i32(buf)?;
    usize::try_from(count)
        .map_err(|_| CodecError::Malformed(format!("Negative element count: {}", count)))
}
