//! Raw memory helpers
//!
//! Thin utilities over the marshaler: allocate native memory, peek and poke
//! single values at an address plus offset, measure types, and move C
//! strings across the boundary. Buffer-based entry points are
//! bounds-checked; address-based ones are `unsafe` and trust the caller.

use crate::error::{FfiError, FfiResult};
use crate::layout::TypeDesc;
use crate::marshal;
use crate::value::{Buffer, Value};

/// Allocate `size` zeroed bytes of native memory.
pub fn alloc(size: usize) -> Buffer {
    Buffer::alloc(size)
}

/// Native size in bytes of a type descriptor.
pub fn size_of(desc: &TypeDesc) -> usize {
    desc.size()
}

/// Copy host text into a fresh null-terminated native buffer.
pub fn cstring(text: &str) -> Buffer {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    Buffer::from_bytes(&bytes)
}

/// Read a null-terminated C string from a raw address, scanning at most
/// `max_len` bytes. A null address yields `None`.
///
/// # Safety
///
/// A non-null `addr` must be readable up to the terminator or `max_len`
/// bytes, whichever comes first.
pub unsafe fn read_cstring(addr: usize, max_len: Option<usize>) -> Option<String> {
    marshal::read_cstring_raw(addr as *const u8, max_len)
}

/// Read one value of type `desc` from `buffer` at `offset`, bounds-checked.
pub fn read_value(buffer: &Buffer, desc: &TypeDesc, offset: usize) -> FfiResult<Value> {
    let size = desc.size();
    let end = offset.saturating_add(size);
    if end > buffer.len() {
        return Err(FfiError::BufferTooSmall {
            needed: end,
            available: buffer.len(),
        });
    }
    unsafe { read_value_at(buffer.address(), desc, offset) }
}

/// Write one value of type `desc` into `buffer` at `offset`, bounds-checked.
pub fn write_value(buffer: &Buffer, desc: &TypeDesc, offset: usize, value: &Value) -> FfiResult<()> {
    let size = desc.size();
    let mut bytes = vec![0u8; size];
    marshal::write_typed(desc, value, &mut bytes)?;
    buffer.write(offset, &bytes)
}

/// Read one value of type `desc` from a raw address plus offset. A null
/// address yields host null, never an error.
///
/// # Safety
///
/// A non-null `addr + offset` must be readable for `desc.size()` bytes
/// (plus whatever a string scan dereferences).
pub unsafe fn read_value_at(addr: usize, desc: &TypeDesc, offset: usize) -> FfiResult<Value> {
    if addr == 0 {
        return Ok(Value::Null);
    }
    marshal::read_typed(desc, (addr + offset) as *const u8, None)
}

/// Write one value of type `desc` to a raw address plus offset. Writing to
/// a null address fails with [`FfiError::NullPointerDereference`].
///
/// # Safety
///
/// A non-null `addr + offset` must be writable for `desc.size()` bytes.
pub unsafe fn write_value_at(
    addr: usize,
    desc: &TypeDesc,
    offset: usize,
    value: &Value,
) -> FfiResult<()> {
    if addr == 0 {
        return Err(FfiError::NullPointerDereference);
    }
    let size = desc.size();
    let dest = std::slice::from_raw_parts_mut((addr + offset) as *mut u8, size);
    marshal::write_typed(desc, value, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CType;

    #[test]
    fn test_alloc_and_typed_round_trip() {
        let buf = alloc(16);
        write_value(&buf, &TypeDesc::Prim(CType::Int32), 4, &Value::Number(-7.0)).unwrap();
        let back = read_value(&buf, &TypeDesc::Prim(CType::Int32), 4).unwrap();
        assert_eq!(back, Value::Number(-7.0));
    }

    #[test]
    fn test_read_value_bounds() {
        let buf = alloc(4);
        let err = read_value(&buf, &TypeDesc::Prim(CType::Int64), 0).unwrap_err();
        assert!(matches!(err, FfiError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_cstring_round_trip() {
        let buf = cstring("ciao");
        assert_eq!(buf.len(), 5);
        let text = unsafe { read_cstring(buf.address(), None) }.unwrap();
        assert_eq!(text, "ciao");
    }

    #[test]
    fn test_read_cstring_null_address() {
        assert_eq!(unsafe { read_cstring(0, None) }, None);
    }

    #[test]
    fn test_write_to_null_address_fails() {
        let err = unsafe {
            write_value_at(0, &TypeDesc::Prim(CType::Int32), 0, &Value::Number(1.0))
        }
        .unwrap_err();
        assert_eq!(err, FfiError::NullPointerDereference);
    }

    #[test]
    fn test_read_from_null_address_is_null() {
        let back = unsafe { read_value_at(0, &TypeDesc::Prim(CType::Int32), 0) }.unwrap();
        assert_eq!(back, Value::Null);
    }

    #[test]
    fn test_size_of() {
        assert_eq!(size_of(&TypeDesc::Prim(CType::Double)), 8);
    }
}
