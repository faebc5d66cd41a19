//! Value marshaling: host values ⇄ native byte representations
//!
//! Bidirectional conversion parametrized by type descriptor:
//! - primitives are fixed-width copies in native byte order; truncating
//!   numeric conversions are the caller's responsibility
//! - C strings are null-terminated copies into call-owned scratch on write,
//!   bounded null-terminated scans on read
//! - wide strings re-encode between host UTF-8 and the platform wchar width
//! - pointers accept null, a buffer's backing address, or an explicit
//!   address value; a null native pointer always reads back as host null
//! - composites delegate to the layout engine's offsets; unspecified record
//!   fields are left zero-filled
//!
//! [`CallScratch`] owns the per-call argument slots, string bytes and
//! composite overflow buffers. String pointers are recorded as
//! `(argument, offset)` fixups and resolved against the scratch's final
//! address in one pass, so the storage can be moved into an async worker
//! before any pointer is materialized.

use crate::error::{FfiError, FfiResult};
use crate::layout::{ArrayLayout, StructLayout, TypeDesc};
use crate::types::{CType, LONG_SIZE, POINTER_SIZE, WCHAR_SIZE};
use crate::value::{Buffer, Value};
use std::collections::HashMap;
use std::ffi::c_void;

/// One argument slot: large enough for any primitive and for small
/// composites passed by value.
pub(crate) const ARG_SLOT_SIZE: usize = 16;

/// Calls with at most this many arguments marshal into fixed-size inline
/// storage; larger counts fall back to a growable buffer.
pub(crate) const MAX_INLINE_ARGS: usize = 16;

// ---------------------------------------------------------------------------
// Primitive writes
// ---------------------------------------------------------------------------

/// Reconstruct a native address from a host value.
///
/// Null converts to the null pointer; buffers contribute their backing
/// address; big integers are checked for precision loss.
pub fn pointer_from_value(value: &Value) -> FfiResult<usize> {
    match value {
        Value::Null => Ok(0),
        Value::Buffer(buf) => Ok(buf.address()),
        Value::BigInt(b) => {
            if *b < 0 || *b > usize::MAX as i128 {
                Err(FfiError::PrecisionLoss(*b))
            } else {
                Ok(*b as usize)
            }
        }
        Value::Number(n) => Ok(*n as i64 as usize),
        other => Err(FfiError::invalid_value("pointer", other.type_name())),
    }
}

/// Write a primitive host value into `dest` in native representation.
///
/// String *text* is not handled here: a `Value::Str` for a C-string slot
/// needs call-owned backing storage, which is [`CallScratch`]'s job. A
/// buffer or null is accepted directly.
pub fn write_primitive(value: &Value, ty: CType, dest: &mut [u8]) -> FfiResult<()> {
    let size = ty.size();
    if dest.len() < size {
        return Err(FfiError::BufferTooSmall {
            needed: size,
            available: dest.len(),
        });
    }

    fn int_of(value: &Value, ty: CType) -> FfiResult<i128> {
        value
            .as_i128()
            .ok_or_else(|| FfiError::invalid_value(ty.name(), value.type_name()))
    }

    match ty {
        CType::Void => {}
        CType::Int8 => dest[..1].copy_from_slice(&(int_of(value, ty)? as i8).to_ne_bytes()),
        CType::UInt8 => dest[..1].copy_from_slice(&(int_of(value, ty)? as u8).to_ne_bytes()),
        CType::Int16 => dest[..2].copy_from_slice(&(int_of(value, ty)? as i16).to_ne_bytes()),
        CType::UInt16 => dest[..2].copy_from_slice(&(int_of(value, ty)? as u16).to_ne_bytes()),
        CType::Int32 => dest[..4].copy_from_slice(&(int_of(value, ty)? as i32).to_ne_bytes()),
        CType::UInt32 => dest[..4].copy_from_slice(&(int_of(value, ty)? as u32).to_ne_bytes()),
        CType::Int64 => dest[..8].copy_from_slice(&(int_of(value, ty)? as i64).to_ne_bytes()),
        CType::UInt64 => dest[..8].copy_from_slice(&(int_of(value, ty)? as u64).to_ne_bytes()),
        CType::Float => {
            let v = value
                .as_f64()
                .ok_or_else(|| FfiError::invalid_value("float", value.type_name()))?;
            dest[..4].copy_from_slice(&(v as f32).to_ne_bytes());
        }
        CType::Double => {
            let v = value
                .as_f64()
                .ok_or_else(|| FfiError::invalid_value("double", value.type_name()))?;
            dest[..8].copy_from_slice(&v.to_ne_bytes());
        }
        CType::Bool => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => *n != 0.0,
                Value::BigInt(b) => *b != 0,
                Value::Null => false,
                other => return Err(FfiError::invalid_value("bool", other.type_name())),
            };
            dest[0] = truthy as u8;
        }
        CType::WChar => {
            let code: u32 = match value {
                Value::Number(n) => *n as u32,
                Value::BigInt(b) => *b as u32,
                Value::Str(s) => s.encode_utf16().next().unwrap_or(0) as u32,
                other => return Err(FfiError::invalid_value("wchar", other.type_name())),
            };
            if WCHAR_SIZE == 2 {
                dest[..2].copy_from_slice(&(code as u16).to_ne_bytes());
            } else {
                dest[..4].copy_from_slice(&code.to_ne_bytes());
            }
        }
        CType::Long => {
            let v = int_of(value, ty)?;
            if LONG_SIZE == 8 {
                dest[..8].copy_from_slice(&(v as i64).to_ne_bytes());
            } else {
                dest[..4].copy_from_slice(&(v as i32).to_ne_bytes());
            }
        }
        CType::ULong => {
            let v = int_of(value, ty)?;
            if LONG_SIZE == 8 {
                dest[..8].copy_from_slice(&(v as u64).to_ne_bytes());
            } else {
                dest[..4].copy_from_slice(&(v as u32).to_ne_bytes());
            }
        }
        CType::Size => {
            let v = int_of(value, ty)? as usize;
            dest[..POINTER_SIZE].copy_from_slice(&v.to_ne_bytes());
        }
        CType::SSize => {
            let v = int_of(value, ty)? as isize;
            dest[..POINTER_SIZE].copy_from_slice(&v.to_ne_bytes());
        }
        CType::Pointer => {
            let addr = pointer_from_value(value)?;
            dest[..POINTER_SIZE].copy_from_slice(&addr.to_ne_bytes());
        }
        CType::CString | CType::WString => {
            let addr = match value {
                Value::Null => 0,
                Value::Buffer(buf) => buf.address(),
                other => {
                    return Err(FfiError::invalid_value(
                        "string buffer or null (text needs call scratch)",
                        other.type_name(),
                    ))
                }
            };
            dest[..POINTER_SIZE].copy_from_slice(&addr.to_ne_bytes());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Primitive reads
// ---------------------------------------------------------------------------

/// Bounded null-terminated scan of a native C string.
///
/// # Safety
///
/// `ptr`, when non-null, must be readable up to the terminator or `max`
/// bytes, whichever comes first.
pub unsafe fn read_cstring_raw(ptr: *const u8, max: Option<usize>) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let limit = max.unwrap_or(usize::MAX);
    let mut len = 0usize;
    while len < limit && *ptr.add(len) != 0 {
        len += 1;
    }
    let bytes = std::slice::from_raw_parts(ptr, len);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Bounded null-terminated scan of a native wide string, re-encoded to
/// host text.
///
/// # Safety
///
/// Same contract as [`read_cstring_raw`], in units of `wchar_t`.
pub unsafe fn read_wstring_raw(ptr: *const u8, max: Option<usize>) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let limit = max.unwrap_or(usize::MAX);
    if WCHAR_SIZE == 2 {
        let wide = ptr as *const u16;
        let mut len = 0usize;
        while len < limit && *wide.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(wide, len);
        Some(String::from_utf16_lossy(units))
    } else {
        let wide = ptr as *const u32;
        let mut len = 0usize;
        while len < limit && *wide.add(len) != 0 {
            len += 1;
        }
        let units = std::slice::from_raw_parts(wide, len);
        Some(
            units
                .iter()
                .map(|&c| char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        )
    }
}

/// Read a primitive value from native memory.
///
/// # Safety
///
/// `ptr` must be readable for `ty.size()` bytes; string types additionally
/// follow the stored pointer, bounded by `max_scan`.
pub unsafe fn read_primitive_raw(
    ptr: *const u8,
    ty: CType,
    max_scan: Option<usize>,
) -> FfiResult<Value> {
    fn load<const N: usize>(ptr: *const u8) -> [u8; N] {
        let mut out = [0u8; N];
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), N) };
        out
    }

    let value = match ty {
        CType::Void => Value::Null,
        CType::Int8 => Value::Number(i8::from_ne_bytes(load::<1>(ptr)) as f64),
        CType::UInt8 => Value::Number(u8::from_ne_bytes(load::<1>(ptr)) as f64),
        CType::Int16 => Value::Number(i16::from_ne_bytes(load::<2>(ptr)) as f64),
        CType::UInt16 => Value::Number(u16::from_ne_bytes(load::<2>(ptr)) as f64),
        CType::Int32 => Value::Number(i32::from_ne_bytes(load::<4>(ptr)) as f64),
        CType::UInt32 => Value::Number(u32::from_ne_bytes(load::<4>(ptr)) as f64),
        CType::Int64 => Value::BigInt(i64::from_ne_bytes(load::<8>(ptr)) as i128),
        CType::UInt64 => Value::BigInt(u64::from_ne_bytes(load::<8>(ptr)) as i128),
        CType::Float => Value::Number(f32::from_ne_bytes(load::<4>(ptr)) as f64),
        CType::Double => Value::Number(f64::from_ne_bytes(load::<8>(ptr))),
        CType::Bool => Value::Bool(u8::from_ne_bytes(load::<1>(ptr)) != 0),
        CType::WChar => {
            let code = if WCHAR_SIZE == 2 {
                u16::from_ne_bytes(load::<2>(ptr)) as u32
            } else {
                u32::from_ne_bytes(load::<4>(ptr))
            };
            Value::Number(code as f64)
        }
        CType::Long => {
            if LONG_SIZE == 8 {
                Value::BigInt(i64::from_ne_bytes(load::<8>(ptr)) as i128)
            } else {
                Value::Number(i32::from_ne_bytes(load::<4>(ptr)) as f64)
            }
        }
        CType::ULong => {
            if LONG_SIZE == 8 {
                Value::BigInt(u64::from_ne_bytes(load::<8>(ptr)) as i128)
            } else {
                Value::Number(u32::from_ne_bytes(load::<4>(ptr)) as f64)
            }
        }
        CType::Size => {
            let v = usize::from_ne_bytes(load::<POINTER_SIZE>(ptr));
            Value::BigInt(v as i128)
        }
        CType::SSize => {
            let v = isize::from_ne_bytes(load::<POINTER_SIZE>(ptr));
            Value::BigInt(v as i128)
        }
        CType::Pointer => {
            let addr = usize::from_ne_bytes(load::<POINTER_SIZE>(ptr));
            if addr == 0 {
                Value::Null
            } else {
                Value::BigInt(addr as i128)
            }
        }
        CType::CString => {
            let addr = usize::from_ne_bytes(load::<POINTER_SIZE>(ptr));
            match read_cstring_raw(addr as *const u8, max_scan) {
                Some(s) => Value::string(s),
                None => Value::Null,
            }
        }
        CType::WString => {
            let addr = usize::from_ne_bytes(load::<POINTER_SIZE>(ptr));
            match read_wstring_raw(addr as *const u8, max_scan) {
                Some(s) => Value::string(s),
                None => Value::Null,
            }
        }
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// Composite conversion
// ---------------------------------------------------------------------------

/// Encode a host record (or raw buffer) into struct bytes.
///
/// Unspecified fields are left zero-filled; anonymous nested structs take
/// their sub-fields directly from the parent record.
pub fn write_struct(layout: &StructLayout, value: &Value, dest: &mut [u8]) -> FfiResult<()> {
    let size = layout.size();
    if dest.len() < size {
        return Err(FfiError::BufferTooSmall {
            needed: size,
            available: dest.len(),
        });
    }
    dest[..size].fill(0);

    match value {
        Value::Buffer(buf) => {
            if buf.len() < size {
                return Err(FfiError::BufferTooSmall {
                    needed: size,
                    available: buf.len(),
                });
            }
            buf.read(0, &mut dest[..size])?;
            Ok(())
        }
        Value::Record(record) => write_struct_fields(layout, record, dest),
        other => Err(FfiError::invalid_value(
            if layout.is_union() { "union record" } else { "struct record" },
            other.type_name(),
        )),
    }
}

fn write_struct_fields(
    layout: &StructLayout,
    record: &HashMap<String, Value>,
    dest: &mut [u8],
) -> FfiResult<()> {
    for field in layout.fields() {
        let slot = &mut dest[field.offset..field.offset + field.size];
        if field.anonymous {
            if let TypeDesc::Struct(nested) = &field.desc {
                // Promoted sub-fields live directly on the parent record.
                write_struct_fields(nested, record, slot)?;
            }
            continue;
        }
        let Some(value) = record.get(&field.name) else {
            continue; // optional field, stays zero
        };
        match &field.desc {
            TypeDesc::Prim(ty) => write_primitive(value, *ty, slot)?,
            TypeDesc::Struct(nested) => write_struct(nested, value, slot)?,
            TypeDesc::Array(nested) => write_array(nested, value, slot)?,
        }
    }
    Ok(())
}

/// Encode a host array (or buffer, or string for char arrays) into fixed
/// array bytes. Missing trailing elements stay zero-filled.
pub fn write_array(layout: &ArrayLayout, value: &Value, dest: &mut [u8]) -> FfiResult<()> {
    let size = layout.size();
    if dest.len() < size {
        return Err(FfiError::BufferTooSmall {
            needed: size,
            available: dest.len(),
        });
    }
    dest[..size].fill(0);

    match value {
        Value::Array(items) => {
            let count = items.len().min(layout.len());
            let elem_size = layout.element_size();
            for (i, item) in items.iter().take(count).enumerate() {
                let slot = &mut dest[i * elem_size..(i + 1) * elem_size];
                match layout.element() {
                    TypeDesc::Prim(ty) => write_primitive(item, *ty, slot)?,
                    TypeDesc::Struct(nested) => write_struct(nested, item, slot)?,
                    TypeDesc::Array(nested) => write_array(nested, item, slot)?,
                }
            }
            Ok(())
        }
        Value::Buffer(buf) => {
            let copy = buf.len().min(size);
            let mut bytes = vec![0u8; copy];
            buf.read(0, &mut bytes)?;
            dest[..copy].copy_from_slice(&bytes);
            Ok(())
        }
        Value::Str(s) if matches!(layout.element(), TypeDesc::Prim(CType::Int8 | CType::UInt8)) => {
            // char array: copy the text and keep room for the terminator
            let bytes = s.as_bytes();
            let copy = bytes.len().min(size.saturating_sub(1));
            dest[..copy].copy_from_slice(&bytes[..copy]);
            Ok(())
        }
        other => Err(FfiError::invalid_value("array", other.type_name())),
    }
}

/// Decode struct bytes into a host record, promoting anonymous sub-fields.
///
/// # Safety
///
/// `ptr` must be readable for `layout.size()` bytes.
pub unsafe fn read_struct_raw(layout: &StructLayout, ptr: *const u8) -> FfiResult<Value> {
    let mut record = HashMap::with_capacity(layout.fields().len());
    read_struct_into(layout, ptr, &mut record)?;
    Ok(Value::Record(record))
}

unsafe fn read_struct_into(
    layout: &StructLayout,
    ptr: *const u8,
    record: &mut HashMap<String, Value>,
) -> FfiResult<()> {
    for field in layout.fields() {
        let field_ptr = ptr.add(field.offset);
        match &field.desc {
            TypeDesc::Struct(nested) if field.anonymous => {
                read_struct_into(nested, field_ptr, record)?;
            }
            TypeDesc::Struct(nested) => {
                record.insert(field.name.clone(), read_struct_raw(nested, field_ptr)?);
            }
            TypeDesc::Array(nested) => {
                record.insert(field.name.clone(), read_array_raw(nested, field_ptr)?);
            }
            TypeDesc::Prim(ty) => {
                record.insert(field.name.clone(), read_primitive_raw(field_ptr, *ty, None)?);
            }
        }
    }
    Ok(())
}

/// Decode fixed-array bytes into a host array.
///
/// # Safety
///
/// `ptr` must be readable for `layout.size()` bytes.
pub unsafe fn read_array_raw(layout: &ArrayLayout, ptr: *const u8) -> FfiResult<Value> {
    let mut items = Vec::with_capacity(layout.len());
    let elem_size = layout.element_size();
    for i in 0..layout.len() {
        let elem_ptr = ptr.add(i * elem_size);
        let value = match layout.element() {
            TypeDesc::Prim(ty) => read_primitive_raw(elem_ptr, *ty, None)?,
            TypeDesc::Struct(nested) => read_struct_raw(nested, elem_ptr)?,
            TypeDesc::Array(nested) => read_array_raw(nested, elem_ptr)?,
        };
        items.push(value);
    }
    Ok(Value::Array(items))
}

/// Read any type descriptor from native memory.
///
/// # Safety
///
/// `ptr` must be readable for `desc.size()` bytes (plus whatever a string
/// scan dereferences, bounded by `max_scan`).
pub unsafe fn read_typed(
    desc: &TypeDesc,
    ptr: *const u8,
    max_scan: Option<usize>,
) -> FfiResult<Value> {
    match desc {
        TypeDesc::Prim(ty) => read_primitive_raw(ptr, *ty, max_scan),
        TypeDesc::Struct(layout) => read_struct_raw(layout, ptr),
        TypeDesc::Array(layout) => read_array_raw(layout, ptr),
    }
}

/// Write any type descriptor into a byte destination.
pub fn write_typed(desc: &TypeDesc, value: &Value, dest: &mut [u8]) -> FfiResult<()> {
    match desc {
        TypeDesc::Prim(ty) => write_primitive(value, *ty, dest),
        TypeDesc::Struct(layout) => write_struct(layout, value, dest),
        TypeDesc::Array(layout) => write_array(layout, value, dest),
    }
}

// ---------------------------------------------------------------------------
// Per-call scratch storage
// ---------------------------------------------------------------------------

/// A deferred string-pointer write: argument slot `arg` receives the
/// address of scratch text at `text_offset` once the storage has reached
/// its final address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fixup {
    pub arg: usize,
    pub text_offset: usize,
}

enum SlotStorage {
    Inline([u8; MAX_INLINE_ARGS * ARG_SLOT_SIZE]),
    Heap(Vec<u8>),
}

impl SlotStorage {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            SlotStorage::Inline(bytes) => &mut bytes[..],
            SlotStorage::Heap(bytes) => &mut bytes[..],
        }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            SlotStorage::Inline(bytes) => bytes.as_mut_ptr(),
            SlotStorage::Heap(bytes) => bytes.as_mut_ptr(),
        }
    }
}

/// Scratch memory owned by one call (sync) or one pending async call.
///
/// Holds the argument slots, the string/wide-string text bytes, overflow
/// buffers for composites larger than a slot, and the pinned host buffers
/// whose raw addresses were written into slots. Nothing in here is
/// addressable by native code until [`CallScratch::resolve`] runs.
pub(crate) struct CallScratch {
    slots: SlotStorage,
    argc: usize,
    text: Vec<u8>,
    fixups: Vec<Fixup>,
    overflow: Vec<Vec<u8>>,
    overflow_args: Vec<usize>,
    /// Host buffers whose raw addresses were handed out; the clones keep
    /// the allocations alive for the scratch's lifetime.
    _pinned: Vec<Buffer>,
}

impl CallScratch {
    pub(crate) fn new(argc: usize) -> Self {
        let slots = if argc <= MAX_INLINE_ARGS {
            SlotStorage::Inline([0u8; MAX_INLINE_ARGS * ARG_SLOT_SIZE])
        } else {
            SlotStorage::Heap(vec![0u8; argc * ARG_SLOT_SIZE])
        };
        CallScratch {
            slots,
            argc,
            text: Vec::new(),
            fixups: Vec::new(),
            overflow: Vec::new(),
            overflow_args: Vec::new(),
            _pinned: Vec::new(),
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * ARG_SLOT_SIZE;
        &mut self.slots.as_mut_slice()[start..start + ARG_SLOT_SIZE]
    }

    /// Append text bytes (already encoded, terminator included), padded to
    /// `align`, returning their offset for a later fixup.
    fn push_text(&mut self, bytes: &[u8], align: usize) -> usize {
        let offset = self.text.len().div_ceil(align) * align;
        self.text.resize(offset, 0);
        self.text.extend_from_slice(bytes);
        offset
    }

    /// Marshal one argument into its slot.
    ///
    /// String text goes into the text scratch with a recorded fixup;
    /// composites larger than a slot go into an overflow buffer; host
    /// buffers handed out as raw pointers are pinned for the scratch's
    /// lifetime.
    pub(crate) fn marshal_arg(
        &mut self,
        index: usize,
        value: &Value,
        desc: &TypeDesc,
    ) -> FfiResult<()> {
        match desc {
            TypeDesc::Prim(CType::CString) => {
                if let Value::Str(s) = value {
                    let mut bytes = Vec::with_capacity(s.len() + 1);
                    bytes.extend_from_slice(s.as_bytes());
                    bytes.push(0);
                    let offset = self.push_text(&bytes, 1);
                    self.fixups.push(Fixup {
                        arg: index,
                        text_offset: offset,
                    });
                    return Ok(());
                }
                self.pin_if_buffer(value);
                write_primitive(value, CType::CString, self.slot_mut(index))
            }
            TypeDesc::Prim(CType::WString) => {
                if let Value::Str(s) = value {
                    let mut bytes = Vec::new();
                    if WCHAR_SIZE == 2 {
                        for unit in s.encode_utf16() {
                            bytes.extend_from_slice(&unit.to_ne_bytes());
                        }
                        bytes.extend_from_slice(&0u16.to_ne_bytes());
                    } else {
                        for ch in s.chars() {
                            bytes.extend_from_slice(&(ch as u32).to_ne_bytes());
                        }
                        bytes.extend_from_slice(&0u32.to_ne_bytes());
                    }
                    let offset = self.push_text(&bytes, WCHAR_SIZE);
                    self.fixups.push(Fixup {
                        arg: index,
                        text_offset: offset,
                    });
                    return Ok(());
                }
                self.pin_if_buffer(value);
                write_primitive(value, CType::WString, self.slot_mut(index))
            }
            TypeDesc::Prim(ty) => {
                self.pin_if_buffer(value);
                write_primitive(value, *ty, self.slot_mut(index))
            }
            TypeDesc::Struct(_) | TypeDesc::Array(_) => {
                let size = desc.size();
                if size <= ARG_SLOT_SIZE {
                    write_typed(desc, value, self.slot_mut(index))
                } else {
                    let mut bytes = vec![0u8; size];
                    write_typed(desc, value, &mut bytes)?;
                    self.overflow.push(bytes);
                    self.overflow_args.push(index);
                    Ok(())
                }
            }
        }
    }

    fn pin_if_buffer(&mut self, value: &Value) {
        if let Value::Buffer(buf) = value {
            self._pinned.push(buf.clone());
        }
    }

    /// Resolve every internal pointer against the storage's final address
    /// and return the libffi argument vector.
    ///
    /// Must be called after all marshaling — and, for an async call, after
    /// the scratch has been moved into its final owner — since slot and
    /// text addresses are only stable from this point on.
    pub(crate) fn resolve(&mut self) -> Vec<*mut c_void> {
        let base = self.slots.as_mut_ptr();
        let mut avalues: Vec<*mut c_void> = (0..self.argc)
            .map(|i| unsafe { base.add(i * ARG_SLOT_SIZE) } as *mut c_void)
            .collect();

        // Oversized composites live in their overflow buffers.
        for (buf, &arg) in self.overflow.iter_mut().zip(&self.overflow_args) {
            avalues[arg] = buf.as_mut_ptr() as *mut c_void;
        }

        // String pointers into the text scratch.
        let text_base = self.text.as_ptr();
        for fixup in &self.fixups {
            let addr = unsafe { text_base.add(fixup.text_offset) } as usize;
            let slot = unsafe { base.add(fixup.arg * ARG_SLOT_SIZE) };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    addr.to_ne_bytes().as_ptr(),
                    slot,
                    POINTER_SIZE,
                )
            };
        }

        avalues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_read_int32() {
        let mut buf = [0u8; 4];
        write_primitive(&Value::Number(-42.0), CType::Int32, &mut buf).unwrap();
        let back = unsafe { read_primitive_raw(buf.as_ptr(), CType::Int32, None) }.unwrap();
        assert_eq!(back, Value::Number(-42.0));
    }

    #[test]
    fn test_write_truncates_silently() {
        let mut buf = [0u8; 1];
        write_primitive(&Value::Number(300.0), CType::UInt8, &mut buf).unwrap();
        assert_eq!(buf[0], 300u32 as u8);
    }

    #[test]
    fn test_write_int64_from_bigint() {
        let mut buf = [0u8; 8];
        write_primitive(&Value::BigInt(i64::MAX as i128), CType::Int64, &mut buf).unwrap();
        let back = unsafe { read_primitive_raw(buf.as_ptr(), CType::Int64, None) }.unwrap();
        assert_eq!(back, Value::BigInt(i64::MAX as i128));
    }

    #[test]
    fn test_uint64_round_trips_through_bigint() {
        let mut buf = [0u8; 8];
        write_primitive(&Value::BigInt(u64::MAX as i128), CType::UInt64, &mut buf).unwrap();
        let back = unsafe { read_primitive_raw(buf.as_ptr(), CType::UInt64, None) }.unwrap();
        assert_eq!(back, Value::BigInt(u64::MAX as i128));
    }

    #[test]
    fn test_write_wrong_shape() {
        let mut buf = [0u8; 4];
        let err = write_primitive(&Value::string("x"), CType::Int32, &mut buf).unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgumentValue { .. }));
    }

    #[test]
    fn test_dest_too_small() {
        let mut buf = [0u8; 2];
        let err = write_primitive(&Value::Number(1.0), CType::Int32, &mut buf).unwrap_err();
        assert!(matches!(err, FfiError::BufferTooSmall { needed: 4, available: 2 }));
    }

    #[test]
    fn test_null_pointer_reads_as_null() {
        let buf = [0u8; POINTER_SIZE];
        let back = unsafe { read_primitive_raw(buf.as_ptr(), CType::Pointer, None) }.unwrap();
        assert_eq!(back, Value::Null);
    }

    #[test]
    fn test_pointer_from_buffer() {
        let native = Buffer::alloc(8);
        assert_eq!(
            pointer_from_value(&Value::Buffer(native.clone())).unwrap(),
            native.address()
        );
    }

    #[test]
    fn test_pointer_precision_loss() {
        let too_big = (usize::MAX as i128) + 1;
        assert_eq!(
            pointer_from_value(&Value::BigInt(too_big)),
            Err(FfiError::PrecisionLoss(too_big))
        );
        assert_eq!(
            pointer_from_value(&Value::BigInt(-1)),
            Err(FfiError::PrecisionLoss(-1))
        );
    }

    #[test]
    fn test_read_cstring_bounded() {
        let bytes = b"hello, world\0trailing";
        let s = unsafe { read_cstring_raw(bytes.as_ptr(), None) }.unwrap();
        assert_eq!(s, "hello, world");
        let bounded = unsafe { read_cstring_raw(bytes.as_ptr(), Some(5)) }.unwrap();
        assert_eq!(bounded, "hello");
    }

    #[test]
    fn test_struct_round_trip() {
        let mut layout = StructLayout::new(false);
        layout.add_field("b", CType::Int8).unwrap();
        layout.add_field("x", CType::Int32).unwrap();

        let mut bytes = vec![0u8; layout.size()];
        let record = Value::record([("b", Value::Number(7.0)), ("x", Value::Number(1234.0))]);
        write_struct(&layout, &record, &mut bytes).unwrap();

        let back = unsafe { read_struct_raw(&layout, bytes.as_ptr()) }.unwrap();
        let Value::Record(fields) = back else { panic!("expected record") };
        assert_eq!(fields["b"], Value::Number(7.0));
        assert_eq!(fields["x"], Value::Number(1234.0));
    }

    #[test]
    fn test_struct_missing_fields_zero_filled() {
        let mut layout = StructLayout::new(false);
        layout.add_field("x", CType::Int32).unwrap();
        layout.add_field("y", CType::Int32).unwrap();

        let mut bytes = vec![0xffu8; layout.size()];
        let record = Value::record([("y", Value::Number(5.0))]);
        write_struct(&layout, &record, &mut bytes).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_struct_write_too_small() {
        let mut layout = StructLayout::new(false);
        layout.add_field("x", CType::Int64).unwrap();
        let mut bytes = vec![0u8; 4];
        let err = write_struct(&layout, &Value::Record(HashMap::new()), &mut bytes).unwrap_err();
        assert!(matches!(err, FfiError::BufferTooSmall { .. }));
    }

    #[test]
    fn test_anonymous_union_promotion() {
        let mut repr = StructLayout::new(true);
        repr.add_field("i", CType::Int32).unwrap();
        repr.add_field("f", CType::Float).unwrap();
        let repr = Arc::new(repr);

        let mut outer = StructLayout::new(false);
        outer.add_field("tag", CType::Int32).unwrap();
        outer.add_anonymous_field(repr).unwrap();

        let mut bytes = vec![0u8; outer.size()];
        let record = Value::record([("tag", Value::Number(1.0)), ("i", Value::Number(99.0))]);
        write_struct(&outer, &record, &mut bytes).unwrap();

        let back = unsafe { read_struct_raw(&outer, bytes.as_ptr()) }.unwrap();
        let Value::Record(fields) = back else { panic!("expected record") };
        // promoted: no "<anonymous>" key, "i" and "f" are top-level
        assert_eq!(fields["tag"], Value::Number(1.0));
        assert_eq!(fields["i"], Value::Number(99.0));
        assert!(fields.contains_key("f"));
    }

    #[test]
    fn test_array_round_trip() {
        let layout = ArrayLayout::new(CType::Int16, 4).unwrap();
        let mut bytes = vec![0u8; layout.size()];
        let values = Value::Array(vec![
            Value::Number(1.0),
            Value::Number(-2.0),
            Value::Number(3.0),
        ]);
        write_array(&layout, &values, &mut bytes).unwrap();

        let back = unsafe { read_array_raw(&layout, bytes.as_ptr()) }.unwrap();
        assert_eq!(
            back,
            Value::Array(vec![
                Value::Number(1.0),
                Value::Number(-2.0),
                Value::Number(3.0),
                Value::Number(0.0), // zero-filled tail
            ])
        );
    }

    #[test]
    fn test_char_array_from_string() {
        let layout = ArrayLayout::new(CType::Int8, 8).unwrap();
        let mut bytes = vec![0u8; layout.size()];
        write_array(&layout, &Value::string("hi"), &mut bytes).unwrap();
        assert_eq!(&bytes[..3], b"hi\0");
    }

    #[test]
    fn test_scratch_string_fixup() {
        let mut scratch = CallScratch::new(2);
        scratch
            .marshal_arg(0, &Value::string("abc"), &TypeDesc::Prim(CType::CString))
            .unwrap();
        scratch
            .marshal_arg(1, &Value::Number(7.0), &TypeDesc::Prim(CType::Int32))
            .unwrap();
        let avalues = scratch.resolve();
        assert_eq!(avalues.len(), 2);

        // Slot 0 now holds a pointer to the NUL-terminated scratch text.
        let str_ptr = unsafe { *(avalues[0] as *const *const u8) };
        let s = unsafe { read_cstring_raw(str_ptr, None) }.unwrap();
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_scratch_fixups_survive_move() {
        let mut scratch = CallScratch::new(1);
        scratch
            .marshal_arg(0, &Value::string("moved"), &TypeDesc::Prim(CType::CString))
            .unwrap();

        // Simulate the async handoff: move the scratch, then resolve.
        let mut moved = Box::new(scratch);
        let avalues = moved.resolve();
        let str_ptr = unsafe { *(avalues[0] as *const *const u8) };
        let s = unsafe { read_cstring_raw(str_ptr, None) }.unwrap();
        assert_eq!(s, "moved");
    }

    #[test]
    fn test_scratch_overflow_composite() {
        let mut big = StructLayout::new(false);
        for i in 0..5 {
            big.add_field(format!("f{i}"), CType::Int64).unwrap();
        }
        let big = Arc::new(big);
        assert!(big.size() > ARG_SLOT_SIZE);

        let mut scratch = CallScratch::new(1);
        let record = Value::record([("f2", Value::BigInt(11))]);
        scratch
            .marshal_arg(0, &record, &TypeDesc::Struct(big.clone()))
            .unwrap();
        let avalues = scratch.resolve();

        let back = unsafe { read_struct_raw(&big, avalues[0] as *const u8) }.unwrap();
        let Value::Record(fields) = back else { panic!("expected record") };
        assert_eq!(fields["f2"], Value::BigInt(11));
        assert_eq!(fields["f0"], Value::BigInt(0));
    }
}
