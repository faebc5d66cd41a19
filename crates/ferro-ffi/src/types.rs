//! Type catalog: primitive C type tags and their native properties
//!
//! Maps a type identifier (string name, raw tag, or [`CType`] value) to its
//! native byte size, native alignment and the libffi descriptor used to
//! build call interfaces. Pure and stateless; every table here is read-only.

use crate::error::{FfiError, FfiResult};
use libffi::low;
use serde::{Deserialize, Serialize};
use std::os::raw::c_long;
use std::ptr::addr_of_mut;

/// Size of a native pointer on this target.
pub const POINTER_SIZE: usize = std::mem::size_of::<*const ()>();

/// Size of the native `wchar_t`: 16-bit on Windows, 32-bit elsewhere.
#[cfg(windows)]
pub const WCHAR_SIZE: usize = 2;
#[cfg(not(windows))]
pub const WCHAR_SIZE: usize = 4;

/// Size of the native `long`: 32-bit on Windows (LLP64), pointer-sized on
/// LP64 Unix. Fixed once per target.
pub const LONG_SIZE: usize = std::mem::size_of::<c_long>();

/// Closed catalog of primitive C types.
///
/// Composite types (struct, union, fixed array) are described by
/// [`TypeDesc`](crate::layout::TypeDesc), which pairs one of these tags with
/// a computed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CType {
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Bool,
    /// Untyped `void*`.
    Pointer,
    /// Null-terminated `char*`.
    CString,
    /// Null-terminated `wchar_t*`.
    WString,
    /// A single `wchar_t`.
    WChar,
    /// `size_t`, pointer-sized unsigned.
    Size,
    /// `ssize_t`, pointer-sized signed.
    SSize,
    /// C `long`: platform-dependent width (see [`LONG_SIZE`]).
    Long,
    /// C `unsigned long`.
    ULong,
}

/// All catalog entries, in tag order. Tag order is the wire format for
/// [`CType::from_raw`], so it never changes.
pub const ALL_TYPES: [CType; 20] = [
    CType::Void,
    CType::Int8,
    CType::UInt8,
    CType::Int16,
    CType::UInt16,
    CType::Int32,
    CType::UInt32,
    CType::Int64,
    CType::UInt64,
    CType::Float,
    CType::Double,
    CType::Bool,
    CType::Pointer,
    CType::CString,
    CType::WString,
    CType::WChar,
    CType::Size,
    CType::SSize,
    CType::Long,
    CType::ULong,
];

impl CType {
    /// Resolve a string type name, accepting the usual C spellings and
    /// ctypes-style aliases (`"int"`, `"uint32_t"`, `"char*"`, `"c_long"`).
    pub fn parse(name: &str) -> FfiResult<CType> {
        let ty = match name {
            "void" => CType::Void,
            "int8" | "int8_t" | "char" | "c_char" | "c_int8" => CType::Int8,
            "uint8" | "uint8_t" | "uchar" | "unsigned char" | "c_uchar" | "c_uint8" => CType::UInt8,
            "int16" | "int16_t" | "short" | "c_short" | "c_int16" => CType::Int16,
            "uint16" | "uint16_t" | "ushort" | "unsigned short" | "c_ushort" | "c_uint16" => {
                CType::UInt16
            }
            "int32" | "int32_t" | "int" | "c_int" | "c_int32" => CType::Int32,
            "uint32" | "uint32_t" | "uint" | "unsigned int" | "c_uint" | "c_uint32" => CType::UInt32,
            "int64" | "int64_t" | "long long" | "c_int64" => CType::Int64,
            "uint64" | "uint64_t" | "unsigned long long" | "c_uint64" => CType::UInt64,
            "float" | "c_float" => CType::Float,
            "double" | "c_double" => CType::Double,
            "bool" | "_Bool" | "c_bool" => CType::Bool,
            "pointer" | "void*" | "ptr" | "c_void_p" => CType::Pointer,
            "string" | "char*" | "cstring" | "c_char_p" => CType::CString,
            "wstring" | "wchar_t*" | "c_wchar_p" => CType::WString,
            "wchar" | "wchar_t" | "c_wchar" => CType::WChar,
            "size_t" | "c_size_t" => CType::Size,
            "ssize_t" | "c_ssize_t" => CType::SSize,
            "long" | "c_long" => CType::Long,
            "ulong" | "unsigned long" | "c_ulong" => CType::ULong,
            _ => return Err(FfiError::UnknownType(name.to_string())),
        };
        Ok(ty)
    }

    /// Resolve a raw integer tag (the enum's position in [`ALL_TYPES`]).
    pub fn from_raw(tag: i32) -> FfiResult<CType> {
        usize::try_from(tag)
            .ok()
            .and_then(|i| ALL_TYPES.get(i).copied())
            .ok_or(FfiError::OutOfRangeType(tag))
    }

    /// Canonical display name.
    pub fn name(self) -> &'static str {
        match self {
            CType::Void => "void",
            CType::Int8 => "int8",
            CType::UInt8 => "uint8",
            CType::Int16 => "int16",
            CType::UInt16 => "uint16",
            CType::Int32 => "int32",
            CType::UInt32 => "uint32",
            CType::Int64 => "int64",
            CType::UInt64 => "uint64",
            CType::Float => "float",
            CType::Double => "double",
            CType::Bool => "bool",
            CType::Pointer => "pointer",
            CType::CString => "string",
            CType::WString => "wstring",
            CType::WChar => "wchar",
            CType::Size => "size_t",
            CType::SSize => "ssize_t",
            CType::Long => "long",
            CType::ULong => "ulong",
        }
    }

    /// Native byte size on this target.
    pub fn size(self) -> usize {
        match self {
            CType::Void => 0,
            CType::Int8 | CType::UInt8 | CType::Bool => 1,
            CType::Int16 | CType::UInt16 => 2,
            CType::Int32 | CType::UInt32 | CType::Float => 4,
            CType::Int64 | CType::UInt64 | CType::Double => 8,
            CType::Pointer | CType::CString | CType::WString | CType::Size | CType::SSize => {
                POINTER_SIZE
            }
            CType::WChar => WCHAR_SIZE,
            CType::Long | CType::ULong => LONG_SIZE,
        }
    }

    /// Native alignment on this target. For every primitive this equals its
    /// size, which collapses to the platform word for pointer-sized types.
    pub fn alignment(self) -> usize {
        match self {
            CType::Void => 1,
            other => other.size(),
        }
    }

    /// The libffi descriptor for this primitive.
    ///
    /// Strings and wide strings are pointers at the call-interface level;
    /// their text semantics live entirely in the marshaler.
    pub(crate) fn libffi_type(self) -> *mut low::ffi_type {
        unsafe {
            match self {
                CType::Void => addr_of_mut!(low::types::void),
                CType::Int8 => addr_of_mut!(low::types::sint8),
                CType::UInt8 | CType::Bool => addr_of_mut!(low::types::uint8),
                CType::Int16 => addr_of_mut!(low::types::sint16),
                CType::UInt16 => addr_of_mut!(low::types::uint16),
                CType::Int32 => addr_of_mut!(low::types::sint32),
                CType::UInt32 => addr_of_mut!(low::types::uint32),
                CType::Int64 => addr_of_mut!(low::types::sint64),
                CType::UInt64 => addr_of_mut!(low::types::uint64),
                CType::Float => addr_of_mut!(low::types::float),
                CType::Double => addr_of_mut!(low::types::double),
                CType::Pointer | CType::CString | CType::WString | CType::Size | CType::SSize => {
                    addr_of_mut!(low::types::pointer)
                }
                CType::WChar => {
                    if WCHAR_SIZE == 2 {
                        addr_of_mut!(low::types::uint16)
                    } else {
                        addr_of_mut!(low::types::uint32)
                    }
                }
                CType::Long => {
                    if LONG_SIZE == 8 {
                        addr_of_mut!(low::types::sint64)
                    } else {
                        addr_of_mut!(low::types::sint32)
                    }
                }
                CType::ULong => {
                    if LONG_SIZE == 8 {
                        addr_of_mut!(low::types::uint64)
                    } else {
                        addr_of_mut!(low::types::uint32)
                    }
                }
            }
        }
    }
}

impl std::str::FromStr for CType {
    type Err = FfiError;

    fn from_str(s: &str) -> FfiResult<CType> {
        CType::parse(s)
    }
}

impl std::fmt::Display for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
