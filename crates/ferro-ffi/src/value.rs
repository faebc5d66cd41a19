//! Host value representation
//!
//! Shared value model for everything crossing the FFI boundary.
//! - Null, Bool, Number: immediate values
//! - BigInt: 128-bit host integer, wide enough to round-trip both `i64`
//!   and `u64` native values losslessly
//! - Str: heap-allocated, reference-counted, immutable
//! - Buffer: handle to a fixed native allocation; cloning the handle is the
//!   pinning mechanism for async calls
//! - Array/Record: composite views used when marshaling structs and arrays

use crate::error::{FfiError, FfiResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A host value as seen by the FFI engine.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    Str(Arc<str>),
    Buffer(Buffer),
    Array(Vec<Value>),
    Record(HashMap<String, Value>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Convenience constructor for record values.
    pub fn record(fields: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Host-facing name of the value's shape, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::Str(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view over Number and BigInt values. Truncating conversions
    /// into narrower native targets are the caller's responsibility.
    pub(crate) fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Number(n) => Some(*n as i128),
            Value::BigInt(b) => Some(*b),
            Value::Bool(b) => Some(*b as i128),
            _ => None,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::BigInt(b) => Some(*b as f64),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a.address() == b.address(),
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

/// Handle to a fixed-address native allocation.
///
/// The backing storage never moves or resizes, so the raw address handed to
/// native code stays valid for as long as any clone of the handle is alive.
/// Cloning is a refcount bump; an async call clones the handle into its
/// [`PendingCall`](crate::call) to pin the memory for the worker's lifetime.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<RawBuffer>,
}

struct RawBuffer {
    ptr: *mut u8,
    len: usize,
    owned: bool,
}

// The allocation is fixed for the RawBuffer's lifetime and all access is
// bounds-checked; native aliasing is inherent to an FFI boundary.
unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        if self.owned && !self.ptr.is_null() {
            // Reconstitute the boxed slice allocated in `Buffer::alloc`.
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.ptr, self.len,
                )));
            }
        }
    }
}

impl Buffer {
    /// Allocate `len` zeroed bytes of native memory.
    pub fn alloc(len: usize) -> Self {
        let ptr = if len == 0 {
            std::ptr::null_mut()
        } else {
            Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8
        };
        Buffer {
            inner: Arc::new(RawBuffer {
                ptr,
                len,
                owned: len != 0,
            }),
        }
    }

    /// Copy `bytes` into a fresh native allocation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buf = Buffer::alloc(bytes.len());
        if !bytes.is_empty() {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.inner.ptr, bytes.len()) };
        }
        buf
    }

    /// Wrap an existing raw address as a bounded, unowned view.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` bytes that stay valid and
    /// writable for the lifetime of the returned handle and its clones.
    pub unsafe fn view(addr: usize, len: usize) -> Self {
        Buffer {
            inner: Arc::new(RawBuffer {
                ptr: addr as *mut u8,
                len,
                owned: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Raw base address, 0 for the empty buffer.
    pub fn address(&self) -> usize {
        self.inner.ptr as usize
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr
    }

    /// Bounds-checked read of `out.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> FfiResult<()> {
        self.check_range(offset, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.inner.ptr.add(offset), out.as_mut_ptr(), out.len())
        };
        Ok(())
    }

    /// Bounds-checked write of `bytes` starting at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        self.check_range(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.inner.ptr.add(offset), bytes.len())
        };
        Ok(())
    }

    /// Copy the whole buffer into a host-owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.inner.len];
        if !out.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(self.inner.ptr, out.as_mut_ptr(), self.inner.len)
            };
        }
        out
    }

    fn check_range(&self, offset: usize, len: usize) -> FfiResult<()> {
        let end = offset.checked_add(len).ok_or(FfiError::BufferTooSmall {
            needed: usize::MAX,
            available: self.inner.len,
        })?;
        if end > self.inner.len {
            return Err(FfiError::BufferTooSmall {
                needed: end,
                available: self.inner.len,
            });
        }
        if self.inner.ptr.is_null() && len > 0 {
            return Err(FfiError::NullPointerDereference);
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.inner.len)
            .field("owned", &self.inner.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let buf = Buffer::alloc(32);
        assert_eq!(buf.len(), 32);
        assert_eq!(buf.to_vec(), vec![0u8; 32]);
    }

    #[test]
    fn test_alloc_zero_len() {
        let buf = Buffer::alloc(0);
        assert!(buf.is_empty());
        assert_eq!(buf.address(), 0);
    }

    #[test]
    fn test_read_write_round_trip() {
        let buf = Buffer::alloc(8);
        buf.write(2, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        buf.read(2, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let buf = Buffer::alloc(4);
        let err = buf.write(2, &[0; 4]).unwrap_err();
        assert!(matches!(err, FfiError::BufferTooSmall { needed: 6, available: 4 }));
    }

    #[test]
    fn test_clone_shares_address() {
        let buf = Buffer::from_bytes(b"abc");
        let pin = buf.clone();
        assert_eq!(buf.address(), pin.address());
        drop(buf);
        assert_eq!(pin.to_vec(), b"abc");
    }

    #[test]
    fn test_view_is_unowned() {
        let backing = Buffer::alloc(16);
        let view = unsafe { Buffer::view(backing.address(), 8) };
        view.write(0, &[9; 8]).unwrap();
        assert_eq!(backing.to_vec()[..8], [9; 8]);
        drop(view); // must not free the backing allocation
        assert_eq!(backing.to_vec()[..8], [9; 8]);
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Number(1.0).type_name(), "number");
        assert_eq!(Value::BigInt(1).type_name(), "bigint");
        assert_eq!(Value::string("x").type_name(), "string");
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Number(2.0), Value::Number(2.0));
        assert_ne!(Value::Number(2.0), Value::BigInt(2));
        assert_eq!(Value::string("a"), Value::string("a"));
        let buf = Buffer::alloc(4);
        assert_eq!(Value::Buffer(buf.clone()), Value::Buffer(buf));
    }
}
