//! Layout engine: struct, union and fixed-array layout computation
//!
//! Computes field offsets, total size and alignment from an ordered field
//! list, eagerly on every mutation so queries are always consistent.
//! Struct fields are padded up to their alignment boundary; union fields all
//! sit at offset 0; the total size is padded up to the overall alignment.
//!
//! A layout lazily materializes a libffi aggregate descriptor with its own
//! computed size and alignment, so unions and fixed arrays (which libffi
//! does not model directly) cross the boundary with the exact layout
//! computed here. Once that native form exists it is captured by prepared
//! call interfaces, so further mutation is rejected.

use crate::error::{FfiError, FfiResult};
use crate::marshal;
use crate::types::CType;
use crate::value::{Buffer, Value};
use libffi::low;
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// A type descriptor: a primitive tag, or a composite with its layout.
#[derive(Debug, Clone)]
pub enum TypeDesc {
    Prim(CType),
    Struct(Arc<StructLayout>),
    Array(Arc<ArrayLayout>),
}

impl TypeDesc {
    pub fn size(&self) -> usize {
        match self {
            TypeDesc::Prim(ty) => ty.size(),
            TypeDesc::Struct(layout) => layout.size(),
            TypeDesc::Array(layout) => layout.size(),
        }
    }

    pub fn alignment(&self) -> usize {
        match self {
            TypeDesc::Prim(ty) => ty.alignment(),
            TypeDesc::Struct(layout) => layout.alignment(),
            TypeDesc::Array(layout) => layout.alignment(),
        }
    }

    /// Display name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            TypeDesc::Prim(ty) => ty.name(),
            TypeDesc::Struct(layout) if layout.is_union() => "union",
            TypeDesc::Struct(_) => "struct",
            TypeDesc::Array(_) => "array",
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDesc::Prim(CType::Void))
    }

    pub fn is_composite(&self) -> bool {
        !matches!(self, TypeDesc::Prim(_))
    }

    pub(crate) fn libffi_type(&self) -> FfiResult<*mut low::ffi_type> {
        match self {
            TypeDesc::Prim(ty) => Ok(ty.libffi_type()),
            TypeDesc::Struct(layout) => layout.libffi_type(),
            TypeDesc::Array(layout) => layout.libffi_type(),
        }
    }
}

impl From<CType> for TypeDesc {
    fn from(ty: CType) -> Self {
        TypeDesc::Prim(ty)
    }
}

impl From<Arc<StructLayout>> for TypeDesc {
    fn from(layout: Arc<StructLayout>) -> Self {
        TypeDesc::Struct(layout)
    }
}

impl From<Arc<ArrayLayout>> for TypeDesc {
    fn from(layout: Arc<ArrayLayout>) -> Self {
        TypeDesc::Array(layout)
    }
}

/// One field of a composite layout.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub desc: TypeDesc,
    pub offset: usize,
    pub size: usize,
    /// Anonymous nested struct/union: a layout annotation only. Offsets are
    /// unaffected; the marshaler promotes the sub-fields into the parent
    /// record view.
    pub anonymous: bool,
}

/// Owned libffi aggregate descriptor. The element pointer array is kept
/// alive here and referenced by the `ffi_type`; nested layouts are kept
/// alive by the `Arc`s inside the owning layout's field list.
pub(crate) struct FfiTypeBox {
    ty: Box<low::ffi_type>,
    _elements: Box<[*mut low::ffi_type]>,
}

impl std::fmt::Debug for FfiTypeBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfiTypeBox").finish_non_exhaustive()
    }
}

// The boxed descriptor is immutable after construction and every pointer it
// holds targets either a static or heap memory owned by this value or by
// the layout that owns it.
unsafe impl Send for FfiTypeBox {}
unsafe impl Sync for FfiTypeBox {}

impl FfiTypeBox {
    fn new(size: usize, alignment: usize, mut elements: Vec<*mut low::ffi_type>) -> Self {
        elements.push(std::ptr::null_mut());
        let mut elements = elements.into_boxed_slice();
        let ty = Box::new(low::ffi_type {
            size,
            alignment: alignment as u16,
            type_: low::type_tag::STRUCT,
            elements: elements.as_mut_ptr(),
        });
        FfiTypeBox {
            ty,
            _elements: elements,
        }
    }

    fn as_ptr(&self) -> *mut low::ffi_type {
        // libffi never mutates an aggregate descriptor whose size is
        // already filled in.
        &*self.ty as *const low::ffi_type as *mut low::ffi_type
    }
}

/// Computed layout of a C struct or union.
#[derive(Debug)]
pub struct StructLayout {
    is_union: bool,
    fields: Vec<Field>,
    size: usize,
    alignment: usize,
    ffi: OnceCell<FfiTypeBox>,
}

impl StructLayout {
    /// New empty layout. Degenerate case: size 0, alignment 1.
    pub fn new(is_union: bool) -> Self {
        StructLayout {
            is_union,
            fields: Vec::new(),
            size: 0,
            alignment: 1,
            ffi: OnceCell::new(),
        }
    }

    /// Append a named field and recompute the layout.
    pub fn add_field(&mut self, name: impl Into<String>, desc: impl Into<TypeDesc>) -> FfiResult<&mut Self> {
        self.push_field(name.into(), desc.into(), false)
    }

    /// Append an anonymous nested struct/union whose sub-fields are promoted
    /// into this layout's record view.
    pub fn add_anonymous_field(&mut self, layout: Arc<StructLayout>) -> FfiResult<&mut Self> {
        let name = format!("<anonymous:{}>", self.fields.len());
        self.push_field(name, TypeDesc::Struct(layout), true)
    }

    /// Append a fixed-array field. Equivalent to `add_field` with an array
    /// descriptor; kept as its own entry point to match the builder surface.
    pub fn add_array_field(
        &mut self,
        name: impl Into<String>,
        layout: Arc<ArrayLayout>,
    ) -> FfiResult<&mut Self> {
        self.push_field(name.into(), TypeDesc::Array(layout), false)
    }

    fn push_field(&mut self, name: String, desc: TypeDesc, anonymous: bool) -> FfiResult<&mut Self> {
        if self.ffi.get().is_some() {
            return Err(FfiError::LayoutFrozen);
        }
        if desc.is_void() {
            return Err(FfiError::invalid_value("field type", "void"));
        }
        if anonymous && !matches!(desc, TypeDesc::Struct(_)) {
            return Err(FfiError::invalid_value("anonymous field", desc.name()));
        }
        let size = desc.size();
        self.fields.push(Field {
            name,
            desc,
            offset: 0,
            size,
            anonymous,
        });
        self.recompute();
        Ok(self)
    }

    /// Recompute every offset plus total size and alignment. Eager, so the
    /// queries below are always consistent with the field list.
    fn recompute(&mut self) {
        if self.fields.is_empty() {
            self.size = 0;
            self.alignment = 1;
            return;
        }

        let mut current_offset = 0usize;
        let mut max_alignment = 1usize;

        for field in &mut self.fields {
            let field_alignment = field.desc.alignment().max(1);
            max_alignment = max_alignment.max(field_alignment);

            if self.is_union {
                field.offset = 0;
            } else {
                current_offset = pad_to(current_offset, field_alignment);
                field.offset = current_offset;
                current_offset += field.size;
            }
        }

        self.alignment = max_alignment;
        self.size = if self.is_union {
            self.fields.iter().map(|f| f.size).max().unwrap_or(0)
        } else {
            current_offset
        };
        // Trailing pad so arrays of this composite stay aligned.
        self.size = pad_to(self.size, self.alignment);
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Offset of a named field, if present (top level only, no promotion).
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.offset)
    }

    /// The libffi aggregate descriptor. First call freezes the layout.
    pub(crate) fn libffi_type(&self) -> FfiResult<*mut low::ffi_type> {
        let boxed = self.ffi.get_or_try_init(|| {
            let mut elements = Vec::with_capacity(self.fields.len());
            for field in &self.fields {
                elements.push(field.desc.libffi_type()?);
            }
            Ok::<_, FfiError>(FfiTypeBox::new(self.size, self.alignment, elements))
        })?;
        Ok(boxed.as_ptr())
    }

    /// Allocate a native buffer of this layout's size and initialize it
    /// from `values` (unspecified fields stay zero-filled).
    pub fn create(&self, values: Option<&Value>) -> FfiResult<Buffer> {
        let buffer = Buffer::alloc(self.size);
        if let Some(values) = values {
            let mut bytes = vec![0u8; self.size];
            marshal::write_struct(self, values, &mut bytes)?;
            buffer.write(0, &bytes)?;
        }
        Ok(buffer)
    }

    /// Decode a native buffer into a host record.
    pub fn read(&self, buffer: &Buffer) -> FfiResult<Value> {
        if buffer.len() < self.size {
            return Err(FfiError::BufferTooSmall {
                needed: self.size,
                available: buffer.len(),
            });
        }
        unsafe { marshal::read_struct_raw(self, buffer.as_ptr()) }
    }
}

/// Computed layout of a fixed-size C array.
#[derive(Debug)]
pub struct ArrayLayout {
    element: TypeDesc,
    len: usize,
    element_size: usize,
    alignment: usize,
    ffi: OnceCell<FfiTypeBox>,
}

impl ArrayLayout {
    pub fn new(element: impl Into<TypeDesc>, len: usize) -> FfiResult<Self> {
        let element = element.into();
        if element.is_void() {
            return Err(FfiError::invalid_value("array element type", "void"));
        }
        let element_size = element.size();
        let alignment = element.alignment().max(1);
        Ok(ArrayLayout {
            element,
            len,
            element_size,
            alignment,
            ffi: OnceCell::new(),
        })
    }

    pub fn element(&self) -> &TypeDesc {
        &self.element
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn size(&self) -> usize {
        self.element_size * self.len
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// libffi has no first-class array type: the descriptor is a struct of
    /// `len` repeated elements carrying this layout's size and alignment.
    pub(crate) fn libffi_type(&self) -> FfiResult<*mut low::ffi_type> {
        let boxed = self.ffi.get_or_try_init(|| {
            let element = self.element.libffi_type()?;
            Ok::<_, FfiError>(FfiTypeBox::new(
                self.size(),
                self.alignment,
                vec![element; self.len],
            ))
        })?;
        Ok(boxed.as_ptr())
    }

    /// Allocate a native buffer for the array, optionally initialized from
    /// a host array value (missing trailing elements stay zero-filled).
    pub fn create(&self, values: Option<&Value>) -> FfiResult<Buffer> {
        let buffer = Buffer::alloc(self.size());
        if let Some(values) = values {
            let mut bytes = vec![0u8; self.size()];
            marshal::write_array(self, values, &mut bytes)?;
            buffer.write(0, &bytes)?;
        }
        Ok(buffer)
    }

    /// Decode a native buffer into a host array.
    pub fn read(&self, buffer: &Buffer) -> FfiResult<Value> {
        if buffer.len() < self.size() {
            return Err(FfiError::BufferTooSmall {
                needed: self.size(),
                available: buffer.len(),
            });
        }
        unsafe { marshal::read_array_raw(self, buffer.as_ptr()) }
    }
}

fn pad_to(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);
    offset.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_int32_fields() {
        let mut s = StructLayout::new(false);
        s.add_field("x", CType::Int32).unwrap();
        s.add_field("y", CType::Int32).unwrap();
        assert_eq!(s.size(), 8);
        assert_eq!(s.alignment(), 4);
        assert_eq!(s.offset_of("x"), Some(0));
        assert_eq!(s.offset_of("y"), Some(4));
    }

    #[test]
    fn test_padding_before_aligned_field() {
        let mut s = StructLayout::new(false);
        s.add_field("b", CType::Int8).unwrap();
        s.add_field("x", CType::Int32).unwrap();
        assert_eq!(s.size(), 8);
        assert_eq!(s.alignment(), 4);
        assert_eq!(s.offset_of("b"), Some(0));
        assert_eq!(s.offset_of("x"), Some(4));
    }

    #[test]
    fn test_trailing_pad() {
        let mut s = StructLayout::new(false);
        s.add_field("x", CType::Int32).unwrap();
        s.add_field("b", CType::Int8).unwrap();
        // 4 + 1, padded up to alignment 4
        assert_eq!(s.size(), 8);
    }

    #[test]
    fn test_union_layout() {
        let mut u = StructLayout::new(true);
        u.add_field("b", CType::Int8).unwrap();
        u.add_field("x", CType::Int32).unwrap();
        u.add_field("d", CType::Double).unwrap();
        assert_eq!(u.size(), 8);
        assert_eq!(u.alignment(), 8);
        for field in u.fields() {
            assert_eq!(field.offset, 0);
        }
    }

    #[test]
    fn test_union_size_padded_to_alignment() {
        let mut u = StructLayout::new(true);
        u.add_field("d", CType::Double).unwrap();
        u.add_field("bytes", CType::Int8).unwrap();
        assert_eq!(u.size(), 8);
        assert!(u.size() % u.alignment() == 0);
    }

    #[test]
    fn test_empty_struct_degenerate() {
        let s = StructLayout::new(false);
        assert_eq!(s.size(), 0);
        assert_eq!(s.alignment(), 1);
    }

    #[test]
    fn test_nested_struct_field() {
        let mut point = StructLayout::new(false);
        point.add_field("x", CType::Int32).unwrap();
        point.add_field("y", CType::Int32).unwrap();
        let point = Arc::new(point);

        let mut line = StructLayout::new(false);
        line.add_field("from", point.clone()).unwrap();
        line.add_field("to", point).unwrap();
        assert_eq!(line.size(), 16);
        assert_eq!(line.offset_of("to"), Some(8));
    }

    #[test]
    fn test_anonymous_field_keeps_offsets() {
        let mut inner = StructLayout::new(true);
        inner.add_field("i", CType::Int32).unwrap();
        inner.add_field("f", CType::Float).unwrap();
        let inner = Arc::new(inner);

        let mut outer = StructLayout::new(false);
        outer.add_field("tag", CType::Int32).unwrap();
        outer.add_anonymous_field(inner).unwrap();
        assert_eq!(outer.size(), 8);
        assert_eq!(outer.fields()[1].offset, 4);
        assert!(outer.fields()[1].anonymous);
    }

    #[test]
    fn test_array_field_layout() {
        let arr = Arc::new(ArrayLayout::new(CType::Int16, 3).unwrap());
        assert_eq!(arr.size(), 6);
        assert_eq!(arr.alignment(), 2);

        let mut s = StructLayout::new(false);
        s.add_field("n", CType::Int8).unwrap();
        s.add_array_field("values", arr).unwrap();
        assert_eq!(s.offset_of("values"), Some(2));
        assert_eq!(s.size(), 8);
    }

    #[test]
    fn test_frozen_after_native_form() {
        let mut s = StructLayout::new(false);
        s.add_field("x", CType::Int32).unwrap();
        s.libffi_type().unwrap();
        let err = s.add_field("y", CType::Int32).unwrap_err();
        assert_eq!(err, FfiError::LayoutFrozen);
        // Still queryable, unchanged.
        assert_eq!(s.size(), 4);
    }

    #[test]
    fn test_void_field_rejected() {
        let mut s = StructLayout::new(false);
        assert!(s.add_field("v", CType::Void).is_err());
        assert!(ArrayLayout::new(CType::Void, 4).is_err());
    }

    #[test]
    fn test_offsets_are_field_aligned() {
        let mut s = StructLayout::new(false);
        s.add_field("a", CType::Int8).unwrap();
        s.add_field("b", CType::Int64).unwrap();
        s.add_field("c", CType::Int16).unwrap();
        s.add_field("d", CType::Double).unwrap();
        for field in s.fields() {
            assert_eq!(field.offset % field.desc.alignment(), 0);
        }
        assert_eq!(s.size() % s.alignment(), 0);
    }
}
