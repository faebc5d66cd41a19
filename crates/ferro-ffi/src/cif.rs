//! Prepared libffi call interfaces
//!
//! [`PreparedCif`] owns everything a `ffi_call` needs to stay valid: the
//! `ffi_cif` itself, the argument descriptor array it points into, and the
//! type descriptors whose aggregate `ffi_type`s it references. Both the
//! call engine and the callback trampolines build their interfaces here.

use crate::error::{FfiError, FfiResult};
use crate::layout::TypeDesc;
use libffi::{low, raw};
use serde::{Deserialize, Serialize};
use std::ffi::c_void;

/// Calling convention tag.
///
/// `Stdcall`, `Fastcall` and `Thiscall` are meaningful only on 32-bit x86
/// Windows; everywhere else they degrade to the platform default ABI, as
/// the strings are accepted for portability of caller code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallConv {
    #[default]
    Default,
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
}

impl CallConv {
    /// Parse a calling-convention string. Unrecognized names fall back to
    /// the default convention.
    pub fn parse(name: &str) -> CallConv {
        match name {
            "cdecl" | "default" => CallConv::Cdecl,
            "stdcall" => CallConv::Stdcall,
            "fastcall" => CallConv::Fastcall,
            "thiscall" => CallConv::Thiscall,
            _ => CallConv::Default,
        }
    }

    #[cfg(all(windows, target_arch = "x86"))]
    fn to_ffi_abi(self) -> low::ffi_abi {
        match self {
            CallConv::Stdcall => raw::ffi_abi_FFI_STDCALL,
            CallConv::Fastcall => raw::ffi_abi_FFI_FASTCALL,
            CallConv::Thiscall => raw::ffi_abi_FFI_THISCALL,
            CallConv::Default | CallConv::Cdecl => low::ffi_abi_FFI_DEFAULT_ABI,
        }
    }

    #[cfg(not(all(windows, target_arch = "x86")))]
    fn to_ffi_abi(self) -> low::ffi_abi {
        low::ffi_abi_FFI_DEFAULT_ABI
    }
}

/// A prepared call interface: fixed-arity, or a variadic derivation.
pub(crate) struct PreparedCif {
    cif: low::ffi_cif,
    /// Pointed into by `cif`; must stay unmoved and unmodified.
    _arg_types: Vec<*mut low::ffi_type>,
    /// Keep composite layouts (and their owned `ffi_type`s) alive.
    _return_desc: TypeDesc,
    _arg_descs: Vec<TypeDesc>,
    arg_count: usize,
}

// All interior pointers target either libffi statics or heap owned by this
// value / by the Arc'd layouts it retains.
unsafe impl Send for PreparedCif {}
unsafe impl Sync for PreparedCif {}

impl PreparedCif {
    /// Prepare a fixed-arity interface.
    pub(crate) fn new(conv: CallConv, ret: &TypeDesc, args: &[TypeDesc]) -> FfiResult<Self> {
        Self::prepare(conv, ret, args, None)
    }

    /// Prepare a variadic interface: `args` holds the fixed argument types
    /// followed by the inferred extra types.
    pub(crate) fn new_variadic(
        conv: CallConv,
        ret: &TypeDesc,
        args: &[TypeDesc],
        fixed_count: usize,
    ) -> FfiResult<Self> {
        Self::prepare(conv, ret, args, Some(fixed_count))
    }

    fn prepare(
        conv: CallConv,
        ret: &TypeDesc,
        args: &[TypeDesc],
        fixed_count: Option<usize>,
    ) -> FfiResult<Self> {
        let rtype = ret.libffi_type()?;
        let mut arg_types = args
            .iter()
            .map(|desc| desc.libffi_type())
            .collect::<FfiResult<Vec<_>>>()?;

        let mut cif: low::ffi_cif = Default::default();
        let status = unsafe {
            match fixed_count {
                None => low::prep_cif(
                    &mut cif,
                    conv.to_ffi_abi(),
                    arg_types.len(),
                    rtype,
                    arg_types.as_mut_ptr(),
                ),
                Some(fixed) => low::prep_cif_var(
                    &mut cif,
                    conv.to_ffi_abi(),
                    fixed,
                    arg_types.len(),
                    rtype,
                    arg_types.as_mut_ptr(),
                ),
            }
        };
        status.map_err(|e| FfiError::CallInterfacePreparationFailed(format!("{e:?}")))?;

        Ok(PreparedCif {
            cif,
            arg_count: arg_types.len(),
            _arg_types: arg_types,
            _return_desc: ret.clone(),
            _arg_descs: args.to_vec(),
        })
    }

    pub(crate) fn arg_count(&self) -> usize {
        self.arg_count
    }

    pub(crate) fn as_raw(&self) -> *mut low::ffi_cif {
        // ffi_call does not mutate a prepared cif.
        &self.cif as *const low::ffi_cif as *mut low::ffi_cif
    }

    /// Invoke `address` through this interface.
    ///
    /// # Safety
    ///
    /// `address` must be a function whose true signature matches this
    /// interface; `rvalue` must point to writable storage large enough for
    /// the return type (at least one `ffi_arg` word); `avalues` must hold
    /// `arg_count` pointers to live argument storage.
    pub(crate) unsafe fn invoke(
        &self,
        address: usize,
        rvalue: *mut c_void,
        avalues: *mut *mut c_void,
    ) {
        let fun: unsafe extern "C" fn() = std::mem::transmute(address);
        raw::ffi_call(self.as_raw(), Some(fun), rvalue, avalues);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CType;

    #[test]
    fn test_call_conv_parse() {
        assert_eq!(CallConv::parse("cdecl"), CallConv::Cdecl);
        assert_eq!(CallConv::parse("default"), CallConv::Cdecl);
        assert_eq!(CallConv::parse("stdcall"), CallConv::Stdcall);
        assert_eq!(CallConv::parse("fastcall"), CallConv::Fastcall);
        assert_eq!(CallConv::parse("thiscall"), CallConv::Thiscall);
        assert_eq!(CallConv::parse("pascal"), CallConv::Default);
    }

    #[test]
    fn test_prepare_fixed() {
        let cif = PreparedCif::new(
            CallConv::Default,
            &TypeDesc::Prim(CType::Int32),
            &[TypeDesc::Prim(CType::Int32), TypeDesc::Prim(CType::Int32)],
        )
        .unwrap();
        assert_eq!(cif.arg_count(), 2);
    }

    #[test]
    fn test_prepare_no_args() {
        let cif = PreparedCif::new(CallConv::Default, &TypeDesc::Prim(CType::Void), &[]).unwrap();
        assert_eq!(cif.arg_count(), 0);
    }

    #[test]
    fn test_prepare_variadic() {
        let cif = PreparedCif::new_variadic(
            CallConv::Default,
            &TypeDesc::Prim(CType::Int32),
            &[
                TypeDesc::Prim(CType::CString),
                TypeDesc::Prim(CType::Int32),
                TypeDesc::Prim(CType::Double),
            ],
            1,
        )
        .unwrap();
        assert_eq!(cif.arg_count(), 3);
    }
}
