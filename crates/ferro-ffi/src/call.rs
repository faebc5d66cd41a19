//! Call engine: prepared native calls, synchronous and asynchronous
//!
//! A [`NativeFunction`] binds a native address to a return type and an
//! ordered argument type list. The call interface is prepared once at
//! construction and reused across calls; supplying more arguments than
//! declared derives a variadic interface whose extra types are inferred
//! from the host values' runtime shape and cached in a bounded table.
//!
//! `call` blocks the calling thread for the duration of the native call.
//! `call_async` marshals on the calling task, snapshots everything into a
//! [`PendingCall`], and runs the raw native invocation on a blocking worker
//! with zero host-runtime access; internal pointers are re-resolved against
//! the storage's final address before the call.

use crate::cif::{CallConv, PreparedCif};
use crate::error::{FfiError, FfiResult};
use crate::layout::TypeDesc;
use crate::marshal::{self, CallScratch};
use crate::types::CType;
use crate::value::Value;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Capacity of the per-function variadic call-interface cache.
pub(crate) const MAX_CACHED_VARIADIC_CIFS: usize = 4;

/// Variadic shapes with more extra arguments than this are built per call
/// but never cached.
const MAX_CACHED_EXTRA_ARGS: usize = 4;

const RETURN_SCRATCH_SIZE: usize = 16;

/// Result-check hook, invoked as `(result, callee, original arguments)`.
/// Whatever it returns (or raises) is propagated to the caller.
pub type ResultCheck =
    Arc<dyn Fn(Value, &NativeFunction, &[Value]) -> FfiResult<Value> + Send + Sync>;

/// Options for binding a native function.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub convention: CallConv,
    /// Bound on null-terminated scans when converting returned C strings.
    pub max_string_scan: Option<usize>,
}

/// Fixed-size, over-aligned scratch for primitive return values; decoded
/// only through the type descriptor that produced it.
#[repr(C, align(16))]
struct ReturnScratch([u8; RETURN_SCRATCH_SIZE]);

/// Return-value destination: inline scratch, or a heap spill for composite
/// returns larger than the scratch.
enum ReturnStorage {
    Inline(ReturnScratch),
    Heap(Vec<u128>),
}

impl ReturnStorage {
    fn for_desc(desc: &TypeDesc) -> Self {
        let size = desc.size();
        if size > RETURN_SCRATCH_SIZE {
            ReturnStorage::Heap(vec![0u128; size.div_ceil(16)])
        } else {
            ReturnStorage::Inline(ReturnScratch([0u8; RETURN_SCRATCH_SIZE]))
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        match self {
            ReturnStorage::Inline(scratch) => scratch.0.as_mut_ptr() as *mut c_void,
            ReturnStorage::Heap(words) => words.as_mut_ptr() as *mut c_void,
        }
    }

    fn as_ptr(&self) -> *const u8 {
        match self {
            ReturnStorage::Inline(scratch) => scratch.0.as_ptr(),
            ReturnStorage::Heap(words) => words.as_ptr() as *const u8,
        }
    }
}

struct CacheEntry {
    total_args: usize,
    extra: Vec<CType>,
    cif: Arc<PreparedCif>,
}

/// Bounded associative cache of derived variadic interfaces, keyed by
/// (total argument count, extra type sequence), round-robin eviction.
struct VariadicCache {
    slots: Vec<Option<CacheEntry>>,
    next: usize,
}

impl VariadicCache {
    fn new() -> Self {
        VariadicCache {
            slots: (0..MAX_CACHED_VARIADIC_CIFS).map(|_| None).collect(),
            next: 0,
        }
    }

    fn lookup(&self, total_args: usize, extra: &[CType]) -> Option<Arc<PreparedCif>> {
        self.slots.iter().flatten().find_map(|entry| {
            (entry.total_args == total_args && entry.extra == extra).then(|| entry.cif.clone())
        })
    }

    fn insert(&mut self, total_args: usize, extra: Vec<CType>, cif: Arc<PreparedCif>) {
        self.slots[self.next] = Some(CacheEntry {
            total_args,
            extra,
            cif,
        });
        self.next = (self.next + 1) % MAX_CACHED_VARIADIC_CIFS;
    }
}

struct FnInner {
    address: usize,
    name: String,
    conv: CallConv,
    ret: TypeDesc,
    args: Vec<TypeDesc>,
    cif: Arc<PreparedCif>,
    variadic_cache: Mutex<VariadicCache>,
    cache_builds: AtomicUsize,
    result_check: Mutex<Option<ResultCheck>>,
    max_string_scan: Option<usize>,
    /// Keeps the originating dynamic library loaded while bindings exist.
    _origin: Option<Arc<libloading::Library>>,
}

/// A resolved native function, bound to a prepared call interface.
///
/// Cheap to clone; all clones share the prepared interface and the
/// variadic cache.
#[derive(Clone)]
pub struct NativeFunction {
    inner: Arc<FnInner>,
}

impl NativeFunction {
    /// Bind `address` with the given signature.
    ///
    /// A null address is rejected here, never at call time. A failed call
    /// interface preparation is terminal: no function object is produced.
    ///
    /// # Safety
    ///
    /// `address` must be a callable native function whose true signature
    /// matches `ret`/`args` under `options.convention`, and must remain
    /// valid for the lifetime of the binding and its clones.
    pub unsafe fn new(
        address: usize,
        name: Option<&str>,
        ret: TypeDesc,
        args: Vec<TypeDesc>,
        options: CallOptions,
    ) -> FfiResult<Self> {
        Self::with_origin(address, name, ret, args, options, None)
    }

    pub(crate) unsafe fn with_origin(
        address: usize,
        name: Option<&str>,
        ret: TypeDesc,
        args: Vec<TypeDesc>,
        options: CallOptions,
        origin: Option<Arc<libloading::Library>>,
    ) -> FfiResult<Self> {
        if address == 0 {
            return Err(FfiError::invalid_value("non-null function address", "null"));
        }
        let cif = Arc::new(PreparedCif::new(options.convention, &ret, &args)?);
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("{address:#x}"),
        };
        trace!(name = %name, argc = args.len(), "prepared call interface");
        Ok(NativeFunction {
            inner: Arc::new(FnInner {
                address,
                name,
                conv: options.convention,
                ret,
                args,
                cif,
                variadic_cache: Mutex::new(VariadicCache::new()),
                cache_builds: AtomicUsize::new(0),
                result_check: Mutex::new(None),
                max_string_scan: options.max_string_scan,
                _origin: origin,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> usize {
        self.inner.address
    }

    /// Declared (fixed) argument count.
    pub fn arg_count(&self) -> usize {
        self.inner.args.len()
    }

    /// Install or clear the result-check hook.
    pub fn set_result_check(&self, hook: Option<ResultCheck>) {
        *self.inner.result_check.lock() = hook;
    }

    /// Number of derived variadic interfaces constructed so far. Repeated
    /// calls with the same shape do not increase this.
    pub fn variadic_cache_builds(&self) -> usize {
        self.inner.cache_builds.load(Ordering::Relaxed)
    }

    /// Infer a type descriptor for an extra (variadic) argument from the
    /// host value's runtime shape.
    ///
    /// This is a documented heuristic, not a guaranteed-correct inference:
    /// a float with integral value becomes `int32`, and native functions
    /// expecting 64-bit integers must be given host big integers.
    fn infer_extra_type(value: &Value) -> CType {
        match value {
            Value::Str(_) => CType::CString,
            Value::Number(n) => {
                if *n == (*n as i32) as f64 {
                    CType::Int32
                } else {
                    CType::Double
                }
            }
            Value::BigInt(_) => CType::Int64,
            Value::Buffer(_) => CType::Pointer,
            Value::Null => CType::Pointer,
            _ => CType::Int32,
        }
    }

    /// Pick the active interface for `args`: the prepared one on an exact
    /// arity match, a cached or freshly derived variadic one on excess
    /// arguments.
    fn select_cif(&self, args: &[Value]) -> FfiResult<(Arc<PreparedCif>, Vec<CType>)> {
        let declared = self.inner.args.len();
        if args.len() == declared {
            return Ok((self.inner.cif.clone(), Vec::new()));
        }
        if args.len() < declared {
            return Err(FfiError::ArgumentCountMismatch {
                expected: declared,
                got: args.len(),
            });
        }

        let extra: Vec<CType> = args[declared..]
            .iter()
            .map(Self::infer_extra_type)
            .collect();

        {
            let cache = self.inner.variadic_cache.lock();
            if let Some(cif) = cache.lookup(args.len(), &extra) {
                trace!(name = %self.inner.name, total = args.len(), "variadic cache hit");
                return Ok((cif, extra));
            }
        }

        let mut all: Vec<TypeDesc> = self.inner.args.clone();
        all.extend(extra.iter().map(|ty| TypeDesc::Prim(*ty)));
        let cif = Arc::new(PreparedCif::new_variadic(
            self.inner.conv,
            &self.inner.ret,
            &all,
            declared,
        )?);
        self.inner.cache_builds.fetch_add(1, Ordering::Relaxed);
        trace!(name = %self.inner.name, total = args.len(), "variadic cache miss, interface built");

        if extra.len() <= MAX_CACHED_EXTRA_ARGS {
            self.inner
                .variadic_cache
                .lock()
                .insert(args.len(), extra.clone(), cif.clone());
        }
        Ok((cif, extra))
    }

    fn marshal_all(&self, args: &[Value], extra: &[CType]) -> FfiResult<CallScratch> {
        let declared = self.inner.args.len();
        let mut scratch = CallScratch::new(args.len());
        for (i, value) in args.iter().enumerate() {
            let desc = if i < declared {
                self.inner.args[i].clone()
            } else {
                TypeDesc::Prim(extra[i - declared])
            };
            scratch.marshal_arg(i, value, &desc)?;
        }
        Ok(scratch)
    }

    fn convert_return(&self, storage: &ReturnStorage) -> FfiResult<Value> {
        if self.inner.ret.is_void() {
            return Ok(Value::Null);
        }
        unsafe { marshal::read_typed(&self.inner.ret, storage.as_ptr(), self.inner.max_string_scan) }
    }

    fn apply_result_check(&self, result: Value, args: &[Value]) -> FfiResult<Value> {
        let hook = self.inner.result_check.lock().clone();
        match hook {
            Some(check) => check(result, self, args),
            None => Ok(result),
        }
    }

    /// Invoke the native function synchronously. Blocks the calling thread
    /// for the duration of the native call; no suspension point.
    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        let (cif, extra) = self.select_cif(args)?;
        let mut scratch = self.marshal_all(args, &extra)?;
        let mut avalues = scratch.resolve();
        let mut ret = ReturnStorage::for_desc(&self.inner.ret);

        unsafe {
            cif.invoke(self.inner.address, ret.as_mut_ptr(), avalues.as_mut_ptr());
        }

        let result = self.convert_return(&ret)?;
        self.apply_result_check(result, args)
    }

    /// Invoke the native function on a blocking worker, keeping the calling
    /// task free. Marshaling and return conversion stay on the calling
    /// task; the worker touches only raw bytes and the prepared interface.
    pub async fn call_async(&self, args: &[Value]) -> FfiResult<Value> {
        let (cif, extra) = self.select_cif(args)?;
        let scratch = self.marshal_all(args, &extra)?;

        let pending = PendingCall {
            address: self.inner.address,
            cif,
            scratch,
            ret: ReturnStorage::for_desc(&self.inner.ret),
        };

        let pending = tokio::task::spawn_blocking(move || pending.execute())
            .await
            .map_err(|e| FfiError::CallWorkerFailed(e.to_string()))?;

        let result = self.convert_return(&pending.ret)?;
        self.apply_result_check(result, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.inner.name)
            .field("address", &format_args!("{:#x}", self.inner.address))
            .field("args", &self.inner.args.len())
            .finish()
    }
}

/// Snapshot of a marshaled call, built on the calling task and executed on
/// a worker with no host-runtime access. Owns its argument storage, its
/// derived interface (if variadic), the pinned host buffers, and the
/// result destination. Once-only, single-producer/single-consumer.
struct PendingCall {
    address: usize,
    cif: Arc<PreparedCif>,
    scratch: CallScratch,
    ret: ReturnStorage,
}

impl PendingCall {
    /// Worker-side execution: resolve pointers against the storage's final
    /// address, then invoke. Nothing here touches host values.
    fn execute(mut self) -> Self {
        let mut avalues = self.scratch.resolve();
        unsafe {
            self.cif
                .invoke(self.address, self.ret.as_mut_ptr(), avalues.as_mut_ptr());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::{c_char, c_double, c_int};

    extern "C" fn test_add(a: c_int, b: c_int) -> c_int {
        a + b
    }

    extern "C" fn test_scale(x: c_double) -> c_double {
        x * 2.0
    }

    extern "C" fn test_strlen(s: *const c_char) -> c_int {
        if s.is_null() {
            return -1;
        }
        let mut len = 0;
        unsafe {
            while *s.add(len as usize) != 0 {
                len += 1;
            }
        }
        len
    }

    fn bind(
        addr: usize,
        name: &str,
        ret: CType,
        args: &[CType],
    ) -> NativeFunction {
        unsafe {
            NativeFunction::new(
                addr,
                Some(name),
                TypeDesc::Prim(ret),
                args.iter().map(|t| TypeDesc::Prim(*t)).collect(),
                CallOptions::default(),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_call_add() {
        let add = bind(
            test_add as usize,
            "add",
            CType::Int32,
            &[CType::Int32, CType::Int32],
        );
        let result = add.call(&[Value::Number(2.0), Value::Number(3.0)]).unwrap();
        assert_eq!(result, Value::Number(5.0));
    }

    #[test]
    fn test_call_too_few_arguments() {
        let add = bind(
            test_add as usize,
            "add",
            CType::Int32,
            &[CType::Int32, CType::Int32],
        );
        let err = add.call(&[Value::Number(2.0)]).unwrap_err();
        assert_eq!(
            err,
            FfiError::ArgumentCountMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_call_double() {
        let scale = bind(test_scale as usize, "scale", CType::Double, &[CType::Double]);
        let result = scale.call(&[Value::Number(21.0)]).unwrap();
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn test_call_string_argument() {
        let strlen = bind(
            test_strlen as usize,
            "strlen",
            CType::Int32,
            &[CType::CString],
        );
        let result = strlen.call(&[Value::string("hello")]).unwrap();
        assert_eq!(result, Value::Number(5.0));
        // Null converts to the null pointer, not an error.
        let result = strlen.call(&[Value::Null]).unwrap();
        assert_eq!(result, Value::Number(-1.0));
    }

    #[test]
    fn test_null_address_rejected_at_construction() {
        let err = unsafe {
            NativeFunction::new(
                0,
                Some("nothing"),
                TypeDesc::Prim(CType::Void),
                vec![],
                CallOptions::default(),
            )
        }
        .unwrap_err();
        assert!(matches!(err, FfiError::InvalidArgumentValue { .. }));
    }

    #[test]
    fn test_infer_extra_type_heuristic() {
        assert_eq!(
            NativeFunction::infer_extra_type(&Value::string("s")),
            CType::CString
        );
        assert_eq!(
            NativeFunction::infer_extra_type(&Value::Number(3.0)),
            CType::Int32
        );
        assert_eq!(
            NativeFunction::infer_extra_type(&Value::Number(3.5)),
            CType::Double
        );
        assert_eq!(
            NativeFunction::infer_extra_type(&Value::BigInt(1)),
            CType::Int64
        );
        assert_eq!(
            NativeFunction::infer_extra_type(&Value::Null),
            CType::Pointer
        );
    }

    #[test]
    fn test_result_check_replaces_result() {
        let add = bind(
            test_add as usize,
            "add",
            CType::Int32,
            &[CType::Int32, CType::Int32],
        );
        add.set_result_check(Some(Arc::new(|result, callee, args| {
            assert_eq!(callee.name(), "add");
            assert_eq!(args.len(), 2);
            match result {
                Value::Number(n) => Ok(Value::Number(n * 10.0)),
                other => Ok(other),
            }
        })));
        let result = add.call(&[Value::Number(1.0), Value::Number(2.0)]).unwrap();
        assert_eq!(result, Value::Number(30.0));

        add.set_result_check(None);
        let result = add.call(&[Value::Number(1.0), Value::Number(2.0)]).unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn test_result_check_error_propagates() {
        let add = bind(
            test_add as usize,
            "add",
            CType::Int32,
            &[CType::Int32, CType::Int32],
        );
        add.set_result_check(Some(Arc::new(|_, _, _| {
            Err(FfiError::NativeExceptionInCallback("bad result".into()))
        })));
        let err = add.call(&[Value::Number(1.0), Value::Number(2.0)]).unwrap_err();
        assert_eq!(
            err,
            FfiError::NativeExceptionInCallback("bad result".into())
        );
    }
}
