//! Callback trampolines: native-callable entry points into host functions
//!
//! Registration produces a libffi closure whose generated entry point
//! converts native argument bytes to host values, invokes the host
//! function, and converts the result back. Failures inside the host
//! function never cross into native code: they are captured as the "last
//! error", routed to the registered error handler if any, otherwise logged
//! as a warning — the native caller always receives a well-defined zero
//! value.
//!
//! [`Callback`] invokes the host function on whatever thread the native
//! call arrives on. [`ThreadSafeCallback`] additionally supports calls from
//! threads the host runtime does not control: the invocation is handed to
//! the owning thread's [`DispatchQueue`] and the native thread blocks on a
//! one-slot mailbox (mutex + condvar + ready flag) until the result is in.
//!
//! Release is an idempotent compare-and-swap. It detaches the host
//! function, error handler and dispatch hook, after which the trampoline
//! returns zero-filled results without touching host state; the closure
//! allocation itself lives until the owning handle is dropped, so a stored
//! entry-point address stays callable (and inert) for the registration's
//! whole lifetime.

use crate::cif::{CallConv, PreparedCif};
use crate::error::{FfiError, FfiResult};
use crate::layout::TypeDesc;
use crate::marshal;
use crate::types::CType;
use crate::value::Value;
use libffi::low;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{trace, warn};

/// A host function callable from a trampoline.
pub type HostFn = Arc<dyn Fn(&[Value]) -> FfiResult<Value> + Send + Sync>;

const MAILBOX_RESULT_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Shared registration state
// ---------------------------------------------------------------------------

struct CallbackCore {
    released: AtomicBool,
    host_fn: Mutex<Option<HostFn>>,
    error_handler: Mutex<Option<HostFn>>,
    last_error: Mutex<Option<String>>,
    return_type: CType,
    arg_types: Vec<CType>,
}

impl CallbackCore {
    fn new(host_fn: HostFn, return_type: CType, arg_types: Vec<CType>) -> Self {
        CallbackCore {
            released: AtomicBool::new(false),
            host_fn: Mutex::new(Some(host_fn)),
            error_handler: Mutex::new(None),
            last_error: Mutex::new(None),
            return_type,
            arg_types,
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// First caller wins; detaches the host references.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.host_fn.lock() = None;
        *self.error_handler.lock() = None;
        true
    }

    /// Run the host function, applying the error containment policy.
    /// Returns `None` when the result must be zero-filled.
    fn run_host(&self, values: &[Value]) -> Option<Value> {
        let host = self.host_fn.lock().clone()?;
        match host(values) {
            Ok(value) => Some(value),
            Err(err) => {
                let message = err.to_string();
                *self.last_error.lock() = Some(message.clone());
                let handler = self.error_handler.lock().clone();
                match handler {
                    // An error raised by the handler itself is swallowed.
                    Some(handler) => {
                        let _ = handler(&[Value::string(&message)]);
                    }
                    None => warn!(error = %message, "unhandled error in callback"),
                }
                None
            }
        }
    }
}

/// Zero the native return slot. libffi return storage is at least one
/// `ffi_arg` word, so small integers are fully zero-extended.
unsafe fn zero_return(ret: *mut c_void, return_type: CType) {
    if return_type != CType::Void {
        let len = return_type.size().max(std::mem::size_of::<usize>());
        std::ptr::write_bytes(ret as *mut u8, 0, len);
    }
}

/// Write a host result into the native return slot; any conversion failure
/// degrades to the zero fill already in place.
unsafe fn write_return(ret: *mut c_void, return_type: CType, result: Option<Value>) {
    zero_return(ret, return_type);
    if return_type == CType::Void {
        return;
    }
    if let Some(value) = result {
        let slot = std::slice::from_raw_parts_mut(ret as *mut u8, return_type.size());
        let _ = marshal::write_primitive(&value, return_type, slot);
    }
}

/// Convert native argument bytes to host values.
unsafe fn args_to_values(
    args: *const *const c_void,
    types: &[CType],
) -> FfiResult<Vec<Value>> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| marshal::read_primitive_raw(*args.add(i) as *const u8, *ty, None))
        .collect()
}

/// Direct-path invocation shared by both trampoline flavors.
unsafe fn invoke_direct(core: &CallbackCore, args: *const *const c_void, ret: *mut c_void) {
    let values = match args_to_values(args, &core.arg_types) {
        Ok(values) => values,
        Err(err) => {
            *core.last_error.lock() = Some(err.to_string());
            zero_return(ret, core.return_type);
            return;
        }
    };
    let result = core.run_host(&values);
    write_return(ret, core.return_type, result);
}

/// Owns a libffi closure allocation; freed when the handle drops.
struct ClosureHandle(*mut low::ffi_closure);

unsafe impl Send for ClosureHandle {}
unsafe impl Sync for ClosureHandle {}

impl Drop for ClosureHandle {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.0) };
    }
}

// ---------------------------------------------------------------------------
// Direct callback
// ---------------------------------------------------------------------------

struct CallbackData {
    core: CallbackCore,
    // Captured by the closure; must outlive it.
    _cif: PreparedCif,
}

unsafe extern "C" fn callback_handler(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    userdata: &CallbackData,
) {
    let ret = result as *mut c_void;
    if userdata.core.is_released() {
        zero_return(ret, userdata.core.return_type);
        return;
    }
    invoke_direct(&userdata.core, args, ret);
}

/// A host function registered as a native-callable function pointer.
///
/// The host function runs synchronously on the invoking thread and may
/// itself trigger further native calls.
pub struct Callback {
    // Declared before `data`: the closure must be freed before the state it
    // points at.
    closure: ClosureHandle,
    data: Arc<CallbackData>,
    entry: usize,
}

impl Callback {
    /// Register `host_fn` as a native-callable entry point.
    ///
    /// Callback signatures are primitive-typed; construction fails on a
    /// void argument type or an unpreparable call interface.
    pub fn new(
        host_fn: HostFn,
        return_type: CType,
        arg_types: Vec<CType>,
        convention: CallConv,
    ) -> FfiResult<Callback> {
        let cif = prepare_callback_cif(convention, return_type, &arg_types)?;
        let data = Arc::new(CallbackData {
            core: CallbackCore::new(host_fn, return_type, arg_types),
            _cif: cif,
        });

        let (closure, entry) = unsafe {
            alloc_closure(
                data._cif.as_raw(),
                callback_handler,
                Arc::as_ptr(&data),
            )?
        };
        trace!(entry, "callback registered");
        Ok(Callback {
            closure,
            data,
            entry,
        })
    }

    /// The native-callable entry-point address.
    ///
    /// Stays valid (returning zero-filled results) after release, for as
    /// long as this handle is alive.
    pub fn ptr(&self) -> FfiResult<usize> {
        if self.data.core.is_released() {
            return Err(FfiError::CallbackReleased);
        }
        Ok(self.entry)
    }

    /// Idempotent release: the first call detaches the host function and
    /// error handler; later calls are no-ops. In-flight invocations past
    /// their released check are not aborted.
    pub fn release(&self) {
        if self.data.core.release() {
            trace!(entry = self.entry, "callback released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.data.core.is_released()
    }

    pub fn set_error_handler(&self, handler: Option<HostFn>) -> FfiResult<()> {
        if self.data.core.is_released() {
            return Err(FfiError::CallbackReleased);
        }
        *self.data.core.error_handler.lock() = handler;
        Ok(())
    }

    /// Last error captured from the host function, if any.
    pub fn last_error(&self) -> Option<String> {
        self.data.core.last_error.lock().clone()
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        self.release();
        // ClosureHandle frees the trampoline after this.
    }
}

// ---------------------------------------------------------------------------
// Dispatch queue (host execution thread)
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send>;

struct QueueInner {
    owner: ThreadId,
    jobs: Mutex<VecDeque<Job>>,
    cv: Condvar,
}

/// Execution queue owned by the host execution thread.
///
/// Foreign-thread callback invocations enqueue jobs here; the owning
/// thread drains them with [`run_pending`](DispatchQueue::run_pending) or
/// [`wait_and_run`](DispatchQueue::wait_and_run), the way an embedder's
/// event loop services queued work.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    /// Create a queue owned by the current thread.
    pub fn new() -> Self {
        DispatchQueue {
            inner: Arc::new(QueueInner {
                owner: thread::current().id(),
                jobs: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn owner_is_current(&self) -> bool {
        thread::current().id() == self.inner.owner
    }

    fn submit(&self, job: Job) {
        self.inner.jobs.lock().push_back(job);
        self.inner.cv.notify_all();
    }

    /// Run every queued job. Must be called from the owning thread;
    /// returns the number of jobs executed.
    pub fn run_pending(&self) -> usize {
        if !self.owner_is_current() {
            return 0;
        }
        let mut count = 0;
        loop {
            let job = self.inner.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Block up to `timeout` for work, then run everything queued.
    pub fn wait_and_run(&self, timeout: Duration) -> usize {
        if !self.owner_is_current() {
            return 0;
        }
        {
            let mut jobs = self.inner.jobs.lock();
            if jobs.is_empty() {
                self.inner.cv.wait_for(&mut jobs, timeout);
            }
        }
        self.run_pending()
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Thread-safe callback
// ---------------------------------------------------------------------------

struct MailboxSlot {
    ready: bool,
    result: [u8; MAILBOX_RESULT_SIZE],
}

/// One-slot result mailbox: the mutex guards the shared result buffer, the
/// condvar signals the result-ready flag.
struct Mailbox {
    slot: Mutex<MailboxSlot>,
    cv: Condvar,
}

struct TscData {
    core: CallbackCore,
    _cif: PreparedCif,
    owner: ThreadId,
    /// Detached on release so no further cross-thread work is queued.
    queue: Mutex<Option<DispatchQueue>>,
    mailbox: Mailbox,
    /// Serializes cross-thread invocations: one in flight per registration.
    serialize: Mutex<()>,
    /// Lets the trampoline hand an owning reference to the queued job.
    self_ref: Mutex<Weak<TscData>>,
}

impl TscData {
    /// Owner-thread side of a cross-thread invocation: run the host
    /// function and publish the result through the mailbox.
    fn run_queued(self: &Arc<Self>, arg_bytes: Vec<Vec<u8>>) {
        // Closes the race between release and an in-flight call: checked
        // again here, on the consuming side.
        let result = if self.core.is_released() {
            None
        } else {
            let values: FfiResult<Vec<Value>> = self
                .core
                .arg_types
                .iter()
                .zip(&arg_bytes)
                .map(|(ty, bytes)| unsafe {
                    marshal::read_primitive_raw(bytes.as_ptr(), *ty, None)
                })
                .collect();
            match values {
                Ok(values) => self.core.run_host(&values),
                Err(err) => {
                    *self.core.last_error.lock() = Some(err.to_string());
                    None
                }
            }
        };

        let mut slot = self.mailbox.slot.lock();
        slot.result = [0u8; MAILBOX_RESULT_SIZE];
        if self.core.return_type != CType::Void {
            if let Some(value) = result {
                let size = self.core.return_type.size();
                let _ = marshal::write_primitive(
                    &value,
                    self.core.return_type,
                    &mut slot.result[..size],
                );
            }
        }
        slot.ready = true;
        drop(slot);
        self.mailbox.cv.notify_all();
    }
}

unsafe extern "C" fn tsc_handler(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    userdata: &TscData,
) {
    let ret = result as *mut c_void;
    if userdata.core.is_released() {
        zero_return(ret, userdata.core.return_type);
        return;
    }

    if thread::current().id() == userdata.owner {
        // Fast path: already on the host execution thread.
        invoke_direct(&userdata.core, args, ret);
        return;
    }

    // Foreign thread: serialize, snapshot arguments, queue, block.
    let strong = match userdata.self_ref.lock().upgrade() {
        Some(strong) => strong,
        None => {
            zero_return(ret, userdata.core.return_type);
            return;
        }
    };
    let _serial = strong.serialize.lock();

    // Re-check after taking the serialization lock.
    if strong.core.is_released() {
        zero_return(ret, strong.core.return_type);
        return;
    }

    let queue = strong.queue.lock().clone();
    let Some(queue) = queue else {
        zero_return(ret, strong.core.return_type);
        return;
    };

    let arg_bytes: Vec<Vec<u8>> = strong
        .core
        .arg_types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let mut bytes = vec![0u8; ty.size()];
            std::ptr::copy_nonoverlapping(*args.add(i) as *const u8, bytes.as_mut_ptr(), ty.size());
            bytes
        })
        .collect();

    {
        let mut slot = strong.mailbox.slot.lock();
        slot.ready = false;
        slot.result = [0u8; MAILBOX_RESULT_SIZE];
    }

    trace!("cross-thread callback queued");
    let job_data = strong.clone();
    queue.submit(Box::new(move || job_data.run_queued(arg_bytes)));

    // Block the native thread until the owning thread publishes the result.
    let mut slot = strong.mailbox.slot.lock();
    while !slot.ready {
        strong.mailbox.cv.wait(&mut slot);
    }
    zero_return(ret, strong.core.return_type);
    if strong.core.return_type != CType::Void {
        let size = strong.core.return_type.size();
        std::ptr::copy_nonoverlapping(slot.result.as_ptr(), ret as *mut u8, size);
    }
}

/// A callback whose entry point may be invoked from native threads the
/// host runtime does not control.
///
/// Invocations from the owning thread run the host function directly;
/// invocations from any other thread are handed to the owning thread's
/// [`DispatchQueue`] while the native thread blocks for the result — a
/// deliberate backpressure mechanism.
pub struct ThreadSafeCallback {
    closure: ClosureHandle,
    data: Arc<TscData>,
    entry: usize,
}

impl ThreadSafeCallback {
    /// Register `host_fn` with cross-thread dispatch through `queue`.
    /// The queue's owning thread becomes this registration's host
    /// execution thread.
    pub fn new(
        queue: &DispatchQueue,
        host_fn: HostFn,
        return_type: CType,
        arg_types: Vec<CType>,
        convention: CallConv,
    ) -> FfiResult<ThreadSafeCallback> {
        let cif = prepare_callback_cif(convention, return_type, &arg_types)?;
        let data = Arc::new(TscData {
            core: CallbackCore::new(host_fn, return_type, arg_types),
            _cif: cif,
            owner: queue.inner.owner,
            queue: Mutex::new(Some(queue.clone())),
            mailbox: Mailbox {
                slot: Mutex::new(MailboxSlot {
                    ready: false,
                    result: [0u8; MAILBOX_RESULT_SIZE],
                }),
                cv: Condvar::new(),
            },
            serialize: Mutex::new(()),
            self_ref: Mutex::new(Weak::new()),
        });
        *data.self_ref.lock() = Arc::downgrade(&data);

        let (closure, entry) =
            unsafe { alloc_closure(data._cif.as_raw(), tsc_handler, Arc::as_ptr(&data))? };
        trace!(entry, "thread-safe callback registered");
        Ok(ThreadSafeCallback {
            closure,
            data,
            entry,
        })
    }

    /// The native-callable entry-point address.
    pub fn ptr(&self) -> FfiResult<usize> {
        if self.data.core.is_released() {
            return Err(FfiError::CallbackReleased);
        }
        Ok(self.entry)
    }

    /// Idempotent release; also detaches the dispatch queue so no further
    /// cross-thread work is queued.
    pub fn release(&self) {
        if self.data.core.release() {
            *self.data.queue.lock() = None;
            trace!(entry = self.entry, "thread-safe callback released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.data.core.is_released()
    }

    pub fn set_error_handler(&self, handler: Option<HostFn>) -> FfiResult<()> {
        if self.data.core.is_released() {
            return Err(FfiError::CallbackReleased);
        }
        *self.data.core.error_handler.lock() = handler;
        Ok(())
    }

    pub fn last_error(&self) -> Option<String> {
        self.data.core.last_error.lock().clone()
    }
}

impl Drop for ThreadSafeCallback {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

fn prepare_callback_cif(
    convention: CallConv,
    return_type: CType,
    arg_types: &[CType],
) -> FfiResult<PreparedCif> {
    if arg_types.contains(&CType::Void) {
        return Err(FfiError::invalid_value("callback argument type", "void"));
    }
    let ret = TypeDesc::Prim(return_type);
    let args: Vec<TypeDesc> = arg_types.iter().map(|ty| TypeDesc::Prim(*ty)).collect();
    PreparedCif::new(convention, &ret, &args)
}

/// Allocate and prepare a libffi closure around `handler`.
///
/// # Safety
///
/// `cif` and `userdata` must outlive the returned handle; `handler` must
/// match the cif's signature.
unsafe fn alloc_closure<U>(
    cif: *mut low::ffi_cif,
    handler: low::Callback<U, c_void>,
    userdata: *const U,
) -> FfiResult<(ClosureHandle, usize)> {
    let (closure, code) = low::closure_alloc();
    if closure.is_null() {
        return Err(FfiError::CallInterfacePreparationFailed(
            "closure allocation failed".to_string(),
        ));
    }
    if let Err(e) = low::prep_closure(closure, cif, handler, userdata, code) {
        low::closure_free(closure);
        return Err(FfiError::CallInterfacePreparationFailed(format!("{e:?}")));
    }
    Ok((ClosureHandle(closure), code.0 as usize))
}
