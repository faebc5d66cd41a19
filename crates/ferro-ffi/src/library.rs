//! Dynamic library loading and symbol resolution
//!
//! Cross-platform loading on top of `libloading`, with platform-specific
//! naming conventions and search paths. Thin by design: the interesting
//! work happens in the call engine once an address is resolved.

use crate::call::{CallOptions, NativeFunction};
use crate::error::{FfiError, FfiResult};
use crate::layout::TypeDesc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A loaded dynamic library.
///
/// The underlying handle is reference-counted: every [`NativeFunction`]
/// bound through [`Library::bind`] keeps the library loaded, so bindings
/// may outlive the `Library` value itself.
pub struct Library {
    inner: Arc<libloading::Library>,
    path: PathBuf,
}

impl Library {
    /// Load a library by short name (`"m"`), file name (`"libm.so.6"`) or
    /// absolute path, searching platform-standard locations.
    pub fn open(name: &str) -> FfiResult<Library> {
        Self::open_with_paths(name, &[])
    }

    /// Like [`open`](Library::open), trying `extra_paths` first.
    pub fn open_with_paths(name: &str, extra_paths: &[PathBuf]) -> FfiResult<Library> {
        let path = resolve_library_path(name, extra_paths)
            .ok_or_else(|| FfiError::LibraryNotFound(name.to_string()))?;
        // Loading runs the library's initialization code; the caller is
        // trusting that code by asking for the load.
        let library = unsafe { libloading::Library::new(&path) }
            .map_err(|e| FfiError::LibraryLoadFailed(e.to_string()))?;
        debug!(path = %path.display(), "library loaded");
        Ok(Library {
            inner: Arc::new(library),
            path,
        })
    }

    /// Resolved filesystem path of the loaded library.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a symbol to its raw address.
    ///
    /// # Safety
    ///
    /// The caller must only use the address in ways consistent with the
    /// symbol's actual type.
    pub unsafe fn symbol(&self, name: &str) -> FfiResult<usize> {
        let sym: libloading::Symbol<'_, unsafe extern "C" fn()> =
            self.inner
                .get(name.as_bytes())
                .map_err(|_| FfiError::SymbolNotFound {
                    library: self.path.display().to_string(),
                    symbol: name.to_string(),
                })?;
        Ok(*sym as usize)
    }

    /// Resolve `symbol` and bind it as a callable [`NativeFunction`].
    ///
    /// # Safety
    ///
    /// The symbol's true signature must match `ret`/`args` under
    /// `options.convention`.
    pub unsafe fn bind(
        &self,
        symbol: &str,
        ret: TypeDesc,
        args: Vec<TypeDesc>,
        options: CallOptions,
    ) -> FfiResult<NativeFunction> {
        let address = self.symbol(symbol)?;
        NativeFunction::with_origin(
            address,
            Some(symbol),
            ret,
            args,
            options,
            Some(self.inner.clone()),
        )
    }
}

/// Platform-standard library search paths, current directory first.
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        if cfg!(target_pointer_width = "64") {
            paths.push(PathBuf::from("/usr/lib64"));
            paths.push(PathBuf::from("/lib64"));
            paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
            paths.push(PathBuf::from("/lib/x86_64-linux-gnu"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));
        if let Ok(system_root) = std::env::var("SystemRoot") {
            paths.push(PathBuf::from(format!("{}\\System32", system_root)));
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.insert(0, cwd);
    }

    paths
}

/// Resolve a library name to a full path with platform naming conventions:
/// `lib{name}.so` on Linux, `lib{name}.dylib` on macOS, `{name}.dll` on
/// Windows, trying each search path in order.
fn resolve_library_path(name: &str, extra_paths: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_absolute() && direct.exists() {
        return Some(direct.to_path_buf());
    }

    let extensions: &[&str] = if cfg!(target_os = "windows") {
        &["dll"]
    } else if cfg!(target_os = "macos") {
        &["dylib", "so"]
    } else {
        &["so"]
    };

    let prefixes: &[&str] = if cfg!(target_os = "windows") {
        &["", "lib"]
    } else {
        &["lib", ""]
    };

    let mut search_paths = extra_paths.to_vec();
    search_paths.extend(default_search_paths());

    for search_path in &search_paths {
        // Exact file name as given (covers versioned names like libm.so.6).
        let as_given = search_path.join(name);
        if as_given.exists() {
            return Some(as_given);
        }
        for prefix in prefixes {
            for ext in extensions {
                let filename = format!("{prefix}{name}.{ext}");
                let full_path = search_path.join(&filename);
                if full_path.exists() {
                    return Some(full_path);
                }
            }
        }
    }

    None
}
