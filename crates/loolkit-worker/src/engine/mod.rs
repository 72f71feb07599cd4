//! Native document engine binding.
//!
//! The engine ships as a shared object under `<loTemplate>/program`. The
//! worker opens it once, invokes its fork-safe pre-initialization hook,
//! and only after jail entry obtains the Office handle. Office and
//! Document handles are non-reentrant, so each wrapper owns a mutex and
//! every call goes through a guard; the engine's internal threads invoke
//! our registered callbacks on their own schedule, which is why callback
//! work is queued rather than performed in place.

pub mod ffi;

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
use libloading::Library;
use loolkit_core::png::TileMode;
use tracing::{error, trace};

/// Single-library engine build.
const LIB_MERGED: &str = "libmergedlo.so";
/// Split engine build fallback.
const LIB_SOFFICEAPP: &str = "libsofficeapp.so";

const PREINIT_SYMBOL: &[u8] = b"lok_preinit\0";
const HOOK_SYMBOL: &[u8] = b"libreofficekit_hook_2\0";

/// The in-jail user profile URL handed to the engine.
pub const USER_PROFILE_URL: &str = "file:///user";

type PreInitFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
type HookFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut ffi::OfficeHandle;

/// Errors from loading or initializing the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Neither candidate shared object exists.
    #[error("no engine library under {}: tried {LIB_MERGED} and {LIB_SOFFICEAPP}", program_dir.display())]
    NotFound {
        /// The `program` directory searched.
        program_dir: PathBuf,
    },

    /// `dlopen` failed.
    #[error("failed to load {}: {source}", path.display())]
    Load {
        /// Library path.
        path: PathBuf,
        /// Loader error.
        #[source]
        source: libloading::Error,
    },

    /// A required symbol is absent.
    #[error("missing symbol {name} in engine library: {source}")]
    MissingSymbol {
        /// Symbol name.
        name: &'static str,
        /// Loader error.
        #[source]
        source: libloading::Error,
    },

    /// The pre-initialization hook reported failure.
    #[error("engine pre-initialization returned {code}")]
    PreInitFailed {
        /// Non-zero return value.
        code: i32,
    },

    /// The initialization hook returned a null Office.
    #[error("engine initialization failed")]
    InitFailed,

    /// An argument contained an interior nul byte.
    #[error("nul byte in {what}")]
    NulArgument {
        /// Which argument.
        what: &'static str,
    },
}

fn cstring(what: &'static str, value: &str) -> Result<CString, EngineError> {
    CString::new(value).map_err(|_| EngineError::NulArgument { what })
}

/// Raw engine pointer, shareable across threads.
///
/// Thread safety comes from the wrapper mutexes: every dereference
/// happens under the owning guard, and the engine itself promises handle
/// validity until process exit.
struct RawHandle<T>(*mut T);

unsafe impl<T> Send for RawHandle<T> {}
unsafe impl<T> Sync for RawHandle<T> {}

fn take_engine_string(
    raw: *mut c_char,
    free: Option<unsafe extern "C" fn(*mut c_char)>,
) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    if let Some(free) = free {
        unsafe { free(raw) };
    }
    Some(text)
}

/// The loaded engine shared object.
///
/// Loading also runs `lok_preinit`, which must happen exactly once and
/// before any fork descendants exist. The library mapping is never
/// unloaded; engine-internal threads keep executing out of it until the
/// process exits.
pub struct Engine {
    library: &'static Library,
}

impl Engine {
    /// Opens the engine library under `<lo_template>/program` and runs
    /// pre-initialization.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when no candidate library exists, loading
    /// fails, the hook symbol is absent, or the hook reports failure.
    pub fn load(lo_template: &Path) -> Result<Self, EngineError> {
        let program_dir = lo_template.join("program");
        let candidates = [program_dir.join(LIB_MERGED), program_dir.join(LIB_SOFFICEAPP)];
        let path = candidates
            .iter()
            .find(|candidate| candidate.exists())
            .ok_or(EngineError::NotFound {
                program_dir: program_dir.clone(),
            })?;

        trace!(path = %path.display(), "dlopen engine library");
        let library = unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map_err(
            |source| EngineError::Load {
                path: path.clone(),
                source,
            },
        )?;
        let library: &'static Library = Box::leak(Box::new(Library::from(library)));

        let preinit: libloading::Symbol<'_, PreInitFn> = unsafe { library.get(PREINIT_SYMBOL) }
            .map_err(|source| EngineError::MissingSymbol {
                name: "lok_preinit",
                source,
            })?;

        let install = cstring("install path", &program_dir.to_string_lossy())?;
        let profile = cstring("user profile url", USER_PROFILE_URL)?;
        trace!(install = %program_dir.display(), profile = USER_PROFILE_URL, "lok_preinit");
        let code = unsafe { preinit(install.as_ptr(), profile.as_ptr()) };
        if code != 0 {
            return Err(EngineError::PreInitFailed { code });
        }

        Ok(Self { library })
    }

    /// Obtains the Office handle; called once, after jail entry.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the hook symbol is absent or returns
    /// null.
    pub fn init(&self, install_path: &str, user_profile_url: &str) -> Result<Arc<Office>, EngineError> {
        let hook: libloading::Symbol<'_, HookFn> = unsafe { self.library.get(HOOK_SYMBOL) }
            .map_err(|source| EngineError::MissingSymbol {
                name: "libreofficekit_hook_2",
                source,
            })?;

        let install = cstring("install path", install_path)?;
        let profile = cstring("user profile url", user_profile_url)?;
        trace!(install_path, user_profile_url, "initializing engine office");
        let raw = unsafe { hook(install.as_ptr(), profile.as_ptr()) };
        if raw.is_null() {
            return Err(EngineError::InitFailed);
        }
        // Safety: the hook returned a live handle whose vtable outlives
        // the process.
        Ok(unsafe { Office::from_raw(raw) })
    }
}

/// The engine Office handle with call serialization.
pub struct Office {
    raw: RawHandle<ffi::OfficeHandle>,
    lock: Mutex<()>,
}

impl Office {
    /// Wraps a raw Office handle.
    ///
    /// # Safety
    ///
    /// `raw` must be a live Office handle whose vtable stays valid for
    /// the rest of the process lifetime; the caller hands over all
    /// access, so every further call goes through this wrapper's lock.
    #[must_use]
    pub unsafe fn from_raw(raw: *mut ffi::OfficeHandle) -> Arc<Self> {
        Arc::new(Self {
            raw: RawHandle(raw),
            lock: Mutex::new(()),
        })
    }

    /// Acquires the office mutex for a batch of calls.
    pub fn lock(&self) -> OfficeGuard<'_> {
        OfficeGuard {
            office: self,
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn class(&self) -> &ffi::OfficeClass {
        // Safety: handle validity is an invariant of construction.
        unsafe { &*(*self.raw.0).class }
    }

    /// Supplies (or refuses, with `None`) the document password from
    /// inside the engine's password callback.
    ///
    /// This is the one entry point that bypasses the office mutex: the
    /// engine emits the password callback synchronously from within
    /// `documentLoad`, on the thread that already holds the lock, and a
    /// reply through [`Office::lock`] would deadlock. The engine
    /// serializes this path itself.
    pub fn reply_password_from_callback(&self, url: &str, password: Option<&str>) {
        let Ok(curl) = CString::new(url) else {
            error!(url, "document url contains nul byte; refusing password reply");
            return;
        };
        let cpassword = match password {
            Some(text) => match CString::new(text) {
                Ok(c) => Some(c),
                Err(_) => {
                    error!("password contains nul byte; replying with refusal");
                    None
                }
            },
            None => None,
        };
        let pw_ptr = cpassword
            .as_ref()
            .map_or(std::ptr::null(), |c| c.as_ptr());
        unsafe { (self.class().set_document_password)(self.raw.0, curl.as_ptr(), pw_ptr) };
    }
}

/// Exclusive access to the Office handle.
pub struct OfficeGuard<'a> {
    office: &'a Office,
    _guard: MutexGuard<'a, ()>,
}

impl OfficeGuard<'_> {
    /// Registers the office-global callback.
    pub fn register_callback(&self, callback: Option<ffi::CallbackFn>, data: *mut c_void) {
        unsafe { (self.office.class().register_callback)(self.office.raw.0, callback, data) };
    }

    /// Enables optional engine features.
    pub fn set_optional_features(&self, features: u64) {
        unsafe { (self.office.class().set_optional_features)(self.office.raw.0, features) };
    }

    /// Loads a document; `Ok(None)` when the engine reports failure.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NulArgument`] for urls with interior nul
    /// bytes.
    pub fn document_load(&self, url: &str) -> Result<Option<Arc<EngineDocument>>, EngineError> {
        let curl = cstring("document url", url)?;
        let raw = unsafe { (self.office.class().document_load)(self.office.raw.0, curl.as_ptr()) };
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(Arc::new(EngineDocument {
            raw: RawHandle(raw),
            lock: Mutex::new(()),
        })))
    }

    /// The engine's last error string, if it reports one.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        let class = self.office.class();
        let raw = unsafe { (class.get_error)(self.office.raw.0) };
        take_engine_string(raw, class.free_string)
    }

    /// The engine's version string, if the build exposes it.
    #[must_use]
    pub fn version_info(&self) -> Option<String> {
        let class = self.office.class();
        let get_version_info = class.get_version_info?;
        let raw = unsafe { get_version_info(self.office.raw.0) };
        take_engine_string(raw, class.free_string)
    }
}

/// One loaded engine document with call serialization.
///
/// Created only through [`OfficeGuard::document_load`]; released only by
/// process exit. View creation and destruction never release the handle.
pub struct EngineDocument {
    raw: RawHandle<ffi::DocumentHandle>,
    lock: Mutex<()>,
}

impl EngineDocument {
    /// Acquires the document-engine mutex for a batch of calls.
    pub fn lock(&self) -> DocumentGuard<'_> {
        DocumentGuard {
            doc: self,
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn class(&self) -> &ffi::DocumentClass {
        // Safety: handle validity is an invariant of construction.
        unsafe { &*(*self.raw.0).class }
    }
}

/// Exclusive access to a document handle.
pub struct DocumentGuard<'a> {
    doc: &'a EngineDocument,
    _guard: MutexGuard<'a, ()>,
}

impl DocumentGuard<'_> {
    /// Prepares the current view for rendering.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NulArgument`] for options with interior nul
    /// bytes.
    pub fn initialize_for_rendering(&self, options: &str) -> Result<(), EngineError> {
        let options = cstring("render options", options)?;
        unsafe { (self.doc.class().initialize_for_rendering)(self.doc.raw.0, options.as_ptr()) };
        Ok(())
    }

    /// Registers (or, with `None`, clears) the current view's callback.
    pub fn register_callback(&self, callback: Option<ffi::CallbackFn>, data: *mut c_void) {
        unsafe { (self.doc.class().register_callback)(self.doc.raw.0, callback, data) };
    }

    /// Pixel order of painted tiles.
    #[must_use]
    pub fn tile_mode(&self) -> TileMode {
        TileMode::from_raw(unsafe { (self.doc.class().get_tile_mode)(self.doc.raw.0) })
    }

    /// Paints a twip region of `part` into `buffer` as a
    /// `canvas_width` x `canvas_height` 32-bit pixmap.
    #[allow(clippy::too_many_arguments)]
    pub fn paint_part_tile(
        &self,
        buffer: &mut [u8],
        part: i32,
        canvas_width: u32,
        canvas_height: u32,
        tile_pos_x: i32,
        tile_pos_y: i32,
        tile_width: i32,
        tile_height: i32,
    ) {
        let needed = 4 * canvas_width as usize * canvas_height as usize;
        if buffer.len() < needed {
            error!(
                have = buffer.len(),
                needed, "paint buffer undersized; dropping paint"
            );
            return;
        }
        unsafe {
            (self.doc.class().paint_part_tile)(
                self.doc.raw.0,
                buffer.as_mut_ptr(),
                part,
                canvas_width as c_int,
                canvas_height as c_int,
                tile_pos_x,
                tile_pos_y,
                tile_width,
                tile_height,
            );
        }
    }

    /// Creates a new view and returns its id.
    pub fn create_view(&self) -> i32 {
        unsafe { (self.doc.class().create_view)(self.doc.raw.0) }
    }

    /// Destroys a view by id.
    pub fn destroy_view(&self, view_id: i32) {
        unsafe { (self.doc.class().destroy_view)(self.doc.raw.0, view_id) };
    }

    /// Makes a view current.
    pub fn set_view(&self, view_id: i32) {
        unsafe { (self.doc.class().set_view)(self.doc.raw.0, view_id) };
    }

    /// Id of the current view.
    #[must_use]
    pub fn view(&self) -> i32 {
        unsafe { (self.doc.class().get_view)(self.doc.raw.0) }
    }

    /// Number of live views.
    #[must_use]
    pub fn views_count(&self) -> i32 {
        unsafe { (self.doc.class().get_views_count)(self.doc.raw.0) }
    }

    /// Ids of all live views.
    #[must_use]
    pub fn view_ids(&self) -> Vec<i32> {
        let count = self.views_count();
        if count <= 0 {
            return Vec::new();
        }
        let mut ids = vec![0 as c_int; count as usize];
        let written =
            unsafe { (self.doc.class().get_view_ids)(self.doc.raw.0, ids.as_mut_ptr(), ids.len()) };
        ids.truncate(written.max(0) as usize);
        ids
    }

    /// Queries a command-value JSON blob.
    #[must_use]
    pub fn command_values(&self, command: &str) -> Option<String> {
        let Ok(command) = CString::new(command) else {
            return None;
        };
        let class = self.doc.class();
        let raw = unsafe { (class.get_command_values)(self.doc.raw.0, command.as_ptr()) };
        take_engine_string(raw, class.free_string)
    }
}
