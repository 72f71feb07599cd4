//! The engine's C function-pointer surface.
//!
//! The document engine is a shared object exposing an Office handle and,
//! through it, Document handles; both are plain structs whose first field
//! points at a vtable of C function pointers. Only the operations the
//! worker consumes are declared here; the handles are opaque beyond their
//! vtable pointer.
//!
//! Neither handle is reentrant. Callers never invoke these pointers
//! directly; the wrappers in the parent module serialize every call.

use std::ffi::{c_char, c_int, c_void};

/// Engine callback: numeric event type, payload text (may be null), and
/// the user-data registered with the callback.
pub type CallbackFn = extern "C" fn(n_type: c_int, payload: *const c_char, data: *mut c_void);

/// Password required to view the document.
pub const CALLBACK_DOCUMENT_PASSWORD: c_int = 20;
/// Password required to modify the document.
pub const CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY: c_int = 21;
/// Own-view text cursor moved; payload `x,y,w,h` or `EMPTY`.
pub const CALLBACK_INVALIDATE_VISIBLE_CURSOR: c_int = 1;
/// Own-view cell cursor moved; payload `x,y,w,h` or `EMPTY`.
pub const CALLBACK_CELL_CURSOR: c_int = 17;
/// Another view's text cursor moved; payload is a JSON object.
pub const CALLBACK_INVALIDATE_VIEW_CURSOR: c_int = 24;
/// Another view's cell cursor moved; payload is a JSON object.
pub const CALLBACK_CELL_VIEW_CURSOR: c_int = 26;

/// Enable the password-to-view callback instead of failing the load.
pub const FEATURE_DOCUMENT_PASSWORD: u64 = 1 << 0;
/// Enable the password-to-modify callback.
pub const FEATURE_DOCUMENT_PASSWORD_TO_MODIFY: u64 = 1 << 1;
/// Invalidation callbacks carry the part number.
pub const FEATURE_PART_IN_INVALIDATION_CALLBACK: u64 = 1 << 2;

/// The engine's Office handle.
#[repr(C)]
pub struct OfficeHandle {
    /// Vtable pointer; valid for the life of the handle.
    pub class: *const OfficeClass,
}

/// Office vtable.
#[repr(C)]
pub struct OfficeClass {
    /// Size of this struct, for ABI evolution checks.
    pub size: usize,
    /// Releases the handle. The worker never calls this; the engine is
    /// torn down by process exit only.
    pub destroy: unsafe extern "C" fn(this: *mut OfficeHandle),
    /// Loads a document by URL; returns null on failure.
    pub document_load:
        unsafe extern "C" fn(this: *mut OfficeHandle, url: *const c_char) -> *mut DocumentHandle,
    /// Returns the last error as an engine-allocated string, or null.
    pub get_error: unsafe extern "C" fn(this: *mut OfficeHandle) -> *mut c_char,
    /// Releases strings returned by the engine; absent in older builds.
    pub free_string: Option<unsafe extern "C" fn(text: *mut c_char)>,
    /// Registers the office-global callback.
    pub register_callback: unsafe extern "C" fn(
        this: *mut OfficeHandle,
        callback: Option<CallbackFn>,
        data: *mut c_void,
    ),
    /// Enables optional engine features (`FEATURE_*` bits).
    pub set_optional_features: unsafe extern "C" fn(this: *mut OfficeHandle, features: u64),
    /// Supplies (or, with null, refuses) a document password during load.
    pub set_document_password: unsafe extern "C" fn(
        this: *mut OfficeHandle,
        url: *const c_char,
        password: *const c_char,
    ),
    /// Returns the engine version as an engine-allocated string, or null.
    pub get_version_info:
        Option<unsafe extern "C" fn(this: *mut OfficeHandle) -> *mut c_char>,
}

/// One loaded document.
#[repr(C)]
pub struct DocumentHandle {
    /// Vtable pointer; valid for the life of the handle.
    pub class: *const DocumentClass,
}

/// Document vtable.
#[repr(C)]
pub struct DocumentClass {
    /// Size of this struct, for ABI evolution checks.
    pub size: usize,
    /// Releases the handle. Never called; see [`OfficeClass::destroy`].
    pub destroy: unsafe extern "C" fn(this: *mut DocumentHandle),
    /// Prepares the current view for rendering; takes a JSON option
    /// object.
    pub initialize_for_rendering:
        unsafe extern "C" fn(this: *mut DocumentHandle, options: *const c_char),
    /// Registers the callback for the current view.
    pub register_callback: unsafe extern "C" fn(
        this: *mut DocumentHandle,
        callback: Option<CallbackFn>,
        data: *mut c_void,
    ),
    /// Pixel order of painted tiles (0 RGBA, 1 BGRA).
    pub get_tile_mode: unsafe extern "C" fn(this: *mut DocumentHandle) -> c_int,
    /// Paints a region of one part into a caller-owned 32-bit pixmap.
    #[allow(clippy::type_complexity)]
    pub paint_part_tile: unsafe extern "C" fn(
        this: *mut DocumentHandle,
        buffer: *mut u8,
        part: c_int,
        canvas_width: c_int,
        canvas_height: c_int,
        tile_pos_x: c_int,
        tile_pos_y: c_int,
        tile_width: c_int,
        tile_height: c_int,
    ),
    /// Creates a new view and returns its id.
    pub create_view: unsafe extern "C" fn(this: *mut DocumentHandle) -> c_int,
    /// Destroys a view by id.
    pub destroy_view: unsafe extern "C" fn(this: *mut DocumentHandle, view_id: c_int),
    /// Makes a view current.
    pub set_view: unsafe extern "C" fn(this: *mut DocumentHandle, view_id: c_int),
    /// Id of the current view.
    pub get_view: unsafe extern "C" fn(this: *mut DocumentHandle) -> c_int,
    /// Number of live views.
    pub get_views_count: unsafe extern "C" fn(this: *mut DocumentHandle) -> c_int,
    /// Copies up to `capacity` view ids into `out`; returns the number
    /// written.
    pub get_view_ids: unsafe extern "C" fn(
        this: *mut DocumentHandle,
        out: *mut c_int,
        capacity: usize,
    ) -> c_int,
    /// Queries a command-value JSON blob (engine-allocated, may be null).
    pub get_command_values:
        unsafe extern "C" fn(this: *mut DocumentHandle, command: *const c_char) -> *mut c_char,
    /// Releases strings returned by this document; absent in older
    /// builds.
    pub free_string: Option<unsafe extern "C" fn(text: *mut c_char)>,
}
