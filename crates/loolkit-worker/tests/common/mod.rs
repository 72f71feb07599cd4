//! Shared stub engine for integration tests.
//!
//! Implements the engine's function-pointer surface in process so the
//! document manager and control loop can be driven without the real
//! shared object.

#![allow(dead_code)]

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use loolkit_worker::engine::ffi::{
    CallbackFn, DocumentClass, DocumentHandle, OfficeClass, OfficeHandle,
    CALLBACK_DOCUMENT_PASSWORD, CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY,
};
use loolkit_worker::engine::Office;

/// The only password the stub accepts.
pub const CORRECT_PASSWORD: &str = "secret";

/// Tracked-change author colors reported by `get_command_values`.
pub const AUTHOR_COLORS: &str = r#"{"authors":[{"name":"Alice","color":255}]}"#;

#[derive(Default)]
pub struct OfficeState {
    pub callback: Option<(CallbackFn, usize)>,
    pub features: u64,
    pub password_replies: Vec<Option<String>>,
    pub document: Option<usize>,
}

#[repr(C)]
pub struct StubOffice {
    handle: OfficeHandle,
    pub state: Mutex<OfficeState>,
}

#[derive(Default)]
pub struct DocumentState {
    pub views: Vec<i32>,
    pub current_view: i32,
    pub callback: Option<(CallbackFn, usize)>,
    pub paints: Vec<(i32, i32, i32, i32, i32, i32, i32)>,
    pub render_options: Vec<String>,
}

#[repr(C)]
pub struct StubDocument {
    handle: DocumentHandle,
    next_view: AtomicI32,
    pub state: Mutex<DocumentState>,
}

impl StubDocument {
    fn new() -> Self {
        let doc = Self {
            handle: DocumentHandle {
                class: &DOCUMENT_CLASS,
            },
            next_view: AtomicI32::new(2),
            state: Mutex::new(DocumentState::default()),
        };
        // Loading creates the first view implicitly.
        {
            let mut state = doc.state.lock().unwrap();
            state.views.push(1);
            state.current_view = 1;
        }
        doc
    }
}

/// Creates a leaked stub office plus the worker-facing wrapper.
pub fn new_office() -> (&'static StubOffice, Arc<Office>) {
    let office = Box::leak(Box::new(StubOffice {
        handle: OfficeHandle {
            class: &OFFICE_CLASS,
        },
        state: Mutex::new(OfficeState::default()),
    }));
    let raw = office as *mut StubOffice as *mut OfficeHandle;
    let wrapper = unsafe { Office::from_raw(raw) };
    (office, wrapper)
}

/// The stub document the last successful load produced.
pub fn loaded_document(office: &StubOffice) -> Option<&'static StubDocument> {
    let raw = office.state.lock().unwrap().document?;
    Some(unsafe { &*(raw as *const StubDocument) })
}

static OFFICE_CLASS: OfficeClass = OfficeClass {
    size: std::mem::size_of::<OfficeClass>(),
    destroy: office_destroy,
    document_load,
    get_error,
    free_string: Some(free_string),
    register_callback: office_register_callback,
    set_optional_features,
    set_document_password,
    get_version_info: Some(get_version_info),
};

static DOCUMENT_CLASS: DocumentClass = DocumentClass {
    size: std::mem::size_of::<DocumentClass>(),
    destroy: document_destroy,
    initialize_for_rendering,
    register_callback: document_register_callback,
    get_tile_mode,
    paint_part_tile,
    create_view,
    destroy_view,
    set_view,
    get_view,
    get_views_count,
    get_view_ids,
    get_command_values,
    free_string: Some(free_string),
};

unsafe fn office_of(this: *mut OfficeHandle) -> &'static StubOffice {
    &*(this as *const StubOffice)
}

unsafe fn document_of(this: *mut DocumentHandle) -> &'static StubDocument {
    &*(this as *const StubDocument)
}

unsafe extern "C" fn office_destroy(_this: *mut OfficeHandle) {}

unsafe extern "C" fn document_load(
    this: *mut OfficeHandle,
    url: *const c_char,
) -> *mut DocumentHandle {
    let office = office_of(this);
    let url = CStr::from_ptr(url).to_string_lossy().into_owned();

    if url.contains("broken") {
        return std::ptr::null_mut();
    }

    let fire = |kind: c_int| {
        let callback = office.state.lock().unwrap().callback;
        if let Some((callback, data)) = callback {
            callback(kind, std::ptr::null(), data as *mut c_void);
        }
    };

    if url.contains("password") {
        let kind = if url.contains("to-modify") {
            CALLBACK_DOCUMENT_PASSWORD_TO_MODIFY
        } else {
            CALLBACK_DOCUMENT_PASSWORD
        };
        fire(kind);
        let reply = office
            .state
            .lock()
            .unwrap()
            .password_replies
            .last()
            .cloned()
            .flatten();
        match reply {
            None => return std::ptr::null_mut(),
            Some(password) if password == CORRECT_PASSWORD => {}
            Some(_) => {
                // The real engine re-prompts on a wrong password; the
                // worker is expected to refuse the second prompt.
                fire(kind);
                return std::ptr::null_mut();
            }
        }
    }

    let document = Box::leak(Box::new(StubDocument::new()));
    let raw = document as *mut StubDocument;
    office.state.lock().unwrap().document = Some(raw as usize);
    raw as *mut DocumentHandle
}

unsafe extern "C" fn get_error(_this: *mut OfficeHandle) -> *mut c_char {
    CString::new("stub load error").unwrap().into_raw()
}

unsafe extern "C" fn free_string(text: *mut c_char) {
    if !text.is_null() {
        drop(CString::from_raw(text));
    }
}

unsafe extern "C" fn office_register_callback(
    this: *mut OfficeHandle,
    callback: Option<CallbackFn>,
    data: *mut c_void,
) {
    office_of(this).state.lock().unwrap().callback =
        callback.map(|callback| (callback, data as usize));
}

unsafe extern "C" fn set_optional_features(this: *mut OfficeHandle, features: u64) {
    office_of(this).state.lock().unwrap().features = features;
}

unsafe extern "C" fn set_document_password(
    this: *mut OfficeHandle,
    _url: *const c_char,
    password: *const c_char,
) {
    let reply = if password.is_null() {
        None
    } else {
        Some(CStr::from_ptr(password).to_string_lossy().into_owned())
    };
    office_of(this)
        .state
        .lock()
        .unwrap()
        .password_replies
        .push(reply);
}

unsafe extern "C" fn get_version_info(_this: *mut OfficeHandle) -> *mut c_char {
    CString::new("stub-engine 1.0").unwrap().into_raw()
}

unsafe extern "C" fn document_destroy(_this: *mut DocumentHandle) {}

unsafe extern "C" fn initialize_for_rendering(
    this: *mut DocumentHandle,
    options: *const c_char,
) {
    let options = if options.is_null() {
        String::new()
    } else {
        CStr::from_ptr(options).to_string_lossy().into_owned()
    };
    document_of(this)
        .state
        .lock()
        .unwrap()
        .render_options
        .push(options);
}

unsafe extern "C" fn document_register_callback(
    this: *mut DocumentHandle,
    callback: Option<CallbackFn>,
    data: *mut c_void,
) {
    document_of(this).state.lock().unwrap().callback =
        callback.map(|callback| (callback, data as usize));
}

unsafe extern "C" fn get_tile_mode(_this: *mut DocumentHandle) -> c_int {
    0 // RGBA
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn paint_part_tile(
    this: *mut DocumentHandle,
    buffer: *mut u8,
    part: c_int,
    canvas_width: c_int,
    canvas_height: c_int,
    tile_pos_x: c_int,
    tile_pos_y: c_int,
    tile_width: c_int,
    tile_height: c_int,
) {
    let pixels = std::slice::from_raw_parts_mut(
        buffer,
        4 * canvas_width as usize * canvas_height as usize,
    );
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[0xab, 0xcd, 0xef, 0xff]);
    }
    document_of(this).state.lock().unwrap().paints.push((
        part,
        canvas_width,
        canvas_height,
        tile_pos_x,
        tile_pos_y,
        tile_width,
        tile_height,
    ));
}

unsafe extern "C" fn create_view(this: *mut DocumentHandle) -> c_int {
    let doc = document_of(this);
    let id = doc.next_view.fetch_add(1, Ordering::SeqCst);
    let mut state = doc.state.lock().unwrap();
    state.views.push(id);
    state.current_view = id;
    id
}

unsafe extern "C" fn destroy_view(this: *mut DocumentHandle, view_id: c_int) {
    document_of(this)
        .state
        .lock()
        .unwrap()
        .views
        .retain(|&view| view != view_id);
}

unsafe extern "C" fn set_view(this: *mut DocumentHandle, view_id: c_int) {
    document_of(this).state.lock().unwrap().current_view = view_id;
}

unsafe extern "C" fn get_view(this: *mut DocumentHandle) -> c_int {
    document_of(this).state.lock().unwrap().current_view
}

unsafe extern "C" fn get_views_count(this: *mut DocumentHandle) -> c_int {
    document_of(this).state.lock().unwrap().views.len() as c_int
}

unsafe extern "C" fn get_view_ids(
    this: *mut DocumentHandle,
    out: *mut c_int,
    capacity: usize,
) -> c_int {
    let state = document_of(this).state.lock().unwrap();
    let count = state.views.len().min(capacity);
    for (index, &view) in state.views.iter().take(count).enumerate() {
        *out.add(index) = view;
    }
    count as c_int
}

unsafe extern "C" fn get_command_values(
    this: *mut DocumentHandle,
    command: *const c_char,
) -> *mut c_char {
    let _ = document_of(this);
    let command = CStr::from_ptr(command).to_string_lossy();
    if command == ".uno:TrackedChangeAuthors" {
        CString::new(AUTHOR_COLORS).unwrap().into_raw()
    } else {
        std::ptr::null_mut()
    }
}
