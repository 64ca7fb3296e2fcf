//! The C-ABI `dl*` surface exported to the C library.
//!
//! Handles are raw pointers to registry entries, which stay valid for the
//! process lifetime because objects are never unloaded.

use crate::linker;
use alloc::ffi::CString;
use alloc::string::ToString;
use core::{
    cell::UnsafeCell,
    ffi::{CStr, c_char, c_int, c_void},
    ptr::{null, null_mut},
};
use rtld::LoadedObject;

/// The message storage behind `dlerror`: the pending diagnostic plus the
/// one most recently reported, which backs the pointer handed out until
/// the next report.
struct ErrorSlots {
    pending: Option<CString>,
    reported: Option<CString>,
}

struct LastError(UnsafeCell<ErrorSlots>);

unsafe impl Sync for LastError {}

static LAST_ERROR: LastError = LastError(UnsafeCell::new(ErrorSlots {
    pending: None,
    reported: None,
}));

fn record_error(msg: CString) {
    unsafe {
        (*LAST_ERROR.0.get()).pending = Some(msg);
    }
}

fn pull_linker_error() {
    if let Some(linker) = linker() {
        if let Some(err) = linker.dlerror() {
            if let Ok(msg) = CString::new(err.to_string()) {
                record_error(msg);
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlopen(name: *const c_char, _flags: c_int) -> *mut c_void {
    let Some(linker) = linker() else {
        return null_mut();
    };
    // A null name yields the main program, the conventional "global" handle.
    if name.is_null() {
        return linker
            .objects()
            .first()
            .map(|obj| obj as *const LoadedObject as *mut c_void)
            .unwrap_or(null_mut());
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        record_error(c"dlopen: invalid object name".into());
        return null_mut();
    };
    match linker.dlopen(name) {
        Some(handle) => handle.as_ptr() as *mut c_void,
        None => {
            pull_linker_error();
            null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    let Some(linker) = linker() else {
        return null_mut();
    };
    let Ok(name) = (unsafe { CStr::from_ptr(name) }).to_str() else {
        record_error(c"dlsym: invalid symbol name".into());
        return null_mut();
    };
    let object = if handle.is_null() {
        None
    } else {
        Some(unsafe { &*(handle as *const LoadedObject) })
    };
    match linker.dlsym(object, name) {
        Some(ptr) => ptr as *mut c_void,
        None => {
            pull_linker_error();
            null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    // Objects stay resident; closing only validates the handle.
    let Some(linker) = linker() else {
        return -1;
    };
    let object = if handle.is_null() {
        None
    } else {
        Some(unsafe { &*(handle as *const LoadedObject) })
    };
    linker.dlclose(object)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dlerror() -> *const c_char {
    unsafe {
        let slots = &mut *LAST_ERROR.0.get();
        match slots.pending.take() {
            Some(msg) => {
                slots.reported = Some(msg);
                slots.reported.as_ref().unwrap().as_ptr()
            }
            None => null(),
        }
    }
}
