//! The few CoreFoundation calls needed to build and read CF return values.
//!
//! Every `*_create` helper returns an owned (+1) reference.

use std::ffi::{CString, c_void};

use libc::c_char;

pub type CFTypeRef = *const c_void;
pub type CFStringRef = *const c_void;
type CFIndex = isize;

const UTF8: u32 = 0x0800_0100;

#[repr(C)]
pub struct DictionaryCallBacks {
    _opaque: [u8; 0],
}

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    static kCFTypeDictionaryKeyCallBacks: DictionaryCallBacks;
    static kCFTypeDictionaryValueCallBacks: DictionaryCallBacks;

    fn CFStringCreateWithCString(alloc: CFTypeRef, cstr: *const c_char, encoding: u32) -> CFStringRef;
    fn CFStringGetCString(s: CFStringRef, buf: *mut c_char, size: CFIndex, encoding: u32) -> u8;
    fn CFDataCreate(alloc: CFTypeRef, bytes: *const u8, len: CFIndex) -> CFTypeRef;
    fn CFDictionaryCreate(
        alloc: CFTypeRef,
        keys: *const CFTypeRef,
        values: *const CFTypeRef,
        count: CFIndex,
        key_callbacks: *const DictionaryCallBacks,
        value_callbacks: *const DictionaryCallBacks,
    ) -> CFTypeRef;
    fn CFRelease(cf: CFTypeRef);
}

fn non_null(cf: CFTypeRef) -> Option<CFTypeRef> {
    (!cf.is_null()).then_some(cf)
}

pub fn string_create(value: &str) -> Option<CFStringRef> {
    let value = CString::new(value).ok()?;
    non_null(unsafe { CFStringCreateWithCString(std::ptr::null(), value.as_ptr(), UTF8) })
}

pub fn data_create(bytes: &[u8]) -> Option<CFTypeRef> {
    non_null(unsafe { CFDataCreate(std::ptr::null(), bytes.as_ptr(), bytes.len() as CFIndex) })
}

/// Contents of a CFString, or `None` for null or oversized strings.
pub fn string_value(s: CFStringRef) -> Option<String> {
    if s.is_null() {
        return None;
    }
    let mut buf = [0 as c_char; 256];
    if unsafe { CFStringGetCString(s, buf.as_mut_ptr(), buf.len() as CFIndex, UTF8) } == 0 {
        return None;
    }
    let value = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Some(value.to_string_lossy().into_owned())
}

/// Dictionary with string keys. Takes ownership of every value, including
/// on failure; a null value fails the whole dictionary.
pub fn dictionary_create(entries: Vec<(&str, CFTypeRef)>) -> Option<CFTypeRef> {
    let (names, values): (Vec<&str>, Vec<CFTypeRef>) = entries.into_iter().unzip();
    let keys: Vec<CFStringRef> = names
        .iter()
        .map(|name| string_create(name).unwrap_or(std::ptr::null()))
        .collect();

    let complete = keys.iter().chain(&values).all(|cf| !cf.is_null());
    let dict = if complete {
        non_null(unsafe {
            CFDictionaryCreate(
                std::ptr::null(),
                keys.as_ptr(),
                values.as_ptr(),
                keys.len() as CFIndex,
                &raw const kCFTypeDictionaryKeyCallBacks,
                &raw const kCFTypeDictionaryValueCallBacks,
            )
        })
    } else {
        None
    };

    // The dictionary retained what it needs.
    for cf in keys.into_iter().chain(values) {
        release(cf);
    }
    dict
}

pub fn release(cf: CFTypeRef) {
    if !cf.is_null() {
        unsafe { CFRelease(cf) };
    }
}
