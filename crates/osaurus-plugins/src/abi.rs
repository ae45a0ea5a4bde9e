//! The stable C ABI every external plugin exports.
//!
//! A plugin is a shared library exporting one symbol,
//! `osaurus_plugin_entry()`, returning a pointer to a vtable of five
//! function pointers. Every string crossing the boundary is NUL-terminated
//! UTF-8 allocated by the plugin and released through the vtable's
//! `free_string` — never by the host allocator.

use std::ffi::{CStr, c_char, c_void};

/// Opaque per-plugin context, created by `init` and owned by the loader
/// until `destroy`.
pub type RawContext = *mut c_void;

pub type FreeStringFn = unsafe extern "C" fn(*const c_char);
pub type InitFn = unsafe extern "C" fn() -> RawContext;
pub type DestroyFn = unsafe extern "C" fn(RawContext);
pub type GetManifestFn = unsafe extern "C" fn(RawContext) -> *const c_char;
/// `invoke(ctx, type, id, payload)` — the single generic extension point.
/// `type` discriminates the capability kind; tools use [`INVOKE_KIND_TOOL`].
pub type InvokeFn = unsafe extern "C" fn(
    RawContext,
    *const c_char,
    *const c_char,
    *const c_char,
) -> *const c_char;

#[repr(C)]
pub struct PluginApi {
    pub free_string: FreeStringFn,
    pub init: InitFn,
    pub destroy: DestroyFn,
    pub get_manifest: GetManifestFn,
    pub invoke: InvokeFn,
}

/// Symbol resolved from every plugin dylib. NUL-terminated for `dlsym`.
pub const ENTRY_SYMBOL: &[u8] = b"osaurus_plugin_entry\0";

/// Signature of the entry symbol. Returns `*const PluginApi`.
pub type EntryFn = unsafe extern "C" fn() -> *const c_void;

/// Capability discriminator passed as `invoke`'s `type` for tool calls.
pub const INVOKE_KIND_TOOL: &str = "tool";

/// Copy a plugin-allocated string into host memory, then release the
/// plugin's allocation.
///
/// Returns `None` for a null pointer. Invalid UTF-8 is replaced rather than
/// rejected, so a misbehaving plugin cannot wedge a call.
///
/// # Safety
///
/// `ptr` must be null or a live NUL-terminated allocation owned by the
/// plugin behind `api`, not yet freed.
pub unsafe fn take_plugin_string(api: &PluginApi, ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe {
        let s = CStr::from_ptr(ptr).to_string_lossy().into_owned();
        (api.free_string)(ptr);
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    unsafe extern "C" fn free_string(ptr: *const c_char) {
        if !ptr.is_null() {
            unsafe { drop(CString::from_raw(ptr as *mut c_char)) };
        }
    }
    unsafe extern "C" fn init() -> RawContext {
        std::ptr::null_mut()
    }
    unsafe extern "C" fn destroy(_ctx: RawContext) {}
    unsafe extern "C" fn get_manifest(_ctx: RawContext) -> *const c_char {
        std::ptr::null()
    }
    unsafe extern "C" fn invoke(
        _ctx: RawContext,
        _kind: *const c_char,
        _id: *const c_char,
        _payload: *const c_char,
    ) -> *const c_char {
        std::ptr::null()
    }

    fn api() -> PluginApi {
        PluginApi {
            free_string,
            init,
            destroy,
            get_manifest,
            invoke,
        }
    }

    #[test]
    fn take_plugin_string_handles_null() {
        let api = api();
        assert!(unsafe { take_plugin_string(&api, std::ptr::null()) }.is_none());
    }

    #[test]
    fn take_plugin_string_copies_and_frees() {
        let api = api();
        let ptr = CString::new("hello").unwrap().into_raw();
        let s = unsafe { take_plugin_string(&api, ptr) };
        assert_eq!(s.as_deref(), Some("hello"));
    }
}
