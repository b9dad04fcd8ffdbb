//! C ABI entry points for the embedding native host.
//!
//! Status-returning functions return `1` on success and `0` on failure;
//! failures are logged. Lifecycle calls go through one process-wide
//! [`ModuleHost`]. Handle operations go straight to its handle table, so they
//! never wait for a load or unload in progress and may be called from
//! unloading hooks. Values cross the boundary as JSON text; strings returned
//! to the caller are released with [`modhost_free_string`].

#![allow(unsafe_code)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::config::HostConfig;
use crate::handles::{Handle, HandleTable};
use crate::host::bridge;
use crate::host::{HostError, ModuleHost};
use crate::loader::HostExports;

/// Looks up an exported host symbol by name; returns null if unknown.
pub type HostSymbolLookup = unsafe extern "C" fn(host: *mut c_void, symbol: *const c_char) -> *mut c_void;

static HOST: Mutex<Option<ModuleHost>> = parking_lot::const_mutex(None);

// Set together with HOST, which is created at most once.
static HANDLES: OnceLock<Arc<HandleTable>> = OnceLock::new();

/// Host exports reached through the embedder's lookup callback.
struct ProcessExports {
    // The native host handle, stored as an address so the table can be shared.
    host: usize,
    lookup: Option<HostSymbolLookup>,
}

impl HostExports for ProcessExports {
    fn resolve(&self, _library: &str, symbol: &str) -> Option<usize> {
        let lookup = self.lookup?;
        let symbol = CString::new(symbol).ok()?;
        // SAFETY: the embedder promised a callback valid for the process lifetime.
        let address = unsafe { lookup(self.host as *mut c_void, symbol.as_ptr()) };
        (!address.is_null()).then_some(address as usize)
    }
}

fn status(operation: &str, result: Result<(), HostError>) -> u8 {
    match result {
        Ok(()) => 1,
        Err(err) => {
            tracing::error!(operation, error = ?anyhow::Error::from(err), "entry point failed");
            0
        }
    }
}

fn with_host(operation: &str, f: impl FnOnce(&mut ModuleHost) -> Result<(), HostError>) -> u8 {
    let mut guard = HOST.lock();
    let result = match guard.as_mut() {
        Some(host) => f(host),
        None => Err(HostError::NotInitialized),
    };
    status(operation, result)
}

fn handles() -> Option<&'static HandleTable> {
    HANDLES.get().map(Arc::as_ref)
}

/// # Safety
///
/// `ptr` is null or points to a NUL-terminated string that outlives `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// # Safety
///
/// Same contract as [`str_arg`].
unsafe fn path_arg(ptr: *const c_char) -> Option<PathBuf> {
    // SAFETY: forwarded caller contract.
    unsafe { str_arg(ptr) }.map(PathBuf::from)
}

/// # Safety
///
/// Same contract as [`str_arg`].
unsafe fn json_arg(ptr: *const c_char) -> Option<Value> {
    // SAFETY: forwarded caller contract.
    let text = unsafe { str_arg(ptr) }?;
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "argument is not valid JSON");
            None
        }
    }
}

fn json_out<T: Serialize>(value: &T) -> *mut c_char {
    serde_json::to_string(value)
        .ok()
        .and_then(|json| CString::new(json).ok())
        .map_or(std::ptr::null_mut(), CString::into_raw)
}

/// Creates the process-wide host (if needed) and installs the host's exports.
///
/// `config_path` names a YAML host config; null uses the defaults. The config
/// is only read when the host is first created.
///
/// # Safety
///
/// `config_path` is null or a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_initialize(
    host_handle: *mut c_void,
    lookup: Option<HostSymbolLookup>,
    config_path: *const c_char,
) -> u8 {
    // SAFETY: forwarded caller contract.
    let config_path = unsafe { path_arg(config_path) };
    let mut guard = HOST.lock();

    if guard.is_none() {
        let config = match config_path.as_deref().map(HostConfig::from_yaml_file) {
            Some(Ok(config)) => config,
            Some(Err(err)) => {
                tracing::error!(operation = "initialize", error = ?anyhow::Error::from(err), "entry point failed");
                return 0;
            }
            None => HostConfig::default(),
        };
        let host = ModuleHost::new(config);
        let _ = HANDLES.set(Arc::clone(host.handles()));
        *guard = Some(host);
    } else if config_path.is_some() {
        tracing::warn!("module host already exists; config path ignored");
    }

    let Some(host) = guard.as_mut() else {
        return 0;
    };
    let exports = Arc::new(ProcessExports {
        host: host_handle as usize,
        lookup,
    });
    status("initialize", host.initialize(exports))
}

/// Loads the core module from `core_path`, or from the configured path when null.
///
/// # Safety
///
/// `core_path` is null or a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_load_core(core_path: *const c_char) -> u8 {
    // SAFETY: forwarded caller contract.
    let path = unsafe { path_arg(core_path) };
    with_host("load_core", |host| match path {
        Some(path) => host.load_core_from(&path),
        None => host.load_core(),
    })
}

#[no_mangle]
pub extern "C" fn modhost_unload_core() -> u8 {
    with_host("unload_core", ModuleHost::unload_core)
}

/// # Safety
///
/// `module_path` is a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_load_client(module_path: *const c_char) -> u8 {
    // SAFETY: forwarded caller contract.
    let Some(path) = (unsafe { path_arg(module_path) }) else {
        tracing::error!("load_client called without a valid module path");
        return 0;
    };
    with_host("load_client", |host| host.load_client(&path))
}

#[no_mangle]
pub extern "C" fn modhost_unload_client() -> u8 {
    with_host("unload_client", ModuleHost::unload_client)
}

/// Entity and component classes of the loaded client as JSON
/// (`{"entities": [[name, id]], "components": [[name, id]]}`), or null.
#[no_mangle]
pub extern "C" fn modhost_instantiable_classes() -> *mut c_char {
    HOST.lock()
        .as_ref()
        .and_then(ModuleHost::instantiable_classes)
        .map_or(std::ptr::null_mut(), |classes| json_out(&classes))
}

/// Serializable field names of a client type as a JSON array, or null when no
/// client is loaded.
///
/// # Safety
///
/// `type_name` is a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_serializable_fields(type_name: *const c_char) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    let Some(type_name) = (unsafe { str_arg(type_name) }) else {
        return std::ptr::null_mut();
    };
    HOST.lock()
        .as_ref()
        .and_then(|host| host.serializable_fields(type_name))
        .map_or(std::ptr::null_mut(), |fields| json_out(&fields))
}

/// Returns a strong handle to a new client entity, or `0`.
///
/// # Safety
///
/// `type_name` is a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_instantiate_client_entity(
    type_name: *const c_char,
    entity: u32,
    scene: u64,
) -> u64 {
    // SAFETY: forwarded caller contract.
    let Some(type_name) = (unsafe { str_arg(type_name) }) else {
        return 0;
    };
    let guard = HOST.lock();
    let handle = guard
        .as_ref()
        .and_then(|host| host.instantiate_client_entity(type_name, entity, scene));
    Handle::raw_or_null(handle)
}

/// Frees a handle. `0` and already freed handles are ignored.
#[no_mangle]
pub extern "C" fn modhost_destroy_object(handle: u64) {
    if let (Some(handle), Some(table)) = (Handle::from_raw(handle), handles()) {
        table.free(handle);
    }
}

/// Invokes a method on the object behind `handle`.
///
/// `args_json` is a JSON array of arguments; null means no arguments.
///
/// # Safety
///
/// `name` is a NUL-terminated UTF-8 string; `args_json` is null or one.
#[no_mangle]
pub unsafe extern "C" fn modhost_invoke_function(
    handle: u64,
    name: *const c_char,
    args_json: *const c_char,
) -> u8 {
    let (Some(handle), Some(table)) = (Handle::from_raw(handle), handles()) else {
        return 0;
    };
    // SAFETY: forwarded caller contract.
    let Some(name) = (unsafe { str_arg(name) }) else {
        return 0;
    };
    let args = if args_json.is_null() {
        Vec::new()
    } else {
        // SAFETY: forwarded caller contract.
        match unsafe { json_arg(args_json) } {
            Some(Value::Array(args)) => args,
            _ => {
                tracing::warn!(%handle, function = name, "arguments must be a JSON array");
                return 0;
            }
        }
    };
    u8::from(bridge::invoke_function(table, handle, name, &args))
}

#[no_mangle]
pub extern "C" fn modhost_call_on_update(handle: u64, timestep: f64) -> u8 {
    let (Some(handle), Some(table)) = (Handle::from_raw(handle), handles()) else {
        return 0;
    };
    u8::from(bridge::invoke_function(
        table,
        handle,
        bridge::ON_UPDATE,
        &[Value::from(timestep)],
    ))
}

/// Field value as JSON, or null if the handle is dead or the field unknown.
///
/// # Safety
///
/// `name` is a NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn modhost_get_field_value(handle: u64, name: *const c_char) -> *mut c_char {
    let (Some(handle), Some(table)) = (Handle::from_raw(handle), handles()) else {
        return std::ptr::null_mut();
    };
    // SAFETY: forwarded caller contract.
    let Some(name) = (unsafe { str_arg(name) }) else {
        return std::ptr::null_mut();
    };
    bridge::get_field_value(table, handle, name).map_or(std::ptr::null_mut(), |value| json_out(&value))
}

/// # Safety
///
/// `name` and `value_json` are NUL-terminated UTF-8 strings.
#[no_mangle]
pub unsafe extern "C" fn modhost_set_field_value(
    handle: u64,
    name: *const c_char,
    value_json: *const c_char,
) -> u8 {
    let (Some(handle), Some(table)) = (Handle::from_raw(handle), handles()) else {
        return 0;
    };
    // SAFETY: forwarded caller contract.
    let (Some(name), Some(value)) = (unsafe { str_arg(name) }, unsafe { json_arg(value_json) }) else {
        return 0;
    };
    u8::from(bridge::set_field_value(table, handle, name, value))
}

/// Releases a string returned by this library. Null is ignored.
///
/// # Safety
///
/// `ptr` is null or was returned by a `modhost_*` function and not freed yet.
#[no_mangle]
pub unsafe extern "C" fn modhost_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        // SAFETY: produced by CString::into_raw in json_out.
        drop(unsafe { CString::from_raw(ptr) });
    }
}
