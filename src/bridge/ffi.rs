//! `extern "C"` entry points (`llama_bridge_*`).
//!
//! Every function runs inside `catch_unwind`; a panic is logged and turned
//! into the function's failure value. Handles are registry ids carried in
//! the pointer value, never addresses.

use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

use once_cell::sync::Lazy;
use tracing::{error, warn};

use crate::build_info;
use crate::config::BridgeConfig;
use crate::logging;

use super::runtime::{Runtime, TOKENIZE_INVALID};

static RUNTIME: Lazy<Runtime> = Lazy::new(Runtime::new);

/// The process-wide runtime behind the C functions.
pub fn global() -> &'static Runtime {
    &RUNTIME
}

fn guard<T>(op: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(_) => {
            error!(op, "panic caught at the C boundary");
            fallback
        }
    }
}

fn handle_id(handle: *mut c_void, op: &str) -> Option<u64> {
    if handle.is_null() {
        warn!(op, "null handle");
        None
    } else {
        Some(handle as usize as u64)
    }
}

fn handle_ptr(id: u64) -> *mut c_void {
    id as usize as *mut c_void
}

#[no_mangle]
pub extern "C" fn llama_bridge_backend_init() {
    guard("backend_init", (), || {
        let config = BridgeConfig::from_env();
        logging::init_subscriber(&config.log_filter);
        global().init(config);
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_backend_free() {
    guard("backend_free", (), || global().free())
}

/// Load a GGUF model. Returns null on failure.
///
/// # Safety
/// `model_path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_load_model(model_path: *const c_char) -> *mut c_void {
    guard("load_model", ptr::null_mut(), || {
        if model_path.is_null() {
            error!("load_model: null path");
            return ptr::null_mut();
        }
        // SAFETY: non-null and NUL-terminated per the contract above.
        let path = unsafe { CStr::from_ptr(model_path) };
        let Ok(path) = path.to_str() else {
            error!("load_model: path is not valid UTF-8");
            return ptr::null_mut();
        };
        global()
            .load_model(Path::new(path))
            .map_or(ptr::null_mut(), handle_ptr)
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_free_model(model: *mut c_void) {
    guard("free_model", (), || {
        if !model.is_null() {
            global().free_model(model as usize as u64);
        }
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_create_context(model: *mut c_void, n_ctx: i32, n_threads: i32) -> *mut c_void {
    guard("create_context", ptr::null_mut(), || {
        handle_id(model, "create_context")
            .and_then(|id| global().create_context(id, n_ctx, n_threads))
            .map_or(ptr::null_mut(), handle_ptr)
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_free_context(context: *mut c_void) {
    guard("free_context", (), || {
        if !context.is_null() {
            global().free_context(context as usize as u64);
        }
    })
}

/// Tokenize `text` into `tokens[0..n_max_tokens]`.
///
/// Returns the count, `-count` when the buffer is too small (nothing is
/// written), or `INT32_MIN` for invalid arguments.
///
/// # Safety
/// `text` must be null or NUL-terminated. `tokens` must be valid for
/// `n_max_tokens` writes; it may be null only when `n_max_tokens` is 0.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_tokenize(
    model: *mut c_void,
    text: *const c_char,
    tokens: *mut i32,
    n_max_tokens: i32,
    add_bos: bool,
) -> i32 {
    guard("tokenize", TOKENIZE_INVALID, || {
        let Some(id) = handle_id(model, "tokenize") else {
            return TOKENIZE_INVALID;
        };
        if text.is_null() || n_max_tokens < 0 || (tokens.is_null() && n_max_tokens > 0) {
            warn!(n_max_tokens, "tokenize: invalid arguments");
            return TOKENIZE_INVALID;
        }
        // SAFETY: non-null and NUL-terminated per the contract above.
        let text = unsafe { CStr::from_ptr(text) }.to_string_lossy();
        let out: &mut [i32] = if n_max_tokens == 0 {
            &mut []
        } else {
            // SAFETY: caller guarantees `n_max_tokens` writable slots.
            unsafe { std::slice::from_raw_parts_mut(tokens, n_max_tokens as usize) }
        };
        global().tokenize(id, &text, out, add_bos)
    })
}

/// Evaluate `tokens[0..n_tokens]` at position `n_past`.
///
/// Returns 0 on success, 1 when the context is full, -1 for invalid input
/// and -2 for a compute failure.
///
/// # Safety
/// `tokens` must be null or valid for `n_tokens` reads.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_eval(
    context: *mut c_void,
    tokens: *const i32,
    n_tokens: i32,
    n_past: i32,
) -> i32 {
    const INVALID: i32 = -1;
    guard("eval", INVALID, || {
        let Some(id) = handle_id(context, "eval") else {
            return INVALID;
        };
        if tokens.is_null() || n_tokens <= 0 {
            warn!(n_tokens, "eval: empty or null token buffer");
            return INVALID;
        }
        // SAFETY: caller guarantees `n_tokens` readable slots.
        let tokens = unsafe { std::slice::from_raw_parts(tokens, n_tokens as usize) };
        global().eval(id, tokens, n_past).as_code()
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_sample_token(context: *mut c_void) -> i32 {
    guard("sample_token", -1, || {
        handle_id(context, "sample_token").map_or(-1, |id| global().sample_token(id))
    })
}

/// Piece text of `token`, owned by the model. Null on invalid arguments.
#[no_mangle]
pub extern "C" fn llama_bridge_token_to_str(model: *mut c_void, token: i32) -> *const c_char {
    guard("token_to_str", ptr::null(), || {
        handle_id(model, "token_to_str").map_or(ptr::null(), |id| global().token_to_str(id, token))
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_token_eos(model: *mut c_void) -> i32 {
    guard("token_eos", -1, || {
        handle_id(model, "token_eos").map_or(-1, |id| global().token_eos(id))
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_clear_kv_cache(context: *mut c_void) {
    guard("clear_kv_cache", (), || {
        if let Some(id) = handle_id(context, "clear_kv_cache") {
            global().clear_kv_cache(id);
        }
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_n_vocab(model: *mut c_void) -> i32 {
    guard("n_vocab", -1, || {
        handle_id(model, "n_vocab").map_or(-1, |id| global().n_vocab(id))
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_n_ctx(context: *mut c_void) -> i32 {
    guard("n_ctx", -1, || {
        handle_id(context, "n_ctx").map_or(-1, |id| global().n_ctx(id))
    })
}

#[no_mangle]
pub extern "C" fn llama_bridge_ggml_version() -> *const c_char {
    build_info::ggml_version_c().as_ptr()
}

#[no_mangle]
pub extern "C" fn llama_bridge_ggml_commit() -> *const c_char {
    build_info::ggml_commit_c().as_ptr()
}
