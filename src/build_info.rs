//! Build metadata baked in at compile time.
//!
//! `GGML_VERSION` and `GGML_COMMIT` may be set in the build environment;
//! otherwise they fall back to `"1.0.0"` and `"unknown"`.

use std::ffi::CStr;

/// Engine version string reported to hosts.
pub const GGML_VERSION: &str = match option_env!("GGML_VERSION") {
    Some(v) => v,
    None => "1.0.0",
};

/// Engine commit string reported to hosts.
pub const GGML_COMMIT: &str = match option_env!("GGML_COMMIT") {
    Some(v) => v,
    None => "unknown",
};

/// Version of this crate.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

static VERSION_C: once_cell::sync::Lazy<std::ffi::CString> =
    once_cell::sync::Lazy::new(|| to_c_string(GGML_VERSION, "1.0.0"));

static COMMIT_C: once_cell::sync::Lazy<std::ffi::CString> =
    once_cell::sync::Lazy::new(|| to_c_string(GGML_COMMIT, "unknown"));

/// NUL-terminated [`GGML_VERSION`], valid for the life of the process.
pub fn ggml_version_c() -> &'static CStr {
    VERSION_C.as_c_str()
}

/// NUL-terminated [`GGML_COMMIT`], valid for the life of the process.
pub fn ggml_commit_c() -> &'static CStr {
    COMMIT_C.as_c_str()
}

// An interior NUL in a build variable would make it unrepresentable in C.
fn to_c_string(value: &str, fallback: &'static str) -> std::ffi::CString {
    std::ffi::CString::new(value)
        .or_else(|_| std::ffi::CString::new(fallback))
        .unwrap_or_default()
}
