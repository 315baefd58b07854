//! Drives the `llama_bridge_*` C functions end to end against the global
//! runtime. The global backend can only be initialized once per process,
//! so the whole lifecycle runs in a single test.

mod common;

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;

use llama_bridge::bridge::ffi::*;
use llama_bridge::bridge::{global, BackendState, TOKENIZE_INVALID};

use common::{token_id, write_tiny_llama, BOS_ID, EOS_ID};

#[test]
fn test_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tiny_llama(dir.path());
    let c_path = CString::new(path.to_str().unwrap()).unwrap();

    // Nothing works before init.
    assert!(unsafe { llama_bridge_load_model(c_path.as_ptr()) }.is_null());

    llama_bridge_backend_init();
    assert_eq!(global().state(), BackendState::Initialized);
    // Idempotent.
    llama_bridge_backend_init();
    assert_eq!(global().state(), BackendState::Initialized);

    // Load failures.
    let missing = CString::new("/nonexistent/model.gguf").unwrap();
    assert!(unsafe { llama_bridge_load_model(missing.as_ptr()) }.is_null());
    assert!(unsafe { llama_bridge_load_model(ptr::null()) }.is_null());
    assert!(llama_bridge_create_context(ptr::null_mut(), 16, 1).is_null());

    let model = unsafe { llama_bridge_load_model(c_path.as_ptr()) };
    assert!(!model.is_null());
    let model_arc = global().model(model as usize as u64).unwrap();

    let n_vocab = llama_bridge_n_vocab(model);
    assert_eq!(n_vocab as usize, common::n_vocab());
    assert_eq!(llama_bridge_token_eos(model), EOS_ID);

    // Tokenize.
    let text = CString::new("hello").unwrap();
    let mut buf = [0i32; 4];
    let n = unsafe { llama_bridge_tokenize(model, text.as_ptr(), buf.as_mut_ptr(), 4, true) };
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], &[BOS_ID, token_id("▁hello")]);

    let mut one = [7i32; 1];
    let n = unsafe { llama_bridge_tokenize(model, text.as_ptr(), one.as_mut_ptr(), 1, true) };
    assert_eq!(n, -2);
    assert_eq!(one, [7], "nothing written on overflow");

    let n = unsafe { llama_bridge_tokenize(model, text.as_ptr(), ptr::null_mut(), 0, false) };
    assert_eq!(n, -1);
    let n = unsafe { llama_bridge_tokenize(model, ptr::null(), buf.as_mut_ptr(), 4, true) };
    assert_eq!(n, TOKENIZE_INVALID);

    // Context.
    let ctx = llama_bridge_create_context(model, 16, 1);
    assert!(!ctx.is_null());
    assert_ne!(ctx, model, "handles are never reused across kinds");
    assert_eq!(llama_bridge_n_ctx(ctx), 16);
    assert!(llama_bridge_create_context(model, 0, 1).is_null());

    // Sampling before any eval has nothing to work with.
    assert_eq!(llama_bridge_sample_token(ctx), -1);

    let prompt = [BOS_ID, token_id("▁hello")];
    assert_eq!(unsafe { llama_bridge_eval(ctx, prompt.as_ptr(), 2, 0) }, 0);
    let next = llama_bridge_sample_token(ctx);
    assert!((0..n_vocab).contains(&next));
    assert_eq!(unsafe { llama_bridge_eval(ctx, &next, 1, 2) }, 0);

    // Invalid eval input.
    assert_eq!(unsafe { llama_bridge_eval(ctx, ptr::null(), 1, 0) }, -1);
    assert_eq!(unsafe { llama_bridge_eval(ctx, prompt.as_ptr(), 0, 0) }, -1);
    let bad = [n_vocab];
    assert_eq!(unsafe { llama_bridge_eval(ctx, bad.as_ptr(), 1, 0) }, -1);
    assert_eq!(unsafe { llama_bridge_eval(ctx, prompt.as_ptr(), 1, 99) }, -1);

    // Capacity: exactly n_ctx fits, one more does not.
    llama_bridge_clear_kv_cache(ctx);
    let full = vec![token_id("▁hello"); 16];
    assert_eq!(unsafe { llama_bridge_eval(ctx, full.as_ptr(), 16, 0) }, 0);
    assert_eq!(unsafe { llama_bridge_eval(ctx, &BOS_ID, 1, 16) }, 1);
    llama_bridge_clear_kv_cache(ctx);
    let over = vec![token_id("▁hello"); 17];
    assert_eq!(unsafe { llama_bridge_eval(ctx, over.as_ptr(), 17, 0) }, 1);

    // token_to_str pointers are owned by the model and stable.
    let a = llama_bridge_token_to_str(model, token_id("▁hello"));
    let b = llama_bridge_token_to_str(model, token_id("▁hello"));
    assert_eq!(a, b);
    assert_eq!(unsafe { CStr::from_ptr(a) }.to_str().unwrap(), " hello");
    assert!(llama_bridge_token_to_str(model, -1).is_null());
    assert!(llama_bridge_token_to_str(model, n_vocab).is_null());

    // A context handle is not a model handle.
    assert_eq!(llama_bridge_n_vocab(ctx), -1);
    assert_eq!(llama_bridge_n_ctx(model), -1);

    // Freeing the model keeps it alive for the context.
    llama_bridge_free_model(model);
    llama_bridge_free_model(model);
    assert_eq!(global().n_models(), 0);
    assert!(Arc::strong_count(&model_arc) > 1);
    llama_bridge_clear_kv_cache(ctx);
    assert_eq!(unsafe { llama_bridge_eval(ctx, prompt.as_ptr(), 2, 0) }, 0);

    llama_bridge_free_context(ctx);
    llama_bridge_free_context(ctx);
    assert_eq!(global().n_contexts(), 0);
    assert_eq!(Arc::strong_count(&model_arc), 1);

    llama_bridge_backend_free();
    assert_eq!(global().state(), BackendState::Freed);

    // No way back.
    llama_bridge_backend_init();
    assert_eq!(global().state(), BackendState::Freed);
    assert!(unsafe { llama_bridge_load_model(c_path.as_ptr()) }.is_null());

    let version = unsafe { CStr::from_ptr(llama_bridge_ggml_version()) };
    assert!(!version.to_bytes().is_empty());
}
