//! Backend lifecycle and handle-checked operations behind the C functions.
//!
//! [`Runtime`] holds everything the `extern "C"` layer needs: the backend
//! state, the configuration snapshot and the [`Registry`]. Handles are plain
//! `u64` ids here; pointer encoding happens in `ffi`. The registry lock is
//! only held for map operations; model loading and forward passes run with
//! it released.

use std::ffi::c_char;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::engine::{EvalStatus, LoadedModel, Session};

use super::registry::{Registry, SharedSession};

/// Returned by [`Runtime::tokenize`] for invalid arguments.
pub const TOKENIZE_INVALID: i32 = i32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    Freed,
}

struct Inner {
    state: BackendState,
    config: BridgeConfig,
    registry: Registry,
}

pub struct Runtime {
    inner: Mutex<Inner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BackendState::Uninitialized,
                config: BridgeConfig::default(),
                registry: Registry::new(),
            }),
        }
    }

    pub fn state(&self) -> BackendState {
        self.inner.lock().state
    }

    pub fn config(&self) -> BridgeConfig {
        self.inner.lock().config.clone()
    }

    pub fn n_models(&self) -> usize {
        self.inner.lock().registry.n_models()
    }

    pub fn n_contexts(&self) -> usize {
        self.inner.lock().registry.n_contexts()
    }

    /// `Uninitialized -> Initialized`. Returns whether the transition happened.
    pub fn init(&self, config: BridgeConfig) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BackendState::Uninitialized => {
                inner.state = BackendState::Initialized;
                inner.config = config;
                info!(version = crate::build_info::BRIDGE_VERSION, "Backend initialized");
                true
            }
            BackendState::Initialized => {
                warn!("backend_init called twice, ignoring");
                false
            }
            BackendState::Freed => {
                error!("backend_init called after backend_free, rejecting");
                false
            }
        }
    }

    /// `Initialized -> Freed`, releasing any handles still registered.
    pub fn free(&self) {
        let released = {
            let mut inner = self.inner.lock();
            if inner.state != BackendState::Initialized {
                warn!(state = ?inner.state, "backend_free called while not initialized");
                return;
            }
            inner.state = BackendState::Freed;
            // Moved out so the drops happen after the lock is released.
            std::mem::take(&mut inner.registry)
        };
        let (models, contexts) = (released.n_models(), released.n_contexts());
        if models > 0 || contexts > 0 {
            warn!(models, contexts, "backend_free released handles that were never freed");
        }
        drop(released);
        info!("Backend freed");
    }

    /// Lock the state and check the backend is usable for `op`.
    fn ready(&self, op: &str) -> Option<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.state == BackendState::Initialized {
            Some(inner)
        } else {
            error!(op, state = ?inner.state, "backend not initialized");
            None
        }
    }

    fn lookup_model(&self, op: &str, id: u64) -> Option<Arc<LoadedModel>> {
        let model = self.ready(op)?.registry.model(id);
        if model.is_none() {
            warn!(op, handle = id, "unknown model handle");
        }
        model
    }

    fn lookup_context(&self, op: &str, id: u64) -> Option<SharedSession> {
        let ctx = self.ready(op)?.registry.context(id);
        if ctx.is_none() {
            warn!(op, handle = id, "unknown context handle");
        }
        ctx
    }

    pub fn model(&self, id: u64) -> Option<Arc<LoadedModel>> {
        self.lookup_model("model", id)
    }

    pub fn load_model(&self, path: &Path) -> Option<u64> {
        self.ready("load_model")?;
        let model = match LoadedModel::load(path) {
            Ok(model) => Arc::new(model),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load model");
                return None;
            }
        };
        // The backend may have been freed while loading.
        let id = self.ready("load_model")?.registry.insert_model(model);
        debug!(handle = id, "model registered");
        Some(id)
    }

    pub fn free_model(&self, id: u64) {
        let removed = match self.ready("free_model") {
            Some(mut inner) => inner.registry.remove_model(id),
            None => return,
        };
        match removed {
            Some(_) => debug!(handle = id, "model released"),
            None => warn!(handle = id, "free_model: unknown or already freed handle"),
        }
    }

    pub fn create_context(&self, model_id: u64, n_ctx: i32, n_threads: i32) -> Option<u64> {
        let model = self.lookup_model("create_context", model_id)?;
        if n_ctx <= 0 {
            error!(n_ctx, "create_context: n_ctx must be positive");
            return None;
        }
        let config = self.config();
        let n_threads = if n_threads > 0 {
            n_threads as usize
        } else {
            config.resolve_threads()
        };
        let session = match Session::new(model, n_ctx as usize, n_threads, config.sampling) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "create_context failed");
                return None;
            }
        };
        let id = self
            .ready("create_context")?
            .registry
            .insert_context(Arc::new(Mutex::new(session)));
        info!(handle = id, model = model_id, n_ctx, n_threads, "context created");
        Some(id)
    }

    pub fn free_context(&self, id: u64) {
        let removed = match self.ready("free_context") {
            Some(mut inner) => inner.registry.remove_context(id),
            None => return,
        };
        match removed {
            Some(_) => debug!(handle = id, "context released"),
            None => warn!(handle = id, "free_context: unknown or already freed handle"),
        }
    }

    /// Tokenize into `out`.
    ///
    /// Returns the token count when it fits, `-count` (with `out` untouched)
    /// when it does not, or [`TOKENIZE_INVALID`] for a bad handle.
    pub fn tokenize(&self, model_id: u64, text: &str, out: &mut [i32], add_bos: bool) -> i32 {
        let Some(model) = self.lookup_model("tokenize", model_id) else {
            return TOKENIZE_INVALID;
        };
        let tokens = model.tokenize(text, add_bos);
        let n = match i32::try_from(tokens.len()) {
            Ok(n) => n,
            Err(_) => return TOKENIZE_INVALID,
        };
        if tokens.len() > out.len() {
            debug!(n_tokens = n, capacity = out.len(), "tokenize: buffer too small");
            return -n;
        }
        for (slot, &t) in out.iter_mut().zip(&tokens) {
            *slot = t as i32;
        }
        n
    }

    pub fn eval(&self, ctx_id: u64, tokens: &[i32], n_past: i32) -> EvalStatus {
        let Some(ctx) = self.lookup_context("eval", ctx_id) else {
            return EvalStatus::InvalidInput;
        };
        if n_past < 0 || tokens.iter().any(|&t| t < 0) {
            debug!(n_past, "eval rejected: negative position or token");
            return EvalStatus::InvalidInput;
        }
        let ids: Vec<u32> = tokens.iter().map(|&t| t as u32).collect();
        // Bound so the guard drops before `ctx`.
        let status = ctx.lock().eval(&ids, n_past as usize);
        status
    }

    /// Next token, or -1 when there is nothing to sample from.
    pub fn sample_token(&self, ctx_id: u64) -> i32 {
        let Some(ctx) = self.lookup_context("sample_token", ctx_id) else {
            return -1;
        };
        let token = ctx.lock().sample();
        token.map_or(-1, |t| t as i32)
    }

    /// Pointer to the model-owned piece text, or null.
    pub fn token_to_str(&self, model_id: u64, token: i32) -> *const c_char {
        let Some(model) = self.lookup_model("token_to_str", model_id) else {
            return std::ptr::null();
        };
        if token < 0 {
            return std::ptr::null();
        }
        // The CString lives inside the Arc'd model, not in this local clone.
        model
            .token_cstr(token as u32)
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    pub fn token_eos(&self, model_id: u64) -> i32 {
        self.lookup_model("token_eos", model_id)
            .and_then(|m| m.eos())
            .map_or(-1, |t| t as i32)
    }

    pub fn n_vocab(&self, model_id: u64) -> i32 {
        self.lookup_model("n_vocab", model_id)
            .map_or(-1, |m| m.n_vocab() as i32)
    }

    pub fn n_ctx(&self, ctx_id: u64) -> i32 {
        self.lookup_context("n_ctx", ctx_id)
            .map_or(-1, |c| c.lock().n_ctx() as i32)
    }

    pub fn clear_kv_cache(&self, ctx_id: u64) {
        if let Some(ctx) = self.lookup_context("clear_kv_cache", ctx_id) {
            ctx.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_llama, token_id, BOS_ID, EOS_ID};
    use std::ffi::CStr;

    fn ready_runtime() -> Runtime {
        let rt = Runtime::new();
        assert!(rt.init(BridgeConfig::default()));
        rt
    }

    #[test]
    fn test_state_machine() {
        let rt = Runtime::new();
        assert_eq!(rt.state(), BackendState::Uninitialized);
        rt.free();
        assert_eq!(rt.state(), BackendState::Uninitialized);
        assert!(rt.init(BridgeConfig::default()));
        assert!(!rt.init(BridgeConfig::default()));
        assert_eq!(rt.state(), BackendState::Initialized);
        rt.free();
        assert_eq!(rt.state(), BackendState::Freed);
        assert!(!rt.init(BridgeConfig::default()));
        assert_eq!(rt.state(), BackendState::Freed);
    }

    #[test]
    fn test_calls_before_init_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = Runtime::new();
        assert_eq!(rt.load_model(&path), None);
        assert_eq!(rt.tokenize(1, "hello", &mut [0; 4], true), TOKENIZE_INVALID);
        assert_eq!(rt.eval(1, &[1], 0), EvalStatus::InvalidInput);
        assert_eq!(rt.sample_token(1), -1);
        assert!(rt.token_to_str(1, 0).is_null());
        assert_eq!(rt.token_eos(1), -1);
    }

    #[test]
    fn test_load_and_free_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let id = rt.load_model(&path).unwrap();
        assert_eq!(rt.n_models(), 1);
        let weak = Arc::downgrade(&rt.model(id).unwrap());
        rt.free_model(id);
        assert_eq!(rt.n_models(), 0);
        assert!(weak.upgrade().is_none());
        // Double free is a no-op.
        rt.free_model(id);
        assert_eq!(rt.n_vocab(id), -1);
    }

    #[test]
    fn test_load_invalid_path() {
        let dir = tempfile::tempdir().unwrap();
        let rt = ready_runtime();
        assert_eq!(rt.load_model(&dir.path().join("missing.gguf")), None);
        let junk = dir.path().join("junk.gguf");
        std::fs::write(&junk, b"not a gguf file at all").unwrap();
        assert_eq!(rt.load_model(&junk), None);
        assert_eq!(rt.n_models(), 0);
    }

    #[test]
    fn test_ids_are_kind_checked_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let c = rt.create_context(m, 16, 1).unwrap();
        assert_ne!(m, c);
        // Wrong kind.
        assert_eq!(rt.n_ctx(m), -1);
        assert_eq!(rt.n_vocab(c), -1);
        assert_eq!(rt.create_context(c, 16, 1), None);

        rt.free_context(c);
        let c2 = rt.create_context(m, 16, 1).unwrap();
        assert!(c2 > c);
        assert_eq!(rt.n_ctx(c), -1);
        assert_eq!(rt.n_ctx(c2), 16);
    }

    #[test]
    fn test_create_context_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        assert_eq!(rt.create_context(m, 0, 1), None);
        assert_eq!(rt.create_context(m, -5, 1), None);
        assert_eq!(rt.create_context(999, 16, 1), None);
        // Non-positive threads fall back to the default.
        assert!(rt.create_context(m, 16, 0).is_some());
        // Beyond the trained context is allowed.
        assert!(rt.create_context(m, 1024, 1).is_some());
    }

    #[test]
    fn test_create_context_allocation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        assert_eq!(rt.create_context(m, i32::MAX, 1), None);
        assert_eq!(rt.n_contexts(), 0);
        // The model is still usable.
        assert!(rt.create_context(m, 16, 1).is_some());
    }

    #[test]
    fn test_context_outlives_model_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let c = rt.create_context(m, 16, 1).unwrap();
        let weak = Arc::downgrade(&rt.model(m).unwrap());
        rt.free_model(m);
        assert!(rt.model(m).is_none());
        assert!(weak.upgrade().is_some());
        assert_eq!(rt.eval(c, &[BOS_ID as i32], 0), EvalStatus::Ok);
        rt.free_context(c);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_tokenize_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();

        let mut out = [0i32; 4];
        let n = rt.tokenize(m, "hello world", &mut out, true);
        assert_eq!(n, 3);
        assert_eq!(
            &out[..3],
            &[BOS_ID as i32, token_id("▁hello") as i32, token_id("▁world") as i32]
        );

        let mut small = [-7i32; 2];
        assert_eq!(rt.tokenize(m, "hello world", &mut small, true), -3);
        assert_eq!(small, [-7, -7]);

        // Size query.
        assert_eq!(rt.tokenize(m, "hello", &mut [], false), -1);
        assert_eq!(rt.tokenize(m, "", &mut [], false), 0);
        assert_eq!(rt.tokenize(m + 100, "hello", &mut out, true), TOKENIZE_INVALID);
    }

    #[test]
    fn test_eval_sample_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let c = rt.create_context(m, 16, 1).unwrap();
        let n_vocab = rt.n_vocab(m);

        assert_eq!(rt.sample_token(c), -1);
        let mut out = [0i32; 4];
        let n = rt.tokenize(m, "hello", &mut out, true);
        assert!((0..=4).contains(&n));
        assert_eq!(rt.eval(c, &out[..n as usize], 0), EvalStatus::Ok);
        let tok = rt.sample_token(c);
        assert!((0..n_vocab).contains(&tok));
        assert_eq!(rt.eval(c, &[tok], n), EvalStatus::Ok);

        assert_eq!(rt.eval(c, &[-1], 0), EvalStatus::InvalidInput);
        assert_eq!(rt.eval(c, &[1], -1), EvalStatus::InvalidInput);
        assert_eq!(rt.eval(c, &[n_vocab], 0), EvalStatus::InvalidInput);

        rt.clear_kv_cache(c);
        assert_eq!(rt.sample_token(c), -1);
    }

    #[test]
    fn test_context_full_after_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let n_ctx = 6;
        let c = rt.create_context(m, n_ctx, 1).unwrap();
        let tokens = vec![token_id("▁world") as i32; n_ctx as usize + 1];

        rt.clear_kv_cache(c);
        assert_eq!(rt.eval(c, &tokens[..n_ctx as usize], 0), EvalStatus::Ok);
        rt.clear_kv_cache(c);
        assert_ne!(rt.eval(c, &tokens, 0), EvalStatus::Ok);
    }

    #[test]
    fn test_token_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let eos = rt.token_eos(m);
        assert_eq!(eos, EOS_ID as i32);
        let p1 = rt.token_to_str(m, eos);
        let p2 = rt.token_to_str(m, eos);
        assert!(!p1.is_null());
        assert_eq!(p1, p2);
        let s = unsafe { CStr::from_ptr(rt.token_to_str(m, token_id("▁hello") as i32)) };
        assert_eq!(s.to_str().unwrap(), " hello");
        assert!(rt.token_to_str(m, -1).is_null());
        assert!(rt.token_to_str(m, rt.n_vocab(m)).is_null());
    }

    #[test]
    fn test_free_backend_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = tiny_llama(dir.path());
        let rt = ready_runtime();
        let m = rt.load_model(&path).unwrap();
        let _c = rt.create_context(m, 8, 1).unwrap();
        let weak = Arc::downgrade(&rt.model(m).unwrap());
        rt.free();
        assert_eq!(rt.n_models(), 0);
        assert_eq!(rt.n_contexts(), 0);
        assert!(weak.upgrade().is_none());
        assert_eq!(rt.load_model(&path), None);
    }
}
