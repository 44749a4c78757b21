mod callback_model;
mod error;
mod handles;
mod streaming;
mod types;

pub use callback_model::CallbackRuntime;
pub use error::*;
pub use handles::HandleTable;
pub use types::*;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::sync::{Arc, Mutex, TryLockError};

use mm_engine::{ContextParams, ImageEmbed, Session};
use mm_model::{ImageEncoder, ImageSource, PrecomputedEmbeds};
use tracing_subscriber::EnvFilter;

/// A session that releases its KV entries when the last reference to it
/// goes away, whichever call drops it.
struct OwnedSession(Session<CallbackRuntime>);

impl Drop for OwnedSession {
    fn drop(&mut self) {
        self.0.release();
    }
}

type SharedSession = Arc<Mutex<OwnedSession>>;

static SESSIONS: Mutex<HandleTable<SharedSession>> = Mutex::new(HandleTable::new());

/// Execute a closure that returns an `MMStatus`, catching any panics
/// and converting them into `MMStatus::ErrorInternal`.
fn catch_panic<F: FnOnce() -> MMStatus>(f: F) -> MMStatus {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            set_last_error("internal panic".to_string());
            MMStatus::ErrorInternal
        }
    }
}

fn lookup(handle: MMSessionHandle) -> Result<SharedSession, MMStatus> {
    let table = SESSIONS
        .lock()
        .map_err(|_| fail(MMStatus::ErrorInternal, "session table poisoned"))?;
    table
        .get(handle)
        .cloned()
        .ok_or_else(|| fail(MMStatus::ErrorInvalidHandle, format!("unknown session handle {:#x}", handle)))
}

/// Run `f` on the session behind `handle`. A session already in use by
/// another call yields `ErrorBusy` instead of blocking.
fn with_session<F>(handle: MMSessionHandle, f: F) -> MMStatus
where
    F: FnOnce(&mut Session<CallbackRuntime>) -> MMStatus,
{
    let shared = match lookup(handle) {
        Ok(s) => s,
        Err(status) => return status,
    };
    let mut session = match shared.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::WouldBlock) => {
            return fail(MMStatus::ErrorBusy, "session is busy with another call")
        }
        Err(TryLockError::Poisoned(_)) => {
            return fail(MMStatus::ErrorInternal, "session poisoned by an earlier panic")
        }
    };
    f(&mut session.0)
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, MMStatus> {
    if ptr.is_null() {
        return Err(fail(MMStatus::ErrorInvalidArgument, format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|e| fail(MMStatus::ErrorInvalidArgument, format!("invalid {}: {}", what, e)))
}

/// Install a `tracing` subscriber that writes to stderr.
///
/// `RUST_LOG` wins over `level` (e.g. "info", "mm_engine=debug"); a null
/// `level` means "info". Calling it again once a subscriber is installed
/// is a no-op.
#[no_mangle]
pub unsafe extern "C" fn mm_log_init(level: *const c_char) -> MMStatus {
    catch_panic(|| {
        let level = if level.is_null() {
            "info"
        } else {
            match unsafe { c_str(level, "level") } {
                Ok(s) => s,
                Err(status) => return status,
            }
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        // Err means a global subscriber already exists.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
        MMStatus::Ok
    })
}

/// Context-creation hints for a text-only runtime.
#[no_mangle]
pub extern "C" fn mm_context_params_default() -> MMContextParams {
    ContextParams::default().into()
}

/// Context-creation hints for a runtime that will receive image prompts.
#[no_mangle]
pub extern "C" fn mm_context_params_multimodal() -> MMContextParams {
    ContextParams::default().for_multimodal().into()
}

#[no_mangle]
pub extern "C" fn mm_generation_params_default() -> MMGenerationParams {
    MMGenerationParams::default()
}

/// Start a session over the host's model callbacks.
///
/// `params` may be null for defaults. On success writes the new handle to
/// `*handle_out`; the caller must later call `mm_session_end`.
#[no_mangle]
pub unsafe extern "C" fn mm_session_start(
    callbacks: *const MMModelCallbacks,
    params: *const MMGenerationParams,
    handle_out: *mut MMSessionHandle,
) -> MMStatus {
    catch_panic(|| {
        if callbacks.is_null() || handle_out.is_null() {
            return fail(MMStatus::ErrorInvalidArgument, "null argument");
        }
        let runtime = match CallbackRuntime::new(unsafe { &*callbacks }) {
            Ok(r) => r,
            Err(msg) => return fail(MMStatus::ErrorInvalidArgument, msg),
        };
        let params = if params.is_null() {
            MMGenerationParams::default()
        } else {
            unsafe { (*params).clone() }
        };
        let config = match unsafe { params.to_config() } {
            Ok(c) => c,
            Err(msg) => return fail(MMStatus::ErrorInvalidArgument, msg),
        };

        let session = Session::new(runtime, config);
        let mut table = match SESSIONS.lock() {
            Ok(t) => t,
            Err(_) => return fail(MMStatus::ErrorInternal, "session table poisoned"),
        };
        let handle = table.insert(Arc::new(Mutex::new(OwnedSession(session))));
        unsafe { *handle_out = handle };
        MMStatus::Ok
    })
}

/// Tokenize and prefill a text prompt. Writes the token count to `*n_out`
/// when `n_out` is non-null.
#[no_mangle]
pub unsafe extern "C" fn mm_prefill_text(
    handle: MMSessionHandle,
    prompt: *const c_char,
    n_out: *mut usize,
) -> MMStatus {
    catch_panic(|| {
        let prompt = match unsafe { c_str(prompt, "prompt") } {
            Ok(s) => s,
            Err(status) => return status,
        };
        with_session(handle, |session| match session.prefill_text(prompt) {
            Ok(n) => {
                if !n_out.is_null() {
                    unsafe { *n_out = n };
                }
                MMStatus::Ok
            }
            Err(e) => report(e),
        })
    })
}

/// Prefill system text, an image block of `n_positions * embed_dim` floats,
/// and user text. Writes the number of positions consumed to `*n_out`.
#[no_mangle]
pub unsafe extern "C" fn mm_prefill_multimodal(
    handle: MMSessionHandle,
    system: *const c_char,
    image: *const f32,
    n_positions: usize,
    embed_dim: usize,
    user: *const c_char,
    n_out: *mut usize,
) -> MMStatus {
    catch_panic(|| {
        let (system, user) = match unsafe { (c_str(system, "system"), c_str(user, "user")) } {
            (Ok(s), Ok(u)) => (s, u),
            (Err(status), _) | (_, Err(status)) => return status,
        };
        if image.is_null() && n_positions > 0 {
            return fail(MMStatus::ErrorInvalidArgument, "image is null");
        }
        let len = match n_positions.checked_mul(embed_dim) {
            Some(len) => len,
            None => {
                return fail(
                    MMStatus::ErrorInvalidArgument,
                    format!("image of {} positions x {} dims overflows", n_positions, embed_dim),
                )
            }
        };
        let data = if len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(image, len) }.to_vec()
        };
        let embed = match ImageEmbed::new(data, n_positions, embed_dim) {
            Ok(e) => e,
            Err(e) => return fail(MMStatus::ErrorDimensionMismatch, e.to_string()),
        };
        prefill_image(handle, system, &embed, user, n_out)
    })
}

/// Like `mm_prefill_multimodal`, reading the image block from a
/// precomputed embedding file.
#[no_mangle]
pub unsafe extern "C" fn mm_prefill_multimodal_file(
    handle: MMSessionHandle,
    system: *const c_char,
    embed_path: *const c_char,
    user: *const c_char,
    n_out: *mut usize,
) -> MMStatus {
    catch_panic(|| {
        let strings = unsafe {
            (
                c_str(system, "system"),
                c_str(embed_path, "embed_path"),
                c_str(user, "user"),
            )
        };
        let (system, path, user) = match strings {
            (Ok(s), Ok(p), Ok(u)) => (s, p, u),
            (Err(status), _, _) | (_, Err(status), _) | (_, _, Err(status)) => return status,
        };
        let embed = match PrecomputedEmbeds.embed_image(ImageSource::Path(Path::new(path))) {
            Ok(e) => e,
            Err(e) => {
                return fail(
                    MMStatus::ErrorModel,
                    format!("failed to load image embedding {}: {}", path, e),
                )
            }
        };
        prefill_image(handle, system, &embed, user, n_out)
    })
}

/// Prefill a chat prompt carrying its image inline as a base64
/// `<img src="data:image/jpeg;base64,...">` tag whose payload is a
/// precomputed embedding block. Writes the positions consumed to `*n_out`.
#[no_mangle]
pub unsafe extern "C" fn mm_prefill_inline_image(
    handle: MMSessionHandle,
    prompt: *const c_char,
    n_out: *mut usize,
) -> MMStatus {
    catch_panic(|| {
        let prompt = match unsafe { c_str(prompt, "prompt") } {
            Ok(s) => s,
            Err(status) => return status,
        };
        with_session(handle, |session| {
            match session.prefill_inline_image(prompt, &PrecomputedEmbeds) {
                Ok(n) => {
                    if !n_out.is_null() {
                        unsafe { *n_out = n };
                    }
                    MMStatus::Ok
                }
                Err(e) => report(e),
            }
        })
    })
}

fn prefill_image(
    handle: MMSessionHandle,
    system: &str,
    embed: &ImageEmbed,
    user: &str,
    n_out: *mut usize,
) -> MMStatus {
    with_session(handle, |session| {
        match session.prefill_multimodal(system, embed, user) {
            Ok(n) => {
                if !n_out.is_null() {
                    unsafe { *n_out = n };
                }
                MMStatus::Ok
            }
            Err(e) => report(e),
        }
    })
}

/// Generate one token.
///
/// On `Ok`, `*chunk_out` is a heap-allocated C string (possibly empty)
/// that must be freed with `mm_free_string`, or null when generation has
/// ended. `*stopped_out`, if non-null, is set when the session is now
/// stopped.
#[no_mangle]
pub unsafe extern "C" fn mm_step(
    handle: MMSessionHandle,
    chunk_out: *mut *mut c_char,
    stopped_out: *mut bool,
) -> MMStatus {
    catch_panic(|| {
        if chunk_out.is_null() {
            return fail(MMStatus::ErrorInvalidArgument, "chunk_out is null");
        }
        with_session(handle, |session| {
            let result = session.step();
            if !stopped_out.is_null() {
                unsafe { *stopped_out = session.stop_reason().is_some() };
            }
            match result {
                Ok(Some(chunk)) => {
                    let chunk = chunk.replace('\0', "");
                    match CString::new(chunk) {
                        Ok(c) => {
                            unsafe { *chunk_out = c.into_raw() };
                            MMStatus::Ok
                        }
                        Err(e) => fail(MMStatus::ErrorInternal, format!("output encoding error: {}", e)),
                    }
                }
                Ok(None) => {
                    unsafe { *chunk_out = std::ptr::null_mut() };
                    MMStatus::Ok
                }
                Err(e) => {
                    unsafe { *chunk_out = std::ptr::null_mut() };
                    report(e)
                }
            }
        })
    })
}

/// Step until the session stops or `callback` returns false, passing each
/// non-empty chunk to `callback`.
#[no_mangle]
pub unsafe extern "C" fn mm_generate_streaming(
    handle: MMSessionHandle,
    callback: MMStreamCallback,
    user_data: *mut c_void,
) -> MMStatus {
    catch_panic(|| {
        with_session(handle, |session| {
            while session.stop_reason().is_none() {
                match session.step() {
                    Ok(Some(chunk)) => {
                        if !streaming::invoke_callback(callback, user_data, &chunk) {
                            break; // caller requested stop
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return report(e),
                }
            }
            MMStatus::Ok
        })
    })
}

/// Write why the session stopped to `*reason_out`; `MMStopReason::None`
/// while it has not. `*reason_out` is left untouched unless this returns `Ok`
/// (e.g. `ErrorBusy` while another call holds the session).
#[no_mangle]
pub unsafe extern "C" fn mm_stop_reason(
    handle: MMSessionHandle,
    reason_out: *mut MMStopReason,
) -> MMStatus {
    catch_panic(|| {
        if reason_out.is_null() {
            return fail(MMStatus::ErrorInvalidArgument, "reason_out is null");
        }
        with_session(handle, |session| {
            unsafe { *reason_out = session.stop_reason().into() };
            MMStatus::Ok
        })
    })
}

/// Write the positions this session holds in the KV cache to `*n_past_out`.
/// `*n_past_out` is left untouched unless this returns `Ok`.
#[no_mangle]
pub unsafe extern "C" fn mm_session_n_past(
    handle: MMSessionHandle,
    n_past_out: *mut usize,
) -> MMStatus {
    catch_panic(|| {
        if n_past_out.is_null() {
            return fail(MMStatus::ErrorInvalidArgument, "n_past_out is null");
        }
        with_session(handle, |session| {
            unsafe { *n_past_out = session.n_past() };
            MMStatus::Ok
        })
    })
}

/// Clear the KV cache and generation state, returning the session to idle.
#[no_mangle]
pub extern "C" fn mm_reset(handle: MMSessionHandle) -> MMStatus {
    catch_panic(|| {
        with_session(handle, |session| {
            session.reset();
            MMStatus::Ok
        })
    })
}

/// End a session and release its KV entries. The handle becomes invalid.
///
/// A call that looked the session up just before it was removed keeps it
/// alive until that call returns; the KV entries are released then.
#[no_mangle]
pub extern "C" fn mm_session_end(handle: MMSessionHandle) -> MMStatus {
    catch_panic(|| {
        let shared = {
            let mut table = match SESSIONS.lock() {
                Ok(t) => t,
                Err(_) => return fail(MMStatus::ErrorInternal, "session table poisoned"),
            };
            let busy = match table.get(handle) {
                None => {
                    return fail(
                        MMStatus::ErrorInvalidHandle,
                        format!("unknown session handle {:#x}", handle),
                    )
                }
                Some(s) => matches!(s.try_lock(), Err(TryLockError::WouldBlock)),
            };
            // Another call holds the session; leave it registered.
            if busy {
                return fail(MMStatus::ErrorBusy, "session is busy with another call");
            }
            match table.remove(handle) {
                Some(s) => s,
                None => return fail(MMStatus::ErrorInvalidHandle, "session vanished"),
            }
        };
        // The table lock is released; dropping may call back into the host.
        drop(shared);
        MMStatus::Ok
    })
}

/// Retrieve the last error message.
///
/// Returns a pointer to a C string describing the most recent error, or
/// null if no error has occurred. The caller must free the returned string
/// with `mm_free_string`.
#[no_mangle]
pub extern "C" fn mm_last_error() -> *const c_char {
    match error::take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null(),
    }
}

/// Free a string previously returned by `mm_step` or `mm_last_error`.
#[no_mangle]
pub unsafe extern "C" fn mm_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
