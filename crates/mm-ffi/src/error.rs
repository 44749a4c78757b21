use std::cell::RefCell;
use std::ffi::CString;

use mm_engine::EngineError;

use crate::types::MMStatus;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store an error message for later retrieval via `mm_last_error`.
pub fn set_last_error(msg: String) {
    // Interior NULs would make CString::new fail and lose the message.
    let msg = msg.replace('\0', " ");
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Take the last error message, leaving `None` in its place.
pub fn take_last_error() -> Option<CString> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn status_for(err: &EngineError) -> MMStatus {
    match err {
        EngineError::EmptyBatch => MMStatus::ErrorEmptyBatch,
        EngineError::CapacityExceeded { .. } => MMStatus::ErrorCapacityExceeded,
        EngineError::EmbeddingLookup { .. } => MMStatus::ErrorEmbeddingLookup,
        EngineError::DimensionMismatch { .. } => MMStatus::ErrorDimensionMismatch,
        EngineError::DecodeFailure { .. } => MMStatus::ErrorDecode,
        EngineError::MalformedTokenStream { .. } => MMStatus::ErrorMalformedTokenStream,
        EngineError::InvalidImageTag { .. } => MMStatus::ErrorInvalidImageTag,
        EngineError::SessionState { .. } => MMStatus::ErrorSessionState,
        EngineError::Model(_) => MMStatus::ErrorModel,
        EngineError::Sampler(_) => MMStatus::ErrorSampler,
    }
}

/// Record `err` as the last error and return its status.
pub fn report(err: EngineError) -> MMStatus {
    let status = status_for(&err);
    set_last_error(err.to_string());
    status
}

/// Record `msg` as the last error and return `status`.
pub fn fail(status: MMStatus, msg: impl Into<String>) -> MMStatus {
    set_last_error(msg.into());
    status
}
