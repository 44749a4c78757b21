use std::ffi::CString;
use std::os::raw::c_void;

use crate::types::MMStreamCallback;

/// Invoke a streaming callback with a text chunk.
///
/// Returns `true` if generation should continue, `false` to stop.
/// Without a callback, or for an empty chunk, generation continues.
pub fn invoke_callback(callback: MMStreamCallback, user_data: *mut c_void, chunk: &str) -> bool {
    if chunk.is_empty() {
        return true;
    }
    match callback {
        Some(cb) => match CString::new(chunk) {
            Ok(c_str) => cb(c_str.as_ptr(), user_data),
            // Generated text with an interior NUL: deliver what precedes it.
            Err(e) => {
                let head = &chunk[..e.nul_position()];
                match CString::new(head) {
                    Ok(c_str) => cb(c_str.as_ptr(), user_data),
                    Err(_) => true,
                }
            }
        },
        None => true,
    }
}
