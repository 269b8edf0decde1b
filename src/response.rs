//! §4.H — response frames, quiet-level suppression, and the
//! upload-failure message table.

use log::warn;

use crate::store::UploadingFailure;

/// The `i=`/`I=`/`p=` fields a response frame may carry; a zero value
/// omits that field entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFields {
    pub image_id: u32,
    pub image_number: u32,
    pub placement_id: u32,
}

/// `0` emits everything, `1` suppresses `OK`, `2` suppresses errors too.
#[must_use]
pub fn should_emit(quiet: u8, is_error: bool) -> bool {
    match quiet {
        0 => true,
        1 => is_error,
        _ => false,
    }
}

/// Frames `fields`/`message` as `ESC_G key=val,...;MSG ESC\`. Returns
/// `None` (and logs) if `i`, `I`, and `p` are all zero — the original's
/// "nobody is listening" suppression rule.
#[must_use]
pub fn format_response(fields: ResponseFields, message: &str) -> Option<String> {
    if fields.image_id == 0 && fields.image_number == 0 && fields.placement_id == 0 {
        warn!("discarding response with no addressable id: {message}");
        return None;
    }
    let mut kv = String::new();
    if fields.image_id != 0 {
        kv.push_str(&format!("i={},", fields.image_id));
    }
    if fields.image_number != 0 {
        kv.push_str(&format!("I={},", fields.image_number));
    }
    if fields.placement_id != 0 {
        kv.push_str(&format!("p={},", fields.placement_id));
    }
    let kv = kv.trim_end_matches(',');
    Some(format!("\x1b_G{kv};{message}\x1b\\"))
}

/// Combines quiet-level suppression with the all-zero discard rule.
#[must_use]
pub fn build_response(
    fields: ResponseFields,
    quiet: u8,
    is_error: bool,
    message: &str,
) -> Option<String> {
    if !should_emit(quiet, is_error) {
        return None;
    }
    format_response(fields, message)
}

#[must_use]
pub fn success_message() -> &'static str {
    "OK"
}

/// §4.H's failure table.
#[must_use]
pub fn failure_code_and_message(
    failure: UploadingFailure,
    disk_limit: u64,
    actual_size: u64,
    expected_size: u64,
) -> (&'static str, String) {
    match failure {
        UploadingFailure::None => ("OK", success_message().to_string()),
        UploadingFailure::OverSizeLimit => (
            "EFBIG",
            format!("the size of the uploaded image exceeded the image size limit {disk_limit}"),
        ),
        UploadingFailure::CannotOpenCachedFile => {
            ("EIO", "could not create a file for image".to_string())
        }
        UploadingFailure::UnexpectedSize => (
            "EINVAL",
            format!("size {actual_size} doesn't match expected {expected_size}"),
        ),
        UploadingFailure::CannotCopyFile => ("EBADF", "could not copy the image".to_string()),
        UploadingFailure::TimedOut => ("ETIMEDOUT", "no data received for the upload in time".to_string()),
    }
}

#[must_use]
pub fn error_message(code: &str, detail: &str) -> String {
    format!("{code}:{detail}")
}
