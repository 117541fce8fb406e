//! Shared key generation for storage backends.
//!
//! All backends must use these formats for consistency.

use chrono::{DateTime, Utc};
use queuework_core::constants::{
    ARCHIVE_FILENAME_PREFIX, DEFAULT_UPLOAD_FOLDER, TEMP_UPLOAD_PREFIX,
};
use uuid::Uuid;

/// Prefix grouping every chunk blob of one upload session.
pub fn temp_prefix(session_id: Uuid) -> String {
    format!("{}/{}", TEMP_UPLOAD_PREFIX, session_id)
}

/// Normalizes a client supplied folder into a safe key prefix.
///
/// Leading, trailing and doubled separators and `.` segments are dropped. A
/// folder with a `..` segment, or nothing left, falls back to the default
/// upload folder.
pub fn sanitize_folder(folder: Option<&str>) -> String {
    let segments: Vec<&str> = folder
        .unwrap_or_default()
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.contains(&"..") {
        return DEFAULT_UPLOAD_FOLDER.to_string();
    }
    let cleaned: Vec<String> = segments
        .into_iter()
        .map(|s| {
            s.chars()
                .map(|c| if c.is_control() { '_' } else { c })
                .collect()
        })
        .collect();
    if cleaned.is_empty() {
        DEFAULT_UPLOAD_FOLDER.to_string()
    } else {
        cleaned.join("/")
    }
}

/// Last path component of a client supplied filename.
pub fn file_basename(filename: &str) -> &str {
    filename
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or(filename)
}

/// `{folder}/{uuid}_{basename}`
pub fn document_key(folder: &str, filename: &str) -> String {
    format!("{}/{}_{}", folder, Uuid::new_v4(), file_basename(filename))
}

/// `{prefix}/{YYYY}/{mm}/{dd}/{uuid}.zip`
pub fn archive_key(prefix: &str, now: DateTime<Utc>) -> String {
    let date = now.format("%Y/%m/%d");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}.zip", date, Uuid::new_v4())
    } else {
        format!("{}/{}/{}.zip", prefix, date, Uuid::new_v4())
    }
}

/// Name offered to the client when it downloads an archive.
pub fn archive_filename(now: DateTime<Utc>) -> String {
    format!("{}{}.zip", ARCHIVE_FILENAME_PREFIX, now.format("%Y%m%d_%H%M%S"))
}
