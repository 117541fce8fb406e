//! Content type detection for assembled uploads.
//!
//! Magic numbers in the leading bytes win; the filename extension is consulted
//! next, then a plain text check. Anything else is `application/octet-stream`.

use queuework_core::constants::FALLBACK_MIME_TYPE;

/// Bytes of the assembled file needed by [`detect_mime_type`].
pub const SNIFF_LEN: usize = 512;

/// Containers whose extension is more specific than their magic number.
const ZIP_BASED: &[&str] = &[
    "application/vnd.openxmlformats-officedocument",
    "application/vnd.oasis.opendocument",
    "application/epub+zip",
    "application/java-archive",
];

fn sniff_magic(data: &[u8]) -> Option<&'static str> {
    let starts = |magic: &[u8]| data.starts_with(magic);

    if starts(b"%PDF-") {
        return Some("application/pdf");
    }
    if starts(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if starts(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if starts(b"GIF87a") || starts(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && starts(b"RIFF") {
        match &data[8..12] {
            b"WEBP" => return Some("image/webp"),
            b"WAVE" => return Some("audio/wav"),
            b"AVI " => return Some("video/x-msvideo"),
            _ => {}
        }
    }
    if starts(b"BM") && data.len() >= 14 {
        return Some("image/bmp");
    }
    if starts(&[0x49, 0x49, 0x2A, 0x00]) || starts(&[0x4D, 0x4D, 0x00, 0x2A]) {
        return Some("image/tiff");
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return match &data[8..12] {
            b"qt  " => Some("video/quicktime"),
            b"M4A " => Some("audio/mp4"),
            _ => Some("video/mp4"),
        };
    }
    if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/webm");
    }
    if starts(b"ID3") || starts(&[0xFF, 0xFB]) {
        return Some("audio/mpeg");
    }
    if starts(b"OggS") {
        return Some("audio/ogg");
    }
    if starts(b"fLaC") {
        return Some("audio/flac");
    }
    if starts(&[b'P', b'K', 0x03, 0x04]) || starts(&[b'P', b'K', 0x05, 0x06]) {
        return Some("application/zip");
    }
    if starts(&[0x1F, 0x8B]) {
        return Some("application/gzip");
    }
    if starts(&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some("application/x-7z-compressed");
    }
    if starts(b"Rar!\x1A\x07") {
        return Some("application/vnd.rar");
    }
    if starts(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Some("application/x-ole-storage");
    }
    None
}

fn looks_like_text(data: &[u8]) -> bool {
    if data.is_empty() || data.contains(&0) {
        return false;
    }
    match std::str::from_utf8(data) {
        Ok(_) => true,
        // A multi-byte character cut off by the sniff window is still text.
        Err(e) => e.error_len().is_none() && data.len() - e.valid_up_to() < 4,
    }
}

/// Detect the MIME type of a file from its first bytes and its name.
pub fn detect_mime_type(head: &[u8], filename: &str) -> String {
    let guessed = mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_string());

    if let Some(magic) = sniff_magic(head) {
        // OOXML, ODF and friends are ZIP files; the extension tells them apart.
        if magic == "application/zip" || magic == "application/x-ole-storage" {
            if let Some(guess) = guessed.as_deref() {
                if ZIP_BASED.iter().any(|p| guess.starts_with(p))
                    || guess.starts_with("application/msword")
                    || guess.starts_with("application/vnd.ms-")
                {
                    return guess.to_string();
                }
            }
        }
        return magic.to_string();
    }

    if let Some(guess) = guessed {
        return guess;
    }

    if looks_like_text(head) {
        return "text/plain".to_string();
    }

    FALLBACK_MIME_TYPE.to_string()
}
