use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Extensions accepted for face and source images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Lowercased extension, if any.
pub fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Extension-only check used while scanning.
pub fn has_image_extension(path: &Path) -> bool {
    file_extension(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Debug, Error)]
pub enum ImageValidationError {
    #[error("invalid file extension")]
    InvalidExtension,
    #[error("file not found")]
    FileNotFound,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid image header")]
    InvalidHeader,
    #[error("file too small to be a valid image")]
    FileTooSmall,
}

/// Validate if file is a readable image with a matching header
pub fn is_valid_image_file(path: &Path) -> bool {
    validate_image_file(path).is_ok()
}

/// Validate image file with detailed error information
pub fn validate_image_file(path: &Path) -> Result<(), ImageValidationError> {
    if !path.is_file() {
        return Err(ImageValidationError::FileNotFound);
    }

    let extension = file_extension(path)
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .ok_or(ImageValidationError::InvalidExtension)?;

    validate_image_header(path, &extension)
}

/// Reject files whose magic bytes don't match their extension, so a browser
/// upload is never wasted on a truncated or mislabelled file.
fn validate_image_header(path: &Path, extension: &str) -> Result<(), ImageValidationError> {
    let header_size = match extension {
        "webp" => 12,
        "png" => 8,
        "gif" => 6,
        _ => 2,
    };

    let mut header = vec![0u8; header_size];
    let mut file = File::open(path)?;
    let bytes_read = file.read(&mut header)?;
    if bytes_read < header_size {
        return Err(ImageValidationError::FileTooSmall);
    }

    let is_valid = match extension {
        "jpg" | "jpeg" => header[..2] == [0xFF, 0xD8],
        "png" => header == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
        "gif" => header[..6] == *b"GIF87a" || header[..6] == *b"GIF89a",
        "webp" => header[..4] == *b"RIFF" && header[8..12] == *b"WEBP",
        _ => return Err(ImageValidationError::InvalidExtension),
    };

    if is_valid {
        Ok(())
    } else {
        Err(ImageValidationError::InvalidHeader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn validates_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good.png");
        std::fs::write(&good, fixtures::png_bytes()).unwrap();
        let fake = dir.path().join("fake.jpg");
        std::fs::write(&fake, b"hello world").unwrap();
        let tiny = dir.path().join("tiny.webp");
        std::fs::write(&tiny, b"RIFF").unwrap();
        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"text").unwrap();

        assert!(is_valid_image_file(&good));
        assert!(matches!(validate_image_file(&fake), Err(ImageValidationError::InvalidHeader)));
        assert!(matches!(validate_image_file(&tiny), Err(ImageValidationError::FileTooSmall)));
        assert!(matches!(validate_image_file(&text), Err(ImageValidationError::InvalidExtension)));
        assert!(matches!(
            validate_image_file(&dir.path().join("missing.png")),
            Err(ImageValidationError::FileNotFound)
        ));
    }
}
