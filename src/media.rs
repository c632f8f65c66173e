use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AppError;
use crate::types::DEFAULT_SIGN_TTL_SECS;

type HmacSha256 = Hmac<Sha256>;

/// What the message row persists is the storage path, never a URL.
/// Links are minted at render time and expire, so access control stays
/// at the resolver.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

fn sign_token(secret: &str, storage_path: &str, exp: i64) -> Option<String> {
    let payload = format!("{storage_path}:{exp}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_token(secret: &str, storage_path: &str, exp: i64, sig: &str) -> bool {
    let Ok(signature_bytes) = hex::decode(sig.trim()) else {
        return false;
    };
    let payload = format!("{storage_path}:{exp}");
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature_bytes).is_ok()
}

pub fn signed_media_url(
    secret: &str,
    public_base_url: &str,
    storage_path: &str,
    ttl_seconds: Option<i64>,
) -> Result<SignedUrl, AppError> {
    if !is_safe_storage_path(storage_path) {
        return Err(AppError::BadRequest("invalid storage path".to_string()));
    }
    let ttl = ttl_seconds.unwrap_or(DEFAULT_SIGN_TTL_SECS).clamp(1, 86_400);
    let exp = Utc::now().timestamp() + ttl;
    let sig = sign_token(secret, storage_path, exp)
        .ok_or_else(|| AppError::Storage("signing failed".to_string()))?;
    Ok(SignedUrl {
        url: format!("{public_base_url}/api/media/{storage_path}?exp={exp}&sig={sig}"),
        expires_at: Utc.timestamp_opt(exp, 0).single().unwrap_or_else(Utc::now),
    })
}

pub fn check_signed_request(
    secret: &str,
    storage_path: &str,
    exp: i64,
    sig: &str,
) -> Result<(), AppError> {
    if !verify_token(secret, storage_path, exp, sig) {
        return Err(AppError::InvalidSignature);
    }
    if exp < Utc::now().timestamp() {
        return Err(AppError::LinkExpired);
    }
    Ok(())
}

/// Storage paths are `identity/<uuid>.<ext>`; anything that could walk
/// out of the media directory is rejected.
pub fn is_safe_storage_path(value: &str) -> bool {
    if value.is_empty() || value.len() > 512 {
        return false;
    }
    let mut segments = value.split('/');
    let (Some(owner), Some(file), None) = (segments.next(), segments.next(), segments.next())
    else {
        return false;
    };
    is_safe_segment(owner) && is_safe_segment(file)
}

fn is_safe_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// MIME types under `image/` render inline; everything else renders as
/// a named download.
pub fn attachment_kind_from_mime(mime: &str) -> &'static str {
    if mime.trim().to_ascii_lowercase().starts_with("image/") {
        "image"
    } else {
        "file"
    }
}

pub fn extension_from_filename(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 8 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

pub fn extension_from_mime(mime: &str) -> String {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "application/zip" => "zip",
        _ => "bin",
    }
    .to_string()
}

pub fn content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Builds the namespaced storage path for a fresh upload.
pub fn new_storage_path(identity: &str, original_name: &str, mime: &str) -> String {
    let ext = extension_from_filename(original_name).unwrap_or_else(|| extension_from_mime(mime));
    let owner: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{owner}/{}.{ext}", Uuid::new_v4())
}

pub async fn store_bytes(
    media_storage_dir: &Path,
    storage_path: &str,
    bytes: &[u8],
) -> Result<(), AppError> {
    if !is_safe_storage_path(storage_path) {
        return Err(AppError::BadRequest("invalid storage path".to_string()));
    }
    let full: PathBuf = media_storage_dir.join(storage_path);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Storage(e.to_string()))?;
    }
    tokio::fs::write(&full, bytes)
        .await
        .map_err(|e| AppError::Storage(e.to_string()))
}

pub async fn read_bytes(
    media_storage_dir: &Path,
    storage_path: &str,
) -> Result<Vec<u8>, AppError> {
    if !is_safe_storage_path(storage_path) {
        return Err(AppError::BadRequest("invalid storage path".to_string()));
    }
    let full = media_storage_dir.join(storage_path);
    tokio::fs::read(&full)
        .await
        .map_err(|_| AppError::Storage("media file not found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-signing-secret";

    #[test]
    fn sign_and_verify_round_trip() {
        let exp = Utc::now().timestamp() + 60;
        let sig = sign_token(SECRET, "u1/file.png", exp).unwrap();
        assert!(check_signed_request(SECRET, "u1/file.png", exp, &sig).is_ok());
    }

    #[test]
    fn tampered_path_fails_verification() {
        let exp = Utc::now().timestamp() + 60;
        let sig = sign_token(SECRET, "u1/file.png", exp).unwrap();
        assert!(matches!(
            check_signed_request(SECRET, "u2/file.png", exp, &sig),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn expired_link_is_rejected_after_ttl() {
        let exp = Utc::now().timestamp() - 1;
        let sig = sign_token(SECRET, "u1/file.png", exp).unwrap();
        assert!(matches!(
            check_signed_request(SECRET, "u1/file.png", exp, &sig),
            Err(AppError::LinkExpired)
        ));
    }

    #[test]
    fn signed_url_carries_exp_and_sig() {
        let signed =
            signed_media_url(SECRET, "http://localhost:4000", "u1/file.png", None).unwrap();
        assert!(signed.url.starts_with("http://localhost:4000/api/media/u1/file.png?exp="));
        assert!(signed.url.contains("&sig="));
        assert!(signed.expires_at > Utc::now());
    }

    #[test]
    fn traversal_paths_are_unsafe() {
        assert!(!is_safe_storage_path("../etc/passwd"));
        assert!(!is_safe_storage_path("u1/../secret"));
        assert!(!is_safe_storage_path("/u1/file.png"));
        assert!(!is_safe_storage_path("u1/a/b.png"));
        assert!(!is_safe_storage_path(""));
        assert!(is_safe_storage_path("u1/9b2e.png"));
    }

    #[test]
    fn mime_classification_splits_inline_images_from_downloads() {
        assert_eq!(attachment_kind_from_mime("image/png"), "image");
        assert_eq!(attachment_kind_from_mime("IMAGE/JPEG"), "image");
        assert_eq!(attachment_kind_from_mime("application/pdf"), "file");
        assert_eq!(attachment_kind_from_mime(""), "file");
    }

    #[test]
    fn storage_paths_are_namespaced_and_safe() {
        let path = new_storage_path("client 1", "photo.PNG", "image/png");
        assert!(is_safe_storage_path(&path));
        assert!(path.starts_with("client-1/"));
        assert!(path.ends_with(".png"));
    }

    #[tokio::test]
    async fn stored_bytes_read_back_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = new_storage_path("u1", "notes.txt", "text/plain");
        store_bytes(dir.path(), &path, b"hello attachment").await.unwrap();
        let bytes = read_bytes(dir.path(), &path).await.unwrap();
        assert_eq!(bytes, b"hello attachment");
    }
}
