use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

use image::{ImageBuffer, Rgb};
use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};
use tracing::warn;

use crate::media::ExtractError;

const HEIF_EXTENSIONS: &[&str] = &["heic", "heif", "heics", "heifs"];

/// The libheif bridge is probed once, lazily, and memoized — repeated
/// per-file checks during a scan would otherwise reinitialize libheif
/// thousands of times over (§4.2).
static SUPPORTED: OnceLock<bool> = OnceLock::new();

/// Whether the native HEIF library is usable on this host. A scan never
/// fails because of this; files that need it just fall back to
/// `ExtractError::NativeToolUnavailable` and are recorded with null
/// dimensions.
pub fn is_supported() -> bool {
    *SUPPORTED.get_or_init(|| {
        let probe = std::panic::catch_unwind(LibHeif::new);

        match probe {
            Ok(_) => true,
            Err(_) => {
                warn!("libheif unavailable on this host; HEIF files will be recorded with null dimensions");
                false
            }
        }
    })
}

pub fn is_heif(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| HEIF_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub async fn dimensions(path: &Path) -> Result<(u32, u32), ExtractError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || dimensions_blocking(&path))
        .await
        .map_err(|_| ExtractError::NativeToolUnavailable)?
}

fn dimensions_blocking(path: &Path) -> Result<(u32, u32), ExtractError> {
    if !is_supported() {
        return Err(ExtractError::NativeToolUnavailable);
    }

    let ctx = HeifContext::read_from_file(&path.to_string_lossy())
        .map_err(|_| ExtractError::NativeToolUnavailable)?;
    let handle = ctx
        .primary_image_handle()
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    Ok((handle.width(), handle.height()))
}

/// Raw EXIF block embedded in the primary image, if the container carries
/// one. Absence is not an error; callers treat a miss as "no EXIF".
pub async fn primary_exif(path: &Path) -> Result<Vec<u8>, ExtractError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || primary_exif_blocking(&path))
        .await
        .map_err(|_| ExtractError::NativeToolUnavailable)?
}

fn primary_exif_blocking(path: &Path) -> Result<Vec<u8>, ExtractError> {
    if !is_supported() {
        return Err(ExtractError::NativeToolUnavailable);
    }

    let ctx = HeifContext::read_from_file(&path.to_string_lossy())
        .map_err(|_| ExtractError::NativeToolUnavailable)?;
    let handle = ctx
        .primary_image_handle()
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    let ids = handle.metadata_block_ids("Exif");
    let id = ids.first().ok_or(ExtractError::NativeToolUnavailable)?;

    let raw = handle
        .metadata(*id)
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    // the EXIF block in a HEIF container is prefixed with a 4-byte offset
    // to the TIFF header; skip it to hand the caller a bare EXIF stream.
    if raw.len() > 4 {
        Ok(raw[4..].to_vec())
    } else {
        Err(ExtractError::NativeToolUnavailable)
    }
}

/// Exists for HEIF bridge contract fidelity (§4.2); the derivative/cache
/// pipeline that would call this is out of scope for the scan pipeline
/// itself, so only a unit test exercises it today.
#[allow(dead_code)]
pub async fn to_jpeg_bytes(path: &Path, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || encode_jpeg(&path, None, quality))
        .await
        .map_err(|_| ExtractError::NativeToolUnavailable)?
}

#[allow(dead_code)]
pub async fn thumbnail(path: &Path, max_edge: u32, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || encode_jpeg(&path, Some(max_edge), quality))
        .await
        .map_err(|_| ExtractError::NativeToolUnavailable)?
}

fn encode_jpeg(path: &Path, max_edge: Option<u32>, quality: u8) -> Result<Vec<u8>, ExtractError> {
    if !is_supported() {
        return Err(ExtractError::NativeToolUnavailable);
    }

    let lib_heif = LibHeif::new();
    let ctx = HeifContext::read_from_file(&path.to_string_lossy())
        .map_err(|_| ExtractError::NativeToolUnavailable)?;
    let handle = ctx
        .primary_image_handle()
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    let decoded = lib_heif
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    let plane = decoded
        .planes()
        .interleaved
        .ok_or(ExtractError::NativeToolUnavailable)?;

    let width = plane.width;
    let height = plane.height;
    let stride = plane.stride;
    let data = plane.data;

    let mut buf = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(width, height);
    for y in 0..height {
        let row_start = (y as usize) * stride;
        for x in 0..width {
            let idx = row_start + (x as usize) * 3;
            buf.put_pixel(x, y, Rgb([data[idx], data[idx + 1], data[idx + 2]]));
        }
    }

    let resized = match max_edge {
        Some(edge) if width.max(height) > edge => {
            let scale = edge as f32 / width.max(height) as f32;
            let new_w = (width as f32 * scale).round().max(1.0) as u32;
            let new_h = (height as f32 * scale).round().max(1.0) as u32;
            image::imageops::resize(&buf, new_w, new_h, image::imageops::FilterType::Lanczos3)
        }
        _ => buf,
    };

    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    resized
        .write_with_encoder(encoder)
        .map_err(|_| ExtractError::NativeToolUnavailable)?;

    Ok(out.into_inner())
}
