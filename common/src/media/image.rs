use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{Exif, In, Tag, Value};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};

use api::media::MediaCategory;

use crate::media::{heif, ExtractError, ExtractedMetadata};

/// JPEG/TIFF/PNG/WebP reader: dimensions from the container header (no
/// full decode) plus best-effort EXIF. Unfortunately both `image` and
/// `kamadak-exif` are synchronous, so everything routes through
/// `spawn_blocking` to avoid jamming the async runtime.
#[instrument(skip_all)]
pub async fn extract_image(path: &Path) -> Result<ExtractedMetadata, ExtractError> {
    debug!("extracting image metadata");

    let path = path.to_path_buf();

    let result = spawn_blocking(move || -> Result<ExtractedMetadata, ExtractError> {
        let reader = image::ImageReader::open(&path)
            .map_err(|err| ExtractError::UnreadableFile {
                path: path.clone(),
                source: err,
            })?
            .with_guessed_format()
            .map_err(|err| ExtractError::UnreadableFile {
                path: path.clone(),
                source: err,
            })?;

        let dims = reader.into_dimensions().ok();

        let mut metadata = ExtractedMetadata {
            category: Some(MediaCategory::Image),
            width: dims.map(|(w, _)| w),
            height: dims.map(|(_, h)| h),
            ..Default::default()
        };

        if let Ok(file) = std::fs::File::open(&path) {
            let mut bufreader = std::io::BufReader::new(file);

            if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
                apply_exif(&exif, &mut metadata);
            }
            // a missing/corrupt EXIF block is not an error; the record is
            // simply published with null camera/time fields (§4.1).
        }

        Ok(metadata)
    })
    .await
    .map_err(|_| ExtractError::CorruptMetadata {
        path: path.clone(),
        reason: "extractor task panicked".to_owned(),
    })??;

    Ok(result)
}

/// HEIF/HEIC reader: dimensions and the primary image's EXIF block come
/// from the HEIF bridge, then we parse that EXIF block exactly the way the
/// JPEG/TIFF reader does (§4.1).
#[instrument(skip_all)]
pub async fn extract_heif(path: &Path) -> Result<ExtractedMetadata, ExtractError> {
    debug!("extracting HEIF metadata");

    let mut metadata = ExtractedMetadata {
        category: Some(MediaCategory::Image),
        ..Default::default()
    };

    // a disabled/unavailable bridge degrades to null dimensions, still a
    // success (§9 open question resolution), never `failureCount`.
    if let Ok((w, h)) = heif::dimensions(path).await {
        metadata.width = Some(w);
        metadata.height = Some(h);
    }

    if let Ok(exif_bytes) = heif::primary_exif(path).await {
        if let Ok(exif) = exif::Reader::new().read_raw(exif_bytes) {
            apply_exif(&exif, &mut metadata);
        }
    }

    Ok(metadata)
}

fn apply_exif(exif: &Exif, metadata: &mut ExtractedMetadata) {
    let original = field_datetime(exif, Tag::DateTimeOriginal, Tag::OffsetTimeOriginal);
    let digitized = || field_datetime(exif, Tag::DateTimeDigitized, Tag::OffsetTimeDigitized);
    let plain = || field_datetime(exif, Tag::DateTime, Tag::OffsetTime);

    if let Some((ts, offset)) = original.or_else(digitized).or_else(plain) {
        metadata.exif_timestamp = Some(ts);
        metadata.exif_timezone_offset = offset;
    }

    metadata.camera_make = field_str(exif, Tag::Make);
    metadata.camera_model = field_str(exif, Tag::Model);
    metadata.lens_model = field_str(exif, Tag::LensModel);
    metadata.exposure_time = field_display(exif, Tag::ExposureTime);
    metadata.aperture = field_rational(exif, Tag::FNumber);
    metadata.iso = field_int(exif, Tag::PhotographicSensitivity);
    metadata.focal_length = field_rational(exif, Tag::FocalLength);
}

fn field_datetime(
    exif: &Exif,
    tag: Tag,
    offset_tag: Tag,
) -> Option<(DateTime<Utc>, Option<String>)> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let raw = format!("{}", field.display_value());

    // EXIF datetimes look like "2023:05:15 10:30:00"; no timezone info
    // lives in this field itself.
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y:%m:%d %H:%M:%S").ok()?;
    let ts = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);

    let offset = exif
        .get_field(offset_tag, In::PRIMARY)
        .map(|f| format!("{}", f.display_value()).trim_matches('"').to_owned());

    Some((ts, offset))
}

fn field_str(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let raw = format!("{}", field.display_value());
    let trimmed = raw.trim().trim_matches('"').trim();

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn field_display(exif: &Exif, tag: Tag) -> Option<String> {
    exif.get_field(tag, In::PRIMARY)
        .map(|f| format!("{}", f.display_value()))
}

fn field_rational(exif: &Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;

    match &field.value {
        Value::Rational(values) => values.first().map(|r| r.to_f64()),
        Value::SRational(values) => values.first().map(|r| r.to_f64()),
        _ => None,
    }
}

fn field_int(exif: &Exif, tag: Tag) -> Option<i64> {
    let field = exif.get_field(tag, In::PRIMARY)?;

    match &field.value {
        Value::Short(values) => values.first().map(|v| *v as i64),
        Value::Long(values) => values.first().map(|v| *v as i64),
        _ => None,
    }
}
