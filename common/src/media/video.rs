use std::path::Path;
use std::sync::Once;

use chrono::{DateTime, NaiveDateTime, Utc};
use ffmpeg_next as ffmpeg;
use tracing::{debug, instrument, warn};

use api::media::MediaCategory;

use crate::media::{ExtractError, ExtractedMetadata};

static FFMPEG_INIT: Once = Once::new();

fn ensure_ffmpeg() -> Result<(), ExtractError> {
    let mut init_err = false;

    FFMPEG_INIT.call_once(|| {
        if let Err(err) = ffmpeg::init() {
            warn!(%err, "ffmpeg failed to initialize");
            init_err = true;
        }
    });

    if init_err {
        Err(ExtractError::NativeToolUnavailable)
    } else {
        Ok(())
    }
}

/// MP4/MOV/MKV/AVI reader: container duration, the best video stream's
/// codec and dimensions, and, when present, the container's creation-time
/// tag as a fallback timestamp (§4.1).
#[instrument(skip_all)]
pub async fn extract_video(path: &Path) -> Result<ExtractedMetadata, ExtractError> {
    debug!("extracting video metadata");

    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || extract_video_blocking(&path))
        .await
        .map_err(|_| ExtractError::CorruptMetadata {
            path: path.clone(),
            reason: "extractor task panicked".to_owned(),
        })?
}

fn extract_video_blocking(path: &Path) -> Result<ExtractedMetadata, ExtractError> {
    ensure_ffmpeg()?;

    let input = ffmpeg::format::input(&path).map_err(|err| ExtractError::CorruptMetadata {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    let mut metadata = ExtractedMetadata {
        category: Some(MediaCategory::Video),
        ..Default::default()
    };

    if input.duration() != ffmpeg::ffi::AV_NOPTS_VALUE {
        metadata.duration = Some(input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64);
    }

    metadata.exif_timestamp = input
        .metadata()
        .get("creation_time")
        .and_then(parse_creation_time);

    let mut best_width = 0u32;

    for stream in input.streams() {
        let codec = match ffmpeg::codec::context::Context::from_parameters(stream.parameters()) {
            Ok(codec) => codec,
            Err(_) => continue,
        };

        if codec.medium() != ffmpeg::media::Type::Video {
            continue;
        }

        let video = match codec.decoder().video() {
            Ok(video) => video,
            Err(_) => continue,
        };

        let width = video.width();
        let height = video.height();
        let codec_name = video.codec().map(|c| c.name().to_owned());

        let is_thumbnail = codec_name.as_deref() == Some("mjpeg")
            || width < 64
            || height < 64
            || stream
                .disposition()
                .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC);

        if !is_thumbnail && width > best_width {
            best_width = width;
            metadata.width = Some(width);
            metadata.height = Some(height);
            metadata.video_codec = codec_name;
        }
    }

    Ok(metadata)
}

fn parse_creation_time(raw: &str) -> Option<DateTime<Utc>> {
    // ffmpeg's container tag is usually RFC 3339 ("2023-05-15T10:30:00.000000Z")
    // but some muxers emit the bare "YYYY-MM-DD HH:MM:SS" form.
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
