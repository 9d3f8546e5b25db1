//! Video frame extraction and assembly via the ffmpeg CLI.
//!
//! Container and codec choices live here, outside the core engine. Each
//! operation shells out to `ffmpeg` and treats a non-zero exit status or
//! a missing binary as fatal.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to launch ffmpeg (is it installed and on PATH?)")]
    Spawn(#[source] std::io::Error),

    #[error("ffmpeg exited with {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("no video frames were extracted")]
    NoFramesExtracted,

    #[error("io error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn run_ffmpeg(args: &[String]) -> Result<(), VideoError> {
    info!("ffmpeg {}", args.join(" "));
    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .map_err(VideoError::Spawn)?;
    if !output.status.success() {
        return Err(VideoError::Failed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(2000)
                .collect(),
        });
    }
    Ok(())
}

/// Remove previously generated stills from a frame directory, creating it
/// if needed.
pub fn prepare_frames_dir(dir: &Path) -> Result<(), VideoError> {
    let wrap = |source| VideoError::Io {
        path: dir.display().to_string(),
        source,
    };
    if dir.exists() {
        for entry in std::fs::read_dir(dir).map_err(wrap)? {
            let path = entry.map_err(wrap)?.path();
            let is_frame = path
                .extension()
                .is_some_and(|ext| ext == "png" || ext == "jpg");
            if is_frame {
                std::fs::remove_file(&path).map_err(wrap)?;
            }
        }
    } else {
        std::fs::create_dir_all(dir).map_err(wrap)?;
    }
    Ok(())
}

/// Extract stills from a source video at `extraction_framerate` frames
/// per second into `out_dir`, returning the frame paths in order.
///
/// Zero extracted frames is an explicit error rather than a degenerate
/// empty run.
pub fn extract_video_frames(
    input: &Path,
    extraction_framerate: u32,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, VideoError> {
    prepare_frames_dir(out_dir)?;

    let pattern = out_dir.join("frame_%06d.png");
    run_ffmpeg(&[
        "-y".to_string(),
        "-i".to_string(),
        input.display().to_string(),
        "-vf".to_string(),
        format!("fps={extraction_framerate}"),
        pattern.display().to_string(),
    ])?;

    let glob_pattern = out_dir.join("frame_*.png").display().to_string();
    let mut frames: Vec<PathBuf> = glob::glob(&glob_pattern)
        .map_err(|e| VideoError::Io {
            path: glob_pattern.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?
        .flatten()
        .collect();
    frames.sort();

    if frames.is_empty() {
        return Err(VideoError::NoFramesExtracted);
    }
    info!("extracted {} frames from {}", frames.len(), input.display());
    Ok(frames)
}

/// Assemble numbered stills (`1.png`, `2.png`, ...) into a video.
///
/// The stills are read at `assumed_input_framerate` (defaulting to the
/// output rate) and interpolated to `output_framerate` when the two
/// differ, so restyled output keeps the source duration. The prompt text
/// is embedded as comment metadata.
pub fn encode_video(
    output: &Path,
    stills_dir: &Path,
    metadata_comment: &str,
    output_framerate: u32,
    assumed_input_framerate: Option<u32>,
) -> Result<(), VideoError> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| VideoError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let input_rate = assumed_input_framerate.unwrap_or(output_framerate);
    let pattern = stills_dir.join("%d.png");

    let mut args = vec![
        "-y".to_string(),
        "-f".to_string(),
        "image2".to_string(),
        "-framerate".to_string(),
        input_rate.to_string(),
        "-i".to_string(),
        pattern.display().to_string(),
    ];
    if input_rate != output_framerate {
        args.push("-vf".to_string());
        args.push(format!("fps={output_framerate}"));
    }
    args.extend([
        "-c:v".to_string(),
        "libx264".to_string(),
        "-crf".to_string(),
        "18".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-metadata".to_string(),
        format!("comment={metadata_comment}"),
        output.display().to_string(),
    ]);
    run_ffmpeg(&args)?;
    info!("encoded video {}", output.display());
    Ok(())
}

/// Transplant the audio track of `source` onto `video`, writing `output`.
///
/// The two durations should match; audio is stream-copied, video is not
/// re-encoded.
pub fn copy_video_audio(source: &Path, video: &Path, output: &Path) -> Result<(), VideoError> {
    run_ffmpeg(&[
        "-y".to_string(),
        "-i".to_string(),
        video.display().to_string(),
        "-i".to_string(),
        source.display().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0?".to_string(),
        output.display().to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_clears_only_frames() {
        let dir = tempfile::tempdir().unwrap();
        let frame = dir.path().join("1.png");
        let other = dir.path().join("notes.txt");
        std::fs::write(&frame, b"x").unwrap();
        std::fs::write(&other, b"y").unwrap();

        prepare_frames_dir(dir.path()).unwrap();
        assert!(!frame.exists());
        assert!(other.exists());
    }

    #[test]
    fn prepare_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("frames");
        prepare_frames_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn missing_ffmpeg_input_is_an_error() {
        // Either ffmpeg is absent (Spawn) or it fails on the bogus input
        // (Failed); both are fatal, never a silent empty result.
        let dir = tempfile::tempdir().unwrap();
        let err = extract_video_frames(Path::new("/nonexistent.mp4"), 30, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            VideoError::Spawn(_) | VideoError::Failed { .. } | VideoError::NoFramesExtracted
        ));
    }
}
