//! Subtitle serialization.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::{ExtractError, Result};
use crate::merge::SubtitleCue;

pub trait SubtitleWriter {
    fn extension(&self) -> &'static str;

    fn render(&self, cues: &[SubtitleCue]) -> String;

    /// Writes `cues` to `path`, creating parent directories.
    fn write(&self, cues: &[SubtitleCue], path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                ExtractError::Writer(format!("{}: {err}", parent.display()))
            })?;
        }
        fs::write(path, self.render(cues))
            .map_err(|err| ExtractError::Writer(format!("{}: {err}", path.display())))?;
        info!(path = %path.display(), cues = cues.len(), "Subtitles written");
        Ok(())
    }

    /// `input` with this writer's extension.
    fn default_path(&self, input: &Path) -> PathBuf {
        input.with_extension(self.extension())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SrtWriter;

impl SubtitleWriter for SrtWriter {
    fn extension(&self) -> &'static str {
        "srt"
    }

    fn render(&self, cues: &[SubtitleCue]) -> String {
        let mut out = String::new();
        for (number, cue) in cues.iter().enumerate() {
            let _ = write!(
                out,
                "{}\n{} --> {}\n{}\n\n",
                number + 1,
                timecode(cue.start),
                timecode(cue.end),
                cue.text
            );
        }
        out
    }
}

/// `HH:MM:SS,mmm`, milliseconds truncated.
pub fn timecode(at: Duration) -> String {
    let total_ms = at.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = total_ms / 60_000 % 60;
    let seconds = total_ms / 1_000 % 60;
    let millis = total_ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Position of `frame` in a `fps` video as `HH:MM:SS:mmm`.
pub fn frame_to_timecode(frame: u64, fps: f64) -> String {
    if !(fps.is_finite() && fps > 0.0) {
        return "00:00:00:000".to_string();
    }
    let total_ms = (frame as f64 / fps * 1_000.0) as u64;
    format!(
        "{:02}:{:02}:{:02}:{:03}",
        total_ms / 3_600_000,
        total_ms / 60_000 % 60,
        total_ms / 1_000 % 60,
        total_ms % 1_000
    )
}
