//! ffmpeg transcoding helpers.
//!
//! Every intermediate file gets a uuid name so concurrent chats never collide.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::speech::SpeechError;

pub fn unique_name(extension: &str) -> String {
    format!("{}.{}", Uuid::new_v4(), extension)
}

/// Convert an OGG voice note to MP3 under `audio_dir`. Returns the new file.
pub fn ogg_to_mp3(ogg_path: &Path, audio_dir: &Path) -> Result<PathBuf, SpeechError> {
    std::fs::create_dir_all(audio_dir).map_err(|e| SpeechError::Io {
        path: audio_dir.to_path_buf(),
        source: e,
    })?;
    let mp3_path = audio_dir.join(unique_name("mp3"));

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y").arg("-i").arg(ogg_path).arg(&mp3_path);
    run_ffmpeg(cmd)?;

    debug!("Converted {:?} to {:?}", ogg_path, mp3_path);
    Ok(mp3_path)
}

/// Convert any audio ffmpeg understands to OGG Opus for Telegram voice messages.
pub fn to_voice_ogg(audio: &[u8]) -> Result<Vec<u8>, SpeechError> {
    let temp_dir = std::env::temp_dir();
    let input_path = temp_dir.join(unique_name("audio"));
    let output_path = temp_dir.join(unique_name("ogg"));

    std::fs::write(&input_path, audio).map_err(|e| SpeechError::Io {
        path: input_path.clone(),
        source: e,
    })?;

    // 300ms of leading silence: Telegram clips the start of voice playback.
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-f", "lavfi", "-i", "anullsrc=r=44100:cl=mono", "-i"])
        .arg(&input_path)
        .args([
            "-filter_complex",
            "[0]atrim=0:0.3[silence];[silence][1:a]concat=n=2:v=0:a=1",
            "-c:a",
            "libopus",
            "-b:a",
            "64k",
        ])
        .arg(&output_path);
    let result = run_ffmpeg(cmd);
    remove_quietly(&input_path);
    if let Err(e) = result {
        remove_quietly(&output_path);
        return Err(e);
    }

    let ogg = std::fs::read(&output_path).map_err(|e| SpeechError::Io {
        path: output_path.clone(),
        source: e,
    });
    remove_quietly(&output_path);
    let ogg = ogg?;

    debug!("Converted audio ({} bytes) to OGG ({} bytes)", audio.len(), ogg.len());
    Ok(ogg)
}

/// Best-effort delete of a temporary audio file.
pub fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {:?}: {}", path, e);
    }
}

fn run_ffmpeg(mut cmd: Command) -> Result<(), SpeechError> {
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(SpeechError::Spawn)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SpeechError::Ffmpeg(last_line(&stderr)));
    }
    Ok(())
}

/// ffmpeg prints its banner first; the reason for a failure is at the end.
fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_differ() {
        let a = unique_name("mp3");
        let b = unique_name("mp3");
        assert_ne!(a, b);
        assert!(a.ends_with(".mp3"));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("banner\nconfig\nfoo.ogg: Invalid data\n\n"), "foo.ogg: Invalid data");
        assert_eq!(last_line(""), "unknown error");
    }

    #[test]
    fn test_remove_quietly_ignores_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.mp3");
        remove_quietly(&path);

        std::fs::write(&path, b"x").unwrap();
        remove_quietly(&path);
        assert!(!path.exists());
    }
}
