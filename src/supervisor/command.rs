//! Encoder command assembly.
//!
//! The command is an argv vector handed to the control facility without
//! any shell in between. Source and destination are validated before they
//! are placed in the vector; the encoding parameters are fixed.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use url::Url;

use crate::models::session::{Destination, StreamSource};
use crate::{AppError, Result};

/// Fixed encoding parameters applied to every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingProfile {
    /// Video codec.
    pub video_codec: &'static str,
    /// Encoder speed preset.
    pub preset: &'static str,
    /// Target and maximum video bitrate, kbit/s.
    pub video_bitrate_kbps: u32,
    /// Keyframe interval in frames.
    pub gop_frames: u32,
    /// Output pixel format.
    pub pixel_format: &'static str,
    /// Audio codec.
    pub audio_codec: &'static str,
    /// Audio bitrate, kbit/s.
    pub audio_bitrate_kbps: u32,
    /// Audio sample rate, Hz.
    pub audio_sample_rate: u32,
    /// Audio channel count.
    pub audio_channels: u8,
    /// Output container.
    pub container: &'static str,
}

/// The reviewed live-streaming profile.
pub const STREAM_PROFILE: EncodingProfile = EncodingProfile {
    video_codec: "libx264",
    preset: "veryfast",
    video_bitrate_kbps: 4500,
    gop_frames: 60,
    pixel_format: "yuv420p",
    audio_codec: "aac",
    audio_bitrate_kbps: 128,
    audio_sample_rate: 44_100,
    audio_channels: 2,
    container: "flv",
};

const YOUTUBE_INGEST: &str = "rtmp://a.rtmp.youtube.com/live2";
const FACEBOOK_INGEST: &str = "rtmps://live-api-s.facebook.com:443/rtmp";
const TWITCH_INGEST: &str = "rtmp://live.twitch.tv/app";

/// Builds encoder argv vectors for sessions.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    encoder: String,
    media_root: Option<PathBuf>,
    profile: EncodingProfile,
    stream_key: Regex,
}

impl CommandBuilder {
    /// Create a builder for `encoder`, optionally confining sources to `media_root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the internal key pattern fails to compile.
    pub fn new(encoder: impl Into<String>, media_root: Option<PathBuf>) -> Result<Self> {
        let stream_key = Regex::new(r"^[A-Za-z0-9_.\-]+$")
            .map_err(|err| AppError::Config(format!("stream key pattern: {err}")))?;
        Ok(Self {
            encoder: encoder.into(),
            media_root,
            profile: STREAM_PROFILE,
            stream_key,
        })
    }

    /// Encoding profile in use.
    #[must_use]
    pub fn profile(&self) -> &EncodingProfile {
        &self.profile
    }

    /// Validate a source/destination pair without building anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first invalid field.
    pub fn validate(&self, source: &StreamSource, destination: &Destination) -> Result<()> {
        self.source_path(source)?;
        self.ingest_url(destination)?;
        Ok(())
    }

    /// Full argv, encoder binary first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the source or destination is invalid.
    pub fn build(&self, source: &StreamSource, destination: &Destination) -> Result<Vec<String>> {
        let input = self.source_path(source)?;
        let output = self.ingest_url(destination)?;
        let p = &self.profile;

        let mut argv: Vec<String> = vec![
            self.encoder.clone(),
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "warning".into(),
            "-re".into(),
        ];
        if source.looping {
            argv.extend(["-stream_loop".into(), "-1".into()]);
        }
        argv.extend([
            "-i".into(),
            input,
            "-c:v".into(),
            p.video_codec.into(),
            "-preset".into(),
            p.preset.into(),
            "-b:v".into(),
            format!("{}k", p.video_bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", p.video_bitrate_kbps),
            "-bufsize".into(),
            format!("{}k", p.video_bitrate_kbps * 2),
            "-pix_fmt".into(),
            p.pixel_format.into(),
            "-g".into(),
            p.gop_frames.to_string(),
            "-keyint_min".into(),
            p.gop_frames.to_string(),
            "-c:a".into(),
            p.audio_codec.into(),
            "-b:a".into(),
            format!("{}k", p.audio_bitrate_kbps),
            "-ar".into(),
            p.audio_sample_rate.to_string(),
            "-ac".into(),
            p.audio_channels.to_string(),
            "-f".into(),
            p.container.into(),
            output,
        ]);
        Ok(argv)
    }

    /// Validated source path as it will appear in argv.
    fn source_path(&self, source: &StreamSource) -> Result<String> {
        let raw = source.path.as_str();
        if raw.is_empty() {
            return Err(AppError::Config("source path must not be empty".into()));
        }
        if let Some(bad) = raw.chars().find(|c| forbidden_in_argv(*c)) {
            return Err(AppError::Config(format!(
                "source path contains forbidden character {bad:?}"
            )));
        }

        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(AppError::Config(format!(
                "source path '{raw}' must be absolute"
            )));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(AppError::Config(format!(
                "source path '{raw}' must not contain '..'"
            )));
        }
        if let Some(ref root) = self.media_root {
            if !path.starts_with(root) {
                return Err(AppError::Config(format!(
                    "source path '{raw}' is outside media root {}",
                    root.display()
                )));
            }
        }
        Ok(raw.to_owned())
    }

    /// Validated ingest URL for a destination.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the stream key or URL is invalid.
    pub fn ingest_url(&self, destination: &Destination) -> Result<String> {
        match destination {
            Destination::Youtube { stream_key } => {
                Ok(format!("{YOUTUBE_INGEST}/{}", self.checked_key(stream_key)?))
            }
            Destination::Facebook { stream_key } => {
                Ok(format!("{FACEBOOK_INGEST}/{}", self.checked_key(stream_key)?))
            }
            Destination::Twitch { stream_key } => {
                Ok(format!("{TWITCH_INGEST}/{}", self.checked_key(stream_key)?))
            }
            Destination::Custom { url } => checked_custom_url(url),
        }
    }

    fn checked_key<'a>(&self, key: &'a str) -> Result<&'a str> {
        if self.stream_key.is_match(key) {
            Ok(key)
        } else {
            Err(AppError::Config(
                "stream key may only contain letters, digits, '_', '.' and '-'".into(),
            ))
        }
    }
}

fn checked_custom_url(raw: &str) -> Result<String> {
    if raw.chars().any(|c| c.is_whitespace() || forbidden_in_argv(c)) {
        return Err(AppError::Config(
            "destination url contains whitespace or forbidden characters".into(),
        ));
    }
    let url = Url::parse(raw)
        .map_err(|err| AppError::Config(format!("invalid destination url: {err}")))?;
    if !matches!(url.scheme(), "rtmp" | "rtmps") {
        return Err(AppError::Config(format!(
            "destination scheme '{}' is not rtmp or rtmps",
            url.scheme()
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(raw.to_owned()),
        _ => Err(AppError::Config("destination url has no host".into())),
    }
}

/// Characters never allowed in argv values: control characters, plus the
/// service manager's variable (`$`) and specifier (`%`) introducers.
fn forbidden_in_argv(c: char) -> bool {
    c.is_control() || c == '$' || c == '%'
}
