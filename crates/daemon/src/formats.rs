//! Extractor metadata and format selection.
//!
//! [`MediaInfo`] mirrors the subset of the extractor's JSON dump the pipeline
//! reads. [`FormatEntry`] is the derived view used for menus, size checks
//! and container decisions. Selector strings are built for the extractor's
//! own format grammar; this module never interprets that grammar.

use crate::classify::{audio_codec_family, video_codec_family, AudioCodec, VideoCodec};
use serde::{Deserialize, Serialize};

/// Heights offered in the quality menu, highest first.
pub const QUALITY_LADDER: &[u32] = &[2160, 1440, 1080, 720, 480, 360, 240, 144];

/// One format descriptor as reported by the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawFormat {
    #[serde(default)]
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    /// Total bitrate in kbit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Metadata for one media item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub extractor_key: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    /// Streams the extractor would merge for the requested selector.
    #[serde(default)]
    pub requested_formats: Option<Vec<RawFormat>>,
}

impl MediaInfo {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_youtube(&self) -> bool {
        self.extractor_key
            .as_deref()
            .map(|k| k.eq_ignore_ascii_case("youtube"))
            .unwrap_or(false)
    }

    /// The item-level fields viewed as a single format, used when the
    /// extractor lists no formats at all.
    pub fn as_format(&self) -> RawFormat {
        RawFormat {
            format_id: self.format_id.clone().unwrap_or_default(),
            ext: self.ext.clone(),
            vcodec: self.vcodec.clone(),
            acodec: self.acodec.clone(),
            filesize: self.filesize,
            filesize_approx: self.filesize_approx,
            tbr: self.tbr,
            ..RawFormat::default()
        }
    }

    /// Derived entries for every playable format.
    pub fn entries(&self) -> Vec<FormatEntry> {
        if self.formats.is_empty() {
            return vec![FormatEntry::from_raw(&self.as_format())];
        }
        self.formats
            .iter()
            .map(FormatEntry::from_raw)
            .filter(|f| !f.is_mhtml)
            .collect()
    }

    /// Entries for the streams the extractor picked for the request.
    pub fn selected_entries(&self) -> Vec<FormatEntry> {
        match &self.requested_formats {
            Some(requested) if !requested.is_empty() => {
                requested.iter().map(FormatEntry::from_raw).collect()
            }
            _ => vec![FormatEntry::from_raw(&self.as_format())],
        }
    }

    pub fn find_format(&self, id: &str) -> Option<FormatEntry> {
        self.formats
            .iter()
            .find(|f| f.format_id == id)
            .map(FormatEntry::from_raw)
    }
}

/// Derived view of a [`RawFormat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatEntry {
    pub id: String,
    pub ext: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub height: Option<u32>,
    /// Total bitrate in kbit/s.
    pub bitrate_kbps: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    pub is_dash: bool,
    pub is_hls: bool,
    /// Storyboard or preview artifact, never delivered.
    pub is_mhtml: bool,
}

impl FormatEntry {
    pub fn from_raw(raw: &RawFormat) -> Self {
        let video_codec = video_codec_family(raw.vcodec.as_deref());
        let audio_codec = audio_codec_family(raw.acodec.as_deref());
        let ext = raw.ext.as_deref().map(str::to_lowercase);
        let protocol = raw.protocol.as_deref().unwrap_or("").to_lowercase();
        let note = raw.format_note.as_deref().unwrap_or("").to_lowercase();

        let is_mhtml = ext.as_deref() == Some("mhtml")
            || protocol == "mhtml"
            || raw.format_id.starts_with("sb");

        let audio_ext = matches!(
            ext.as_deref(),
            Some("m4a" | "mp3" | "opus" | "ogg" | "oga" | "aac" | "wav" | "flac")
        );
        let has_video = match video_codec {
            VideoCodec::None => false,
            VideoCodec::Unknown => !audio_ext && !is_mhtml,
            _ => true,
        };
        let has_audio = match audio_codec {
            AudioCodec::None => false,
            // unreported codecs on progressive formats are usually muxed
            AudioCodec::Unknown => !is_mhtml,
            _ => true,
        };

        let is_hls = protocol.starts_with("m3u8");
        let is_dash = protocol.contains("dash")
            || note.contains("dash")
            || (!is_hls && !is_mhtml && has_video != has_audio);

        Self {
            id: raw.format_id.clone(),
            ext,
            has_video,
            has_audio,
            video_codec,
            audio_codec,
            height: raw.height,
            bitrate_kbps: raw.tbr.filter(|t| *t > 0.0),
            filesize: raw.filesize.filter(|s| *s > 0.0).map(|s| s as u64),
            filesize_approx: raw.filesize_approx.filter(|s| *s > 0.0).map(|s| s as u64),
            is_dash,
            is_hls,
            is_mhtml,
        }
    }

    pub fn is_muxed(&self) -> bool {
        self.has_video && self.has_audio
    }

    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Quality {
    /// Best available, extractor's choice.
    Auto,
    /// Best stream at or below a ladder height.
    Height(u32),
    /// Audio only.
    Audio,
    /// An explicit format id from the extractor's listing.
    Format(String),
}

impl Quality {
    /// Parse `auto`, `audio`, `720`, `720p` or an explicit format id.
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "" | "auto" | "best" => return Quality::Auto,
            "audio" | "mp3" | "m4a" => return Quality::Audio,
            _ => {}
        }
        let digits = value.strip_suffix('p').unwrap_or(&value);
        if let Ok(height) = digits.parse::<u32>() {
            if QUALITY_LADDER.contains(&height) {
                return Quality::Height(height);
            }
        }
        Quality::Format(raw.trim().to_string())
    }

    /// Ladder and auto picks may be substituted silently when oversize.
    pub fn allows_substitution(&self) -> bool {
        matches!(self, Quality::Auto | Quality::Height(_) | Quality::Audio)
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::Auto => write!(f, "auto"),
            Quality::Height(h) => write!(f, "{}p", h),
            Quality::Audio => write!(f, "audio"),
            Quality::Format(id) => write!(f, "{}", id),
        }
    }
}

/// Build the extractor's format selector for a request.
///
/// `explicit` is the resolved entry when `quality` is an explicit id, used to
/// pair video-only formats with the best audio.
pub fn build_selector(quality: &Quality, explicit: Option<&FormatEntry>, force_hls: bool) -> String {
    match quality {
        Quality::Format(id) => match explicit {
            Some(entry) if entry.is_video_only() => format!("{id}+ba/{id}"),
            _ => id.clone(),
        },
        Quality::Audio => "ba/b".to_string(),
        Quality::Height(h) if force_hls => {
            format!("b[protocol^=m3u8][height<={h}]/bv*[protocol^=m3u8][height<={h}]+ba/b[height<={h}]/b")
        }
        Quality::Height(h) => format!(
            "bv*[height<={h}][ext=mp4]+ba[ext=m4a]/bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/b"
        ),
        Quality::Auto if force_hls => "b[protocol^=m3u8]/bv*[protocol^=m3u8]+ba/b".to_string(),
        Quality::Auto => "bv*+ba/b".to_string(),
    }
}

/// Ladder steps the media can actually serve.
///
/// A step is offered when some video format's height falls between the next
/// lower step (exclusive) and the step itself (inclusive).
pub fn available_heights(entries: &[FormatEntry]) -> Vec<u32> {
    let heights: Vec<u32> = entries
        .iter()
        .filter(|e| e.has_video && !e.is_mhtml)
        .filter_map(|e| e.height)
        .collect();

    QUALITY_LADDER
        .iter()
        .enumerate()
        .filter(|(i, step)| {
            let lower = QUALITY_LADDER.get(i + 1).copied().unwrap_or(0);
            heights.iter().any(|h| *h > lower && *h <= **step)
        })
        .map(|(_, step)| *step)
        .collect()
}

/// Menu options for the selection flow: available heights then audio.
pub fn quality_menu(entries: &[FormatEntry]) -> Vec<Quality> {
    let mut menu: Vec<Quality> = available_heights(entries)
        .into_iter()
        .map(Quality::Height)
        .collect();
    if entries.iter().any(|e| e.has_audio) {
        menu.push(Quality::Audio);
    }
    menu
}
