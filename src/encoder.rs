use std::path::{Path, PathBuf};

use base64::Engine;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
  Jpeg,
  Png,
  Gif,
  Webp,
}

impl ImageMime {
  pub fn as_str(self) -> &'static str {
    match self {
      ImageMime::Jpeg => "image/jpeg",
      ImageMime::Png => "image/png",
      ImageMime::Gif => "image/gif",
      ImageMime::Webp => "image/webp",
    }
  }

  pub fn parse(mime: &str) -> Option<Self> {
    match mime.trim().to_ascii_lowercase().as_str() {
      "image/jpeg" | "image/jpg" => Some(ImageMime::Jpeg),
      "image/png" => Some(ImageMime::Png),
      "image/gif" => Some(ImageMime::Gif),
      "image/webp" => Some(ImageMime::Webp),
      _ => None,
    }
  }

  pub fn extension(self) -> &'static str {
    match self {
      ImageMime::Jpeg => "jpg",
      ImageMime::Png => "png",
      ImageMime::Gif => "gif",
      ImageMime::Webp => "webp",
    }
  }

  pub fn sniff(bytes: &[u8]) -> Option<Self> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
      Some(ImageMime::Jpeg)
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
      Some(ImageMime::Png)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
      Some(ImageMime::Gif)
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
      Some(ImageMime::Webp)
    } else {
      None
    }
  }

  pub fn from_extension(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "jpg" | "jpeg" => Some(ImageMime::Jpeg),
      "png" => Some(ImageMime::Png),
      "gif" => Some(ImageMime::Gif),
      "webp" => Some(ImageMime::Webp),
      _ => None,
    }
  }
}

/// What the upload boundary accepts. Videos are only acknowledged, never analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Image,
  Video,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv"];

impl MediaKind {
  pub fn from_file_name(name: &str) -> Option<Self> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
      Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
      Some(MediaKind::Video)
    } else {
      None
    }
  }
}

/// Where an image comes from before it is encoded for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
  Path(PathBuf),
  Bytes(Vec<u8>),
  Url(String),
}

/// An image as the chat-completion request carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
  Url(String),
  Inline { mime: ImageMime, base64: String },
}

impl ImageReference {
  pub fn to_url(&self) -> String {
    match self {
      ImageReference::Url(url) => url.clone(),
      ImageReference::Inline { mime, base64 } => format!("data:{};base64,{}", mime.as_str(), base64),
    }
  }
}

pub fn encode(source: &ImageSource) -> Result<ImageReference, PipelineError> {
  match source {
    ImageSource::Url(url) => Ok(ImageReference::Url(url.clone())),
    ImageSource::Bytes(bytes) => {
      let mime = ImageMime::sniff(bytes)
        .ok_or_else(|| PipelineError::UnsupportedMedia("uploaded bytes are not a known image format".to_string()))?;
      Ok(inline(mime, bytes))
    }
    ImageSource::Path(path) => {
      let bytes = std::fs::read(path).map_err(|source| PipelineError::Io {
        path: path.clone(),
        source,
      })?;
      let mime = ImageMime::sniff(&bytes)
        .or_else(|| ImageMime::from_extension(path))
        .ok_or_else(|| PipelineError::UnsupportedMedia(format!("{} is not a known image format", path.display())))?;
      Ok(inline(mime, &bytes))
    }
  }
}

fn inline(mime: ImageMime, bytes: &[u8]) -> ImageReference {
  ImageReference::Inline {
    mime,
    base64: base64::engine::general_purpose::STANDARD.encode(bytes),
  }
}
