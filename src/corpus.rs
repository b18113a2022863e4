use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use serde::Deserialize;

use crate::encoder::{ImageMime, ImageSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceExemplar {
  pub identifier: String,
  pub title: String,
  pub description: String,
  pub image: ImageSource,
}

/// Fixed, ordered reference material sent ahead of every submission.
///
/// Built once at startup and shared read-only between requests; the order of
/// exemplars is the order they appear in the prompt.
#[derive(Debug, Clone)]
pub struct ReferenceCorpus {
  exemplars: Arc<[ReferenceExemplar]>,
}

#[derive(Deserialize)]
struct ExemplarEntry {
  identifier: String,
  title: String,
  description: String,
  image: ImageEntry,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImageEntry {
  Path {
    path: PathBuf,
  },
  Url {
    url: String,
  },
  Base64 {
    base64: String,
    #[serde(default)]
    mime: Option<String>,
  },
}

impl ReferenceCorpus {
  pub fn new(exemplars: Vec<ReferenceExemplar>) -> Self {
    Self {
      exemplars: exemplars.into(),
    }
  }

  pub fn list_exemplars(&self) -> &[ReferenceExemplar] {
    &self.exemplars
  }

  pub fn len(&self) -> usize {
    self.exemplars.len()
  }

  pub fn is_empty(&self) -> bool {
    self.exemplars.is_empty()
  }

  /// The three-frame jump smash breakdown, images resolved under `image_dir`.
  pub fn badminton_smash(image_dir: &Path) -> Self {
    let frame = |file: &str, title: &str, description: &[&str]| ReferenceExemplar {
      identifier: file.to_string(),
      title: title.to_string(),
      description: description.join(" "),
      image: ImageSource::Path(image_dir.join(file)),
    };

    Self::new(vec![
      frame(
        "frontsmashview.png",
        "Jump Smash Preparation",
        &[
          "The player is in mid-air, preparing to execute a jump smash.",
          "The racket arm is drawn back with the elbow positioned high, and the non-racket arm is slightly raised for balance.",
          "The body is rotating, and the player's eyes are likely tracking the shuttle.",
          "The elbow is positioned correctly behind the body, allowing for a full extension during the smash.",
          "The torso rotation generates more power, transferring energy from the core to the racket.",
          "The player has jumped, allowing for a steep downward smash trajectory, which makes the shot harder to return.",
        ],
      ),
      frame(
        "sidesmashview.png",
        "Smash Execution",
        &[
          "The player is now in the process of striking the shuttle.",
          "His body is fully rotated, and his hitting arm is in motion, about to make contact with the shuttle.",
          "His core and legs are engaged to generate maximum power.",
          "The full-body rotation increases power and speed.",
          "The player's feet are still off the ground, meaning the smash will have a steep angle, making it harder for the opponent to defend.",
          "His non-racket arm is tucked in, maintaining balance and preventing excess movement.",
        ],
      ),
      frame(
        "smashexecution.png",
        "Follow-Through and Power Transfer",
        &[
          "The player has completed his swing, and the racket is moving forward with a strong wrist snap.",
          "His eyes are still on the shuttle, ensuring control and accuracy.",
          "His body is slightly leaning forward, indicating good weight transfer.",
          "The wrist snap adds extra speed to the smash, increasing its effectiveness.",
          "The forward body movement ensures momentum is transferred into the shot.",
          "The positioning of his arm and body suggests that he is ready to recover quickly after the shot.",
        ],
      ),
    ])
  }

  /// Loads exemplars from a JSON array; relative image paths resolve against the file's directory.
  pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
    let data = std::fs::read_to_string(path)
      .with_context(|| format!("reading corpus file {}", path.display()))?;
    let entries: Vec<ExemplarEntry> = serde_json::from_str(&data)
      .with_context(|| format!("parsing corpus file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut exemplars = Vec::with_capacity(entries.len());
    for entry in entries {
      let image = match entry.image {
        ImageEntry::Path { path } if path.is_relative() => ImageSource::Path(base.join(path)),
        ImageEntry::Path { path } => ImageSource::Path(path),
        ImageEntry::Url { url } => ImageSource::Url(url),
        ImageEntry::Base64 { base64, mime } => {
          let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64.trim())
            .with_context(|| format!("exemplar {} has invalid base64 image", entry.identifier))?;
          check_declared_mime(&entry.identifier, mime.as_deref(), &bytes)?;
          ImageSource::Bytes(bytes)
        }
      };
      exemplars.push(ReferenceExemplar {
        identifier: entry.identifier,
        title: entry.title,
        description: entry.description,
        image,
      });
    }
    Ok(Self::new(exemplars))
  }
}

fn check_declared_mime(identifier: &str, declared: Option<&str>, bytes: &[u8]) -> anyhow::Result<()> {
  let sniffed = ImageMime::sniff(bytes)
    .ok_or_else(|| anyhow::anyhow!("exemplar {identifier} image is not a known image format"))?;
  if let Some(declared) = declared {
    let declared_mime = ImageMime::parse(declared)
      .ok_or_else(|| anyhow::anyhow!("exemplar {identifier} declares unsupported mime {declared}"))?;
    anyhow::ensure!(
      declared_mime == sniffed,
      "exemplar {identifier} declares {declared} but the bytes are {}",
      sniffed.as_str()
    );
  }
  Ok(())
}
