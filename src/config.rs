use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::prompt::{DEFAULT_INTRO, DEFAULT_LEAD_IN};

pub const CREDENTIAL_ENV: &str = "OPENAI_API_KEY";
pub const DATA_DIR_ENV: &str = "SMASHCOACH_DATA_DIR";
const KEYRING_SERVICE: &str = "SmashCoach";
const KEYRING_USER: &str = "inference";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
  pub base_url: String,
  pub model: String,
  pub timeout_secs: u64,
  pub credential_prefix: String,
  pub intro_text: String,
  pub submission_lead_in: String,
  pub listen_addr: String,
  pub max_upload_bytes: usize,
  pub exemplar_image_dir: PathBuf,
  pub corpus_path: Option<PathBuf>,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.ai.it.cornell.edu".to_string(),
      model: "anthropic.claude-3.5-sonnet.v2".to_string(),
      timeout_secs: 60,
      credential_prefix: "sk-".to_string(),
      intro_text: DEFAULT_INTRO.to_string(),
      submission_lead_in: DEFAULT_LEAD_IN.to_string(),
      listen_addr: "127.0.0.1:8501".to_string(),
      max_upload_bytes: 20 * 1024 * 1024,
      exemplar_image_dir: PathBuf::from("assets"),
      corpus_path: None,
    }
  }
}

impl AppConfig {
  pub fn endpoint(&self) -> String {
    format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
  }
}

pub fn data_dir() -> PathBuf {
  std::env::var_os(DATA_DIR_ENV)
    .filter(|v| !v.is_empty())
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from(".smashcoach"))
}

pub fn load_or_init(path: &Path) -> anyhow::Result<AppConfig> {
  if path.exists() {
    let data = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&data)?;
    Ok(config)
  } else {
    let config = AppConfig::default();
    save_config(path, &config)?;
    Ok(config)
  }
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(config)?;
  std::fs::write(path, json)?;
  Ok(())
}

/// Environment first, then the OS keyring.
pub fn resolve_default_credential() -> Option<String> {
  pick_credential(std::env::var(CREDENTIAL_ENV).ok(), stored_credential)
}

fn pick_credential(env: Option<String>, stored: impl FnOnce() -> Option<String>) -> Option<String> {
  env
    .map(|k| k.trim().to_string())
    .filter(|k| !k.is_empty())
    .or_else(|| stored().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()))
}

fn stored_credential() -> Option<String> {
  keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
    .and_then(|e| e.get_password())
    .ok()
}

pub fn store_credential(key: &str) -> anyhow::Result<()> {
  let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)?;
  entry.set_password(key.trim())?;
  Ok(())
}

pub fn has_stored_credential() -> bool {
  stored_credential().map(|p| !p.trim().is_empty()).unwrap_or(false)
}
