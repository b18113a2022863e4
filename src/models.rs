use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExemplarSummary {
  pub identifier: String,
  pub title: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct AnalyzeResponse {
  pub text: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ErrorResponse {
  pub error: String,
  pub code: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct VideoAccepted {
  pub accepted: bool,
  pub file_name: String,
  pub bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CredentialStatus {
  /// A default key exists, from the environment or the keyring.
  pub available: bool,
  /// The key is persisted in the OS keyring.
  pub stored: bool,
}

#[derive(Serialize, Deserialize)]
pub struct SetCredentialRequest {
  pub key: String,
}
