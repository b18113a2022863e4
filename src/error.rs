use std::path::PathBuf;
use std::time::Duration;

use crate::inference::Answer;

/// Outcome of one analysis request: either the model's text or exactly one error.
pub type InferenceResult = Result<Answer, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  #[error("API key missing or malformed")]
  MissingCredential,
  #[error("nothing to analyze: provide a question or an image")]
  MissingInput,
  #[error("failed to read image {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid prompt: {0}")]
  Validation(String),
  #[error("inference endpoint did not answer within {}s", .0.as_secs())]
  Timeout(Duration),
  #[error("inference endpoint returned {status}: {excerpt}")]
  Remote { status: u16, excerpt: String },
  #[error("inference endpoint unreachable: {0}")]
  Transport(String),
  #[error("unexpected response shape: {0}")]
  MalformedResponse(String),
  #[error("unsupported media: {0}")]
  UnsupportedMedia(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  MissingCredential,
  MissingInput,
  IoError,
  ValidationError,
  Timeout,
  RemoteError,
  MalformedResponse,
  UnsupportedMedia,
}

impl ErrorKind {
  pub fn code(self) -> &'static str {
    match self {
      ErrorKind::MissingCredential => "missing_credential",
      ErrorKind::MissingInput => "missing_input",
      ErrorKind::IoError => "io_error",
      ErrorKind::ValidationError => "validation_error",
      ErrorKind::Timeout => "timeout",
      ErrorKind::RemoteError => "remote_error",
      ErrorKind::MalformedResponse => "malformed_response",
      ErrorKind::UnsupportedMedia => "unsupported_media",
    }
  }
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::MissingCredential => ErrorKind::MissingCredential,
      PipelineError::MissingInput => ErrorKind::MissingInput,
      PipelineError::Io { .. } => ErrorKind::IoError,
      PipelineError::Validation(_) => ErrorKind::ValidationError,
      PipelineError::Timeout(_) => ErrorKind::Timeout,
      PipelineError::Remote { .. } | PipelineError::Transport(_) => ErrorKind::RemoteError,
      PipelineError::MalformedResponse(_) => ErrorKind::MalformedResponse,
      PipelineError::UnsupportedMedia(_) => ErrorKind::UnsupportedMedia,
    }
  }

  pub fn code(&self) -> &'static str {
    self.kind().code()
  }
}
