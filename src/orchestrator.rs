use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::corpus::ReferenceCorpus;
use crate::encoder::{self, ImageMime, ImageSource};
use crate::error::{InferenceResult, PipelineError};
use crate::inference::{Credential, InferenceClient, InferenceRequest};
use crate::logger::Logger;
use crate::prompt::{EncodedExemplar, PromptBuilder};

/// The user's image as it arrives from the upload boundary.
#[derive(Debug, Clone)]
pub enum UserImage {
  Upload { bytes: Vec<u8>, file_name: Option<String> },
  Url(String),
  Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
  Validating,
  Encoding,
  Building,
  Calling,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Validating => "validating",
      Stage::Encoding => "encoding",
      Stage::Building => "building",
      Stage::Calling => "calling",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
  pub model: String,
  pub endpoint: String,
  pub credential_prefix: String,
  pub staging_dir: PathBuf,
}

impl PipelineSettings {
  pub fn from_config(config: &AppConfig, staging_dir: PathBuf) -> Self {
    Self {
      model: config.model.clone(),
      endpoint: config.endpoint(),
      credential_prefix: config.credential_prefix.clone(),
      staging_dir,
    }
  }
}

/// Uploaded bytes copied to a uniquely named file for the lifetime of one request.
/// Dropping it removes the file, including when the request future is cancelled.
struct StagedImage {
  file: NamedTempFile,
}

impl StagedImage {
  fn write(dir: &Path, bytes: &[u8], mime: ImageMime) -> Result<Self, PipelineError> {
    let suffix = format!(".{}", mime.extension());

    let io_err = |source: std::io::Error| PipelineError::Io {
      path: dir.to_path_buf(),
      source,
    };
    let mut file = tempfile::Builder::new()
      .prefix("upload-")
      .suffix(&suffix)
      .tempfile_in(dir)
      .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(Self { file })
  }

  fn path(&self) -> &Path {
    self.file.path()
  }
}

pub struct Orchestrator<C> {
  corpus: ReferenceCorpus,
  builder: PromptBuilder,
  client: C,
  settings: PipelineSettings,
  logger: Arc<Logger>,
}

impl<C: InferenceClient> Orchestrator<C> {
  pub fn new(
    corpus: ReferenceCorpus,
    builder: PromptBuilder,
    client: C,
    settings: PipelineSettings,
    logger: Arc<Logger>,
  ) -> Self {
    Self {
      corpus,
      builder,
      client,
      settings,
      logger,
    }
  }

  pub fn corpus(&self) -> &ReferenceCorpus {
    &self.corpus
  }

  /// Runs one analysis end to end. Never panics on bad input; every failure is in the result.
  pub async fn handle_request(&self, credential: &str, query: &str, image: Option<UserImage>) -> InferenceResult {
    let request_id = Uuid::new_v4();
    let result = self.run(request_id, credential, query, image).await;
    match &result {
      Ok(answer) => self.logger.info(&format!(
        "request {request_id} done: success ({} chars)",
        answer.text.chars().count()
      )),
      Err(err) => self.logger.warn(&format!("request {request_id} done: {} ({err})", err.code())),
    }
    result
  }

  async fn run(&self, id: Uuid, credential: &str, query: &str, image: Option<UserImage>) -> InferenceResult {
    self.enter(id, Stage::Validating);
    let credential = self.validate_credential(credential)?;
    let query = Some(query.trim()).filter(|q| !q.is_empty());
    if query.is_none() && image.is_none() {
      return Err(PipelineError::MissingInput);
    }

    self.enter(id, Stage::Encoding);
    let mut staged = None;
    let source = match image {
      None => None,
      Some(UserImage::Url(url)) => Some(ImageSource::Url(url)),
      Some(UserImage::Path(path)) => Some(ImageSource::Path(path)),
      Some(UserImage::Upload { bytes, file_name }) => {
        let mime = ImageMime::sniff(&bytes).ok_or_else(|| {
          PipelineError::UnsupportedMedia(format!(
            "upload {} is not a jpg, png, gif or webp image",
            file_name.as_deref().unwrap_or("<unnamed>")
          ))
        })?;
        let file = StagedImage::write(&self.settings.staging_dir, &bytes, mime)?;
        let path = file.path().to_path_buf();
        staged = Some(file);
        Some(ImageSource::Path(path))
      }
    };
    let corpus = self.corpus.clone();
    let (user_image, exemplars) = tokio::task::spawn_blocking(move || {
      let user_image = source.as_ref().map(encoder::encode).transpose()?;
      Ok::<_, PipelineError>((user_image, encode_exemplars(&corpus)?))
    })
    .await
    .map_err(|err| PipelineError::Io {
      path: self.settings.staging_dir.clone(),
      source: std::io::Error::other(err),
    })??;

    self.enter(id, Stage::Building);
    let messages = self.builder.build(&exemplars, query, user_image.as_ref())?;

    self.enter(id, Stage::Calling);
    let request = InferenceRequest {
      model: self.settings.model.clone(),
      endpoint: self.settings.endpoint.clone(),
      messages,
      credential,
    };
    let result = self.client.infer(&request).await;
    drop(staged);
    result
  }

  fn enter(&self, id: Uuid, stage: Stage) {
    self.logger.info(&format!("request {id} {stage}"));
  }

  fn validate_credential(&self, credential: &str) -> Result<Credential, PipelineError> {
    let key = credential.trim();
    let prefix = self.settings.credential_prefix.as_str();
    if key.is_empty() || !key.starts_with(prefix) || key.len() == prefix.len() {
      return Err(PipelineError::MissingCredential);
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
      return Err(PipelineError::MissingCredential);
    }
    Ok(Credential::new(key))
  }
}

fn encode_exemplars(corpus: &ReferenceCorpus) -> Result<Vec<EncodedExemplar>, PipelineError> {
  corpus
    .list_exemplars()
    .iter()
    .map(|exemplar| {
      Ok(EncodedExemplar {
        title: exemplar.title.clone(),
        description: exemplar.description.clone(),
        image: encoder::encode(&exemplar.image)?,
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  use async_trait::async_trait;

  use super::*;
  use crate::corpus::ReferenceExemplar;
  use crate::encoder::ImageReference;
  use crate::inference::tests::{answering, spawn_stub};
  use crate::inference::{Answer, HttpInferenceClient};
  use crate::prompt::{MessageContent, PromptMessage, Role};

  const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDRpixels";

  enum Reply {
    Text(&'static str),
    Fail,
    Hang,
  }

  struct StubClient {
    calls: AtomicUsize,
    reply: Reply,
    seen: Mutex<Vec<InferenceRequest>>,
    staged_during_call: Mutex<Option<usize>>,
    watch_dir: Option<PathBuf>,
  }

  impl StubClient {
    fn new(reply: Reply) -> Self {
      Self {
        calls: AtomicUsize::new(0),
        reply,
        seen: Mutex::new(Vec::new()),
        staged_during_call: Mutex::new(None),
        watch_dir: None,
      }
    }

    fn watching(mut self, dir: &Path) -> Self {
      self.watch_dir = Some(dir.to_path_buf());
      self
    }
  }

  #[async_trait]
  impl InferenceClient for StubClient {
    async fn infer(&self, request: &InferenceRequest) -> InferenceResult {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.seen.lock().unwrap().push(request.clone());
      if let Some(dir) = &self.watch_dir {
        *self.staged_during_call.lock().unwrap() = Some(count_files(dir));
      }
      match self.reply {
        Reply::Text(text) => Ok(Answer { text: text.to_string() }),
        Reply::Fail => Err(PipelineError::Remote {
          status: 500,
          excerpt: "stub failure".to_string(),
        }),
        Reply::Hang => {
          tokio::time::sleep(Duration::from_secs(60)).await;
          Err(PipelineError::Timeout(Duration::from_secs(60)))
        }
      }
    }
  }

  fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
  }

  fn url_corpus(n: usize) -> ReferenceCorpus {
    ReferenceCorpus::new(
      (0..n)
        .map(|i| ReferenceExemplar {
          identifier: format!("frame{i}.png"),
          title: format!("Frame {i}"),
          description: format!("Detail {i}"),
          image: ImageSource::Url(format!("https://example.com/frame{i}.png")),
        })
        .collect(),
    )
  }

  fn settings(staging_dir: &Path, endpoint: &str) -> PipelineSettings {
    PipelineSettings {
      model: "anthropic.claude-3.5-sonnet.v2".to_string(),
      endpoint: endpoint.to_string(),
      credential_prefix: "sk-".to_string(),
      staging_dir: staging_dir.to_path_buf(),
    }
  }

  fn orchestrator<C: InferenceClient>(
    client: C,
    corpus: ReferenceCorpus,
    staging_dir: &Path,
    logger: Arc<Logger>,
  ) -> Orchestrator<C> {
    Orchestrator::new(
      corpus,
      PromptBuilder::new("intro", "lead"),
      client,
      settings(staging_dir, "http://unused.invalid/chat/completions"),
      logger,
    )
  }

  #[tokio::test]
  async fn answers_smash_question_through_stub_endpoint() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let endpoint = spawn_stub(answering("Keep your elbow high")).await;
    let orch = Orchestrator::new(
      url_corpus(3),
      PromptBuilder::default(),
      HttpInferenceClient::new(Duration::from_secs(5))?,
      settings(staging.path(), &endpoint),
      Arc::new(Logger::memory()),
    );

    let answer = orch
      .handle_request("sk-test", "How can I improve my smash?", None)
      .await
      .expect("stub answers");
    assert_eq!(answer, Answer { text: "Keep your elbow high".to_string() });
    Ok(())
  }

  #[tokio::test]
  async fn rejects_missing_or_malformed_credential_without_calling_client() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Text("unused")),
      url_corpus(3),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    for key in ["", "   ", "pk-live-123", "sk-", "sk-has space"] {
      let err = orch.handle_request(key, "question", None).await.unwrap_err();
      assert!(matches!(err, PipelineError::MissingCredential), "key {key:?}");
    }
    assert_eq!(orch.client.calls.load(Ordering::SeqCst), 0);
    Ok(())
  }

  #[tokio::test]
  async fn rejects_empty_submission_before_building() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let logger = Arc::new(Logger::memory());
    let orch = orchestrator(
      StubClient::new(Reply::Text("unused")),
      url_corpus(1),
      staging.path(),
      logger.clone(),
    );

    let err = orch.handle_request("sk-test", "  ", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::MissingInput));
    assert_eq!(orch.client.calls.load(Ordering::SeqCst), 0);
    assert!(logger.lines().iter().all(|l| !l.contains(" building")));
    Ok(())
  }

  #[tokio::test]
  async fn sends_exemplars_before_submission() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Text("ok")),
      url_corpus(3),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    orch
      .handle_request("sk-test", "Check my form", Some(UserImage::Url("https://example.com/me.png".to_string())))
      .await
      .expect("stub answers");

    let seen = orch.client.seen.lock().unwrap();
    let messages = &seen[0].messages;
    assert_eq!(messages.len(), 1 + 3 * 2 + 2);
    assert_eq!(messages[0], PromptMessage::text(Role::System, "intro"));
    assert_eq!(
      messages[5],
      PromptMessage::image(Role::System, ImageReference::Url("https://example.com/frame2.png".to_string()))
    );
    assert_eq!(messages[7], PromptMessage::text(Role::User, "lead\n\nCheck my form"));
    assert_eq!(
      messages[8],
      PromptMessage::image(Role::User, ImageReference::Url("https://example.com/me.png".to_string()))
    );
    assert_eq!(seen[0].endpoint, "http://unused.invalid/chat/completions");
    Ok(())
  }

  #[tokio::test]
  async fn staged_upload_is_removed_after_success() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Text("ok")).watching(staging.path()),
      url_corpus(1),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    let upload = UserImage::Upload {
      bytes: PNG.to_vec(),
      file_name: Some("smash.PNG".to_string()),
    };
    orch.handle_request("sk-test", "", Some(upload)).await.expect("stub answers");

    assert_eq!(*orch.client.staged_during_call.lock().unwrap(), Some(1));
    assert_eq!(count_files(staging.path()), 0);

    let seen = orch.client.seen.lock().unwrap();
    match seen[0].messages.last().map(|m| &m.content) {
      Some(MessageContent::Image(ImageReference::Inline { mime, .. })) => assert_eq!(*mime, ImageMime::Png),
      other => panic!("expected inline upload, got {other:?}"),
    }
    Ok(())
  }

  #[tokio::test]
  async fn staged_upload_is_removed_after_failure() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Fail).watching(staging.path()),
      url_corpus(1),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    let upload = UserImage::Upload {
      bytes: PNG.to_vec(),
      file_name: None,
    };
    let err = orch.handle_request("sk-test", "q", Some(upload)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Remote { status: 500, .. }));
    assert_eq!(*orch.client.staged_during_call.lock().unwrap(), Some(1));
    assert_eq!(count_files(staging.path()), 0);
    Ok(())
  }

  #[tokio::test]
  async fn staged_upload_is_removed_when_encoding_fails_later() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let corpus = ReferenceCorpus::new(vec![ReferenceExemplar {
      identifier: "missing.png".to_string(),
      title: "Missing".to_string(),
      description: "Not on disk".to_string(),
      image: ImageSource::Path(staging.path().join("nested/missing.png")),
    }]);
    let orch = orchestrator(
      StubClient::new(Reply::Text("unused")),
      corpus,
      staging.path(),
      Arc::new(Logger::memory()),
    );

    let upload = UserImage::Upload {
      bytes: PNG.to_vec(),
      file_name: Some("smash.png".to_string()),
    };
    let err = orch.handle_request("sk-test", "q", Some(upload)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Io { .. }));
    assert_eq!(orch.client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(count_files(staging.path()), 0);
    Ok(())
  }

  #[tokio::test]
  async fn upload_with_image_name_but_text_bytes_is_rejected() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Text("unused")),
      url_corpus(1),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    let upload = UserImage::Upload {
      bytes: b"this is a text file".to_vec(),
      file_name: Some("notes.png".to_string()),
    };
    let err = orch.handle_request("sk-test", "", Some(upload)).await.unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedMedia(_)));
    assert_eq!(orch.client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(count_files(staging.path()), 0);
    Ok(())
  }

  #[tokio::test]
  async fn staged_upload_suffix_follows_detected_format() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let staged = StagedImage::write(staging.path(), PNG, ImageMime::Png)?;
    assert_eq!(staged.path().extension().and_then(|e| e.to_str()), Some("png"));
    Ok(())
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn encodes_on_disk_exemplars_for_every_request() -> anyhow::Result<()> {
    let assets = tempfile::tempdir()?;
    let staging = tempfile::tempdir()?;
    for name in ["frontsmashview.png", "sidesmashview.png", "smashexecution.png"] {
      std::fs::write(assets.path().join(name), PNG)?;
    }
    let orch = orchestrator(
      StubClient::new(Reply::Text("ok")),
      ReferenceCorpus::badminton_smash(assets.path()),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    orch.handle_request("sk-test", "first", None).await.expect("stub answers");
    orch.handle_request("sk-test", "second", None).await.expect("stub answers");

    let seen = orch.client.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for request in seen.iter() {
      assert_eq!(request.messages.len(), 1 + 3 * 2 + 1);
      for idx in [1, 3, 5] {
        match &request.messages[idx].content {
          MessageContent::Image(ImageReference::Inline { mime, .. }) => assert_eq!(*mime, ImageMime::Png),
          other => panic!("expected inline exemplar image, got {other:?}"),
        }
      }
      assert_eq!(
        request.messages[2],
        PromptMessage::text(Role::System, format!("Jump Smash Preparation: {}", orch.corpus().list_exemplars()[0].description))
      );
    }
    Ok(())
  }

  #[tokio::test]
  async fn cancelled_request_still_removes_staged_upload() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Hang).watching(staging.path()),
      url_corpus(0),
      staging.path(),
      Arc::new(Logger::memory()),
    );

    let upload = UserImage::Upload {
      bytes: PNG.to_vec(),
      file_name: Some("smash.png".to_string()),
    };
    let outcome = tokio::time::timeout(
      Duration::from_millis(100),
      orch.handle_request("sk-test", "q", Some(upload)),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(*orch.client.staged_during_call.lock().unwrap(), Some(1));
    assert_eq!(count_files(staging.path()), 0);
    Ok(())
  }

  #[tokio::test]
  async fn concurrent_uploads_stage_distinct_files() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let first = StagedImage::write(staging.path(), PNG, ImageMime::Png)?;
    let second = StagedImage::write(staging.path(), PNG, ImageMime::Png)?;
    assert_ne!(first.path(), second.path());
    assert_eq!(count_files(staging.path()), 2);
    drop(first);
    drop(second);
    assert_eq!(count_files(staging.path()), 0);
    Ok(())
  }

  #[tokio::test]
  async fn credential_never_reaches_the_log() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let logger = Arc::new(Logger::memory());
    let ok = orchestrator(
      StubClient::new(Reply::Text("ok")),
      url_corpus(3),
      staging.path(),
      logger.clone(),
    );
    ok.handle_request("sk-test-secret-123", "q", None).await.expect("stub answers");

    let failing = orchestrator(StubClient::new(Reply::Fail), url_corpus(1), staging.path(), logger.clone());
    let _ = failing.handle_request("sk-test-secret-123", "q", None).await;

    let lines = logger.lines();
    assert!(lines.iter().any(|l| l.contains(" calling")));
    assert!(lines.iter().all(|l| !l.contains("sk-test-secret-123")));
    Ok(())
  }

  #[tokio::test]
  async fn missing_local_user_image_is_io_error() -> anyhow::Result<()> {
    let staging = tempfile::tempdir()?;
    let orch = orchestrator(
      StubClient::new(Reply::Text("unused")),
      url_corpus(0),
      staging.path(),
      Arc::new(Logger::memory()),
    );
    let err = orch
      .handle_request("sk-test", "", Some(UserImage::Path(staging.path().join("nope.jpg"))))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::IoError);
    Ok(())
  }
}
