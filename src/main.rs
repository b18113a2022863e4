use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::RwLock;

use smashcoach::config::{self, load_or_init};
use smashcoach::corpus::ReferenceCorpus;
use smashcoach::encoder::ImageSource;
use smashcoach::inference::HttpInferenceClient;
use smashcoach::logger::Logger;
use smashcoach::orchestrator::{Orchestrator, PipelineSettings};
use smashcoach::prompt::PromptBuilder;
use smashcoach::router::{run_router, RouterState};

fn load_corpus(config: &config::AppConfig, logger: &Logger) -> anyhow::Result<ReferenceCorpus> {
  let corpus = match &config.corpus_path {
    Some(path) => ReferenceCorpus::from_json_file(path)?,
    None => ReferenceCorpus::badminton_smash(&config.exemplar_image_dir),
  };

  if corpus.is_empty() {
    logger.warn("reference corpus is empty; prompts will carry no exemplars");
  }
  for exemplar in corpus.list_exemplars() {
    if let ImageSource::Path(path) = &exemplar.image {
      if !path.is_file() {
        logger.warn(&format!(
          "exemplar {} image missing at {}; requests will fail until it exists",
          exemplar.identifier,
          path.display()
        ));
      }
    }
  }
  Ok(corpus)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let data_dir = config::data_dir();
  std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
  let staging_dir = data_dir.join("staging");
  std::fs::create_dir_all(&staging_dir)?;

  let config_path = data_dir.join("config.json");
  let log_path = data_dir.join("smashcoach.log");

  let config = load_or_init(&config_path)?;
  let logger = Arc::new(Logger::new(&log_path)?);
  logger.info("SmashCoach starting up");

  let corpus = load_corpus(&config, &logger)?;
  let client = HttpInferenceClient::new(Duration::from_secs(config.timeout_secs))?;
  let orchestrator = Orchestrator::new(
    corpus,
    PromptBuilder::new(config.intro_text.clone(), config.submission_lead_in.clone()),
    client,
    PipelineSettings::from_config(&config, staging_dir),
    logger.clone(),
  );

  let default_credential = config::resolve_default_credential();
  if default_credential.is_none() {
    logger.warn(&format!(
      "no default API key; set {} or store one via /v1/credential",
      config::CREDENTIAL_ENV
    ));
  }

  let listener = std::net::TcpListener::bind(&config.listen_addr)
    .with_context(|| format!("binding {}", config.listen_addr))?;
  let addr = listener.local_addr()?;
  logger.info(&format!("listening on http://{addr}, model {}", config.model));
  println!("SmashCoach listening on http://{addr}");

  let state = RouterState {
    started_at: Instant::now(),
    orchestrator,
    default_credential: RwLock::new(default_credential),
    keyring_stored: RwLock::new(config::has_stored_credential()),
    logger: logger.clone(),
    max_upload_bytes: config.max_upload_bytes,
  };

  if let Err(err) = run_router(listener, state).await {
    logger.error(&format!("router error: {err}"));
    return Err(err);
  }
  Ok(())
}
