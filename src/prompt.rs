use crate::encoder::ImageReference;
use crate::error::PipelineError;

pub const DEFAULT_INTRO: &str = "You are an expert badminton coach. Below are reference images of correct smash \
technique, each followed by a description of what the player is doing well. Compare the user's submission \
against them and give specific, actionable feedback.";

pub const DEFAULT_LEAD_IN: &str = "Here is the user's submission for analysis.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  System,
  User,
}

impl Role {
  pub fn as_str(self) -> &'static str {
    match self {
      Role::System => "system",
      Role::User => "user",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
  Text(String),
  Image(ImageReference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
  pub role: Role,
  pub content: MessageContent,
}

impl PromptMessage {
  pub fn text(role: Role, text: impl Into<String>) -> Self {
    Self {
      role,
      content: MessageContent::Text(text.into()),
    }
  }

  pub fn image(role: Role, image: ImageReference) -> Self {
    Self {
      role,
      content: MessageContent::Image(image),
    }
  }
}

/// A corpus exemplar whose image has already been through the encoder.
#[derive(Debug, Clone)]
pub struct EncodedExemplar {
  pub title: String,
  pub description: String,
  pub image: ImageReference,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
  intro: String,
  lead_in: String,
}

impl Default for PromptBuilder {
  fn default() -> Self {
    Self::new(DEFAULT_INTRO, DEFAULT_LEAD_IN)
  }
}

impl PromptBuilder {
  pub fn new(intro: impl Into<String>, lead_in: impl Into<String>) -> Self {
    Self {
      intro: intro.into(),
      lead_in: lead_in.into(),
    }
  }

  /// Intro first, then an image + caption pair per exemplar, then the submission.
  pub fn build(
    &self,
    exemplars: &[EncodedExemplar],
    query: Option<&str>,
    image: Option<&ImageReference>,
  ) -> Result<Vec<PromptMessage>, PipelineError> {
    let query = query.map(str::trim).filter(|q| !q.is_empty());
    if query.is_none() && image.is_none() {
      return Err(PipelineError::Validation(
        "submission has neither a question nor an image".to_string(),
      ));
    }

    let mut messages = Vec::with_capacity(3 + exemplars.len() * 2);
    messages.push(PromptMessage::text(Role::System, self.intro.clone()));

    for exemplar in exemplars {
      messages.push(PromptMessage::image(Role::System, exemplar.image.clone()));
      messages.push(PromptMessage::text(
        Role::System,
        format!("{}: {}", exemplar.title, exemplar.description),
      ));
    }

    let submission = match query {
      Some(q) => format!("{}\n\n{}", self.lead_in, q),
      None => self.lead_in.clone(),
    };
    messages.push(PromptMessage::text(Role::User, submission));

    if let Some(image) = image {
      messages.push(PromptMessage::image(Role::User, image.clone()));
    }

    Ok(messages)
  }
}
