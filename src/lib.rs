pub mod config;
pub mod corpus;
pub mod encoder;
pub mod error;
pub mod inference;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod router;
