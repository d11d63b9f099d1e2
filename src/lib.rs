//! Client-resident, multi-provider BYOK LLM access library.
//!
//! An [`Orchestrator`], built via [`OrchestratorBuilder`], holds
//! credentials in a [`keystore::KeyStore`], routes chat/embedding calls
//! through a shared pipeline (sanitize → validate → cache → dedup →
//! rate-limit → circuit-break → retry → middleware) to one of several
//! [`providers::ProviderAdapter`] implementations, and publishes lifecycle
//! events on an [`event_bus::EventBus`] along the way.

pub mod builder;
pub mod cache;
pub mod chat;
pub mod circuit;
pub mod dedup;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod keystore;
pub mod ledger;
pub mod middleware;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod transport;
pub mod validation;

pub use builder::OrchestratorBuilder;
pub use chat::{ChatRequest, ChatResponse, ChatStreamDelta, EmbeddingRequest, EmbeddingResponse};
pub use error::{ErrorKind, LlmError};
pub use orchestrator::{BatchOptions, BatchOutcome, Orchestrator};
