//! # CLI Bridge
//!
//! Streams the output of an interactive command-line AI assistant to a chat
//! UI as validated, speaker-attributed messages.
//!
//! ```text
//! CLI stdout --> framer --> normalizer (under a per-session circuit breaker)
//!            --> ResponseEnvelope stream --> consumer
//! ```
//!
//! The [`Orchestrator`] manages sessions; each session owns one CLI process,
//! one pipeline task and one circuit breaker. A global breaker guards
//! process launches.

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod framer;
pub mod message;
pub mod normalizer;
pub mod orchestrator;
pub mod pipeline;
pub mod process;

pub use config::BridgeConfig;
pub use envelope::{EnvelopeMetadata, ResponseEnvelope, StructuredError};
pub use error::{BridgeError, Result};
pub use events::BridgeEvent;
pub use framer::{ChunkKind, FramingError, LineFramer, LogicalChunk};
pub use message::{MessageBody, MessageKind, SystemLevel, ValidatedMessage, ValidationError};
pub use normalizer::{NormalizerConfig, OrphanPolicy, RecordNormalizer};
pub use orchestrator::{HealthReport, Orchestrator, RecoveryOutcome, SessionHealth};
pub use pipeline::{spawn_pipeline, PipelineContext, PipelineHandle, PipelineSettings, ResponseStream, StreamItem};
pub use process::{ChildControl, CommandLauncher, LaunchSpec, Launcher, ProcessExit, ProcessHandle, StdinWriter};
