//! Verita Processors
//!
//! The processor catalog and the contract every detection backend is plugged in
//! through: a result adapter (`check`/`adapt`), a Starter, and for polled
//! providers a Checker.

pub mod adapter;
pub mod catalog;
pub mod error;
pub mod http;
pub mod registry;
pub mod slot;
pub mod starter;

pub use adapter::{ResultAdapter, ScoreAdapter};
pub use catalog::{CatalogEntry, IntegrationKind, ProcessorCatalog};
pub use error::ProcessorError;
pub use http::{HttpChecker, HttpProcessorConfig, HttpStarter};
pub use registry::{
    Integration, ProcessorEntry, ProcessorRegistry, RegisteredProcessor, RegistryBuilder,
    RegistryError,
};
pub use slot::{DispatchSlot, Reservation};
pub use starter::{
    is_placeholder_request_id, new_placeholder_request_id, CheckRequest, Checker, StartOutcome,
    StartRequest, Starter,
};
