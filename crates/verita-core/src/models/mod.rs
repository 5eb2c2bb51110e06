//! Domain models

pub mod analysis;
pub mod cache;
pub mod job;
pub mod media;
pub mod model_result;
pub mod processor;
pub mod throttle;

pub use analysis::{error_payload, AnalysisKey, AnalysisResult, Attribution, RequestState};
pub use cache::CachedResults;
pub use job::Priority;
pub use media::{Media, MediaTrack, MediaType};
pub use model_result::{FaceBox, ModelExtras, ModelResult, Rank, RankThresholds};
pub use processor::{Availability, ModelSpec, ProcessorSpec, DEFAULT_PROCESSOR_TIMEOUT_MS};
pub use throttle::{Caller, RateLimitRule, UserCategory};
