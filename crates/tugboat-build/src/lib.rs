//! tugboat の Docker イメージビルド機能
//!
//! ビルドコンテキストの組み立て（Dockerfile 本文・URL・アーカイブ・
//! リポジトリスナップショット）、Docker Engine API への build / push / delete、
//! ストリーミングレスポンスの集約を提供します。

pub mod auth;
pub mod builder;
pub mod context;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod pusher;
pub mod request;
pub mod snapshot;
pub mod stream;

pub use auth::{RegistryCredentials, encode_auth_header, registry_server_address};
pub use builder::ImageBuilder;
pub use context::{CanonicalArchive, ContextBuilder};
pub use engine::{EngineAddress, EngineConnection};
pub use error::{BuildError, BuildResult, Step};
pub use pipeline::{
    BuildPipeline, CleanupPolicy, PipelineOptions, RunReport, RunState, StepOutcome,
};
pub use progress::BuildProgress;
pub use pusher::ImagePusher;
pub use request::{BuildParams, BuildRequest, ContextSource, RepositoryRef};
pub use stream::{AggregatedOutcome, ProgressRecord, StreamAggregator};
