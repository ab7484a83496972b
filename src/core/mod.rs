pub mod batch;
pub mod build;
pub mod cancel;
pub mod collection;
pub mod error;
pub mod event;
pub mod file;
pub mod formatter;
pub mod orchestrator;
pub mod process;
pub mod scratch;

pub use batch::{BatchDriver, BatchEntry, BatchOptions, BatchReport, FileOutcome};
pub use build::{BuildConfig, BuildPolicy, BuildReport};
pub use cancel::CancelToken;
pub use collection::{Collection, StageOutcome};
pub use error::{AppError, BuildError, ConfigError, CopyError, ParseError};
pub use event::{BatchEvent, CollectionEvent};
pub use file::{FileId, StagedFile};
pub use orchestrator::{
    OrchestratorConfig, ParseOrchestrator, ParseOutput, ParseResult, SheetParser,
};
pub use scratch::ScratchDir;
