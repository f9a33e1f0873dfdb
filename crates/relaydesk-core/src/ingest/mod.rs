//! Credential ingestion: parsing, endpoint resolution and bulk import.

mod importer;
pub mod parser;
pub mod resolver;
pub mod source;

pub use importer::{BatchImporter, ImportBatchResult, ImportError, ImportOutcome, ImportStage};
pub use parser::{FormatError, Grammar, ProvisionalCredential, parse_line};
pub use resolver::{ProviderResolver, Resolution, ResolutionAmbiguity, ResolveError};
pub use source::FormatHint;
