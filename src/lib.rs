//! # specwriter
//!
//! Writes SPEC-format data files from the document stream of a run engine.
//! Each run becomes one scan block in the file; the library keeps scan
//! numbering, column layouts and event counts for the file it owns.
//!
//! ## Crate Structure
//!
//! - **`writer`**: `SpecWriter`, the entry point. Owns the output file and
//!   accepts documents through `receiver`/`write`.
//! - **`dispatch`**: Routes each typed document to its handler.
//! - **`scan`**: Scan record state machine (numbering, descriptors, counts).
//! - **`emitter`**: Formats SPEC records and guarantees one record per line.
//! - **`command`**: Rebuilds the `#S` command text from a start document.
//! - **`value`**: Normalizes argument values and renders them as literals.
//! - **`document`**: Typed start/descriptor/event/event_page/stop documents.
//! - **`diagnostic`**: Recoverable problems, collected instead of aborting.
//! - **`config`**: Figment-based configuration (TOML + `SPECWRITER_` env).
//! - **`error`**: The `SpecWriterError` enum for fatal failures.
//! - **`tracing_config`**: Subscriber setup for the CLI and embedding hosts.

pub mod command;
pub mod config;
pub mod diagnostic;
pub mod dispatch;
pub mod document;
pub mod emitter;
pub mod error;
pub mod scan;
pub mod tracing_config;
pub mod value;
pub mod writer;

pub use config::SpecWriterConfig;
pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use document::{Document, DocumentKind};
pub use error::{SpecWriterError, WriterResult};
pub use value::ArgValue;
pub use writer::SpecWriter;
