//! # Scripture Canon Core
//!
//! Shared, I/O-free logic for scripture-canon: data models, the text
//! normalizer, the author registry, the verse merger, precedence ordering
//! and ID assignment, and the embedding clusterer.
//!
//! This crate contains no tokio, filesystem, or network dependencies.
//! Everything here is a deterministic function of its inputs, which is
//! what lets the application promise byte-identical output across runs.
//!
//! ## Data Flow
//!
//! ```text
//! RawRecord ──adapter──▶ VerseUnit ──merge──▶ MasterVerseRecord
//!                  └───▶ QaDraft ──ids──▶ QaRecord ──cluster──▶ ClusterRecord
//!                                     AuthorRegistry ◀── merge
//! ```

pub mod cluster;
pub mod embedding;
pub mod error;
pub mod ids;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod registry;

pub use error::{CanonError, Rejection, RejectionKind, RejectionReport};
pub use registry::AuthorRegistry;
