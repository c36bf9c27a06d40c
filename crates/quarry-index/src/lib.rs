//! Code indexing and semantic query pipeline.
//!
//! A repository's source tree is collected from the code host, split into
//! self-contained chunks, embedded, and stored per repository. Questions are
//! embedded, matched against the committed chunk set, and answered by the
//! generative model grounded in the retrieved code.

pub mod chunker;
pub mod collector;
pub mod embedder;
pub mod error;
pub mod host;
pub mod indexer;
pub mod languages;
pub mod query;

pub use error::{IndexError, Result};
