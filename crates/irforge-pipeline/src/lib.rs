//! Graph IR builder and staged rewrite pipeline for irforge.
//!
//! A conversion loads a framework model, builds the internal graph, restores
//! its edges, resolves operator attributes through the extractor registry,
//! runs the FRONT, MIDDLE and BACK rewrite stages and hands the result to an
//! emitter.

pub mod builtin;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod dump;
pub mod edges;
pub mod emitter;
pub mod errors;
pub mod events;
pub mod extensions;
pub mod extractors;
pub mod graph;
pub mod lint;
pub mod loader;
pub mod parse;
pub mod passes;
pub mod raw;
pub mod transforms;

pub use builtin::*;
pub use config::*;
pub use diagnostics::*;
pub use driver::*;
pub use dump::*;
pub use edges::*;
pub use emitter::*;
pub use errors::*;
pub use events::*;
pub use extensions::*;
pub use extractors::*;
pub use graph::*;
pub use lint::*;
pub use loader::*;
pub use parse::*;
pub use passes::*;
pub use raw::*;
pub use transforms::*;
