//! Dockerfile analysis: parsing, build argument resolution, and the stage
//! graph that classifies every referenced image.

pub mod args;
pub mod graph;
pub mod parser;
pub mod reference;

pub use args::ArgTable;
pub use graph::{OverlapPolicy, StageGraph};
pub use parser::parse;
pub use reference::ImageReference;
