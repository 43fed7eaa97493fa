//! Command-line interface module.

mod args;
pub mod join;
pub mod relay;
pub mod shutdown;
pub mod style;

pub use args::{Cli, Commands};
