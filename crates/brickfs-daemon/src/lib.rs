#![warn(missing_docs)]

//! BrickFS daemon: configuration, brick-tree construction, and the CLI frontend
//!
//! A configuration file describes a tree of bricks. The daemon validates it,
//! builds the tree bottom-up, and drives operations against the root brick
//! from the `brickfs` command line.

pub mod cli;
pub mod config;
pub mod tree;

pub use config::{BrickConfig, ConfigError, DaemonConfig, LogConfig, LogFormat};
pub use tree::{BrickTree, BuildError};
