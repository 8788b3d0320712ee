//! CLI commands module.

mod cluster;
mod stacks;
mod util;

pub use cluster::ClusterCommand;
pub use stacks::StacksCommand;

pub(crate) use util::*;
