//! Side-effecting operations: processes, filesystem, destination store.

pub mod command;
pub mod config;
pub mod destination;
pub mod engine;
pub mod fs_tree;
pub mod marker;
pub mod process_tree;
pub mod report;
pub mod supervisor;
pub mod template;
pub mod units;
