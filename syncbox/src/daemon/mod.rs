//! Process-level concerns of the command line tool.

pub mod shutdown;
