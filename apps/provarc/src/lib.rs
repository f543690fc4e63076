//! # provarc
//!
//! Library target of the provarc binary, so the CLI can be driven from tests.

pub mod cli;
