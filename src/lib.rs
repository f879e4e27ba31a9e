//! # Forma Core Library
//!
//! This crate contains the core logic of the `forma` tool – an interpreter for
//! package formulas. A formula is a small TOML descriptor saying where a tool's
//! source lives, which SHA-256 it must have, what it depends on, how to build
//! and install it, and how to smoke-test the result.
//!
//! Every install runs the same pipeline: resolve dependencies, fetch and
//! verify the source, run the install recipe, run the test recipe. A digest
//! mismatch stops the run before any recipe step executes.
//!
//! ## Modules Overview
//! - [`formula`] – The descriptor model, parsing and validation
//! - [`registry`] – The formula index, unique by name
//! - [`installer`] – The interpreter and its install state machine
//! - [`recipe`] – Running install and test steps
//! - [`fetch`] – Downloading, verifying and unpacking source archives
//! - [`receipt`] – Install receipts that register a keg as installed
//! - [`link`] – Links from the prefix `bin` directory into kegs
//! - [`config`] – Configuration file and directory layout
//! - [`error`] – The error type shared by all of the above
//! - [`util`] – Hashing, version and `PATH` helpers
//! - [`global`] – Global directories and the download cache


pub mod config;
pub mod error;
pub mod fetch;
pub mod formula;
pub mod global;
pub mod installer;
pub mod link;
pub mod receipt;
pub mod recipe;
pub mod registry;
pub mod util;

pub use config::*;
pub use error::*;
pub use formula::*;
pub use installer::*;
pub use receipt::*;
pub use registry::*;
pub use global::cache::*;
