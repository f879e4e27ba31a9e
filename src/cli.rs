use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    #[command(subcommand)]
    pub(crate) command: FormaCommand,
    /// Installation prefix (kegs go to `<prefix>/Cellar`, links to `<prefix>/bin`). Overrides `FORMA_PREFIX`
    #[clap(long, global = true)]
    pub(crate) prefix: Option<PathBuf>,
    /// Directory to load formulas from. Can be repeated
    #[clap(long = "formula-dir", global = true)]
    pub(crate) formula_dirs: Vec<PathBuf>,
    /// Download cache directory
    #[clap(long, global = true)]
    pub(crate) cache_dir: Option<PathBuf>,
    /// Enable debug logging
    #[clap(long, global = true)]
    pub(crate) debug: bool,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum FormaCommand {
    /// Resolves dependencies, fetches and verifies the source, builds, installs and tests a formula
    Install {
        name: String,
        /// Reinstall even if the same version is already installed
        #[clap(long)]
        force: bool,
        /// Do not run the formula's test recipe
        #[clap(long)]
        skip_test: bool,
    },
    /// Removes an installed formula and its links
    Uninstall {
        name: String,
    },
    /// Runs the test recipe against the installed formula
    Test {
        name: String,
    },
    /// Downloads and verifies the source archive without building it
    Fetch {
        name: String,
    },
    /// Shows a formula's metadata and install status
    Info {
        name: String,
    },
    /// Lists installed formulas
    List {
        /// List every formula in the index instead
        #[clap(short, long)]
        all: bool,
    },
    /// Validates formula descriptors without running anything. Defaults to all
    Audit {
        name: Option<String>,
    },
    /// Removes cached downloads
    Cleanup {
        /// Only remove downloads of this formula
        name: Option<String>,
    },
}
