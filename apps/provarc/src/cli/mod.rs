//! # Provarc CLI Module
//!
//! This module implements the CLI interface for provarc.
//!
//! ## Available Commands
//!
//! - `init` - Create an empty store and repository
//! - `status` - Show record counts
//! - `export` - Write selected records and their closure to an archive
//! - `import` - Merge an archive into the store
//! - `inspect` - Show what an archive contains without importing it

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use provarc_core::{Profile, ProvarcError};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Provarc - provenance graph archives
///
/// Moves a provenance subgraph between record stores through portable
/// archives, without duplicating what the destination already holds.
#[derive(Parser, Debug)]
#[command(name = "provarc")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Profile file (TOML); defaults apply when absent
    #[arg(short = 'P', long, global = true)]
    pub profile: Option<PathBuf>,

    /// Path to the record store (overrides the profile)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Path to the payload repository (overrides the profile)
    #[arg(short = 'R', long, global = true)]
    pub repository: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Container written by `export`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// gzip-compressed tar
    #[default]
    Tar,
    /// deflate zip
    Zip,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize an empty store and repository
    Init {
        /// Wipe an existing store and repository first
        #[arg(short, long)]
        force: bool,
    },

    /// Show store status
    Status,

    /// Export records and everything they depend on
    Export {
        /// Output archive path
        #[arg(short, long)]
        output: PathBuf,

        /// Node UUID to export (repeatable)
        #[arg(long = "node", value_name = "UUID")]
        nodes: Vec<String>,

        /// Group UUID to export (repeatable)
        #[arg(long = "group", value_name = "UUID")]
        groups: Vec<String>,

        /// Computer UUID to export (repeatable)
        #[arg(long = "computer", value_name = "UUID")]
        computers: Vec<String>,

        /// Archive container
        #[arg(short = 'f', long, value_enum, default_value_t = ArchiveFormat::Tar)]
        format: ArchiveFormat,

        /// Do not follow incoming links to ancestors
        #[arg(long)]
        no_parents: bool,

        /// Do not add the outputs of selected calculations
        #[arg(long)]
        no_calc_outputs: bool,

        /// Only allow these licenses (repeatable)
        #[arg(long = "allowed-license", value_name = "LICENSE")]
        allowed_licenses: Vec<String>,

        /// Refuse these licenses (repeatable)
        #[arg(long = "forbidden-license", value_name = "LICENSE")]
        forbidden_licenses: Vec<String>,

        /// Replace an existing output file
        #[arg(long)]
        overwrite: bool,
    },

    /// Import an archive (folder, tar, zip or CIF)
    Import {
        /// Input archive path
        #[arg(short, long)]
        input: PathBuf,

        /// Skip links and memberships that name unknown nodes
        #[arg(long)]
        ignore_unknown_nodes: bool,
    },

    /// Show the metadata and record counts of an archive
    Inspect {
        /// Input archive path
        #[arg(short, long)]
        input: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Profile named by `--profile`, with `--database`/`--repository` applied.
pub fn resolve_profile(cli: &Cli) -> Result<Profile, ProvarcError> {
    let mut profile = match &cli.profile {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    };
    if let Some(database) = &cli.database {
        profile.database = database.clone();
    }
    if let Some(repository) = &cli.repository {
        profile.repository = repository.clone();
    }
    profile.validate()?;
    Ok(profile)
}

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), ProvarcError> {
    let profile = resolve_profile(&cli)?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&profile, force, json_mode),
        Some(Commands::Status) | None => cmd_status(&profile, json_mode),
        Some(Commands::Export {
            output,
            nodes,
            groups,
            computers,
            format,
            no_parents,
            no_calc_outputs,
            allowed_licenses,
            forbidden_licenses,
            overwrite,
        }) => {
            let request = ExportRequest {
                nodes,
                groups,
                computers,
                format,
                also_parents: !no_parents,
                also_calc_outputs: !no_calc_outputs,
                allowed_licenses,
                forbidden_licenses,
                overwrite,
            };
            cmd_export(&profile, &output, request, json_mode)
        }
        Some(Commands::Import {
            input,
            ignore_unknown_nodes,
        }) => cmd_import(&profile, &input, ignore_unknown_nodes, json_mode),
        Some(Commands::Inspect { input }) => cmd_inspect(&profile, &input, json_mode),
    }
}
