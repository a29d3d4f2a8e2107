//! Command-line argument types for brokerload
//!
//! One subcommand per workflow: `run` drives a load test from a YAML run
//! descriptor, `validate` only checks one, and `init` writes a template.

use crate::templates::Template;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the load tool
#[derive(Parser, Debug)]
#[command(name = "brokerload")]
#[command(about = "Pub/sub broker load generation and measurement tool")]
pub struct Args {
    /// Quiet mode: only errors are logged; the final summary is still printed
    #[arg(short, long, global = true, default_value = "false")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run a load test described by a YAML config
    Run {
        /// Path to the run descriptor
        #[arg(short, long)]
        config: PathBuf,

        /// Override execution.duration (e.g. "30s", "1m30s")
        #[arg(short, long)]
        duration: Option<String>,
    },
    /// Check a config without running it
    Validate {
        /// Path to the run descriptor
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Write a config template
    Init {
        /// Template to write
        #[arg(short, long, value_enum, default_value_t = Template::Simple)]
        template: Template,

        /// Destination path (default: configs/<template>_test.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Command {
    /// Where `init` writes its template
    pub fn init_output(template: Template, output: Option<PathBuf>) -> PathBuf {
        output.unwrap_or_else(|| PathBuf::from("configs").join(template.default_file_name()))
    }
}
