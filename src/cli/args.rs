// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cleany")]
#[command(author, version, about = "Select and clean up Kubernetes resources with declarative policies")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Kubernetes context to use (defaults to the current kubeconfig context,
    /// or the in-cluster service account)
    #[arg(short, long, value_name = "CONTEXT", global = true)]
    pub context: Option<String>,

    /// Path to the config file (defaults to ~/.cleany/config.json)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile every Cleaner in the cluster until interrupted
    Run {
        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Per-task timeout in seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Seconds between two reads of the Cleaner objects
        #[arg(short, long, value_name = "SECS")]
        resync: Option<u64>,
    },

    /// Run the policy of one Cleaner manifest once and print the matches
    Scan {
        /// Cleaner manifest (YAML or JSON)
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,

        /// Omit column headers in output
        #[arg(long)]
        no_headers: bool,

        /// Timeout in seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
    Yaml,
}
