//! Command-line interface for sonalog.
//!
//! This module provides the CLI structure and command handlers for the
//! `sonalog` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    BucketArg, CategoryArg, ClearCommand, ConfigCommand, ContactsCommand, ExportCommand,
    FamilyCommand, ImportCommand, ItemsCommand, LocateCommand, ShareLocationCommand, StatusArg,
    StatusCommand,
};

/// sonalog - Disaster preparedness at the command line
///
/// Keeps an emergency supply inventory with expiry warnings, a list of
/// emergency contacts, and shares your location and safety status with your
/// family through a six-character family code.
#[derive(Debug, Parser)]
#[command(name = "sonalog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the supply inventory
    #[command(subcommand)]
    Items(ItemsCommand),

    /// Manage emergency contacts
    #[command(subcommand)]
    Contacts(ContactsCommand),

    /// Acquire the current location
    Locate(LocateCommand),

    /// Show a preparedness overview
    Status(StatusCommand),

    /// Share location with family members
    #[command(subcommand)]
    Family(FamilyCommand),

    /// Export inventory and contacts
    Export(ExportCommand),

    /// Import an export file, replacing what it contains
    Import(ImportCommand),

    /// Print a one-off location payload for a QR code
    ShareLocation(ShareLocationCommand),

    /// Show storage statistics
    Stats,

    /// Delete stored data
    Clear(ClearCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.verbose, self.quiet)
    }
}
