//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Subcommand, ValueEnum};

use crate::family::FamilyCode;
use crate::inventory::Category;
use crate::location::MemberStatus;
use crate::storage::Bucket;

/// Supply inventory commands.
#[derive(Debug, Subcommand)]
pub enum ItemsCommand {
    /// List stocked items
    List {
        /// Only items expiring within this many days
        #[arg(short, long, value_name = "DAYS")]
        expiring: Option<i64>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Add an item
    Add {
        /// What the item is
        name: String,

        /// Kind of supply
        #[arg(long, value_enum, default_value = "food")]
        category: CategoryArg,

        /// Best-before date (YYYY-MM-DD)
        #[arg(short, long, value_name = "DATE")]
        expires: Option<NaiveDate>,

        /// How many are stocked
        #[arg(long, default_value = "1")]
        quantity: u32,

        /// Free-text notes
        #[arg(short, long, default_value = "")]
        notes: String,
    },

    /// Replace fields of an existing item
    Edit {
        /// Item id
        id: String,

        /// New name
        #[arg(long)]
        name: Option<String>,

        /// New category
        #[arg(long, value_enum)]
        category: Option<CategoryArg>,

        /// New best-before date (YYYY-MM-DD)
        #[arg(short, long, value_name = "DATE", conflicts_with = "no_expiry")]
        expires: Option<NaiveDate>,

        /// Clear the best-before date
        #[arg(long)]
        no_expiry: bool,

        /// New quantity
        #[arg(long)]
        quantity: Option<u32>,

        /// New notes
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Remove an item
    Remove {
        /// Item id
        id: String,
    },
}

/// Emergency contact commands.
#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    /// List contacts, built-in numbers first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Add a contact
    Add {
        /// Display name
        name: String,

        /// Phone number
        #[arg(short, long)]
        phone: String,

        /// Relationship or purpose
        #[arg(short, long, default_value = "")]
        relationship: String,

        /// Email address
        #[arg(short, long, default_value = "")]
        email: String,

        /// Postal address
        #[arg(short, long, default_value = "")]
        address: String,
    },

    /// Remove a contact (built-in numbers are kept)
    Remove {
        /// Contact id
        id: String,
    },
}

/// Locate command arguments.
#[derive(Debug, Args)]
pub struct LocateCommand {
    /// Ignore the stored fix and ask the provider
    #[arg(short, long)]
    pub fresh: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Expiry warning window in days
    #[arg(short, long, default_value = "30", value_name = "DAYS")]
    pub window: i64,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Family sharing commands.
#[derive(Debug, Subcommand)]
pub enum FamilyCommand {
    /// Create a new family group and print its code
    Create {
        /// Join the new group under this name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Join a family group and start sharing
    Join {
        /// Six-character family code
        code: FamilyCode,

        /// Name shown to the family
        #[arg(short, long)]
        name: String,
    },

    /// Stop sharing
    Leave,

    /// Publish the current location and status
    Publish {
        /// Status to report
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,

        /// Message shown with the status
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Send a help request to the family
    Alert {
        /// What is happening
        message: String,
    },

    /// Show the latest location of every member
    Members {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Follow member updates until interrupted
    Watch {
        /// Do not republish this device's location periodically
        #[arg(long)]
        no_auto_update: bool,
    },
}

/// Export command arguments.
#[derive(Debug, Args)]
pub struct ExportCommand {
    /// Directory to write the export file into
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub dir: PathBuf,

    /// Print compact JSON for a QR code instead of writing a file
    #[arg(long)]
    pub qr: bool,
}

/// Import command arguments.
#[derive(Debug, Args)]
pub struct ImportCommand {
    /// Export file to import
    pub file: PathBuf,
}

/// Share-location command arguments.
#[derive(Debug, Args)]
pub struct ShareLocationCommand {
    /// Name to include; defaults to the family member name
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Clear command arguments.
#[derive(Debug, Args)]
pub struct ClearCommand {
    /// Bucket to clear
    #[arg(value_enum)]
    pub bucket: BucketArg,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Supply category argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CategoryArg {
    /// Food
    Food,
    /// Drinking water
    Water,
    /// Medicine
    Medicine,
    /// Hygiene products
    Hygiene,
    /// Tools and equipment
    Tools,
    /// Clothing
    Clothing,
    /// Anything else
    Other,
}

impl From<CategoryArg> for Category {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Food => Self::Food,
            CategoryArg::Water => Self::Water,
            CategoryArg::Medicine => Self::Medicine,
            CategoryArg::Hygiene => Self::Hygiene,
            CategoryArg::Tools => Self::Tools,
            CategoryArg::Clothing => Self::Clothing,
            CategoryArg::Other => Self::Other,
        }
    }
}

/// Member status argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    /// Safe
    Safe,
    /// Needs help
    NeedHelp,
    /// Evacuating
    Evacuating,
    /// Unknown
    Unknown,
}

impl From<StatusArg> for MemberStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Safe => Self::Safe,
            StatusArg::NeedHelp => Self::NeedHelp,
            StatusArg::Evacuating => Self::Evacuating,
            StatusArg::Unknown => Self::Unknown,
        }
    }
}

/// Bucket argument for `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BucketArg {
    /// Supply inventory
    Inventory,
    /// User-added contacts
    Contacts,
    /// Device identity
    Device,
    /// Family session settings
    Session,
}

impl From<BucketArg> for Bucket {
    fn from(arg: BucketArg) -> Self {
        match arg {
            BucketArg::Inventory => Self::Inventory,
            BucketArg::Contacts => Self::Contacts,
            BucketArg::Device => Self::Device,
            BucketArg::Session => Self::Session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_arg_conversion() {
        assert_eq!(Category::from(CategoryArg::Food), Category::Food);
        assert_eq!(Category::from(CategoryArg::Medicine), Category::Medicine);
        assert_eq!(Category::from(CategoryArg::Other), Category::Other);
    }

    #[test]
    fn test_category_args_cover_every_category() {
        let converted: Vec<Category> = CategoryArg::value_variants()
            .iter()
            .copied()
            .map(Category::from)
            .collect();
        assert_eq!(converted, Category::ALL);
    }

    #[test]
    fn test_status_arg_conversion() {
        assert_eq!(MemberStatus::from(StatusArg::Safe), MemberStatus::Safe);
        assert_eq!(MemberStatus::from(StatusArg::NeedHelp), MemberStatus::NeedHelp);
        assert_eq!(
            MemberStatus::from(StatusArg::Evacuating),
            MemberStatus::Evacuating
        );
    }

    #[test]
    fn test_status_arg_value_name() {
        let value = StatusArg::NeedHelp.to_possible_value().unwrap();
        assert_eq!(value.get_name(), "need-help");
    }

    #[test]
    fn test_bucket_arg_conversion() {
        assert_eq!(Bucket::from(BucketArg::Inventory), Bucket::Inventory);
        assert_eq!(Bucket::from(BucketArg::Session), Bucket::Session);
    }

    #[test]
    fn test_status_command_debug() {
        let cmd = StatusCommand {
            window: 30,
            json: true,
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("json"));
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }
}
