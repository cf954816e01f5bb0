use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Requisition and quoting portal")]
pub struct Cli {
    /// Directory holding the data files and backups
    #[clap(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Acting user name (role is looked up from the user store)
    #[clap(long, short = 'u')]
    pub user: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    /// Register a new user
    Add {
        /// Name of the user (stored uppercased)
        name: String,

        /// Email address
        #[clap(long)]
        email: String,

        /// Role (seller, buyer, admin)
        #[clap(long)]
        role: String,
    },

    /// List all users
    List,

    /// Set a user's password
    SetPassword {
        /// Name of the user
        name: String,

        /// New password
        #[clap(long)]
        password: String,
    },

    /// Deactivate a user without deleting the record
    Deactivate {
        /// Name of the user
        name: String,
    },

    /// Delete a user (refused for admins)
    Remove {
        /// Name of the user
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Create a backup archive now
    Run {
        /// Mark the archive as scheduler-created instead of manual
        #[clap(long)]
        auto: bool,
    },

    /// Run the scheduled daily backup (skipped when today's archive exists)
    Daily {
        /// Keep running, re-checking every SECS seconds
        #[clap(long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// List the archives in the backup directory
    List,

    /// Delete archives older than the retention window
    Prune {
        /// Retention window in days
        #[clap(long, default_value = "7")]
        days: i64,
    },

    /// Replace the live data set with an archive's contents
    Restore {
        /// Path to the backup archive
        archive: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImportCommand {
    /// Import a legacy requisition dump (JSON array)
    Requisitions {
        /// Path to the dump file
        path: PathBuf,
    },

    /// Import a legacy user map (JSON object keyed by name)
    Users {
        /// Path to the dump file
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the data directory with a first admin account
    Init {
        /// Name of the admin account
        #[clap(long)]
        admin: String,

        /// Admin email address
        #[clap(long)]
        email: String,
    },

    /// Verify a user's credentials
    Login {
        /// Name of the user
        name: String,

        /// Password
        #[clap(long)]
        password: String,
    },

    /// Manage user accounts
    #[clap(subcommand)]
    User(UserCommand),

    /// Raise a new requisition
    Create {
        /// Client the requisition is for
        #[clap(long)]
        client: String,

        /// Line item as DESCRIPTION:QUANTITY (repeatable)
        #[clap(long = "item", required = true)]
        items: Vec<String>,

        /// Free-form notes for the buyer
        #[clap(long, default_value = "")]
        notes: String,
    },

    /// Take an open requisition into quoting
    Accept {
        /// Requisition number
        number: i64,
    },

    /// Quote one line item of a requisition in progress
    Quote {
        /// Requisition number
        number: i64,

        /// Line number within the requisition
        #[clap(long)]
        line: u32,

        /// Cost per unit
        #[clap(long)]
        unit_cost: f64,

        /// Markup percentage applied on top of the cost
        #[clap(long)]
        markup: f64,

        /// Delivery term, free-form
        #[clap(long, default_value = "")]
        delivery: String,
    },

    /// Finalize a fully quoted requisition
    Finalize {
        /// Requisition number
        number: i64,
    },

    /// Refuse a requisition with a reason
    Refuse {
        /// Requisition number
        number: i64,

        /// Reason shown to the seller
        #[clap(long)]
        reason: String,
    },

    /// List requisitions visible to the acting user
    List {
        /// Include finalized and refused requisitions
        #[clap(long)]
        all: bool,
    },

    /// Show one requisition in full
    Show {
        /// Requisition number
        number: i64,
    },

    /// Per-status requisition counts
    Stats,

    /// One-time import of legacy JSON dumps
    #[clap(subcommand)]
    Import(ImportCommand),

    /// Backup and restore
    #[clap(subcommand)]
    Backup(BackupCommand),
}
