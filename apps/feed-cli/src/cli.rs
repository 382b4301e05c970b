use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "feed-cli",
    about = "Inspect and drive a social feed account from the terminal",
    author,
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub account: AccountArgs,

    /// Log filter (RUST_LOG syntax).
    #[arg(long, env = "RUST_LOG", global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct AccountArgs {
    /// Id of the logged-in user.
    #[arg(long, env = "FEED_USER_ID", global = true, default_value_t = 1)]
    pub user: i64,

    /// REST base URL; defaults to FEED_API_BASE from the realtime settings.
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Bearer token sent with every REST call.
    #[arg(long, env = "FEED_API_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List notifications, newest first.
    Notifications {
        /// Number of pages to load.
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Print the feed as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Mark one notification as read.
    MarkRead { id: i64 },
    /// Mark every notification as read.
    ReadAll,
    /// Accept or decline a message request.
    Respond {
        id: i64,
        /// Decline instead of accepting.
        #[arg(long)]
        decline: bool,
    },
    /// Print the conversation with a buddy, oldest first.
    History {
        buddy: i64,
        /// Older pages to load after the most recent window.
        #[arg(long, default_value_t = 0)]
        older: u32,
    },
    /// Send a chat message.
    Send { buddy: i64, message: String },
    /// Toggle the user's upvote on a topic.
    Upvote { topic: String },
    /// Print upvote counts for topics.
    Upvotes {
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Run a session against an in-process broker and feed it the push
    /// frames of a JSON lines file (`{"destination": ..., "body": {...}}`).
    Replay {
        file: PathBuf,
        /// Also open the conversation with this buddy.
        #[arg(long)]
        buddy: Option<i64>,
    },
}
