//! Clap CLI definitions for TabBridge.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tabbridge_types::{AgentKind, Target};

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tabbridge serve                          Run the broker on 127.0.0.1:7979
  tabbridge agents                         Show connected browser agents
  tabbridge list tabs                      List tabs in the default Chrome agent
  tabbridge list windows -b firefox        List Firefox windows
  tabbridge create tabs '{\"url\":\"https://example.com\"}'
  tabbridge remove tabs 42
  tabbridge call --callback tabs.query '{\"active\":true}'
  tabbridge introspect tabs                Describe the remote `tabs` namespace

\x1b[1;36mExit codes:\x1b[0m
  0 success, 1 bad usage, 2 connection failure, 3 request failure";

/// TabBridge: drive live browser APIs from the command line.
#[derive(Parser, Debug)]
#[command(name = "tabbridge", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default ~/.tabbridge/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Broker URL, overriding the config file.
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Username to register as.
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Shared secret; read from the key file when omitted.
    #[arg(long, global = true)]
    pub key: Option<String>,

    /// Print results as compact single-line JSON.
    #[arg(long, global = true)]
    pub compact: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which agent a command is addressed to.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Browser kind of the agent.
    #[arg(long, short = 'b', default_value = "chrome", value_parser = parse_kind)]
    pub browser: AgentKind,

    /// Identifier of a specific agent instance.
    #[arg(long = "id", short = 'i')]
    pub identifier: Option<String>,
}

impl TargetArgs {
    pub fn target(&self) -> Target {
        Target::agent(self.browser, self.identifier.as_deref())
    }
}

fn parse_kind(s: &str) -> Result<AgentKind, String> {
    s.parse()
}

/// Browser resources with first-class commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Tabs,
    Windows,
    Bookmarks,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker in the foreground until Ctrl+C.
    Serve {
        /// Address to listen on, `host:port`.
        #[arg(long)]
        listen: Option<String>,
        /// Accept clients without checking credentials.
        #[arg(long)]
        open: bool,
        /// Only accept agents registering with one of these identifiers.
        #[arg(long = "allow-identifier")]
        allow_identifier: Vec<String>,
    },
    /// List agents connected to the broker.
    Agents,
    /// Send a raw query for a dotted path (`tabs.query`, `windows.0.id`).
    Query {
        #[command(flatten)]
        target: TargetArgs,
        path: String,
        /// Parameters as a JSON array or object.
        #[arg(long)]
        params: Option<String>,
        /// Argument position where the agent injects its completion callback.
        #[arg(long)]
        callback_index: Option<usize>,
    },
    /// Call a remote function through a proxy built from its description.
    Call {
        #[command(flatten)]
        target: TargetArgs,
        path: String,
        /// Arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,
        /// The function takes a trailing completion callback.
        #[arg(long)]
        callback: bool,
    },
    /// Describe the remote surface at a path (the whole surface by default).
    Introspect {
        #[command(flatten)]
        target: TargetArgs,
        path: Option<String>,
    },
    /// List tabs, windows or bookmarks.
    List {
        #[command(flatten)]
        target: TargetArgs,
        resource: Resource,
        /// Filter object passed to the underlying query (JSON).
        #[arg(long)]
        filter: Option<String>,
    },
    /// Create a tab, window or bookmark from JSON properties.
    Create {
        #[command(flatten)]
        target: TargetArgs,
        resource: Resource,
        properties: String,
    },
    /// Update a tab, window or bookmark.
    Update {
        #[command(flatten)]
        target: TargetArgs,
        resource: Resource,
        id: String,
        properties: String,
    },
    /// Remove a tab, window or bookmark.
    Remove {
        #[command(flatten)]
        target: TargetArgs,
        resource: Resource,
        id: String,
    },
}

impl Commands {
    /// Long-running commands log at `info` by default; one-shot requests
    /// stay quiet unless something goes wrong.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Commands::Serve { .. } => "info",
            _ => "warn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_list_with_target() {
        let cli = Cli::try_parse_from(["tabbridge", "list", "windows", "-b", "firefox", "-i", "work"])
            .unwrap();
        match cli.command {
            Commands::List {
                target, resource, ..
            } => {
                assert_eq!(resource, Resource::Windows);
                assert_eq!(target.target(), Target::agent(AgentKind::Firefox, Some("work")));
            }
            other => panic!("Unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_browser_is_usage_error() {
        assert!(Cli::try_parse_from(["tabbridge", "list", "tabs", "-b", "safari"]).is_err());
    }
}
