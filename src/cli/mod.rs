use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::Instrument;

use crate::config::{DuoConfig, SessionIdentity, AGENT_ENV};
use crate::coordinator::Coordinator;
use crate::error::DuoError;
use crate::telemetry::{create_coordination_span, generate_correlation_id};

pub mod commands;

use commands::agents::{AgentsCommand, AliveCommand, InterruptCommand, RegisterCommand, SettingsCommand};
use commands::comment::CommentCommand;
use commands::config::ConfigCommand;
use commands::logs::LogsCommand;
use commands::messaging::{InboxCommand, MessagesCommand, SendCommand};
use commands::state::{GetCommand, InitCommand, SetCommand};
use commands::status::StatusCommand;
use commands::{parse_key_values, read_body, Command};

#[derive(Parser)]
#[command(name = "duo")]
#[command(version)]
#[command(about = "Shared coordination store for multi-agent PR review")]
#[command(long_about = "duo lets review agents working on the same pull request exchange messages, \
                       share keyed state, check each other's liveness and mirror their status to \
                       the PR thread. Every command reads DROID_REPO and DROID_PR_NUMBER to find \
                       the session ledger.")]
pub struct Cli {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Show debug logs on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Repository as owner/name
    #[arg(long, env = "DROID_REPO", global = true)]
    pub repo: Option<String>,

    /// Pull request number
    #[arg(long = "pr", env = "DROID_PR_NUMBER", global = true)]
    pub pr: Option<String>,

    /// Name of the calling agent
    #[arg(long = "as", env = "DROID_AGENT_NAME", global = true, value_name = "AGENT")]
    pub caller: Option<String>,
}

impl SessionArgs {
    pub fn identity(&self) -> Result<SessionIdentity, DuoError> {
        SessionIdentity::resolve(self.repo.as_deref(), self.pr.as_deref())
    }

    pub fn coordinator(&self, config: &DuoConfig) -> Result<Coordinator, DuoError> {
        Ok(Coordinator::new(self.identity()?, config))
    }

    /// Caller name for records that note who made a change.
    pub fn actor(&self) -> String {
        self.caller
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "cli".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AutoMode {
    Off,
    Low,
    High,
}

impl AutoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoMode::Off => "off",
            AutoMode::Low => "low",
            AutoMode::High => "high",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message to an agent, or to everyone with '*'
    Send {
        /// Recipient agent name or '*'
        to: String,
        /// Message text
        message: Option<String>,
        /// Override sender name (defaults to DROID_AGENT_NAME)
        #[arg(short = 'f', long = "from")]
        from: Option<String>,
        /// Read message from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Set a shared state value
    Set { key: String, value: String },
    /// Print a shared state value
    Get {
        key: String,
        #[arg(long)]
        json: bool,
    },
    /// Show session state, agents and their liveness
    Status {
        #[arg(long)]
        json: bool,
        /// Also mirror the status to the PR thread
        #[arg(long)]
        publish: bool,
    },
    /// List registered agents
    Agents {
        #[arg(long)]
        json: bool,
    },
    /// Check whether an agent's process is running (exit 1 when not)
    Alive {
        agent: String,
        #[arg(long)]
        json: bool,
    },
    /// Send SIGINT to an agent's process
    Interrupt { agent: String },
    /// Change an agent's settings
    Settings {
        agent: String,
        #[arg(long = "auto", value_enum)]
        auto_mode: Option<AutoMode>,
        #[arg(long)]
        model: Option<String>,
        /// Arbitrary option as key=value (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Show message history
    Messages {
        /// Only messages from or to this agent
        agent: Option<String>,
        /// Show last N messages
        #[arg(short = 'n', long = "last")]
        last: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show messages addressed to an agent (defaults to DROID_AGENT_NAME)
    Inbox {
        agent: Option<String>,
        /// Only messages after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
        #[arg(long)]
        json: bool,
    },
    /// Show an agent's log
    Logs {
        agent: String,
        /// Follow log output
        #[arg(short = 'f', long)]
        follow: bool,
        /// Number of lines to show
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: usize,
    },
    /// Register an agent and optionally its process id
    Register {
        agent: String,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Start a review session: records metadata and resets stage to 1
    Init {
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        base: Option<String>,
        #[arg(long)]
        runner: Option<String>,
        /// Keep running and print stage changes until the review is done
        #[arg(long)]
        watch: bool,
    },
    /// Manage duo comments on the PR thread
    #[command(subcommand)]
    Comment(CommentCommands),
    /// Print the effective configuration (token redacted)
    Config,
}

#[derive(Subcommand)]
pub enum CommentCommands {
    /// List comments carrying a duo marker
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print a comment body
    Get {
        /// Comment id, or a duo marker such as duo-opus-r1 (newest match wins)
        id: String,
    },
    /// Post a new comment and print its id
    Post {
        body: Option<String>,
        #[arg(long)]
        stdin: bool,
        /// Tag the comment with <!-- duo-MARKER -->
        #[arg(long)]
        marker: Option<String>,
    },
    /// Replace a comment body
    Edit {
        /// Comment id or duo marker
        id: String,
        body: Option<String>,
        #[arg(long)]
        stdin: bool,
    },
    /// Delete a comment
    Delete {
        /// Comment id or duo marker
        id: String,
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Send { .. } => "send",
            Commands::Set { .. } => "set",
            Commands::Get { .. } => "get",
            Commands::Status { .. } => "status",
            Commands::Agents { .. } => "agents",
            Commands::Alive { .. } => "alive",
            Commands::Interrupt { .. } => "interrupt",
            Commands::Settings { .. } => "settings",
            Commands::Messages { .. } => "messages",
            Commands::Inbox { .. } => "inbox",
            Commands::Logs { .. } => "logs",
            Commands::Register { .. } => "register",
            Commands::Init { .. } => "init",
            Commands::Comment(_) => "comment",
            Commands::Config => "config",
        }
    }
}

impl Cli {
    /// Resolve the session and dispatch to the command.
    pub async fn run(self, config: &DuoConfig) -> Result<()> {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span(
            self.command.name(),
            self.session.caller.as_deref(),
            self.session.pr.as_deref().and_then(|pr| pr.trim().parse().ok()),
            Some(&correlation_id),
        );
        self.dispatch(config).instrument(span).await
    }

    async fn dispatch(self, config: &DuoConfig) -> Result<()> {
        let session = self.session;
        match self.command {
            Commands::Config => ConfigCommand::new(config.clone()).execute().await,
            Commands::Send {
                to,
                message,
                from,
                stdin,
            } => {
                let coordinator = session.coordinator(config)?;
                let from = from.or(session.caller.clone()).ok_or_else(|| {
                    DuoError::Configuration(format!("{AGENT_ENV} not set. Export it or pass --from."))
                })?;
                let body = read_body(message, stdin, "message")?;
                SendCommand::new(coordinator, from, to, body).execute().await
            }
            Commands::Set { key, value } => {
                SetCommand::new(session.coordinator(config)?, key, value, session.actor())
                    .execute()
                    .await
            }
            Commands::Get { key, json } => {
                GetCommand::new(session.coordinator(config)?, key)
                    .with_json(json)
                    .execute()
                    .await
            }
            Commands::Status { json, publish } => {
                StatusCommand::new(session.coordinator(config)?)
                    .with_json(json)
                    .with_publish(publish)
                    .execute()
                    .await
            }
            Commands::Agents { json } => {
                AgentsCommand::new(session.coordinator(config)?)
                    .with_json(json)
                    .execute()
                    .await
            }
            Commands::Alive { agent, json } => {
                AliveCommand::new(session.coordinator(config)?, agent)
                    .with_json(json)
                    .execute()
                    .await
            }
            Commands::Interrupt { agent } => {
                InterruptCommand::new(session.coordinator(config)?, agent)
                    .execute()
                    .await
            }
            Commands::Settings {
                agent,
                auto_mode,
                model,
                options,
            } => {
                let coordinator = session.coordinator(config)?;
                let mut settings = parse_key_values(&options)?;
                if let Some(mode) = auto_mode {
                    settings.insert("auto".to_string(), mode.as_str().to_string());
                }
                if let Some(model) = model {
                    settings.insert("model".to_string(), model);
                }
                SettingsCommand::new(coordinator, agent, settings).execute().await
            }
            Commands::Messages { agent, last, json } => {
                MessagesCommand::new(session.coordinator(config)?, agent, last)
                    .with_json(json)
                    .execute()
                    .await
            }
            Commands::Inbox { agent, since, json } => {
                let coordinator = session.coordinator(config)?;
                let agent = agent.or(session.caller.clone()).ok_or_else(|| {
                    DuoError::Configuration(format!("{AGENT_ENV} not set. Pass the agent name."))
                })?;
                InboxCommand::new(coordinator, agent, since)
                    .with_json(json)
                    .execute()
                    .await
            }
            Commands::Logs {
                agent,
                follow,
                lines,
            } => {
                LogsCommand::new(session.coordinator(config)?, agent, follow, lines)
                    .execute()
                    .await
            }
            Commands::Register {
                agent,
                pid,
                model,
                options,
            } => {
                let coordinator = session.coordinator(config)?;
                let mut settings = parse_key_values(&options)?;
                if let Some(model) = model {
                    settings.insert("model".to_string(), model);
                }
                RegisterCommand::new(coordinator, agent, pid, settings)
                    .execute()
                    .await
            }
            Commands::Init {
                branch,
                base,
                runner,
                watch,
            } => {
                InitCommand::new(session.coordinator(config)?, session.actor())
                    .with_refs(branch, base, runner)
                    .with_watch(watch)
                    .execute()
                    .await
            }
            Commands::Comment(action) => {
                CommentCommand::new(session.coordinator(config)?, action)
                    .execute()
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_send_with_explicit_session() {
        let cli = Cli::try_parse_from([
            "duo", "--repo", "octo/widgets", "--pr", "42", "send", "opus", "hello", "--from",
            "orchestrator",
        ])
        .unwrap();
        assert_eq!(cli.session.repo.as_deref(), Some("octo/widgets"));
        assert!(matches!(
            cli.command,
            Commands::Send { ref to, ref from, .. } if to == "opus" && from.as_deref() == Some("orchestrator")
        ));
    }

    #[test]
    fn init_accepts_watch_flag() {
        let cli = Cli::try_parse_from(["duo", "init", "--base", "main", "--watch"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { watch: true, .. }));
    }

    #[test]
    fn settings_accepts_known_auto_modes_only() {
        assert!(Cli::try_parse_from(["duo", "settings", "opus", "--auto", "high"]).is_ok());
        assert!(Cli::try_parse_from(["duo", "settings", "opus", "--auto", "turbo"]).is_err());
    }
}
