use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use aiproxy::AiproxyError;
use aiproxy::gateway::sqlite_store::SqliteStore;
use aiproxy::gateway::store::Store as _;
use aiproxy::gateway::{
    ChannelStatus, Gateway, GatewayConfig, Group, GroupStatus, Token, TokenStatus, UsageLogQuery,
};

#[derive(Parser)]
#[command(author, version, about = "Administer an aiproxy SQLite store", long_about = None)]
struct Cli {
    /// SQLite database file.
    #[arg(long, default_value = "aiproxy.sqlite")]
    db: PathBuf,

    /// Optional TOML gateway config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(subcommand)]
    Channel(ChannelCommand),
    #[command(subcommand)]
    Group(GroupCommand),
    #[command(subcommand)]
    Token(TokenCommand),
    /// List settled requests, newest first.
    Logs(LogsArgs),
    /// Set a runtime option.
    SetOption { key: String, value: String },
}

#[derive(Subcommand)]
enum ChannelCommand {
    List,
    Enable { id: i64 },
    Disable { id: i64 },
    /// Probe one channel now.
    Test { id: i64 },
}

#[derive(Subcommand)]
enum GroupCommand {
    Create {
        id: String,
        #[arg(long, default_value_t = 0)]
        qpm: u64,
    },
    Qpm { id: String, qpm: u64 },
    Status { id: String, status: GroupStatusArg },
}

#[derive(Subcommand)]
enum TokenCommand {
    Create(CreateTokenArgs),
    Status { id: i64, status: TokenStatusArg },
    Delete { id: i64 },
}

#[derive(Args)]
struct CreateTokenArgs {
    #[arg(long)]
    group: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long)]
    quota: Option<f64>,
    /// Comma-separated model allow-list.
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
    /// Comma-separated CIDR list.
    #[arg(long)]
    subnet: Option<String>,
    #[arg(long)]
    expires_at_ms: Option<u64>,
}

#[derive(Args)]
struct LogsArgs {
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    channel: Option<i64>,
    #[arg(long)]
    since_ms: Option<u64>,
    #[arg(long)]
    until_ms: Option<u64>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupStatusArg {
    Enabled,
    Disabled,
    Deleted,
}

impl From<GroupStatusArg> for GroupStatus {
    fn from(value: GroupStatusArg) -> Self {
        match value {
            GroupStatusArg::Enabled => GroupStatus::Enabled,
            GroupStatusArg::Disabled => GroupStatus::Disabled,
            GroupStatusArg::Deleted => GroupStatus::Deleted,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TokenStatusArg {
    Enabled,
    Disabled,
}

impl From<TokenStatusArg> for TokenStatus {
    fn from(value: TokenStatusArg) -> Self {
        match value {
            TokenStatusArg::Enabled => TokenStatus::Enabled,
            TokenStatusArg::Disabled => TokenStatus::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> aiproxy::Result<()> {
    let cli = Cli::parse();
    aiproxy::telemetry::init_tracing(cli.json_logs)
        .map_err(|err| AiproxyError::Telemetry(err.to_string()))?;

    let config = match &cli.config {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };
    let store = SqliteStore::new(&cli.db);
    store.init().await?;
    let gateway = Gateway::builder(config, Arc::new(store)).build().await?;

    run(&gateway, cli.command).await
}

async fn run(gateway: &Gateway, command: Commands) -> aiproxy::Result<()> {
    match command {
        Commands::Channel(ChannelCommand::List) => {
            for channel in gateway.store().list_channels().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    channel.id,
                    channel.channel_type,
                    channel_status_label(channel.status),
                    channel.priority,
                    channel.name,
                    channel.models.join(",")
                );
            }
        }
        Commands::Channel(ChannelCommand::Enable { id }) => gateway.enable_channel(id).await?,
        Commands::Channel(ChannelCommand::Disable { id }) => gateway.disable_channel(id).await?,
        Commands::Channel(ChannelCommand::Test { id }) => {
            let outcome = gateway.test_channel(id).await?;
            match outcome.result {
                Ok(()) => println!("channel {id}: ok ({:?})", outcome.action),
                Err(err) => println!("channel {id}: {err} ({:?})", outcome.action),
            }
        }
        Commands::Group(GroupCommand::Create { id, qpm }) => {
            gateway.create_group(&Group::new(id).with_qpm(qpm)).await?;
        }
        Commands::Group(GroupCommand::Qpm { id, qpm }) => {
            gateway.update_group_qpm(&id, qpm).await?;
        }
        Commands::Group(GroupCommand::Status { id, status }) => {
            gateway.update_group_status(&id, status.into()).await?;
        }
        Commands::Token(TokenCommand::Create(args)) => {
            let mut token = Token::new(args.group, "")
                .with_name(args.name)
                .with_models(args.models.into_iter().filter(|m| !m.trim().is_empty()));
            token.quota = args.quota;
            token.subnet = args.subnet;
            token.expired_at_ms = args.expires_at_ms;
            let token = gateway.create_token(token).await?;
            println!("{}\tsk-{}", token.id, token.key);
        }
        Commands::Token(TokenCommand::Status { id, status }) => {
            gateway.update_token_status(id, status.into()).await?;
        }
        Commands::Token(TokenCommand::Delete { id }) => gateway.delete_token(id).await?,
        Commands::Logs(args) => {
            let query = UsageLogQuery {
                group_id: args.group,
                model: args.model,
                channel_id: args.channel,
                start_ms: args.since_ms,
                end_ms: args.until_ms,
                offset: args.offset,
                limit: Some(args.limit),
                ..UsageLogQuery::default()
            };
            for record in gateway.query_usage_logs(&query).await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::SetOption { key, value } => gateway.update_option(&key, &value).await?,
    }
    Ok(())
}

fn channel_status_label(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Enabled => "enabled",
        ChannelStatus::ManuallyDisabled => "manually_disabled",
        ChannelStatus::AutoDisabled => "auto_disabled",
    }
}
