//! # Broker Bridge CLI
//!
//! Command-line front end for the broker bridge.
//!
//! This module provides CLI commands for:
//! - Creating topics and binding queues to them
//! - Sending and publishing messages
//! - Consuming messages from a queue
//! - Showing the resolved (redacted) configuration
//!
//! Broker settings come from an optional configuration file followed by
//! environment variables prefixed `BROKER_BRIDGE__`, e.g.
//! `BROKER_BRIDGE__BROKER_KIND=sqs`.

use broker_bridge::{
    BrokerError, BrokerKind, CancellationToken, ConfigurationError, ConsumeOptions,
    ConsumedMessage, MessageBrokerFactory, ProviderOptions, TopicConfig, TopicKind,
};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Prefix of environment variables carrying broker settings
pub const ENV_PREFIX: &str = "BROKER_BRIDGE";

// ============================================================================
// CLI Structure
// ============================================================================

/// Broker Bridge CLI - one interface over AMQP and SQS/SNS
#[derive(Parser, Debug)]
#[command(name = "broker-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish, subscribe and manage topics on AMQP or SQS/SNS")]
pub struct Cli {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "BROKER_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(flatten)]
    Broker(BrokerCommand),

    /// Show the resolved configuration with secrets redacted
    Config {
        /// Output format for configuration
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Commands that talk to the broker
#[derive(Subcommand, Debug)]
pub enum BrokerCommand {
    /// Create a topic (exchange) if it does not exist
    CreateTopic {
        /// Topic name
        name: String,

        /// Exchange type on AMQP brokers (direct, fanout, topic, headers)
        #[arg(short, long, default_value = "direct")]
        kind: String,

        /// Declare a non-durable exchange
        #[arg(long)]
        transient: bool,

        /// Delete the exchange once its last binding is removed
        #[arg(long)]
        auto_delete: bool,
    },

    /// Route messages published on a topic to a queue
    Assign {
        /// Queue name
        queue: String,

        /// Topic name
        topic: String,

        /// Binding key (ignored by SNS)
        #[arg(short, long, default_value = "")]
        routing_key: String,
    },

    /// Send a message directly to a queue
    Send {
        /// Queue name
        queue: String,

        #[command(flatten)]
        message: MessageArgs,
    },

    /// Publish a message on a topic
    Publish {
        /// Topic name
        topic: String,

        /// Routing key (ignored by SNS)
        #[arg(short, long, default_value = "")]
        routing_key: String,

        #[command(flatten)]
        message: MessageArgs,
    },

    /// Print messages arriving on a queue until interrupted
    Consume {
        /// Queue name
        queue: String,

        /// Stop after this many messages
        #[arg(short, long)]
        max: Option<usize>,

        /// Long-poll wait per SQS receive request, in seconds
        #[arg(long, default_value = "20")]
        wait_seconds: u64,

        /// Discard AMQP deliveries whose processing failed instead of requeueing
        #[arg(long)]
        no_requeue: bool,
    },
}

/// Body and type of an outgoing message
#[derive(Args, Debug)]
pub struct MessageArgs {
    /// Message body
    #[arg(conflicts_with = "file")]
    pub body: Option<String>,

    /// Read the message body from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Message type; when set the body is wrapped in a typed envelope
    #[arg(short = 't', long, default_value = "")]
    pub message_type: String,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ConfigurationError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Load broker settings from the optional file and the process environment
pub fn load_settings(config_path: Option<&Path>) -> Result<ProviderOptions, ConfigError> {
    load_settings_with_env(config_path, None)
}

/// Load broker settings, reading environment variables from `env` when given
pub fn load_settings_with_env(
    config_path: Option<&Path>,
    env: Option<HashMap<String, String>>,
) -> Result<ProviderOptions, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        info!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let options: ProviderOptions = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .source(env),
        )
        .build()?
        .try_deserialize()?;

    options.validate()?;
    Ok(options)
}

/// Serializable view of the settings without secrets
#[derive(Debug, serde::Serialize)]
struct RedactedSettings<'a> {
    broker_kind: BrokerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_token: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sqs_endpoint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sns_endpoint: Option<&'a str>,
}

impl<'a> From<&'a ProviderOptions> for RedactedSettings<'a> {
    fn from(options: &'a ProviderOptions) -> Self {
        Self {
            broker_kind: options.broker_kind,
            connection_uri: options.redacted_connection_uri(),
            region: options.region.as_deref(),
            access_key: options.access_key.as_deref(),
            secret_key: options.secret_key.as_ref().map(|_| "<redacted>"),
            session_token: options.session_token.as_ref().map(|_| "<redacted>"),
            sqs_endpoint: options.sqs_endpoint.as_deref(),
            sns_endpoint: options.sns_endpoint.as_deref(),
        }
    }
}

/// Render the settings in `format` with secrets redacted
pub fn render_settings(
    options: &ProviderOptions,
    format: &ConfigFormat,
) -> Result<String, CliError> {
    let view = RedactedSettings::from(options);
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&view).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&view).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::to_string_pretty(&view).map_err(|e| e.to_string()),
    };

    rendered.map_err(|message| CliError::CommandFailed {
        message: format!("failed to render configuration: {}", message),
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    run(cli).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    let options = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Config { format } => {
            print!("{}", render_settings(&options, &format)?);
            Ok(())
        }
        Commands::Broker(command) => {
            let factory = MessageBrokerFactory::new(options).map_err(ConfigError::from)?;
            execute_broker_command(&factory, command).await
        }
    }
}

/// Initialize logging based on CLI arguments
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level).map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?,
    };

    // Logs go to stderr so consumed messages own stdout.
    let json_layer = cli.json_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer =
        (!cli.json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CliError::CommandFailed {
            message: format!("failed to initialize logging: {}", e),
        })
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_broker_command(
    factory: &MessageBrokerFactory,
    command: BrokerCommand,
) -> Result<(), CliError> {
    factory.connect().await?;

    match command {
        BrokerCommand::CreateTopic {
            name,
            kind,
            transient,
            auto_delete,
        } => {
            let config = TopicConfig {
                durable: !transient,
                auto_delete,
                ..TopicConfig::default()
            };
            let arn = factory
                .create_topic(&name, TopicKind::from(kind.as_str()), &config)
                .await?;

            info!(topic = %name, kind = %kind, "Topic created");
            if let Some(arn) = arn {
                println!("{}", arn);
            }
            Ok(())
        }
        BrokerCommand::Assign {
            queue,
            topic,
            routing_key,
        } => {
            factory.assign_topic(&queue, &topic, &routing_key).await?;
            Ok(())
        }
        BrokerCommand::Send { queue, message } => {
            let body = read_body(&message)?;
            factory.send(&queue, &body, &message.message_type).await?;
            info!(queue = %queue, size = body.len(), "Message sent");
            Ok(())
        }
        BrokerCommand::Publish {
            topic,
            routing_key,
            message,
        } => {
            let body = read_body(&message)?;
            factory
                .publish_message(&topic, &body, &routing_key, &message.message_type)
                .await?;
            info!(topic = %topic, routing_key = %routing_key, size = body.len(), "Message published");
            Ok(())
        }
        BrokerCommand::Consume {
            queue,
            max,
            wait_seconds,
            no_requeue,
        } => execute_consume_command(factory, &queue, max, wait_seconds, !no_requeue).await,
    }
}

async fn execute_consume_command(
    factory: &MessageBrokerFactory,
    queue: &str,
    max: Option<usize>,
    wait_seconds: u64,
    requeue_on_failure: bool,
) -> Result<(), CliError> {
    if max == Some(0) {
        return Err(CliError::InvalidArgument {
            arg: "max".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping consumer");
                shutdown.cancel();
            }
        });
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let handler = {
        let shutdown = shutdown.clone();
        move |message: ConsumedMessage| {
            let shutdown = shutdown.clone();
            let seen = Arc::clone(&seen);
            async move {
                let count = seen.fetch_add(1, Ordering::SeqCst) + 1;
                if max.is_some_and(|max| count > max) {
                    // Left with the broker for the next consumer.
                    anyhow::bail!("message limit reached");
                }

                println!("{}", format_message(&message));

                if max.is_some_and(|max| count >= max) {
                    shutdown.cancel();
                }
                Ok(())
            }
        }
    };

    let options = ConsumeOptions {
        requeue_on_failure,
        ..ConsumeOptions::default()
    }
    .with_wait_time(Duration::from_secs(wait_seconds))
    .with_shutdown(shutdown.clone());

    info!(queue, max = ?max, "Consuming messages");
    factory
        .add_consumer(queue, Arc::new(handler), options)
        .await?;

    // Push consumers return right after registration.
    shutdown.cancelled().await;
    Ok(())
}

/// Message body from the positional argument or `--file`
pub fn read_body(args: &MessageArgs) -> Result<Vec<u8>, CliError> {
    match (&args.body, &args.file) {
        (Some(body), _) => Ok(body.clone().into_bytes()),
        (None, Some(path)) => Ok(std::fs::read(path)?),
        (None, None) => Err(CliError::InvalidArgument {
            arg: "body".to_string(),
            message: "provide a message body or --file".to_string(),
        }),
    }
}

/// One output line per consumed message
pub fn format_message(message: &ConsumedMessage) -> String {
    match message.envelope() {
        Some(envelope) => format!("[{}] {}", envelope.message_type, envelope.message),
        None => {
            if message.body.is_empty() {
                warn!(queue = %message.queue, "Received empty message");
            }
            message.body_text().into_owned()
        }
    }
}
