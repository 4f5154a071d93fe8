//! twinsession - join a project session as a UI participant
//!
//! Opens a session through the directory service, serves inbound commands
//! and exits with a code describing how the session ended.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use twinsession_control::{Dispatcher, SessionContext};
use twinsession_proto::{ActionEnvelope, Command, DispatchMode};
use twinsession_session::{
    inbound, ProjectRequest, SessionConfig, SessionController, SessionExit,
};
use twinsession_transport::{DirectTransport, Transport};

/// twinsession - Project session participant
#[derive(Parser, Debug)]
#[command(name = "twinsession")]
#[command(about = "twinsession - Join and drive project sessions")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML configuration file
    #[arg(short, long, global = true, env = "TWINSESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a project session and serve it until it closes
    #[command(long_about = r#"
Ask the directory service for a coordinator, create a session for the
project, wait for the other services to start and serve inbound commands
until the session is closed.

EXAMPLES:
  # Open a session with settings from a config file
  twinsession --config session.yaml open --project bridge --collection main

  # Override the directory and ask for a relay channel
  twinsession open --project bridge --collection main \
    --directory directory.example.com:8443 --relay

  # Listen on every interface, announce a reachable address
  twinsession open --project bridge --collection main \
    --listen 0.0.0.0:8640 --advertise 10.0.0.4:8640

EXIT CODES:
  0  session closed
  1  session creation refused
  2  directory service unreachable
  3  startup handshake failed
  4  coordinator lost
  5  emergency shutdown requested by a peer

ENVIRONMENT VARIABLES:
  TWINSESSION_CONFIG     Config file
  TWINSESSION_DIRECTORY  Directory service address
  TWINSESSION_ADVERTISE  Address announced to peers
  TWINSESSION_USER       User name sent with CreateSession
  TWINSESSION_PASSWORD   Password sent with CreateSession
    "#)]
    Open {
        /// Project to open
        #[arg(long)]
        project: String,

        /// Collection within the project
        #[arg(long)]
        collection: String,

        /// Directory service address (e.g., directory.example.com:8443)
        #[arg(long, env = "TWINSESSION_DIRECTORY")]
        directory: Option<String>,

        /// Address for inbound commands (e.g., 0.0.0.0:8640)
        #[arg(long)]
        listen: Option<String>,

        /// Address announced to peers when it differs from --listen
        #[arg(long, env = "TWINSESSION_ADVERTISE")]
        advertise: Option<String>,

        /// Ask the coordinator for a relay channel
        #[arg(long)]
        relay: bool,

        #[arg(long, env = "TWINSESSION_USER")]
        user: Option<String>,

        #[arg(long, env = "TWINSESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Ping a participant and print its answer
    Ping {
        /// Participant address
        target: String,
    },

    /// Send one action to a participant and print the response
    Send {
        /// Participant address
        target: String,

        /// Action name (e.g., ExecuteAction)
        action: String,

        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Dispatch mode: execute, queue or execute-one-way-tls
        #[arg(long, default_value = "execute")]
        mode: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

fn direct_transport(config: &SessionConfig) -> Result<DirectTransport> {
    let transport = DirectTransport::new(config.default_timeout, &config.tls_settings())
        .context("Failed to set up the HTTPS client")?
        .with_own_url(config.service_url());
    Ok(transport)
}

/// Open the session and serve it; returns how it ended
async fn open_session(config: SessionConfig, request: ProjectRequest) -> Result<SessionExit> {
    let transport = direct_transport(&config)?;
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_address))?;

    let controller = SessionController::new(
        config,
        Arc::new(transport),
        Dispatcher::new(SessionContext::default()),
    );
    let close = controller.close_token();
    let inbound = tokio::spawn(inbound::serve(listener, controller.handle(), close.clone()));

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut session = tokio::spawn(controller.run(request));
    let exit = tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, closing session...");
            close.cancel();
            (&mut session).await
        }
        result = &mut session => result,
    }
    .context("Session task panicked")?;

    // The listener shares the close token
    close.cancel();
    match inbound.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Inbound listener error: {}", e),
        Err(e) => warn!("Inbound listener task failed: {}", e),
    }

    Ok(exit)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Open {
            project,
            collection,
            directory,
            listen,
            advertise,
            relay,
            user,
            password,
        } => {
            if let Some(directory) = directory {
                config.directory_url = directory;
            }
            if let Some(listen) = listen {
                config.listen_address = listen;
            }
            if advertise.is_some() {
                config.advertise_address = advertise;
            }
            if relay {
                config.relay_required = true;
            }
            if user.is_some() {
                config.user = user;
            }
            if password.is_some() {
                config.password = password;
            }
            config.validate().context("Invalid configuration")?;
            if config.directory_url.is_empty() {
                return Err(anyhow!(
                    "No directory service configured (use --directory or directory_url)"
                ));
            }

            info!("twinsession starting...");
            info!("Directory: {}", config.directory_url);
            info!("Listening on: {}", config.listen_address);
            info!("Announced as: {}", config.service_url());
            if config.relay_required {
                info!("Relay channel requested");
            }

            let exit = open_session(config, ProjectRequest::new(project, collection)).await?;
            match &exit {
                SessionExit::Closed(_) => {
                    info!("{}", exit);
                    Ok(())
                }
                SessionExit::Abandoned { .. } | SessionExit::Fatal { .. } => {
                    error!("{}", exit);
                    std::process::exit(exit.code());
                }
            }
        }
        Commands::Ping { target } => {
            let transport = direct_transport(&config)?;
            let reply = transport
                .send_command(DispatchMode::ExecuteOneWayTls, &target, &Command::Ping)
                .await
                .with_context(|| format!("Ping to {} failed", target))?;
            println!("{}", reply);
            Ok(())
        }
        Commands::Send {
            target,
            action,
            params,
            mode,
        } => {
            let mode = DispatchMode::parse(&mode)
                .ok_or_else(|| anyhow!("Unknown dispatch mode: {}", mode))?;
            let params: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&params).context("--params must be a JSON object")?;

            let mut envelope = ActionEnvelope::new(action);
            for (key, value) in params {
                envelope.insert(key, value);
            }

            let transport = direct_transport(&config)?;
            let reply = transport
                .send(mode, &target, &envelope)
                .await
                .with_context(|| format!("Sending {} to {} failed", envelope.action, target))?;
            println!("{}", reply);
            Ok(())
        }
    }
}
