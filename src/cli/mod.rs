mod output;
mod repl;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::chat::ChatEngine;
use crate::client::{WorkflowApi, WorkflowClient};
use crate::core::config::AppConfig;
use crate::core::workflow::{ResponseStatus, TenantInfo, WorkflowRequest};
use crate::storage::{ApiSettings, FileStorage, PersistedSettings, SessionStore, SettingsStore};

#[derive(Parser, Debug)]
#[command(
    name = "workflow-chat",
    version,
    about = "Chat with and run workflows on a workflow-execution service"
)]
struct Cli {
    /// Working directory
    #[arg(short = 'c', long = "cwd", global = true)]
    working_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available workflows
    Workflows,

    /// Show details of one workflow
    Info { name: String },

    /// Run a workflow and print its result
    Exec {
        input: String,

        /// Workflow to run (defaults to the chat workflow)
        #[arg(short, long)]
        workflow: Option<String>,

        /// Timeout in seconds, forwarded to the service
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Run a workflow and print its events as they arrive
    Stream {
        input: String,

        #[arg(short, long)]
        workflow: Option<String>,

        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Interactive chat (the default)
    Chat {
        /// Resume a session by ID
        #[arg(long)]
        session: Option<String>,

        /// Wait for whole replies instead of streaming them
        #[arg(long)]
        no_stream: bool,
    },

    /// Show or change the saved connection settings
    Settings {
        /// Base URL of the workflow service
        #[arg(long)]
        api_base: Option<String>,

        #[arg(long, requires = "archive_id")]
        user_id: Option<String>,

        #[arg(long, requires = "user_id")]
        archive_id: Option<String>,

        /// Forget the saved tenant
        #[arg(long, conflicts_with_all = ["user_id", "archive_id"])]
        clear_tenant: bool,
    },
}

pub struct App {
    pub config: AppConfig,
    pub client: Arc<WorkflowClient>,
    pub store: SessionStore,
    pub settings: SettingsStore,
    pub engine: ChatEngine,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let mut config = crate::core::config::load_config(cli.working_dir.clone())?;
    config.debug |= cli.debug;

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let app = build_app(config)?;

    match cli.command.unwrap_or(Command::Chat {
        session: None,
        no_stream: false,
    }) {
        Command::Workflows => {
            let list = app.client.list_workflows().await?;
            output::print_workflows(&list);
        }
        Command::Info { name } => {
            let info = app.client.workflow_info(&name).await?;
            output::print_workflow_info(&info);
        }
        Command::Exec {
            input,
            workflow,
            timeout,
        } => {
            let request = build_request(&app.config, input, workflow, timeout);
            let resp = app.client.execute(request).await?;
            match (resp.status, resp.result) {
                (ResponseStatus::Success, Some(result)) => println!("{result}"),
                _ => anyhow::bail!(
                    "{}",
                    resp.error.unwrap_or_else(|| "unknown error".to_string())
                ),
            }
        }
        Command::Stream {
            input,
            workflow,
            timeout,
        } => {
            let request = build_request(&app.config, input, workflow, timeout);
            run_stream(&app, request).await?;
        }
        Command::Chat { session, no_stream } => {
            if no_stream {
                app.engine.set_use_streaming(false);
            }
            repl::run(app, session).await?;
        }
        Command::Settings {
            api_base,
            user_id,
            archive_id,
            clear_tenant,
        } => {
            if let Some(api_base) = api_base {
                app.settings.set_api_settings(ApiSettings { api_base });
            }
            if let (Some(user_id), Some(archive_id)) = (user_id, archive_id) {
                app.settings
                    .set_tenant_info(Some(TenantInfo::new(user_id, archive_id)));
            } else if clear_tenant {
                app.settings.set_tenant_info(None);
            }
            output::print_settings(&app.settings.snapshot());
        }
    }

    Ok(())
}

fn build_app(config: AppConfig) -> Result<App> {
    let storage = Arc::new(FileStorage::open(&config)?);
    tracing::debug!(dir = %storage.dir().display(), "using data directory");

    let store = SessionStore::open(storage.clone());
    let settings = SettingsStore::open(storage, PersistedSettings::from_config(&config));

    let client = Arc::new(WorkflowClient::new(config.api_base.clone()));
    settings.apply_to(&client);

    let engine = ChatEngine::new(client.clone(), store.clone(), config.chat.clone());

    Ok(App {
        config,
        client,
        store,
        settings,
        engine,
    })
}

fn build_request(
    config: &AppConfig,
    input: String,
    workflow: Option<String>,
    timeout: Option<u64>,
) -> WorkflowRequest {
    let workflow = workflow.unwrap_or_else(|| config.chat.workflow.clone());
    WorkflowRequest::new(workflow, input).with_timeout(timeout.unwrap_or(config.chat.timeout_secs))
}

/// Print events until the stream ends; Ctrl-C cancels.
async fn run_stream(app: &App, request: WorkflowRequest) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut events = app.client.stream(request, cancel.clone()).await?;
    while let Some(item) = events.next().await {
        let event = item?;
        output::print_stream_event(&event);
        if event.is_terminal() {
            break;
        }
    }

    if cancel.is_cancelled() {
        eprintln!("\n\x1b[33m[cancelled]\x1b[0m");
    }
    Ok(())
}
