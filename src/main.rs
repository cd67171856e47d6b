mod cli;

use clap::Parser;
use crossterm::style::{Color, Stylize};
use futures::StreamExt;
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cli::{Cli, Command, FilesArgs, LogsArgs};
use tailhub::agent::{AgentClient, AgentResolver, FileEvent, LocalAgent};
use tailhub::config::Config;
use tailhub::identity::{AuthMode, BearerToken, RequestContext};
use tailhub::kubernetes::{ClusterClients, KubeAccessReview, KubeResolver};
use tailhub::permission::{AccessReview, DenyAll, PermissionGuard};
use tailhub::session::{Session, SessionState, SourceResolver};
use tailhub::types::LogRecord;
use tailhub::utils::get_color;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only log records.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Logs(args) => {
            args.apply_to(&mut config);
            run_logs(config, args).await
        }
        Command::Files(args) => {
            args.apply_to(&mut config);
            run_files(config, args).await
        }
    }
}

fn request_context(token: Option<&str>) -> anyhow::Result<RequestContext> {
    let ctx = RequestContext::new();
    if let Some(token) = token.and_then(BearerToken::new) {
        ctx.attach_token(token)?;
    }
    Ok(ctx)
}

fn local_agent(config: &Config, guard: Arc<PermissionGuard>, shutdown: &CancellationToken) -> AgentClient {
    let node = config.node_name();
    let agent = LocalAgent::new(node.clone(), config.log_dir.clone(), guard, shutdown)
        .with_poll(config.poll())
        .with_debounce(config.debounce());
    AgentClient::new(node, config.auth_mode, Arc::new(agent))
}

async fn run_logs(config: Config, args: LogsArgs) -> anyhow::Result<()> {
    let query = args.query()?;
    let grep_regex = match &args.grep {
        Some(pattern) => Some(
            Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid regex pattern '{}': {}", pattern, e))?,
        ),
        None => None,
    };
    let ctx = request_context(args.token.as_deref())?;
    let shutdown = CancellationToken::new();

    // Local files in local mode are the only setup that needs no cluster.
    let clients = if args.node_files && config.auth_mode == AuthMode::Local {
        None
    } else {
        Some(ClusterClients::new(args.context.as_deref()).await?)
    };
    let reviewer: Arc<dyn AccessReview> = match &clients {
        Some(clients) => Arc::new(KubeAccessReview::new(clients.clone())),
        None => Arc::new(DenyAll),
    };
    let guard = Arc::new(PermissionGuard::new(config.auth_mode, reviewer));
    let resolver: Arc<dyn SourceResolver> = match &clients {
        Some(clients) if !args.node_files => Arc::new(KubeResolver::new(
            config.auth_mode,
            clients.clone(),
            clients.name(),
        )),
        _ => Arc::new(AgentResolver::new(vec![local_agent(
            &config,
            guard.clone(),
            &shutdown,
        )])),
    };

    let session = Session::new(
        ctx,
        query,
        guard,
        resolver,
        config.session_options(args.all_or_nothing),
        &shutdown,
    );
    let mut log_rx = session.open().await?;
    info!(session = %session.id(), sources = session.sources().len(), "streaming logs");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, closing session");
                session.close().await;
                break;
            }
            record = log_rx.recv() => match record {
                Some(record) => print_record(&record, grep_regex.as_ref()),
                None => break,
            },
        }
    }
    session.finished().await;
    shutdown.cancel();

    if session.state() == SessionState::Failed {
        if let Some(err) = session.err() {
            anyhow::bail!("Log stream failed: {}", err);
        }
    }
    Ok(())
}

fn print_record(record: &LogRecord, grep: Option<&Regex>) {
    if let Some(regex) = grep
        && !regex.is_match(&record.message)
    {
        return;
    }
    let source = &record.source;
    let color = get_color(&format!("{}/{}", source.node, source.pod));
    let prefix = format!("[{}.{}/{}]", source.node, source.pod, source.container).with(color);
    println!("{} {}", prefix, record.message);
}

async fn run_files(config: Config, args: FilesArgs) -> anyhow::Result<()> {
    let ctx = request_context(args.token.as_deref())?;
    let shutdown = CancellationToken::new();

    let reviewer: Arc<dyn AccessReview> = if config.auth_mode == AuthMode::Local {
        Arc::new(DenyAll)
    } else {
        Arc::new(KubeAccessReview::new(ClusterClients::new(None).await?))
    };
    let guard = Arc::new(PermissionGuard::new(config.auth_mode, reviewer));
    let client = local_agent(&config, guard, &shutdown);

    let mut events = client.watch_files(&ctx, &args.namespaces).await?;
    info!(dir = %config.log_dir.display(), node = %client.node(), "watching log files");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            event = events.next() => match event {
                Some(Ok(event)) => print_file_event(&event),
                Some(Err(status)) => break Err(anyhow::anyhow!("File watch failed: {}", status.message())),
                None => break Ok(()),
            },
        }
    };
    shutdown.cancel();
    result
}

fn print_file_event(event: &FileEvent) {
    let (label, color) = match event {
        FileEvent::Added(_) => ("ADDED", Color::Green),
        FileEvent::Modified(_) => ("MODIFIED", Color::Yellow),
        FileEvent::Deleted(_) => ("DELETED", Color::Red),
    };
    let info = event.info();
    let last = info
        .stat
        .last_event
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<8} {}/{}/{} size={} last={}",
        label.with(color),
        info.file.namespace,
        info.file.pod,
        info.file.container,
        info.stat.size,
        last
    );
}
