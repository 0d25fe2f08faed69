mod agent;
mod client;
mod compress;
mod config;
mod context;
mod error;
mod estimator;
mod ipc;
mod messages;
mod modelmap;
mod orchestrator;
mod permissions;
mod rag;
mod session;
mod tools;
mod ui;
mod worker;
mod worktree;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use config::{ConfigFile, ProjectConfig, ResolvedConfig};

#[derive(Parser, Debug)]
#[command(
    name = "codi",
    about = "A terminal coding agent with a background code index and isolated child agents",
    long_about = None,
)]
struct Args {
    /// Task to run (omit with --index/--watch to only maintain the index)
    task: Option<String>,

    /// Profile to use from config file
    #[arg(short, long, env = "CODI_PROFILE")]
    profile: Option<String>,

    /// Override endpoint URL
    #[arg(long, env = "CODI_ENDPOINT")]
    endpoint: Option<String>,

    /// Override model name
    #[arg(short, long, env = "CODI_MODEL")]
    model: Option<String>,

    /// Override API key
    #[arg(long, env = "CODI_API_KEY")]
    api_key: Option<String>,

    /// Auto-approve non-dangerous tool calls without prompting
    #[arg(short, long)]
    yes: bool,

    /// Run a full index of the project before (or instead of) the task
    #[arg(long)]
    index: bool,

    /// Keep watching for file changes and index incrementally
    #[arg(long)]
    watch: bool,

    /// Spawn a worker child agent: "branch:task" (repeatable)
    #[arg(long = "worker", value_name = "BRANCH:TASK")]
    workers: Vec<String>,

    /// Spawn a read-only reader child agent with the given task (repeatable)
    #[arg(long = "reader", value_name = "TASK")]
    readers: Vec<String>,

    /// Base branch for worker worktrees
    #[arg(long, default_value = "main")]
    base_branch: String,

    /// Resume the most recently updated session
    #[arg(long)]
    resume: bool,

    /// Session name to save this conversation under
    #[arg(long)]
    session: Option<String>,

    /// Model map YAML (used when embeddingProvider is "modelmap")
    #[arg(long, value_name = "PATH")]
    model_map: Option<PathBuf>,

    // ── Child mode (internal, set by the orchestrator) ────────────────────────
    #[arg(long, hide = true)]
    child_worker: bool,
    #[arg(long, hide = true)]
    child_reader: bool,
    #[arg(long, hide = true)]
    child_id: Option<String>,
    #[arg(long, hide = true)]
    child_task: Option<String>,
    #[arg(long, hide = true, env = "CODI_SOCKET")]
    socket: Option<PathBuf>,
    #[arg(long, hide = true)]
    worktree: Option<PathBuf>,
    #[arg(long, hide = true)]
    branch: Option<String>,
    #[arg(long, hide = true)]
    scope: Option<PathBuf>,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

#[tokio::main]
async fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let file = ConfigFile::load()?;
    let resolved = ResolvedConfig::resolve(
        &file,
        args.profile.as_deref(),
        args.endpoint.as_deref(),
        args.model.as_deref(),
        args.api_key.as_deref(),
    );

    // ── Child mode ────────────────────────────────────────────────────────────
    if args.child_worker || args.child_reader {
        let child_args = worker::ChildArgs {
            socket: args
                .socket
                .clone()
                .ok_or_else(|| anyhow!("child mode requires --socket"))?,
            child_id: args
                .child_id
                .clone()
                .ok_or_else(|| anyhow!("child mode requires --child-id"))?,
            task: args
                .child_task
                .clone()
                .ok_or_else(|| anyhow!("child mode requires --child-task"))?,
            reader: args.child_reader,
            branch: args.branch.clone(),
            base_branch: if args.child_worker { Some(args.base_branch.clone()) } else { None },
            worktree: args.worktree.clone(),
            scope: args.scope.clone(),
        };
        return worker::child_main(child_args, &resolved).await;
    }

    // ── Parent mode ───────────────────────────────────────────────────────────
    let project_root = std::env::current_dir()?;
    let project = ProjectConfig::load(&project_root)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let (ui_tx, ui_rx) = ui::channel();
    let console = tokio::spawn(ui::run_console(ui_rx, args.yes));

    // ── RAG pipeline ──────────────────────────────────────────────────────────
    let wants_index = args.index || args.watch || project.auto_index || project.watch_files;
    let retriever = if wants_index {
        Some(build_index(&args, &project, &project_root, &ui_tx, &cancel).await?)
    } else {
        None
    };

    if args.task.is_none() && args.workers.is_empty() && args.readers.is_empty() {
        if !wants_index {
            bail!("nothing to do: pass a task, --worker/--reader, or --index");
        }
        // Index-only invocation; watch mode runs until interrupted.
        if args.watch || project.watch_files {
            cancel.cancelled().await;
            drop(ui_tx);
            let _ = console.await;
            return Ok(130);
        }
        cancel.cancel();
        drop(ui_tx);
        let _ = console.await;
        return Ok(0);
    }

    // ── Orchestrator mode ─────────────────────────────────────────────────────
    if !args.workers.is_empty() || !args.readers.is_empty() {
        let code = run_orchestrator(&args, ui_tx.clone(), &cancel).await?;
        cancel.cancel();
        drop(ui_tx);
        let _ = console.await;
        return Ok(code);
    }

    // ── Single-agent mode ─────────────────────────────────────────────────────
    let task = args.task.clone().expect("checked above");
    let provider: Arc<dyn client::ModelProvider> = Arc::new(
        client::Client::new(resolved.endpoint.clone(), resolved.model.clone())
            .with_api_key(resolved.api_key.clone())
            .with_retry(client::RetryPolicy {
                request_timeout: std::time::Duration::from_secs(resolved.request_timeout_secs),
                ..client::RetryPolicy::default()
            }),
    );

    let permissions = Arc::new(permissions::PermissionEngine::new(
        &project.approval_patterns,
        &project.dangerous_patterns,
    ));
    let mut registry = tools::ToolRegistry::standard();
    if let Some(r) = &retriever {
        registry = registry
            .to_builder()
            .register(Arc::new(rag::retriever::CodeSearchTool::new(r.clone())))
            .build();
    }
    let mut agent = agent::Agent::new(agent::AgentOptions {
        provider,
        registry,
        permissions,
        gateway: Arc::new(agent::UiGateway::new(ui_tx.clone())),
        context: context::ContextManager::new(context::ContextBudget::for_window(
            resolved.context_tokens,
        )),
        retriever,
        ui_tx: ui_tx.clone(),
        system_prompt: system_prompt(&project_root),
        cancel: cancel.clone(),
        scope: None,
    });

    // Resume or start the session.
    let session_name = args.session.clone().or_else(|| {
        args.resume.then(session::latest_session).flatten()
    });
    let mut session_file = match &session_name {
        Some(name) => {
            let path = session::session_path(name);
            if path.exists() {
                let loaded = session::SessionFile::load(&path)?;
                agent.load_messages(loaded.messages.clone());
                loaded
            } else {
                session::SessionFile::new(name, project_name(&project_root))
            }
        }
        None => session::SessionFile::new(
            &format!("{}", chrono::Utc::now().timestamp()),
            project_name(&project_root),
        ),
    };

    let outcome = agent.run_turn(&task).await;

    let report = agent.context_report();
    tracing::debug!(
        total = report.total_tokens,
        max = report.max_tokens,
        status = ?report.status,
        "post-turn context"
    );

    let code = match outcome {
        Ok(outcome) => {
            session_file.model = Some(resolved.model.clone());
            session_file.messages = agent.messages().to_vec();
            match session_file.save(&session::session_path(&session_file.name)) {
                Ok(()) => {
                    let _ = ui_tx.send(ui::UiEvent::Info(format!(
                        "session saved as {}",
                        session_file.name
                    )));
                }
                Err(e) => tracing::warn!(error = %e, "failed to save session"),
            }
            if outcome.cancelled { 130 } else { 0 }
        }
        Err(e) => {
            let _ = ui_tx.send(ui::UiEvent::AgentError(e.to_string()));
            1
        }
    };

    drop(agent);
    cancel.cancel();
    drop(ui_tx);
    let _ = console.await;
    Ok(code)
}

/// Stand up the vector store, run a scan, and wire the watcher if asked.
async fn build_index(
    args: &Args,
    project: &ProjectConfig,
    root: &std::path::Path,
    ui_tx: &ui::UiSender,
    cancel: &CancellationToken,
) -> Result<Arc<rag::retriever::Retriever>> {
    let map = match &args.model_map {
        Some(path) => Some(modelmap::ModelMap::load(path)?),
        None => None,
    };
    let embedder: Arc<dyn rag::embed::EmbeddingProvider> =
        Arc::from(rag::embed::from_config(project, map.as_ref())?);

    let store_dir = config::index_dir(root);
    let cache_path = config::index_cache_path(root);
    let (store, rebuilt) =
        rag::indexer::open_store_or_rebuild(&store_dir, &cache_path, &embedder.identity())?;
    if rebuilt {
        let _ = ui_tx.send(ui::UiEvent::IndexStatus("index was unusable — rebuilt from scratch".into()));
    }
    let store = Arc::new(store);

    let errors_tx = ui_tx.clone();
    let indexer = Arc::new(
        rag::indexer::Indexer::new(
            rag::indexer::IndexerConfig {
                root: root.to_path_buf(),
                include_patterns: project.include_patterns.clone(),
                exclude_patterns: project.exclude_patterns.clone(),
                parallel_jobs: project.parallel_jobs_clamped(),
                cache_path,
            },
            store.clone(),
            embedder.clone(),
        )
        .with_on_error(Box::new(move |path, err| {
            let _ = errors_tx.send(ui::UiEvent::IndexStatus(format!(
                "skipped {}: {err}",
                path.display()
            )));
        })),
    );

    let report = indexer.full_scan().await?;
    let stats = store.stats().await;
    let _ = ui_tx.send(ui::UiEvent::IndexStatus(format!(
        "{} files scanned, {} indexed, {} removed, {} chunks total",
        report.candidates, report.indexed, report.removed, stats.item_count
    )));

    if args.watch || project.watch_files {
        match rag::watcher::FileWatcher::start(root) {
            Some((watcher, mut batches)) => {
                let watch_indexer = indexer.clone();
                let watch_ui = ui_tx.clone();
                let watch_cancel = cancel.clone();
                tokio::spawn(async move {
                    let _watcher = watcher;
                    loop {
                        tokio::select! {
                            batch = batches.recv() => match batch {
                                Some(paths) => {
                                    match watch_indexer.process_events(&paths).await {
                                        Ok(report) if report.indexed + report.removed > 0 => {
                                            let _ = watch_ui.send(ui::UiEvent::IndexStatus(format!(
                                                "updated {} files, removed {}",
                                                report.indexed, report.removed
                                            )));
                                        }
                                        Ok(_) => {}
                                        Err(e) => {
                                            tracing::warn!(error = %e, "watch update failed");
                                        }
                                    }
                                }
                                None => break,
                            },
                            _ = watch_cancel.cancelled() => break,
                        }
                    }
                });
            }
            None => {
                let _ = ui_tx.send(ui::UiEvent::IndexStatus(
                    "file watching unavailable on this platform — disabled".into(),
                ));
            }
        }
    }

    Ok(Arc::new(rag::retriever::Retriever::new(
        store,
        embedder,
        project.top_k,
        project.min_score,
    )))
}

/// Spawn the requested workers/readers and wait for all of them.
async fn run_orchestrator(
    args: &Args,
    ui_tx: ui::UiSender,
    cancel: &CancellationToken,
) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let repo_root = worktree::WorktreeManager::discover(&cwd)
        .ok_or_else(|| anyhow!("--worker requires a git repository"))?;
    let worktrees = Arc::new(worktree::WorktreeManager::new(
        repo_root.clone(),
        repo_root.join(".codi").join("worktrees"),
    ));

    let socket = ipc::socket_path(std::process::id());
    let orchestrator = orchestrator::Orchestrator::start(worktrees, ui_tx, socket).await?;

    for (i, spec) in args.workers.iter().enumerate() {
        let (branch, task) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("--worker expects BRANCH:TASK, got '{spec}'"))?;
        orchestrator
            .spawn_worker(orchestrator::WorkerConfig {
                id: format!("worker-{}", i + 1),
                branch: branch.to_string(),
                task: task.to_string(),
                base_branch: args.base_branch.clone(),
                model: None,
                auto_approve_tools: Vec::new(),
            })
            .await?;
    }
    for (i, task) in args.readers.iter().enumerate() {
        orchestrator
            .spawn_reader(orchestrator::ReaderConfig {
                id: format!("reader-{}", i + 1),
                task: task.clone(),
                scope: None,
                model: None,
                auto_approve_tools: Vec::new(),
            })
            .await?;
    }

    // Cancel fans out to every child; wait_all still reaps them after.
    let cancel_watch = cancel.clone();
    let orch_for_cancel = orchestrator.clone();
    tokio::spawn(async move {
        cancel_watch.cancelled().await;
        for child in orch_for_cancel.list_children().await {
            orch_for_cancel.cancel(&child.id, "interrupted").await;
        }
    });

    orchestrator.wait_all().await;

    let mut failed = false;
    for child in orchestrator.list_children().await {
        if let Some(result) = orchestrator.take_result(&child.id).await {
            if !result.success {
                failed = true;
            }
        }
    }
    if cancel.is_cancelled() {
        Ok(130)
    } else if failed {
        Ok(1)
    } else {
        Ok(0)
    }
}

fn system_prompt(root: &std::path::Path) -> String {
    let mut prompt = String::from(
        "You are codi, a focused coding assistant. You help with software \
engineering tasks by using the available tools.\n\n\
Guidelines:\n\
- Read files before editing them\n\
- Use edit_file for existing files; write_file only creates new ones\n\
- Verify changes compile or pass tests before declaring done\n\
- When a task is complete, say so clearly and stop calling tools",
    );
    if let Some(name) = project_name(root) {
        prompt.push_str(&format!("\n\nProject: {name}"));
    }
    prompt
}

fn project_name(root: &std::path::Path) -> Option<String> {
    root.file_name().map(|n| n.to_string_lossy().into_owned())
}
