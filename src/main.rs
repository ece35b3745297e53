mod app;
mod cli;
mod command;
mod drill;
mod extension;
mod input;
mod k8s;
mod model;
mod nav;
mod resolver;
mod sync;
mod table;
mod ui;
mod views;

use anyhow::{Context, Result};
use app::{App, AppCommand, LogTarget};
use chrono::Local;
use clap::Parser;
use cli::CliArgs;
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use extension::ExtensionRegistry;
use futures::StreamExt;
use k8s::{KubeGateway, compact_error};
use model::{NamespaceScope, ResourceKind, ViewQuery};
use nav::Overlay;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sync::{RedrawSignal, SyncEngine, SyncOutcome};
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use views::ViewRegistry;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;
const FETCH_TIMEOUT: Duration = Duration::from_secs(4);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TICK: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter, args.log_file.as_deref())?;

    let views = Arc::new(ViewRegistry::load().context("failed to load default views")?);
    let gateway = KubeGateway::new(args.context.clone()).await?;
    let kind = ResourceKind::parse(&args.resource)
        .with_context(|| format!("invalid resource `{}`", args.resource))?;
    let scope = resolve_namespace_scope(&args, &gateway);

    if args.all_namespaces && args.namespace.is_some() {
        warn!("both --all-namespaces and --namespace were provided, using all namespaces");
    }
    if let Some(source) = views.source() {
        info!("view overrides loaded from {source}");
    }

    let mut app = App::new(
        Arc::clone(&views),
        ViewQuery::new(kind, scope),
        gateway.cluster().to_string(),
        gateway.context().to_string(),
        gateway.user().to_string(),
    );
    let mut extensions = ExtensionRegistry::with_defaults();
    app.set_extensions(extensions.aliases(), extensions.help_lines());

    run(&mut app, gateway, views, &mut extensions).await
}

fn init_tracing(level_filter: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    let _ = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(std::io::sink).try_init(),
    };

    Ok(())
}

fn resolve_namespace_scope(args: &CliArgs, gateway: &KubeGateway) -> NamespaceScope {
    if args.all_namespaces {
        NamespaceScope::All
    } else if let Some(namespace) = &args.namespace {
        NamespaceScope::from_token(namespace)
    } else {
        NamespaceScope::Named(gateway.default_namespace().to_string())
    }
}

async fn run(
    app: &mut App,
    gateway: KubeGateway,
    views: Arc<ViewRegistry>,
    extensions: &mut ExtensionRegistry,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, gateway, views, extensions).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    mut gateway: KubeGateway,
    views: Arc<ViewRegistry>,
    extensions: &mut ExtensionRegistry,
) -> Result<()> {
    app.set_status("Discovering API resources…");
    terminal
        .draw(|frame| ui::render(frame, app))
        .context("failed to render terminal frame")?;
    refresh_catalog(app, &gateway).await;

    let (redraw, mut redraw_rx) = RedrawSignal::channel();
    let (sync_tx, mut sync_rx) = mpsc::unbounded_channel();
    let mut engine = SyncEngine::new(gateway.clone(), views, redraw, sync_tx);
    engine.start(app.query().clone());
    app.sync_table(engine.snapshot());

    let (copies_tx, mut copies_rx) = mpsc::unbounded_channel::<CopyLogsDone>();

    let mut reader = EventStream::new();
    let mut ticker = interval(STATUS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            terminal
                                .draw(|frame| ui::render(frame, app))
                                .context("failed to render terminal frame")?;
                            execute_app_command(
                                terminal,
                                app,
                                &mut gateway,
                                &mut engine,
                                extensions,
                                &copies_tx,
                                command,
                            )
                            .await?;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            Some(message) = sync_rx.recv() => {
                match engine.handle(message) {
                    SyncOutcome::Ignored => {}
                    SyncOutcome::Updated => app.sync_table(engine.snapshot()),
                    SyncOutcome::ConnectionLost(error) => {
                        debug!(
                            "sync generation {} is {:?}: {error}",
                            engine.generation(),
                            engine.state()
                        );
                        app.sync_table(engine.snapshot());
                        app.set_connection_lost(error);
                    }
                    SyncOutcome::Fatal(error) => {
                        return Err(anyhow::Error::new(error).context("live table lost sync with the cluster"));
                    }
                }
            }
            Some(()) = redraw_rx.recv() => {
                app.sync_table(engine.snapshot());
            }
            Some(done) = copies_rx.recv() => {
                report_copied_logs(app, done);
            }
            _ = ticker.tick() => {
                app.expire_status(Instant::now());
            }
        }
    }

    engine.stop();
    Ok(())
}

async fn execute_app_command(
    terminal: &mut TuiTerminal,
    app: &mut App,
    gateway: &mut KubeGateway,
    engine: &mut SyncEngine,
    extensions: &mut ExtensionRegistry,
    copies: &mpsc::UnboundedSender<CopyLogsDone>,
    command: AppCommand,
) -> Result<()> {
    match command {
        AppCommand::None => {}
        AppCommand::Query(query) => {
            engine.start(query);
            app.sync_table(engine.snapshot());
        }
        AppCommand::Restore(table) => {
            engine.restore(table);
            app.sync_table(engine.snapshot());
        }
        AppCommand::Reconnect => {
            refresh_catalog(app, gateway).await;
            engine.reconnect();
            app.sync_table(engine.snapshot());
        }
        AppCommand::FetchRelated {
            parent,
            selected,
            config,
        } => {
            let fetched = async {
                let raw = timeout(
                    FETCH_TIMEOUT,
                    gateway.get(&parent, selected.namespace(), &selected.name),
                )
                .await
                .with_context(|| format!("fetching {parent} {selected} timed out"))??;
                let namespaced = timeout(FETCH_TIMEOUT, gateway.is_namespaced(&config.target))
                    .await
                    .with_context(|| format!("resolving {} timed out", config.target))??;
                Ok::<_, anyhow::Error>((raw, namespaced))
            }
            .await;

            match fetched.map(|(raw, namespaced)| drill::related_query(&config, &raw, namespaced)) {
                Ok(Ok(query)) => {
                    app.open_query(query.clone());
                    engine.start(query);
                    app.sync_table(engine.snapshot());
                }
                Ok(Err(error)) => app.abort_pending(error.to_string()),
                Err(error) => app.abort_pending_disconnected(compact_error(&error)),
            }
        }
        AppCommand::LoadLogs {
            namespace,
            pod,
            container,
        } => {
            let logs = timeout(
                FETCH_TIMEOUT,
                gateway.pod_logs(&namespace, &pod, container.as_deref()),
            )
            .await
            .context("loading logs timed out")
            .and_then(|result| result);
            match logs {
                Ok(text) => {
                    let title = match container {
                        Some(container) => format!("Logs {namespace}/{pod}:{container}"),
                        None => format!("Logs {namespace}/{pod}"),
                    };
                    app.show_overlay(Overlay::Logs { title, text });
                }
                Err(error) => app.abort_pending_disconnected(compact_error(&error)),
            }
        }
        AppCommand::Describe {
            kind,
            namespace,
            name,
            owning_pod,
        } => {
            let detail = timeout(
                FETCH_TIMEOUT,
                gateway.describe(&kind, namespace.as_deref(), &name, owning_pod.as_deref()),
            )
            .await
            .context("describe timed out")
            .and_then(|result| result);
            match detail {
                Ok(text) => {
                    let title = match namespace {
                        Some(namespace) => format!("Describe {kind} {namespace}/{name}"),
                        None => format!("Describe {kind} {name}"),
                    };
                    app.show_overlay(Overlay::Describe { title, text });
                }
                Err(error) => app.abort_pending_disconnected(compact_error(&error)),
            }
        }
        AppCommand::CopyLogs { pods, directory } => {
            app.set_status(format!("Copying logs of {} pods…", pods.len()));
            let gateway = gateway.clone();
            let copies = copies.clone();
            tokio::spawn(async move {
                let result = copy_pod_logs(&gateway, &pods, &directory).await;
                let _ = copies.send(CopyLogsDone { directory, result });
            });
        }
        AppCommand::SwitchContext(context) => match gateway.switch_context(&context).await {
            Ok(()) => {
                engine.set_gateway(gateway.clone());
                app.set_kube_target(
                    gateway.cluster().to_string(),
                    gateway.context().to_string(),
                    gateway.user().to_string(),
                );
                app.reset_navigation();
                refresh_catalog(app, gateway).await;

                let scope = match app.query().scope {
                    NamespaceScope::All => NamespaceScope::All,
                    NamespaceScope::Named(_) => {
                        NamespaceScope::Named(gateway.default_namespace().to_string())
                    }
                };
                let query = ViewQuery::new(app.query().kind.clone(), scope);
                app.open_query(query.clone());
                engine.start(query);
                app.sync_table(engine.snapshot());
                app.set_status(format!(
                    "Switched context to '{}' ({})",
                    gateway.context(),
                    gateway.cluster()
                ));
            }
            Err(error) => {
                app.set_status(format!("Context switch failed for '{context}': {error:#}"))
            }
        },
        AppCommand::LaunchExtension(alias) => {
            let Some(extension) = extensions.find_mut(&alias) else {
                app.set_status(format!("no extension registered for `{alias}`"));
                return Ok(());
            };
            info!("launching extension {}", extension.name());
            suspend_terminal_for_subprocess(terminal)?;
            let result = tokio::task::block_in_place(|| extension.launch());
            resume_terminal_after_subprocess(terminal)?;
            match result {
                Ok(()) => app.set_status(format!("{} finished", extension.name())),
                Err(error) => app.set_status(format!("{} failed: {error:#}", extension.name())),
            }
            app.sync_table(engine.snapshot());
        }
    }

    Ok(())
}

async fn refresh_catalog(app: &mut App, gateway: &KubeGateway) {
    let contexts = gateway.available_contexts();
    match timeout(DISCOVERY_TIMEOUT, gateway.discover_kinds()).await {
        Ok(Ok(resources)) => {
            info!("discovered {} resource kinds", resources.len());
            app.set_catalog(resources, contexts);
        }
        Ok(Err(error)) => {
            warn!("API discovery failed: {error:#}");
            app.set_catalog(Vec::new(), contexts);
            app.set_status(format!("API discovery failed: {}", compact_error(&error)));
        }
        Err(_) => {
            warn!("API discovery timed out");
            app.set_catalog(Vec::new(), contexts);
            app.set_status("API discovery timed out");
        }
    }
}

#[derive(Debug)]
enum CopyLogsError {
    Cluster(anyhow::Error),
    Write(anyhow::Error),
}

struct CopyLogsDone {
    directory: PathBuf,
    result: Result<usize, CopyLogsError>,
}

fn report_copied_logs(app: &mut App, done: CopyLogsDone) {
    match done.result {
        Ok(written) => app.set_status(format!(
            "Saved {written} log files to {} at {}",
            done.directory.display(),
            Local::now().format("%H:%M:%S")
        )),
        Err(CopyLogsError::Cluster(error)) => {
            let error = compact_error(&error);
            app.set_connection_lost(error.clone());
            app.set_status(format!("cplogs failed: {error}"));
        }
        Err(CopyLogsError::Write(error)) => {
            app.set_status(format!("cplogs failed: {}", compact_error(&error)))
        }
    }
}

/// Writes `<namespace>_<pod>.log` per pod, one section per container.
/// Every cluster call is bounded by [`FETCH_TIMEOUT`].
async fn copy_pod_logs(
    gateway: &KubeGateway,
    pods: &[LogTarget],
    directory: &Path,
) -> Result<usize, CopyLogsError> {
    tokio::fs::create_dir_all(directory)
        .await
        .with_context(|| format!("failed to create {}", directory.display()))
        .map_err(CopyLogsError::Write)?;

    let mut written = 0;
    for target in pods {
        let containers = timeout(
            FETCH_TIMEOUT,
            gateway.pod_container_names(&target.namespace, &target.pod),
        )
        .await
        .with_context(|| format!("fetching pod {} timed out", target.pod))
        .and_then(|result| result)
        .map_err(CopyLogsError::Cluster)?;

        let mut body = String::new();
        for container in containers {
            let logs = timeout(
                FETCH_TIMEOUT,
                gateway.pod_logs(&target.namespace, &target.pod, Some(&container)),
            )
            .await
            .with_context(|| format!("loading logs of {}/{container} timed out", target.pod))
            .and_then(|result| result)
            .map_err(CopyLogsError::Cluster)?;
            body.push_str(&format!("==> {container} <==\n"));
            body.push_str(&logs);
            if !logs.ends_with('\n') {
                body.push('\n');
            }
        }

        let path = directory.join(format!("{}_{}.log", target.namespace, target.pod));
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
            .map_err(CopyLogsError::Write)?;
        debug!("wrote {}", path.display());
        written += 1;
    }
    Ok(written)
}

fn suspend_terminal_for_subprocess(terminal: &mut TuiTerminal) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode for subprocess")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen for subprocess")?;
    terminal
        .show_cursor()
        .context("failed to show cursor for subprocess")?;
    Ok(())
}

fn resume_terminal_after_subprocess(terminal: &mut TuiTerminal) -> Result<()> {
    enable_raw_mode().context("failed to re-enable raw mode after subprocess")?;
    execute!(terminal.backend_mut(), EnterAlternateScreen)
        .context("failed to re-enter alternate screen after subprocess")?;
    terminal
        .clear()
        .context("failed to clear terminal after subprocess")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CopyLogsDone, CopyLogsError, report_copied_logs};
    use crate::app::App;
    use crate::model::{NamespaceScope, ResourceKind, ViewQuery};
    use crate::views::ViewRegistry;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn app() -> App {
        let views = ViewRegistry::from_yaml(include_str!("views.yaml"), "embedded").unwrap();
        App::new(
            Arc::new(views),
            ViewQuery::new(ResourceKind::pods(), NamespaceScope::All),
            "cluster".to_string(),
            "context".to_string(),
            "admin".to_string(),
        )
    }

    fn done(result: Result<usize, CopyLogsError>) -> CopyLogsDone {
        CopyLogsDone {
            directory: PathBuf::from("/tmp/logs"),
            result,
        }
    }

    #[test]
    fn copied_logs_report_their_count() {
        let mut app = app();
        report_copied_logs(&mut app, done(Ok(3)));
        assert!(app.status().starts_with("Saved 3 log files to /tmp/logs at "));
        assert!(app.connection_error().is_none());
    }

    #[test]
    fn cluster_failure_during_copy_marks_connection_lost() {
        let mut app = app();
        let error = anyhow::anyhow!("loading logs of web-0/app timed out");
        report_copied_logs(&mut app, done(Err(CopyLogsError::Cluster(error))));
        assert!(app.status().starts_with("cplogs failed: "));
        assert!(app.connection_error().is_some());
    }

    #[test]
    fn write_failure_during_copy_stays_transient() {
        let mut app = app();
        let error = anyhow::anyhow!("failed to write /tmp/logs/shop_web-0.log");
        report_copied_logs(&mut app, done(Err(CopyLogsError::Write(error))));
        assert!(app.status().starts_with("cplogs failed: "));
        assert!(app.connection_error().is_none());
    }
}
