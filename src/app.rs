use crate::command::{self, Command, History, SuggestionTree};
use crate::drill::{self, DrillPlan};
use crate::input::Action;
use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
use crate::nav::{Memento, NavigationStack, Overlay};
use crate::table::{ResourceTable, Row};
use crate::views::{DrillConfig, ViewRegistry};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub const STATUS_TTL: Duration = Duration::from_secs(5);

const BUILTIN_HELP: [&str; 8] = [
    "resource|rs <kind>[/<version>] [-n <ns>|<ns>|all]   switch view",
    "describe|desc                                    YAML of the selected row",
    "cplogs|cp [all] [<dir>]                          save logs of this page (or all rows)",
    "ctx|context <name>                               switch kubeconfig context",
    "reconnect|r                                      restart list and watch",
    "help|h                                           this help",
    "quit|q                                           exit",
    "keys: j/k move  PgUp/PgDn page  Enter drill  d describe  Esc back  : command",
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Command,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogTarget {
    pub namespace: String,
    pub pod: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    None,
    Query(ViewQuery),
    Restore(ResourceTable),
    Reconnect,
    FetchRelated {
        parent: ResourceKind,
        selected: RowIdentity,
        config: DrillConfig,
    },
    LoadLogs {
        namespace: String,
        pod: String,
        container: Option<String>,
    },
    Describe {
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        owning_pod: Option<String>,
    },
    CopyLogs {
        pods: Vec<LogTarget>,
        directory: PathBuf,
    },
    SwitchContext(String),
    LaunchExtension(String),
}

pub struct App {
    running: bool,
    mode: InputMode,
    views: Arc<ViewRegistry>,
    table: ResourceTable,
    cursor: usize,
    page: usize,
    page_size: usize,
    pending_g: bool,
    nav: NavigationStack,
    overlay: Option<Overlay>,
    overlay_scroll: u16,
    overlay_view_width: u16,
    overlay_view_height: u16,
    last_error: Option<String>,
    status: String,
    status_expires: Option<Instant>,
    show_help: bool,
    input: String,
    suggestion_index: usize,
    suggestions: SuggestionTree,
    history: History,
    resources: Vec<String>,
    contexts: Vec<String>,
    extensions: Vec<String>,
    extension_help: Vec<String>,
    cluster: String,
    context: String,
    user: String,
}

impl App {
    pub fn new(
        views: Arc<ViewRegistry>,
        query: ViewQuery,
        cluster: String,
        context: String,
        user: String,
    ) -> Self {
        let titles = views.titles(&query.kind.resource);
        Self {
            running: true,
            mode: InputMode::Normal,
            views,
            table: ResourceTable::new(query, titles),
            cursor: 0,
            page: 0,
            page_size: 10,
            pending_g: false,
            nav: NavigationStack::default(),
            overlay: None,
            overlay_scroll: 0,
            overlay_view_width: 80,
            overlay_view_height: 20,
            last_error: None,
            status: "Ready".to_string(),
            status_expires: None,
            show_help: false,
            input: String::new(),
            suggestion_index: 0,
            suggestions: SuggestionTree::default(),
            history: History::default(),
            resources: Vec::new(),
            contexts: Vec::new(),
            extensions: Vec::new(),
            extension_help: Vec::new(),
            cluster,
            context,
            user,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    pub fn query(&self) -> &ViewQuery {
        self.table.query()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    pub fn overlay_scroll(&self) -> u16 {
        self.overlay_scroll
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn page(&self) -> usize {
        self.page
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn page_count(&self) -> usize {
        self.table.len().div_ceil(self.page_size).max(1)
    }

    pub fn breadcrumb(&self) -> Vec<(String, String)> {
        self.nav.breadcrumb()
    }

    pub fn nav_depth(&self) -> usize {
        self.nav.len()
    }

    pub fn can_drill_down(&self) -> bool {
        drill::can_drill_down(self.table.kind(), &self.views)
    }

    /// Rows of the current page.
    pub fn page_rows(&self) -> &[Row] {
        &self.table.rows()[self.page_bounds()]
    }

    fn page_bounds(&self) -> Range<usize> {
        let len = self.table.len();
        let start = (self.page * self.page_size).min(len);
        start..(start + self.page_size).min(len)
    }

    /// Cursor position within [`Self::page_rows`].
    pub fn selected_in_page(&self) -> Option<usize> {
        self.selected_index()
            .map(|index| index.saturating_sub(self.page * self.page_size))
    }

    pub fn selected_identity(&self) -> Option<RowIdentity> {
        self.selected_index()
            .and_then(|index| self.table.identity_at(index))
    }

    pub fn suggestions(&self) -> Vec<String> {
        if self.mode != InputMode::Command {
            return Vec::new();
        }
        self.suggestions.suggestions(&self.input)
    }

    pub fn suggestion_index(&self) -> usize {
        self.suggestion_index
    }

    pub fn help_lines(&self) -> Vec<String> {
        BUILTIN_HELP
            .iter()
            .map(|line| line.to_string())
            .chain(self.extension_help.iter().cloned())
            .collect()
    }

    pub fn set_kube_target(&mut self, cluster: String, context: String, user: String) {
        self.cluster = cluster;
        self.context = context;
        self.user = user;
    }

    /// Rebuilds command completion from the discovered names.
    pub fn set_catalog(&mut self, resources: Vec<String>, contexts: Vec<String>) {
        self.resources = resources;
        self.contexts = contexts;
        self.rebuild_suggestions();
    }

    pub fn set_extensions(&mut self, aliases: Vec<String>, help: Vec<String>) {
        self.extensions = aliases;
        self.extension_help = help;
        self.rebuild_suggestions();
    }

    fn rebuild_suggestions(&mut self) {
        let mut resources = self.resources.clone();
        resources.push(ResourceKind::CONTEXTS.to_string());
        self.suggestions = SuggestionTree::build(&resources, &self.contexts, &self.extensions);
    }

    pub fn set_page_size(&mut self, rows: usize) {
        let selected = self.selected_index();
        self.page_size = rows.max(1);
        if let Some(index) = selected {
            self.select_index(index);
        }
    }

    pub fn set_overlay_viewport(&mut self, width: u16, height: u16) {
        self.overlay_view_width = width.max(1);
        self.overlay_view_height = height.max(1);
        self.overlay_scroll = self.overlay_scroll.min(self.overlay_max_scroll());
    }

    /// Adopts a fresh snapshot, keeping the selected object selected.
    pub fn sync_table(&mut self, table: ResourceTable) {
        if table.query() != self.table.query() {
            self.table = table;
            self.cursor = 0;
            self.page = 0;
            return;
        }
        let selected = self.selected_identity();
        let previous = self.selected_index();
        self.table = table;
        match selected.and_then(|identity| self.table.position_of(&identity)) {
            Some(index) => self.select_index(index),
            None => self.select_index(previous.unwrap_or(0)),
        }
    }

    /// Transient message, cleared by [`Self::expire_status`].
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
        self.status_expires = Some(Instant::now() + STATUS_TTL);
    }

    pub fn expire_status(&mut self, now: Instant) {
        if self.status_expires.is_some_and(|deadline| now >= deadline) {
            self.status.clear();
            self.status_expires = None;
        }
    }

    pub fn set_connection_lost(&mut self, error: impl Into<String>) {
        self.last_error = Some(summarize_error_line(&error.into()));
    }

    pub fn show_overlay(&mut self, overlay: Overlay) {
        self.set_status(format!("{} (Esc to close)", overlay.title()));
        self.overlay = Some(overlay);
        self.overlay_scroll = 0;
    }

    /// Enters a view reached from a fetched parent object.
    pub fn open_query(&mut self, query: ViewQuery) {
        let titles = self.views.titles(&query.kind.resource);
        self.table = ResourceTable::new(query, titles);
        self.cursor = 0;
        self.page = 0;
        self.overlay = None;
    }

    /// Undoes the memento pushed for a drill or overlay that could not load.
    pub fn abort_pending(&mut self, error: impl Into<String>) {
        if let Some(memento) = self.nav.pop() {
            self.cursor = memento.cursor;
            self.page = memento.page;
            self.overlay = memento.overlay.clone();
        }
        self.set_status(summarize_error_line(&error.into()));
    }

    /// [`Self::abort_pending`] for a failed cluster call, which also leaves
    /// the connection marked unhealthy.
    pub fn abort_pending_disconnected(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.set_connection_lost(error.clone());
        self.abort_pending(error);
    }

    /// After a context switch nothing on the stack belongs to the new cluster.
    pub fn reset_navigation(&mut self) {
        self.nav.clear();
        self.overlay = None;
        self.last_error = None;
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if !matches!(action, Action::GPrefix) {
            self.pending_g = false;
        }

        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
            if matches!(action, Action::Back) {
                return AppCommand::None;
            }
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Action::Down => {
                self.move_or_scroll(1);
                AppCommand::None
            }
            Action::Up => {
                self.move_or_scroll(-1);
                AppCommand::None
            }
            Action::PageDown => {
                self.move_or_scroll(self.page_step());
                AppCommand::None
            }
            Action::PageUp => {
                self.move_or_scroll(-self.page_step());
                AppCommand::None
            }
            Action::Top => {
                self.jump_to_top();
                AppCommand::None
            }
            Action::Bottom => {
                if self.overlay.is_some() {
                    self.overlay_scroll = self.overlay_max_scroll();
                } else {
                    self.select_index(self.table.len().saturating_sub(1));
                }
                AppCommand::None
            }
            Action::GPrefix => {
                if self.pending_g {
                    self.pending_g = false;
                    self.jump_to_top();
                } else {
                    self.pending_g = true;
                }
                AppCommand::None
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::EnterResource => self.drill_down(),
            Action::Describe => self.describe_selected(),
            Action::Back => self.go_back(),
            Action::StartCommand => {
                self.mode = InputMode::Command;
                self.input.clear();
                self.suggestion_index = 0;
                self.history.reset();
                AppCommand::None
            }
            Action::SubmitInput => {
                let line = self.input.trim().to_string();
                self.mode = InputMode::Normal;
                self.input.clear();
                self.suggestion_index = 0;
                self.execute_command_line(&line)
            }
            Action::CompleteInput => {
                self.apply_completion();
                AppCommand::None
            }
            Action::NextSuggestion => {
                self.bump_suggestion(1);
                AppCommand::None
            }
            Action::PrevSuggestion => {
                self.bump_suggestion(-1);
                AppCommand::None
            }
            Action::HistoryOlder => {
                if let Some(line) = self.history.older().map(str::to_string) {
                    self.input = line;
                    self.suggestion_index = 0;
                }
                AppCommand::None
            }
            Action::HistoryNewer => {
                self.input = self.history.newer().map(str::to_string).unwrap_or_default();
                self.suggestion_index = 0;
                AppCommand::None
            }
            Action::CancelInput => {
                self.mode = InputMode::Normal;
                self.input.clear();
                self.suggestion_index = 0;
                self.history.reset();
                AppCommand::None
            }
            Action::Backspace => {
                self.input.pop();
                self.suggestion_index = 0;
                AppCommand::None
            }
            Action::DeleteWord => {
                while self.input.ends_with(' ') {
                    self.input.pop();
                }
                while !self.input.ends_with(' ') && !self.input.is_empty() {
                    self.input.pop();
                }
                self.suggestion_index = 0;
                AppCommand::None
            }
            Action::InputChar(c) => {
                self.input.push(c);
                self.suggestion_index = 0;
                AppCommand::None
            }
        }
    }

    fn drill_down(&mut self) -> AppCommand {
        if self.overlay.is_some() {
            return AppCommand::None;
        }
        let selected = self.selected_identity();
        let plan = match drill::plan(
            self.table.query(),
            selected.as_ref(),
            &self.nav,
            &self.views,
        ) {
            Ok(plan) => plan,
            Err(error) => {
                self.set_status(error.to_string());
                return AppCommand::None;
            }
        };

        self.push_memento();
        match plan {
            DrillPlan::Query(query) => {
                self.open_query(query.clone());
                AppCommand::Query(query)
            }
            DrillPlan::Logs {
                namespace,
                pod,
                container,
            } => {
                self.set_status(format!("Loading logs for {namespace}/{pod}"));
                AppCommand::LoadLogs {
                    namespace,
                    pod,
                    container,
                }
            }
            DrillPlan::Related {
                parent,
                selected,
                config,
            } => {
                self.set_status(format!("Following {parent} {selected}"));
                AppCommand::FetchRelated {
                    parent,
                    selected,
                    config,
                }
            }
        }
    }

    fn describe_selected(&mut self) -> AppCommand {
        if self.overlay.is_some() {
            return AppCommand::None;
        }
        let kind = self.table.kind().clone();
        if kind.is(ResourceKind::CONTEXTS) {
            self.set_status("contexts cannot be described");
            return AppCommand::None;
        }
        let Some(selected) = self.selected_identity() else {
            self.set_status("no row selected");
            return AppCommand::None;
        };
        let namespace = selected
            .namespace()
            .or_else(|| self.table.scope().namespace())
            .map(str::to_string);
        let owning_pod = self.table.query().owning_pod().map(str::to_string);

        self.push_memento();
        AppCommand::Describe {
            kind,
            namespace,
            name: selected.name,
            owning_pod,
        }
    }

    fn go_back(&mut self) -> AppCommand {
        let Some(memento) = self.nav.pop() else {
            self.set_status("Already at the first view");
            return AppCommand::None;
        };

        let same_view = memento.query() == self.table.query();
        self.cursor = memento.cursor;
        self.page = memento.page;
        self.overlay = memento.overlay.clone();
        self.overlay_scroll = 0;
        if same_view {
            return AppCommand::None;
        }

        if let Some(error) = &memento.last_error {
            debug!("restoring {} saved while disconnected: {error}", memento.kind());
        }
        self.table = memento.table.clone();
        AppCommand::Restore(memento.table)
    }

    fn push_memento(&mut self) {
        self.nav.push(Memento {
            table: self.table.clone(),
            cursor: self.cursor,
            page: self.page,
            last_error: self.last_error.clone(),
            overlay: self.overlay.clone(),
            selected: self.selected_identity(),
        });
    }

    fn execute_command_line(&mut self, line: &str) -> AppCommand {
        self.history.record(line);
        let parsed = match command::parse(line, &self.extensions) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.set_status(error.to_string());
                return AppCommand::None;
            }
        };

        match parsed {
            Command::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Command::Reconnect => {
                self.last_error = None;
                self.set_status(format!("Reconnecting {}", self.table.kind()));
                AppCommand::Reconnect
            }
            Command::Resource { token, scope } => self.switch_resource(&token, scope),
            Command::Describe => self.describe_selected(),
            Command::CopyLogs { all, path } => self.copy_logs(all, path),
            Command::Help => {
                self.show_help = true;
                AppCommand::None
            }
            Command::Context(context) => {
                if !self.contexts.iter().any(|known| known == &context) {
                    self.set_status(format!("unknown context `{context}`"));
                    return AppCommand::None;
                }
                self.set_status(format!("Switching to context {context}"));
                AppCommand::SwitchContext(context)
            }
            Command::Extension(alias) => AppCommand::LaunchExtension(alias),
        }
    }

    fn switch_resource(&mut self, token: &str, scope: Option<NamespaceScope>) -> AppCommand {
        let kind = if self.resources.is_empty() {
            ResourceKind::parse(token)
        } else {
            command::resolve_resource(token, &self.resources)
        };
        let Some(kind) = kind else {
            self.set_status(format!("unknown resource `{token}`"));
            return AppCommand::None;
        };
        if kind.is(ResourceKind::CONTAINERS) {
            self.set_status("containers are opened from a pod with Enter");
            return AppCommand::None;
        }

        let scope = scope.unwrap_or_else(|| self.table.scope().clone());
        let query = ViewQuery::new(kind, scope);
        self.nav.clear();
        self.open_query(query.clone());
        self.set_status(format!("Viewing {} in {}", query.kind, query.scope));
        AppCommand::Query(query)
    }

    fn copy_logs(&mut self, all: bool, path: Option<PathBuf>) -> AppCommand {
        let query = self.table.query();
        let pods = if query.kind.is(ResourceKind::PODS) {
            let identities = if all {
                self.table.identities()
            } else {
                &self.table.identities()[self.page_bounds()]
            };
            identities
                .iter()
                .cloned()
                .filter_map(|identity| {
                    let namespace = identity
                        .namespace()
                        .or_else(|| query.scope.namespace())?
                        .to_string();
                    Some(LogTarget {
                        namespace,
                        pod: identity.name,
                    })
                })
                .collect::<Vec<_>>()
        } else if query.kind.is(ResourceKind::CONTAINERS) {
            query
                .owning_pod()
                .zip(query.scope.namespace())
                .map(|(pod, namespace)| LogTarget {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                })
                .into_iter()
                .collect()
        } else {
            self.set_status("cplogs works in the pods and containers views");
            return AppCommand::None;
        };

        if pods.is_empty() {
            self.set_status("no pods to copy logs from");
            return AppCommand::None;
        }
        AppCommand::CopyLogs {
            pods,
            directory: path.unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    fn bump_suggestion(&mut self, direction: isize) {
        let count = self.suggestions().len();
        if count == 0 {
            self.suggestion_index = 0;
            return;
        }
        self.suggestion_index =
            (self.suggestion_index as isize + direction).rem_euclid(count as isize) as usize;
    }

    fn apply_completion(&mut self) {
        let suggestions = self.suggestions();
        let index = self.suggestion_index.min(suggestions.len().saturating_sub(1));
        if let Some(choice) = suggestions.get(index) {
            self.input = SuggestionTree::complete(&self.input, choice);
            self.suggestion_index = 0;
        }
    }

    fn selected_index(&self) -> Option<usize> {
        if self.table.is_empty() {
            return None;
        }
        Some((self.page * self.page_size + self.cursor).min(self.table.len() - 1))
    }

    fn select_index(&mut self, index: usize) {
        if self.table.is_empty() {
            self.page = 0;
            self.cursor = 0;
            return;
        }
        let index = index.min(self.table.len() - 1);
        self.page = index / self.page_size;
        self.cursor = index % self.page_size;
    }

    fn move_or_scroll(&mut self, delta: isize) {
        if self.overlay.is_some() {
            let max = self.overlay_max_scroll() as isize;
            self.overlay_scroll = (self.overlay_scroll as isize + delta).clamp(0, max) as u16;
            return;
        }
        let current = self.selected_index().unwrap_or(0) as isize;
        self.select_index((current + delta).max(0) as usize);
    }

    fn jump_to_top(&mut self) {
        if self.overlay.is_some() {
            self.overlay_scroll = 0;
        } else {
            self.select_index(0);
        }
    }

    fn page_step(&self) -> isize {
        if self.overlay.is_some() {
            return self.overlay_view_height.saturating_sub(1).max(1) as isize;
        }
        self.page_size as isize
    }

    fn overlay_max_scroll(&self) -> u16 {
        let Some(overlay) = &self.overlay else {
            return 0;
        };
        let lines = visual_line_count(overlay.text(), self.overlay_view_width as usize);
        lines.saturating_sub(self.overlay_view_height as usize) as u16
    }
}

fn visual_line_count(text: &str, width: usize) -> usize {
    let width = width.max(1);
    text.lines()
        .map(|line| line.chars().count().max(1).div_ceil(width))
        .sum::<usize>()
        .max(1)
}

fn summarize_error_line(error: &str) -> String {
    error
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

fn normalize_status_text(status: String) -> String {
    const MAX_STATUS_LEN: usize = 180;
    if status.chars().count() <= MAX_STATUS_LEN {
        return status;
    }

    let mut shortened = status
        .chars()
        .take(MAX_STATUS_LEN.saturating_sub(1))
        .collect::<String>();
    shortened.push('…');
    shortened
}
