//! Keeps the shared table in step with the cluster.
//!
//! Every view starts with one list, run as a detached task whose rows come
//! back to the event loop as a [`SyncMessage`]. The first successful list
//! starts a single watch task from the listing's resource version; that
//! task applies events to the shared table itself and pokes the renderer
//! through [`RedrawSignal`]. Nothing here retries after a failure.

use crate::k8s::{KubeGateway, compact_error, container_objects, watch_params};
use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
use crate::table::{
    KeyedRow, ResourceTable, TableError, WatchEventKind, check_object_kind, object_identity,
};
use crate::views::{ResourceView, ViewRegistry};
use anyhow::Context;
use futures::{StreamExt, pin_mut};
use kube::api::WatchEvent;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

pub type SharedTable = Arc<RwLock<ResourceTable>>;

pub const LIST_TIMEOUT: Duration = Duration::from_secs(4);

/// Send-or-drop wake-up for the renderer. Never waits.
#[derive(Debug, Clone)]
pub struct RedrawSignal {
    tx: mpsc::Sender<()>,
}

impl RedrawSignal {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns false when a wake-up is already pending or nobody listens.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

#[derive(Debug)]
pub enum SyncMessage {
    Listed {
        generation: u64,
        result: Result<ListedRows, String>,
    },
    ConnectionLost {
        generation: u64,
        error: String,
    },
    Desynchronized {
        generation: u64,
        error: TableError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ListedRows {
    pub rows: Vec<KeyedRow>,
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyncState {
    Idle,
    Listing,
    Watching,
    Stopped,
}

/// What the event loop should do after a [`SyncMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Ignored,
    Updated,
    ConnectionLost(String),
    Fatal(TableError),
}

/// Effect of one message on the engine, decided without touching the
/// cluster.
#[derive(Debug, PartialEq)]
enum Transition {
    Ignore,
    Replace {
        rows: Vec<KeyedRow>,
        watch_from: Option<String>,
    },
    Lost(String),
    Fatal(TableError),
}

/// Generation and state bookkeeping of [`SyncEngine`]. A stopped
/// generation accepts nothing until the next [`Lifecycle::begin`].
#[derive(Debug)]
struct Lifecycle {
    generation: u64,
    state: SyncState,
    watching: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            generation: 0,
            state: SyncState::Idle,
            watching: false,
        }
    }
}

impl Lifecycle {
    fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.state = SyncState::Listing;
        self.watching = false;
        self.generation
    }

    fn stop(&mut self) {
        self.watching = false;
        if self.state != SyncState::Idle {
            self.state = SyncState::Stopped;
        }
    }

    /// `watchable` is false for tables that are listed once and never
    /// watched.
    fn on_message(&mut self, message: SyncMessage, watchable: bool) -> Transition {
        let generation = match &message {
            SyncMessage::Listed { generation, .. }
            | SyncMessage::ConnectionLost { generation, .. }
            | SyncMessage::Desynchronized { generation, .. } => *generation,
        };
        if generation != self.generation || self.state == SyncState::Stopped {
            debug!("dropping sync message from generation {generation}");
            return Transition::Ignore;
        }

        match message {
            SyncMessage::Listed {
                result: Ok(listed), ..
            } => {
                let watch_from = if !watchable {
                    self.state = SyncState::Idle;
                    None
                } else if self.watching {
                    None
                } else {
                    self.watching = true;
                    self.state = SyncState::Watching;
                    Some(listed.resource_version.unwrap_or_default())
                };
                Transition::Replace {
                    rows: listed.rows,
                    watch_from,
                }
            }
            SyncMessage::Listed {
                result: Err(error), ..
            }
            | SyncMessage::ConnectionLost { error, .. } => {
                self.stop();
                Transition::Lost(error)
            }
            SyncMessage::Desynchronized { error, .. } => {
                self.stop();
                Transition::Fatal(error)
            }
        }
    }
}

pub struct SyncEngine {
    gateway: KubeGateway,
    views: Arc<ViewRegistry>,
    table: SharedTable,
    messages: mpsc::UnboundedSender<SyncMessage>,
    redraw: RedrawSignal,
    lifecycle: Lifecycle,
    list_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
}

impl SyncEngine {
    pub fn new(
        gateway: KubeGateway,
        views: Arc<ViewRegistry>,
        redraw: RedrawSignal,
        messages: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        let query = ViewQuery::new(ResourceKind::pods(), NamespaceScope::All);
        let table = ResourceTable::new(query, views.titles(ResourceKind::PODS));
        Self {
            gateway,
            views,
            table: Arc::new(RwLock::new(table)),
            messages,
            redraw,
            lifecycle: Lifecycle::default(),
            list_task: None,
            watch_task: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.lifecycle.state
    }

    pub fn generation(&self) -> u64 {
        self.lifecycle.generation
    }

    pub fn set_gateway(&mut self, gateway: KubeGateway) {
        self.stop();
        self.gateway = gateway;
    }

    /// One consistent copy of the table for a single redraw.
    pub fn snapshot(&self) -> ResourceTable {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn query(&self) -> ViewQuery {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .query()
            .clone()
    }

    /// Switches to `query` with an empty table.
    pub fn start(&mut self, query: ViewQuery) {
        let titles = self.views.titles(&query.kind.resource);
        self.begin(ResourceTable::new(query, titles));
    }

    /// Switches back to a saved table; its rows show until the list lands.
    pub fn restore(&mut self, table: ResourceTable) {
        self.begin(table);
    }

    pub fn reconnect(&mut self) {
        self.start(self.query());
    }

    fn begin(&mut self, table: ResourceTable) {
        self.stop();
        let generation = self.lifecycle.begin();
        let query = table.query().clone();
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        self.redraw.notify();

        info!("listing {} in {}", query.kind, query.scope);
        self.list_task = Some(tokio::spawn(list_task(
            self.gateway.clone(),
            Arc::clone(&self.views),
            query,
            generation,
            self.messages.clone(),
        )));
    }

    /// Cancels the list and the watch. The table keeps its rows.
    pub fn stop(&mut self) {
        self.abort_tasks();
        self.lifecycle.stop();
    }

    fn abort_tasks(&mut self) {
        for task in [self.list_task.take(), self.watch_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    pub fn handle(&mut self, message: SyncMessage) -> SyncOutcome {
        let query = self.query();
        let watchable = !query.kind.is(ResourceKind::CONTEXTS);
        match self.lifecycle.on_message(message, watchable) {
            Transition::Ignore => SyncOutcome::Ignored,
            Transition::Replace { rows, watch_from } => {
                self.table
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace_rows(rows);
                self.list_task = None;
                if let Some(resource_version) = watch_from {
                    self.spawn_watch(query, resource_version);
                }
                SyncOutcome::Updated
            }
            Transition::Lost(error) => {
                warn!("connection lost: {error}");
                self.abort_tasks();
                SyncOutcome::ConnectionLost(error)
            }
            Transition::Fatal(error) => {
                self.abort_tasks();
                SyncOutcome::Fatal(error)
            }
        }
    }

    fn spawn_watch(&mut self, query: ViewQuery, resource_version: String) {
        let context = WatchContext {
            gateway: self.gateway.clone(),
            view: self.views.get_view(&query.kind.resource),
            table: Arc::clone(&self.table),
            redraw: self.redraw.clone(),
            messages: self.messages.clone(),
            generation: self.lifecycle.generation,
            query,
        };
        self.watch_task = Some(tokio::spawn(watch_task(context, resource_version)));
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn list_task(
    gateway: KubeGateway,
    views: Arc<ViewRegistry>,
    query: ViewQuery,
    generation: u64,
    messages: mpsc::UnboundedSender<SyncMessage>,
) {
    let result = list_rows(&gateway, &views, &query)
        .await
        .map_err(|error| compact_error(&error));
    if let Ok(listed) = &result {
        debug!("listed {} {} rows", listed.rows.len(), query.kind);
    }
    let _ = messages.send(SyncMessage::Listed { generation, result });
}

async fn list_rows(
    gateway: &KubeGateway,
    views: &ViewRegistry,
    query: &ViewQuery,
) -> anyhow::Result<ListedRows> {
    if query.kind.is(ResourceKind::CONTEXTS) {
        return Ok(ListedRows {
            rows: gateway
                .context_catalog()
                .into_iter()
                .map(|row| {
                    (
                        RowIdentity::new("", row.context.clone()),
                        vec![row.context, row.cluster, row.auth_info, row.namespace],
                    )
                })
                .collect(),
            resource_version: None,
        });
    }

    let listing = timeout(LIST_TIMEOUT, gateway.list(query))
        .await
        .with_context(|| format!("listing {} timed out", query.kind))??;
    let view = views.get_view(&query.kind.resource);
    Ok(ListedRows {
        rows: listing
            .items
            .iter()
            .map(|raw| (object_identity(raw), view.resolve_row(raw)))
            .collect(),
        resource_version: listing.resource_version,
    })
}

struct WatchContext {
    gateway: KubeGateway,
    view: Arc<ResourceView>,
    table: SharedTable,
    redraw: RedrawSignal,
    messages: mpsc::UnboundedSender<SyncMessage>,
    generation: u64,
    query: ViewQuery,
}

enum WatchFailure {
    Connection(String),
    Desynchronized(TableError),
}

async fn watch_task(context: WatchContext, mut resource_version: String) {
    loop {
        match watch_once(&context, &mut resource_version).await {
            Ok(()) => debug!("watch on {} ended, reopening", context.query.kind),
            Err(WatchFailure::Connection(error)) => {
                let _ = context.messages.send(SyncMessage::ConnectionLost {
                    generation: context.generation,
                    error,
                });
                return;
            }
            Err(WatchFailure::Desynchronized(error)) => {
                let _ = context.messages.send(SyncMessage::Desynchronized {
                    generation: context.generation,
                    error,
                });
                return;
            }
        }
    }
}

/// Consumes one watch stream until the server closes it.
async fn watch_once(
    context: &WatchContext,
    resource_version: &mut String,
) -> Result<(), WatchFailure> {
    let containers = context.query.kind.is(ResourceKind::CONTAINERS);
    let watched_kind = if containers {
        ResourceKind::pods()
    } else {
        context.query.kind.clone()
    };
    let info = context
        .gateway
        .kind_info(&watched_kind)
        .await
        .map_err(|error| WatchFailure::Connection(compact_error(&error)))?;
    let api = context.gateway.dynamic_api(&info, &context.query.scope);
    let params = watch_params(&context.query.options);

    let stream = api
        .watch(&params, resource_version)
        .await
        .map_err(|error| WatchFailure::Connection(format!("watch {} failed: {error}", watched_kind)))?;
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let event = event.map_err(|error| {
            WatchFailure::Connection(format!("watch {} failed: {error}", watched_kind))
        })?;
        let (event_kind, object) = match event {
            WatchEvent::Added(object) => (WatchEventKind::Added, object),
            WatchEvent::Modified(object) => (WatchEventKind::Modified, object),
            WatchEvent::Deleted(object) => (WatchEventKind::Deleted, object),
            WatchEvent::Bookmark(bookmark) => {
                *resource_version = bookmark.metadata.resource_version;
                continue;
            }
            WatchEvent::Error(error) => {
                return Err(WatchFailure::Connection(format!(
                    "watch {} failed: {error:?}",
                    watched_kind
                )));
            }
        };

        if let Some(version) = &object.metadata.resource_version {
            resource_version.clone_from(version);
        }
        let raw = serde_json::to_value(&object)
            .map_err(|error| WatchFailure::Connection(format!("bad watch object: {error}")))?;

        let changed = {
            let mut table = context.table.write().unwrap_or_else(PoisonError::into_inner);
            if containers {
                apply_pod_event_to_containers(&mut table, &context.view, event_kind, &raw)
            } else {
                apply_watch_event(
                    &mut table,
                    &context.view,
                    &info.resource.kind,
                    event_kind,
                    &raw,
                )
            }
        }
        .map_err(WatchFailure::Desynchronized)?;

        if changed {
            context.redraw.notify();
        }
    }
    Ok(())
}

/// Resolves and applies one watched object.
pub fn apply_watch_event(
    table: &mut ResourceTable,
    view: &ResourceView,
    expected_kind: &str,
    event: WatchEventKind,
    raw: &Value,
) -> Result<bool, TableError> {
    check_object_kind(table.kind(), expected_kind, raw)?;
    table.apply(event, object_identity(raw), view.resolve_row(raw))
}

/// Any event on the parent pod replaces every container row; a deleted pod
/// leaves the table empty.
pub fn apply_pod_event_to_containers(
    table: &mut ResourceTable,
    view: &ResourceView,
    event: WatchEventKind,
    pod: &Value,
) -> Result<bool, TableError> {
    check_object_kind(table.kind(), "Pod", pod)?;
    let before = table.rows().to_vec();
    match event {
        WatchEventKind::Deleted => table.clear(),
        WatchEventKind::Added | WatchEventKind::Modified => table.replace_rows(
            container_objects(pod)
                .iter()
                .map(|container| (object_identity(container), view.resolve_row(container)))
                .collect(),
        ),
    }
    Ok(table.rows() != before.as_slice())
}
