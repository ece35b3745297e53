use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
use serde_json::Value;
use std::fmt::{Display, Formatter};

pub type Row = Vec<String>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

impl Display for WatchEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Added => "Added",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
        };
        f.write_str(label)
    }
}

/// The mirror no longer matches the server. Never recovered from.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("{event} event for {identity}, which the {kind} table does not track")]
    Desynchronized {
        kind: String,
        event: WatchEventKind,
        identity: RowIdentity,
    },
    #[error("{found} object delivered to the {kind} table (expected {expected})")]
    ForeignKind {
        kind: String,
        expected: String,
        found: String,
    },
}

/// Identity of the object a row was resolved from: its metadata namespace
/// (empty when cluster-scoped) and name. Independent of the view's columns.
pub fn object_identity(raw: &Value) -> RowIdentity {
    let field = |pointer: &str| {
        raw.pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    RowIdentity::new(field("/metadata/namespace"), field("/metadata/name"))
}

/// A resolved row together with the identity of its object.
pub type KeyedRow = (RowIdentity, Row);

/// Live mirror of one query, kept sorted by (namespace, name) with at most
/// one row per identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTable {
    query: ViewQuery,
    titles: Vec<String>,
    keys: Vec<RowIdentity>,
    rows: Vec<Row>,
}

impl ResourceTable {
    pub fn new(query: ViewQuery, titles: Vec<String>) -> Self {
        Self {
            query,
            titles,
            keys: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn query(&self) -> &ViewQuery {
        &self.query
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.query.kind
    }

    pub fn scope(&self) -> &NamespaceScope {
        &self.query.scope
    }

    pub fn titles(&self) -> &[String] {
        &self.titles
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Identities in row order.
    pub fn identities(&self) -> &[RowIdentity] {
        &self.keys
    }

    #[cfg(test)]
    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn identity_at(&self, index: usize) -> Option<RowIdentity> {
        self.keys.get(index).cloned()
    }

    pub fn position_of(&self, identity: &RowIdentity) -> Option<usize> {
        self.keys.binary_search(identity).ok()
    }

    /// Replaces every row with a fresh listing.
    pub fn replace_rows(&mut self, rows: Vec<KeyedRow>) {
        let mut keyed = rows;
        keyed.sort_by(|left, right| left.0.cmp(&right.0));
        keyed.dedup_by(|right, left| left.0 == right.0);
        let (keys, rows): (Vec<_>, Vec<_>) = keyed.into_iter().unzip();
        self.keys = keys;
        self.rows = rows;
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.rows.clear();
    }

    /// Applies one watch event. Returns whether the rows changed.
    pub fn apply(
        &mut self,
        event: WatchEventKind,
        identity: RowIdentity,
        row: Row,
    ) -> Result<bool, TableError> {
        match (event, self.keys.binary_search(&identity)) {
            (WatchEventKind::Added, Ok(_)) => Ok(false),
            (WatchEventKind::Added, Err(slot)) => {
                self.keys.insert(slot, identity);
                self.rows.insert(slot, row);
                Ok(true)
            }
            (WatchEventKind::Modified, Ok(index)) => {
                let changed = self.rows[index] != row;
                self.rows[index] = row;
                Ok(changed)
            }
            (WatchEventKind::Deleted, Ok(index)) => {
                self.keys.remove(index);
                self.rows.remove(index);
                Ok(true)
            }
            (event, Err(_)) => Err(TableError::Desynchronized {
                kind: self.query.kind.to_string(),
                event,
                identity,
            }),
        }
    }
}

/// Rejects a watched object whose `kind` is not the one the table mirrors.
/// Objects that carry no `kind` are accepted.
pub fn check_object_kind(
    table_kind: &ResourceKind,
    expected: &str,
    raw: &Value,
) -> Result<(), TableError> {
    match raw.get("kind").and_then(Value::as_str) {
        Some(found) if !found.eq_ignore_ascii_case(expected) => Err(TableError::ForeignKind {
            kind: table_kind.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        KeyedRow, ResourceTable, TableError, WatchEventKind, check_object_kind, object_identity,
    };
    use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
    use serde_json::json;

    fn pods_table() -> ResourceTable {
        ResourceTable::new(
            ViewQuery::new(
                ResourceKind::pods(),
                NamespaceScope::Named("default".to_string()),
            ),
            vec![
                "NAMESPACE".to_string(),
                "Name".to_string(),
                "STATUS".to_string(),
            ],
        )
    }

    fn row(name: &str, namespace: &str) -> KeyedRow {
        (
            RowIdentity::new(namespace, name),
            vec![namespace.to_string(), name.to_string(), "Running".to_string()],
        )
    }

    fn apply(
        table: &mut ResourceTable,
        event: WatchEventKind,
        (identity, row): KeyedRow,
    ) -> Result<bool, TableError> {
        table.apply(event, identity, row)
    }

    fn identities(table: &ResourceTable) -> Vec<(String, String)> {
        table
            .rows()
            .iter()
            .map(|row| (row[1].clone(), row[0].clone()))
            .collect()
    }

    fn is_sorted_and_unique(table: &ResourceTable) -> bool {
        table.identities().windows(2).all(|pair| pair[0] < pair[1])
            && table.identities().len() == table.rows().len()
    }

    #[test]
    fn watch_events_keep_namespace_major_order() {
        let mut table = pods_table();
        assert!(table.is_empty());

        apply(&mut table, WatchEventKind::Added, row("a", "default")).unwrap();
        apply(&mut table, WatchEventKind::Added, row("b", "default")).unwrap();
        assert_eq!(
            identities(&table),
            vec![
                ("a".to_string(), "default".to_string()),
                ("b".to_string(), "default".to_string()),
            ]
        );

        apply(&mut table, WatchEventKind::Added, row("a", "kube-system")).unwrap();
        assert_eq!(
            identities(&table),
            vec![
                ("a".to_string(), "default".to_string()),
                ("b".to_string(), "default".to_string()),
                ("a".to_string(), "kube-system".to_string()),
            ]
        );

        apply(&mut table, WatchEventKind::Deleted, row("a", "default")).unwrap();
        assert_eq!(
            identities(&table),
            vec![
                ("b".to_string(), "default".to_string()),
                ("a".to_string(), "kube-system".to_string()),
            ]
        );
    }

    #[test]
    fn random_event_sequences_stay_sorted_and_unique() {
        let names = ["a", "b", "c", "d", "e"];
        let namespaces = ["default", "kube-system", "apps"];
        let mut seed = 0x2545_f491_u64;
        let mut next = move |bound: usize| {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((seed >> 33) as usize) % bound
        };

        let mut table = pods_table();
        for _ in 0..500 {
            let candidate = row(names[next(names.len())], namespaces[next(namespaces.len())]);
            let tracked = table.position_of(&candidate.0).is_some();
            let event = match (next(3), tracked) {
                (0, true) => WatchEventKind::Modified,
                (1, true) => WatchEventKind::Deleted,
                _ => WatchEventKind::Added,
            };
            apply(&mut table, event, candidate).unwrap();
            assert!(is_sorted_and_unique(&table));
        }
    }

    #[test]
    fn duplicate_added_is_ignored_and_modified_replaces_in_place() {
        let mut table = pods_table();
        apply(&mut table, WatchEventKind::Added, row("a", "default")).unwrap();
        assert!(!apply(&mut table, WatchEventKind::Added, row("a", "default")).unwrap());
        assert_eq!(table.len(), 1);

        let mut updated = row("a", "default");
        updated.1[2] = "CrashLoopBackOff".to_string();
        assert!(apply(&mut table, WatchEventKind::Modified, updated.clone()).unwrap());
        assert_eq!(table.row(0), Some(&updated.1));
    }

    #[test]
    fn untracked_modify_or_delete_is_a_desync() {
        let mut table = pods_table();
        let error = apply(&mut table, WatchEventKind::Modified, row("ghost", "default"))
            .unwrap_err();
        assert_eq!(
            error,
            TableError::Desynchronized {
                kind: "pods".to_string(),
                event: WatchEventKind::Modified,
                identity: RowIdentity::new("default", "ghost"),
            }
        );
        assert!(matches!(
            apply(&mut table, WatchEventKind::Deleted, row("ghost", "default")),
            Err(TableError::Desynchronized { .. })
        ));
    }

    #[test]
    fn relisting_identical_rows_is_idempotent() {
        let listing = vec![
            row("b", "default"),
            row("a", "kube-system"),
            row("a", "default"),
            row("a", "default"),
        ];
        let mut first = pods_table();
        first.replace_rows(listing.clone());
        let mut second = first.clone();
        second.replace_rows(listing);

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert!(is_sorted_and_unique(&first));
    }

    #[test]
    fn same_name_in_two_namespaces_stays_two_rows_without_namespace_column() {
        let mut table = ResourceTable::new(
            ViewQuery::new(ResourceKind::pods(), NamespaceScope::All),
            vec!["NAME".to_string()],
        );
        let web = |namespace: &str| {
            let raw = json!({"metadata": {"name": "web", "namespace": namespace}});
            (object_identity(&raw), vec!["web".to_string()])
        };

        apply(&mut table, WatchEventKind::Added, web("a")).unwrap();
        apply(&mut table, WatchEventKind::Added, web("b")).unwrap();
        assert_eq!(table.len(), 2);

        assert!(apply(&mut table, WatchEventKind::Deleted, web("a")).unwrap());
        assert!(apply(&mut table, WatchEventKind::Deleted, web("b")).unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn cluster_scoped_objects_key_on_name() {
        let node = json!({"metadata": {"name": "node-a"}});
        assert_eq!(object_identity(&node), RowIdentity::new("", "node-a"));

        let mut table = ResourceTable::new(
            ViewQuery::new(ResourceKind::new("nodes"), NamespaceScope::All),
            vec!["NAME".to_string(), "VERSION".to_string()],
        );
        table.replace_rows(vec![
            (RowIdentity::new("", "node-b"), vec!["node-b".to_string(), "v1.30".to_string()]),
            (RowIdentity::new("", "node-a"), vec!["node-a".to_string(), "v1.30".to_string()]),
        ]);
        assert_eq!(table.identity_at(0), Some(RowIdentity::new("", "node-a")));
        assert_eq!(
            table.position_of(&RowIdentity::new("", "node-b")),
            Some(1)
        );
    }

    #[test]
    fn objects_of_another_kind_are_rejected() {
        let kind = ResourceKind::pods();
        assert!(check_object_kind(&kind, "Pod", &json!({"kind": "Pod"})).is_ok());
        assert!(check_object_kind(&kind, "Pod", &json!({"metadata": {}})).is_ok());
        assert!(matches!(
            check_object_kind(&kind, "Pod", &json!({"kind": "Service"})),
            Err(TableError::ForeignKind { .. })
        ));
    }
}
