use crate::model::{ResourceKind, RowIdentity, ViewQuery};
use crate::table::ResourceTable;

/// What is drawn over the table, if anything.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Overlay {
    Logs { title: String, text: String },
    Describe { title: String, text: String },
}

impl Overlay {
    pub fn title(&self) -> &str {
        match self {
            Self::Logs { title, .. } | Self::Describe { title, .. } => title,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Logs { text, .. } | Self::Describe { text, .. } => text,
        }
    }
}

/// Browsing state captured on drill-down and restored verbatim on back.
#[derive(Debug, Clone, PartialEq)]
pub struct Memento {
    pub table: ResourceTable,
    pub cursor: usize,
    pub page: usize,
    pub last_error: Option<String>,
    pub overlay: Option<Overlay>,
    pub selected: Option<RowIdentity>,
}

impl Memento {
    pub fn kind(&self) -> &ResourceKind {
        self.table.kind()
    }

    pub fn query(&self) -> &ViewQuery {
        self.table.query()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NavigationStack {
    entries: Vec<Memento>,
}

impl NavigationStack {
    pub fn push(&mut self, memento: Memento) {
        self.entries.push(memento);
    }

    pub fn pop(&mut self) -> Option<Memento> {
        self.entries.pop()
    }

    #[cfg(test)]
    pub fn peek(&self) -> Option<&Memento> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Nearest memento of `resource`, scanning from the top.
    pub fn find_by_kind(&self, resource: &str) -> Option<&Memento> {
        self.entries
            .iter()
            .rev()
            .find(|memento| memento.kind().is(resource))
    }

    /// Bottom-to-top trail of (kind, selected name).
    pub fn breadcrumb(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|memento| {
                let name = memento
                    .selected
                    .as_ref()
                    .map(|identity| identity.name.clone())
                    .unwrap_or_else(|| "-".to_string());
                (memento.kind().resource.clone(), name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Memento, NavigationStack, Overlay};
    use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
    use crate::table::ResourceTable;

    fn memento(resource: &str, selected: &str, cursor: usize) -> Memento {
        let mut table = ResourceTable::new(
            ViewQuery::new(
                ResourceKind::new(resource),
                NamespaceScope::Named("default".to_string()),
            ),
            vec!["NAMESPACE".to_string(), "NAME".to_string()],
        );
        table.replace_rows(vec![(
            RowIdentity::new("default", selected),
            vec!["default".to_string(), selected.to_string()],
        )]);
        Memento {
            table,
            cursor,
            page: 1,
            last_error: None,
            overlay: None,
            selected: Some(RowIdentity::new("default", selected)),
        }
    }

    #[test]
    fn push_then_pop_returns_same_memento() {
        let mut stack = NavigationStack::default();
        stack.push(memento("deployments", "web", 0));
        let before = stack.len();

        let mut entry = memento("pods", "web-0", 7);
        entry.overlay = Some(Overlay::Describe {
            title: "pods/web-0".to_string(),
            text: "kind: Pod".to_string(),
        });
        entry.last_error = Some("boom".to_string());
        stack.push(entry.clone());

        assert_eq!(stack.peek(), Some(&entry));
        assert_eq!(stack.pop(), Some(entry));
        assert_eq!(stack.len(), before);
    }

    #[test]
    fn find_by_kind_prefers_the_nearest_entry() {
        let mut stack = NavigationStack::default();
        stack.push(memento("pods", "old", 0));
        stack.push(memento("deployments", "web", 0));
        stack.push(memento("pods", "web-0", 3));
        stack.push(memento("containers", "app", 1));

        let pods = stack.find_by_kind(ResourceKind::PODS).expect("pods entry");
        assert_eq!(pods.cursor, 3);
        assert!(stack.find_by_kind("services").is_none());
    }

    #[test]
    fn breadcrumb_lists_kinds_bottom_up() {
        let mut stack = NavigationStack::default();
        assert!(stack.breadcrumb().is_empty());
        stack.push(memento("deployments", "web", 0));
        stack.push(memento("pods", "web-0", 0));

        assert_eq!(
            stack.breadcrumb(),
            vec![
                ("deployments".to_string(), "web".to_string()),
                ("pods".to_string(), "web-0".to_string()),
            ]
        );
    }
}
