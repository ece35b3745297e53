use std::fmt::{Display, Formatter};

/// Group/version/resource triple naming a kind of object on the cluster.
///
/// A kind built without a version matches any version of the same group and
/// resource; the gateway resolves it to the server's preferred version.
#[derive(Debug, Clone)]
pub struct ResourceKind {
    pub group: String,
    pub version: Option<String>,
    pub resource: String,
}

impl ResourceKind {
    pub const PODS: &'static str = "pods";
    pub const CONTAINERS: &'static str = "containers";
    pub const CONTEXTS: &'static str = "contexts";

    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            group: String::new(),
            version: None,
            resource: resource.into(),
        }
    }

    pub fn pods() -> Self {
        Self::new(Self::PODS)
    }

    pub fn containers() -> Self {
        Self::new(Self::CONTAINERS)
    }

    #[cfg(test)]
    pub fn contexts() -> Self {
        Self::new(Self::CONTEXTS)
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[cfg(test)]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Parses `name[.group][/version]` as typed on the command line.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();
        let (name, version) = match token.split_once('/') {
            Some((name, version)) => (name.to_string(), Some(version.trim().to_string())),
            None => (token, None),
        };
        let (resource, group) = match name.split_once('.') {
            Some((resource, group)) => (resource.to_string(), group.to_string()),
            None => (name, String::new()),
        };
        if resource.is_empty() || version.as_deref().is_some_and(str::is_empty) {
            return None;
        }

        Some(Self {
            group,
            version,
            resource,
        })
    }

    pub fn is(&self, resource: &str) -> bool {
        self.resource == resource
    }

    /// Key used by per-resource caches. Unversioned kinds share one entry.
    pub fn cache_key(&self) -> String {
        let mut key = self.resource.clone();
        if !self.group.is_empty() {
            key.push('.');
            key.push_str(&self.group);
        }
        if let Some(version) = &self.version {
            key.push('/');
            key.push_str(version);
        }
        key
    }
}

impl PartialEq for ResourceKind {
    fn eq(&self, other: &Self) -> bool {
        let versions_match = match (&self.version, &other.version) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        };
        self.resource == other.resource && self.group == other.group && versions_match
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NamespaceScope {
    All,
    Named(String),
}

impl NamespaceScope {
    pub fn label(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Named(namespace) => namespace.clone(),
        }
    }

    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() || token.eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Named(token.to_string())
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Named(namespace) => Some(namespace),
        }
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Named(namespace) => write!(f, "{namespace}"),
        }
    }
}

/// Server-side filters applied to both the list and the watch of a view.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ListOptions {
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
}

impl ListOptions {
    pub fn fields(selector: impl Into<String>) -> Self {
        Self {
            field_selector: Some(selector.into()),
            label_selector: None,
        }
    }
}

/// Everything needed to populate one table: what to list and where.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewQuery {
    pub kind: ResourceKind,
    pub scope: NamespaceScope,
    pub options: ListOptions,
}

impl ViewQuery {
    pub fn new(kind: ResourceKind, scope: NamespaceScope) -> Self {
        Self {
            kind,
            scope,
            options: ListOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ListOptions) -> Self {
        self.options = options;
        self
    }

    /// Containers of a single pod: the pod is watched through a name selector.
    pub fn pod_containers(namespace: &str, pod: &str) -> Self {
        Self {
            kind: ResourceKind::containers(),
            scope: NamespaceScope::Named(namespace.to_string()),
            options: ListOptions::fields(format!("metadata.name={pod}")),
        }
    }

    /// Name of the pod behind a containers query.
    pub fn owning_pod(&self) -> Option<&str> {
        self.options
            .field_selector
            .as_deref()
            .and_then(|selector| selector.strip_prefix("metadata.name="))
    }
}

/// Name and namespace of one row, the unit of identity in a table.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RowIdentity {
    pub namespace: String,
    pub name: String,
}

impl RowIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl Display for RowIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContextCatalogRow {
    pub context: String,
    pub cluster: String,
    pub auth_info: String,
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::{NamespaceScope, ResourceKind, ViewQuery};

    #[test]
    fn kind_tokens_parse_group_and_version() {
        let plain = ResourceKind::parse("Pods").expect("plain kind");
        assert_eq!(plain.resource, "pods");
        assert_eq!(plain.group, "");
        assert_eq!(plain.version, None);

        let full = ResourceKind::parse("deployments.apps/v1").expect("full kind");
        assert_eq!(full.resource, "deployments");
        assert_eq!(full.group, "apps");
        assert_eq!(full.version.as_deref(), Some("v1"));

        assert!(ResourceKind::parse("pods/").is_none());
        assert!(ResourceKind::parse("").is_none());
    }

    #[test]
    fn unversioned_kind_matches_any_version() {
        let any = ResourceKind::new("jobs").with_group("batch");
        let v1 = ResourceKind::new("jobs").with_group("batch").with_version("v1");
        let v2 = ResourceKind::new("jobs").with_group("batch").with_version("v2");

        assert_eq!(any, v1);
        assert_eq!(v1, any);
        assert_ne!(v1, v2);
        assert_ne!(any, ResourceKind::new("jobs"));
    }

    #[test]
    fn namespace_token_all_clears_scope() {
        assert_eq!(NamespaceScope::from_token("all"), NamespaceScope::All);
        assert_eq!(NamespaceScope::from_token("ALL"), NamespaceScope::All);
        assert_eq!(
            NamespaceScope::from_token("kube-system"),
            NamespaceScope::Named("kube-system".to_string())
        );
    }

    #[test]
    fn container_query_remembers_its_pod() {
        let query = ViewQuery::pod_containers("default", "web-0");
        assert!(query.kind.is(ResourceKind::CONTAINERS));
        assert_eq!(query.owning_pod(), Some("web-0"));
        assert_eq!(query.scope.namespace(), Some("default"));
    }
}
