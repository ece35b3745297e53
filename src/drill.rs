//! Decides where Enter on a selected row leads.
//!
//! A few relationships are fixed (pods open their containers, containers open
//! their pod's logs, some kinds never drill). Everything else follows the
//! `drill` entry of the kind's view: the selected object is fetched in full
//! and the entry's selector templates are rendered against it.

use crate::model::{ListOptions, NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
use crate::nav::NavigationStack;
use crate::resolver::{ResolutionError, Template};
use crate::views::{DrillConfig, ViewRegistry};
use serde_json::Value;

const NON_DRILLABLE: [&str; 2] = ["events", ResourceKind::CONTEXTS];

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DrillError {
    #[error("{0} cannot be drilled into")]
    Unsupported(String),
    #[error("no row selected")]
    NoSelection,
    #[error("{0} has no namespace to drill into")]
    MissingNamespace(String),
    #[error("no owning pod found for container {0}")]
    OwnerNotFound(String),
    #[error("drill selector `{template}` failed: {source}")]
    Render {
        template: String,
        #[source]
        source: ResolutionError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrillRule {
    PodContainers,
    ContainerLogs,
    Configured(DrillConfig),
    Unsupported,
}

impl DrillRule {
    pub fn for_kind(kind: &ResourceKind, views: &ViewRegistry) -> Self {
        if NON_DRILLABLE.iter().any(|resource| kind.is(resource)) {
            return Self::Unsupported;
        }
        if kind.is(ResourceKind::PODS) {
            return Self::PodContainers;
        }
        if kind.is(ResourceKind::CONTAINERS) {
            return Self::ContainerLogs;
        }
        match &views.get_view(&kind.resource).drill {
            Some(config) => Self::Configured(config.clone()),
            None => Self::Unsupported,
        }
    }
}

/// Next step after a drill. `Related` still needs the selected object
/// fetched before its query can be built.
#[derive(Debug, Clone, PartialEq)]
pub enum DrillPlan {
    Query(ViewQuery),
    Logs {
        namespace: String,
        pod: String,
        container: Option<String>,
    },
    Related {
        parent: ResourceKind,
        selected: RowIdentity,
        config: DrillConfig,
    },
}

pub fn can_drill_down(kind: &ResourceKind, views: &ViewRegistry) -> bool {
    !matches!(DrillRule::for_kind(kind, views), DrillRule::Unsupported)
}

pub fn plan(
    query: &ViewQuery,
    selected: Option<&RowIdentity>,
    stack: &NavigationStack,
    views: &ViewRegistry,
) -> Result<DrillPlan, DrillError> {
    let kind = &query.kind;
    let rule = DrillRule::for_kind(kind, views);
    if rule == DrillRule::Unsupported {
        return Err(DrillError::Unsupported(kind.resource.clone()));
    }
    let selected = selected.ok_or(DrillError::NoSelection)?;
    let namespace = selected
        .namespace()
        .or_else(|| query.scope.namespace())
        .map(str::to_string);

    match rule {
        DrillRule::PodContainers => {
            let namespace =
                namespace.ok_or_else(|| DrillError::MissingNamespace(selected.name.clone()))?;
            Ok(DrillPlan::Query(ViewQuery::pod_containers(
                &namespace,
                &selected.name,
            )))
        }
        DrillRule::ContainerLogs => {
            let owner = stack
                .find_by_kind(ResourceKind::PODS)
                .and_then(|memento| memento.selected.clone())
                .and_then(|pod| {
                    let namespace = pod.namespace().map(str::to_string).or(namespace.clone())?;
                    Some((namespace, pod.name))
                })
                .or_else(|| {
                    let pod = query.owning_pod()?.to_string();
                    Some((query.scope.namespace()?.to_string(), pod))
                })
                .ok_or_else(|| DrillError::OwnerNotFound(selected.name.clone()))?;
            Ok(DrillPlan::Logs {
                namespace: owner.0,
                pod: owner.1,
                container: Some(selected.name.clone()),
            })
        }
        DrillRule::Configured(config) => Ok(DrillPlan::Related {
            parent: kind.clone(),
            selected: selected.clone(),
            config,
        }),
        DrillRule::Unsupported => Err(DrillError::Unsupported(kind.resource.clone())),
    }
}

/// Builds the child query from the fetched parent object.
pub fn related_query(
    config: &DrillConfig,
    parent: &Value,
    target_namespaced: bool,
) -> Result<ViewQuery, DrillError> {
    let options = render_selectors(config, parent)?;
    let parent_namespace = parent
        .pointer("/metadata/namespace")
        .and_then(Value::as_str);
    let scope = target_scope(parent_namespace, target_namespaced);
    Ok(ViewQuery::new(config.target.clone(), scope).with_options(options))
}

/// Renders every selector template and AND-joins the clauses.
pub fn render_selectors(config: &DrillConfig, raw: &Value) -> Result<ListOptions, DrillError> {
    Ok(ListOptions {
        field_selector: join_clauses(&config.field_selectors, raw)?,
        label_selector: join_clauses(&config.label_selectors, raw)?,
    })
}

fn join_clauses(templates: &[Template], raw: &Value) -> Result<Option<String>, DrillError> {
    let mut clauses = Vec::with_capacity(templates.len());
    for template in templates {
        let clause = template.render(raw).map_err(|source| DrillError::Render {
            template: template.source().to_string(),
            source,
        })?;
        if !clause.trim().is_empty() {
            clauses.push(clause);
        }
    }
    Ok((!clauses.is_empty()).then(|| clauses.join(",")))
}

/// Cluster-scoped targets are always queried across all namespaces.
pub fn target_scope(parent_namespace: Option<&str>, target_namespaced: bool) -> NamespaceScope {
    match parent_namespace {
        Some(namespace) if target_namespaced && !namespace.is_empty() => {
            NamespaceScope::Named(namespace.to_string())
        }
        _ => NamespaceScope::All,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DrillError, DrillPlan, DrillRule, can_drill_down, plan, related_query, target_scope,
    };
    use crate::model::{NamespaceScope, ResourceKind, RowIdentity, ViewQuery};
    use crate::nav::{Memento, NavigationStack};
    use crate::table::ResourceTable;
    use crate::views::ViewRegistry;
    use serde_json::json;

    fn registry() -> ViewRegistry {
        ViewRegistry::from_yaml(include_str!("views.yaml"), "embedded").unwrap()
    }

    fn default_scope() -> NamespaceScope {
        NamespaceScope::Named("default".to_string())
    }

    #[test]
    fn fixed_rules_win_over_configuration() {
        let views = registry();
        assert!(can_drill_down(&ResourceKind::pods(), &views));
        assert!(can_drill_down(&ResourceKind::containers(), &views));
        assert!(can_drill_down(&ResourceKind::new("deployments"), &views));
        assert!(!can_drill_down(&ResourceKind::new("events"), &views));
        assert!(!can_drill_down(&ResourceKind::contexts(), &views));
        assert!(!can_drill_down(&ResourceKind::new("configmaps"), &views));
        assert_eq!(
            DrillRule::for_kind(&ResourceKind::pods(), &views),
            DrillRule::PodContainers
        );
    }

    #[test]
    fn pod_drills_into_its_containers() {
        let views = registry();
        let query = ViewQuery::new(ResourceKind::pods(), default_scope());
        let selected = RowIdentity::new("default", "web-0");

        let next = plan(&query, Some(&selected), &NavigationStack::default(), &views).unwrap();
        assert_eq!(
            next,
            DrillPlan::Query(ViewQuery::pod_containers("default", "web-0"))
        );
    }

    #[test]
    fn container_logs_recover_pod_from_stack() {
        let views = registry();
        let mut stack = NavigationStack::default();
        stack.push(Memento {
            table: ResourceTable::new(
                ViewQuery::new(ResourceKind::pods(), NamespaceScope::All),
                vec!["NAMESPACE".to_string(), "NAME".to_string()],
            ),
            cursor: 0,
            page: 0,
            last_error: None,
            overlay: None,
            selected: Some(RowIdentity::new("shop", "web-0")),
        });

        let query = ViewQuery::pod_containers("shop", "web-0");
        let selected = RowIdentity::new("", "proxy");
        let next = plan(&query, Some(&selected), &stack, &views).unwrap();
        assert_eq!(
            next,
            DrillPlan::Logs {
                namespace: "shop".to_string(),
                pod: "web-0".to_string(),
                container: Some("proxy".to_string()),
            }
        );
    }

    #[test]
    fn unsupported_and_unselected_drills_fail() {
        let views = registry();
        let stack = NavigationStack::default();
        let events = ViewQuery::new(ResourceKind::new("events"), default_scope());
        assert_eq!(
            plan(&events, Some(&RowIdentity::new("default", "x")), &stack, &views),
            Err(DrillError::Unsupported("events".to_string()))
        );

        let pods = ViewQuery::new(ResourceKind::pods(), default_scope());
        assert_eq!(plan(&pods, None, &stack, &views), Err(DrillError::NoSelection));
    }

    #[test]
    fn configured_rules_render_selectors_against_parent() {
        let views = registry();
        let query = ViewQuery::new(ResourceKind::new("deployments"), default_scope());
        let selected = RowIdentity::new("default", "web");
        let DrillPlan::Related { config, .. } =
            plan(&query, Some(&selected), &NavigationStack::default(), &views).unwrap()
        else {
            panic!("deployments drill through configuration");
        };

        let deployment = json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {"selector": {"matchLabels": {"tier": "web", "app": "shop"}}}
        });
        let child = related_query(&config, &deployment, true).unwrap();
        assert!(child.kind.is(ResourceKind::PODS));
        assert_eq!(child.scope, default_scope());
        assert_eq!(
            child.options.label_selector.as_deref(),
            Some("app=shop,tier=web")
        );
        assert_eq!(child.options.field_selector, None);
    }

    #[test]
    fn cluster_scoped_parent_queries_all_namespaces() {
        let views = registry();
        let config = views
            .get_view("nodes")
            .drill
            .clone()
            .expect("nodes drill config");
        let node = json!({"metadata": {"name": "node-a"}});
        let child = related_query(&config, &node, true).unwrap();
        assert_eq!(child.scope, NamespaceScope::All);
        assert_eq!(
            child.options.field_selector.as_deref(),
            Some("spec.nodeName=node-a")
        );

        let broken = related_query(&config, &json!({"metadata": {}}), true);
        assert!(matches!(broken, Err(DrillError::Render { .. })));
    }

    #[test]
    fn namespace_only_propagates_to_namespaced_targets() {
        assert_eq!(
            target_scope(Some("shop"), true),
            NamespaceScope::Named("shop".to_string())
        );
        assert_eq!(target_scope(Some("shop"), false), NamespaceScope::All);
        assert_eq!(target_scope(None, true), NamespaceScope::All);
    }
}
