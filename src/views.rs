use crate::model::ResourceKind;
use crate::resolver::{BuiltinFunc, Resolver, Template, TemplateError};
use crate::table::Row;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_VIEWS: &str = include_str!("views.yaml");
const PLACEHOLDER: &str = "<none>";
const CONTEXT_COLUMNS: [(&str, f32); 4] = [
    ("NAME", 0.3),
    ("CLUSTER", 0.3),
    ("USER", 0.25),
    ("NAMESPACE", 0.15),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read view config {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse view config {source_name}")]
    Parse {
        source_name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("view `{view}` field `{field}`: {source}")]
    Template {
        view: String,
        field: String,
        #[source]
        source: TemplateError,
    },
    #[error("view `{view}` field `{field}`: {message}")]
    Resolver {
        view: String,
        field: String,
        message: String,
    },
    #[error("view `{view}` drill target `{target}` is not a resource name")]
    DrillTarget { view: String, target: String },
}

#[derive(Debug, Clone, Deserialize)]
struct ViewSpec {
    #[serde(default)]
    drill: Option<DrillSpec>,
    #[serde(default)]
    fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct DrillSpec {
    resource: String,
    #[serde(default)]
    selectors: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSpec {
    name: String,
    #[serde(default = "default_weight")]
    weight: f32,
    resolver: ResolverSpec,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ResolverSpec {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    func: Option<String>,
}

fn default_weight() -> f32 {
    0.1
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub weight: f32,
    pub resolver: Resolver,
}

/// Generic drill-down: render selectors against the selected object and
/// list `target` with them.
#[derive(Debug, Clone, PartialEq)]
pub struct DrillConfig {
    pub target: ResourceKind,
    pub field_selectors: Vec<Template>,
    pub label_selectors: Vec<Template>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceView {
    pub fields: Vec<Field>,
    pub drill: Option<DrillConfig>,
}

impl ResourceView {
    /// NAMESPACE and NAME, both read straight from metadata.
    pub fn fallback() -> Self {
        let field = |name: &str, key: &str| Field {
            name: name.to_string(),
            weight: 0.5,
            resolver: Resolver::template(Template::field(&["metadata", key])),
        };
        Self {
            fields: vec![field("NAMESPACE", "namespace"), field("NAME", "name")],
            drill: None,
        }
    }

    pub fn titles(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    /// Resolves every column; a column that cannot be resolved shows a
    /// placeholder instead of failing the row.
    pub fn resolve_row(&self, raw: &Value) -> Row {
        self.fields
            .iter()
            .map(|field| match field.resolver.resolve(raw) {
                Ok(value) => value,
                Err(error) => {
                    debug!("column {} unresolved: {error}", field.name);
                    PLACEHOLDER.to_string()
                }
            })
            .collect()
    }
}

pub struct ViewRegistry {
    views: HashMap<String, Arc<ResourceView>>,
    fallback: Arc<ResourceView>,
    source: Option<String>,
}

impl ViewRegistry {
    /// Embedded defaults plus `$SKIFF_VIEWS` or `~/.config/skiff/views.yaml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = views_path_from(
            std::env::var("SKIFF_VIEWS").ok(),
            std::env::var("HOME").ok(),
        );
        Self::load_from(path.as_deref())
    }

    /// Embedded defaults, replaced entry-by-entry by the file at `overrides`
    /// when it exists and parses. Only a broken embedded default is an error.
    pub fn load_from(overrides: Option<&Path>) -> Result<Self, ConfigError> {
        let mut registry = Self::from_yaml(DEFAULT_VIEWS, "embedded defaults")?;
        let Some(path) = overrides else {
            return Ok(registry);
        };

        match read_overrides(path) {
            Ok(overrides) => {
                info!(
                    "loaded {} view override(s) from {}",
                    overrides.len(),
                    path.display()
                );
                registry.views.extend(overrides);
                registry.source = Some(path.display().to_string());
            }
            Err(error) => warn!("ignoring view overrides: {error}"),
        }
        Ok(registry)
    }

    pub fn from_yaml(raw: &str, source_name: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            views: parse_views(raw, source_name)?,
            fallback: Arc::new(ResourceView::fallback()),
            source: None,
        })
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn get_view(&self, resource: &str) -> Arc<ResourceView> {
        self.views
            .get(resource)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    #[cfg(test)]
    pub fn is_configured(&self, resource: &str) -> bool {
        self.views.contains_key(resource)
    }

    pub fn titles(&self, resource: &str) -> Vec<String> {
        if resource == ResourceKind::CONTEXTS {
            return CONTEXT_COLUMNS
                .iter()
                .map(|(title, _)| title.to_string())
                .collect();
        }
        self.get_view(resource).titles()
    }

    /// Column titles and widths for a table `total_width` cells wide.
    pub fn get_columns(&self, total_width: u16, resource: &str) -> Vec<(String, u16)> {
        let scale = |weight: f32| (weight * f32::from(total_width)).round().max(1.0) as u16;
        if resource == ResourceKind::CONTEXTS {
            return CONTEXT_COLUMNS
                .iter()
                .map(|(title, weight)| (title.to_string(), scale(*weight)))
                .collect();
        }

        self.get_view(resource)
            .fields
            .iter()
            .map(|field| (field.name.clone(), scale(field.weight)))
            .collect()
    }
}

fn read_overrides(path: &Path) -> Result<HashMap<String, Arc<ResourceView>>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_views(&raw, &path.display().to_string())
}

fn parse_views(
    raw: &str,
    source_name: &str,
) -> Result<HashMap<String, Arc<ResourceView>>, ConfigError> {
    let specs: BTreeMap<String, ViewSpec> =
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            source_name: source_name.to_string(),
            source,
        })?;

    specs
        .into_iter()
        .map(|(name, spec)| {
            let view = build_view(&name, spec)?;
            Ok((name, Arc::new(view)))
        })
        .collect()
}

fn build_view(name: &str, spec: ViewSpec) -> Result<ResourceView, ConfigError> {
    let template = |field: &str, source: &str| {
        Template::parse(source).map_err(|source| ConfigError::Template {
            view: name.to_string(),
            field: field.to_string(),
            source,
        })
    };

    let mut fields = Vec::with_capacity(spec.fields.len());
    for field in spec.fields {
        let func = field
            .resolver
            .func
            .as_deref()
            .map(str::parse::<BuiltinFunc>)
            .transpose()
            .map_err(|message| ConfigError::Resolver {
                view: name.to_string(),
                field: field.name.clone(),
                message,
            })?;
        let path = field
            .resolver
            .path
            .as_deref()
            .map(|source| template(&field.name, source))
            .transpose()?;

        let resolver = match (func, path) {
            (Some(func), Some(path)) => Resolver::func(func).with_template(path),
            (Some(func), None) => Resolver::func(func),
            (None, Some(path)) => Resolver::template(path),
            (None, None) => {
                return Err(ConfigError::Resolver {
                    view: name.to_string(),
                    field: field.name,
                    message: "resolver needs a path or a func".to_string(),
                });
            }
        };
        fields.push(Field {
            name: field.name,
            weight: field.weight,
            resolver,
        });
    }

    let drill = spec
        .drill
        .map(|drill| {
            let target = ResourceKind::parse(&drill.resource).ok_or_else(|| {
                ConfigError::DrillTarget {
                    view: name.to_string(),
                    target: drill.resource.clone(),
                }
            })?;
            let field_selectors = drill
                .selectors
                .iter()
                .map(|source| template("drill.selectors", source))
                .collect::<Result<Vec<_>, _>>()?;
            let label_selectors = drill
                .labels
                .iter()
                .map(|source| template("drill.labels", source))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DrillConfig {
                target,
                field_selectors,
                label_selectors,
            })
        })
        .transpose()?;

    Ok(ResourceView { fields, drill })
}

/// An explicit path is used even when missing, so the failure gets logged.
/// The home candidate only counts when it exists.
fn views_path_from(explicit: Option<String>, home: Option<String>) -> Option<PathBuf> {
    if let Some(path) = explicit
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let candidate = PathBuf::from(home?).join(".config/skiff/views.yaml");
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, DEFAULT_VIEWS, ResourceView, ViewRegistry, views_path_from};
    use std::fs;
    use std::path::PathBuf;
    use crate::model::ResourceKind;
    use serde_json::json;

    #[test]
    fn embedded_defaults_parse() {
        let registry = ViewRegistry::from_yaml(DEFAULT_VIEWS, "embedded").expect("defaults");
        assert!(registry.is_configured("pods"));
        assert!(registry.is_configured("containers"));
        let nodes = registry.get_view("nodes");
        let drill = nodes.drill.as_ref().expect("nodes drill into pods");
        assert!(drill.target.is(ResourceKind::PODS));
        assert_eq!(drill.field_selectors.len(), 1);
    }

    #[test]
    fn unknown_kind_gets_two_column_fallback() {
        let registry = ViewRegistry::from_yaml(DEFAULT_VIEWS, "embedded").unwrap();
        let view = registry.get_view("totally-unknown-kind");
        assert_eq!(view.titles(), vec!["NAMESPACE", "NAME"]);
        assert!(view.drill.is_none());

        let row = view.resolve_row(&json!({"metadata": {"name": "x", "namespace": "ns"}}));
        assert_eq!(row, vec!["ns", "x"]);
        assert_eq!(*view, ResourceView::fallback());
    }

    #[test]
    fn unresolved_columns_show_placeholder() {
        let registry = ViewRegistry::from_yaml(DEFAULT_VIEWS, "embedded").unwrap();
        let row = registry
            .get_view("namespaces")
            .resolve_row(&json!({"metadata": {"name": "dev"}}));
        assert_eq!(row, vec!["dev", "<none>", "<none>"]);
    }

    #[test]
    fn columns_scale_weights_by_width() {
        let registry = ViewRegistry::from_yaml(
            r#"
widgets:
  fields:
    - name: NAME
      weight: 0.75
      resolver: { path: "{{ .metadata.name }}" }
    - name: AGE
      weight: 0.25
      resolver: { func: age }
"#,
            "test",
        )
        .unwrap();
        assert_eq!(
            registry.get_columns(100, "widgets"),
            vec![("NAME".to_string(), 75), ("AGE".to_string(), 25)]
        );

        let contexts = registry.get_columns(100, ResourceKind::CONTEXTS);
        assert_eq!(contexts.len(), 4);
        assert_eq!(contexts[0], ("NAME".to_string(), 30));
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("skiff-views-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn overrides_replace_whole_entries() {
        let path = scratch_dir("override").join("views.yaml");
        fs::write(
            &path,
            r#"
pods:
  fields:
    - name: NAME
      resolver: { path: "{{ .metadata.name }}" }
"#,
        )
        .unwrap();

        let registry = ViewRegistry::load_from(Some(&path)).unwrap();
        let pods = registry.get_view("pods");
        assert_eq!(pods.titles(), vec!["NAME"]);
        assert!(registry.is_configured("deployments"));
        assert_eq!(registry.source(), Some(path.display().to_string().as_str()));
    }

    #[test]
    fn broken_or_missing_override_falls_back_to_defaults() {
        let defaults = ViewRegistry::from_yaml(DEFAULT_VIEWS, "embedded").unwrap();
        let dir = scratch_dir("broken");
        let broken = dir.join("views.yaml");
        fs::write(&broken, "pods: [").unwrap();

        for path in [broken, dir.join("absent.yaml")] {
            let registry = ViewRegistry::load_from(Some(&path)).unwrap();
            assert_eq!(registry.source(), None);
            assert_eq!(registry.titles("pods"), defaults.titles("pods"));
        }

        let registry = ViewRegistry::load_from(None).unwrap();
        assert_eq!(registry.titles("pods"), defaults.titles("pods"));
    }

    #[test]
    fn explicit_views_path_wins_over_home() {
        let home = scratch_dir("home");
        let config = home.join(".config/skiff");
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("views.yaml"), "{}").unwrap();
        let home = Some(home.display().to_string());

        assert_eq!(
            views_path_from(Some("/etc/skiff.yaml".to_string()), home.clone()),
            Some(PathBuf::from("/etc/skiff.yaml"))
        );
        assert_eq!(
            views_path_from(Some("  ".to_string()), home.clone()),
            Some(config.join("views.yaml"))
        );
        assert_eq!(views_path_from(None, Some("/nonexistent-home".to_string())), None);
        assert_eq!(views_path_from(None, None), None);
    }

    #[test]
    fn malformed_config_is_rejected() {
        let broken_yaml = ViewRegistry::from_yaml("pods: [", "broken");
        assert!(matches!(broken_yaml, Err(ConfigError::Parse { .. })));

        let broken_template = ViewRegistry::from_yaml(
            r#"
pods:
  fields:
    - name: NAME
      resolver: { path: "{{ .metadata.name" }
"#,
            "broken",
        );
        assert!(matches!(broken_template, Err(ConfigError::Template { .. })));

        let missing_strategy = ViewRegistry::from_yaml(
            r#"
pods:
  fields:
    - name: NAME
      resolver: {}
"#,
            "broken",
        );
        assert!(matches!(missing_strategy, Err(ConfigError::Resolver { .. })));

        let unknown_func = ViewRegistry::from_yaml(
            r#"
pods:
  fields:
    - name: NAME
      resolver: { func: shout }
"#,
            "broken",
        );
        assert!(matches!(unknown_func, Err(ConfigError::Resolver { .. })));
    }
}
