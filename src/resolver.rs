//! Column resolution: turns one raw object into one display string.
//!
//! A field is resolved by a named built-in function, by a template evaluated
//! against the object's untyped content, or both. The function always wins
//! when it yields a value.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("path {0} is missing")]
    MissingPath(String),
    #[error("{func}: {reason}")]
    Function { func: &'static str, reason: String },
    #[error("{0} cannot be rendered by this action")]
    Unrenderable(String),
    #[error("no resolver strategy produced a value")]
    NoStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed action starting at byte {0}")]
    Unclosed(usize),
    #[error("empty action at byte {0}")]
    EmptyAction(usize),
    #[error("unterminated string literal in `{0}`")]
    UnterminatedString(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{func}` expects {expected}")]
    Arguments {
        func: &'static str,
        expected: &'static str,
    },
    #[error("`{0}` is not a path (paths start with '.')")]
    NotAPath(String),
}

/// A parsed template such as `{{ .metadata.namespace }}/{{ .metadata.name }}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Action(Action),
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Path(Path),
    Len(Path),
    Join(Path, String),
    Labels(Path),
    Index(Path, String),
    Default(String, Path),
}

#[derive(Debug, Clone, PartialEq)]
struct Path {
    raw: String,
    keys: Vec<String>,
}

impl Path {
    fn parse(token: &str) -> Result<Self, TemplateError> {
        let Some(rest) = token.strip_prefix('.') else {
            return Err(TemplateError::NotAPath(token.to_string()));
        };
        let keys = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('.').map(str::to_string).collect::<Vec<_>>()
        };
        if keys.iter().any(String::is_empty) {
            return Err(TemplateError::NotAPath(token.to_string()));
        }

        Ok(Self {
            raw: token.to_string(),
            keys,
        })
    }

    fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for key in &self.keys {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        if current.is_null() { None } else { Some(current) }
    }

    fn require<'a>(&self, root: &'a Value) -> Result<&'a Value, ResolutionError> {
        self.lookup(root)
            .ok_or_else(|| ResolutionError::MissingPath(self.raw.clone()))
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0usize;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                return Err(TemplateError::Unclosed(offset + start));
            };
            let body = after_open[..end].trim();
            if body.is_empty() {
                return Err(TemplateError::EmptyAction(offset + start));
            }
            segments.push(Segment::Action(parse_action(body)?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Single-path template, e.g. `["metadata", "name"]` for `{{ .metadata.name }}`.
    pub fn field(keys: &[&str]) -> Self {
        let raw = format!(".{}", keys.join("."));
        Self {
            source: format!("{{{{ {raw} }}}}"),
            segments: vec![Segment::Action(Action::Path(Path {
                raw,
                keys: keys.iter().map(|key| key.to_string()).collect(),
            }))],
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, root: &Value) -> Result<String, ResolutionError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Action(action) => out.push_str(&render_action(action, root)?),
            }
        }
        Ok(out)
    }
}

fn parse_action(body: &str) -> Result<Action, TemplateError> {
    let tokens = tokenize(body)?;
    let Some((head, args)) = tokens.split_first() else {
        return Err(TemplateError::EmptyAction(0));
    };
    if head.starts_with('.') && args.is_empty() {
        return Ok(Action::Path(Path::parse(head)?));
    }

    match (head.as_str(), args) {
        ("len", [path]) => Ok(Action::Len(Path::parse(path)?)),
        ("len", _) => Err(TemplateError::Arguments {
            func: "len",
            expected: "one path",
        }),
        ("join", [path, separator]) => Ok(Action::Join(
            Path::parse(path)?,
            unquote(separator, "join", "a path and a quoted separator")?,
        )),
        ("join", _) => Err(TemplateError::Arguments {
            func: "join",
            expected: "a path and a quoted separator",
        }),
        ("labels", [path]) => Ok(Action::Labels(Path::parse(path)?)),
        ("labels", _) => Err(TemplateError::Arguments {
            func: "labels",
            expected: "one path",
        }),
        ("index", [path, key]) => Ok(Action::Index(
            Path::parse(path)?,
            unquote(key, "index", "a path and a quoted key")?,
        )),
        ("index", _) => Err(TemplateError::Arguments {
            func: "index",
            expected: "a path and a quoted key",
        }),
        ("default", [fallback, path]) => Ok(Action::Default(
            unquote(fallback, "default", "a quoted fallback and a path")?,
            Path::parse(path)?,
        )),
        ("default", _) => Err(TemplateError::Arguments {
            func: "default",
            expected: "a quoted fallback and a path",
        }),
        (other, _) if other.starts_with('.') => Err(TemplateError::NotAPath(body.to_string())),
        (other, _) => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

fn unquote(
    token: &str,
    func: &'static str,
    expected: &'static str,
) -> Result<String, TemplateError> {
    token
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map(str::to_string)
        .ok_or(TemplateError::Arguments { func, expected })
}

fn tokenize(body: &str) -> Result<Vec<String>, TemplateError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_string = false;

    for ch in body.chars() {
        match ch {
            '"' => {
                current.push(ch);
                in_string = !in_string;
                if !in_string {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ch if ch.is_whitespace() && !in_string => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            ch => current.push(ch),
        }
    }
    if in_string {
        return Err(TemplateError::UnterminatedString(body.to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn render_action(action: &Action, root: &Value) -> Result<String, ResolutionError> {
    match action {
        Action::Path(path) => scalar_text(path.require(root)?, &path.raw),
        Action::Len(path) => {
            let len = match path.lookup(root) {
                None => 0,
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                Some(Value::String(text)) => text.chars().count(),
                Some(_) => return Err(ResolutionError::Unrenderable(path.raw.clone())),
            };
            Ok(len.to_string())
        }
        Action::Join(path, separator) => match path.require(root)? {
            Value::Array(items) => items
                .iter()
                .map(|item| scalar_text(item, &path.raw))
                .collect::<Result<Vec<_>, _>>()
                .map(|parts| parts.join(separator)),
            _ => Err(ResolutionError::Unrenderable(path.raw.clone())),
        },
        Action::Labels(path) => match path.require(root)? {
            Value::Object(map) => {
                let mut pairs = map
                    .iter()
                    .map(|(key, value)| Ok(format!("{key}={}", scalar_text(value, &path.raw)?)))
                    .collect::<Result<Vec<_>, ResolutionError>>()?;
                pairs.sort();
                Ok(pairs.join(","))
            }
            _ => Err(ResolutionError::Unrenderable(path.raw.clone())),
        },
        Action::Index(path, key) => match path.require(root)? {
            Value::Object(map) => map
                .get(key)
                .filter(|value| !value.is_null())
                .ok_or_else(|| ResolutionError::MissingPath(format!("{}[{key}]", path.raw)))
                .and_then(|value| scalar_text(value, &path.raw)),
            _ => Err(ResolutionError::Unrenderable(path.raw.clone())),
        },
        Action::Default(fallback, path) => match path.lookup(root) {
            Some(value) => scalar_text(value, &path.raw),
            None => Ok(fallback.clone()),
        },
    }
}

fn scalar_text(value: &Value, path: &str) -> Result<String, ResolutionError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        Value::Null => Err(ResolutionError::MissingPath(path.to_string())),
        other => serde_json::to_string(other)
            .map_err(|_| ResolutionError::Unrenderable(path.to_string())),
    }
}

/// Logic that a template cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFunc {
    Age,
    Ready,
    Restarts,
    Status,
    ContainerState,
    ContainerReady,
    ContainerRestarts,
}

impl BuiltinFunc {
    pub fn name(self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Ready => "ready",
            Self::Restarts => "restarts",
            Self::Status => "status",
            Self::ContainerState => "containerState",
            Self::ContainerReady => "containerReady",
            Self::ContainerRestarts => "containerRestarts",
        }
    }

    pub fn apply(self, raw: &Value) -> Result<String, ResolutionError> {
        match self {
            Self::Age => age(raw, Utc::now()),
            Self::Ready => {
                let statuses = container_statuses(raw);
                let total = raw
                    .pointer("/spec/containers")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .unwrap_or(statuses.len());
                let ready = statuses
                    .iter()
                    .filter(|status| status.get("ready").and_then(Value::as_bool) == Some(true))
                    .count();
                Ok(format!("{ready}/{total}"))
            }
            Self::Restarts => Ok(container_statuses(raw)
                .iter()
                .filter_map(|status| status.get("restartCount").and_then(Value::as_u64))
                .sum::<u64>()
                .to_string()),
            Self::Status => pod_status(raw),
            Self::ContainerState => container_state(raw),
            Self::ContainerReady => Ok(raw
                .pointer("/status/ready")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                .to_string()),
            Self::ContainerRestarts => Ok(raw
                .pointer("/status/restartCount")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                .to_string()),
        }
    }
}

impl FromStr for BuiltinFunc {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "age" => Ok(Self::Age),
            "ready" => Ok(Self::Ready),
            "restarts" => Ok(Self::Restarts),
            "status" => Ok(Self::Status),
            "containerState" => Ok(Self::ContainerState),
            "containerReady" => Ok(Self::ContainerReady),
            "containerRestarts" => Ok(Self::ContainerRestarts),
            other => Err(format!("unknown resolver function `{other}`")),
        }
    }
}

impl Display for BuiltinFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn container_statuses(raw: &Value) -> &[Value] {
    raw.pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn age(raw: &Value, now: DateTime<Utc>) -> Result<String, ResolutionError> {
    let stamp = raw
        .pointer("/metadata/creationTimestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| ResolutionError::MissingPath(".metadata.creationTimestamp".to_string()))?;
    let created = DateTime::parse_from_rfc3339(stamp).map_err(|error| ResolutionError::Function {
        func: "age",
        reason: error.to_string(),
    })?;
    let elapsed = (now - created.with_timezone(&Utc)).num_seconds().max(0);
    Ok(format_elapsed_seconds(elapsed))
}

pub fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}

fn pod_status(raw: &Value) -> Result<String, ResolutionError> {
    if raw.pointer("/metadata/deletionTimestamp").is_some_and(|stamp| !stamp.is_null()) {
        return Ok("Terminating".to_string());
    }

    let waiting = container_statuses(raw).iter().find_map(|status| {
        status
            .pointer("/state/waiting/reason")
            .and_then(Value::as_str)
    });
    if let Some(reason) = waiting {
        return Ok(reason.to_string());
    }

    raw.pointer("/status/phase")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ResolutionError::MissingPath(".status.phase".to_string()))
}

fn container_state(raw: &Value) -> Result<String, ResolutionError> {
    let Some(Value::Object(state)) = raw.pointer("/status/state") else {
        return Ok("pending".to_string());
    };
    if state.contains_key("running") {
        return Ok("running".to_string());
    }
    for key in ["waiting", "terminated"] {
        if let Some(detail) = state.get(key) {
            let reason = detail
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("-");
            return Ok(format!("{key}:{reason}"));
        }
    }
    Err(ResolutionError::Function {
        func: "containerState",
        reason: "container state carries no known variant".to_string(),
    })
}

/// One column's resolution strategy.
///
/// Built by the view registry from configuration; at least one strategy is
/// always present.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolver {
    func: Option<BuiltinFunc>,
    template: Option<Template>,
}

impl Resolver {
    pub fn template(template: Template) -> Self {
        Self {
            func: None,
            template: Some(template),
        }
    }

    pub fn func(func: BuiltinFunc) -> Self {
        Self {
            func: Some(func),
            template: None,
        }
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.template = Some(template);
        self
    }

    pub fn resolve(&self, raw: &Value) -> Result<String, ResolutionError> {
        let mut last_error = ResolutionError::NoStrategy;
        if let Some(func) = self.func {
            match func.apply(raw) {
                Ok(value) => return Ok(value),
                Err(error) => last_error = error,
            }
        }
        if let Some(template) = &self.template {
            return template.render(raw);
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BuiltinFunc, ResolutionError, Resolver, Template, TemplateError, age,
        format_elapsed_seconds,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn pod() -> serde_json::Value {
        json!({
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "labels": {"tier": "web", "app": "shop", "app.kubernetes.io/name": "shop"}
            },
            "spec": {
                "nodeName": "node-a",
                "containers": [{"name": "app", "image": "shop:1"}, {"name": "proxy", "image": "envoy:1"}]
            },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "app", "ready": true, "restartCount": 2},
                    {"name": "proxy", "ready": false, "restartCount": 1}
                ]
            }
        })
    }

    #[test]
    fn template_renders_paths_and_literals() {
        let template = Template::parse("{{ .metadata.namespace }}/{{.metadata.name}}").unwrap();
        assert_eq!(template.render(&pod()).unwrap(), "default/web-0");

        let indexed = Template::parse("{{ .spec.containers.1.image }}").unwrap();
        assert_eq!(indexed.render(&pod()).unwrap(), "envoy:1");
    }

    #[test]
    fn template_functions_cover_lists_and_maps() {
        let raw = pod();
        let len = Template::parse("{{ len .spec.containers }}").unwrap();
        assert_eq!(len.render(&raw).unwrap(), "2");

        let labels = Template::parse("{{ labels .metadata.labels }}").unwrap();
        assert_eq!(
            labels.render(&raw).unwrap(),
            "app.kubernetes.io/name=shop,app=shop,tier=web"
        );

        let index = Template::parse(r#"{{ index .metadata.labels "app.kubernetes.io/name" }}"#)
            .unwrap();
        assert_eq!(index.render(&raw).unwrap(), "shop");

        let fallback = Template::parse(r#"{{ default "<none>" .spec.hostNetwork }}"#).unwrap();
        assert_eq!(fallback.render(&raw).unwrap(), "<none>");

        let joined = Template::parse(r#"{{ join .tags ", " }}"#).unwrap();
        assert_eq!(
            joined.render(&json!({"tags": ["a", "b", 3]})).unwrap(),
            "a, b, 3"
        );
    }

    #[test]
    fn missing_path_is_a_resolution_error() {
        let template = Template::parse("{{ .spec.missing }}").unwrap();
        assert_eq!(
            template.render(&pod()),
            Err(ResolutionError::MissingPath(".spec.missing".to_string()))
        );
    }

    #[test]
    fn malformed_templates_fail_to_parse() {
        assert_eq!(
            Template::parse("{{ .metadata.name"),
            Err(TemplateError::Unclosed(0))
        );
        assert!(matches!(
            Template::parse("x {{ }}"),
            Err(TemplateError::EmptyAction(2))
        ));
        assert!(matches!(
            Template::parse("{{ upper .metadata.name }}"),
            Err(TemplateError::UnknownFunction(name)) if name == "upper"
        ));
        assert!(matches!(
            Template::parse("{{ join .a }}"),
            Err(TemplateError::Arguments { func: "join", .. })
        ));
        assert!(matches!(
            Template::parse("{{ metadata.name }}"),
            Err(TemplateError::UnknownFunction(_))
        ));
        assert!(matches!(
            Template::parse(r#"{{ default "x .a }}"#),
            Err(TemplateError::UnterminatedString(_))
        ));
    }

    #[test]
    fn builtin_functions_read_pod_status() {
        let raw = pod();
        assert_eq!(BuiltinFunc::Ready.apply(&raw).unwrap(), "1/2");
        assert_eq!(BuiltinFunc::Restarts.apply(&raw).unwrap(), "3");
        assert_eq!(BuiltinFunc::Status.apply(&raw).unwrap(), "Running");

        let now = Utc.with_ymd_and_hms(2024, 5, 3, 10, 0, 0).unwrap();
        assert_eq!(age(&raw, now).unwrap(), "2d");
    }

    #[test]
    fn status_prefers_waiting_reason_and_deletion() {
        let mut raw = pod();
        raw["status"]["containerStatuses"][1]["state"] =
            json!({"waiting": {"reason": "CrashLoopBackOff"}});
        assert_eq!(BuiltinFunc::Status.apply(&raw).unwrap(), "CrashLoopBackOff");

        raw["metadata"]["deletionTimestamp"] = json!("2024-05-01T11:00:00Z");
        assert_eq!(BuiltinFunc::Status.apply(&raw).unwrap(), "Terminating");
    }

    #[test]
    fn container_functions_read_merged_status() {
        let container = json!({
            "metadata": {"name": "app"},
            "status": {"ready": true, "restartCount": 4, "state": {"terminated": {"reason": "Completed"}}}
        });
        assert_eq!(
            BuiltinFunc::ContainerState.apply(&container).unwrap(),
            "terminated:Completed"
        );
        assert_eq!(BuiltinFunc::ContainerReady.apply(&container).unwrap(), "true");
        assert_eq!(BuiltinFunc::ContainerRestarts.apply(&container).unwrap(), "4");
        assert_eq!(
            BuiltinFunc::ContainerState.apply(&json!({})).unwrap(),
            "pending"
        );
    }

    #[test]
    fn elapsed_seconds_use_largest_unit() {
        assert_eq!(format_elapsed_seconds(42), "42s");
        assert_eq!(format_elapsed_seconds(61), "1m");
        assert_eq!(format_elapsed_seconds(7_200), "2h");
        assert_eq!(format_elapsed_seconds(200_000), "2d");
    }

    #[test]
    fn function_takes_priority_over_template() {
        let resolver = Resolver::func(BuiltinFunc::Ready)
            .with_template(Template::parse("{{ .metadata.name }}").unwrap());
        assert_eq!(resolver.resolve(&pod()).unwrap(), "1/2");

        let fallback = Resolver::func(BuiltinFunc::Age)
            .with_template(Template::parse("{{ .metadata.name }}").unwrap());
        assert_eq!(fallback.resolve(&json!({"metadata": {"name": "x"}})).unwrap(), "x");

        let missing = Resolver::func(BuiltinFunc::Age);
        assert!(matches!(
            missing.resolve(&json!({})),
            Err(ResolutionError::MissingPath(_))
        ));
    }
}
