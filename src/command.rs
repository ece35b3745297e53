use crate::model::{NamespaceScope, ResourceKind};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

pub const HISTORY_CAPACITY: usize = 50;

const NAMESPACE_FLAGS: [&str; 3] = ["all", "-n", "--namespace"];

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Quit,
    Reconnect,
    Resource {
        token: String,
        scope: Option<NamespaceScope>,
    },
    Describe,
    CopyLogs {
        all: bool,
        path: Option<PathBuf>,
    },
    Help,
    Context(String),
    Extension(String),
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("no command entered")]
    Empty,
    #[error("unknown command `{0}`")]
    UnknownVerb(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unexpected argument `{0}`")]
    UnexpectedArgument(String),
}

/// Parses one command line. `extensions` are the aliases registered by
/// extensions; built-in verbs take precedence over them.
pub fn parse(line: &str, extensions: &[String]) -> Result<Command, CommandError> {
    let normalized = normalize_input(line);
    let mut tokens = normalized.split_whitespace();
    let Some(verb) = tokens.next() else {
        return Err(CommandError::Empty);
    };
    let args = tokens.collect::<Vec<_>>();

    match verb {
        "quit" | "q" => no_arguments(&args, Command::Quit),
        "reconnect" | "r" => no_arguments(&args, Command::Reconnect),
        "describe" | "desc" => no_arguments(&args, Command::Describe),
        "help" | "h" => no_arguments(&args, Command::Help),
        "resource" | "rs" => {
            let Some((token, rest)) = args.split_first() else {
                return Err(CommandError::Usage("resource <name>[/<version>] [-n <ns>|<ns>|all]"));
            };
            Ok(Command::Resource {
                token: token.to_string(),
                scope: parse_namespace(rest)?,
            })
        }
        "cplogs" | "cp" => {
            let (all, rest) = match args.split_first() {
                Some((&"all", rest)) => (true, rest),
                _ => (false, args.as_slice()),
            };
            match rest {
                [] => Ok(Command::CopyLogs { all, path: None }),
                [path] => Ok(Command::CopyLogs {
                    all,
                    path: Some(PathBuf::from(path)),
                }),
                [_, extra, ..] => Err(CommandError::UnexpectedArgument(extra.to_string())),
            }
        }
        "ctx" | "context" => match args.as_slice() {
            [context] => Ok(Command::Context(context.to_string())),
            _ => Err(CommandError::Usage("ctx <context-name>")),
        },
        other if extensions.iter().any(|alias| alias == other) => {
            Ok(Command::Extension(other.to_string()))
        }
        other => Err(CommandError::UnknownVerb(other.to_string())),
    }
}

fn no_arguments(args: &[&str], command: Command) -> Result<Command, CommandError> {
    match args.first() {
        Some(extra) => Err(CommandError::UnexpectedArgument(extra.to_string())),
        None => Ok(command),
    }
}

/// `-n X`, `--namespace X`, `--namespace=X` or a bare `X`; `all` clears the
/// namespace filter. `None` when no namespace was given.
pub fn parse_namespace(args: &[&str]) -> Result<Option<NamespaceScope>, CommandError> {
    const USAGE: &str = "-n <namespace> | --namespace <namespace> | <namespace> | all";
    let namespace = match args {
        [] => return Ok(None),
        ["-n" | "--namespace"] => return Err(CommandError::Usage(USAGE)),
        ["-n" | "--namespace", namespace] => *namespace,
        [flag] if flag.starts_with("--namespace=") => &flag["--namespace=".len()..],
        [flag] if flag.starts_with('-') => {
            return Err(CommandError::UnexpectedArgument(flag.to_string()));
        }
        [namespace] => *namespace,
        [_, _, extra, ..] | [_, extra] => {
            return Err(CommandError::UnexpectedArgument(extra.to_string()));
        }
    };
    if namespace.trim().is_empty() {
        return Err(CommandError::Usage(USAGE));
    }
    Ok(Some(NamespaceScope::from_token(namespace)))
}

pub fn normalize_input(input: &str) -> String {
    let mut query = input.trim();
    while let Some(stripped) = query.strip_prefix(':') {
        query = stripped.trim_start();
    }
    query.to_string()
}

#[derive(Debug, Clone, Default)]
struct Node {
    children: BTreeMap<String, Node>,
}

impl Node {
    fn insert(&mut self, token: &str) -> &mut Node {
        self.children.entry(token.to_string()).or_default()
    }
}

/// Trie of command tokens: each node lists the tokens that may follow.
#[derive(Debug, Clone, Default)]
pub struct SuggestionTree {
    root: Node,
}

impl SuggestionTree {
    pub fn build(resources: &[String], contexts: &[String], extensions: &[String]) -> Self {
        let mut root = Node::default();
        for verb in ["quit", "q", "reconnect", "r", "describe", "desc", "help", "h"] {
            root.insert(verb);
        }

        for verb in ["resource", "rs"] {
            let node = root.insert(verb);
            for resource in resources {
                let resource_node = node.insert(resource);
                for flag in NAMESPACE_FLAGS {
                    resource_node.insert(flag);
                }
            }
        }

        for verb in ["cplogs", "cp"] {
            root.insert(verb).insert("all");
        }

        for verb in ["ctx", "context"] {
            let node = root.insert(verb);
            for context in contexts {
                node.insert(context);
            }
        }

        for alias in extensions {
            root.insert(alias);
        }

        Self { root }
    }

    /// Candidates for the token being typed at the end of `line`, shortest
    /// first and alphabetical within a length.
    pub fn suggestions(&self, line: &str) -> Vec<String> {
        let normalized = normalize_input(line);
        let mut tokens = normalized.split_whitespace().collect::<Vec<_>>();
        let partial = if line.ends_with(char::is_whitespace) || tokens.is_empty() {
            ""
        } else {
            tokens.pop().unwrap_or_default()
        };

        let mut node = &self.root;
        for token in tokens {
            let Some(next) = node.children.get(token) else {
                return Vec::new();
            };
            node = next;
        }

        let mut candidates = node
            .children
            .keys()
            .filter(|candidate| candidate.starts_with(partial))
            .cloned()
            .collect::<Vec<_>>();
        candidates.sort_by(|left, right| left.len().cmp(&right.len()).then_with(|| left.cmp(right)));
        candidates
    }

    /// `line` with its last token replaced by `candidate`.
    pub fn complete(line: &str, candidate: &str) -> String {
        let normalized = normalize_input(line);
        let mut tokens = normalized.split_whitespace().collect::<Vec<_>>();
        if !line.ends_with(char::is_whitespace) {
            tokens.pop();
        }
        tokens.push(candidate);
        let mut completed = tokens.join(" ");
        completed.push(' ');
        completed
    }
}

/// Bounded ring of submitted commands, newest last.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<String>,
    capacity: usize,
    cursor: Option<usize>,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            cursor: None,
        }
    }

    pub fn record(&mut self, line: &str) {
        self.reset();
        let line = line.trim();
        if line.is_empty() || self.entries.back().is_some_and(|last| last == line) {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.to_string());
    }

    /// One step older; stays on the oldest entry once reached.
    pub fn older(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = match self.cursor {
            None => self.entries.len() - 1,
            Some(index) => index.saturating_sub(1),
        };
        self.cursor = Some(index);
        self.entries.get(index).map(String::as_str)
    }

    /// One step newer; `None` once past the newest entry.
    pub fn newer(&mut self) -> Option<&str> {
        let index = self.cursor? + 1;
        if index >= self.entries.len() {
            self.cursor = None;
            return None;
        }
        self.cursor = Some(index);
        self.entries.get(index).map(String::as_str)
    }

    pub fn reset(&mut self) {
        self.cursor = None;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// Resolves a typed resource token against the discovered names.
pub fn resolve_resource(token: &str, known: &[String]) -> Option<ResourceKind> {
    let kind = ResourceKind::parse(token)?;
    let pseudo = [ResourceKind::CONTAINERS, ResourceKind::CONTEXTS];
    if pseudo.contains(&kind.resource.as_str()) || known.iter().any(|name| name == &kind.resource) {
        Some(kind)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Command, CommandError, History, SuggestionTree, parse, parse_namespace, resolve_resource,
    };
    use crate::model::NamespaceScope;
    use std::path::PathBuf;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn tree() -> SuggestionTree {
        SuggestionTree::build(
            &strings(&["pods", "persistentvolumes", "deployments", "services"]),
            &strings(&["kind-dev", "prod"]),
            &strings(&["shell", "sh"]),
        )
    }

    #[test]
    fn namespace_argument_forms() {
        let named = Some(NamespaceScope::Named("kube-system".to_string()));
        assert_eq!(parse_namespace(&["-n", "kube-system"]), Ok(named.clone()));
        assert_eq!(parse_namespace(&["--namespace", "kube-system"]), Ok(named.clone()));
        assert_eq!(parse_namespace(&["--namespace=kube-system"]), Ok(named.clone()));
        assert_eq!(parse_namespace(&["kube-system"]), Ok(named));
        assert_eq!(parse_namespace(&["all"]), Ok(Some(NamespaceScope::All)));
        assert_eq!(parse_namespace(&[]), Ok(None));
        assert!(matches!(parse_namespace(&["-n"]), Err(CommandError::Usage(_))));
        assert!(matches!(
            parse_namespace(&["a", "b"]),
            Err(CommandError::UnexpectedArgument(extra)) if extra == "b"
        ));
    }

    #[test]
    fn verbs_and_aliases_parse() {
        let extensions = strings(&["shell", "sh"]);
        assert_eq!(parse(":q", &extensions), Ok(Command::Quit));
        assert_eq!(parse("reconnect", &extensions), Ok(Command::Reconnect));
        assert_eq!(parse("desc", &extensions), Ok(Command::Describe));
        assert_eq!(
            parse("rs deployments.apps/v1 -n shop", &extensions),
            Ok(Command::Resource {
                token: "deployments.apps/v1".to_string(),
                scope: Some(NamespaceScope::Named("shop".to_string())),
            })
        );
        assert_eq!(
            parse("cp all /tmp/logs", &extensions),
            Ok(Command::CopyLogs {
                all: true,
                path: Some(PathBuf::from("/tmp/logs")),
            })
        );
        assert_eq!(
            parse("cplogs", &extensions),
            Ok(Command::CopyLogs {
                all: false,
                path: None
            })
        );
        assert_eq!(
            parse("ctx prod", &extensions),
            Ok(Command::Context("prod".to_string()))
        );
        assert_eq!(
            parse("sh", &extensions),
            Ok(Command::Extension("sh".to_string()))
        );
    }

    #[test]
    fn bad_command_lines_are_errors() {
        assert_eq!(parse("   ", &[]), Err(CommandError::Empty));
        assert_eq!(
            parse("frobnicate", &[]),
            Err(CommandError::UnknownVerb("frobnicate".to_string()))
        );
        assert!(matches!(parse("rs", &[]), Err(CommandError::Usage(_))));
        assert!(matches!(
            parse("quit now", &[]),
            Err(CommandError::UnexpectedArgument(_))
        ));
    }

    #[test]
    fn suggestions_are_shortest_first() {
        let tree = tree();
        assert_eq!(
            tree.suggestions("r"),
            strings(&["r", "rs", "resource", "reconnect"])
        );
        assert_eq!(tree.suggestions("rs p"), strings(&["pods", "persistentvolumes"]));
        assert_eq!(tree.suggestions("rs pods "), strings(&["-n", "all", "--namespace"]));
        assert_eq!(tree.suggestions("ctx "), strings(&["prod", "kind-dev"]));
        assert!(tree.suggestions("rs nothing ").is_empty());
        assert!(tree.suggestions("s").contains(&"shell".to_string()));
    }

    #[test]
    fn suggestion_prefix_law_holds() {
        let tree = tree();
        for line in ["resource", "rs pers", "cplogs a", "ctx kind-", "shel"] {
            let mut longer = tree.suggestions(line);
            for cut in (0..line.len()).rev() {
                let prefix = &line[..cut];
                let shorter = tree.suggestions(prefix);
                let partial = prefix.split_whitespace().last().unwrap_or("");
                if !prefix.ends_with(' ') {
                    assert!(shorter.iter().all(|candidate| candidate.starts_with(partial)));
                }
                if prefix.split_whitespace().count() == line.split_whitespace().count() {
                    assert!(longer.iter().all(|candidate| shorter.contains(candidate)));
                    longer = shorter;
                }
            }
        }
    }

    #[test]
    fn completion_replaces_the_partial_token() {
        assert_eq!(SuggestionTree::complete("rs po", "pods"), "rs pods ");
        assert_eq!(SuggestionTree::complete("rs ", "pods"), "rs pods ");
    }

    #[test]
    fn history_cycles_without_mutation() {
        let mut history = History::with_capacity(3);
        for line in ["rs pods", "rs pods", "describe", "cp", "q"] {
            history.record(line);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.entries().collect::<Vec<_>>(), vec!["describe", "cp", "q"]);

        assert_eq!(history.older(), Some("q"));
        assert_eq!(history.older(), Some("cp"));
        assert_eq!(history.older(), Some("describe"));
        assert_eq!(history.older(), Some("describe"));
        assert_eq!(history.newer(), Some("cp"));
        assert_eq!(history.newer(), Some("q"));
        assert_eq!(history.newer(), None);
        assert_eq!(history.len(), 3);

        history.older();
        history.reset();
        assert_eq!(history.older(), Some("q"));
    }

    #[test]
    fn resource_tokens_validate_against_discovery() {
        let known = strings(&["pods", "deployments"]);
        assert!(resolve_resource("deployments/v1", &known).is_some());
        assert!(resolve_resource("containers", &known).is_some());
        assert!(resolve_resource("widgets", &known).is_none());
    }
}
