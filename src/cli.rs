use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "skiff",
    version,
    about = "A live, drillable Kubernetes resource browser for the terminal."
)]
pub struct CliArgs {
    /// Start in a specific namespace
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Start with all namespaces selected
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Initial resource kind, optionally as <name>/<version>
    #[arg(short, long, default_value = "pods")]
    pub resource: String,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Append logs to this file; logs are discarded otherwise
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::CliArgs;
    use clap::Parser;

    #[test]
    fn defaults_to_pods_in_current_namespace() {
        let args = CliArgs::try_parse_from(["skiff"]).unwrap();
        assert_eq!(args.resource, "pods");
        assert_eq!(args.namespace, None);
        assert!(!args.all_namespaces);
        assert_eq!(args.log_filter, "info");
    }

    #[test]
    fn parses_short_flags() {
        let args =
            CliArgs::try_parse_from(["skiff", "-n", "shop", "-r", "deployments", "--context", "prod"])
                .unwrap();
        assert_eq!(args.namespace.as_deref(), Some("shop"));
        assert_eq!(args.resource, "deployments");
        assert_eq!(args.context.as_deref(), Some("prod"));
    }
}
