use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::info;

/// A feature that takes over the terminal while it runs. The host suspends
/// its own rendering around `launch`.
pub trait Extension: Send {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn command_aliases(&self) -> Vec<String>;
    fn launch(&mut self) -> Result<()>;
}

#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(ShellExtension::from_env()));
        registry
    }

    /// Later registrations never shadow aliases already taken.
    pub fn register(&mut self, extension: Box<dyn Extension>) {
        let taken = self.aliases();
        if let Some(clash) = extension
            .command_aliases()
            .into_iter()
            .find(|alias| taken.contains(alias))
        {
            info!(
                "skipping extension {}: alias `{clash}` already registered",
                extension.name()
            );
            return;
        }
        self.extensions.push(extension);
    }

    pub fn aliases(&self) -> Vec<String> {
        self.extensions
            .iter()
            .flat_map(|extension| extension.command_aliases())
            .collect()
    }

    pub fn find_mut(&mut self, alias: &str) -> Option<&mut (dyn Extension + 'static)> {
        self.extensions
            .iter_mut()
            .find(|extension| extension.command_aliases().iter().any(|known| known == alias))
            .map(|extension| extension.as_mut())
    }

    /// One help line per extension.
    pub fn help_lines(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|extension| {
                format!(
                    "{:<18} {}",
                    extension.command_aliases().join("|"),
                    extension.description()
                )
            })
            .collect()
    }
}

/// Drops to the user's login shell until it exits.
pub struct ShellExtension {
    shell: String,
}

impl ShellExtension {
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self { shell }
    }
}

impl Extension for ShellExtension {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "suspend the dashboard and open a local shell"
    }

    fn command_aliases(&self) -> Vec<String> {
        vec!["shell".to_string(), "sh".to_string()]
    }

    fn launch(&mut self) -> Result<()> {
        let status = Command::new(&self.shell)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("failed to start {}", self.shell))?;
        if !status.success() {
            anyhow::bail!("{} exited with {status}", self.shell);
        }
        Ok(())
    }
}
