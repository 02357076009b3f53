//! Build recipes: what to run for an uploaded file and what to send back.

use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;
use crate::template::CommandTemplate;

/// Serializable recipe definition, as written in the daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct RecipeConfig {
    /// Short name; clients may request the recipe by it.
    pub name: String,
    /// Selects the recipe automatically when it matches the uploaded file name.
    pub file_glob: String,
    /// Command templates executed in order inside the working directory.
    pub command: Vec<String>,
    /// Selects the output files sent back to the client.
    pub output_glob: String,
    /// Maximum time, in milliseconds, for each command.
    pub max_time: u64,
}

impl RecipeConfig {
    /// Creates a recipe definition.
    pub fn new(
        name: impl Into<String>,
        file_glob: impl Into<String>,
        command: Vec<String>,
        output_glob: impl Into<String>,
        max_time: u64,
    ) -> Self {
        Self {
            name: name.into(),
            file_glob: file_glob.into(),
            command,
            output_glob: output_glob.into(),
            max_time,
        }
    }
}

/// A compiled, immutable recipe shared by every session that selects it.
#[derive(Debug)]
pub struct Recipe {
    /// Unique name.
    name: String,
    /// Matched against upload base names.
    file_glob: glob::Pattern,
    /// Parsed command templates, run in order.
    commands: Vec<CommandTemplate>,
    /// Output pattern, relative to the working directory.
    output_glob: String,
    /// Per-command time limit.
    max_time: Duration,
}

impl Recipe {
    /// Validates a definition and compiles its globs and command templates.
    pub fn compile(config: &RecipeConfig) -> Result<Self> {
        let invalid = |reason: String| Error::Recipe {
            name: config.name.clone(),
            reason,
        };

        if config.name.is_empty() {
            return Err(invalid("empty name".into()));
        }
        if config.command.is_empty() {
            return Err(invalid("no commands".into()));
        }
        if config.max_time == 0 {
            return Err(invalid("max_time must be positive".into()));
        }
        let output = Path::new(&config.output_glob);
        if config.output_glob.is_empty()
            || !output.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid(format!(
                "output glob {:?} must be a relative path inside the working directory",
                config.output_glob
            )));
        }
        glob::Pattern::new(&config.output_glob)?;

        let commands = config
            .command
            .iter()
            .map(|c| CommandTemplate::parse(c))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            file_glob: glob::Pattern::new(&config.file_glob)?,
            commands,
            output_glob: config.output_glob.clone(),
            max_time: Duration::from_millis(config.max_time),
        })
    }

    /// Recipe name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the recipe's file glob matches the base name of `filename`.
    pub fn matches_file(&self, filename: &str) -> bool {
        Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|base| self.file_glob.matches(base))
    }

    /// Command templates, in execution order.
    pub fn commands(&self) -> &[CommandTemplate] {
        &self.commands
    }

    /// Output glob, relative to the working directory.
    pub fn output_glob(&self) -> &str {
        &self.output_glob
    }

    /// Per-command time limit.
    pub const fn max_time(&self) -> Duration {
        self.max_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecipeConfig {
        RecipeConfig::new(
            "c",
            "*.c",
            vec!["cc -c {{.Filename}}".into(), "cc -o app main.o".into()],
            "app",
            30_000,
        )
    }

    #[test]
    fn compiles_valid_recipe() {
        let recipe = Recipe::compile(&config()).unwrap();
        assert_eq!(recipe.name(), "c");
        assert_eq!(recipe.commands().len(), 2);
        assert_eq!(recipe.output_glob(), "app");
        assert_eq!(recipe.max_time(), Duration::from_secs(30));
    }

    #[test]
    fn matches_base_name() {
        let recipe = Recipe::compile(&config()).unwrap();
        assert!(recipe.matches_file("main.c"));
        assert!(recipe.matches_file("src/main.c"));
        assert!(!recipe.matches_file("main.rs"));
        assert!(!recipe.matches_file(""));
    }

    #[test]
    fn rejects_invalid_definitions() {
        let mut c = config();
        c.command.clear();
        assert!(matches!(Recipe::compile(&c), Err(Error::Recipe { .. })));

        let mut c = config();
        c.max_time = 0;
        assert!(matches!(Recipe::compile(&c), Err(Error::Recipe { .. })));

        let mut c = config();
        c.output_glob = "../*".into();
        assert!(matches!(Recipe::compile(&c), Err(Error::Recipe { .. })));

        let mut c = config();
        c.output_glob = "/etc/*".into();
        assert!(matches!(Recipe::compile(&c), Err(Error::Recipe { .. })));

        let mut c = config();
        c.file_glob = "[".into();
        assert!(matches!(Recipe::compile(&c), Err(Error::Pattern(_))));

        let mut c = config();
        c.command = vec!["cc {{.Nope}}".into()];
        assert!(matches!(Recipe::compile(&c), Err(Error::Template(_))));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "name": "echo",
            "file_glob": "*.txt",
            "command": ["cp {{.Filename}} out.txt"],
            "output_glob": "out.*",
            "max_time": 1000
        }"#;
        let c: RecipeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.command, ["cp {{.Filename}} out.txt"]);
        assert!(Recipe::compile(&c).is_ok());
    }
}
