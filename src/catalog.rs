//! Command catalog.
//!
//! Resolves command ids to an executable path and argument template, and
//! formats templates into argument strings safe to write to a shell. The
//! built-in table is embedded in the binary; a YAML file can override or
//! extend it. The catalog is immutable once loaded.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ShellfsError;
use crate::executable::Executable;

const BUILTIN: &str = include_str!("../catalog/commands.yaml");

const PLACEHOLDER: &str = r"\{(\d+)\}";
const SPREAD: &str = "[@]";

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDefinition {
    /// Executable name or path.
    pub path: String,
    /// Argument template.
    #[serde(default)]
    pub args: String,
}

/// Escapes a value for use inside double quotes.
pub fn escape_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone)]
pub struct CommandCatalog {
    definitions: BTreeMap<String, CommandDefinition>,
    placeholder: Regex,
}

impl CommandCatalog {
    fn from_definitions(definitions: BTreeMap<String, CommandDefinition>) -> Result<Self, ShellfsError> {
        let placeholder = Regex::new(PLACEHOLDER)
            .map_err(|e| ShellfsError::InvalidCommandDefinition(format!("placeholder pattern: {}", e)))?;
        let catalog = Self {
            definitions,
            placeholder,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    fn parse(text: &str, origin: &str) -> Result<BTreeMap<String, CommandDefinition>, ShellfsError> {
        serde_yaml::from_str(text)
            .map_err(|e| ShellfsError::Config(format!("failed to parse catalog {}: {}", origin, e)))
    }

    /// Returns the built-in catalog.
    pub fn builtin() -> Result<Self, ShellfsError> {
        Self::from_definitions(Self::parse(BUILTIN, "(built-in)")?)
    }

    /// Parses a standalone catalog.
    pub fn from_yaml(text: &str) -> Result<Self, ShellfsError> {
        Self::from_definitions(Self::parse(text, "(inline)")?)
    }

    /// Returns the built-in catalog with the entries of `path` merged over it.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ShellfsError> {
        let mut definitions = Self::parse(BUILTIN, "(built-in)")?;
        if let Some(path) = path {
            let text = fs::read_to_string(path)
                .map_err(|e| ShellfsError::io(format!("failed to read catalog {}", path), e))?;
            let overrides = Self::parse(&text, path.as_str())?;
            debug!(catalog = %path, entries = overrides.len(), "merging catalog overrides");
            definitions.extend(overrides);
        }
        Self::from_definitions(definitions)
    }

    /// Returns the known command ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// Returns the definition of `id`.
    pub fn resolve(&self, id: &str) -> Result<&CommandDefinition, ShellfsError> {
        self.definitions
            .get(id)
            .ok_or_else(|| ShellfsError::InvalidCommandDefinition(format!("unknown command id: {}", id)))
    }

    /// Checks every template for structural errors.
    pub fn validate(&self) -> Result<(), ShellfsError> {
        for (id, definition) in &self.definitions {
            if definition.path.trim().is_empty() {
                return Err(ShellfsError::InvalidCommandDefinition(format!("{}: empty path", id)));
            }
            if definition.args.matches(SPREAD).count() > 1 {
                return Err(ShellfsError::InvalidCommandDefinition(format!(
                    "{}: more than one {} in template",
                    id, SPREAD
                )));
            }
            for caps in self.placeholder.captures_iter(&definition.args) {
                if caps[1].parse::<usize>().is_err() {
                    return Err(ShellfsError::InvalidCommandDefinition(format!(
                        "{}: placeholder out of range: {}",
                        id, &caps[0]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Formats `template` with `args`.
    ///
    /// `{N}` takes the N-th argument escaped for double quotes; `[@]` takes
    /// every argument after the highest `{N}`, each wrapped in `"..."`.
    pub fn format<S: AsRef<str>>(&self, template: &str, args: &[S]) -> Result<String, ShellfsError> {
        let spreads = template.matches(SPREAD).count();
        if spreads > 1 {
            return Err(ShellfsError::InvalidCommandDefinition(format!(
                "more than one {} in template: {}",
                SPREAD, template
            )));
        }

        let mut highest: Option<usize> = None;
        for caps in self.placeholder.captures_iter(template) {
            let index = caps[1].parse::<usize>().map_err(|_| {
                ShellfsError::InvalidCommandDefinition(format!("placeholder out of range: {}", &caps[0]))
            })?;
            if index >= args.len() {
                return Err(ShellfsError::InvalidCommandDefinition(format!(
                    "missing argument {} for template: {}",
                    index, template
                )));
            }
            highest = Some(highest.map_or(index, |h| h.max(index)));
        }

        let rest_start = highest.map_or(0, |h| h + 1);
        let rest = args.get(rest_start..).unwrap_or_default();
        if spreads == 0 && !rest.is_empty() {
            return Err(ShellfsError::InvalidCommandDefinition(format!(
                "template takes {} argument(s), got {}: {}",
                rest_start,
                args.len(),
                template
            )));
        }

        let formatted = self.placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| args.get(i))
                .map(|arg| escape_double_quoted(arg.as_ref()))
                .unwrap_or_default()
        });

        let spread = rest
            .iter()
            .map(|arg| format!("\"{}\"", escape_double_quoted(arg.as_ref())))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(formatted.replace(SPREAD, &spread).trim_end().to_string())
    }

    /// Builds the executable for `id` with `args`.
    pub fn build<S: AsRef<str>>(&self, id: &str, args: &[S]) -> Result<Executable, ShellfsError> {
        let definition = self.resolve(id)?;
        let formatted = self.format(&definition.args, args)?;
        Ok(Executable::new(id, definition.path.clone(), formatted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> CommandCatalog {
        CommandCatalog::builtin().unwrap()
    }

    #[test]
    fn builtin_catalog_is_valid() {
        let catalog = catalog();
        for id in ["list", "copy", "move", "delete", "mkdir", "chmod", "find", "remount", "write"] {
            assert!(catalog.resolve(id).is_ok(), "missing {}", id);
        }
    }

    #[test]
    fn build_copy() {
        let exe = catalog().build("copy", &["/a b", "/mnt/sdcard"]).unwrap();
        assert_eq!(exe.command_line(), "cp -Rf \"/a b\" \"/mnt/sdcard\"");
        assert_eq!(exe.id(), "copy");
        assert!(exe.is_prepared());
    }

    #[test]
    fn arguments_are_escaped_for_double_quotes() {
        let exe = catalog().build("mkdir", &["/tmp/$HOME \"x\" `id` \\"]).unwrap();
        assert_eq!(exe.args(), "-p \"/tmp/\\$HOME \\\"x\\\" \\`id\\` \\\\\"");
    }

    #[test]
    fn spread_expands_every_argument() {
        let exe = catalog().build("delete", &["/a", "/b c"]).unwrap();
        assert_eq!(exe.command_line(), "rm -rf \"/a\" \"/b c\"");
    }

    #[test]
    fn spread_takes_arguments_after_highest_placeholder() {
        let exe = catalog()
            .build("compress", &["/out.tgz", "/src", "a", "b"])
            .unwrap();
        assert_eq!(exe.args(), "-czvf \"/out.tgz\" -C \"/src\" \"a\" \"b\"");
    }

    #[test]
    fn unknown_id_is_invalid_definition() {
        let err = catalog().build("frobnicate", &["x"]).unwrap_err();
        assert!(matches!(err, ShellfsError::InvalidCommandDefinition(_)));
    }

    #[test]
    fn missing_argument_is_invalid_definition() {
        let err = catalog().build("copy", &["/only-source"]).unwrap_err();
        assert!(err.to_string().contains("missing argument 1"), "{}", err);
    }

    #[test]
    fn extra_arguments_without_spread_are_rejected() {
        let err = catalog().build("mkdir", &["/a", "/b"]).unwrap_err();
        assert!(matches!(err, ShellfsError::InvalidCommandDefinition(_)));
    }

    #[test]
    fn two_spreads_are_rejected() {
        let err = CommandCatalog::from_yaml("bad:\n  path: echo\n  args: '[@] [@]'\n").unwrap_err();
        assert!(err.to_string().contains("more than one"), "{}", err);
    }

    #[test]
    fn overrides_merge_over_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("catalog.yaml")).unwrap();
        fs::write(&path, "list:\n  path: /system/bin/ls\n  args: '-1a \"{0}\"'\nsync:\n  path: sync\n").unwrap();

        let catalog = CommandCatalog::load(Some(&path)).unwrap();
        assert_eq!(catalog.build("list", &["/"]).unwrap().command_line(), "/system/bin/ls -1a \"/\"");
        assert_eq!(catalog.build::<&str>("sync", &[]).unwrap().command_line(), "sync");
        assert!(catalog.resolve("copy").is_ok());
    }

    #[test]
    fn unknown_catalog_keys_are_rejected() {
        let err = CommandCatalog::from_yaml("x:\n  path: ls\n  argz: ''\n").unwrap_err();
        assert!(matches!(err, ShellfsError::Config(_)));
    }
}
