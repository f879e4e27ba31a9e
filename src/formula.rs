use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::error::{FormaError, Result};
use crate::util::{format_hash, infer_version, is_valid_sha256, is_valid_version, SHA256_HEX_LEN};

/// License tags a formula may declare, alone or joined with `OR` / `AND`.
pub const KNOWN_LICENSES: &[&str] = &[
    "0BSD",
    "Apache-2.0",
    "BSD-2-Clause",
    "BSD-3-Clause",
    "GPL-2.0-only",
    "GPL-2.0-or-later",
    "GPL-3.0-only",
    "GPL-3.0-or-later",
    "ISC",
    "LGPL-2.1-only",
    "LGPL-3.0-only",
    "MIT",
    "MPL-2.0",
    "Unlicense",
    "Zlib",
];

/// Expands into the standard `cargo install` arguments when it is a whole argument.
pub const STD_CARGO_ARGS: &str = "{std_cargo_args}";

/// Placeholders that recipe steps may reference.
pub const PLACEHOLDERS: &[&str] = &["name", "version", "prefix", "bin", "source", "std_cargo_args"];

/// `{placeholder}` tokens in step commands and arguments.
static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_]+)\}").expect("PLACEHOLDER_REGEX must compile")
});

/// A formula descriptor: how to fetch, build, install and smoke-test one tool.
///
/// Descriptors are read-only input to the interpreter. A new upstream release
/// is published by changing `url` and `sha256` together.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Formula {
    /// Identifier, unique within the formula index.
    pub name: String,
    /// Human-readable description.
    pub desc: String,
    /// Informational only.
    pub homepage: String,
    /// Location of the source archive.
    pub url: String,
    /// SHA-256 of the source archive.
    pub sha256: String,
    pub license: String,
    /// Explicit version. Inferred from `url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    #[serde(default)]
    pub install: Vec<Step>,
    #[serde(default)]
    pub test: Vec<Step>,
}

/// One `depends_on` entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Dependency {
    /// The host must run this operating system.
    Platform { os: String },
    /// Another formula, or a host tool that satisfies it.
    Formula {
        name: String,
        #[serde(default)]
        stage: Stage,
        /// Executable whose presence on the host `PATH` satisfies the dependency.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        probe: Option<String>,
    },
}

impl Dependency {
    pub fn name(&self) -> &str {
        match self {
            Dependency::Platform { os } => os,
            Dependency::Formula { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Needed only to compile the tool.
    Build,
    #[default]
    Runtime,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Build => write!(f, "build"),
            Stage::Runtime => write!(f, "runtime"),
        }
    }
}

/// A single recipe step: one subprocess invocation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Text that must appear verbatim in the captured output (test steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
    /// Expected exit status (test steps).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: i32,
}

fn is_zero(status: &i32) -> bool {
    *status == 0
}

impl Step {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Step {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            expect: None,
            status: 0,
        }
    }

    pub fn expecting(mut self, text: &str) -> Self {
        self.expect = Some(text.to_string());
        self
    }

    /// The step as a single command line, for messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Formula {
    /// Parses a descriptor from TOML and validates it.
    ///
    /// # Errors
    /// Returns [`FormaError::InvalidFormula`] if the TOML is malformed or the
    /// descriptor fails validation.
    pub fn parse(content: &str) -> Result<Formula> {
        let mut formula: Formula = toml::from_str(content).map_err(|e| FormaError::InvalidFormula {
            name: "<unknown>".to_string(),
            reason: e.to_string(),
        })?;
        formula.sha256 = format_hash(&formula.sha256);
        formula.validate()?;
        Ok(formula)
    }

    /// Loads a descriptor from a file path.
    ///
    /// # Errors
    /// Returns an error if the file can't be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Formula> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Formula::parse(&content).map_err(|e| match e {
            FormaError::InvalidFormula { name, reason } if name == "<unknown>" => {
                FormaError::InvalidFormula {
                    name: path.as_ref().display().to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    /// Saves the descriptor to the given file path in pretty TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// The formula version, explicit or inferred from `url`.
    ///
    /// # Errors
    /// Returns [`FormaError::InvalidFormula`] if no semver version can be determined.
    pub fn version(&self) -> Result<String> {
        match &self.version {
            Some(version) if is_valid_version(version) => {
                Ok(version.trim_start_matches('v').to_string())
            }
            Some(version) => Err(self.invalid(format!("version '{version}' is not semver"))),
            None => infer_version(&self.url)
                .ok_or_else(|| self.invalid(format!("cannot infer a version from url '{}'", self.url))),
        }
    }

    /// Checks the descriptor and returns every problem found.
    ///
    /// An empty list means the formula is valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '+'))
        {
            problems.push(format!("name '{}' contains invalid characters", self.name));
        }

        // A digest of the wrong length is reported, never truncated.
        let hash = format_hash(&self.sha256);
        if hash.len() != SHA256_HEX_LEN {
            problems.push(format!(
                "sha256 must be {SHA256_HEX_LEN} hex characters, found {}",
                hash.len()
            ));
        } else if !is_valid_sha256(&hash) {
            problems.push("sha256 contains non-hex characters".to_string());
        }

        let has_scheme = ["https://", "http://", "file://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        if self.url.trim().is_empty() {
            problems.push("url is empty".to_string());
        } else if self.url.contains("://") && !has_scheme {
            problems.push(format!("url '{}' uses an unsupported scheme", self.url));
        }

        if !is_known_license(&self.license) {
            problems.push(format!("license '{}' is not a known license tag", self.license));
        }

        if let Err(FormaError::InvalidFormula { reason, .. }) = self.version() {
            problems.push(reason);
        }

        if self.install.is_empty() {
            problems.push("install recipe is empty".to_string());
        }

        for dependency in &self.depends_on {
            if dependency.name().trim().is_empty() {
                problems.push("depends_on entry has an empty name".to_string());
            }
            if let Dependency::Formula { name, .. } = dependency {
                if name == &self.name {
                    problems.push(format!("'{name}' depends on itself"));
                }
            }
        }

        let recipes = [("install", &self.install), ("test", &self.test)];
        for (kind, steps) in recipes {
            for (i, step) in steps.iter().enumerate() {
                if step.command.trim().is_empty() {
                    problems.push(format!("{kind} step {} has an empty command", i + 1));
                }
                let texts = std::iter::once(&step.command).chain(step.args.iter());
                for text in texts {
                    for caps in PLACEHOLDER_REGEX.captures_iter(text) {
                        let key = &caps[1];
                        if !PLACEHOLDERS.contains(&key) {
                            problems.push(format!("{kind} step {} uses unknown placeholder {{{key}}}", i + 1));
                        }
                    }
                }
                // only a whole argument expands into several arguments
                let embedded = step.command.contains(STD_CARGO_ARGS)
                    || step.args.iter().any(|a| a != STD_CARGO_ARGS && a.contains(STD_CARGO_ARGS));
                if embedded {
                    problems.push(format!(
                        "{kind} step {} must pass {STD_CARGO_ARGS} as a separate argument",
                        i + 1
                    ));
                }
                if step.expect.as_deref().is_some_and(|e| e.is_empty()) {
                    problems.push(format!("{kind} step {} expects empty output text", i + 1));
                }
            }
        }

        problems
    }

    /// Fails with the first problem reported by [`Formula::problems`].
    pub fn validate(&self) -> Result<()> {
        match self.problems().into_iter().next() {
            Some(reason) => Err(self.invalid(reason)),
            None => Ok(()),
        }
    }

    fn invalid(&self, reason: String) -> FormaError {
        FormaError::InvalidFormula {
            name: self.name.clone(),
            reason,
        }
    }
}

/// Accepts a single known tag or an `OR`/`AND` expression of known tags.
pub fn is_known_license(license: &str) -> bool {
    let expr = license.trim().trim_start_matches('(').trim_end_matches(')');
    if expr.is_empty() {
        return false;
    }
    expr.split(" OR ")
        .flat_map(|part| part.split(" AND "))
        .map(|tag| tag.trim().trim_start_matches('(').trim_end_matches(')'))
        .all(|tag| KNOWN_LICENSES.contains(&tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE_DRAGON: &str = r#"
name = "white-dragon"
desc = "Lightweight macOS CLI tool for drag-and-drop from terminal"
homepage = "https://github.com/Dimfred/white-dragon"
url = "https://github.com/Dimfred/white-dragon/archive/refs/tags/v0.1.2.tar.gz"
sha256 = "6eadd6388250712400dbd82dc9ff65585135500a8653fe88cfbd88428d39d383"
license = "MIT"

[[depends_on]]
os = "macos"

[[depends_on]]
name = "rust"
stage = "build"
probe = "cargo"

[[install]]
command = "cargo"
args = ["install", "{std_cargo_args}"]

[[test]]
command = "{bin}/white-dragon"
args = ["--help"]
expect = "white-dragon"
"#;

    fn replace(field: &str, value: &str) -> String {
        WHITE_DRAGON
            .lines()
            .map(|line| {
                if line.starts_with(&format!("{field} = ")) {
                    format!("{field} = \"{value}\"")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn parses_reference_formula() {
        let formula = Formula::parse(WHITE_DRAGON).unwrap();
        assert_eq!(formula.name, "white-dragon");
        assert_eq!(formula.version().unwrap(), "0.1.2");
        assert_eq!(
            formula.depends_on,
            vec![
                Dependency::Platform { os: "macos".to_string() },
                Dependency::Formula {
                    name: "rust".to_string(),
                    stage: Stage::Build,
                    probe: Some("cargo".to_string()),
                },
            ]
        );
        assert_eq!(formula.install[0].command_line(), "cargo install {std_cargo_args}");
        assert_eq!(formula.test[0].expect.as_deref(), Some("white-dragon"));
    }

    #[test]
    fn dependency_stage_defaults_to_runtime() {
        let content = format!("{WHITE_DRAGON}\n[[depends_on]]\nname = \"libfoo\"\n");
        let formula = Formula::parse(&content).unwrap();
        assert_eq!(
            formula.depends_on[2],
            Dependency::Formula { name: "libfoo".to_string(), stage: Stage::Runtime, probe: None }
        );
    }

    #[test]
    fn strips_hash_prefix() {
        let content = replace(
            "sha256",
            "sha256:6EADD6388250712400DBD82DC9FF65585135500A8653FE88CFBD88428D39D383",
        );
        let formula = Formula::parse(&content).unwrap();
        assert_eq!(
            formula.sha256,
            "6eadd6388250712400dbd82dc9ff65585135500a8653fe88cfbd88428d39d383"
        );
    }

    #[test]
    fn rejects_overlong_digest() {
        let content = replace(
            "sha256",
            "6eadd6388250712400dbd82dc9ff65585135500a8653fe88cfbd88428d39d3830",
        );
        let err = Formula::parse(&content).unwrap_err();
        match err {
            FormaError::InvalidFormula { name, reason } => {
                assert_eq!(name, "white-dragon");
                assert!(reason.contains("found 65"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_unknown_license() {
        let err = Formula::parse(&replace("license", "Proprietary-ish")).unwrap_err();
        assert_eq!(err.kind(), "InvalidFormula");
    }

    #[test]
    fn license_expressions() {
        assert!(is_known_license("MIT"));
        assert!(is_known_license("MIT OR Apache-2.0"));
        assert!(is_known_license("(Apache-2.0 AND BSD-3-Clause)"));
        assert!(!is_known_license("MIT OR Nope"));
        assert!(!is_known_license(""));
    }

    #[test]
    fn explicit_version_wins() {
        let content = format!("version = \"2.0.0\"\n{WHITE_DRAGON}");
        let formula = Formula::parse(&content).unwrap();
        assert_eq!(formula.version().unwrap(), "2.0.0");
    }

    #[test]
    fn reports_unknown_placeholder_and_empty_expectation() {
        let mut formula = Formula::parse(WHITE_DRAGON).unwrap();
        formula.install.push(Step::new("make", &["PREFIX={prefx}"]));
        formula.test.push(Step::new("{bin}/white-dragon", &[]).expecting(""));
        let problems = formula.problems();
        assert_eq!(problems.len(), 2, "{problems:?}");
        assert!(problems[0].contains("{prefx}"));
        assert!(problems[1].contains("expects empty output text"));
    }

    #[test]
    fn std_cargo_args_must_stand_alone() {
        let mut formula = Formula::parse(WHITE_DRAGON).unwrap();
        assert!(formula.problems().is_empty());

        formula.install = vec![Step::new("cargo", &["install {std_cargo_args}"])];
        let problems = formula.problems();
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].contains("install step 1 must pass {std_cargo_args} as a separate argument"));

        formula.install = vec![Step::new("cargo-{std_cargo_args}", &[])];
        assert_eq!(formula.problems().len(), 1);
    }

    #[test]
    fn malformed_toml_is_invalid_formula() {
        let err = Formula::parse("name = ").unwrap_err();
        assert_eq!(err.kind(), "InvalidFormula");
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white-dragon.toml");
        let formula = Formula::parse(WHITE_DRAGON).unwrap();
        formula.save(&path).unwrap();
        assert_eq!(Formula::load(&path).unwrap(), formula);
    }
}
