//! Toolchain descriptions for the languages an eval node can build.
//!
//! Command templates are argument vectors. `{source}` and `{executable}`
//! are replaced with the program's paths before the command runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SOURCE_PLACEHOLDER: &str = "{source}";
pub const EXECUTABLE_PLACEHOLDER: &str = "{executable}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Language tag carried by jobs and graders
    pub name: String,
    pub extension: String,
    pub compile: Vec<String>,
    /// Prints the toolchain version; empty skips it
    #[serde(default)]
    pub version: Vec<String>,
    #[serde(default = "default_execute")]
    pub execute: Vec<String>,
    /// Extra environment for the compiler
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_execute() -> Vec<String> {
    vec![EXECUTABLE_PLACEHOLDER.to_string()]
}

/// On-disk layout of `languages.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageConfig>,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The stock toolchains: clang for C and C++, a static cgo-free build for Go.
pub fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "c".to_string(),
            extension: "c".to_string(),
            compile: args(&[
                "clang", "-o", "{executable}", "-DONLINE_JUDGE", "-Wall", "-O2", "-static", "-std=c11",
                "-lm", "{source}",
            ]),
            version: args(&["clang", "--version"]),
            execute: default_execute(),
            env: BTreeMap::new(),
        },
        LanguageConfig {
            name: "cpp".to_string(),
            extension: "cpp".to_string(),
            compile: args(&[
                "clang++", "-o", "{executable}", "-DONLINE_JUDGE", "-Wall", "-O2", "-static", "-std=c++11",
                "-lm", "{source}",
            ]),
            version: args(&["clang++", "--version"]),
            execute: default_execute(),
            env: BTreeMap::new(),
        },
        LanguageConfig {
            name: "go".to_string(),
            extension: "go".to_string(),
            compile: args(&[
                "go", "build", "-a", "-installsuffix", "cgo", "-ldflags", "-s", "-o", "{executable}",
                "{source}",
            ]),
            version: args(&["go", "version"]),
            execute: default_execute(),
            env: BTreeMap::from([("CGO_ENABLED".to_string(), "0".to_string())]),
        },
    ]
}

/// Substitute the program paths into a command template.
pub fn render(template: &[String], source: &str, executable: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace(SOURCE_PLACEHOLDER, source)
                .replace(EXECUTABLE_PLACEHOLDER, executable)
        })
        .collect()
}
