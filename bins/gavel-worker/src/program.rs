// A source file and the executable built from it, with the toolchain
// commands of its language.

use anyhow::{bail, Context, Result};
use gavel_common::languages::{render, LanguageConfig};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Program {
    pub source: PathBuf,
    pub executable: PathBuf,
    pub language: LanguageConfig,
}

impl Program {
    /// `<dir>/<stem>.<ext>` compiled to `<dir>/<stem>`.
    pub fn new(dir: &Path, stem: &str, language: LanguageConfig) -> Self {
        Self {
            source: dir.join(format!("{}.{}", stem, language.extension)),
            executable: dir.join(stem),
            language,
        }
    }

    fn argv(&self, template: &[String]) -> Vec<String> {
        render(
            template,
            &self.source.display().to_string(),
            &self.executable.display().to_string(),
        )
    }

    pub fn compile_argv(&self) -> Vec<String> {
        self.argv(&self.language.compile)
    }

    /// The build command as a single line, as shown to users.
    pub fn build_command(&self) -> String {
        self.compile_argv().join(" ")
    }

    /// Compile and return the combined stdout and stderr.
    pub async fn compile(&self) -> Result<Output> {
        let argv = self.compile_argv();
        let mut cmd = command(&argv)?;
        cmd.envs(&self.language.env);
        cmd.output()
            .await
            .with_context(|| format!("couldn't run {}", argv[0]))
    }

    /// Toolchain version banner. Empty when the language has no version
    /// command or it fails to start.
    pub async fn version(&self) -> String {
        let argv = self.argv(&self.language.version);
        let Ok(mut cmd) = command(&argv) else {
            return String::new();
        };
        match cmd.output().await {
            Ok(output) => combined(&output),
            Err(_) => String::new(),
        }
    }

    /// Command running the built program with `args` appended.
    pub fn execute(&self, args: &[String]) -> Result<Command> {
        let mut argv = self.argv(&self.language.execute);
        argv.extend(args.iter().cloned());
        command(&argv)
    }
}

fn command(argv: &[String]) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// stdout followed by stderr, lossily decoded.
pub fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shell() -> LanguageConfig {
        LanguageConfig {
            name: "sh".to_string(),
            extension: "sh".to_string(),
            compile: vec!["cp".to_string(), "{source}".to_string(), "{executable}".to_string()],
            version: vec!["echo".to_string(), "sh 1.0".to_string()],
            execute: vec!["sh".to_string(), "{executable}".to_string()],
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_paths_and_build_command() {
        let program = Program::new(Path::new("/w"), "userprogram", shell());
        assert_eq!(program.source, PathBuf::from("/w/userprogram.sh"));
        assert_eq!(program.executable, PathBuf::from("/w/userprogram"));
        assert_eq!(program.build_command(), "cp /w/userprogram.sh /w/userprogram");
    }

    #[tokio::test]
    async fn test_compile_version_and_execute() {
        let dir = tempfile::tempdir().unwrap();
        let program = Program::new(dir.path(), "grader", shell());
        std::fs::write(&program.source, "echo \"got $1\"\n").unwrap();

        let output = program.compile().await.unwrap();
        assert!(output.status.success());
        assert!(program.executable.exists());
        assert_eq!(program.version().await, "sh 1.0\n");

        let output = program.execute(&["x".to_string()]).unwrap().output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "got x\n");
    }

    #[tokio::test]
    async fn test_missing_compiler_is_an_error() {
        let mut lang = shell();
        lang.compile = vec!["gavel-no-such-compiler".to_string()];
        let program = Program::new(Path::new("/tmp"), "userprogram", lang);
        assert!(program.compile().await.is_err());
    }
}
