use std::collections::HashMap;

use crate::config::LanguageConfig;
use crate::error::SandboxError;
use crate::evaluator::truncate_diagnostic;
use crate::sandbox::{RunLimits, RunOutcome, RunRequest, SandboxRunner};

const EXECUTABLE_NAME: &str = "main";
const DEFAULT_CLASS_NAME: &str = "Main";

/// What the evaluator executes for every test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub run_command: Vec<String>,
    pub memory_overhead_kb: u64,
}

/// Result of preparing a submission for execution
#[derive(Debug)]
pub struct CompileResult {
    /// Present only when the submission is ready to run
    pub artifact: Option<Artifact>,
    pub diagnostics: String,
    pub time_ms: u64,
}

/// Maps language identifiers to their file layout and commands
pub struct Toolchain {
    languages: HashMap<String, LanguageConfig>,
}

impl Toolchain {
    /// Uses the built-in languages when none are configured
    pub fn new(languages: Vec<LanguageConfig>) -> Self {
        let languages = if languages.is_empty() {
            default_languages()
        } else {
            languages
        };

        Self {
            languages: languages
                .into_iter()
                .map(|l| (l.name.clone(), l))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Writes the source into a wiped scratch directory and compiles it
    ///
    /// Interpreted languages succeed immediately with the source itself as
    /// the artifact. A compile step succeeds only when the compiler exits
    /// cleanly and, if its template names `%OUTPUT%`, the executable exists.
    pub fn prepare(
        &self,
        sandbox: &dyn SandboxRunner,
        language: &LanguageConfig,
        source: &str,
        diagnostic_limit: usize,
    ) -> Result<CompileResult, SandboxError> {
        sandbox.reset()?;

        let file_name = source_file_name(language, source);
        sandbox.write_file(&file_name, format!("{source}\n").as_bytes())?;

        let class_name = file_name
            .rsplit_once('.')
            .map_or(file_name.as_str(), |(stem, _)| stem)
            .to_string();
        let mapping = [
            ("%INPUT%", file_name.as_str()),
            ("%OUTPUT%", EXECUTABLE_NAME),
            ("%CLASS%", class_name.as_str()),
        ];
        let artifact = Artifact {
            run_command: apply_template(&language.run, &mapping),
            memory_overhead_kb: language.memory_overhead_kb,
        };

        let Some(compile) = &language.compile else {
            return Ok(CompileResult {
                artifact: Some(artifact),
                diagnostics: String::new(),
                time_ms: 0,
            });
        };

        let command = apply_template(compile, &mapping);
        let output = sandbox.run(&RunRequest {
            command: &command,
            stdin: b"",
            limits: RunLimits::compile(),
        })?;

        let expects_executable = compile.iter().any(|arg| arg.contains("%OUTPUT%"));
        let success = output.outcome == RunOutcome::Ok
            && output.exit_code == Some(0)
            && (!expects_executable || sandbox.scratch_dir().join(EXECUTABLE_NAME).exists());

        let mut diagnostics = output.stdout;
        diagnostics.push_str(&output.stderr);
        if !success && let Some(message) = output.message {
            if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                diagnostics.push('\n');
            }
            diagnostics.push_str(&message);
        }

        log::debug!(
            "Compiled {} source on sandbox {}: success={success}",
            language.name,
            sandbox.id()
        );

        Ok(CompileResult {
            artifact: success.then_some(artifact),
            diagnostics: truncate_diagnostic(&diagnostics, diagnostic_limit),
            time_ms: output.time_used_ms,
        })
    }
}

/// Source file name, with `%CLASS%` resolved from a `public class` declaration
pub fn source_file_name(language: &LanguageConfig, source: &str) -> String {
    if !language.file_name.contains("%CLASS%") {
        return language.file_name.clone();
    }

    let class_name = declared_public_class(source).unwrap_or(DEFAULT_CLASS_NAME);
    language.file_name.replace("%CLASS%", class_name)
}

fn declared_public_class(source: &str) -> Option<&str> {
    let tokens: Vec<&str> = source
        .split(|c: char| c.is_whitespace() || c == '{')
        .filter(|t| !t.is_empty())
        .collect();

    tokens.windows(3).find_map(|w| {
        let name = w[2];
        let valid = name.chars().all(|c| c.is_alphanumeric() || c == '_')
            && name.chars().next().is_some_and(|c| !c.is_ascii_digit());
        (w[0] == "public" && w[1] == "class" && valid).then_some(name)
    })
}

/// Applies template substitutions to each command argument
fn apply_template(cmd_template: &[String], mapping: &[(&str, &str)]) -> Vec<String> {
    cmd_template
        .iter()
        .map(|s| {
            mapping
                .iter()
                .fold(s.clone(), |acc, (k, v)| acc.replace(k, v))
        })
        .collect()
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Languages offered when the configuration lists none
pub fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "python".to_string(),
            file_name: "main.py".to_string(),
            compile: None,
            run: strings(&["/usr/bin/python3", "%INPUT%"]),
            memory_overhead_kb: 16384,
        },
        LanguageConfig {
            name: "javascript".to_string(),
            file_name: "main.js".to_string(),
            compile: None,
            run: strings(&["/usr/bin/node", "%INPUT%"]),
            memory_overhead_kb: 65536,
        },
        LanguageConfig {
            name: "c".to_string(),
            file_name: "main.c".to_string(),
            compile: Some(strings(&[
                "/usr/bin/gcc", "-O2", "-std=c11", "-o", "%OUTPUT%", "%INPUT%", "-lm",
            ])),
            run: strings(&["./%OUTPUT%"]),
            memory_overhead_kb: 0,
        },
        LanguageConfig {
            name: "cpp".to_string(),
            file_name: "main.cpp".to_string(),
            compile: Some(strings(&[
                "/usr/bin/g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%",
            ])),
            run: strings(&["./%OUTPUT%"]),
            memory_overhead_kb: 0,
        },
        LanguageConfig {
            name: "java".to_string(),
            file_name: "%CLASS%.java".to_string(),
            compile: Some(strings(&["/usr/bin/javac", "-encoding", "UTF-8", "%INPUT%"])),
            run: strings(&["/usr/bin/java", "-Xss64m", "-cp", ".", "%CLASS%"]),
            memory_overhead_kb: 131072,
        },
    ]
}
