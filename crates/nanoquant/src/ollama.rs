//! Packaging artifacts for a local Ollama runner.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nanoquant_core::{Error, Result, ServingRegistry};
use tracing::{debug, info, warn};

pub const MODELFILE: &str = "Modelfile";

/// Limit for `ollama create`.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// Limit for the `ollama --version` probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

const DEFAULT_TEMPLATE: &str = "{{ if .System }}<|system|>{{ .System }}<|end|>{{ end }}\
{{ if .Prompt }}<|user|>{{ .Prompt }}<|end|>{{ end }}<|assistant|>{{ .Response }}<|end|>";

/// Tag under which a level of `model_id` is registered.
pub fn tag(model_id: &str, level: &str) -> String {
    format!("nanoquant_{}:{level}", base_name(model_id))
}

/// `ollama pull` command per level.
pub fn pull_commands<S: AsRef<str>>(model_id: &str, levels: &[S]) -> BTreeMap<String, String> {
    levels
        .iter()
        .map(|level| {
            let level = level.as_ref();
            (level.to_string(), format!("ollama pull {}", tag(model_id, level)))
        })
        .collect()
}

/// Model id as it appears in tags and artifact names.
pub fn base_name(model_id: &str) -> String {
    model_id.replace('/', "_").to_ascii_lowercase()
}

/// Contents of an Ollama Modelfile.
#[derive(Debug, Clone, PartialEq)]
pub struct Modelfile {
    pub from: String,
    pub parameters: Vec<(String, String)>,
    pub system: Option<String>,
    pub template: Option<String>,
}

impl Modelfile {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            parameters: Vec::new(),
            system: None,
            template: None,
        }
    }

    /// Modelfile for a compressed artifact directory.
    pub fn for_artifact(artifact_path: &Path, level: &str) -> Self {
        Self::new(artifact_path.display().to_string())
            .parameter("temperature", "0.7")
            .parameter("stop", "<|end|>")
            .system(format!(
                "You are a NanoQuant compressed model ({level} level). \
                 You have been compressed while keeping answer quality."
            ))
            .template(DEFAULT_TEMPLATE)
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn render(&self) -> String {
        let mut lines = vec![format!("FROM {}", self.from)];
        lines.extend(
            self.parameters
                .iter()
                .map(|(key, value)| format!("PARAMETER {key} {value}")),
        );
        if let Some(system) = &self.system {
            lines.push(format!("SYSTEM \"\"\"{system}\"\"\""));
        }
        if let Some(template) = &self.template {
            lines.push(format!("TEMPLATE \"\"\"{template}\"\"\""));
        }
        lines.iter().map(|line| format!("{line}\n")).collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(|e| Error::persistence(path, e.to_string()))
    }
}

/// Registers artifacts with `ollama create`.
#[derive(Debug, Clone)]
pub struct OllamaRegistry {
    binary: PathBuf,
    create_timeout: Duration,
    probe_timeout: Duration,
}

impl Default for OllamaRegistry {
    fn default() -> Self {
        Self::with_binary("ollama")
    }
}

impl OllamaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ollama` executable.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            create_timeout: CREATE_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, create: Duration, probe: Duration) -> Self {
        self.create_timeout = create;
        self.probe_timeout = probe;
        self
    }

    /// Run the binary with `args`, killing it once `timeout` elapses.
    ///
    /// Returns the exit status and captured stderr.
    fn run(&self, args: &[&OsStr], timeout: Duration) -> Result<(ExitStatus, String)> {
        let subcommand = args.first().map(|a| a.to_string_lossy()).unwrap_or_default();
        let command = format!("{} {subcommand}", self.binary.display());
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Registration(format!("failed to run {}: {e}", self.binary.display())))?;

        // Stderr is read on its own thread; the child stalls once the pipe fills.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                pipe.read_to_string(&mut text).map(|_| text).unwrap_or_default()
            })
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    if let Err(e) = child.kill() {
                        warn!(command = %command, error = %e, "failed to kill timed out process");
                    }
                    if let Err(e) = child.wait() {
                        debug!(command = %command, error = %e, "failed to reap timed out process");
                    }
                    return Err(Error::Registration(format!(
                        "{command} timed out after {:.1}s",
                        timeout.as_secs_f64()
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(Error::Registration(format!("waiting on {command}: {e}"))),
            }
        };

        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        Ok((status, stderr))
    }
}

impl ServingRegistry for OllamaRegistry {
    fn register(&self, artifact_path: &Path, tag: &str) -> Result<()> {
        let level = tag.rsplit_once(':').map_or("custom", |(_, level)| level);
        let modelfile = artifact_path.join(MODELFILE);
        Modelfile::for_artifact(artifact_path, level).write(&modelfile)?;
        debug!(path = %modelfile.display(), "modelfile written");

        let args = [OsStr::new("create"), OsStr::new(tag), OsStr::new("-f"), modelfile.as_os_str()];
        let (status, stderr) = self.run(&args, self.create_timeout)?;
        if !status.success() {
            return Err(Error::Registration(format!("ollama create {tag} failed: {}", stderr.trim())));
        }
        info!(tag, "registered with ollama");
        Ok(())
    }

    fn is_available(&self) -> bool {
        match self.run(&[OsStr::new("--version")], self.probe_timeout) {
            Ok((status, _)) => status.success(),
            Err(e) => {
                debug!(error = %e, "ollama probe failed");
                false
            }
        }
    }
}
