//! Clipboard Writer: layered write/append with graceful degradation.
//!
//! Strategies are tried in order. A failing strategy is logged and the next
//! one is tried; if all fail the operation is a no-op. Nothing here returns
//! an error to the caller.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} exited with {status}")]
    Command { program: String, status: String },
    #[error("clipboard contents are not UTF-8")]
    NotUtf8,
    #[error("clipboard task failed: {0}")]
    Task(String),
}

/// One way of reaching a clipboard-like destination.
pub trait ClipboardBackend: Send + Sync {
    fn name(&self) -> &str;

    fn read_text(&self) -> Result<String, ClipboardError>;

    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Whether calls may block the thread (platform APIs, subprocesses, files).
    /// Blocking backends run on the blocking pool.
    fn is_blocking(&self) -> bool {
        true
    }
}

/// Process-local clipboard. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryClipboard {
    contents: Arc<Mutex<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClipboardBackend for MemoryClipboard {
    fn name(&self) -> &str {
        "memory"
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        Ok(self.contents())
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = text.to_string();
        Ok(())
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

/// The platform clipboard.
#[cfg(feature = "system-clipboard")]
#[derive(Debug, Default)]
pub struct SystemClipboard;

#[cfg(feature = "system-clipboard")]
impl ClipboardBackend for SystemClipboard {
    fn name(&self) -> &str {
        "system"
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        match clipboard.get_text() {
            Ok(text) => Ok(text),
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            Err(e) => Err(ClipboardError::Unavailable(e.to_string())),
        }
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|e| ClipboardError::Unavailable(e.to_string()))
    }
}

/// Clipboard reached through external copy/paste utilities.
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    copy: Vec<String>,
    paste: Vec<String>,
}

impl CommandClipboard {
    pub fn new(copy: Vec<String>, paste: Vec<String>) -> Self {
        Self { copy, paste }
    }

    /// Pick the utilities for the current platform and session, if any.
    pub fn detect() -> Option<Self> {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        if cfg!(target_os = "macos") {
            return Some(Self::new(argv(&["pbcopy"]), argv(&["pbpaste"])));
        }
        if std::env::var_os("WAYLAND_DISPLAY").is_some() {
            return Some(Self::new(argv(&["wl-copy"]), argv(&["wl-paste", "-n"])));
        }
        if std::env::var_os("DISPLAY").is_some() {
            return Some(Self::new(
                argv(&["xclip", "-selection", "clipboard"]),
                argv(&["xclip", "-selection", "clipboard", "-o"]),
            ));
        }
        None
    }

    fn command(argv: &[String]) -> Result<Command, ClipboardError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ClipboardError::Unavailable("empty clipboard command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl ClipboardBackend for CommandClipboard {
    fn name(&self) -> &str {
        "command"
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        let output = Self::command(&self.paste)?.stderr(Stdio::null()).output()?;
        if !output.status.success() {
            return Err(ClipboardError::Command {
                program: self.paste[0].clone(),
                status: output.status.to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| ClipboardError::NotUtf8)
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut child = Self::command(&self.copy)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ClipboardError::Command {
                program: self.copy[0].clone(),
                status: status.to_string(),
            })
        }
    }
}

/// A plain file standing in for the clipboard.
#[derive(Debug, Clone)]
pub struct FileClipboard {
    path: PathBuf,
}

impl FileClipboard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClipboardBackend for FileClipboard {
    fn name(&self) -> &str {
        "file"
    }

    fn read_text(&self) -> Result<String, ClipboardError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Layered clipboard writer.
pub struct ClipboardWriter {
    strategies: Vec<Arc<dyn ClipboardBackend>>,
    /// Serializes read-modify-write appends within this writer.
    append_lock: tokio::sync::Mutex<()>,
}

impl ClipboardWriter {
    pub fn new(strategies: Vec<Arc<dyn ClipboardBackend>>) -> Self {
        Self {
            strategies,
            append_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build from strategy names (`system`, `command`, `memory`, `file`).
    /// Names that are unknown or unavailable here are skipped with a warning.
    pub fn from_names(names: &[String], output_path: Option<&Path>) -> Self {
        let mut strategies: Vec<Arc<dyn ClipboardBackend>> = Vec::new();
        for name in names {
            match name.as_str() {
                #[cfg(feature = "system-clipboard")]
                "system" => strategies.push(Arc::new(SystemClipboard)),
                #[cfg(not(feature = "system-clipboard"))]
                "system" => tracing::warn!("built without system clipboard support"),
                "command" => match CommandClipboard::detect() {
                    Some(cmd) => strategies.push(Arc::new(cmd)),
                    None => tracing::debug!("no clipboard utility for this session"),
                },
                "memory" => strategies.push(Arc::new(MemoryClipboard::new())),
                "file" => match output_path {
                    Some(path) => strategies.push(Arc::new(FileClipboard::new(path))),
                    None => tracing::warn!("file clipboard strategy needs an output path"),
                },
                other => tracing::warn!(strategy = other, "unknown clipboard strategy"),
            }
        }
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// Replace the clipboard contents. Returns the strategy that accepted the
    /// text, or `None` if every strategy failed.
    pub async fn write(&self, text: &str) -> Option<String> {
        for backend in &self.strategies {
            match run_write(backend, text).await {
                Ok(()) => {
                    tracing::debug!(strategy = backend.name(), bytes = text.len(), "clipboard written");
                    return Some(backend.name().to_string());
                }
                Err(e) => {
                    tracing::warn!(strategy = backend.name(), error = %e, "clipboard write failed, trying next");
                }
            }
        }
        tracing::warn!("no clipboard strategy accepted the text");
        None
    }

    /// Read the current contents from the first strategy that can.
    pub async fn read(&self) -> Option<String> {
        for backend in &self.strategies {
            match run_read(backend).await {
                Ok(text) => return Some(text),
                Err(e) => {
                    tracing::warn!(strategy = backend.name(), error = %e, "clipboard read failed, trying next");
                }
            }
        }
        None
    }

    /// Append `text` on its own line after the current contents.
    pub async fn append(&self, text: &str) -> Option<String> {
        let _serialized = self.append_lock.lock().await;
        let previous = self.read().await.unwrap_or_default();
        let combined = if previous.is_empty() {
            text.to_string()
        } else {
            format!("{previous}\n{text}")
        };
        self.write(&combined).await
    }

    /// Reset the destination to empty.
    pub async fn clear(&self) -> Option<String> {
        let _serialized = self.append_lock.lock().await;
        self.write("").await
    }
}

async fn run_write(backend: &Arc<dyn ClipboardBackend>, text: &str) -> Result<(), ClipboardError> {
    if !backend.is_blocking() {
        return backend.write_text(text);
    }
    let backend = Arc::clone(backend);
    let text = text.to_string();
    tokio::task::spawn_blocking(move || backend.write_text(&text))
        .await
        .map_err(|e| ClipboardError::Task(e.to_string()))?
}

async fn run_read(backend: &Arc<dyn ClipboardBackend>) -> Result<String, ClipboardError> {
    if !backend.is_blocking() {
        return backend.read_text();
    }
    let backend = Arc::clone(backend);
    tokio::task::spawn_blocking(move || backend.read_text())
        .await
        .map_err(|e| ClipboardError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FailingClipboard;

    fn memory_writer() -> (ClipboardWriter, MemoryClipboard) {
        let memory = MemoryClipboard::new();
        (ClipboardWriter::new(vec![Arc::new(memory.clone())]), memory)
    }

    #[tokio::test]
    async fn append_then_write() {
        let (writer, memory) = memory_writer();
        writer.append("A").await;
        writer.append("B").await;
        assert_eq!(memory.contents(), "A\nB");
        writer.write("C").await;
        assert_eq!(memory.contents(), "C");
        writer.write("C").await;
        assert_eq!(memory.contents(), "C");
    }

    #[tokio::test]
    async fn append_to_existing_contents() {
        let (writer, memory) = memory_writer();
        memory.write_text("earlier").unwrap();
        writer.append("next").await;
        assert_eq!(memory.contents(), "earlier\nnext");
    }

    #[tokio::test]
    async fn falls_back_to_next_strategy() {
        let memory = MemoryClipboard::new();
        let writer = ClipboardWriter::new(vec![
            Arc::new(FailingClipboard::default()),
            Arc::new(memory.clone()),
        ]);
        assert_eq!(writer.write("text").await.as_deref(), Some("memory"));
        assert_eq!(memory.contents(), "text");
    }

    #[tokio::test]
    async fn all_strategies_failing_is_a_no_op() {
        let writer = ClipboardWriter::new(vec![Arc::new(FailingClipboard::default())]);
        assert_eq!(writer.write("text").await, None);
        assert_eq!(writer.append("text").await, None);
        assert_eq!(writer.read().await, None);

        let empty = ClipboardWriter::new(Vec::new());
        assert_eq!(empty.write("text").await, None);
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_entry() {
        let (writer, memory) = memory_writer();
        let writer = Arc::new(writer);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let w = Arc::clone(&writer);
            tasks.spawn(async move {
                w.append(&format!("entry{i}")).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        let contents = memory.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 16);
        for i in 0..16 {
            assert!(lines.contains(&format!("entry{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn file_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bib");
        let writer = ClipboardWriter::new(vec![Arc::new(FileClipboard::new(&path))]);
        writer.append("@a{1}").await;
        writer.append("@b{2}").await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "@a{1}\n@b{2}");
        writer.clear().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn from_names_skips_unknown_and_unconfigured() {
        let names: Vec<String> = ["memory", "bogus", "file"].iter().map(|s| s.to_string()).collect();
        let writer = ClipboardWriter::from_names(&names, None);
        assert_eq!(writer.strategy_names(), vec!["memory".to_string()]);
    }
}
