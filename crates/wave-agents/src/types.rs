use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use crate::template::shell_quote;

/// Everything a session host needs to start one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub workdir: PathBuf,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Shell-quoted command line, for logs.
    pub fn display(&self) -> String {
        let mut rendered = shell_quote(&self.program);
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&shell_quote(arg));
        }
        rendered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Exited(Option<i32>),
    /// The host cannot tell.
    Unknown,
}

impl SessionStatus {
    pub fn has_exited(self) -> bool {
        matches!(self, SessionStatus::Exited(_))
    }
}

/// Bounded tail of a session's output. The trailing partial line is kept
/// so prompts without a newline stay visible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    partial: String,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: String::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push_str(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            match ch {
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.push_line(line);
                }
                '\r' => {}
                _ => self.partial.push(ch),
            }
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Last `lines` lines joined by newlines, partial line included.
    pub fn tail(&self, lines: usize) -> String {
        let mut all: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        if !self.partial.is_empty() {
            all.push(self.partial.as_str());
        }
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
