//! Process execution event model.
//!
//! A [`ProcessEvent`] is produced at the sensor boundary and never mutated
//! afterwards. The event bus hands every evaluator an `Arc<ProcessEvent>`,
//! so all readers share one immutable copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of activity the sensor observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A process was executed
    #[default]
    Exec,
    /// A file or object was created
    Creation,
    /// A file or object was deleted
    Deletion,
    /// A file path was touched (open, rename, chmod, ...)
    FilePath,
    /// Anything the sensor could not classify
    Other,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::Creation => write!(f, "creation"),
            Self::Deletion => write!(f, "deletion"),
            Self::FilePath => write!(f, "file_path"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One observed process execution.
///
/// Only `command` is required when deserializing; every other field falls
/// back to a default so partial sensor records are still usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Executed command (binary name or path)
    pub command: String,

    /// Ordered argument list, excluding the command itself
    #[serde(default)]
    pub args: Vec<String>,

    /// Event classification
    #[serde(default)]
    pub kind: EventKind,

    /// File path for file-system events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    /// Process identifier
    #[serde(default)]
    pub pid: u32,

    /// Parent process identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,

    /// Numeric user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// User name, when the sensor resolved it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Host the event was observed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Observation timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent {
    /// Create an exec event with the given command and arguments.
    ///
    /// # Examples
    ///
    /// ```
    /// use execsentry_lib::models::ProcessEvent;
    /// let event = ProcessEvent::new("rm", ["-rf", "/var/log/secure"]);
    /// assert_eq!(event.args.len(), 2);
    /// ```
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            kind: EventKind::Exec,
            file_path: None,
            pid: 0,
            ppid: None,
            uid: None,
            user: None,
            hostname: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the event kind.
    #[must_use]
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the file path.
    #[must_use]
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the process and parent process identifiers.
    #[must_use]
    pub fn with_pid(mut self, pid: u32, ppid: Option<u32>) -> Self {
        self.pid = pid;
        self.ppid = ppid;
        self
    }

    /// Set the user identity.
    #[must_use]
    pub fn with_user(mut self, uid: u32, user: impl Into<String>) -> Self {
        self.uid = Some(uid);
        self.user = Some(user.into());
        self
    }

    /// Set the hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Command followed by its arguments, joined by single spaces.
    ///
    /// This is the text trigger verbs are searched in.
    ///
    /// ```
    /// use execsentry_lib::models::ProcessEvent;
    /// let event = ProcessEvent::new("shred", ["-u", "/var/log/wtmp"]);
    /// assert_eq!(event.command_text(), "shred -u /var/log/wtmp");
    /// ```
    pub fn command_text(&self) -> String {
        let capacity = self.command.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>();
        let mut text = String::with_capacity(capacity);
        text.push_str(&self.command);
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }

    /// Serialize the event to a compact JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
