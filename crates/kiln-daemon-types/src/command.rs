//! Commands submitted by clients.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Correlation identifier chosen by the client for a single command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Wraps a client supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// A single client request. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Command {
    /// Correlation identifier echoed back in the result.
    pub id: CommandId,
    /// What the client asks the daemon to do.
    pub kind: CommandKind,
}

impl Command {
    /// Builds a build command.
    #[must_use]
    pub fn build(id: impl Into<String>, invocation: BuildInvocation) -> Self {
        Self {
            id: CommandId::new(id),
            kind: CommandKind::Build(invocation),
        }
    }

    /// Builds a stop command.
    #[must_use]
    pub fn stop(id: impl Into<String>) -> Self {
        Self {
            id: CommandId::new(id),
            kind: CommandKind::Stop,
        }
    }

    /// Returns `true` when the command asks the daemon to stop.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self.kind, CommandKind::Stop)
    }

    /// Returns the build invocation carried by a build command.
    #[must_use]
    pub const fn invocation(&self) -> Option<&BuildInvocation> {
        match &self.kind {
            CommandKind::Build(invocation) => Some(invocation),
            CommandKind::Stop => None,
        }
    }

    /// Short label used in logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self.kind {
            CommandKind::Build(_) => "build",
            CommandKind::Stop => "stop",
        }
    }
}

/// Command variants understood by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Run a build with the supplied invocation.
    Build(BuildInvocation),
    /// Stop the daemon, cancelling any build in progress.
    Stop,
}

/// Parameters describing a build request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildInvocation {
    /// Program and arguments handed to the build engine.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory the build runs in. Defaults to the daemon's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<Utf8PathBuf>,
    /// Environment variables applied for the duration of the build.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl BuildInvocation {
    /// Creates an invocation from a program and its arguments.
    #[must_use]
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_directory(mut self, directory: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    /// Adds an environment variable override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}
