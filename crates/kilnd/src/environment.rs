//! Process environment adjustments scoped to a single build.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

const ENV_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::environment");

/// Access to the process-wide working directory and variables.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessEnvironment: Send + Sync {
    /// Current working directory.
    fn current_dir(&self) -> io::Result<PathBuf>;
    /// Changes the working directory.
    fn set_current_dir(&self, path: &Path) -> io::Result<()>;
    /// Current value of a variable, if set.
    fn var(&self, key: &str) -> Option<OsString>;
    /// Sets a variable.
    fn set_var(&self, key: &str, value: &str);
    /// Removes a variable.
    fn remove_var(&self, key: &str);
}

/// [`ProcessEnvironment`] backed by `std::env`.
///
/// Only one build runs at a time, so the pipeline is the sole writer of the
/// process environment while a build is admitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessEnvironment;

impl ProcessEnvironment for SystemProcessEnvironment {
    fn current_dir(&self) -> io::Result<PathBuf> {
        env::current_dir()
    }

    fn set_current_dir(&self, path: &Path) -> io::Result<()> {
        env::set_current_dir(path)
    }

    fn var(&self, key: &str) -> Option<OsString> {
        env::var_os(key)
    }

    fn set_var(&self, key: &str, value: &str) {
        // SAFETY: the coordinator admits one build at a time and only the
        // admitted build's pipeline mutates the environment.
        unsafe { env::set_var(key, value) };
    }

    fn remove_var(&self, key: &str) {
        // SAFETY: see `set_var`.
        unsafe { env::remove_var(key) };
    }
}

/// Errors raised while applying a build environment.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// Reading the current directory failed.
    #[error("failed to read the current directory: {source}")]
    CurrentDir {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Switching to the requested directory failed.
    #[error("failed to enter working directory '{}': {source}", path.display())]
    EnterDirectory {
        /// Requested directory.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A variable name cannot be set on this platform.
    #[error("invalid environment variable name '{key}'")]
    InvalidName {
        /// Offending variable name.
        key: String,
    },
}

/// Guard restoring the working directory and variables it changed.
///
/// Restoration happens on drop in reverse order of application, and a
/// variable that did not exist before the build is removed again.
pub struct EnvironmentOverride {
    environment: Arc<dyn ProcessEnvironment>,
    previous_dir: Option<PathBuf>,
    previous_vars: Vec<(String, Option<OsString>)>,
}

impl fmt::Debug for EnvironmentOverride {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EnvironmentOverride")
            .field("previous_dir", &self.previous_dir)
            .field("previous_vars", &self.previous_vars)
            .finish_non_exhaustive()
    }
}

impl EnvironmentOverride {
    /// Applies `directory` and `vars`, returning the restoring guard.
    ///
    /// On failure anything already applied is rolled back before returning.
    pub fn apply(
        environment: Arc<dyn ProcessEnvironment>,
        directory: Option<&Path>,
        vars: &BTreeMap<String, String>,
    ) -> Result<Self, EnvironmentError> {
        let mut guard = Self {
            environment,
            previous_dir: None,
            previous_vars: Vec::with_capacity(vars.len()),
        };
        if let Some(directory) = directory {
            let current = guard
                .environment
                .current_dir()
                .map_err(|source| EnvironmentError::CurrentDir { source })?;
            guard
                .environment
                .set_current_dir(directory)
                .map_err(|source| EnvironmentError::EnterDirectory {
                    path: directory.to_path_buf(),
                    source,
                })?;
            guard.previous_dir = Some(current);
        }
        for (key, value) in vars {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(EnvironmentError::InvalidName { key: key.clone() });
            }
            let previous = guard.environment.var(key);
            guard.environment.set_var(key, value);
            guard.previous_vars.push((key.clone(), previous));
        }
        debug!(
            target: ENV_TARGET,
            directory = ?directory,
            variables = vars.len(),
            "build environment applied"
        );
        Ok(guard)
    }
}

impl Drop for EnvironmentOverride {
    fn drop(&mut self) {
        while let Some((key, previous)) = self.previous_vars.pop() {
            match previous.as_ref().and_then(|value| value.to_str()) {
                Some(value) => self.environment.set_var(&key, value),
                None if previous.is_some() => {
                    warn!(
                        target: ENV_TARGET,
                        key = %key,
                        "previous value was not UTF-8; removing variable"
                    );
                    self.environment.remove_var(&key);
                }
                None => self.environment.remove_var(&key),
            }
        }
        if let Some(directory) = self.previous_dir.take()
            && let Err(error) = self.environment.set_current_dir(&directory)
        {
            warn!(
                target: ENV_TARGET,
                directory = %directory.display(),
                error = %error,
                "failed to restore working directory"
            );
        }
    }
}
