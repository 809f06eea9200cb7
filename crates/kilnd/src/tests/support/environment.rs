//! In-memory process environment.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::environment::ProcessEnvironment;

/// [`ProcessEnvironment`] keeping its directory and variables in memory.
#[derive(Debug, Default)]
pub struct FakeEnvironment {
    dir: Mutex<PathBuf>,
    vars: Mutex<BTreeMap<String, String>>,
}

impl FakeEnvironment {
    /// Creates an environment rooted at `dir` with `vars` set.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, vars: &[(&str, &str)]) -> Self {
        Self {
            dir: Mutex::new(dir.into()),
            vars: Mutex::new(
                vars.iter()
                    .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                    .collect(),
            ),
        }
    }

    /// Copy of every variable currently set.
    #[must_use]
    pub fn snapshot(&self) -> (PathBuf, BTreeMap<String, String>) {
        (
            self.dir.lock().expect("dir mutex").clone(),
            self.vars.lock().expect("vars mutex").clone(),
        )
    }
}

impl ProcessEnvironment for FakeEnvironment {
    fn current_dir(&self) -> io::Result<PathBuf> {
        Ok(self.dir.lock().expect("dir mutex").clone())
    }

    fn set_current_dir(&self, path: &Path) -> io::Result<()> {
        *self.dir.lock().expect("dir mutex") = path.to_path_buf();
        Ok(())
    }

    fn var(&self, key: &str) -> Option<OsString> {
        self.vars
            .lock()
            .expect("vars mutex")
            .get(key)
            .map(OsString::from)
    }

    fn set_var(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .expect("vars mutex")
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove_var(&self, key: &str) {
        self.vars.lock().expect("vars mutex").remove(key);
    }
}
