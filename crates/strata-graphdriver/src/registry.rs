//! Name-based graph driver selection.
//!
//! The driver is chosen by host configuration at startup. When no name is
//! configured, a driver whose directory already exists under the root is
//! reused so that a restart never silently switches backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use strata_common::error::{Result, StrataError};

use crate::driver::Driver;
use crate::vfs;

/// Constructor for a driver rooted at `home` with `key=value` options.
pub type InitFn = fn(home: &Path, options: &[String]) -> Result<Arc<dyn Driver>>;

/// Registry of available graph drivers.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, InitFn>,
    priority: Vec<String>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in drivers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let _ = registry.drivers.insert(vfs::NAME.into(), vfs::init);
        registry.priority.push(vfs::NAME.into());
        registry
    }

    /// Registers a driver under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if a driver with the same name already exists.
    pub fn register(&mut self, name: impl Into<String>, init: InitFn) -> Result<()> {
        let name = name.into();
        if self.drivers.contains_key(&name) {
            return Err(StrataError::Config {
                message: format!("graph driver already registered: {name}"),
            });
        }
        let _ = self.drivers.insert(name, init);
        Ok(())
    }

    /// Returns the registered driver names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    /// Opens a driver under `root/<name>`.
    ///
    /// With `name == None`, a single prior driver directory under `root`
    /// wins; otherwise drivers are tried in priority order.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown name, `Config` if several prior
    /// driver directories exist, or the first initialization error.
    pub fn open(
        &self,
        name: Option<&str>,
        root: &Path,
        options: &[String],
    ) -> Result<Arc<dyn Driver>> {
        if let Some(name) = name {
            tracing::debug!(driver = name, "trying configured graph driver");
            let init = self.drivers.get(name).ok_or_else(|| StrataError::NotFound {
                kind: "graph driver",
                id: name.to_string(),
            })?;
            return init(&root.join(name), options);
        }

        let prior: Vec<&String> = self
            .drivers
            .keys()
            .filter(|name| root.join(name.as_str()).is_dir())
            .collect();
        match prior.as_slice() {
            [] => {}
            [name] => {
                tracing::info!(driver = %name, "using prior graph driver");
                return self.drivers[name.as_str()](&root.join(name.as_str()), options);
            }
            several => {
                let names: Vec<&str> = several.iter().map(|n| n.as_str()).collect();
                return Err(StrataError::Config {
                    message: format!(
                        "{} contains several graph drivers: {}; choose one explicitly",
                        root.display(),
                        names.join(", ")
                    ),
                });
            }
        }

        let ordered = self.priority.iter().chain(
            self.drivers
                .keys()
                .filter(|name| !self.priority.contains(name)),
        );
        let mut last_err = None;
        for name in ordered {
            match self.drivers[name.as_str()](&root.join(name.as_str()), options) {
                Ok(driver) => {
                    tracing::info!(driver = %name, "selected graph driver");
                    return Ok(driver);
                }
                Err(e) => {
                    tracing::debug!(driver = %name, error = %e, "graph driver unavailable");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StrataError::Config {
            message: "no supported graph driver found".into(),
        }))
    }
}
