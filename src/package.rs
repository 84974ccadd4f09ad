/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Package units: the model packages objects' classes belong to
//!
//! The repository must know a package before it stores instances of its
//! classes. Packages registered locally but not yet known to the repository
//! are *new* and travel with the first commit that uses them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::revision::ClassRef;

/// Whether the repository knows a package unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    /// Registered locally only
    New,
    /// Known to the repository
    Loaded,
}

/// One package unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageUnit {
    /// Package namespace URI
    pub uri: String,
    pub state: PackageState,
    /// URIs of the packages this one depends on
    pub deps: Vec<String>,
}

impl PackageUnit {
    /// Create a new (uncommitted) unit
    pub fn new<S: Into<String>>(uri: S, deps: Vec<String>) -> PackageUnit {
        PackageUnit { uri: uri.into(), state: PackageState::New, deps }
    }
}

/// Registry of package units known to a session
#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    units: BTreeMap<String, PackageUnit>,
}

impl PackageRegistry {
    /// Create an empty registry
    pub fn new() -> PackageRegistry {
        PackageRegistry { units: BTreeMap::new() }
    }

    /// Register a unit. A unit already present keeps its state unless the
    /// new registration says it is loaded.
    pub fn register(&mut self, unit: PackageUnit) {
        match self.units.get_mut(&unit.uri) {
            Some(existing) => {
                if unit.state == PackageState::Loaded {
                    existing.state = PackageState::Loaded;
                }
            }
            None => {
                trace!("Registering package {} ({:?})", unit.uri, unit.state);
                self.units.insert(unit.uri.clone(), unit);
            }
        }
    }

    pub fn get(&self, uri: &str) -> Option<&PackageUnit> {
        self.units.get(uri)
    }

    pub fn state(&self, uri: &str) -> Option<PackageState> {
        self.units.get(uri).map(|u| u.state)
    }

    /// Mark units as known to the repository
    pub fn mark_loaded<'a, I: IntoIterator<Item = &'a str>>(&mut self, uris: I) {
        for uri in uris {
            if let Some(unit) = self.units.get_mut(uri) {
                unit.state = PackageState::Loaded;
            }
        }
    }

    /// Compute the units which must be sent with a commit creating
    /// instances of `classes`: the dependency closure of their packages,
    /// restricted to units in state `New`. Result is ordered by URI.
    ///
    /// Every package reached must be registered.
    pub fn analyze_new_packages<'a, I>(&self, classes: I) -> Result<Vec<PackageUnit>>
        where I: IntoIterator<Item = &'a ClassRef>
    {
        let mut seen = BTreeSet::new();
        let mut todo: Vec<&str> = classes.into_iter().map(|c| c.package.as_str()).collect();
        while let Some(uri) = todo.pop() {
            if !seen.insert(uri) {
                continue;
            }
            let unit = self.units.get(uri)
                .ok_or_else(|| Error::illegal(format!("unknown package: {}", uri)))?;
            todo.extend(unit.deps.iter().map(|d| d.as_str()));
        }
        Ok(seen.into_iter()
            .filter_map(|uri| self.units.get(uri))
            .filter(|u| u.state == PackageState::New)
            .cloned()
            .collect())
    }
}
