// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Name registry.
//!
//! Maps names to actor refs and each ref to all of its names. Entries of
//! actors that have exited are purged lazily, whenever a lookup runs into
//! one.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use super::ActorRef;
use crate::error::{Error, Result};

/// What `unregister` removes: one name, or every name of a ref.
#[derive(Debug, Clone)]
pub enum RegistryKey {
    Name(String),
    Ref(ActorRef),
}

impl From<&str> for RegistryKey {
    fn from(name: &str) -> Self {
        RegistryKey::Name(name.to_string())
    }
}

impl From<String> for RegistryKey {
    fn from(name: String) -> Self {
        RegistryKey::Name(name)
    }
}

impl From<ActorRef> for RegistryKey {
    fn from(aref: ActorRef) -> Self {
        RegistryKey::Ref(aref)
    }
}

impl From<&ActorRef> for RegistryKey {
    fn from(aref: &ActorRef) -> Self {
        RegistryKey::Ref(aref.clone())
    }
}

#[derive(Default)]
struct Names {
    by_name: HashMap<String, ActorRef>,
    by_ref: HashMap<ActorRef, BTreeSet<String>>,
}

impl Names {
    fn purge(&mut self, aref: &ActorRef) {
        if let Some(names) = self.by_ref.remove(aref) {
            for name in names {
                self.by_name.remove(&name);
            }
        }
    }

    fn remove_name(&mut self, name: &str) -> Option<ActorRef> {
        let aref = self.by_name.remove(name)?;
        if let Some(names) = self.by_ref.get_mut(&aref) {
            names.remove(name);
            if names.is_empty() {
                self.by_ref.remove(&aref);
            }
        }
        Some(aref)
    }
}

#[derive(Default)]
pub struct Registry {
    names: Mutex<Names>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `aref`. Re-registering the same pair is a no-op; a
    /// name held by an exited actor is taken over.
    pub fn register(&self, name: &str, aref: &ActorRef) -> Result<()> {
        if !aref.is_alive() {
            return Err(Error::DeadActor(aref.to_string()));
        }
        let mut names = self.names.lock();
        if let Some(holder) = names.by_name.get(name).cloned() {
            if holder == *aref {
                return Ok(());
            }
            if holder.is_alive() {
                return Err(Error::NameTaken {
                    name: name.to_string(),
                    holder: holder.to_string(),
                });
            }
            names.purge(&holder);
        }
        names.by_name.insert(name.to_string(), aref.clone());
        names
            .by_ref
            .entry(aref.clone())
            .or_default()
            .insert(name.to_string());
        debug!(name, actor = %aref, "name registered");
        Ok(())
    }

    /// Remove a name, or every name of a ref. Unknown keys are ignored.
    pub fn unregister(&self, key: impl Into<RegistryKey>) {
        let mut names = self.names.lock();
        match key.into() {
            RegistryKey::Name(name) => {
                if let Some(aref) = names.remove_name(&name) {
                    debug!(name = %name, actor = %aref, "name unregistered");
                }
            }
            RegistryKey::Ref(aref) => {
                names.purge(&aref);
                debug!(actor = %aref, "names unregistered");
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ActorRef> {
        let mut names = self.names.lock();
        let aref = names.by_name.get(name).cloned()?;
        if aref.is_alive() {
            Some(aref)
        } else {
            names.purge(&aref);
            None
        }
    }

    /// Every name bound to `aref`, sorted.
    pub fn names_of(&self, aref: &ActorRef) -> Vec<String> {
        let mut names = self.names.lock();
        if !aref.is_alive() {
            names.purge(aref);
            return Vec::new();
        }
        names
            .by_ref
            .get(aref)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// All names bound to live actors, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.names.lock();
        let dead: Vec<ActorRef> = names
            .by_ref
            .keys()
            .filter(|aref| !aref.is_alive())
            .cloned()
            .collect();
        for aref in &dead {
            names.purge(aref);
        }
        let mut all: Vec<String> = names.by_name.keys().cloned().collect();
        all.sort();
        all
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names.lock().by_name.len())
            .finish()
    }
}
