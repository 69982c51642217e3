//! Author registry: stable `author_id`s across sources and runs.
//!
//! The registry is an explicit object owned by the pipeline and passed by
//! `&mut` to the merger, which makes it the single writer for id
//! allocation. Its lifecycle is:
//!
//! 1. **Load**: [`AuthorRegistry::from_entries`] with the persisted
//!    `authors.jsonl`; the allocator starts at the persisted max + 1.
//! 2. **Reviewed aliases**: [`AuthorRegistry::apply_alias_list`] attaches
//!    hand-maintained alias groups.
//! 3. **Resolve**: [`AuthorRegistry::resolve`] during merging, creating
//!    entries for unseen names.
//! 4. **Persist**: the caller writes [`AuthorRegistry::entries`] back out.
//!
//! Matching is exact equality of [`fold_key`] (case and diacritics
//! ignored). There is no fuzzy matching; merging two people is only ever
//! done through an alias list.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CanonError;
use crate::models::{AuthorEntry, AuthorId, AuthorRole};
use crate::normalize::{fold_key, normalize};

/// One reviewed alias group, as kept in the alias list file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasGroup {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AuthorRegistry {
    entries: BTreeMap<AuthorId, AuthorEntry>,
    index: HashMap<String, AuthorId>,
    next_id: AuthorId,
}

impl Default for AuthorRegistry {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }
}

impl AuthorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted entries.
    ///
    /// Fails with [`CanonError::AuthorAliasConflict`] when two entries
    /// claim the same alias key, and with [`CanonError::ParseFailure`]
    /// when an `author_id` appears twice.
    pub fn from_entries(entries: impl IntoIterator<Item = AuthorEntry>) -> Result<Self, CanonError> {
        let mut registry = Self::new();
        for entry in entries {
            let id = entry.author_id;
            if registry.entries.contains_key(&id) {
                return Err(CanonError::parse(format!("duplicate author_id {}", id)));
            }
            let names: Vec<String> = std::iter::once(entry.canonical_name.clone())
                .chain(entry.aliases.iter().cloned())
                .collect();
            registry.entries.insert(id, entry);
            for name in names {
                registry.index_name(&name, id)?;
            }
            registry.next_id = registry.next_id.max(id + 1);
        }
        Ok(registry)
    }

    fn index_name(&mut self, name: &str, id: AuthorId) -> Result<(), CanonError> {
        let key = fold_key(name);
        if key.is_empty() {
            return Ok(());
        }
        match self.index.get(&key) {
            Some(&existing) if existing != id => Err(CanonError::AuthorAliasConflict {
                name: name.to_string(),
                first: existing.min(id),
                second: existing.max(id),
            }),
            Some(_) => Ok(()),
            None => {
                self.index.insert(key, id);
                Ok(())
            }
        }
    }

    /// Attach reviewed alias groups.
    ///
    /// A group whose names already resolve to two different authors is a
    /// conflict that only a human can settle, so the whole call fails.
    /// A group matching nothing creates a new entry.
    pub fn apply_alias_list(&mut self, groups: &[AliasGroup]) -> Result<(), CanonError> {
        for group in groups {
            let names: Vec<String> = std::iter::once(&group.canonical)
                .chain(group.aliases.iter())
                .map(|n| normalize(n))
                .filter(|n| !n.is_empty())
                .collect();

            let mut matched: Option<AuthorId> = None;
            for name in &names {
                if let Some(id) = self.lookup(name) {
                    match matched {
                        Some(first) if first != id => {
                            return Err(CanonError::AuthorAliasConflict {
                                name: name.clone(),
                                first: first.min(id),
                                second: first.max(id),
                            });
                        }
                        Some(_) => {}
                        None => matched = Some(id),
                    }
                }
            }

            let id = match matched {
                Some(id) => id,
                None => match names.first() {
                    Some(canonical) => self.insert_new(canonical),
                    None => continue,
                },
            };
            for name in &names {
                self.add_alias(id, name)?;
            }
        }
        Ok(())
    }

    /// Resolve a raw name to its `author_id`, allocating a new id on
    /// first sight. Every new spelling is recorded as an alias.
    pub fn resolve(&mut self, raw_name: &str) -> Result<AuthorId, CanonError> {
        let name = normalize(raw_name);
        if fold_key(&name).is_empty() {
            return Err(CanonError::parse("empty author name"));
        }
        let id = match self.lookup(&name) {
            Some(id) => id,
            None => self.insert_new(&name),
        };
        self.add_alias(id, &name)?;
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<AuthorId> {
        self.index.get(&fold_key(name)).copied()
    }

    pub fn get(&self, id: AuthorId) -> Option<&AuthorEntry> {
        self.entries.get(&id)
    }

    /// Note that `id` contributed text in `language` with `role` from `source`.
    pub fn record_usage(&mut self, id: AuthorId, language: &str, role: AuthorRole, source: &str) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.languages.insert(language.to_string());
            entry.roles.insert(role);
            entry.sources.insert(source.to_string());
        }
    }

    /// All entries, ascending by `author_id`.
    pub fn entries(&self) -> impl Iterator<Item = &AuthorEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id the next unseen name would receive.
    pub fn next_id(&self) -> AuthorId {
        self.next_id
    }

    fn insert_new(&mut self, canonical: &str) -> AuthorId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            AuthorEntry {
                author_id: id,
                canonical_name: canonical.to_string(),
                aliases: BTreeSet::new(),
                languages: BTreeSet::new(),
                roles: BTreeSet::new(),
                sources: BTreeSet::new(),
            },
        );
        self.index.insert(fold_key(canonical), id);
        id
    }

    fn add_alias(&mut self, id: AuthorId, name: &str) -> Result<(), CanonError> {
        self.index_name(name, id)?;
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.canonical_name != name {
                entry.aliases.insert(name.to_string());
            }
        }
        Ok(())
    }
}
