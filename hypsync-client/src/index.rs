//! In-memory pool of decoded annotations for one synchronization session.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::annotation::{Annotation, normalize_uri};

/// Identity map plus tag, URI, and thread sub-indices.
///
/// The sub-indices are built on first query and maintained incrementally
/// from then on. Thread edges are stored as id pairs; replies whose parent
/// is absent are recorded as orphans rather than failing.
#[derive(Debug, Default)]
pub struct AnnotationIndex {
    by_id: HashMap<String, Annotation>,
    tags: HashMap<String, HashSet<String>>,
    uris: HashMap<String, HashSet<String>>,
    replies: HashMap<String, HashSet<String>>,
    orphans: HashSet<String>,
    subindexed: bool,
}

impl AnnotationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index over existing records.
    pub fn from_records(records: impl IntoIterator<Item = Annotation>) -> Self {
        let mut index = Self::new();
        for anno in records {
            index.by_id.insert(anno.id.clone(), anno);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Looks up one record by id.
    pub fn by_id(&self, id: &str) -> Option<&Annotation> {
        self.by_id.get(id)
    }

    /// Inserts or replaces a record, returning the displaced one.
    pub fn insert(&mut self, anno: Annotation) -> Option<Annotation> {
        if self.subindexed {
            if let Some(old) = self.by_id.get(&anno.id) {
                let old = old.clone();
                self.unindex(&old);
            }
            self.index_one(&anno);
            self.adopt_orphans_of(&anno.id);
        }
        self.by_id.insert(anno.id.clone(), anno)
    }

    /// Removes a record by id, returning it.
    pub fn remove(&mut self, id: &str) -> Option<Annotation> {
        let anno = self.by_id.remove(id)?;
        if self.subindexed {
            self.unindex(&anno);
            // Children of the removed record dangle now.
            if let Some(children) = self.replies.get(id) {
                self.orphans.extend(children.iter().cloned());
            }
        }
        Some(anno)
    }

    /// Records matching every given tag, sorted by `updated`.
    pub fn by_tags(&mut self, tags: &[&str]) -> Vec<&Annotation> {
        self.ensure_subindexed();
        let mut ids: Option<HashSet<&String>> = None;
        for tag in tags {
            let matched: HashSet<&String> = self
                .tags
                .get(*tag)
                .map(|set| set.iter().collect())
                .unwrap_or_default();
            ids = Some(match ids {
                Some(ids) => ids.intersection(&matched).copied().collect(),
                None => matched,
            });
        }
        let mut found: Vec<&Annotation> = ids
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.by_id.get(id.as_str()))
            .collect();
        found.sort_by(|a, b| a.updated.cmp(&b.updated));
        found
    }

    /// Tags in use on a document address (normalized form).
    pub fn tags_on_uri(&mut self, uri: &str) -> HashSet<String> {
        self.ensure_subindexed();
        self.uris.get(&normalize_uri(uri)).cloned().unwrap_or_default()
    }

    /// Direct replies to the given id, sorted by `updated`.
    pub fn replies_to(&mut self, id: &str) -> Vec<&Annotation> {
        self.ensure_subindexed();
        let mut found: Vec<&Annotation> = self
            .replies
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.by_id.get(child))
            .collect();
        found.sort_by(|a, b| a.updated.cmp(&b.updated));
        found
    }

    /// Nearest present ancestor of a reply, walking the reference chain
    /// from the direct parent upward.
    pub fn parent_of(&self, anno: &Annotation) -> Option<&Annotation> {
        anno.references
            .iter()
            .rev()
            .find_map(|id| self.by_id.get(id))
    }

    /// Replies whose direct parent is not in the index.
    pub fn orphans(&mut self) -> &HashSet<String> {
        self.ensure_subindexed();
        &self.orphans
    }

    /// All records sorted by `updated`, cloned for persistence.
    pub fn sorted_records(&self) -> Vec<Annotation> {
        let mut records: Vec<Annotation> = self.by_id.values().cloned().collect();
        records.sort_by(|a, b| a.updated.cmp(&b.updated));
        records
    }

    fn ensure_subindexed(&mut self) {
        if self.subindexed {
            return;
        }
        debug!("building sub-indices over {} records", self.by_id.len());
        let annos: Vec<Annotation> = self.by_id.values().cloned().collect();
        for anno in &annos {
            self.index_one(anno);
        }
        self.subindexed = true;
    }

    fn index_one(&mut self, anno: &Annotation) {
        for tag in &anno.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(anno.id.clone());
        }
        if !anno.tags.is_empty() {
            self.uris
                .entry(normalize_uri(&anno.uri))
                .or_default()
                .extend(anno.tags.iter().cloned());
        }
        if let Some(parent) = anno.parent_id() {
            self.replies
                .entry(parent.to_owned())
                .or_default()
                .insert(anno.id.clone());
            if !self.by_id.contains_key(parent) {
                self.orphans.insert(anno.id.clone());
            }
        }
    }

    fn unindex(&mut self, anno: &Annotation) {
        for tag in &anno.tags {
            if let Some(ids) = self.tags.get_mut(tag) {
                ids.remove(&anno.id);
                if ids.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        // The uri tag set stays: other records may still use those tags
        // on the same address.
        if let Some(parent) = anno.parent_id()
            && let Some(children) = self.replies.get_mut(parent)
        {
            children.remove(&anno.id);
            if children.is_empty() {
                self.replies.remove(parent);
            }
        }
        self.orphans.remove(&anno.id);
    }

    fn adopt_orphans_of(&mut self, parent: &str) {
        let adopted: Vec<String> = self
            .orphans
            .iter()
            .filter(|id| {
                self.by_id
                    .get(*id)
                    .and_then(|a| a.parent_id())
                    .is_some_and(|p| p == parent)
            })
            .cloned()
            .collect();
        for id in adopted {
            self.orphans.remove(&id);
        }
    }
}
