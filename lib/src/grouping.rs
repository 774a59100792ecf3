// Copyright 2025 The pgit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! The import grouping pass: a union-find over paths keyed on content
//! similarity. Two paths land in one group when the same content hash has
//! been observed at both, which catches renames, copies, and forks of a
//! common ancestor. Paths with no observed similarity stay in singleton
//! groups.
//!
//! The pass is deterministic and idempotent for a given commit stream:
//! unions always attach the larger root under the smaller, and local group
//! indexes are numbered densely in first-appearance order.

use std::collections::HashMap;

use crate::object_id::ContentHash;

#[derive(Debug, Default)]
pub struct PathGrouper {
    paths: Vec<String>,
    index_of: HashMap<String, usize>,
    parent: Vec<usize>,
    first_seen_at: HashMap<ContentHash, usize>,
}

impl PathGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one commit's blob set, in stream order. A `None` hash is a
    /// deletion; it registers the path but asserts no similarity.
    pub fn observe_commit<'a>(
        &mut self,
        blobs: impl IntoIterator<Item = (&'a str, Option<ContentHash>)>,
    ) {
        for (path, hash) in blobs {
            let slot = self.intern(path);
            let Some(hash) = hash else {
                continue;
            };
            match self.first_seen_at.get(&hash) {
                Some(&first) => self.union(first, slot),
                None => {
                    self.first_seen_at.insert(hash, slot);
                }
            }
        }
    }

    /// The final `path -> local_group_index` assignment, 0-based and dense.
    pub fn assignments(&mut self) -> Vec<(String, usize)> {
        let mut group_of_root: HashMap<usize, usize> = HashMap::new();
        let mut result = Vec::with_capacity(self.paths.len());
        for slot in 0..self.paths.len() {
            let root = self.find(slot);
            let next = group_of_root.len();
            let group = *group_of_root.entry(root).or_insert(next);
            result.push((self.paths[slot].clone(), group));
        }
        result
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    fn intern(&mut self, path: &str) -> usize {
        if let Some(&slot) = self.index_of.get(path) {
            return slot;
        }
        let slot = self.paths.len();
        self.paths.push(path.to_owned());
        self.index_of.insert(path.to_owned(), slot);
        self.parent.push(slot);
        slot
    }

    fn find(&mut self, mut slot: usize) -> usize {
        while self.parent[slot] != slot {
            // Path halving keeps the forest shallow without recursion.
            self.parent[slot] = self.parent[self.parent[slot]];
            slot = self.parent[slot];
        }
        slot
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        // The smaller root wins, which keeps re-runs on the same stream
        // stable.
        let (low, high) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        self.parent[high] = low;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn hash(data: &str) -> Option<ContentHash> {
        Some(ContentHash::of(data.as_bytes()))
    }

    #[test]
    fn test_unrelated_paths_get_singleton_groups() {
        let mut grouper = PathGrouper::new();
        grouper.observe_commit([("a.txt", hash("a")), ("b.txt", hash("b"))]);
        let assignments = grouper.assignments();
        assert_eq!(
            assignments,
            vec![("a.txt".to_owned(), 0), ("b.txt".to_owned(), 1)]
        );
    }

    #[test]
    fn test_rename_joins_groups() {
        let mut grouper = PathGrouper::new();
        grouper.observe_commit([("a.txt", hash("hello world\n"))]);
        // Rename: a.txt deleted, b.txt appears with identical content.
        grouper.observe_commit([("a.txt", None), ("b.txt", hash("hello world\n"))]);
        let assignments = grouper.assignments();
        assert_eq!(
            assignments,
            vec![("a.txt".to_owned(), 0), ("b.txt".to_owned(), 0)]
        );
    }

    #[test]
    fn test_rename_chain_collapses_to_one_group() {
        let mut grouper = PathGrouper::new();
        grouper.observe_commit([("a", hash("v1"))]);
        grouper.observe_commit([("a", None), ("b", hash("v1"))]);
        grouper.observe_commit([("b", hash("v2"))]);
        grouper.observe_commit([("b", None), ("c", hash("v2"))]);
        grouper.observe_commit([("d", hash("other"))]);
        let assignments = grouper.assignments();
        let group_of = |p: &str| {
            assignments
                .iter()
                .find(|(path, _)| path == p)
                .map(|(_, g)| *g)
                .unwrap()
        };
        assert_eq!(group_of("a"), group_of("b"));
        assert_eq!(group_of("b"), group_of("c"));
        assert_ne!(group_of("a"), group_of("d"));
    }

    #[test]
    fn test_copy_joins_without_deletion() {
        let mut grouper = PathGrouper::new();
        grouper.observe_commit([("src/lib.rs", hash("fork me"))]);
        grouper.observe_commit([("src/lib2.rs", hash("fork me"))]);
        let assignments = grouper.assignments();
        assert_eq!(assignments[0].1, assignments[1].1);
    }

    #[test]
    fn test_deterministic_across_reruns() {
        let commits: Vec<Vec<(&str, Option<ContentHash>)>> = vec![
            vec![("x", hash("1")), ("y", hash("2"))],
            vec![("z", hash("1"))],
            vec![("w", hash("3")), ("y", hash("3"))],
        ];
        let run = || {
            let mut grouper = PathGrouper::new();
            for commit in &commits {
                grouper.observe_commit(commit.iter().map(|(p, h)| (*p, *h)));
            }
            grouper.assignments()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_group_indexes_are_dense() {
        let mut grouper = PathGrouper::new();
        grouper.observe_commit([("a", hash("same")), ("b", hash("same")), ("c", hash("c"))]);
        let assignments = grouper.assignments();
        let mut groups: Vec<usize> = assignments.iter().map(|(_, g)| *g).collect();
        groups.sort_unstable();
        groups.dedup();
        assert_eq!(groups, vec![0, 1]);
    }
}
