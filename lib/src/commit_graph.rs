// Copyright 2024 The pgit Authors
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

//! The commit-graph mirror: a lightweight heap row per commit with a binary
//! lifting table for O(log N) k-th ancestor queries.
//!
//! `ancestors[k]` holds the sequence number of the ancestor `2^k` steps
//! back; the vector is truncated where the chain is shorter than `2^k`.
//! Graph rows are inserted atomically with their commits and dropped with
//! them.

use std::collections::HashMap;

use sqlx::PgConnection;
use sqlx::PgPool;
use sqlx::Row as _;
use sqlx::postgres::PgRow;

use crate::copy::CopyBuffer;
use crate::object_id::CommitId;
use crate::object_id::GraphSeq;
use crate::object_id::PrefixResolution;
use crate::object_id::prefix_upper_bound;
use crate::store::StoreError;
use crate::store::StoreResult;

/// Candidates returned before a prefix is declared ambiguous.
const PREFIX_CANDIDATE_CAP: usize = 10;

/// One row of `pgit_commit_graph`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphEntry {
    /// Monotonic import order; primary key.
    pub seq: GraphSeq,
    pub id: CommitId,
    /// Distance from the root commit.
    pub depth: i32,
    pub ancestors: Vec<GraphSeq>,
}

/// Builds lifting entries in memory, in import order. The import pipeline
/// pushes every commit through one builder so ancestor slots resolve without
/// database lookups; the same code answers k-th ancestor queries for tests.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    entries: Vec<GraphEntry>,
    by_id: HashMap<CommitId, GraphSeq>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the builder with entries already in the database (resumed
    /// imports). Entries must arrive in ascending `seq` order.
    pub fn preload(&mut self, entries: Vec<GraphEntry>) {
        for entry in entries {
            debug_assert_eq!(entry.seq.value() as usize, self.entries.len() + 1);
            self.by_id.insert(entry.id.clone(), entry.seq);
            self.entries.push(entry);
        }
    }

    /// Appends a commit and computes its lifting row from the parent's.
    pub fn push(&mut self, id: CommitId, parent_id: Option<&CommitId>) -> &GraphEntry {
        let seq = GraphSeq(self.entries.len() as i32 + 1);
        let (depth, ancestors) = match parent_id.and_then(|p| self.by_id.get(p)) {
            None => (0, Vec::new()),
            Some(&parent_seq) => {
                let parent = self.entry(parent_seq);
                let mut ancestors = vec![parent_seq];
                // ancestors[k] is the 2^(k-1)-th ancestor of the 2^(k-1)-th
                // ancestor.
                for k in 1.. {
                    let Some(&hop) = self.entry(ancestors[k - 1]).ancestors.get(k - 1) else {
                        break;
                    };
                    ancestors.push(hop);
                }
                (parent.depth + 1, ancestors)
            }
        };
        self.by_id.insert(id.clone(), seq);
        self.entries.push(GraphEntry {
            seq,
            id,
            depth,
            ancestors,
        });
        self.entries.last().unwrap()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether a commit already has a graph entry (preloaded or pushed).
    pub fn contains(&self, id: &CommitId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GraphEntry] {
        &self.entries
    }

    fn entry(&self, seq: GraphSeq) -> &GraphEntry {
        &self.entries[seq.value() as usize - 1]
    }

    /// In-memory k-th ancestor via the lifting table. Returns the entry and
    /// the number of jumps taken.
    pub fn kth_ancestor(&self, id: &CommitId, k: u64) -> Option<(&GraphEntry, usize)> {
        let mut current = self.entry(*self.by_id.get(id)?);
        if k > current.depth as u64 {
            return None;
        }
        let mut jumps = 0;
        let mut remaining = k;
        while remaining > 0 {
            let bit = remaining.trailing_zeros() as usize;
            let hop = *current.ancestors.get(bit)?;
            current = self.entry(hop);
            jumps += 1;
            remaining &= remaining - 1;
        }
        Some((current, jumps))
    }
}

pub struct CommitGraph {
    pool: PgPool,
}

impl CommitGraph {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn exists(&self, id: &CommitId) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pgit_commit_graph WHERE id = $1)")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pgit_commit_graph")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get(&self, id: &CommitId) -> StoreResult<Option<GraphEntry>> {
        let row = sqlx::query(
            "SELECT seq, id, depth, ancestors FROM pgit_commit_graph WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| entry_from_row(&row)).transpose()
    }

    async fn get_by_seq(&self, seq: GraphSeq) -> StoreResult<GraphEntry> {
        let row = sqlx::query(
            "SELECT seq, id, depth, ancestors FROM pgit_commit_graph WHERE seq = $1",
        )
        .bind(seq.value())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::CommitNotFound {
            id: format!("graph seq {seq}"),
        })?;
        entry_from_row(&row)
    }

    /// Appends one commit incrementally (the non-import write path), reading
    /// the parent's lifting row from the database.
    pub async fn append(
        &self,
        id: &CommitId,
        parent_id: Option<&CommitId>,
    ) -> StoreResult<GraphEntry> {
        let (depth, ancestors) = match parent_id {
            None => (0, Vec::new()),
            Some(parent_id) => {
                let parent =
                    self.get(parent_id)
                        .await?
                        .ok_or_else(|| StoreError::CommitNotFound {
                            id: parent_id.to_string(),
                        })?;
                let depth = parent.depth + 1;
                let mut ancestors = vec![parent.seq];
                let mut hop_entry = parent;
                for k in 1.. {
                    // ancestors[k] is the 2^(k-1)-th ancestor of
                    // ancestors[k-1].
                    let Some(&hop) = hop_entry.ancestors.get(k - 1) else {
                        break;
                    };
                    ancestors.push(hop);
                    hop_entry = self.get_by_seq(hop).await?;
                }
                (depth, ancestors)
            }
        };
        let row = sqlx::query(
            "INSERT INTO pgit_commit_graph (id, depth, ancestors)
             VALUES ($1, $2, $3)
             RETURNING seq",
        )
        .bind(id.as_str())
        .bind(depth)
        .bind(ancestors.iter().map(|s| s.value()).collect::<Vec<i32>>())
        .fetch_one(&self.pool)
        .await?;
        Ok(GraphEntry {
            seq: GraphSeq(row.try_get("seq")?),
            id: id.clone(),
            depth,
            ancestors,
        })
    }

    /// Resolves a partial commit id over the range `[prefix, prefix+1)`.
    pub async fn resolve_prefix(&self, prefix: &str) -> StoreResult<PrefixResolution<CommitId>> {
        if prefix.is_empty() {
            return Ok(PrefixResolution::NoMatch);
        }
        let rows = sqlx::query(
            "SELECT id FROM pgit_commit_graph
             WHERE id >= $1 AND id < $2
             ORDER BY id
             LIMIT $3",
        )
        .bind(prefix)
        .bind(prefix_upper_bound(prefix))
        .bind(PREFIX_CANDIDATE_CAP as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(CommitId::new(row.try_get("id")?));
        }
        Ok(match candidates.len() {
            0 => PrefixResolution::NoMatch,
            1 => PrefixResolution::SingleMatch(candidates.pop().unwrap()),
            _ => PrefixResolution::AmbiguousMatch(candidates),
        })
    }

    /// Like [`Self::resolve_prefix`] but with the caller contract "must
    /// resolve uniquely".
    pub async fn resolve_prefix_required(&self, prefix: &str) -> StoreResult<CommitId> {
        match self.resolve_prefix(prefix).await? {
            PrefixResolution::SingleMatch(id) => Ok(id),
            PrefixResolution::NoMatch => Err(StoreError::CommitNotFound {
                id: prefix.to_owned(),
            }),
            PrefixResolution::AmbiguousMatch(candidates) => Err(StoreError::AmbiguousIdPrefix {
                prefix: prefix.to_owned(),
                candidates,
            }),
        }
    }

    /// The k-th ancestor of `id` in O(log k) lookups: `k` decomposes into
    /// powers of two and each set bit is one jump through the lifting
    /// table.
    pub async fn kth_ancestor(&self, id: &CommitId, k: i64) -> StoreResult<CommitId> {
        if k < 0 {
            return Err(StoreError::NegativeAncestorDistance { distance: k });
        }
        let mut current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::CommitNotFound { id: id.to_string() })?;
        if k as u64 > current.depth as u64 {
            return Err(StoreError::AncestorOutOfRange {
                id: id.clone(),
                distance: k as u64,
            });
        }
        let mut remaining = k as u64;
        while remaining > 0 {
            let bit = remaining.trailing_zeros() as usize;
            let hop = *current
                .ancestors
                .get(bit)
                .ok_or_else(|| StoreError::AncestorOutOfRange {
                    id: id.clone(),
                    distance: k as u64,
                })?;
            current = self.get_by_seq(hop).await?;
            remaining &= remaining - 1;
        }
        Ok(current.id)
    }

    /// Finds a common ancestor of two commits over the lifting table: both
    /// sides are lifted to equal depth, then descended together from the
    /// highest jump down.
    pub async fn common_ancestor(
        &self,
        a: &CommitId,
        b: &CommitId,
    ) -> StoreResult<Option<CommitId>> {
        let entry_a = self.get(a).await?;
        let entry_b = self.get(b).await?;
        let (Some(mut entry_a), Some(mut entry_b)) = (entry_a, entry_b) else {
            return Ok(None);
        };
        if entry_a.depth > entry_b.depth {
            std::mem::swap(&mut entry_a, &mut entry_b);
        }
        let lift_steps = (entry_b.depth - entry_a.depth) as u64;
        entry_b = self.lift(entry_b, lift_steps).await?;
        if entry_a.seq == entry_b.seq {
            return Ok(Some(entry_a.id));
        }
        let max_bit = entry_a.ancestors.len();
        for bit in (0..max_bit).rev() {
            let hop_a = entry_a.ancestors.get(bit).copied();
            let hop_b = entry_b.ancestors.get(bit).copied();
            if let (Some(hop_a), Some(hop_b)) = (hop_a, hop_b)
                && hop_a != hop_b
            {
                entry_a = self.get_by_seq(hop_a).await?;
                entry_b = self.get_by_seq(hop_b).await?;
            }
        }
        match (entry_a.ancestors.first(), entry_b.ancestors.first()) {
            (Some(&pa), Some(&pb)) if pa == pb => Ok(Some(self.get_by_seq(pa).await?.id)),
            // Disjoint roots: no common history.
            _ => Ok(None),
        }
    }

    async fn lift(&self, mut entry: GraphEntry, mut steps: u64) -> StoreResult<GraphEntry> {
        while steps > 0 {
            let bit = steps.trailing_zeros() as usize;
            let hop = *entry
                .ancestors
                .get(bit)
                .ok_or_else(|| StoreError::AncestorOutOfRange {
                    id: entry.id.clone(),
                    distance: steps,
                })?;
            entry = self.get_by_seq(hop).await?;
            steps &= steps - 1;
        }
        Ok(entry)
    }

    /// Every graph entry in ascending `seq` order. The import pipeline
    /// preloads these into a [`GraphBuilder`] so a resumed run continues the
    /// lifting chain where the previous one stopped.
    pub async fn load_all(&self) -> StoreResult<Vec<GraphEntry>> {
        let rows =
            sqlx::query("SELECT seq, id, depth, ancestors FROM pgit_commit_graph ORDER BY seq")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Repairs the `seq` sequence after bulk COPY wrote explicit values.
    pub(crate) async fn sync_sequence(&self) -> StoreResult<()> {
        sqlx::query(
            "SELECT setval(pg_get_serial_sequence('pgit_commit_graph', 'seq'),
                           GREATEST((SELECT MAX(seq) FROM pgit_commit_graph), 1))",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Appends one graph entry (with explicit `seq`) to a COPY buffer.
pub(crate) fn encode_copy_row(entry: &GraphEntry, buf: &mut CopyBuffer) {
    buf.int(entry.seq.value());
    buf.text(entry.id.as_str());
    buf.int(entry.depth);
    buf.int_array(entry.ancestors.iter().map(|s| s.value()));
    buf.end_row();
}

/// Streams a prepared COPY buffer into `pgit_commit_graph`.
pub(crate) async fn copy_rows(conn: &mut PgConnection, buf: &CopyBuffer) -> StoreResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut sink = conn
        .copy_in_raw(
            "COPY pgit_commit_graph (seq, id, depth, ancestors) FROM STDIN WITH (FORMAT text)",
        )
        .await?;
    sink.send(buf.as_bytes()).await?;
    sink.finish().await?;
    Ok(())
}

fn entry_from_row(row: &PgRow) -> StoreResult<GraphEntry> {
    let ancestors: Vec<i32> = row.try_get("ancestors")?;
    Ok(GraphEntry {
        seq: GraphSeq(row.try_get("seq")?),
        id: CommitId::new(row.try_get("id")?),
        depth: row.try_get("depth")?,
        ancestors: ancestors.into_iter().map(GraphSeq).collect(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use chrono::Utc;

    use super::*;
    use crate::object_id::TimeTokenGenerator;

    fn linear_chain(n: usize) -> (GraphBuilder, Vec<CommitId>) {
        let tokens = TimeTokenGenerator::new();
        let mut builder = GraphBuilder::new();
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let id = tokens.next(Utc.timestamp_millis_opt(i as i64 * 1000).unwrap());
            let parent = ids.last().cloned();
            builder.push(id.clone(), parent.as_ref());
            ids.push(id);
        }
        (builder, ids)
    }

    #[test]
    fn test_lifting_table_shape() {
        let (builder, _) = linear_chain(9);
        let entries = builder.entries();
        assert_eq!(entries[0].depth, 0);
        assert_eq!(entries[0].ancestors, vec![]);
        // Entry at depth 8 has ancestors at distances 1, 2, 4, 8.
        let tip = &entries[8];
        assert_eq!(tip.depth, 8);
        assert_eq!(
            tip.ancestors,
            vec![GraphSeq(8), GraphSeq(7), GraphSeq(5), GraphSeq(1)]
        );
    }

    #[test]
    fn test_ancestor_slot_points_at_depth_minus_pow2() {
        let (builder, _) = linear_chain(40);
        for entry in builder.entries() {
            for (k, hop) in entry.ancestors.iter().enumerate() {
                let target = &builder.entries()[hop.value() as usize - 1];
                assert_eq!(target.depth, entry.depth - (1 << k));
            }
        }
    }

    #[test]
    fn test_kth_ancestor_jump_budget() {
        let (builder, ids) = linear_chain(1000);
        let tip = ids.last().unwrap();
        let (entry, jumps) = builder.kth_ancestor(tip, 100).unwrap();
        assert_eq!(entry.depth, 999 - 100);
        assert_eq!(entry.id, ids[ids.len() - 101]);
        // log2(100) rounds up to 7; the jump count is the popcount of 100.
        assert!(jumps <= 7, "took {jumps} jumps");
    }

    #[test]
    fn test_kth_ancestor_bounds() {
        let (builder, ids) = linear_chain(10);
        let tip = ids.last().unwrap();
        assert_eq!(builder.kth_ancestor(tip, 0).unwrap().0.id, *tip);
        assert_eq!(builder.kth_ancestor(tip, 9).unwrap().0.id, ids[0]);
        assert!(builder.kth_ancestor(tip, 10).is_none());
    }

    #[test]
    fn test_builder_matches_import_order() {
        let (builder, ids) = linear_chain(3);
        assert_eq!(builder.len(), 3);
        let seqs: Vec<_> = builder.entries().iter().map(|e| e.seq.value()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(builder.entries()[2].id, ids[2]);
    }
}
