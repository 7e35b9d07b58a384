//! Operon → transcript materialization
//!
//! Loads the transcripts of a set of operons in batches, folds exon rows
//! into transcripts, groups them by operon and interns transcripts that
//! belong to more than one operon. Transcripts are stamped with their
//! stable identifiers before interning, so the instances the interner keeps
//! are the ones `OperonLoader` hands out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::{debug, info};

use super::aggregator::RowAggregator;
use super::interner::{GroupedCollections, GroupedMaterializer, RedundancyInterner};
use crate::batch::{in_list, Batcher};
use crate::domain::{Exon, Operon, Transcript};
use crate::error::Result;
use crate::ids::{EntityType, IdAllocator, StableIdentifier};
use crate::sql::templates::OPERON_TRANSCRIPTS;
use crate::sql::{QuerySource, SqlExecutor, SqlRow};

const OPERON_ID: usize = 0;
const TRANSCRIPT_ID: usize = 1;
const RAW_KEY: usize = 2;
const EXON_ID: usize = 3;
const RANK: usize = 4;
const SEQ_START: usize = 5;
const SEQ_END: usize = 6;

/// Rows keyed by (operon, transcript); one row per exon, ordered by rank.
pub struct TranscriptRows;

impl TranscriptRows {
    fn exon(row: &SqlRow) -> Result<Exon> {
        Ok(Exon {
            exon_id: row.get(EXON_ID)?,
            rank: row.get(RANK)?,
            start: row.get(SEQ_START)?,
            end: row.get(SEQ_END)?,
        })
    }
}

impl RowAggregator<SqlRow> for TranscriptRows {
    type Key = (i64, i64);
    type Output = Transcript;

    fn key(&self, row: &SqlRow) -> Result<(i64, i64)> {
        Ok((row.get(OPERON_ID)?, row.get(TRANSCRIPT_ID)?))
    }

    fn first(&self, row: &SqlRow) -> Result<Transcript> {
        let mut transcript = Transcript::new(row.get(TRANSCRIPT_ID)?, row.get::<String>(RAW_KEY)?);
        transcript.exons.push(Self::exon(row)?);
        Ok(transcript)
    }

    fn merge(&self, transcript: &mut Transcript, row: &SqlRow, _position: usize) -> Result<()> {
        transcript.exons.push(Self::exon(row)?);
        Ok(())
    }
}

/// Materializes `operon_id -> [(transcript_id, transcript)]` for a slice of
/// operon ids. Every requested operon gets a group, empty if it has no
/// transcripts. Repeated ids in the request map to one group.
pub struct OperonTranscripts {
    executor: Arc<dyn SqlExecutor>,
    templates: Arc<dyn QuerySource>,
    batcher: Batcher,
}

impl OperonTranscripts {
    pub fn new(executor: Arc<dyn SqlExecutor>, templates: Arc<dyn QuerySource>, batcher: Batcher) -> Self {
        Self {
            executor,
            templates,
            batcher,
        }
    }
}

impl GroupedMaterializer<[i64]> for OperonTranscripts {
    type Group = i64;
    type Key = i64;
    type Item = Transcript;

    fn materialize(&self, operon_ids: &[i64]) -> Result<GroupedCollections<i64, i64, Transcript>> {
        let mut groups: GroupedCollections<i64, i64, Transcript> =
            operon_ids.iter().map(|id| (*id, Vec::new())).collect();
        let requested: Vec<i64> = groups.keys().copied().collect();

        for batch in self.batcher.iter(&requested) {
            let ids = in_list(batch);
            let sql = self.templates.get_query_with(OPERON_TRANSCRIPTS, &[ids.as_str()])?;
            let rows = self.executor.query_rows(&sql, &[])?;
            debug!("Operon batch of {} ids returned {} rows", batch.len(), rows.len());

            for ((operon_id, transcript_id), transcript) in TranscriptRows.aggregate(rows)? {
                groups
                    .entry(operon_id)
                    .or_default()
                    .push((transcript_id, Arc::new(transcript)));
            }
        }
        Ok(groups)
    }
}

/// Stamps every transcript of the upstream groups with its stable
/// identifier, allocating once per distinct raw key.
pub struct StableIdStamping<M> {
    inner: M,
    allocator: IdAllocator,
}

impl<M> StableIdStamping<M> {
    pub fn new(inner: M, allocator: IdAllocator) -> Self {
        Self { inner, allocator }
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }
}

impl<Req: ?Sized, M> GroupedMaterializer<Req> for StableIdStamping<M>
where
    M: GroupedMaterializer<Req, Item = Transcript>,
{
    type Group = M::Group;
    type Key = M::Key;
    type Item = Transcript;

    fn materialize(&self, request: &Req) -> Result<GroupedCollections<M::Group, M::Key, Transcript>> {
        let groups = self.inner.materialize(request)?;

        let raw_keys: IndexSet<&str> = groups.values().flatten().map(|(_, t)| t.raw_key.as_str()).collect();
        let raw_keys: Vec<&str> = raw_keys.into_iter().collect();
        let ids: HashMap<String, StableIdentifier> = self
            .allocator
            .allocate_all(EntityType::Transcript, raw_keys.as_slice())?
            .into_iter()
            .map(|allocated| (allocated.raw_key, allocated.stable_id))
            .collect();

        Ok(groups
            .into_iter()
            .map(|(group, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|(key, transcript)| {
                        let mut transcript = Arc::try_unwrap(transcript).unwrap_or_else(|shared| (*shared).clone());
                        transcript.stable_id = ids.get(&transcript.raw_key).cloned();
                        (key, Arc::new(transcript))
                    })
                    .collect();
                (group, entries)
            })
            .collect())
    }
}

/// Assembles operons whose shared transcripts are single, stamped instances.
pub struct OperonLoader {
    materializer: RedundancyInterner<StableIdStamping<OperonTranscripts>>,
}

impl OperonLoader {
    pub fn new(materializer: OperonTranscripts, allocator: IdAllocator) -> Self {
        Self {
            materializer: RedundancyInterner::new(StableIdStamping::new(materializer, allocator)),
        }
    }

    pub fn load(&self, operon_ids: &[i64]) -> Result<Vec<Operon>> {
        let groups = self.materializer.materialize(operon_ids)?;

        let operons: Vec<Operon> = groups
            .into_iter()
            .map(|(operon_id, entries)| Operon {
                operon_id,
                transcripts: entries.into_iter().map(|(_, transcript)| transcript).collect(),
            })
            .collect();

        let distinct: HashSet<*const Transcript> =
            operons.iter().flat_map(|o| o.transcripts.iter().map(Arc::as_ptr)).collect();
        info!("Loaded {} operons with {} distinct transcripts", operons.len(), distinct.len());
        Ok(operons)
    }
}
