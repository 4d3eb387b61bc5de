//! Cross-partition search: best archive matches across several conversations.

use serde::Serialize;
use tracing::{debug, warn};

use crate::archive::{ArchiveHit, ArchiveStore};
use crate::config::EngineConfig;
use crate::db::partition_name;
use crate::embedding::EmbedPurpose;
use crate::error::MemoryError;

/// An archive hit labeled with the conversation it came from.
#[derive(Debug, Clone, Serialize)]
pub struct CrossPartitionHit {
    #[serde(flatten)]
    pub hit: ArchiveHit,
    pub conversation_id: String,
    /// Display label from the resolver (e.g. a channel name).
    pub label: String,
}

impl CrossPartitionHit {
    /// `[#label] [2024-01-15 10:30] alice: text`
    pub fn line(&self) -> String {
        format!("[#{}] {}", self.label, self.hit.line())
    }
}

/// Aggregates matches from many partitions.
///
/// Uses a stricter threshold than single-partition queries since results from
/// other conversations are supplementary.
#[derive(Clone)]
pub struct CrossPartitionSearch {
    archive: ArchiveStore,
    threshold: f32,
}

impl CrossPartitionSearch {
    pub fn new(archive: ArchiveStore, config: &EngineConfig) -> Self {
        Self {
            archive,
            threshold: config.cross_partition_threshold(),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Search every allowed conversation and merge the results.
    ///
    /// `resolver` maps a conversation id to its display label; `None` means
    /// the conversation no longer exists upstream and it is skipped. Missing
    /// partitions are skipped too. Returns at most `k` hits by ascending
    /// distance. An embedding failure yields no hits.
    pub async fn query<F>(
        &self,
        query_text: &str,
        allowed_conversation_ids: &[String],
        k: usize,
        resolver: F,
    ) -> Result<Vec<CrossPartitionHit>, MemoryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if k == 0 || allowed_conversation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = match self
            .archive
            .embedder()
            .embed(query_text, EmbedPurpose::Query)
            .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Cross-partition query embedding failed");
                return Ok(Vec::new());
            }
        };

        let mut merged: Vec<CrossPartitionHit> = Vec::new();
        for conversation_id in allowed_conversation_ids {
            let Some(label) = resolver(conversation_id) else {
                debug!(conversation_id = %conversation_id, "Skipping unresolvable conversation");
                continue;
            };
            match self.archive.has_partition(conversation_id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(conversation_id = %conversation_id, "Skipping conversation without archive");
                    continue;
                }
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "Partition lookup failed, skipping");
                    continue;
                }
            }

            let partition = partition_name(conversation_id);
            let hits = match self.archive.nearest(&partition, &query_embedding, k) {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Partition scan failed, skipping");
                    continue;
                }
            };

            merged.extend(
                hits.into_iter()
                    .filter(|hit| hit.distance <= self.threshold)
                    .map(|hit| CrossPartitionHit {
                        hit,
                        conversation_id: conversation_id.clone(),
                        label: label.clone(),
                    }),
            );
        }

        // Stable sort: equal distances keep the order partitions were listed in.
        merged.sort_by(|a, b| a.hit.distance.total_cmp(&b.hit.distance));
        merged.truncate(k);
        Ok(merged)
    }
}
