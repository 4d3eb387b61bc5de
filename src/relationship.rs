//! SocialGraph - pairwise topic counters between conversation participants.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::db::Db;
use crate::error::MemoryError;

/// How often a pair talked about one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub topic: String,
    pub count: u64,
}

/// Directed edge `subject_a -> subject_b`. Every edge has a mirror with the
/// same counts.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipEdge {
    pub subject_a: String,
    pub subject_b: String,
    /// Topics in first-seen order.
    pub topic_counts: Vec<TopicCount>,
    pub interaction_count: u64,
}

impl RelationshipEdge {
    pub fn topic_count(&self, topic: &str) -> u64 {
        self.topic_counts
            .iter()
            .find(|tc| tc.topic == topic)
            .map_or(0, |tc| tc.count)
    }

    /// Most frequent topic. Ties go to the topic seen first.
    pub fn dominant_topic(&self) -> Option<&str> {
        let mut best: Option<&TopicCount> = None;
        for tc in &self.topic_counts {
            if best.map_or(true, |b| tc.count > b.count) {
                best = Some(tc);
            }
        }
        best.map(|tc| tc.topic.as_str())
    }
}

/// One partner of a subject, as shown in reply context.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipSummary {
    pub partner_id: String,
    pub dominant_topic: Option<String>,
    pub interaction_count: u64,
    pub description: String,
}

/// Topic-frequency graph between participants.
#[derive(Clone)]
pub struct SocialGraph {
    db: Db,
}

impl SocialGraph {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Count `topic` for every ordered pair of distinct participants.
    ///
    /// A missing or blank topic is a no-op. All pairs are written in one
    /// transaction. Returns the number of directed edges touched.
    pub fn record_interaction(
        &self,
        participants: &[String],
        topic: Option<&str>,
    ) -> Result<usize, MemoryError> {
        let Some(topic) = topic.map(normalize_topic).filter(|t| !t.is_empty()) else {
            return Ok(0);
        };

        let mut seen = HashSet::new();
        let unique: Vec<&str> = participants
            .iter()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty() && seen.insert(*p))
            .collect();
        if unique.len() < 2 {
            return Ok(0);
        }

        let touched = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut touched = 0;
            for a in &unique {
                for b in &unique {
                    if a == b {
                        continue;
                    }
                    bump_edge(&tx, a, b, &topic)?;
                    touched += 1;
                }
            }
            tx.commit()?;
            Ok(touched)
        })?;

        debug!(topic = %topic, participants = unique.len(), edges = touched, "Recorded interaction");
        Ok(touched)
    }

    /// The edge `a -> b`, if the pair ever interacted.
    pub fn edge(&self, a: &str, b: &str) -> Result<Option<RelationshipEdge>, MemoryError> {
        self.db.with_conn(|conn| load_edge(conn, a, b))
    }

    /// Every partner of `subject`, most interactions first.
    pub fn summarize(&self, subject: &str) -> Result<Vec<RelationshipSummary>, MemoryError> {
        self.db.with_conn(|conn| {
            let partners: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT subject_b FROM relationships
                     WHERE subject_a = ?1
                     ORDER BY interaction_count DESC, subject_b",
                )?;
                let rows = stmt.query_map(params![subject], |row| row.get(0))?;
                let partners = rows.collect::<Result<Vec<_>, _>>()?;
                partners
            };

            let mut summaries = Vec::with_capacity(partners.len());
            for partner in partners {
                let Some(edge) = load_edge(conn, subject, &partner)? else {
                    continue;
                };
                let dominant_topic = edge.dominant_topic().map(str::to_string);
                let description = match &dominant_topic {
                    Some(topic) => format!(
                        "Often talks with {} about {} ({} interactions)",
                        partner, topic, edge.interaction_count
                    ),
                    None => format!(
                        "Has talked with {} ({} interactions)",
                        partner, edge.interaction_count
                    ),
                };
                summaries.push(RelationshipSummary {
                    partner_id: partner,
                    dominant_topic,
                    interaction_count: edge.interaction_count,
                    description,
                });
            }
            Ok(summaries)
        })
    }
}

fn normalize_topic(topic: &str) -> String {
    topic.trim().to_lowercase()
}

fn bump_edge(conn: &Connection, a: &str, b: &str, topic: &str) -> Result<(), MemoryError> {
    conn.execute(
        "INSERT INTO relationships (subject_a, subject_b, interaction_count)
         VALUES (?1, ?2, 1)
         ON CONFLICT(subject_a, subject_b)
         DO UPDATE SET interaction_count = interaction_count + 1",
        params![a, b],
    )?;
    conn.execute(
        "INSERT INTO relationship_topics (subject_a, subject_b, topic, count)
         VALUES (?1, ?2, ?3, 1)
         ON CONFLICT(subject_a, subject_b, topic)
         DO UPDATE SET count = count + 1",
        params![a, b, topic],
    )?;
    Ok(())
}

fn load_edge(conn: &Connection, a: &str, b: &str) -> Result<Option<RelationshipEdge>, MemoryError> {
    let interaction_count: Option<i64> = conn
        .query_row(
            "SELECT interaction_count FROM relationships WHERE subject_a = ?1 AND subject_b = ?2",
            params![a, b],
            |row| row.get(0),
        )
        .optional()?;
    let Some(interaction_count) = interaction_count else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT topic, count FROM relationship_topics
         WHERE subject_a = ?1 AND subject_b = ?2
         ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![a, b], |row| {
        let count: i64 = row.get(1)?;
        Ok(TopicCount {
            topic: row.get(0)?,
            count: count as u64,
        })
    })?;
    let topic_counts = rows.collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RelationshipEdge {
        subject_a: a.to_string(),
        subject_b: b.to_string(),
        topic_counts,
        interaction_count: interaction_count as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> SocialGraph {
        SocialGraph::new(Db::open_in_memory().unwrap())
    }

    fn people(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_repeated_topic_counts() {
        let graph = graph();
        let pair = people(&["A", "B"]);
        graph.record_interaction(&pair, Some("games")).unwrap();
        graph.record_interaction(&pair, Some("games")).unwrap();

        let edge = graph.edge("A", "B").unwrap().unwrap();
        assert_eq!(edge.topic_count("games"), 2);
        assert_eq!(edge.interaction_count, 2);

        // Mirror edge carries the same counts.
        let mirror = graph.edge("B", "A").unwrap().unwrap();
        assert_eq!(mirror.topic_count("games"), 2);
        assert_eq!(mirror.interaction_count, 2);
    }

    #[test]
    fn test_every_ordered_pair_updated() {
        let graph = graph();
        let touched = graph
            .record_interaction(&people(&["A", "B", "C"]), Some("anime"))
            .unwrap();
        assert_eq!(touched, 6);
        for (a, b) in [("A", "B"), ("A", "C"), ("B", "A"), ("B", "C"), ("C", "A"), ("C", "B")] {
            let edge = graph.edge(a, b).unwrap().unwrap();
            assert_eq!(edge.topic_count("anime"), 1, "{} -> {}", a, b);
        }
        assert!(graph.edge("A", "A").unwrap().is_none());
    }

    #[test]
    fn test_blank_topic_and_single_participant_are_noops() {
        let graph = graph();
        assert_eq!(graph.record_interaction(&people(&["A", "B"]), None).unwrap(), 0);
        assert_eq!(graph.record_interaction(&people(&["A", "B"]), Some("  ")).unwrap(), 0);
        assert_eq!(graph.record_interaction(&people(&["A", "A"]), Some("x")).unwrap(), 0);
        assert!(graph.edge("A", "B").unwrap().is_none());
    }

    #[test]
    fn test_dominant_topic_tie_goes_to_first_seen() {
        let graph = graph();
        let pair = people(&["A", "B"]);
        graph.record_interaction(&pair, Some("music")).unwrap();
        graph.record_interaction(&pair, Some("games")).unwrap();

        let edge = graph.edge("A", "B").unwrap().unwrap();
        assert_eq!(edge.dominant_topic(), Some("music"));

        graph.record_interaction(&pair, Some("Games")).unwrap();
        let edge = graph.edge("A", "B").unwrap().unwrap();
        assert_eq!(edge.dominant_topic(), Some("games"));
        assert_eq!(edge.interaction_count, 3);
    }

    #[test]
    fn test_summarize_orders_partners() {
        let graph = graph();
        graph.record_interaction(&people(&["A", "B"]), Some("tea")).unwrap();
        graph.record_interaction(&people(&["A", "C"]), Some("games")).unwrap();
        graph.record_interaction(&people(&["A", "C"]), Some("games")).unwrap();

        let summaries = graph.summarize("A").unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].partner_id, "C");
        assert_eq!(summaries[0].dominant_topic.as_deref(), Some("games"));
        assert_eq!(
            summaries[0].description,
            "Often talks with C about games (2 interactions)"
        );
        assert_eq!(summaries[1].partner_id, "B");

        assert!(graph.summarize("nobody").unwrap().is_empty());
    }
}
