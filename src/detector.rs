//! PII detector interface
//!
//! The real classifier is an external collaborator. Two implementations
//! ship with the crate: [`PatternDetector`], a regex-based detector for
//! well-formed identifiers, and [`StaticDetector`], which replays a fixed
//! candidate list for tests and demos.

use crate::content::{FileContent, Table};
use crate::error::{AnonymizeError, Result};
use crate::types::{EntityCandidate, EntityCategory, FileType};
use async_trait::async_trait;
use regex::Regex;

/// External PII detector
///
/// Latency is unbounded; the pipeline awaits it (optionally under a
/// timeout). Failures are reported as `DetectionUnavailable`.
#[async_trait]
pub trait PiiDetector: Send + Sync {
    /// Detect candidates of the enabled categories in a file
    async fn detect(
        &self,
        content: &FileContent,
        file_type: FileType,
        enabled: &[EntityCategory],
    ) -> Result<Vec<EntityCandidate>>;

    /// Detector name (e.g., "pattern", "presidio")
    fn name(&self) -> &str;
}

struct PatternRule {
    entity: EntityCategory,
    regex: Regex,
    confidence: f64,
}

/// Regex-based detector for structured identifiers
///
/// Text matches become span candidates. A tabular column becomes a column
/// candidate when at least half of its non-empty cells match a rule; its
/// average confidence scales with the match ratio.
pub struct PatternDetector {
    rules: Vec<PatternRule>,
}

impl PatternDetector {
    /// Detector with the built-in rules (EMAIL, IC_NUMBER, CREDIT_CARD, PHONE_NUMBER)
    pub fn new() -> Result<Self> {
        let mut detector = Self { rules: Vec::new() };
        detector.add_rule(
            EntityCategory::Email,
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            95.0,
        )?;
        detector.add_rule(EntityCategory::IcNumber, r"\b\d{6}-\d{2}-\d{4}\b", 90.0)?;
        detector.add_rule(
            EntityCategory::CreditCard,
            r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{1,4}\b",
            80.0,
        )?;
        detector.add_rule(EntityCategory::PhoneNumber, r"\+?\b\d{1,4}-\d{6,8}\b", 85.0)?;
        Ok(detector)
    }

    /// Add a rule; earlier rules win when matches overlap
    pub fn add_rule(&mut self, entity: EntityCategory, pattern: &str, confidence: f64) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| {
            AnonymizeError::Config(format!("Invalid pattern for {}: {}", entity, e))
        })?;
        self.rules.push(PatternRule {
            entity,
            regex,
            confidence,
        });
        Ok(())
    }

    fn detect_text(&self, text: &str, enabled: &[EntityCategory]) -> Vec<EntityCandidate> {
        let mut found: Vec<(usize, usize, usize)> = Vec::new();
        for (rule_idx, rule) in self.rules.iter().enumerate() {
            if !enabled.contains(&rule.entity) {
                continue;
            }
            for m in rule.regex.find_iter(text) {
                let overlaps = found
                    .iter()
                    .any(|(start, end, _)| m.start() < *end && *start < m.end());
                if !overlaps {
                    found.push((m.start(), m.end(), rule_idx));
                }
            }
        }
        found.sort_by_key(|(start, _, _)| *start);

        found
            .into_iter()
            .map(|(start, end, rule_idx)| {
                let rule = &self.rules[rule_idx];
                EntityCandidate::text(rule.entity, &text[start..end], start, end, rule.confidence)
            })
            .collect()
    }

    fn detect_table(&self, table: &Table, enabled: &[EntityCategory]) -> Vec<EntityCandidate> {
        let mut candidates = Vec::new();
        for (col, header) in table.headers.iter().enumerate() {
            let cells: Vec<&str> = table
                .rows
                .iter()
                .filter_map(|row| row.get(col))
                .map(|cell| cell.trim())
                .filter(|cell| !cell.is_empty())
                .collect();
            if cells.is_empty() {
                continue;
            }

            let best = self
                .rules
                .iter()
                .filter(|rule| enabled.contains(&rule.entity))
                .map(|rule| {
                    let matching: Vec<&str> = cells
                        .iter()
                        .copied()
                        .filter(|cell| rule.regex.is_match(cell))
                        .collect();
                    (rule, matching)
                })
                .max_by_key(|(_, matching)| matching.len());

            if let Some((rule, matching)) = best {
                let ratio = matching.len() as f64 / cells.len() as f64;
                if ratio >= 0.5 {
                    let top_data = matching.iter().take(2).map(|s| s.to_string()).collect();
                    candidates.push(EntityCandidate::column(
                        rule.entity,
                        header.clone(),
                        top_data,
                        rule.confidence * ratio,
                    ));
                }
            }
        }
        candidates
    }
}

#[async_trait]
impl PiiDetector for PatternDetector {
    async fn detect(
        &self,
        content: &FileContent,
        _file_type: FileType,
        enabled: &[EntityCategory],
    ) -> Result<Vec<EntityCandidate>> {
        Ok(match content {
            FileContent::Text { text } => self.detect_text(text, enabled),
            FileContent::Tabular { table } => self.detect_table(table, enabled),
            FileContent::Binary { .. } => Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

/// Detector that always returns the same candidates
///
/// Categories the caller did not enable are still returned; filtering them
/// is the triage engine's job.
pub struct StaticDetector {
    candidates: Vec<EntityCandidate>,
}

impl StaticDetector {
    pub fn new(candidates: Vec<EntityCandidate>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl PiiDetector for StaticDetector {
    async fn detect(
        &self,
        _content: &FileContent,
        _file_type: FileType,
        _enabled: &[EntityCategory],
    ) -> Result<Vec<EntityCandidate>> {
        Ok(self.candidates.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
