//! Anonymization executor
//!
//! Seals every non-ignored span or column with a fresh per-file data key
//! and reconstitutes the original on de-anonymization. The data key travels
//! inside the artifact, wrapped under the partner key, so opening a file
//! needs only the partner record and the file record.
//!
//! Cryptographic work runs on the blocking pool. Once started it runs to
//! completion; there is no cancellation.

use crate::content::{FileContent, Table};
use crate::crypto::{generate_data_key, SealingKey, WrappedKey};
use crate::error::{AnonymizeError, Result};
use crate::types::{CandidateTarget, EntityCandidate, EntityCategory, PartnerSecrets};
use serde::{Deserialize, Serialize};

/// A sealed span inside an anonymized text artifact (byte offsets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedSpan {
    pub start: usize,
    pub end: usize,
    pub entity: EntityCategory,
}

/// Where the sealed tokens sit inside an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Redactions {
    /// Nothing was sealed
    None,
    Spans { spans: Vec<SealedSpan> },
    /// Every cell of these column indices is a sealed token
    Columns { columns: Vec<usize> },
}

/// Output of one anonymization run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnonymizedArtifact {
    /// The file's data key, wrapped under the partner key
    pub data_key: WrappedKey,
    pub content: FileContent,
    pub redactions: Redactions,
    /// Unix milliseconds
    pub sealed_at: i64,
}

impl AnonymizedArtifact {
    #[cfg(test)]
    pub(crate) fn for_tests(content: FileContent) -> Self {
        Self {
            data_key: WrappedKey {
                partner_key_id: "key-test".to_string(),
                wrapped: String::new(),
            },
            content,
            redactions: Redactions::None,
            sealed_at: 0,
        }
    }
}

/// Performs the reversible redaction and its inverse
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymizationExecutor;

impl AnonymizationExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Seal every non-ignored candidate of the finalized set under a new
    /// data key wrapped for the partner
    pub async fn anonymize(
        &self,
        secrets: &PartnerSecrets,
        content: FileContent,
        candidates: &[EntityCandidate],
    ) -> Result<AnonymizedArtifact> {
        let partner_key = SealingKey::for_partner(secrets)?;
        let raw_key = generate_data_key();
        let data_key = SealingKey::from_bytes(&raw_key)?;
        let wrapped = partner_key.wrap(&raw_key)?;

        let targets: Vec<(EntityCategory, CandidateTarget)> = candidates
            .iter()
            .filter(|c| !c.ignore)
            .map(|c| (c.entity, c.target.clone()))
            .collect();
        let sealed = targets.len();

        let artifact = tokio::task::spawn_blocking(move || {
            seal_content(&data_key, wrapped, content, &targets)
        })
        .await
        .map_err(|e| AnonymizeError::Internal(format!("Anonymization task failed: {}", e)))??;

        tracing::debug!(
            partner_key_id = %artifact.data_key.partner_key_id,
            sealed,
            "Content sealed"
        );
        Ok(artifact)
    }

    /// Reconstitute the original content of an artifact with the partner's
    /// current secrets
    pub async fn deanonymize(
        &self,
        secrets: &PartnerSecrets,
        artifact: &AnonymizedArtifact,
    ) -> Result<FileContent> {
        let data_key = SealingKey::for_partner(secrets)?.unwrap_key(&artifact.data_key)?;
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || open_content(&data_key, &artifact))
            .await
            .map_err(|e| {
                AnonymizeError::Internal(format!("De-anonymization task failed: {}", e))
            })?
    }

    /// Move an artifact's data key from the old partner secrets to the new
    /// ones. The sealed content does not change.
    pub fn rewrap(
        &self,
        old: &PartnerSecrets,
        new: &PartnerSecrets,
        artifact: &AnonymizedArtifact,
    ) -> Result<WrappedKey> {
        let raw_key = SealingKey::for_partner(old)?.unwrap_bytes(&artifact.data_key)?;
        SealingKey::for_partner(new)?.wrap(&raw_key)
    }
}

fn seal_content(
    key: &SealingKey,
    data_key: WrappedKey,
    content: FileContent,
    targets: &[(EntityCategory, CandidateTarget)],
) -> Result<AnonymizedArtifact> {
    let (content, redactions) = match content {
        FileContent::Text { text } => {
            let (text, spans) = seal_text(key, &text, targets)?;
            (FileContent::Text { text }, spans)
        }
        FileContent::Tabular { table } => {
            let (table, columns) = seal_table(key, table, targets)?;
            (FileContent::Tabular { table }, columns)
        }
        FileContent::Binary { data } => {
            if !targets.is_empty() {
                return Err(AnonymizeError::MalformedInput(format!(
                    "Cannot redact {} candidate(s) in binary content",
                    targets.len()
                )));
            }
            (FileContent::Binary { data }, Redactions::None)
        }
    };

    Ok(AnonymizedArtifact {
        data_key,
        content,
        redactions,
        sealed_at: chrono::Utc::now().timestamp_millis(),
    })
}

fn seal_text(
    key: &SealingKey,
    text: &str,
    targets: &[(EntityCategory, CandidateTarget)],
) -> Result<(String, Redactions)> {
    let mut spans: Vec<(usize, usize, EntityCategory)> = Vec::with_capacity(targets.len());
    for (entity, target) in targets {
        let CandidateTarget::Text {
            word, start, end, ..
        } = target
        else {
            return Err(AnonymizeError::MalformedInput(
                "Column candidate supplied for text content".to_string(),
            ));
        };
        let (start, end) = (*start, *end);
        if start >= end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            return Err(AnonymizeError::MalformedInput(format!(
                "Span {}..{} is outside the text",
                start, end
            )));
        }
        if &text[start..end] != word.as_str() {
            return Err(AnonymizeError::MalformedInput(format!(
                "Span {}..{} does not match the detected word",
                start, end
            )));
        }
        spans.push((start, end, *entity));
    }

    spans.sort_by_key(|(start, _, _)| *start);
    if spans.windows(2).any(|w| w[1].0 < w[0].1) {
        return Err(AnonymizeError::MalformedInput(
            "Detected spans overlap".to_string(),
        ));
    }

    let mut out = String::with_capacity(text.len());
    let mut sealed = Vec::with_capacity(spans.len());
    let mut cursor = 0;
    for (start, end, entity) in spans {
        out.push_str(&text[cursor..start]);
        let token = key.seal(&text[start..end])?;
        sealed.push(SealedSpan {
            start: out.len(),
            end: out.len() + token.len(),
            entity,
        });
        out.push_str(&token);
        cursor = end;
    }
    out.push_str(&text[cursor..]);

    let redactions = if sealed.is_empty() {
        Redactions::None
    } else {
        Redactions::Spans { spans: sealed }
    };
    Ok((out, redactions))
}

fn seal_table(
    key: &SealingKey,
    mut table: Table,
    targets: &[(EntityCategory, CandidateTarget)],
) -> Result<(Table, Redactions)> {
    let mut columns = Vec::with_capacity(targets.len());
    for (_, target) in targets {
        let CandidateTarget::Column { column, .. } = target else {
            return Err(AnonymizeError::MalformedInput(
                "Text candidate supplied for tabular content".to_string(),
            ));
        };
        let idx = table.column_index(column).ok_or_else(|| {
            AnonymizeError::MalformedInput(format!("Column '{}' not found", column))
        })?;
        columns.push(idx);
    }
    columns.sort_unstable();
    columns.dedup();

    for row in table.rows.iter_mut() {
        for &idx in &columns {
            let cell = row.get_mut(idx).ok_or_else(|| {
                AnonymizeError::MalformedInput(format!("Row is missing column {}", idx))
            })?;
            *cell = key.seal(cell)?;
        }
    }

    let redactions = if columns.is_empty() {
        Redactions::None
    } else {
        Redactions::Columns { columns }
    };
    Ok((table, redactions))
}

fn open_content(key: &SealingKey, artifact: &AnonymizedArtifact) -> Result<FileContent> {
    match (&artifact.content, &artifact.redactions) {
        (content, Redactions::None) => Ok(content.clone()),
        (FileContent::Text { text }, Redactions::Spans { spans }) => {
            let mut out = text.clone();
            for span in spans.iter().rev() {
                let token = text.get(span.start..span.end).ok_or_else(|| {
                    AnonymizeError::MalformedInput(format!(
                        "Sealed span {}..{} is outside the artifact",
                        span.start, span.end
                    ))
                })?;
                let original = key.open(token)?;
                out.replace_range(span.start..span.end, &original);
            }
            Ok(FileContent::Text { text: out })
        }
        (FileContent::Tabular { table }, Redactions::Columns { columns }) => {
            let mut table = table.clone();
            for row in table.rows.iter_mut() {
                for &idx in columns {
                    let cell = row.get_mut(idx).ok_or_else(|| {
                        AnonymizeError::MalformedInput(format!("Row is missing column {}", idx))
                    })?;
                    *cell = key.open(cell)?;
                }
            }
            Ok(FileContent::Tabular { table })
        }
        _ => Err(AnonymizeError::MalformedInput(
            "Artifact redactions do not match its content".to_string(),
        )),
    }
}
