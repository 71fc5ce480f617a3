//! Cross-source deduplication with priority-based conflict resolution.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::ProcurementRecord;

/// Identity of a procurement across sources.
///
/// `tax_id:edital:year` when both edital number and year are known, otherwise
/// `tax_id:sha256(description):value`. Descriptions are compared after case
/// folding and whitespace collapsing.
pub fn dedup_key(record: &ProcurementRecord) -> String {
    let tax_id = record.issuing_agency.normalized_tax_id();
    let edital = record
        .edital_number
        .as_deref()
        .map(str::trim)
        .filter(|edital| !edital.is_empty());

    match (edital, record.year) {
        (Some(edital), Some(year)) => {
            format!("{tax_id}:{}:{year}", edital.to_lowercase())
        }
        _ => {
            let value = record
                .estimated_value
                .map(|value| value.normalize().to_string())
                .unwrap_or_default();
            format!(
                "{tax_id}:{}:{value}",
                description_digest(&record.object_description)
            )
        }
    }
}

fn description_digest(description: &str) -> String {
    let normalized = description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Keeps one record per dedup key.
///
/// `records` must be in declared source order. Within a group the record whose
/// source has the lowest priority wins; on equal priority the first one seen
/// stays. Survivors keep the position of the first record of their group.
pub fn deduplicate<F>(records: Vec<ProcurementRecord>, priority_of: F) -> Vec<ProcurementRecord>
where
    F: Fn(&ProcurementRecord) -> u32,
{
    let mut winners: Vec<(u32, ProcurementRecord)> = Vec::with_capacity(records.len());
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(records.len());

    for record in records {
        let priority = priority_of(&record);
        match slots.entry(dedup_key(&record)) {
            Entry::Vacant(vacant) => {
                vacant.insert(winners.len());
                winners.push((priority, record));
            }
            Entry::Occupied(occupied) => {
                let slot = &mut winners[*occupied.get()];
                if priority < slot.0 {
                    tracing::trace!(
                        key = occupied.key().as_str(),
                        winner = %record.source_code,
                        loser = %slot.1.source_code,
                        "duplicate replaced by higher-precedence source"
                    );
                    *slot = (priority, record);
                }
            }
        }
    }

    winners.into_iter().map(|(_, record)| record).collect()
}
