use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::{LocationApi, LocationPage, RawLocation};
use crate::config::BATCH_FETCH_LIMIT;
use crate::store::{
    LocationRow, clear_location_residents, link_resident, upsert_character, upsert_location,
};

/// Counters for the work done while reconciling one or more location pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub locations_upserted: usize,
    pub locations_skipped: usize,
    pub malformed_records: usize,
    pub malformed_references: usize,
    pub batches_fetched: usize,
    pub characters_upserted: usize,
    pub residents_cleared: usize,
    pub residents_linked: usize,
}

impl PageReport {
    pub fn absorb(&mut self, other: &PageReport) {
        self.locations_upserted += other.locations_upserted;
        self.locations_skipped += other.locations_skipped;
        self.malformed_records += other.malformed_records;
        self.malformed_references += other.malformed_references;
        self.batches_fetched += other.batches_fetched;
        self.characters_upserted += other.characters_upserted;
        self.residents_cleared += other.residents_cleared;
        self.residents_linked += other.residents_linked;
    }
}

/// Reconcile every location of one upstream page, in page order.
///
/// A failure stops at the location being processed; everything already
/// written stays written.
pub fn persist_page<A>(
    connection: &Connection,
    api: &mut A,
    page: &LocationPage,
    batch_size: usize,
) -> Result<PageReport>
where
    A: LocationApi + ?Sized,
{
    let mut report = PageReport {
        malformed_records: page.malformed,
        ..PageReport::default()
    };
    for location in &page.locations {
        persist_location(connection, api, location, batch_size, &mut report)?;
    }
    Ok(report)
}

/// Upsert one location, then rebuild its residency from the references it
/// carries: clear existing pairs, fetch residents in chunks, upsert them and
/// link every referenced id.
pub fn persist_location<A>(
    connection: &Connection,
    api: &mut A,
    location: &RawLocation,
    batch_size: usize,
    report: &mut PageReport,
) -> Result<()>
where
    A: LocationApi + ?Sized,
{
    let Some(location_id) = location.id else {
        warn!(name = ?location.name, "skipping location without id");
        report.locations_skipped += 1;
        return Ok(());
    };

    upsert_location(
        connection,
        &LocationRow {
            id: location_id,
            name: location.name.clone(),
            location_type: location.location_type.clone(),
            dimension: location.dimension.clone(),
        },
    )?;
    report.locations_upserted += 1;
    report.residents_cleared += clear_location_residents(connection, location_id)?;

    let (character_ids, malformed) = collect_resident_ids(location_id, &location.residents);
    report.malformed_references += malformed;

    for chunk in character_ids.chunks(effective_batch_size(batch_size)) {
        let characters = api
            .fetch_batch(chunk)
            .with_context(|| format!("failed to fetch residents of location {location_id}"))?;
        report.batches_fetched += 1;

        for character in &characters {
            if let Some(row) = character.to_row() {
                upsert_character(connection, &row)?;
                report.characters_upserted += 1;
            }
        }
        // Every referenced id is linked, including ids upstream did not return.
        for &character_id in chunk {
            if link_resident(connection, location_id, character_id)? {
                report.residents_linked += 1;
            }
        }
    }

    debug!(
        location_id,
        residents = character_ids.len(),
        malformed_references = malformed,
        "reconciled location"
    );
    Ok(())
}

/// Trailing path segment of a resident reference, when it is a plain integer.
///
/// `https://rickandmortyapi.com/api/character/38` yields 38. Blank input, a
/// trailing slash and non-numeric tails yield `None`.
pub fn parse_resident_id(reference: &str) -> Option<i64> {
    let trimmed = reference.trim();
    if trimmed.is_empty() || trimmed.ends_with('/') {
        return None;
    }
    let tail = trimmed.rsplit('/').next()?;
    if tail.is_empty() || !tail.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    tail.parse::<i64>().ok()
}

fn collect_resident_ids(location_id: i64, references: &[String]) -> (Vec<i64>, usize) {
    let mut ids = Vec::with_capacity(references.len());
    let mut malformed = 0usize;
    for reference in references {
        match parse_resident_id(reference) {
            Some(id) => ids.push(id),
            None => {
                warn!(location_id, reference = %reference, "skipping malformed resident reference");
                malformed += 1;
            }
        }
    }
    (ids, malformed)
}

fn effective_batch_size(batch_size: usize) -> usize {
    batch_size.clamp(1, BATCH_FETCH_LIMIT)
}
