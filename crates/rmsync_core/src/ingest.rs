//! Refresh orchestration: walk upstream location pages in order and reconcile
//! each one, with at most one refresh in flight per [`Ingestor`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{ClientConfig, LocationApi, RickAndMortyClient};
use crate::config::SyncConfig;
use crate::reconcile::{PageReport, persist_page};
use crate::runtime::ResolvedPaths;
use crate::store::{CharacterRow, open_store, upsert_character};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub pages: usize,
    #[serde(flatten)]
    pub totals: PageReport,
    pub request_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another refresh held the guard; nothing was done.
    AlreadyRunning,
}

pub struct Ingestor<A> {
    db_path: PathBuf,
    batch_size: usize,
    api: Mutex<A>,
}

impl Ingestor<RickAndMortyClient> {
    /// Ingestor over the live upstream API, configured from `config` and the environment.
    pub fn from_config(paths: &ResolvedPaths, config: &SyncConfig) -> Result<Self> {
        let client = RickAndMortyClient::new(ClientConfig::from_config(config))?;
        Ok(Self::new(client, &paths.db_path, config.batch_size()))
    }
}

impl<A: LocationApi> Ingestor<A> {
    pub fn new(api: A, db_path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            db_path: db_path.into(),
            batch_size,
            api: Mutex::new(api),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run one full synchronization pass.
    ///
    /// Returns [`RefreshOutcome::AlreadyRunning`] without waiting when another
    /// refresh is in progress. The guard is released on every exit path,
    /// including panics; a guard left poisoned by a panicked refresh is
    /// recovered here.
    pub fn refresh(&self) -> Result<RefreshOutcome> {
        let mut api = match self.api.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                info!("refresh already in progress; skipping");
                return Ok(RefreshOutcome::AlreadyRunning);
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("previous refresh panicked; recovering refresh guard");
                self.api.clear_poison();
                poisoned.into_inner()
            }
        };

        let started = Instant::now();
        info!(db = %self.db_path.display(), "refresh started");
        match run_refresh(&self.db_path, &mut *api, self.batch_size) {
            Ok(mut report) => {
                report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                info!(
                    pages = report.pages,
                    locations = report.totals.locations_upserted,
                    characters = report.totals.characters_upserted,
                    residents = report.totals.residents_linked,
                    requests = report.request_count,
                    elapsed_ms = report.elapsed_ms,
                    "refresh completed"
                );
                Ok(RefreshOutcome::Completed(report))
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "refresh aborted");
                Err(err)
            }
        }
    }

    /// Fetch a single character upstream and store it. Shares the refresh guard,
    /// so it waits for a running refresh instead of interleaving with it.
    pub fn fetch_character(&self, id: i64) -> Result<CharacterRow> {
        let mut api = self
            .api
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let raw = api
            .fetch_one(id)
            .with_context(|| format!("failed to fetch character {id}"))?;
        let row = raw
            .to_row()
            .with_context(|| format!("character {id} came back without an id"))?;
        let connection = open_store(&self.db_path)?;
        upsert_character(&connection, &row)?;
        Ok(row)
    }

    pub fn into_api(self) -> A {
        self.api
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_refresh<A>(db_path: &Path, api: &mut A, batch_size: usize) -> Result<RefreshReport>
where
    A: LocationApi + ?Sized,
{
    let connection = open_store(db_path)?;
    let requests_before = api.request_count();
    let mut report = RefreshReport::default();
    let mut page_number: u32 = 1;

    loop {
        let page = api
            .fetch_page(page_number)
            .with_context(|| format!("failed to fetch location page {page_number}"))?;
        let page_report = persist_page(&connection, api, &page, batch_size)
            .with_context(|| format!("failed to reconcile location page {page_number}"))?;
        report.pages += 1;
        report.totals.absorb(&page_report);
        debug!(
            page = page_number,
            locations = page.locations.len(),
            batches = page_report.batches_fetched,
            "page reconciled"
        );

        if !page.has_more() {
            break;
        }
        page_number = page_number
            .checked_add(1)
            .context("location page counter overflowed")?;
    }

    report.request_count = api.request_count().saturating_sub(requests_before);
    Ok(report)
}
