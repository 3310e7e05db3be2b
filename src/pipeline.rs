use std::fmt;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::{RunConfig, SiteProfile};
use crate::entity::Entity;
use crate::error::{ConfigError, ExtractError, NavigationError, RunError};
use crate::extract::{DetailExtractor, ListingExtractor, PageExtractor};
use crate::navigator::{Navigator, Readiness};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Authenticating,
    Searching,
    CollectingList,
    ExtractingDetail(usize),
    Completed,
    Failed(String),
    Cancelled,
}

impl RunState {
    fn stage(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Authenticating => "authenticating",
            RunState::Searching => "searching",
            RunState::CollectingList => "collecting_list",
            RunState::ExtractingDetail(_) => "extracting_detail",
            RunState::Completed => "completed",
            RunState::Failed(_) => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// A candidate that was attempted but not stored.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub identifier: String,
    pub step: &'static str,
    pub reason: String,
}

impl ItemFailure {
    fn new(identifier: &str, step: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            identifier: identifier.to_string(),
            step,
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunResult {
    /// Stored entities in listing order.
    pub succeeded: Vec<Entity>,
    pub failed_count: usize,
    pub failures: Vec<ItemFailure>,
    /// Set only when a required stage could not proceed.
    pub terminal_error: Option<RunError>,
    pub cancelled: bool,
    pub state: RunState,
    pub elapsed: Duration,
}

impl RunResult {
    /// A run stopped before it reached the pipeline.
    pub fn rejected(error: RunError) -> Self {
        Self {
            succeeded: Vec::new(),
            failed_count: 0,
            failures: Vec::new(),
            state: RunState::Failed(error.to_string()),
            terminal_error: Some(error),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.terminal_error.is_none() && !self.cancelled
    }
}

/// Tracks state transitions and accumulates results for a single run.
struct RunTracker {
    state: RunState,
    started: Instant,
    succeeded: Vec<Entity>,
    failures: Vec<ItemFailure>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            started: Instant::now(),
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state transition");
        self.state = next;
    }

    fn finish(mut self, state: RunState, terminal_error: Option<RunError>) -> RunResult {
        self.enter(state);
        RunResult {
            failed_count: self.failures.len(),
            succeeded: self.succeeded,
            failures: self.failures,
            terminal_error,
            cancelled: self.state == RunState::Cancelled,
            state: self.state,
            elapsed: self.started.elapsed(),
        }
    }

    fn fail(self, error: RunError) -> RunResult {
        error!(stage = self.state.stage(), error = %error, "run aborted");
        self.finish(RunState::Failed(error.to_string()), Some(error))
    }

    fn cancel(self) -> RunResult {
        warn!(
            stage = self.state.stage(),
            stored = self.succeeded.len(),
            "run cancelled, returning partial result"
        );
        self.finish(RunState::Cancelled, None)
    }
}

/// The stage sequence: authenticate, open the listing, collect candidates,
/// then extract and store each candidate in listing order.
pub struct Pipeline<L = ListingExtractor, D = DetailExtractor> {
    authenticator: Authenticator,
    listing: L,
    detail: D,
    listing_ready: Readiness,
    detail_ready: Readiness,
}

impl Pipeline {
    pub fn from_profile(profile: &SiteProfile) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Authenticator::from_profile(profile)?,
            ListingExtractor::from_profile(profile)?,
            DetailExtractor::from_profile(profile)?,
            Readiness::from_selector(
                "listing_ready_selector",
                profile.listing_ready_selector.as_deref(),
            )?,
            Readiness::from_selector(
                "detail_ready_selector",
                profile.detail_ready_selector.as_deref(),
            )?,
        ))
    }
}

impl<L, D> Pipeline<L, D>
where
    L: PageExtractor<Output = Vec<String>> + Sync,
    D: PageExtractor<Output = Entity> + Sync,
{
    pub fn new(
        authenticator: Authenticator,
        listing: L,
        detail: D,
        listing_ready: Readiness,
        detail_ready: Readiness,
    ) -> Self {
        Self {
            authenticator,
            listing,
            detail,
            listing_ready,
            detail_ready,
        }
    }

    pub async fn run<N: Navigator + ?Sized>(
        &self,
        navigator: &mut N,
        store: &Store,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut run = RunTracker::new();

        run.enter(RunState::Authenticating);
        if let Err(e) = self
            .authenticator
            .login(navigator, &config.credentials)
            .await
        {
            return run.fail(RunError::Authentication(e));
        }
        if cancel.is_cancelled() {
            return run.cancel();
        }

        run.enter(RunState::Searching);
        info!(stage = "searching", query = %config.listing_query, "opening listing");
        if let Err(e) = navigator
            .goto(&config.listing_query, &self.listing_ready)
            .await
        {
            return run.fail(RunError::Listing(e));
        }
        if cancel.is_cancelled() {
            return run.cancel();
        }

        run.enter(RunState::CollectingList);
        let collected = navigator
            .page()
            .ok_or(ExtractError::NoPage)
            .and_then(|page| self.listing.extract(page));
        let candidates = match collected {
            Ok(candidates) => candidates,
            Err(ExtractError::NoCandidates { location }) => {
                return run.fail(RunError::NoCandidates { location })
            }
            Err(e) => return run.fail(RunError::Collection(e)),
        };
        info!(stage = "collecting_list", count = candidates.len(), "collected candidates");

        let pb = progress_bar(candidates.len());
        for (i, identifier) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                pb.finish_and_clear();
                return run.cancel();
            }
            run.enter(RunState::ExtractingDetail(i));

            match self.extract_one(navigator, store, identifier).await {
                Ok(entity) => {
                    info!(stage = "extracting_detail", %identifier, "entity stored");
                    run.succeeded.push(entity);
                }
                Err(failure) => {
                    warn!(
                        stage = "extracting_detail",
                        identifier = %failure.identifier,
                        step = failure.step,
                        reason = %failure.reason,
                        "entity skipped"
                    );
                    run.failures.push(failure);
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            stored = run.succeeded.len(),
            failed = run.failures.len(),
            "run completed"
        );
        run.finish(RunState::Completed, None)
    }

    async fn extract_one<N: Navigator + ?Sized>(
        &self,
        navigator: &mut N,
        store: &Store,
        identifier: &str,
    ) -> Result<Entity, ItemFailure> {
        navigator
            .goto(identifier, &self.detail_ready)
            .await
            .map_err(|e| ItemFailure::new(identifier, "navigate", e))?;

        let page = navigator
            .page()
            .ok_or_else(|| ItemFailure::new(identifier, "navigate", NavigationError::NoPage))?;
        let entity = self
            .detail
            .extract(page)
            .map_err(|e| ItemFailure::new(identifier, "extract", e))?;

        store
            .upsert(entity)
            .map_err(|e| ItemFailure::new(identifier, "persist", e))
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}
