use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{RunConfig, SiteProfile};
use crate::entity::Entity;
use crate::error::{ConfigError, NavigationError, RunError, StoreError};
use crate::navigator::Navigator;
use crate::pipeline::{Pipeline, RunResult};
use crate::store::Store;

const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    StartRun { config: RunConfig },
    GetStoredEntities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    RunSummary(RunResultSummary),
    Entities { entities: Vec<Entity> },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResultSummary {
    pub success: bool,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub message: String,
}

impl From<&RunResult> for RunResultSummary {
    fn from(result: &RunResult) -> Self {
        let succeeded_count = result.succeeded.len();
        let message = match (&result.terminal_error, result.cancelled) {
            (Some(e), _) => format!("Run failed: {}", e),
            (None, true) => format!(
                "Run cancelled after {} entities ({} failed)",
                succeeded_count, result.failed_count
            ),
            (None, false) => format!(
                "Extracted {} entities ({} failed)",
                succeeded_count, result.failed_count
            ),
        };
        Self {
            success: result.is_success(),
            succeeded_count,
            failed_count: result.failed_count,
            message,
        }
    }
}

/// Builds a fresh browsing session for each run.
pub type NavigatorFactory<N> =
    Box<dyn Fn(&SiteProfile) -> Result<N, NavigationError> + Send + Sync>;

/// The boundary: owns the store and answers `StartRun` / `GetStoredEntities`.
pub struct Service<N> {
    store: Store,
    profile: SiteProfile,
    pipeline: Pipeline,
    make_navigator: NavigatorFactory<N>,
    run_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<CancellationToken>>,
}

impl<N: Navigator> Service<N> {
    pub fn new(
        store: Store,
        profile: SiteProfile,
        make_navigator: NavigatorFactory<N>,
    ) -> Result<Self, ConfigError> {
        let pipeline = Pipeline::from_profile(&profile)?;
        Ok(Self {
            store,
            profile,
            pipeline,
            make_navigator,
            run_lock: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
        })
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::StartRun { config } => {
                let result = self.start_run(config).await;
                Response::RunSummary(RunResultSummary::from(&result))
            }
            Request::GetStoredEntities => match self.stored_entities() {
                Ok(entities) => Response::Entities { entities },
                Err(e) => {
                    warn!(error = %e, "stored entities unavailable");
                    Response::Error {
                        message: e.to_string(),
                    }
                }
            },
        }
    }

    /// Run the pipeline once. A second call while a run is in flight is
    /// rejected, not queued.
    pub async fn start_run(&self, config: RunConfig) -> RunResult {
        self.start_run_with(config, CancellationToken::new()).await
    }

    /// Like `start_run`, but stops when `cancel` fires, even if it fired
    /// before the run began.
    pub async fn start_run_with(&self, config: RunConfig, cancel: CancellationToken) -> RunResult {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("StartRun rejected: a run is already in progress");
            return RunResult::rejected(RunError::AlreadyRunning);
        };

        if let Err(e) = self.store.open() {
            return RunResult::rejected(RunError::Initialization(e));
        }
        let mut navigator = match (self.make_navigator)(&self.profile) {
            Ok(navigator) => navigator,
            Err(e) => return RunResult::rejected(RunError::Session(e)),
        };

        *self.lock_current() = Some(cancel.clone());

        info!(query = %config.listing_query, "run started");
        let result = self
            .pipeline
            .run(&mut navigator, &self.store, &config, &cancel)
            .await;

        *self.lock_current() = None;
        result
    }

    pub fn stored_entities(&self) -> Result<Vec<Entity>, StoreError> {
        self.store.list_all()
    }

    /// Ask the in-flight run, if any, to stop at its next stage boundary.
    pub fn cancel_current(&self) -> bool {
        match self.lock_current().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type Envelope = (Request, oneshot::Sender<Response>);

/// Caller side of the request/response channel.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ServiceHandle {
    /// Deliver one request and wait for its response.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send((request, reply))
            .await
            .map_err(|_| anyhow::anyhow!("service is no longer running"))?;
        response
            .await
            .map_err(|_| anyhow::anyhow!("service dropped the request"))
    }
}

/// Serve requests on a background task. Each request is handled on its own
/// task, so concurrent `ServiceHandle::call`s are not blocked behind a
/// running pipeline.
pub fn spawn<N: Navigator + 'static>(service: Arc<Service<N>>) -> ServiceHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some((request, reply)) = rx.recv().await {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let response = service.handle(request).await;
                let _ = reply.send(response);
            });
        }
    });

    ServiceHandle { tx }
}

/// JSON-lines transport: one request per input line, one response per output
/// line. Lines are answered in order, so a request waits for the one before it.
pub async fn serve_lines<R, W>(handle: &ServiceHandle, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle.call(request).await?,
            Err(e) => Response::Error {
                message: format!("invalid request: {}", e),
            },
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Credentials;
    use crate::navigator::testing::ScriptedNavigator;

    const LOGIN: &str = "https://www.linkedin.com/login";
    const SUBMIT: &str = "https://www.linkedin.com/checkpoint/lg/login-submit";
    const FEED: &str = "https://www.linkedin.com/feed/";
    const CHALLENGE: &str = "https://www.linkedin.com/checkpoint/challenge/";
    const SEARCH: &str = "https://www.linkedin.com/search/results/people/?keywords=Ramasamy";
    const ARUN: &str = "https://www.linkedin.com/in/arun-ramasamy/overlay/contact-info";
    const PRIYA: &str = "https://www.linkedin.com/in/priya-r/overlay/contact-info";
    const KARTHIK: &str = "https://www.linkedin.com/in/karthik-ramasamy-42/overlay/contact-info";

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    fn site() -> ScriptedNavigator {
        ScriptedNavigator::new()
            .serve(LOGIN, &fixture("login"))
            .serve(FEED, "<html><body>feed</body></html>")
            .serve(CHALLENGE, "<html><body>challenge</body></html>")
            .login(SUBMIT, "ada@example.com", "pw", FEED, CHALLENGE)
            .serve(SEARCH, &fixture("listing"))
            .serve(ARUN, &fixture("detail"))
            .timeout(PRIYA)
            .serve(KARTHIK, &fixture("detail_no_email"))
    }

    fn service(nav: ScriptedNavigator) -> Service<ScriptedNavigator> {
        Service::new(
            Store::in_memory(),
            SiteProfile::default(),
            Box::new(move |_| Ok(nav.clone())),
        )
        .unwrap()
    }

    fn config(password: &str) -> RunConfig {
        RunConfig {
            credentials: Credentials::new("ada@example.com", password),
            listing_query: SEARCH.to_string(),
        }
    }

    fn start(password: &str) -> Request {
        Request::StartRun {
            config: config(password),
        }
    }

    fn summary(response: Response) -> RunResultSummary {
        match response {
            Response::RunSummary(summary) => summary,
            other => panic!("expected run summary, got {:?}", other),
        }
    }

    fn entities(response: Response) -> Vec<Entity> {
        match response {
            Response::Entities { entities } => entities,
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_run_is_reported_with_counts() {
        let svc = service(site());
        let s = summary(svc.handle(start("pw")).await);

        assert!(s.success);
        assert_eq!(s.succeeded_count, 2);
        assert_eq!(s.failed_count, 1);
        assert_eq!(s.message, "Extracted 2 entities (1 failed)");

        let stored = entities(svc.handle(Request::GetStoredEntities).await);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].identifier, ARUN);
    }

    #[tokio::test]
    async fn failed_authentication_reports_failure_and_writes_nothing() {
        let svc = service(site());
        let s = summary(svc.handle(start("nope")).await);

        assert!(!s.success);
        assert_eq!(s.succeeded_count, 0);
        assert!(s.message.starts_with("Run failed: authentication failed"));
        assert!(entities(svc.handle(Request::GetStoredEntities).await).is_empty());
    }

    #[tokio::test]
    async fn get_stored_entities_is_repeatable() {
        let svc = service(site());
        svc.handle(start("pw")).await;

        let first = entities(svc.handle(Request::GetStoredEntities).await);
        let second = entities(svc.handle(Request::GetStoredEntities).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn retried_start_run_is_a_new_run() {
        let svc = service(site());
        let a = summary(svc.handle(start("pw")).await);
        let b = summary(svc.handle(start("pw")).await);

        assert_eq!(a, b);
        assert_eq!(svc.stored_entities().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let nav = site();
        let svc = Service::new(
            Store::at(blocker.join("entities.sqlite")),
            SiteProfile::default(),
            Box::new(move |_| Ok(nav.clone())),
        )
        .unwrap();

        let result = svc.start_run(config("pw")).await;
        assert!(matches!(
            result.terminal_error,
            Some(RunError::Initialization(StoreError::Initialization { .. }))
        ));
    }

    #[tokio::test]
    async fn concurrent_start_run_is_rejected() {
        let svc = Arc::new(service(site().latency(Duration::from_millis(20))));
        let handle = spawn(svc);

        let (a, b) = tokio::join!(handle.call(start("pw")), handle.call(start("pw")));
        let mut results = [summary(a.unwrap()), summary(b.unwrap())];
        results.sort_by_key(|s| s.success);

        assert!(!results[0].success);
        assert_eq!(results[0].message, "Run failed: a run is already in progress");
        assert!(results[1].success);
        assert_eq!(results[1].succeeded_count, 2);
    }

    #[tokio::test]
    async fn reads_are_answered_while_a_run_is_in_flight() {
        let svc = Arc::new(service(site().latency(Duration::from_millis(50))));
        let handle = spawn(svc);

        let run = tokio::spawn({
            let handle = handle.clone();
            async move { handle.call(start("pw")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let read = handle.call(Request::GetStoredEntities).await.unwrap();
        assert!(entities(read).is_empty());
        assert!(!run.is_finished());

        let s = summary(run.await.unwrap().unwrap());
        assert!(s.success);
    }

    #[tokio::test]
    async fn cancel_current_stops_a_live_run() {
        let svc = Arc::new(service(site().latency(Duration::from_millis(20))));
        let run = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.start_run(config("pw")).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(svc.cancel_current());
        let result = run.await.unwrap();

        assert!(result.cancelled);
        assert!(result.succeeded.len() < 3);
        let s = RunResultSummary::from(&result);
        assert!(!s.success);
        assert!(s.message.starts_with("Run cancelled after"));
        assert!(!svc.cancel_current());
    }

    #[tokio::test]
    async fn token_cancelled_before_start_is_honoured() {
        let svc = service(site());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = svc.start_run_with(config("pw"), cancel).await;

        assert!(result.cancelled);
        assert!(result.succeeded.is_empty());
        assert!(svc.stored_entities().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_without_run_is_a_no_op() {
        let svc = service(site());
        assert!(!svc.cancel_current());
    }

    #[tokio::test]
    async fn json_lines_round_trip() {
        let handle = spawn(Arc::new(service(site())));
        let input = format!(
            "{}\n\n{{\"action\":\"get_stored_entities\"}}\nnot json\n",
            serde_json::to_string(&start("pw")).unwrap()
        );
        let mut output = Vec::new();

        serve_lines(&handle, input.as_bytes(), &mut output)
            .await
            .unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "run_summary");
        assert_eq!(lines[0]["succeeded_count"], 2);
        assert_eq!(lines[1]["kind"], "entities");
        assert_eq!(lines[1]["entities"].as_array().unwrap().len(), 2);
        assert_eq!(lines[2]["kind"], "error");
    }
}
