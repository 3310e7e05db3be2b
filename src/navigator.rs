use std::future::Future;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use scraper::Selector;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::config::{SiteProfile, WaitPolicy};
use crate::error::{ConfigError, NavigationError};
use crate::page::Page;

/// Observable signal that a destination is loaded enough to read.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Any response counts.
    Loaded,
    /// At least one element matches the CSS selector.
    Selector(String),
    /// The final location matches the pattern.
    UrlMatches(Regex),
}

impl Readiness {
    pub fn from_selector(key: &str, css: Option<&str>) -> Result<Self, ConfigError> {
        match css {
            None => Ok(Readiness::Loaded),
            Some(css) => {
                Selector::parse(css).map_err(|e| ConfigError::InvalidSelector {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Readiness::Selector(css.to_string()))
            }
        }
    }

    pub fn is_satisfied(&self, page: &Page) -> bool {
        match self {
            Readiness::Loaded => true,
            Readiness::UrlMatches(pattern) => pattern.is_match(page.url.as_str()),
            Readiness::Selector(css) => match Selector::parse(css) {
                Ok(selector) => {
                    let document = page.document();
                    let found = document.select(&selector).next().is_some();
                    found
                }
                Err(e) => {
                    warn!(selector = %css, error = %e, "unusable readiness selector");
                    false
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMethod {
    Get,
    Post,
}

/// A filled-in form, ready to hand to the site's own submission handling.
#[derive(Debug, Clone)]
pub struct FormSubmission {
    pub action: Url,
    pub method: FormMethod,
    pub fields: Vec<(String, String)>,
}

impl FormSubmission {
    #[cfg(test)]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Exclusive driver of the single page context.
#[async_trait]
pub trait Navigator: Send {
    /// Move to `target` and suspend until `readiness` holds or the wait elapses.
    async fn goto(&mut self, target: &str, readiness: &Readiness) -> Result<(), NavigationError>;

    async fn submit_form(
        &mut self,
        form: &FormSubmission,
        readiness: &Readiness,
    ) -> Result<(), NavigationError>;

    fn page(&self) -> Option<&Page>;

    fn current_location_matches(&self, pattern: &Regex) -> bool {
        self.page()
            .is_some_and(|page| pattern.is_match(page.url.as_str()))
    }
}

pub enum AttemptError {
    /// Worth retrying until the deadline.
    Transient(String),
    Fatal(NavigationError),
}

pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut { last: Option<T>, cause: Option<String> },
}

/// Repeat `attempt` every poll interval until its value satisfies `ready`
/// or the policy's timeout elapses.
pub async fn poll_until<T, F, Fut, R>(
    policy: &WaitPolicy,
    mut attempt: F,
    ready: R,
) -> Result<WaitOutcome<T>, NavigationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
    R: Fn(&T) -> bool,
{
    let deadline = Instant::now() + policy.timeout();
    let mut last = None;
    let mut cause = None;

    loop {
        match timeout_at(deadline, attempt()).await {
            Err(_) => break,
            Ok(Ok(value)) => {
                if ready(&value) {
                    return Ok(WaitOutcome::Ready(value));
                }
                last = Some(value);
            }
            Ok(Err(AttemptError::Transient(reason))) => cause = Some(reason),
            Ok(Err(AttemptError::Fatal(err))) => return Err(err),
        }

        let next = Instant::now() + policy.poll_interval();
        if next >= deadline {
            break;
        }
        sleep_until(next).await;
    }

    Ok(WaitOutcome::TimedOut { last, cause })
}

/// Navigator over a cookie-carrying HTTP session.
pub struct HttpNavigator {
    client: Client,
    wait: WaitPolicy,
    page: Option<Page>,
}

impl HttpNavigator {
    pub fn new(profile: &SiteProfile) -> Result<Self, NavigationError> {
        let client = Client::builder()
            .cookie_store(true)
            .user_agent(profile.user_agent.as_str())
            .timeout(profile.wait.timeout())
            .build()
            .map_err(|e| NavigationError::Session(e.to_string()))?;
        Ok(Self {
            client,
            wait: profile.wait,
            page: None,
        })
    }

    async fn load(
        &mut self,
        target: &str,
        url: Url,
        readiness: &Readiness,
    ) -> Result<(), NavigationError> {
        let client = &self.client;
        let outcome = poll_until(
            &self.wait,
            || fetch(client.get(url.clone()), target.to_string()),
            |page| readiness.is_satisfied(page),
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(page) => {
                debug!(requested = %target, url = %page.url, status = page.status, "page ready");
                self.page = Some(page);
                Ok(())
            }
            WaitOutcome::TimedOut { last, cause } => {
                if last.is_some() {
                    self.page = last;
                }
                Err(NavigationError::Timeout {
                    target: target.to_string(),
                    waited: self.wait.timeout(),
                    last_cause: cause,
                })
            }
        }
    }
}

#[async_trait]
impl Navigator for HttpNavigator {
    async fn goto(&mut self, target: &str, readiness: &Readiness) -> Result<(), NavigationError> {
        let url = Url::parse(target).map_err(|e| NavigationError::InvalidTarget {
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        self.load(target, url, readiness).await
    }

    async fn submit_form(
        &mut self,
        form: &FormSubmission,
        readiness: &Readiness,
    ) -> Result<(), NavigationError> {
        let target = form.action.to_string();
        let request = match form.method {
            FormMethod::Post => self.client.post(form.action.clone()).form(&form.fields),
            FormMethod::Get => self.client.get(form.action.clone()).query(&form.fields),
        };

        // Submitted once; only the page it lands on is re-polled.
        let landed = match fetch(request, target.clone()).await {
            Ok(page) => page,
            Err(AttemptError::Transient(reason)) => {
                return Err(NavigationError::PageAccess { target, reason })
            }
            Err(AttemptError::Fatal(err)) => return Err(err),
        };

        if readiness.is_satisfied(&landed) {
            self.page = Some(landed);
            return Ok(());
        }
        let url = landed.url.clone();
        self.page = Some(landed);
        self.load(url.as_str(), url.clone(), readiness).await
    }

    fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }
}

async fn fetch(request: RequestBuilder, target: String) -> Result<Page, AttemptError> {
    let response = request
        .send()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(AttemptError::Transient(format!("HTTP {}", status.as_u16())));
    }
    if status.is_client_error() {
        return Err(AttemptError::Fatal(NavigationError::PageAccess {
            target,
            reason: format!("HTTP {}", status.as_u16()),
        }));
    }

    let url = response.url().clone();
    let body = response
        .text()
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?;
    Ok(Page::new(target, url, status.as_u16(), body))
}

/// In-memory navigator that serves scripted pages instead of a live site.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Page { url: String, status: u16, body: String },
        Timeout,
        /// The site answered with a non-retryable status.
        Status(u16),
    }

    #[derive(Debug, Clone)]
    struct Login {
        action: String,
        username: String,
        password: String,
        accepted: String,
        rejected: String,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ScriptedNavigator {
        script: HashMap<String, Scripted>,
        login: Option<Login>,
        latency: Option<Duration>,
        page: Option<Page>,
        pub visits: Vec<String>,
    }

    impl ScriptedNavigator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn serve(mut self, target: &str, body: &str) -> Self {
            self.script.insert(
                target.to_string(),
                Scripted::Page {
                    url: target.to_string(),
                    status: 200,
                    body: body.to_string(),
                },
            );
            self
        }

        pub fn respond(mut self, target: &str, response: Scripted) -> Self {
            self.script.insert(target.to_string(), response);
            self
        }

        pub fn timeout(self, target: &str) -> Self {
            self.respond(target, Scripted::Timeout)
        }

        pub fn status(self, target: &str, status: u16) -> Self {
            self.respond(target, Scripted::Status(status))
        }

        /// A form posted to `action` carrying both `username` and `password`
        /// lands on `accepted`; any other submission lands on `rejected`.
        pub fn login(
            mut self,
            action: &str,
            username: &str,
            password: &str,
            accepted: &str,
            rejected: &str,
        ) -> Self {
            self.login = Some(Login {
                action: action.to_string(),
                username: username.to_string(),
                password: password.to_string(),
                accepted: accepted.to_string(),
                rejected: rejected.to_string(),
            });
            self
        }

        pub fn latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        fn resolve(&mut self, target: &str, readiness: &Readiness) -> Result<(), NavigationError> {
            self.visits.push(target.to_string());
            let page = match self.script.get(target) {
                None => {
                    return Err(NavigationError::PageAccess {
                        target: target.to_string(),
                        reason: "HTTP 404".into(),
                    })
                }
                Some(Scripted::Timeout) => {
                    return Err(NavigationError::Timeout {
                        target: target.to_string(),
                        waited: Duration::from_millis(5000),
                        last_cause: None,
                    })
                }
                Some(Scripted::Status(status)) => {
                    return Err(NavigationError::PageAccess {
                        target: target.to_string(),
                        reason: format!("HTTP {}", status),
                    })
                }
                Some(Scripted::Page { url, status, body }) => {
                    let url = Url::parse(url).map_err(|e| NavigationError::InvalidTarget {
                        target: target.to_string(),
                        reason: e.to_string(),
                    })?;
                    Page::new(target, url, *status, body.clone())
                }
            };

            let ready = readiness.is_satisfied(&page);
            self.page = Some(page);
            if ready {
                Ok(())
            } else {
                Err(NavigationError::Timeout {
                    target: target.to_string(),
                    waited: Duration::from_millis(5000),
                    last_cause: None,
                })
            }
        }
    }

    #[async_trait]
    impl Navigator for ScriptedNavigator {
        async fn goto(
            &mut self,
            target: &str,
            readiness: &Readiness,
        ) -> Result<(), NavigationError> {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.resolve(target, readiness)
        }

        async fn submit_form(
            &mut self,
            form: &FormSubmission,
            readiness: &Readiness,
        ) -> Result<(), NavigationError> {
            let login = self.login.clone().ok_or_else(|| NavigationError::PageAccess {
                target: form.action.to_string(),
                reason: "HTTP 405".into(),
            })?;
            if form.action.as_str() != login.action {
                return Err(NavigationError::PageAccess {
                    target: form.action.to_string(),
                    reason: "HTTP 404".into(),
                });
            }
            let submitted = |expected: &str| form.fields.iter().any(|(_, v)| v == expected);
            let accepted = submitted(&login.username) && submitted(&login.password);
            let landing = if accepted { login.accepted } else { login.rejected };
            self.resolve(&landing, readiness)
        }

        fn page(&self) -> Option<&Page> {
            self.page.as_ref()
        }
    }
}
