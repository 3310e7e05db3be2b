use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};
use tracing::{debug, info, warn};

use crate::config::{Credentials, SiteProfile};
use crate::error::{AuthError, ConfigError, NavigationError};
use crate::navigator::{FormMethod, FormSubmission, Navigator, Readiness};
use crate::page::Page;

static FORMS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("form").unwrap());
static INPUTS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("input").unwrap());

const NON_VALUE_INPUTS: &[&str] = &["submit", "button", "image", "reset", "file"];

/// Credential-submission stage. Success is judged only by where the site
/// sends the session afterwards.
pub struct Authenticator {
    login_url: String,
    username_field: String,
    password_field: String,
    submit_selector: String,
    post_login: Regex,
}

impl Authenticator {
    pub fn from_profile(profile: &SiteProfile) -> Result<Self, ConfigError> {
        Selector::parse(&profile.submit_selector).map_err(|e| ConfigError::InvalidSelector {
            key: "submit_selector".into(),
            reason: e.to_string(),
        })?;
        let post_login =
            Regex::new(&profile.post_login_pattern).map_err(|e| ConfigError::InvalidPattern {
                key: "post_login_pattern".into(),
                reason: e.to_string(),
            })?;
        url::Url::parse(&profile.login_url).map_err(|e| ConfigError::InvalidUrl {
            key: "login_url".into(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            login_url: profile.login_url.clone(),
            username_field: profile.username_field.clone(),
            password_field: profile.password_field.clone(),
            submit_selector: profile.submit_selector.clone(),
            post_login,
        })
    }

    pub async fn login<N: Navigator + ?Sized>(
        &self,
        navigator: &mut N,
        credentials: &Credentials,
    ) -> Result<(), AuthError> {
        info!(stage = "authenticating", url = %self.login_url, "opening login page");
        navigator.goto(&self.login_url, &Readiness::Loaded).await?;

        let page = navigator.page().ok_or(NavigationError::NoPage)?;
        let form = self.locate_form(page, credentials)?;
        debug!(action = %form.action, fields = form.fields.len(), "submitting credentials");

        let landed = Readiness::UrlMatches(self.post_login.clone());
        match navigator.submit_form(&form, &landed).await {
            Ok(()) => {}
            Err(NavigationError::Timeout { .. }) => {
                debug!("post-login location not observed before the wait elapsed")
            }
            Err(e) => return Err(e.into()),
        }

        if navigator.current_location_matches(&self.post_login) {
            info!(stage = "authenticating", "login successful");
            return Ok(());
        }

        let location = navigator
            .page()
            .map(|p| p.url.to_string())
            .unwrap_or_default();
        warn!(stage = "authenticating", %location, "login not confirmed by post-login location");
        Err(AuthError::AuthenticationFailed { location })
    }

    /// Find the form holding both credential inputs and a submit control,
    /// and fill it in.
    pub fn locate_form(
        &self,
        page: &Page,
        credentials: &Credentials,
    ) -> Result<FormSubmission, AuthError> {
        let document = page.document();
        let submit = Selector::parse(&self.submit_selector).map_err(|e| {
            AuthError::FormNotFound {
                location: page.url.to_string(),
                missing: format!("usable submit selector ({})", e),
            }
        })?;

        for form in document.select(&FORMS) {
            let has_user = form.select(&INPUTS).any(|i| self.is_field(i, &self.username_field));
            let has_pass = form.select(&INPUTS).any(|i| self.is_field(i, &self.password_field));
            let has_submit = form.select(&submit).next().is_some();
            if has_user && has_pass && has_submit {
                return Ok(self.fill(page, form, credentials));
            }
        }

        let mut missing = Vec::new();
        if !document.select(&INPUTS).any(|i| self.is_field(i, &self.username_field)) {
            missing.push("username input");
        }
        if !document.select(&INPUTS).any(|i| self.is_field(i, &self.password_field)) {
            missing.push("password input");
        }
        if document.select(&submit).next().is_none() {
            missing.push("submit control");
        }
        if missing.is_empty() {
            missing.push("a form holding all credential inputs");
        }

        Err(AuthError::FormNotFound {
            location: page.url.to_string(),
            missing: missing.join(", "),
        })
    }

    fn is_field(&self, input: ElementRef<'_>, field: &str) -> bool {
        let element = input.value();
        element.attr("name") == Some(field) || element.id() == Some(field)
    }

    fn fill(&self, page: &Page, form: ElementRef<'_>, credentials: &Credentials) -> FormSubmission {
        let mut fields = Vec::new();

        for input in form.select(&INPUTS) {
            let element = input.value();
            let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();

            let value = if self.is_field(input, &self.username_field) {
                credentials.username.clone()
            } else if self.is_field(input, &self.password_field) {
                credentials.password.clone()
            } else if NON_VALUE_INPUTS.contains(&kind.as_str()) {
                continue;
            } else if (kind == "checkbox" || kind == "radio") && element.attr("checked").is_none() {
                continue;
            } else {
                element.attr("value").unwrap_or("").to_string()
            };

            let name = match element.attr("name") {
                Some(name) => name.to_string(),
                None if self.is_field(input, &self.username_field) => self.username_field.clone(),
                None if self.is_field(input, &self.password_field) => self.password_field.clone(),
                None => continue,
            };
            fields.push((name, value));
        }

        let action = form
            .value()
            .attr("action")
            .filter(|a| !a.trim().is_empty())
            .and_then(|a| page.resolve(a))
            .unwrap_or_else(|| page.url.clone());
        let method = match form.value().attr("method") {
            Some(m) if m.eq_ignore_ascii_case("get") => FormMethod::Get,
            _ => FormMethod::Post,
        };

        FormSubmission {
            action,
            method,
            fields,
        }
    }
}
