use scraper::Html;
use url::Url;

/// Snapshot of the single page context after a navigation settles.
#[derive(Debug, Clone)]
pub struct Page {
    /// Location that was requested; detail entities are keyed by it.
    pub target: String,
    /// Location the navigation actually ended on, after redirects.
    pub url: Url,
    pub status: u16,
    pub body: String,
}

impl Page {
    pub fn new(target: impl Into<String>, url: Url, status: u16, body: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            url,
            status,
            body: body.into(),
        }
    }

    pub fn document(&self) -> Html {
        Html::parse_document(&self.body)
    }

    /// Why the page content cannot be read, if it cannot.
    pub fn access_problem(&self) -> Option<String> {
        if !(200..400).contains(&self.status) {
            Some(format!("HTTP {}", self.status))
        } else if self.body.trim().is_empty() {
            Some("empty document".to_string())
        } else {
            None
        }
    }

    pub fn resolve(&self, reference: &str) -> Option<Url> {
        self.url.join(reference).ok()
    }
}
