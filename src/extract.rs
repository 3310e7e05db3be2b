use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::config::{FieldRead, SiteProfile};
use crate::entity::Entity;
use crate::error::{ConfigError, ExtractError};
use crate::page::Page;

static ANCHORS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Reads one kind of page into structured output.
pub trait PageExtractor {
    type Output;

    fn extract(&self, page: &Page) -> Result<Self::Output, ExtractError>;
}

/// Listing mode: collects canonical identifiers of the entities a page links to.
pub struct ListingExtractor {
    link_pattern: Regex,
    identifier_suffix: String,
}

impl ListingExtractor {
    pub fn new(link_pattern: &str, identifier_suffix: &str) -> Result<Self, ConfigError> {
        let link_pattern = Regex::new(link_pattern).map_err(|e| ConfigError::InvalidPattern {
            key: "entity_link_pattern".into(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            link_pattern,
            identifier_suffix: identifier_suffix.to_string(),
        })
    }

    pub fn from_profile(profile: &SiteProfile) -> Result<Self, ConfigError> {
        Self::new(&profile.entity_link_pattern, &profile.identifier_suffix)
    }

    /// Canonical identifier for a resolved reference, or `None` when it does
    /// not point at an entity.
    pub fn canonicalize(&self, reference: &str) -> Option<String> {
        let base = self.link_pattern.find(reference)?.as_str();
        Some(format!(
            "{}{}",
            base.trim_end_matches('/'),
            self.identifier_suffix
        ))
    }
}

impl PageExtractor for ListingExtractor {
    type Output = Vec<String>;

    fn extract(&self, page: &Page) -> Result<Vec<String>, ExtractError> {
        if let Some(reason) = page.access_problem() {
            return Err(ExtractError::PageAccess {
                location: page.url.to_string(),
                reason,
            });
        }

        let document = page.document();
        let mut seen_refs = HashSet::new();
        let mut seen_ids = HashSet::new();
        let mut candidates = Vec::new();

        for anchor in document.select(&ANCHORS) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let Some(resolved) = page.resolve(href) else {
                continue;
            };
            let raw = resolved.to_string();
            if !seen_refs.insert(raw.clone()) {
                continue;
            }
            let Some(identifier) = self.canonicalize(&raw) else {
                continue;
            };
            if seen_ids.insert(identifier.clone()) {
                candidates.push(identifier);
            }
        }

        if candidates.is_empty() {
            return Err(ExtractError::NoCandidates {
                location: page.url.to_string(),
            });
        }
        Ok(candidates)
    }
}

struct FieldReader {
    name: String,
    selector: Selector,
    read: FieldRead,
}

impl FieldReader {
    fn read(&self, document: &Html) -> Option<String> {
        let element = document.select(&self.selector).next()?;
        let value = match &self.read {
            FieldRead::Text => collapse_whitespace(element),
            FieldRead::Attr { name, strip_prefix } => {
                let raw = element.value().attr(name)?;
                let raw = match strip_prefix {
                    Some(prefix) => raw.strip_prefix(prefix.as_str()).unwrap_or(raw),
                    None => raw,
                };
                raw.trim().to_string()
            }
        };
        (!value.is_empty()).then_some(value)
    }
}

fn collapse_whitespace(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Detail mode: reads a fixed set of fields into exactly one entity.
///
/// A field whose selector finds nothing takes the sentinel; the entity is
/// only lost when the page itself cannot be read.
pub struct DetailExtractor {
    fields: Vec<FieldReader>,
    sentinel: String,
}

impl DetailExtractor {
    pub fn from_profile(profile: &SiteProfile) -> Result<Self, ConfigError> {
        let fields = profile
            .fields
            .iter()
            .map(|spec| {
                let selector =
                    Selector::parse(&spec.selector).map_err(|e| ConfigError::InvalidSelector {
                        key: format!("fields.{}", spec.name),
                        reason: e.to_string(),
                    })?;
                Ok(FieldReader {
                    name: spec.name.clone(),
                    selector,
                    read: spec.read.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            fields,
            sentinel: profile.sentinel.clone(),
        })
    }
}

impl PageExtractor for DetailExtractor {
    type Output = Entity;

    fn extract(&self, page: &Page) -> Result<Entity, ExtractError> {
        if let Some(reason) = page.access_problem() {
            return Err(ExtractError::PageAccess {
                location: page.target.clone(),
                reason,
            });
        }

        let document = page.document();
        let mut entity = Entity::new(page.target.as_str());
        for field in &self.fields {
            let value = field.read(&document).unwrap_or_else(|| {
                debug!(identifier = %page.target, field = %field.name, "field missing");
                self.sentinel.clone()
            });
            entity.fields.insert(field.name.clone(), value);
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::entity::SENTINEL;

    fn fixture(name: &str, target: &str) -> Page {
        let html = std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap();
        Page::new(target, Url::parse(target).unwrap(), 200, html)
    }

    const SEARCH: &str = "https://www.linkedin.com/search/results/people/?keywords=Ramasamy";

    #[test]
    fn listing_yields_canonical_identifiers_in_page_order() {
        let extractor = ListingExtractor::from_profile(&SiteProfile::default()).unwrap();
        let ids = extractor.extract(&fixture("listing", SEARCH)).unwrap();

        assert_eq!(
            ids,
            [
                "https://www.linkedin.com/in/arun-ramasamy/overlay/contact-info",
                "https://www.linkedin.com/in/priya-r/overlay/contact-info",
                "https://www.linkedin.com/in/karthik-ramasamy-42/overlay/contact-info",
            ]
        );
    }

    #[test]
    fn listing_without_entity_links_signals_no_candidates() {
        let extractor = ListingExtractor::from_profile(&SiteProfile::default()).unwrap();
        let err = extractor
            .extract(&fixture("listing_empty", SEARCH))
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoCandidates { .. }));
    }

    #[test]
    fn canonicalize_strips_query_and_trailing_parts() {
        let extractor = ListingExtractor::new(r"https://example\.com/people/\d+", "").unwrap();
        assert_eq!(
            extractor.canonicalize("https://example.com/people/42/activity?tab=1"),
            Some("https://example.com/people/42".to_string())
        );
        assert_eq!(extractor.canonicalize("https://example.com/teams/7"), None);
    }

    #[test]
    fn detail_reads_every_field() {
        let target = "https://www.linkedin.com/in/arun-ramasamy/overlay/contact-info";
        let extractor = DetailExtractor::from_profile(&SiteProfile::default()).unwrap();
        let entity = extractor.extract(&fixture("detail", target)).unwrap();

        assert_eq!(entity.identifier, target);
        assert_eq!(entity.field("name"), Some("Arun Ramasamy"));
        assert_eq!(entity.field("email"), Some("arun.ramasamy@example.com"));
    }

    #[test]
    fn detail_missing_contact_uses_sentinel() {
        let target = "https://www.linkedin.com/in/priya-r/overlay/contact-info";
        let extractor = DetailExtractor::from_profile(&SiteProfile::default()).unwrap();
        let entity = extractor
            .extract(&fixture("detail_no_email", target))
            .unwrap();

        assert_eq!(entity.field("name"), Some("Priya R"));
        assert_eq!(entity.field("email"), Some(SENTINEL));
    }

    #[test]
    fn detail_on_unreadable_page_fails() {
        let target = "https://www.linkedin.com/in/ghost/overlay/contact-info";
        let extractor = DetailExtractor::from_profile(&SiteProfile::default()).unwrap();

        let blank = Page::new(target, Url::parse(target).unwrap(), 200, "   ");
        assert!(matches!(
            extractor.extract(&blank),
            Err(ExtractError::PageAccess { .. })
        ));

        let gone = Page::new(target, Url::parse(target).unwrap(), 410, "<h1>Gone</h1>");
        assert!(matches!(
            extractor.extract(&gone),
            Err(ExtractError::PageAccess { .. })
        ));
    }

    #[test]
    fn custom_sentinel_is_respected() {
        let profile = SiteProfile {
            sentinel: "-".into(),
            ..SiteProfile::default()
        };
        let target = "https://www.linkedin.com/in/priya-r/overlay/contact-info";
        let extractor = DetailExtractor::from_profile(&profile).unwrap();
        let entity = extractor
            .extract(&fixture("detail_no_email", target))
            .unwrap();
        assert_eq!(entity.field("email"), Some("-"));
    }
}
