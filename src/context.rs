//! Ambient event context snapshot
//!
//! `build_context` reads whatever the host environment exposes (locale, user
//! agent, screen, page location) and produces a flat snapshot attached to
//! every event. Hosts without a page or a screen simply report `None` for
//! those fields; nothing here fails.

use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::LibraryConfig;

/// UTM query parameters reported in every context, null when absent
pub const UTM_PARAMS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
];

/// Context source for events emitted by the SDK itself
pub const SDK_SOURCE: &str = "sdk";

/// Host environment the context is read from
pub trait Environment: Send + Sync {
    fn locale(&self) -> Option<String> {
        None
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    fn time_zone(&self) -> Option<String> {
        None
    }

    /// Screen size as (width, height)
    fn screen_size(&self) -> Option<(u32, u32)> {
        None
    }

    /// Full page URL including the query string
    fn page_url(&self) -> Option<String> {
        None
    }

    fn page_referrer(&self) -> Option<String> {
        None
    }

    fn page_title(&self) -> Option<String> {
        None
    }
}

/// Environment with nothing available
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEnvironment;

impl Environment for NullEnvironment {}

/// Environment whose values are pushed in by the embedding host
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    pub locale: Option<String>,
    pub user_agent: Option<String>,
    pub time_zone: Option<String>,
    pub screen_size: Option<(u32, u32)>,
    pub page_url: Option<String>,
    pub page_referrer: Option<String>,
    pub page_title: Option<String>,
}

impl Environment for StaticEnvironment {
    fn locale(&self) -> Option<String> {
        self.locale.clone()
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.clone()
    }

    fn time_zone(&self) -> Option<String> {
        self.time_zone.clone()
    }

    fn screen_size(&self) -> Option<(u32, u32)> {
        self.screen_size
    }

    fn page_url(&self) -> Option<String> {
        self.page_url.clone()
    }

    fn page_referrer(&self) -> Option<String> {
        self.page_referrer.clone()
    }

    fn page_title(&self) -> Option<String> {
        self.page_title.clone()
    }
}

/// Process environment: locale from `LANG`, time zone from `TZ`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn locale(&self) -> Option<String> {
        // LANG looks like "en_US.UTF-8"
        std::env::var("LANG")
            .ok()
            .and_then(|lang| lang.split('.').next().map(|l| l.replace('_', "-")))
            .filter(|l| !l.is_empty() && l != "C" && l != "POSIX")
    }

    fn user_agent(&self) -> Option<String> {
        Some(format!(
            "{}/{} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        ))
    }

    fn time_zone(&self) -> Option<String> {
        std::env::var("TZ").ok().filter(|tz| !tz.is_empty())
    }
}

/// Flat context snapshot attached to each event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventContext {
    pub library_name: String,
    pub library_version: String,
    pub locale: Option<String>,
    pub user_agent: Option<String>,
    pub time_zone: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    #[serde(flatten)]
    pub utm: BTreeMap<String, Option<String>>,
    pub page_referrer: Option<String>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    /// Where the event was triggered from
    pub source: String,
    /// Where the purchase originated
    pub rc_source: Option<String>,
}

/// Build a context snapshot from the current environment
pub fn build_context(
    env: &dyn Environment,
    library: &LibraryConfig,
    source: &str,
    rc_source: Option<&str>,
) -> EventContext {
    let parsed_url = env.page_url().and_then(|raw| Url::parse(&raw).ok());

    let mut utm: BTreeMap<String, Option<String>> =
        UTM_PARAMS.iter().map(|p| (p.to_string(), None)).collect();
    if let Some(url) = &parsed_url {
        for (key, value) in url.query_pairs() {
            if let Some(slot) = utm.get_mut(&*key) {
                // First occurrence wins, as with URLSearchParams.get
                if slot.is_none() {
                    *slot = Some(value.into_owned());
                }
            }
        }
    }

    let page_url = parsed_url.as_ref().map(|url| {
        let mut stripped = url.clone();
        stripped.set_query(None);
        stripped.set_fragment(None);
        stripped.to_string()
    });

    let (screen_width, screen_height) = match env.screen_size() {
        Some((w, h)) => (Some(w), Some(h)),
        None => (None, None),
    };

    EventContext {
        library_name: library.name.clone(),
        library_version: library.version.clone(),
        locale: env.locale(),
        user_agent: env.user_agent(),
        time_zone: env.time_zone(),
        screen_width,
        screen_height,
        utm,
        page_referrer: env.page_referrer().filter(|r| !r.is_empty()),
        page_url,
        page_title: env.page_title(),
        source: source.to_string(),
        rc_source: rc_source.map(str::to_string),
    }
}
