use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use url::Url;

/// Where the client currently is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: Option<String>,
    pub path: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,
    /// Path of the page before the last navigation
    pub previous_path: Option<String>,
}

impl PageContext {
    /// Move to `url`, remembering the current page as the referrer
    pub fn navigate(&mut self, url: &str, title: Option<String>) {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            // already a path, possibly with a query string
            Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
        };

        self.previous_path = self.path.take();
        self.referrer = self.url.take().or_else(|| self.referrer.take());
        self.url = Some(url.to_string());
        self.path = Some(path);
        self.title = title;
    }
}

/// Device and locale details supplied by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    pub viewport_width: Option<u32>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

/// Strictly increasing milliseconds since construction
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
    last: AtomicU64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Two calls within the same millisecond still return distinct values
    pub fn now_ms(&self) -> u64 {
        let elapsed = self.start.elapsed().as_millis() as u64;
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let next = elapsed.max(previous + 1);
            match self
                .last
                .compare_exchange_weak(previous, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigate_tracks_previous_page() {
        let mut page = PageContext::default();
        page.navigate("https://example.com/?utm_source=x", Some("Home".into()));
        page.navigate("https://example.com/pricing", Some("Pricing".into()));

        assert_eq!(page.path.as_deref(), Some("/pricing"));
        assert_eq!(page.previous_path.as_deref(), Some("/"));
        assert_eq!(
            page.referrer.as_deref(),
            Some("https://example.com/?utm_source=x")
        );
        assert_eq!(page.title.as_deref(), Some("Pricing"));
    }

    #[test]
    fn test_navigate_accepts_bare_paths() {
        let mut page = PageContext::default();
        page.navigate("/docs/start?ref=nav#intro", None);

        assert_eq!(page.path.as_deref(), Some("/docs/start"));
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let now = clock.now_ms();
            assert!(now > last);
            last = now;
        }
    }
}
