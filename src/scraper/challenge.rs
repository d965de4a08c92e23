//! Bot-mitigation interstitial detection.
//!
//! Heuristic only: a page is `Challenged` when its title or visible body text
//! mentions one of the keywords, or when the raw markup carries a known
//! challenge-platform marker. Misses are acceptable; false alarms should not be.

use scraper::{Html, Node, Selector};

const KEYWORDS: &[&str] = &[
    "captcha",
    "human verification",
    "verify you are human",
    "cloudflare",
    "bot detection",
    "just a moment",
];

/// Markers that only show up on interstitials, never on a normal stats page.
const MARKERS: &[&str] = &["cf-chl-", "cf_chl_opt", "g-recaptcha", "h-captcha"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Clean,
    /// Carries the keyword or marker that tripped the check.
    Challenged(String),
}

impl Classification {
    pub fn is_challenged(&self) -> bool {
        matches!(self, Classification::Challenged(_))
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    keywords: Vec<String>,
    markers: Vec<String>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            keywords: KEYWORDS.iter().map(|s| s.to_string()).collect(),
            markers: MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ChallengeDetector {
    pub fn classify(&self, html: &str) -> Classification {
        let raw = html.to_lowercase();
        if let Some(m) = self.markers.iter().find(|m| raw.contains(m.as_str())) {
            return Classification::Challenged(m.clone());
        }

        let doc = Html::parse_document(html);
        self.classify_text(&page_title(&doc), &visible_text(&doc))
    }

    /// Classification for backends that already hold title and body text
    /// (a live browser tab).
    pub fn classify_text(&self, title: &str, body: &str) -> Classification {
        let title = title.to_lowercase();
        let body = body.to_lowercase();
        self.keywords
            .iter()
            .find(|kw| title.contains(kw.as_str()) || body.contains(kw.as_str()))
            .map(|kw| Classification::Challenged(kw.clone()))
            .unwrap_or(Classification::Clean)
    }
}

fn page_title(doc: &Html) -> String {
    let Ok(sel) = Selector::parse("title") else { return String::new() };
    doc.select(&sel)
        .next()
        .map(|t| t.text().collect::<String>())
        .unwrap_or_default()
}

/// Body text without script/style/noscript contents.
fn visible_text(doc: &Html) -> String {
    let Ok(sel) = Selector::parse("body") else { return String::new() };
    let Some(body) = doc.select(&sel).next() else { return String::new() };

    let mut out = String::new();
    for node in body.descendants() {
        let Node::Text(text) = node.value() else { continue };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    out
}
