//! Swappable heuristics applied during ingestion
//!
//! Neither rule is an invariant of the store; both are policies a caller
//! may replace through [`crate::Spillbox::with_unsubscribe_detector`] and
//! [`crate::Spillbox::with_contact_matcher`].

use std::sync::LazyLock;

use regex::Regex;

/// Decides whether a rendered HTML body carries an unsubscribe link
pub trait UnsubscribeDetector: Send + Sync {
    fn has_unsubscribe(&self, html: &str) -> bool;
}

/// Matches `<a ...>...unsubscribe...</a>`, case-insensitively and across
/// line breaks
static UNSUBSCRIBE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<a\b[^>]*>(?:[^<]|<[^/]|</[^a])*?unsubscribe.*?</a\s*>")
        .expect("unsubscribe pattern is valid")
});

/// Default detector: an anchor element whose text mentions "unsubscribe"
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkTextDetector;

impl UnsubscribeDetector for LinkTextDetector {
    fn has_unsubscribe(&self, html: &str) -> bool {
        UNSUBSCRIBE_LINK.is_match(html)
    }
}

/// Local parts that identify automated senders
const ROBOT_LOCAL_PARTS: &[&str] = &[
    "noreply",
    "no-reply",
    "no_reply",
    "donotreply",
    "do-not-reply",
    "mailer-daemon",
    "postmaster",
    "notifications",
    "bounce",
];

/// Whether a newly seen address looks like it belongs to a robot
pub fn looks_like_robot(address: &str) -> bool {
    let local = address
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    ROBOT_LOCAL_PARTS
        .iter()
        .any(|robot| local == *robot || local.starts_with(&format!("{robot}+")))
        || local.starts_with("bounce")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_link() {
        let detector = LinkTextDetector;
        assert!(detector.has_unsubscribe(
            r#"<p>Thanks!</p><a href="https://x.example/u?id=1">Unsubscribe</a>"#
        ));
        assert!(detector.has_unsubscribe(
            "<A HREF=\"#\">\n  click to unsubscribe\n</A>"
        ));
    }

    #[test]
    fn test_unsubscribe_outside_link() {
        let detector = LinkTextDetector;
        assert!(!detector.has_unsubscribe("<p>You cannot unsubscribe.</p>"));
        assert!(!detector.has_unsubscribe(r#"<a href="/home">Home</a> unsubscribe"#));
    }

    #[test]
    fn test_robot_addresses() {
        assert!(looks_like_robot("noreply@github.com"));
        assert!(looks_like_robot("No-Reply@bank.example"));
        assert!(looks_like_robot("bounces+123@lists.example"));
        assert!(!looks_like_robot("norah@example.com"));
        assert!(!looks_like_robot("ada@example.com"));
    }
}
