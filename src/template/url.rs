//! Display URL templates with positional placeholders.
//!
//! A port may carry a URL such as `http://{0}:{1}` where `{0}` is replaced by
//! the reachable host and `{1}` by the allocated external port.

use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid")
});

/// A checked URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
}

impl UrlTemplate {
    /// Parse a template, rejecting placeholders other than `{0}` and `{1}`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let unknown: Vec<&str> = PLACEHOLDER
            .captures_iter(raw)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|p| *p != "0" && *p != "1")
            .collect();

        if !unknown.is_empty() {
            return Err(format!(
                "unsupported placeholder(s) {} in url template '{}' (only {{0}} host and {{1}} port are allowed)",
                unknown
                    .iter()
                    .map(|p| format!("{{{}}}", p))
                    .collect::<Vec<_>>()
                    .join(", "),
                raw
            ));
        }

        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitute host and port into the template.
    pub fn render(&self, host: &str, port: u16) -> String {
        let port = port.to_string();
        PLACEHOLDER
            .replace_all(&self.raw, |caps: &regex::Captures<'_>| match &caps[1] {
                "0" => host.to_string(),
                _ => port.clone(),
            })
            .into_owned()
    }
}
