//! Locator grammar.
//!
//! A locator is a chain of segments separated by ` >> `, resolved left to
//! right, each segment scoping the next:
//!
//! ```text
//! input[aria-label="Search"]
//! role=button[name=/save/i] >> nth=1
//! [role="navigation"] >> input[placeholder*="search" i]
//! button:has-text("Save")
//! ```
//!
//! The string form is canonical: it is what candidates carry, what the
//! cache persists, and what the artifact replays. `parse` and `Display`
//! round-trip.

use serde::{Deserialize, Serialize};

use crate::errors::DriverError;

/// Accessible-name pattern for role segments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePattern {
    pub pattern: String,
    /// `/re/` form instead of a quoted literal.
    pub regex: bool,
    pub case_insensitive: bool,
}

impl NamePattern {
    pub fn exact(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: false,
            case_insensitive: false,
        }
    }

    pub fn regex_ci(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: true,
            case_insensitive: true,
        }
    }

    /// Match a concrete accessible name against this pattern.
    ///
    /// The regex form supports the subset discovery emits: a plain
    /// substring with no metacharacters, so containment is the match rule.
    pub fn matches(&self, name: &str) -> bool {
        let (name, pattern) = if self.case_insensitive {
            (name.to_lowercase(), self.pattern.to_lowercase())
        } else {
            (name.to_string(), self.pattern.clone())
        };
        if self.regex {
            name.contains(&pattern)
        } else {
            name == pattern
        }
    }
}

/// One resolution step of a locator chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    /// Plain CSS, optionally post-filtered by `:has-text("...")`.
    Css {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        has_text: Option<String>,
    },
    /// ARIA role plus optional accessible-name pattern.
    Role {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<NamePattern>,
    },
    /// Pick index `k` of the current set.
    Nth { index: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    pub segments: Vec<Segment>,
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Css {
                selector: selector.into(),
                has_text: None,
            }],
        }
    }

    pub fn css_with_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Css {
                selector: selector.into(),
                has_text: Some(text.into()),
            }],
        }
    }

    pub fn role(role: impl Into<String>, name: NamePattern) -> Self {
        Self {
            segments: vec![Segment::Role {
                role: role.into(),
                name: Some(name),
            }],
        }
    }

    /// Append an `nth=k` pick to the chain.
    pub fn nth(mut self, index: usize) -> Self {
        self.segments.push(Segment::Nth { index });
        self
    }

    /// Scope this locator under a landmark: the landmark chain resolves
    /// first, this chain continues inside it.
    pub fn scoped_under(&self, landmark: &Locator) -> Self {
        let mut segments = landmark.segments.clone();
        segments.extend(self.segments.iter().cloned());
        Self { segments }
    }

    /// Whether the leading segment is a raw `#id` selector; such bindings
    /// are volatile and subject to the id-cache policy.
    pub fn is_raw_id(&self) -> bool {
        matches!(
            self.segments.first(),
            Some(Segment::Css { selector, .. }) if selector.starts_with('#')
        )
    }

    pub fn parse(raw: &str) -> Result<Self, DriverError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DriverError::InvalidLocator("empty locator".into()));
        }
        let segments = raw
            .split(" >> ")
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.segments.iter().map(render_segment).collect();
        f.write_str(&rendered.join(" >> "))
    }
}

fn parse_segment(raw: &str) -> Result<Segment, DriverError> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("nth=") {
        let index: usize = rest
            .trim()
            .parse()
            .map_err(|_| DriverError::InvalidLocator(format!("bad nth index in '{raw}'")))?;
        return Ok(Segment::Nth { index });
    }
    if let Some(rest) = raw.strip_prefix("role=") {
        return parse_role_segment(rest);
    }
    // CSS, optionally with a trailing :has-text("...") filter.
    if let Some(idx) = raw.find(":has-text(") {
        let (selector, tail) = raw.split_at(idx);
        let inner = tail
            .strip_prefix(":has-text(")
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| DriverError::InvalidLocator(format!("unterminated has-text in '{raw}'")))?;
        let text = strip_quotes(inner.trim());
        return Ok(Segment::Css {
            selector: selector.trim().to_string(),
            has_text: Some(text),
        });
    }
    Ok(Segment::Css {
        selector: raw.to_string(),
        has_text: None,
    })
}

fn parse_role_segment(rest: &str) -> Result<Segment, DriverError> {
    match rest.find('[') {
        None => Ok(Segment::Role {
            role: rest.trim().to_string(),
            name: None,
        }),
        Some(idx) => {
            let role = rest[..idx].trim().to_string();
            let attr = rest[idx..]
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .ok_or_else(|| {
                    DriverError::InvalidLocator(format!("unterminated role attribute in '{rest}'"))
                })?;
            let value = attr.strip_prefix("name=").ok_or_else(|| {
                DriverError::InvalidLocator(format!("role segment only supports [name=..]: '{rest}'"))
            })?;
            let name = parse_name_pattern(value.trim())?;
            Ok(Segment::Role {
                role,
                name: Some(name),
            })
        }
    }
}

fn parse_name_pattern(value: &str) -> Result<NamePattern, DriverError> {
    if let Some(body) = value.strip_prefix('/') {
        let (pattern, flags) = body.rsplit_once('/').ok_or_else(|| {
            DriverError::InvalidLocator(format!("unterminated name regex: '{value}'"))
        })?;
        return Ok(NamePattern {
            pattern: pattern.to_string(),
            regex: true,
            case_insensitive: flags.contains('i'),
        });
    }
    Ok(NamePattern::exact(strip_quotes(value)))
}

fn strip_quotes(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn render_segment(segment: &Segment) -> String {
    match segment {
        Segment::Nth { index } => format!("nth={index}"),
        Segment::Role { role, name: None } => format!("role={role}"),
        Segment::Role {
            role,
            name: Some(name),
        } => {
            if name.regex {
                let flags = if name.case_insensitive { "i" } else { "" };
                format!("role={role}[name=/{}/{flags}]", name.pattern)
            } else {
                format!("role={role}[name=\"{}\"]", name.pattern)
            }
        }
        Segment::Css {
            selector,
            has_text: None,
        } => selector.clone(),
        Segment::Css {
            selector,
            has_text: Some(text),
        } => format!("{selector}:has-text(\"{text}\")"),
    }
}

// ---------------------------------------------------------------------------
// Restricted CSS decomposition
//
// Discovery only ever emits a bounded CSS subset: optional tag, #id,
// .class, and [attr op "value" i?] terms. Decomposing it here lets the
// in-memory fake match elements without a CSS engine; the CDP driver
// passes selectors to `querySelectorAll` untouched.
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrOp {
    Exists,
    Equals,
    Contains,
    StartsWith,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttrMatch {
    pub name: String,
    pub op: AttrOp,
    pub value: Option<String>,
    pub case_insensitive: bool,
}

impl AttrMatch {
    pub fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        let Some(expected) = &self.value else {
            return true;
        };
        let (actual, expected) = if self.case_insensitive {
            (actual.to_lowercase(), expected.to_lowercase())
        } else {
            (actual.to_string(), expected.clone())
        };
        match self.op {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == expected,
            AttrOp::Contains => actual.contains(&expected),
            AttrOp::StartsWith => actual.starts_with(&expected),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CssParts {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrMatch>,
}

/// Decompose a selector from the restricted subset. Returns `None` for
/// syntax outside it (combinators, pseudo-classes, comma lists).
pub fn parse_css_parts(selector: &str) -> Option<CssParts> {
    let selector = selector.trim();
    if selector.is_empty() || has_combinator_outside_brackets(selector) {
        return None;
    }
    let mut parts = CssParts::default();
    let mut rest = selector;

    let tag_end = rest
        .find(['#', '.', '['])
        .unwrap_or(rest.len());
    if tag_end > 0 {
        let tag = &rest[..tag_end];
        if tag != "*" {
            if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return None;
            }
            parts.tag = Some(tag.to_lowercase());
        }
        rest = &rest[tag_end..];
    }

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('#') {
            let end = tail.find(['#', '.', '[']).unwrap_or(tail.len());
            parts.id = Some(tail[..end].to_string());
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('.') {
            let end = tail.find(['#', '.', '[']).unwrap_or(tail.len());
            parts.classes.push(tail[..end].to_string());
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']')?;
            parts.attrs.push(parse_attr_term(&tail[..end])?);
            rest = &tail[end + 1..];
        } else {
            return None;
        }
    }
    Some(parts)
}

fn has_combinator_outside_brackets(selector: &str) -> bool {
    let mut depth = 0usize;
    for c in selector.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ' ' | '>' | '~' | '+' | ',' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

fn parse_attr_term(term: &str) -> Option<AttrMatch> {
    let term = term.trim();
    let (body, case_insensitive) = match term.strip_suffix(" i") {
        Some(body) => (body.trim(), true),
        None => (term, false),
    };
    for (token, op) in [
        ("*=", AttrOp::Contains),
        ("^=", AttrOp::StartsWith),
        ("=", AttrOp::Equals),
    ] {
        if let Some(idx) = body.find(token) {
            let name = body[..idx].trim().to_string();
            let value = strip_quotes(body[idx + token.len()..].trim());
            return Some(AttrMatch {
                name,
                op,
                value: Some(value),
                case_insensitive,
            });
        }
    }
    Some(AttrMatch {
        name: body.to_string(),
        op: AttrOp::Exists,
        value: None,
        case_insensitive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_common_forms() {
        for raw in [
            "input[aria-label=\"Search\"]",
            "role=button[name=\"Save\"]",
            "role=button[name=/save/i] >> nth=1",
            "button:has-text(\"Save\")",
            "[role=\"navigation\"] >> input[placeholder*=\"search\" i]",
            "#login-form",
            "role=textbox",
        ] {
            let locator = Locator::parse(raw).unwrap();
            assert_eq!(locator.to_string(), raw, "round trip of {raw}");
        }
    }

    #[test]
    fn scoping_prepends_the_landmark_chain() {
        let target = Locator::parse("input[placeholder*=\"search\" i]").unwrap();
        let landmark = Locator::parse("[aria-label=\"App Launcher\"]").unwrap();
        let scoped = target.scoped_under(&landmark);
        assert_eq!(
            scoped.to_string(),
            "[aria-label=\"App Launcher\"] >> input[placeholder*=\"search\" i]"
        );
    }

    #[test]
    fn raw_id_detection() {
        assert!(Locator::parse("#submit").unwrap().is_raw_id());
        assert!(!Locator::parse("button#submit").unwrap().is_raw_id());
        assert!(!Locator::parse("role=button[name=\"x\"]").unwrap().is_raw_id());
    }

    #[test]
    fn name_pattern_matching() {
        let exact = NamePattern::exact("Save");
        assert!(exact.matches("Save"));
        assert!(!exact.matches("save"));
        let relaxed = NamePattern::regex_ci("save");
        assert!(relaxed.matches("Save changes"));
        assert!(relaxed.matches("SAVE"));
        assert!(!relaxed.matches("discard"));
    }

    #[test]
    fn css_parts_cover_the_emitted_subset() {
        let parts = parse_css_parts("input[placeholder*=\"search\" i]").unwrap();
        assert_eq!(parts.tag.as_deref(), Some("input"));
        assert_eq!(parts.attrs.len(), 1);
        let attr = &parts.attrs[0];
        assert_eq!(attr.name, "placeholder");
        assert_eq!(attr.op, AttrOp::Contains);
        assert!(attr.case_insensitive);
        assert!(attr.matches(Some("Search everything")));
        assert!(!attr.matches(Some("query")));

        let parts = parse_css_parts("#login").unwrap();
        assert_eq!(parts.id.as_deref(), Some("login"));

        let parts = parse_css_parts(".g-recaptcha").unwrap();
        assert_eq!(parts.classes, vec!["g-recaptcha".to_string()]);

        let parts = parse_css_parts("[aria-label=\"App Launcher\"]").unwrap();
        assert!(parts.attrs[0].matches(Some("App Launcher")));

        assert!(parse_css_parts("div > span").is_none());
        assert!(parse_css_parts("a, b").is_none());
    }

    #[test]
    fn rejects_malformed_locators() {
        assert!(Locator::parse("").is_err());
        assert!(Locator::parse("nth=abc").is_err());
        assert!(Locator::parse("role=button[title=\"x\"]").is_err());
    }
}
