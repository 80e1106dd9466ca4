//! Version normalization and comparison
//!
//! Upstream registries and the deployed manifest spell the same release in different
//! ways (`2.9.0-build981` vs `2.9.0-b981`). Every raw version is reduced to a
//! [`NormalizedVersion`] through a table of rewrite rules, and equality and ordering
//! are defined on that normalized form.

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Strings matching this grammar are rewritten; anything else is its own normal form.
static VERSION_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^v?\d+(?:\.\d+)*(?:[-+_.]?[0-9a-z][0-9a-z.+_-]*)?$").expect("valid regex")
});

/// Pre-release markers in raw upstream text
static PRERELEASE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z])(?:snapshot|alpha|beta|rc|pre|dev|nightly)(?:$|[^a-z])")
        .expect("valid regex")
});

/// `<release>` then an optional remainder holding build number and suffix
static NORMALIZED_PARTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)*)(.*)$").expect("valid regex"));

static BUILD_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-b(\d+)(?:$|[-.+])").expect("valid regex"));

struct RewriteRule {
    pattern: Regex,
    replacement: &'static str,
}

impl RewriteRule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("valid rewrite pattern"),
            replacement,
        }
    }
}

/// Known cosmetic variants, applied in order to the trimmed, lowercased text.
/// Extend by adding a row.
static REWRITE_RULES: LazyLock<Vec<RewriteRule>> = LazyLock::new(|| {
    vec![
        // v2.9.0 -> 2.9.0
        RewriteRule::new(r"^v(\d)", "$1"),
        // 2.9.0-build981, 2.9.0_build981, 2.9.0+build.981, 2.9.0build981 -> 2.9.0-b981
        RewriteRule::new(r"[-+_.]?build[-_.]?(\d+)", "-b$1"),
        // 2.9.0+b981, 2.9.0.b981, 2.9.0_b981 -> 2.9.0-b981
        RewriteRule::new(r"[+_.]b(\d+)($|[-.+])", "-b$1$2"),
        // 5.2.1.snapshot, 5.2.1_snapshot, 5.2.1snapshot -> 5.2.1-snapshot
        RewriteRule::new(r"[-+_.]?snapshot", "-snapshot"),
    ]
});

/// Release channel derived from the raw version text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stable,
    PreRelease,
}

/// Opaque upstream version text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionString(String);

impl VersionString {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> NormalizedVersion {
        normalize(self)
    }

    pub fn channel(&self) -> Channel {
        channel(self)
    }

    /// Same release once cosmetic naming differences are removed
    pub fn is_equivalent(&self, other: &VersionString) -> bool {
        self.normalized() == other.normalized()
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionString {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Canonical, comparable form of a [`VersionString`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedVersion(String);

impl NormalizedVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for NormalizedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialOrd for NormalizedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reduce a raw version to its canonical form. Never fails: unrecognized text is
/// returned unchanged.
pub fn normalize(raw: &VersionString) -> NormalizedVersion {
    let trimmed = raw.raw().trim();
    if !VERSION_GRAMMAR.is_match(trimmed) {
        return NormalizedVersion(raw.raw().to_string());
    }

    let mut text = trimmed.to_lowercase();
    for rule in REWRITE_RULES.iter() {
        text = rule.pattern.replace_all(&text, rule.replacement).into_owned();
    }
    NormalizedVersion(text)
}

/// Derive the release channel from raw text
pub fn channel(raw: &VersionString) -> Channel {
    if PRERELEASE_MARKER.is_match(raw.raw()) {
        Channel::PreRelease
    } else {
        Channel::Stable
    }
}

/// True iff the candidate is a different release and its channel is admitted
pub fn is_update_available(
    current: &VersionString,
    candidate: &VersionString,
    include_prerelease: bool,
) -> bool {
    current.normalized() != candidate.normalized()
        && (include_prerelease || candidate.channel() == Channel::Stable)
}

#[derive(Debug, PartialEq, Eq)]
struct VersionParts<'a> {
    release: Vec<u64>,
    build: Option<u64>,
    suffix: Option<String>,
    text: &'a str,
}

fn parse_parts(version: &NormalizedVersion) -> Option<VersionParts<'_>> {
    let caps = NORMALIZED_PARTS.captures(version.as_str())?;
    let release = caps[1]
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let (build, rest) = match BUILD_TOKEN.captures(rest) {
        Some(build_caps) => {
            let whole = build_caps.get(0)?;
            let build = build_caps[1].parse::<u64>().ok()?;
            let mut remainder = String::with_capacity(rest.len());
            remainder.push_str(&rest[..whole.start()]);
            remainder.push_str(&rest[whole.end()..]);
            (Some(build), remainder)
        }
        None => (None, rest.to_string()),
    };

    let suffix = rest.trim_matches(|c| matches!(c, '-' | '.' | '+' | '_'));
    Some(VersionParts {
        release,
        build,
        suffix: (!suffix.is_empty()).then(|| suffix.to_string()),
        text: version.as_str(),
    })
}

fn semver_core(release: &[u64]) -> semver::Version {
    semver::Version::new(
        release.first().copied().unwrap_or(0),
        release.get(1).copied().unwrap_or(0),
        release.get(2).copied().unwrap_or(0),
    )
}

fn compare_suffix(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        // A release outranks any pre-release of the same version
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (semver::Prerelease::new(a), semver::Prerelease::new(b)) {
            (Ok(pa), Ok(pb)) => pa.cmp(&pb),
            _ => a.cmp(b),
        },
    }
}

/// Total order over normalized versions: release by semantic precedence, then
/// pre-release suffix, then build number. Forms that do not parse compare lexically.
pub fn compare(a: &NormalizedVersion, b: &NormalizedVersion) -> Ordering {
    let (pa, pb) = match (parse_parts(a), parse_parts(b)) {
        (Some(pa), Some(pb)) => (pa, pb),
        _ => return a.as_str().cmp(b.as_str()),
    };

    let len = pa.release.len().max(pb.release.len());
    let extra = |parts: &VersionParts<'_>, i: usize| parts.release.get(i).copied().unwrap_or(0);

    semver_core(&pa.release)
        .cmp(&semver_core(&pb.release))
        .then_with(|| {
            (3..len)
                .map(|i| extra(&pa, i).cmp(&extra(&pb, i)))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| compare_suffix(&pa.suffix, &pb.suffix))
        .then_with(|| pa.build.cmp(&pb.build))
        // Keeps Ord consistent with Eq for spellings like 2.9 vs 2.9.0
        .then_with(|| pa.text.cmp(pb.text))
}

/// How candidates are admitted during version resolution.
///
/// The two switches are independent: admitting pre-releases does not force
/// reinstalls, and forcing reinstalls does not admit pre-releases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Consider candidates on the pre-release channel
    pub include_prerelease: bool,

    /// Treat a candidate whose raw text differs from the installed raw text as an
    /// update even when both normalize to the same version
    pub bypass_noop_suppression: bool,
}

impl UpdatePolicy {
    /// Decide whether `candidate` should replace what is installed
    pub fn needs_update(&self, installed: Option<&VersionString>, candidate: &VersionString) -> bool {
        if !self.include_prerelease && candidate.channel() == Channel::PreRelease {
            return false;
        }
        match installed {
            None => true,
            Some(current) => {
                is_update_available(current, candidate, self.include_prerelease)
                    || (self.bypass_noop_suppression && current.raw() != candidate.raw())
            }
        }
    }
}
