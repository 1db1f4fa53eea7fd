//! PEP 440 versions and version specifiers.
//!
//! Covers what lockfile pins and manifest constraints use in practice:
//! epochs, release segments, pre/post/dev releases, local labels, and the
//! `==`, `!=`, `<`, `<=`, `>`, `>=`, `~=`, `===` operators with `.*` wildcards.

use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreKind {
    Alpha,
    Beta,
    Rc,
}

impl PreKind {
    fn as_str(&self) -> &'static str {
        match self {
            PreKind::Alpha => "a",
            PreKind::Beta => "b",
            PreKind::Rc => "rc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreKind, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
    pub local: Option<String>,
}

impl Version {
    pub fn parse(input: &str) -> BuildliteResult<Self> {
        let invalid = || BuildliteError::Manifest(format!("invalid version '{}'", input));

        let lower = input.trim().to_ascii_lowercase();
        let mut s = lower.strip_prefix('v').unwrap_or(lower.as_str());

        let local = match s.split_once('+') {
            Some((head, local)) => {
                if local.is_empty()
                    || !local
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
                {
                    return Err(invalid());
                }
                s = head;
                Some(local.replace(['-', '_'], "."))
            }
            None => None,
        };

        let epoch = match s.split_once('!') {
            Some((epoch, rest)) => {
                s = rest;
                epoch.parse::<u64>().map_err(|_| invalid())?
            }
            None => 0,
        };

        let mut cursor = Cursor::new(s);
        let mut release = vec![cursor.number().ok_or_else(invalid)?];
        while cursor.peek() == Some('.') && cursor.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            cursor.bump();
            release.push(cursor.number().ok_or_else(invalid)?);
        }

        let mut pre = None;
        let mut post = None;
        let mut dev = None;

        // pre-release
        let save = cursor.pos;
        cursor.skip_separator();
        if let Some(kind) = cursor.pre_label() {
            cursor.skip_separator();
            pre = Some((kind, cursor.number().unwrap_or(0)));
        } else {
            cursor.pos = save;
        }

        // post-release: "-N" or ".postN"
        let save = cursor.pos;
        if cursor.peek() == Some('-') && cursor.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            cursor.bump();
            post = cursor.number();
        } else {
            cursor.skip_separator();
            if cursor.keyword(&["post", "rev", "r"]) {
                cursor.skip_separator();
                post = Some(cursor.number().unwrap_or(0));
            } else {
                cursor.pos = save;
            }
        }

        // dev-release
        let save = cursor.pos;
        cursor.skip_separator();
        if cursor.keyword(&["dev"]) {
            cursor.skip_separator();
            dev = Some(cursor.number().unwrap_or(0));
        } else {
            cursor.pos = save;
        }

        if !cursor.at_end() {
            return Err(invalid());
        }

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn is_postrelease(&self) -> bool {
        self.post.is_some()
    }

    /// Same version with the local label removed.
    pub fn without_local(&self) -> Self {
        Self {
            local: None,
            ..self.clone()
        }
    }

    fn release_at(&self, i: usize) -> u64 {
        self.release.get(i).copied().unwrap_or(0)
    }

    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        (0..len)
            .map(|i| self.release_at(i).cmp(&other.release_at(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    // dev-only releases sort before any pre-release of the same release
    fn pre_key(&self) -> (i8, u64) {
        match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (-1, 0),
            (Some((kind, n)), _, _) => (kind as i8, n),
            _ => (3, 0),
        }
    }

    fn dev_key(&self) -> (u8, u64) {
        match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        }
    }
}

/// One dot-separated piece of a local label. Numeric pieces sort above
/// alphanumeric ones.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LocalSegment<'a> {
    Alpha(&'a str),
    Number(u64),
}

impl<'a> From<&'a str> for LocalSegment<'a> {
    fn from(s: &'a str) -> Self {
        match s.parse() {
            Ok(n) => LocalSegment::Number(n),
            Err(_) => LocalSegment::Alpha(s),
        }
    }
}

/// Segment-wise; with an equal prefix the longer label is greater.
fn cmp_local(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .split('.')
            .map(LocalSegment::from)
            .cmp(b.split('.').map(LocalSegment::from)),
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.cmp_release(other))
            .then_with(|| self.pre_key().cmp(&other.pre_key()))
            .then_with(|| self.post.cmp(&other.post))
            .then_with(|| self.dev_key().cmp(&other.dev_key()))
            .then_with(|| cmp_local(self.local.as_deref(), other.local.as_deref()))
    }
}

impl FromStr for Version {
    type Err = BuildliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(|n| n.to_string()).collect();
        f.write_str(&release.join("."))?;
        if let Some((kind, n)) = self.pre {
            write!(f, "{}{}", kind.as_str(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        if let Some(local) = &self.local {
            write!(f, "+{}", local)?;
        }
        Ok(())
    }
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn number(&mut self) -> Option<u64> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if start == self.pos {
            return None;
        }
        self.chars[start..self.pos]
            .iter()
            .collect::<String>()
            .parse()
            .ok()
    }

    fn skip_separator(&mut self) {
        if matches!(self.peek(), Some('.' | '-' | '_')) {
            self.bump();
        }
    }

    fn keyword(&mut self, words: &[&str]) -> bool {
        for word in words {
            let len = word.chars().count();
            let candidate: String = self.chars.iter().skip(self.pos).take(len).collect();
            if candidate == *word {
                self.pos += len;
                return true;
            }
        }
        false
    }

    fn pre_label(&mut self) -> Option<PreKind> {
        // longest spellings first so "alpha" is not read as "a" + garbage
        let table: [(&str, PreKind); 8] = [
            ("preview", PreKind::Rc),
            ("alpha", PreKind::Alpha),
            ("beta", PreKind::Beta),
            ("pre", PreKind::Rc),
            ("rc", PreKind::Rc),
            ("a", PreKind::Alpha),
            ("b", PreKind::Beta),
            ("c", PreKind::Rc),
        ];
        table
            .iter()
            .find(|(word, _)| self.keyword(&[*word]))
            .map(|(_, kind)| *kind)
    }
}

// ============================================================================
// SPECIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    Equal,
    EqualStar,
    NotEqual,
    NotEqualStar,
    Compatible,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Arbitrary,
}

impl Operator {
    fn symbol(&self) -> &'static str {
        match self {
            Operator::Equal | Operator::EqualStar => "==",
            Operator::NotEqual | Operator::NotEqualStar => "!=",
            Operator::Compatible => "~=",
            Operator::LessThan => "<",
            Operator::LessThanEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanEqual => ">=",
            Operator::Arbitrary => "===",
        }
    }
}

/// A single clause such as `>=1.3` or `==2.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpecifier {
    pub operator: Operator,
    pub version: Version,
    raw_version: String,
}

impl VersionSpecifier {
    pub fn parse(input: &str) -> BuildliteResult<Self> {
        let s = input.trim();
        let invalid = || BuildliteError::Manifest(format!("invalid version specifier '{}'", s));

        let (operator, rest) = ["===", "==", "!=", "~=", "<=", ">=", "<", ">"]
            .iter()
            .find_map(|op| s.strip_prefix(op).map(|rest| (*op, rest.trim())))
            .ok_or_else(invalid)?;

        if rest.is_empty() {
            return Err(invalid());
        }

        let (operator, version_str) = match operator {
            "==" => match rest.strip_suffix(".*") {
                Some(prefix) => (Operator::EqualStar, prefix),
                None => (Operator::Equal, rest),
            },
            "!=" => match rest.strip_suffix(".*") {
                Some(prefix) => (Operator::NotEqualStar, prefix),
                None => (Operator::NotEqual, rest),
            },
            "~=" => (Operator::Compatible, rest),
            "<" => (Operator::LessThan, rest),
            "<=" => (Operator::LessThanEqual, rest),
            ">" => (Operator::GreaterThan, rest),
            ">=" => (Operator::GreaterThanEqual, rest),
            _ => (Operator::Arbitrary, rest),
        };

        let version = if operator == Operator::Arbitrary {
            // `===` compares strings; parse leniently so the clause stays usable
            Version::parse(version_str).unwrap_or(Version {
                epoch: 0,
                release: vec![0],
                pre: None,
                post: None,
                dev: None,
                local: None,
            })
        } else {
            Version::parse(version_str)?
        };

        if operator == Operator::Compatible && version.release.len() < 2 {
            return Err(BuildliteError::Manifest(format!(
                "'~=' requires at least two release segments: '{}'",
                s
            )));
        }

        Ok(Self {
            operator,
            version,
            raw_version: version_str.to_string(),
        })
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        let spec = &self.version;
        match self.operator {
            Operator::Equal => {
                if spec.local.is_some() {
                    candidate == spec
                } else {
                    candidate.without_local() == *spec
                }
            }
            Operator::NotEqual => !Self::new_unchecked(Operator::Equal, spec).contains(candidate),
            Operator::EqualStar => prefix_match(candidate, spec),
            Operator::NotEqualStar => !prefix_match(candidate, spec),
            Operator::Compatible => {
                let mut prefix = spec.clone();
                prefix.release.pop();
                prefix.pre = None;
                prefix.post = None;
                prefix.dev = None;
                candidate >= spec && prefix_match(candidate, &prefix)
            }
            Operator::LessThanEqual => candidate.without_local() <= *spec,
            Operator::GreaterThanEqual => candidate.without_local() >= *spec,
            Operator::LessThan => {
                let candidate = candidate.without_local();
                if candidate >= *spec {
                    return false;
                }
                // <V excludes pre-releases of V itself unless V is one
                !(!spec.is_prerelease()
                    && candidate.is_prerelease()
                    && candidate.cmp_release(spec).is_eq()
                    && candidate.epoch == spec.epoch)
            }
            Operator::GreaterThan => {
                let candidate = candidate.without_local();
                if candidate <= *spec {
                    return false;
                }
                // >V excludes post-releases of V itself unless V is one
                !(!spec.is_postrelease()
                    && candidate.is_postrelease()
                    && candidate.cmp_release(spec).is_eq()
                    && candidate.pre == spec.pre
                    && candidate.epoch == spec.epoch)
            }
            Operator::Arbitrary => candidate.to_string() == self.raw_version,
        }
    }

    fn new_unchecked(operator: Operator, version: &Version) -> Self {
        Self {
            operator,
            version: version.clone(),
            raw_version: version.to_string(),
        }
    }
}

fn prefix_match(candidate: &Version, prefix: &Version) -> bool {
    if candidate.epoch != prefix.epoch {
        return false;
    }
    let release_ok = prefix
        .release
        .iter()
        .enumerate()
        .all(|(i, n)| candidate.release_at(i) == *n);
    if !release_ok {
        return false;
    }
    // ==1.0rc1.* style prefixes also pin the pre-release
    prefix.pre.is_none() || candidate.pre == prefix.pre
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.operator {
            Operator::EqualStar | Operator::NotEqualStar => ".*",
            _ => "",
        };
        write!(f, "{}{}{}", self.operator.symbol(), self.raw_version, suffix)
    }
}

/// Comma-separated conjunction of specifiers. Empty means "any version".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecifierSet {
    specifiers: Vec<VersionSpecifier>,
}

impl SpecifierSet {
    pub fn parse(input: &str) -> BuildliteResult<Self> {
        let specifiers = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(VersionSpecifier::parse)
            .collect::<BuildliteResult<Vec<_>>>()?;
        Ok(Self { specifiers })
    }

    pub fn is_empty(&self) -> bool {
        self.specifiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionSpecifier> {
        self.specifiers.iter()
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        self.specifiers.iter().all(|s| s.contains(candidate))
    }

    /// Clauses sorted, so `<2,>=1` and `>=1,<2` compare equal.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        parts.sort();
        parts.join(",")
    }
}

impl fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn set(s: &str) -> SpecifierSet {
        SpecifierSet::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(v("1.2.0").to_string(), "1.2.0");
        assert_eq!(v("v1.0-alpha.2").to_string(), "1.0a2");
        assert_eq!(v("2!1.0.post1.dev3+ubuntu-1").to_string(), "2!1.0.post1.dev3+ubuntu.1");
        assert_eq!(v("1.0-1").post, Some(1));
        assert!(Version::parse("1.0x").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_ordering() {
        let ordered = [
            "1.0.dev1", "1.0a1", "1.0a2.dev1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0+local",
            "1.0.post1", "1.1",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert_eq!(v("1.0"), v("1.0.0"));
        assert!(v("1!0.1") > v("99.0"));
    }

    #[test]
    fn test_local_label_ordering() {
        assert!(v("1.0+10") > v("1.0+9"));
        assert!(v("1.0+cu121") < v("1.0+cu13"));
        assert!(v("1.0+1") > v("1.0+abc"));
        assert!(v("1.0+ubuntu.2") > v("1.0+ubuntu"));
        assert!(v("1.0+ubuntu.10") > v("1.0+ubuntu.9"));
        assert_eq!(v("1.0+Ubuntu-01"), v("1.0+ubuntu.1"));
    }

    #[test]
    fn test_specifiers() {
        assert!(set(">=1.0").contains(&v("1.2.0")));
        assert!(!set(">=1.3").contains(&v("1.1.0")));
        assert!(set("==1.2.0").contains(&v("1.2")));
        assert!(set("==1.2.0").contains(&v("1.2.0+cpu")));
        assert!(set("==1.*").contains(&v("1.9.3")));
        assert!(!set("!=1.*").contains(&v("1.9.3")));
        assert!(set("~=2.2").contains(&v("2.9")));
        assert!(!set("~=2.2").contains(&v("3.0")));
        assert!(!set("~=1.4.5").contains(&v("1.5.0")));
        assert!(set(">=0.37.2,<0.39.0").contains(&v("0.38.6")));
        assert!(!set("<2.0").contains(&v("2.0rc1")));
        assert!(set("<2.0rc2").contains(&v("2.0rc1")));
        assert!(!set(">1.0").contains(&v("1.0.post1")));
        assert!(set("").contains(&v("0.0.1")));
    }

    #[test]
    fn test_compatible_requires_two_segments() {
        assert!(VersionSpecifier::parse("~=1").is_err());
    }

    #[test]
    fn test_canonical_is_order_independent() {
        assert_eq!(set("<2, >=1").canonical(), set(">=1,<2").canonical());
    }
}
