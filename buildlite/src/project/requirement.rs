//! PEP 508 requirement strings (`fastapi[all]>=0.110,<1; python_version >= "3.8"`).

use super::marker::{MarkerEnvironment, MarkerExpr};
use super::name::PackageName;
use super::version::SpecifierSet;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: PackageName,
    pub extras: BTreeSet<String>,
    pub specifiers: SpecifierSet,
    pub url: Option<String>,
    pub marker: Option<MarkerExpr>,
}

impl Requirement {
    pub fn parse(input: &str) -> BuildliteResult<Self> {
        let invalid =
            |msg: &str| BuildliteError::Manifest(format!("invalid requirement '{}': {}", input, msg));

        let (head, marker) = match input.split_once(';') {
            Some((head, marker)) => (head.trim(), Some(MarkerExpr::parse(marker.trim())?)),
            None => (input.trim(), None),
        };

        let name_end = head
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(head.len());
        if name_end == 0 {
            return Err(invalid("missing package name"));
        }
        let name = PackageName::new(&head[..name_end]);
        let mut rest = head[name_end..].trim_start();

        let mut extras = BTreeSet::new();
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed extras"))?;
            extras = after[..close]
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(|e| PackageName::new(e).to_string())
                .collect();
            rest = after[close + 1..].trim_start();
        }

        let mut url = None;
        let mut specifiers = SpecifierSet::default();
        if let Some(direct) = rest.strip_prefix('@') {
            let direct = direct.trim();
            if direct.is_empty() {
                return Err(invalid("empty direct reference"));
            }
            url = Some(direct.to_string());
        } else {
            let spec = rest
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .unwrap_or(rest);
            specifiers = SpecifierSet::parse(spec)?;
        }

        Ok(Self {
            name,
            extras,
            specifiers,
            url,
            marker,
        })
    }

    /// Whether this requirement applies to the given environment.
    pub fn applies(&self, env: &MarkerEnvironment) -> bool {
        self.marker.as_ref().is_none_or(|m| m.evaluate(env))
    }
}

impl FromStr for Requirement {
    type Err = BuildliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Requirement::parse(s)
    }
}

/// Canonical form: normalized name, sorted extras and clauses.
impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_str())?;
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(String::as_str).collect();
            write!(f, "[{}]", extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {}", url)?;
        } else {
            f.write_str(&self.specifiers.canonical())?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}
