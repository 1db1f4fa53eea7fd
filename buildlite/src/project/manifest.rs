//! Project manifest (`pyproject.toml`).
//!
//! Only the parts that drive dependency installation are read:
//! - `[project]`: name, version, requires-python, dependencies, optional-dependencies, scripts
//! - `[dependency-groups]` (PEP 735) and `[tool.pdm.dev-dependencies]`: development groups
//! - `[[tool.pdm.source]]`: package indexes

use super::name::PackageName;
use super::requirement::Requirement;
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct PyProjectToml {
    project: Option<RawProject>,
    #[serde(rename = "dependency-groups", default)]
    dependency_groups: BTreeMap<String, Vec<GroupEntry>>,
    #[serde(default)]
    tool: RawTool,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    name: String,
    version: Option<String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(rename = "optional-dependencies", default)]
    optional_dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dynamic: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTool {
    #[serde(default)]
    pdm: RawPdm,
}

#[derive(Debug, Default, Deserialize)]
struct RawPdm {
    #[serde(rename = "dev-dependencies", default)]
    dev_dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    source: Vec<PackageSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum GroupEntry {
    Requirement(String),
    Include {
        #[serde(rename = "include-group")]
        include_group: String,
    },
}

/// A package index declared in `[[tool.pdm.source]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSource {
    pub name: String,
    pub url: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

/// The manifest tables a lockfile's content hash covers, as written: group
/// names are not normalized and `include-group` entries are not expanded.
#[derive(Debug, Clone)]
pub(crate) struct HashSections {
    pub sources: serde_json::Value,
    pub dependencies: Vec<String>,
    pub dev_dependencies: serde_json::Map<String, serde_json::Value>,
    pub optional_dependencies: serde_json::Value,
    pub overrides: serde_json::Value,
}

impl HashSections {
    fn from_document(doc: &toml::Table, dependencies: &[String]) -> BuildliteResult<Self> {
        let project = doc.get("project");
        let pdm = doc.get("tool").and_then(|t| t.get("pdm"));
        let table = |value: Option<&toml::Value>| -> BuildliteResult<serde_json::Value> {
            Ok(match value {
                Some(v) => serde_json::to_value(v)?,
                None => serde_json::Value::Object(Default::default()),
            })
        };

        let sources = match pdm.and_then(|p| p.get("source")) {
            Some(v) => serde_json::to_value(v)?,
            None => serde_json::Value::Array(Vec::new()),
        };

        // `[dependency-groups]` first, then the legacy PDM table merged into
        // the group of the same name.
        let mut dev_dependencies = match table(doc.get("dependency-groups"))? {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        };
        if let serde_json::Value::Object(legacy) =
            table(pdm.and_then(|p| p.get("dev-dependencies")))?
        {
            for (group, entries) in legacy {
                let merged = dev_dependencies
                    .entry(group)
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                if let (serde_json::Value::Array(merged), serde_json::Value::Array(entries)) =
                    (merged, entries)
                {
                    for entry in entries {
                        if !merged.contains(&entry) {
                            merged.push(entry);
                        }
                    }
                }
            }
        }

        Ok(Self {
            sources,
            dependencies: dependencies.to_vec(),
            dev_dependencies,
            optional_dependencies: table(project.and_then(|p| p.get("optional-dependencies")))?,
            overrides: table(
                pdm.and_then(|p| p.get("resolution"))
                    .and_then(|r| r.get("overrides")),
            )?,
        })
    }
}

/// Parsed project manifest.
#[derive(Debug, Clone)]
pub struct ProjectManifest {
    pub name: PackageName,
    pub display_name: String,
    pub version: Option<String>,
    pub requires_python: Option<String>,
    pub dependencies: Vec<Requirement>,
    pub optional_dependencies: BTreeMap<String, Vec<Requirement>>,
    /// Development-only groups, never installed in production.
    pub dev_groups: BTreeMap<String, Vec<Requirement>>,
    pub scripts: BTreeMap<String, String>,
    pub sources: Vec<PackageSource>,
    pub(crate) hash_sections: HashSections,
}

impl ProjectManifest {
    pub fn load(path: &Path) -> BuildliteResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildliteError::Manifest(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> BuildliteResult<Self> {
        let parse_err = |e: toml::de::Error| {
            BuildliteError::Manifest(format!("Failed to parse pyproject.toml: {}", e))
        };
        let doc: toml::Table = toml::from_str(content).map_err(parse_err)?;
        let raw: PyProjectToml = toml::from_str(content).map_err(parse_err)?;

        let project = raw
            .project
            .ok_or_else(|| BuildliteError::Manifest("missing [project] table".into()))?;

        if project.dynamic.iter().any(|d| d == "dependencies") {
            return Err(BuildliteError::Manifest(
                "dynamic dependencies cannot be locked; declare them in [project]".into(),
            ));
        }

        let dependencies = parse_all(&project.dependencies)?;
        let hash_sections = HashSections::from_document(&doc, &project.dependencies)?;

        let mut optional_dependencies = BTreeMap::new();
        for (extra, reqs) in &project.optional_dependencies {
            optional_dependencies.insert(PackageName::new(extra).to_string(), parse_all(reqs)?);
        }

        let mut expanded_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (group, reqs) in &raw.tool.pdm.dev_dependencies {
            expanded_groups
                .entry(PackageName::new(group).to_string())
                .or_default()
                .extend(reqs.iter().cloned());
        }
        for group in raw.dependency_groups.keys() {
            let expanded = expand_group(group, &raw.dependency_groups, &mut BTreeSet::new())?;
            expanded_groups
                .entry(PackageName::new(group).to_string())
                .or_default()
                .extend(expanded);
        }

        let mut dev_groups = BTreeMap::new();
        for (group, reqs) in &expanded_groups {
            dev_groups.insert(group.clone(), parse_all(reqs)?);
        }

        Ok(Self {
            name: PackageName::new(&project.name),
            display_name: project.name,
            version: project.version,
            requires_python: project.requires_python,
            dependencies,
            optional_dependencies,
            dev_groups,
            scripts: project.scripts,
            sources: raw.tool.pdm.source,
            hash_sections,
        })
    }

    /// Requirements installed in production: the default group plus any
    /// requested extras.
    pub fn production_requirements(&self, extras: &[String]) -> BuildliteResult<Vec<&Requirement>> {
        let mut reqs: Vec<&Requirement> = self.dependencies.iter().collect();
        for extra in extras {
            let key = PackageName::new(extra).to_string();
            let group = self.optional_dependencies.get(&key).ok_or_else(|| {
                BuildliteError::Config(format!(
                    "extra '{}' is not declared in [project.optional-dependencies]",
                    extra
                ))
            })?;
            reqs.extend(group.iter());
        }
        Ok(reqs)
    }
}

fn parse_all(reqs: &[String]) -> BuildliteResult<Vec<Requirement>> {
    reqs.iter().map(|r| Requirement::parse(r)).collect()
}

fn expand_group(
    group: &str,
    groups: &BTreeMap<String, Vec<GroupEntry>>,
    visiting: &mut BTreeSet<String>,
) -> BuildliteResult<Vec<String>> {
    if !visiting.insert(group.to_string()) {
        return Err(BuildliteError::Manifest(format!(
            "dependency group '{}' includes itself",
            group
        )));
    }

    let entries = groups
        .iter()
        .find(|(name, _)| PackageName::new(name) == PackageName::new(group))
        .map(|(_, entries)| entries)
        .ok_or_else(|| {
            BuildliteError::Manifest(format!("included dependency group '{}' does not exist", group))
        })?;

    let mut out = Vec::new();
    for entry in entries {
        match entry {
            GroupEntry::Requirement(req) => out.push(req.clone()),
            GroupEntry::Include { include_group } => {
                out.extend(expand_group(include_group, groups, visiting)?)
            }
        }
    }

    visiting.remove(group);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYPROJECT: &str = r#"
[project]
name = "Quarto_Backend"
version = "0.1.0"
requires-python = ">=3.12"
dependencies = [
    "fastapi>=0.115",
    "python-socketio>=5.11",
    "uvicorn[standard]>=0.30",
]

[project.optional-dependencies]
postgres = ["asyncpg>=0.29"]

[project.scripts]
quarto = "quarto_backend.cli:main"

[dependency-groups]
test = ["pytest>=8.0"]
lint = ["ruff>=0.5", { include-group = "test" }]

[tool.pdm.dev-dependencies]
dev = ["mypy>=1.10"]

[[tool.pdm.source]]
name = "internal"
url = "https://pypi.example.com/simple"
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = ProjectManifest::from_toml(PYPROJECT).unwrap();
        assert_eq!(manifest.name.as_str(), "quarto-backend");
        assert_eq!(manifest.dependencies.len(), 3);
        assert_eq!(manifest.optional_dependencies["postgres"].len(), 1);
        assert_eq!(manifest.scripts["quarto"], "quarto_backend.cli:main");
        assert_eq!(manifest.sources[0].name, "internal");
        assert!(manifest.sources[0].verify_ssl);
    }

    #[test]
    fn test_groups_are_expanded() {
        let manifest = ProjectManifest::from_toml(PYPROJECT).unwrap();
        let lint: Vec<String> = manifest.dev_groups["lint"]
            .iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(lint, vec!["ruff", "pytest"]);
        assert!(manifest.dev_groups.contains_key("dev"));
        assert!(manifest.dev_groups.contains_key("test"));
    }

    #[test]
    fn test_production_requirements() {
        let manifest = ProjectManifest::from_toml(PYPROJECT).unwrap();
        assert_eq!(manifest.production_requirements(&[]).unwrap().len(), 3);
        assert_eq!(
            manifest
                .production_requirements(&["postgres".into()])
                .unwrap()
                .len(),
            4
        );
        assert!(manifest.production_requirements(&["nope".into()]).is_err());
    }

    #[test]
    fn test_missing_project_table() {
        let err = ProjectManifest::from_toml("[tool.pdm]\n").unwrap_err();
        assert!(matches!(err, BuildliteError::Manifest(_)));
    }

    #[test]
    fn test_cyclic_group() {
        let toml = r#"
[project]
name = "x"
[dependency-groups]
a = [{ include-group = "b" }]
b = [{ include-group = "a" }]
"#;
        assert!(ProjectManifest::from_toml(toml).is_err());
    }
}
