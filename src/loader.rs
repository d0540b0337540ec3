use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::ReconcileError;
use crate::filters::FilterSetting;
use crate::rules::Rule;

/// Rule file extensions understood by [`parse_rule_file`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "txt"];

/// One directory entry in a rule directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFileEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Where rule files come from. Paths are relative to the source's root.
pub trait RuleSource: Send + Sync {
    /// Entries of `dir`, sorted by name.
    fn list(&self, dir: &Path) -> Result<Vec<RuleFileEntry>, ReconcileError>;
    fn read(&self, path: &Path) -> Result<String, ReconcileError>;
}

/// A parsed rule file.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFile {
    pub rules: Rule,
    pub description: Option<String>,
    pub filters: BTreeMap<String, FilterSetting>,
    pub metadata: BTreeMap<String, String>,
    pub modifiers: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default)]
    description: Option<String>,
    rules: Option<Value>,
    #[serde(default)]
    filters: BTreeMap<String, FilterSetting>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    modifiers: BTreeMap<String, Value>,
}

/// Parse rule file text, choosing the front-end by the extension of `path`.
pub fn parse_rule_file(path: &Path, text: &str) -> Result<RuleFile, ReconcileError> {
    let origin = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let document: RuleDocument = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(text)
            .map_err(|e| ReconcileError::rule(&origin, format!("invalid YAML: {e}")))?,
        "json" => serde_json::from_str(text)
            .map_err(|e| ReconcileError::rule(&origin, format!("invalid JSON: {e}")))?,
        "txt" => parse_text(text, &origin)?,
        other => {
            return Err(ReconcileError::rule(
                &origin,
                format!("unsupported file extension '{other}'"),
            ));
        }
    };

    let rules = document
        .rules
        .ok_or_else(|| ReconcileError::rule(&origin, "missing 'rules'"))?;

    let mut metadata = BTreeMap::new();
    for (key, value) in document.metadata {
        let value = match value {
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(ReconcileError::rule(
                    &origin,
                    format!("metadata '{key}' must be a scalar"),
                ));
            }
        };
        metadata.insert(key, value);
    }

    Ok(RuleFile {
        rules: Rule::parse(&rules, &origin)?,
        description: document.description,
        filters: document.filters,
        metadata,
        modifiers: document.modifiers,
    })
}

static TEXT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w-]+)\s*(!=|&=|=)\s*(.*?)\s*$").expect("valid regex"));

/// The flat text format.
///
/// ```text
/// description = Engineering managers
/// username = alice
/// group = teams/managers
/// username != bob
/// attribute &= location=remote
/// username = carol; expiration = 2030-01-01
/// filter_contractors = none
/// metadata_owner = platform
/// modifier_expiration = 2031-01-01
/// ```
fn parse_text(text: &str, origin: &str) -> Result<RuleDocument, ReconcileError> {
    let mut document = RuleDocument {
        description: None,
        rules: None,
        filters: BTreeMap::new(),
        metadata: BTreeMap::new(),
        modifiers: BTreeMap::new(),
    };
    let mut include = Vec::new();
    let mut require = Vec::new();
    let mut exclude = Vec::new();

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(caps) = TEXT_LINE.captures(line) else {
            return Err(ReconcileError::rule(
                origin,
                format!("line {}: cannot parse '{line}'", number + 1),
            ));
        };
        let (key, op, value) = (&caps[1], &caps[2], &caps[3]);
        let plain = |what: &str| -> Result<(), ReconcileError> {
            if op == "=" {
                Ok(())
            } else {
                Err(ReconcileError::rule(
                    origin,
                    format!("line {}: {what} only supports '='", number + 1),
                ))
            }
        };

        if key == "description" {
            plain("description")?;
            document.description = Some(value.to_string());
        } else if let Some(name) = key.strip_prefix("metadata_") {
            plain("metadata")?;
            document.metadata.insert(name.to_string(), json!(value));
        } else if let Some(name) = key.strip_prefix("filter_") {
            plain("filter")?;
            let setting = serde_json::from_value(json!(value)).map_err(|e| {
                ReconcileError::rule(origin, format!("line {}: {e}", number + 1))
            })?;
            document.filters.insert(name.to_string(), setting);
        } else if let Some(name) = key.strip_prefix("modifier_") {
            plain("modifier")?;
            document.modifiers.insert(name.to_string(), json!(value));
        } else {
            let condition = text_condition(key, value, origin, number + 1)?;
            match op {
                "=" => include.push(condition),
                "&=" => require.push(condition),
                _ => exclude.push(condition),
            }
        }
    }

    document.rules = Some(if include.is_empty() && require.is_empty() {
        Value::Object(Map::new())
    } else {
        let mut parts = Vec::new();
        if !include.is_empty() {
            parts.push(json!({ "or": include }));
        }
        parts.extend(require);
        if !exclude.is_empty() {
            parts.push(json!({ "not": { "or": exclude } }));
        }
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            json!({ "and": parts })
        }
    });
    Ok(document)
}

fn text_condition(
    method: &str,
    value: &str,
    origin: &str,
    line: usize,
) -> Result<Value, ReconcileError> {
    let mut parts = value.split(';');
    let key = parts.next().unwrap_or_default().trim();
    if key.is_empty() {
        return Err(ReconcileError::rule(
            origin,
            format!("line {line}: '{method}' has no value"),
        ));
    }
    let mut condition = Map::new();
    condition.insert("key".to_string(), json!(key));
    for option in parts {
        match option.split_once('=') {
            Some((name, date)) if name.trim() == "expiration" => {
                condition.insert("expiration".to_string(), json!(date.trim()));
            }
            _ => {
                return Err(ReconcileError::rule(
                    origin,
                    format!("line {line}: unknown option '{}'", option.trim()),
                ));
            }
        }
    }
    let mut node = Map::new();
    node.insert(method.to_string(), Value::Object(condition));
    Ok(Value::Object(node))
}

/// Reads rule files from the file system below `root`.
#[derive(Debug, Clone)]
pub struct FsRuleSource {
    root: PathBuf,
}

impl FsRuleSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FsRuleSource { root: root.into() }
    }
}

impl RuleSource for FsRuleSource {
    fn list(&self, dir: &Path) -> Result<Vec<RuleFileEntry>, ReconcileError> {
        let full = self.root.join(dir);
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&full)
            .map_err(|e| ReconcileError::Io(format!("{}: {e}", full.display())))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(RuleFileEntry {
                path: dir.join(&name),
                is_dir: entry.file_type()?.is_dir(),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &Path) -> Result<String, ReconcileError> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full)
            .map_err(|e| ReconcileError::Io(format!("{}: {e}", full.display())))
    }
}

/// Rule files held in memory, counting reads per path.
#[derive(Debug, Default)]
pub struct MemoryRuleSource {
    files: RwLock<BTreeMap<PathBuf, String>>,
    dirs: RwLock<BTreeSet<PathBuf>>,
    reads: Mutex<HashMap<PathBuf, usize>>,
}

impl MemoryRuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let source = Self::new();
        for (path, text) in files {
            source.insert(path, text);
        }
        source
    }

    pub fn insert<P: Into<PathBuf>, S: Into<String>>(&self, path: P, text: S) {
        if let Ok(mut files) = self.files.write() {
            files.insert(path.into(), text.into());
        }
    }

    /// Register a directory that exists even while it holds no files.
    pub fn insert_dir<P: Into<PathBuf>>(&self, path: P) {
        if let Ok(mut dirs) = self.dirs.write() {
            dirs.insert(path.into());
        }
    }

    /// How many times `path` was read.
    pub fn read_count<P: AsRef<Path>>(&self, path: P) -> usize {
        self.reads
            .lock()
            .map(|r| r.get(path.as_ref()).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl RuleSource for MemoryRuleSource {
    fn list(&self, dir: &Path) -> Result<Vec<RuleFileEntry>, ReconcileError> {
        let files = self.files.read()?;
        let mut entries: BTreeMap<String, RuleFileEntry> = BTreeMap::new();
        for path in files.keys() {
            let Ok(rest) = path.strip_prefix(dir) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let name = first.as_os_str().to_string_lossy().to_string();
            let is_dir = components.next().is_some();
            entries.entry(name.clone()).or_insert(RuleFileEntry {
                path: dir.join(&name),
                name,
                is_dir,
            });
        }
        if entries.is_empty() && !self.dirs.read()?.contains(dir) {
            return Err(ReconcileError::Io(format!(
                "{}: no such directory",
                dir.display()
            )));
        }
        Ok(entries.into_values().collect())
    }

    fn read(&self, path: &Path) -> Result<String, ReconcileError> {
        *self
            .reads
            .lock()?
            .entry(path.to_path_buf())
            .or_insert(0) += 1;
        self.files
            .read()?
            .get(path)
            .cloned()
            .ok_or_else(|| ReconcileError::Io(format!("{}: no such file", path.display())))
    }
}
