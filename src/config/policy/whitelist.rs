/// Call whitelist
///
/// A [`CallPolicy`] is an immutable set of permitted external callables,
/// consulted once per call site while sandboxed code is rewritten.
///
/// Textual format: one signature per line, `Owner.name(type,type)`.
/// Constructors are written `Owner.<init>(type)`. Blank lines and lines
/// starting with `#` are ignored. Lines are additive to the default
/// baseline unless the policy is parsed with [`CallPolicy::parse_exact`].
use crate::config::types::{GradeError, Result};
use crate::unit::CONSTRUCTOR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// One permitted callable
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub owner: String,
    pub name: String,
    pub params: Vec<String>,
}

impl Signature {
    pub fn new(owner: &str, name: &str, params: &[&str]) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parse a single `Owner.name(a,b)` line
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let open = line
            .find('(')
            .ok_or_else(|| "missing '(' in signature".to_string())?;
        if !line.ends_with(')') {
            return Err("signature must end with ')'".to_string());
        }
        let qualified = &line[..open];
        let dot = qualified
            .rfind('.')
            .ok_or_else(|| "missing owner type before callable name".to_string())?;
        let owner = qualified[..dot].trim();
        let name = qualified[dot + 1..].trim();
        if owner.is_empty() || name.is_empty() {
            return Err("empty owner or callable name".to_string());
        }
        if owner.contains(char::is_whitespace) || name.contains(char::is_whitespace) {
            return Err("whitespace inside qualified name".to_string());
        }

        let inner = line[open + 1..line.len() - 1].trim();
        let params: Vec<String> = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(|p| p.trim().to_string()).collect()
        };
        if params.iter().any(|p| p.is_empty() || p.contains(&['(', ')'][..])) {
            return Err("malformed parameter list".to_string());
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            params,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.owner, self.name, self.params.join(","))
    }
}

/// Default baseline: arithmetic, strings, console, sleeping, randomness and
/// the standard exception constructors. No file system, environment or
/// process access.
const DEFAULT_ENTRIES: &[(&str, &str, &[&str])] = &[
    ("std.Math", "abs", &["int"]),
    ("std.Math", "abs", &["double"]),
    ("std.Math", "max", &["int", "int"]),
    ("std.Math", "min", &["int", "int"]),
    ("std.Math", "sqrt", &["double"]),
    ("std.Math", "pow", &["double", "double"]),
    ("std.Math", "floor", &["double"]),
    ("std.String", "length", &["std.String"]),
    ("std.String", "charAt", &["std.String", "int"]),
    ("std.String", "substring", &["std.String", "int", "int"]),
    ("std.String", "equals", &["std.String", "std.String"]),
    ("std.String", "valueOf", &["int"]),
    ("std.String", "valueOf", &["double"]),
    ("std.String", "parseInt", &["std.String"]),
    ("std.Console", "print", &["std.String"]),
    ("std.Console", "println", &["std.String"]),
    ("std.Console", "printErr", &["std.String"]),
    ("std.Console", "readLine", &[]),
    ("std.Thread", "sleep", &["int"]),
    ("std.System", "currentTimeMillis", &[]),
    ("std.Random", "nextInt", &["int"]),
    ("std.Object", CONSTRUCTOR, &[]),
    ("std.Exception", CONSTRUCTOR, &[]),
    ("std.Exception", CONSTRUCTOR, &["std.String"]),
    ("std.RuntimeException", CONSTRUCTOR, &[]),
    ("std.RuntimeException", CONSTRUCTOR, &["std.String"]),
    ("std.IllegalArgumentException", CONSTRUCTOR, &["std.String"]),
    ("std.IllegalStateException", CONSTRUCTOR, &["std.String"]),
    ("std.ArithmeticException", CONSTRUCTOR, &["std.String"]),
    ("std.IndexOutOfBoundsException", CONSTRUCTOR, &["std.String"]),
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallPolicy {
    entries: BTreeSet<Signature>,
}

impl CallPolicy {
    /// Policy permitting nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn default_baseline() -> Self {
        let entries = DEFAULT_ENTRIES
            .iter()
            .map(|(owner, name, params)| Signature::new(owner, name, params))
            .collect();
        Self { entries }
    }

    /// Baseline plus every entry in `text`
    pub fn parse(text: &str) -> Result<Self> {
        let mut policy = Self::default_baseline();
        policy.extend_from_text(text)?;
        Ok(policy)
    }

    /// Exactly the entries in `text`, without the baseline
    pub fn parse_exact(text: &str) -> Result<Self> {
        let mut policy = Self::empty();
        policy.extend_from_text(text)?;
        Ok(policy)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GradeError::Config(format!("cannot read whitelist {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn extend_from_text(&mut self, text: &str) -> Result<()> {
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let signature = Signature::parse(line).map_err(|reason| GradeError::Whitelist {
                line: index + 1,
                reason,
            })?;
            self.entries.insert(signature);
        }
        Ok(())
    }

    pub fn insert(&mut self, signature: Signature) {
        self.entries.insert(signature);
    }

    pub fn is_call_permitted(&self, owner: &str, name: &str, params: &[String]) -> bool {
        let probe = Signature {
            owner: owner.to_string(),
            name: name.to_string(),
            params: params.to_vec(),
        };
        self.entries.contains(&probe)
    }

    pub fn is_construction_permitted(&self, owner: &str, params: &[String]) -> bool {
        self.is_call_permitted(owner, CONSTRUCTOR, params)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.entries.iter()
    }

    /// Render in the textual whitelist format, one entry per line, sorted
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

/// The baseline rendered in the textual format, for documentation and
/// `gradebox whitelist`
pub fn default_whitelist_text() -> String {
    CallPolicy::default_baseline().serialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_signature_parsing() {
        let sig = Signature::parse("std.Math.max(int, int)").unwrap();
        assert_eq!(sig.owner, "std.Math");
        assert_eq!(sig.name, "max");
        assert_eq!(sig.params, params(&["int", "int"]));

        let ctor = Signature::parse("std.Exception.<init>()").unwrap();
        assert_eq!(ctor.name, CONSTRUCTOR);
        assert!(ctor.params.is_empty());
    }

    #[test]
    fn test_signature_parse_errors() {
        assert!(Signature::parse("std.Math.max").is_err());
        assert!(Signature::parse("max(int)").is_err());
        assert!(Signature::parse("std.Math.max(int,)").is_err());
        assert!(Signature::parse("std.Math.max(int").is_err());
    }

    #[test]
    fn test_parse_is_additive_to_baseline() {
        let policy = CallPolicy::parse("# extras\n\nstd.Files.readString(std.String)\n").unwrap();
        assert_eq!(policy.len(), CallPolicy::default_baseline().len() + 1);
        assert!(policy.is_call_permitted("std.Files", "readString", &params(&["std.String"])));
        assert!(policy.is_call_permitted("std.Math", "sqrt", &params(&["double"])));
    }

    #[test]
    fn test_whitelist_error_reports_line() {
        let err = CallPolicy::parse_exact("std.Math.abs(int)\nbogus\n").unwrap_err();
        match err {
            GradeError::Whitelist { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_prefix_or_wildcard_matching() {
        let policy = CallPolicy::parse_exact("std.Math.max(int,int)").unwrap();
        assert!(!policy.is_call_permitted("std.Math", "max", &params(&["double", "double"])));
        assert!(!policy.is_call_permitted("std.Math", "ma", &params(&["int", "int"])));
        assert!(!policy.is_call_permitted("std", "Math.max", &params(&["int", "int"])));
        assert!(policy.is_call_permitted("std.Math", "max", &params(&["int", "int"])));
    }

    #[test]
    fn test_construction_uses_constructor_entries() {
        let policy = CallPolicy::default_baseline();
        assert!(policy.is_construction_permitted("std.Exception", &params(&["std.String"])));
        assert!(!policy.is_construction_permitted("std.SecurityException", &params(&["std.String"])));
        assert!(!policy.is_call_permitted("std.Files", "readString", &params(&["std.String"])));
    }

    #[test]
    fn test_serialize_round_trip() {
        let policy = CallPolicy::parse("std.Files.readString(std.String)\nstd.System.getenv(std.String)")
            .unwrap();
        let text = policy.serialize();
        let reparsed = CallPolicy::parse_exact(&text).unwrap();
        assert_eq!(policy, reparsed);
        assert_eq!(reparsed.serialize(), text);
    }

    #[test]
    fn test_default_text_parses_back_to_baseline() {
        let text = default_whitelist_text();
        assert_eq!(
            CallPolicy::parse_exact(&text).unwrap(),
            CallPolicy::default_baseline()
        );
    }
}
