use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddrError;

// ── Instance keys ────────────────────────────────────────────────────────────

/// Key distinguishing one instance of a multi-instance object from its
/// siblings: either a `count` index or a `for_each` string key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceKey {
    Int(u64),
    Str(String),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::Int(n) => write!(f, "[{}]", n),
            InstanceKey::Str(s) => write!(f, "[{:?}]", s),
        }
    }
}

// ── Resource instance addresses ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMode {
    Managed,
    Data,
    Ephemeral,
}

/// One step down the module tree, e.g. `module.network["prod"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstanceStep {
    pub name: String,
    pub key: Option<InstanceKey>,
}

/// Fully-qualified address of a single resource instance within the module
/// tree, e.g. `module.network["prod"].data.aws_vpc.main[0]`.
///
/// Addresses are parsed once at the plan-file boundary and treated as opaque
/// comparable identities everywhere else. Equality is structural and the
/// ordering is total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceInstanceAddr {
    pub module: Vec<ModuleInstanceStep>,
    pub mode: ResourceMode,
    pub type_name: String,
    pub name: String,
    pub key: Option<InstanceKey>,
}

impl ResourceInstanceAddr {
    /// Root-module managed resource instance with no instance key.
    pub fn managed(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceInstanceAddr {
            module: Vec::new(),
            mode: ResourceMode::Managed,
            type_name: type_name.into(),
            name: name.into(),
            key: None,
        }
    }

    pub fn data(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceInstanceAddr {
            mode: ResourceMode::Data,
            ..Self::managed(type_name, name)
        }
    }

    pub fn ephemeral(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceInstanceAddr {
            mode: ResourceMode::Ephemeral,
            ..Self::managed(type_name, name)
        }
    }

    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }
}

impl fmt::Display for ResourceInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.module {
            write!(f, "module.{}", step.name)?;
            if let Some(key) = &step.key {
                write!(f, "{}", key)?;
            }
            write!(f, ".")?;
        }
        match self.mode {
            ResourceMode::Managed => {}
            ResourceMode::Data => write!(f, "data.")?,
            ResourceMode::Ephemeral => write!(f, "ephemeral.")?,
        }
        write!(f, "{}.{}", self.type_name, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceInstanceAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, AddrError> {
        let segments = split_segments(s)?;
        let mut iter = segments.into_iter().peekable();

        let mut module = Vec::new();
        while iter.peek().map(|seg| seg.name == "module" && seg.key.is_none()) == Some(true) {
            iter.next();
            let step = iter.next().ok_or_else(|| AddrError::IncompleteResource {
                addr: s.to_string(),
            })?;
            check_ident(s, &step.name)?;
            module.push(ModuleInstanceStep {
                name: step.name,
                key: step.key,
            });
        }

        let mode = match iter.peek() {
            Some(seg) if seg.name == "data" && seg.key.is_none() => {
                iter.next();
                ResourceMode::Data
            }
            Some(seg) if seg.name == "ephemeral" && seg.key.is_none() => {
                iter.next();
                ResourceMode::Ephemeral
            }
            _ => ResourceMode::Managed,
        };

        let type_seg = iter.next().ok_or(AddrError::Empty)?;
        let name_seg = iter.next().ok_or_else(|| AddrError::IncompleteResource {
            addr: s.to_string(),
        })?;
        if iter.next().is_some() {
            return Err(AddrError::TrailingSegments {
                addr: s.to_string(),
            });
        }
        check_ident(s, &type_seg.name)?;
        check_ident(s, &name_seg.name)?;
        if type_seg.key.is_some() {
            return Err(AddrError::IncompleteResource {
                addr: s.to_string(),
            });
        }

        Ok(ResourceInstanceAddr {
            module,
            mode,
            type_name: type_seg.name,
            name: name_seg.name,
            key: name_seg.key,
        })
    }
}

impl Serialize for ResourceInstanceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceInstanceAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Provider instance addresses ──────────────────────────────────────────────

/// Address of one configured provider plugin instance, e.g.
/// `provider["terraform.io/builtin/test"]` or
/// `provider["registry.example.com/acme/cloud"].europe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderInstanceAddr {
    pub source: String,
    pub alias: Option<String>,
}

impl ProviderInstanceAddr {
    pub fn new(source: impl Into<String>) -> Self {
        ProviderInstanceAddr {
            source: source.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

impl fmt::Display for ProviderInstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider[{:?}]", self.source)?;
        if let Some(alias) = &self.alias {
            write!(f, ".{}", alias)?;
        }
        Ok(())
    }
}

impl FromStr for ProviderInstanceAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, AddrError> {
        let invalid = || AddrError::InvalidProvider {
            addr: s.to_string(),
        };
        let rest = s.strip_prefix("provider[\"").ok_or_else(invalid)?;
        let close = rest.find('"').ok_or_else(invalid)?;
        let source = &rest[..close];
        if source.is_empty() {
            return Err(invalid());
        }
        let rest = rest[close + 1..].strip_prefix(']').ok_or_else(invalid)?;
        let alias = match rest.strip_prefix('.') {
            None if rest.is_empty() => None,
            None => return Err(invalid()),
            Some(alias) => {
                check_ident(s, alias).map_err(|_| invalid())?;
                Some(alias.to_string())
            }
        };
        Ok(ProviderInstanceAddr {
            source: source.to_string(),
            alias,
        })
    }
}

impl Serialize for ProviderInstanceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProviderInstanceAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Deposed keys ─────────────────────────────────────────────────────────────

/// Identifier of a deposed object: a previously-current object set aside
/// during a create-before-destroy replacement. Always eight lowercase hex
/// digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeposedKey(String);

impl DeposedKey {
    pub fn new(s: impl Into<String>) -> Result<Self, AddrError> {
        let s = s.into();
        let ok = s.len() == 8 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if ok {
            Ok(DeposedKey(s))
        } else {
            Err(AddrError::InvalidDeposedKey { key: s })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeposedKey {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, AddrError> {
        DeposedKey::new(s)
    }
}

impl TryFrom<String> for DeposedKey {
    type Error = AddrError;

    fn try_from(s: String) -> Result<Self, AddrError> {
        DeposedKey::new(s)
    }
}

impl From<DeposedKey> for String {
    fn from(k: DeposedKey) -> String {
        k.0
    }
}

// ── Parsing helpers ──────────────────────────────────────────────────────────

struct Segment {
    name: String,
    key: Option<InstanceKey>,
}

/// Split an address into dot-separated segments, keeping bracketed instance
/// keys (which may themselves contain dots or quotes) attached to their
/// segment.
fn split_segments(s: &str) -> Result<Vec<Segment>, AddrError> {
    if s.is_empty() {
        return Err(AddrError::Empty);
    }
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_brackets = false;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' if in_brackets => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            '.' if !in_brackets => {
                segments.push(parse_segment(s, &s[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_brackets || in_quotes {
        return Err(AddrError::Unterminated {
            addr: s.to_string(),
        });
    }
    segments.push(parse_segment(s, &s[start..])?);
    Ok(segments)
}

fn parse_segment(addr: &str, seg: &str) -> Result<Segment, AddrError> {
    let (name, key) = match seg.find('[') {
        None => (seg, None),
        Some(open) => {
            let inner = seg[open..]
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .ok_or_else(|| AddrError::Unterminated {
                    addr: addr.to_string(),
                })?;
            (&seg[..open], Some(parse_key(addr, inner)?))
        }
    };
    if name.is_empty() {
        return Err(AddrError::InvalidIdent {
            addr: addr.to_string(),
            ident: seg.to_string(),
        });
    }
    Ok(Segment {
        name: name.to_string(),
        key,
    })
}

fn parse_key(addr: &str, inner: &str) -> Result<InstanceKey, AddrError> {
    if let Some(quoted) = inner.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        if quoted.contains('"') {
            return Err(AddrError::InvalidKey {
                addr: addr.to_string(),
                key: inner.to_string(),
            });
        }
        return Ok(InstanceKey::Str(quoted.to_string()));
    }
    inner
        .parse::<u64>()
        .map(InstanceKey::Int)
        .map_err(|_| AddrError::InvalidKey {
            addr: addr.to_string(),
            key: inner.to_string(),
        })
}

fn check_ident(addr: &str, ident: &str) -> Result<(), AddrError> {
    let mut chars = ident.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if head_ok && tail_ok {
        Ok(())
    } else {
        Err(AddrError::InvalidIdent {
            addr: addr.to_string(),
            ident: ident.to_string(),
        })
    }
}
