//! Node addressing for the in-memory engine.

use crate::engine::EngineResult;
use crate::status::{EngineError, ErrorKind};
use dbxlink_codec::{ArgView, Sort};
use std::fmt;

/// One subscript of a node path.
///
/// Canonical integers collate before strings, and numerically among
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subscript {
    /// Canonical integer.
    Num(i64),
    /// Any other value, compared bytewise.
    Str(Vec<u8>),
}

impl Subscript {
    /// Classifies raw subscript text.
    pub fn parse(bytes: &[u8]) -> Self {
        if is_canonical_integer(bytes) {
            if let Some(n) = std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()) {
                return Subscript::Num(n);
            }
        }
        Subscript::Str(bytes.to_vec())
    }

    /// The empty subscript, which starts an ordered traversal.
    pub fn is_empty(&self) -> bool {
        matches!(self, Subscript::Str(s) if s.is_empty())
    }

    /// Text form sent back to clients.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Subscript::Num(n) => n.to_string().into_bytes(),
            Subscript::Str(s) => s.clone(),
        }
    }
}

fn is_canonical_integer(bytes: &[u8]) -> bool {
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    match digits {
        [] => false,
        [b'0'] => bytes.len() == 1,
        [first, rest @ ..] => {
            first.is_ascii_digit() && *first != b'0' && rest.iter().all(u8::is_ascii_digit)
        }
    }
}

impl fmt::Display for Subscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscript::Num(n) => write!(f, "{n}"),
            Subscript::Str(s) => write!(f, "\"{}\"", String::from_utf8_lossy(s)),
        }
    }
}

/// A global name plus subscripts.
///
/// Ordering is depth-first: a node sorts before its descendants, and the
/// descendants of one node are contiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath {
    /// Global name without the leading caret.
    pub global: String,
    /// Subscripts, outermost first.
    pub subs: Vec<Subscript>,
}

impl NodePath {
    /// Creates a path to the root of `global`.
    pub fn root(global: impl Into<String>) -> Self {
        Self {
            global: global.into(),
            subs: Vec::new(),
        }
    }

    /// Returns true if `other` is this node or lies beneath it.
    pub fn contains(&self, other: &NodePath) -> bool {
        self.global == other.global && other.subs.starts_with(&self.subs)
    }

    /// Path of the same node under a different root.
    pub fn rebase(&self, from: &NodePath, onto: &NodePath) -> NodePath {
        let mut subs = onto.subs.clone();
        subs.extend_from_slice(&self.subs[from.subs.len()..]);
        NodePath {
            global: onto.global.clone(),
            subs,
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{}", self.global)?;
        if !self.subs.is_empty() {
            write!(f, "(")?;
            for (i, sub) in self.subs.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{sub}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Normalizes a global name argument: strips the caret and validates.
pub fn global_name(text: &str) -> EngineResult<String> {
    let name = text.strip_prefix('^').unwrap_or(text);
    let valid = name.chars().enumerate().all(|(i, c)| match c {
        'a'..='z' | 'A'..='Z' => true,
        '%' => i == 0,
        '0'..='9' | '.' => i > 0,
        _ => false,
    });
    if name.is_empty() || !valid {
        return Err(EngineError::new(
            ErrorKind::Subscript,
            format!("invalid global name {text:?}"),
        ));
    }
    Ok(name.to_string())
}

/// Splits a leading key (one GLOBAL-NAME block and its SUBSCRIPT blocks)
/// off an argument list.
pub fn split_key<'a, 'b>(args: &'b [ArgView<'a>]) -> EngineResult<(NodePath, &'b [ArgView<'a>])> {
    let (head, rest) = match args.split_first() {
        Some((head, rest)) if head.sort == Sort::GlobalName => (head, rest),
        _ => {
            return Err(EngineError::new(
                ErrorKind::Subscript,
                "missing global name",
            ))
        }
    };
    let global = global_name(&head.text())?;
    let count = rest.iter().take_while(|a| a.sort == Sort::Subscript).count();
    let subs = rest[..count]
        .iter()
        .map(|a| Subscript::parse(&a.to_bytes()))
        .collect();
    Ok((NodePath { global, subs }, &rest[count..]))
}
