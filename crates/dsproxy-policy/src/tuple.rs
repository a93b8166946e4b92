//! Policy tuples and role links
//!
//! Text form, one fact per line:
//!
//! ```text
//! p, alice, ds1, cluster1/default, read
//! g, alice, team-a
//! ```

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use crate::error::{PolicyError, Result};

/// Normalized authorization fact `(subject, domain, object, action)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyTuple {
    /// User or group the tuple grants to
    pub subject: String,
    /// Datasource id, or `*`
    pub domain: String,
    /// `cluster/namespace` pattern
    pub object: String,
    /// Action, e.g. `read`
    pub action: String,
}

impl PolicyTuple {
    /// Create a tuple
    pub fn new(
        subject: impl Into<String>,
        domain: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            domain: domain.into(),
            object: object.into(),
            action: action.into(),
        }
    }

    /// Fields in declaration order (sub, dom, obj, act)
    pub fn fields(&self) -> [&str; 4] {
        [&self.subject, &self.domain, &self.object, &self.action]
    }
}

/// Group membership fact: `member` holds role `group`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleLink {
    /// User or group that is a member
    pub member: String,
    /// Group being joined
    pub group: String,
}

impl RoleLink {
    /// Create a role link
    pub fn new(member: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            group: group.into(),
        }
    }
}

/// Kind of a policy line, as written in its first column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `p` line
    Policy,
    /// `g` line
    Role,
}

/// One line of policy text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyLine {
    /// `p, sub, dom, obj, act`
    Tuple(PolicyTuple),
    /// `g, member, group`
    Role(RoleLink),
}

impl PolicyLine {
    /// Borrowed view of this line
    pub fn as_line_ref(&self) -> LineRef<'_> {
        match self {
            PolicyLine::Tuple(t) => LineRef::Tuple(t),
            PolicyLine::Role(r) => LineRef::Role(r),
        }
    }

    /// Kind of this line
    pub fn kind(&self) -> LineKind {
        self.as_line_ref().kind()
    }

    /// Fields after the kind column
    pub fn fields(&self) -> Vec<&str> {
        self.as_line_ref().fields()
    }

    /// See [`LineRef::matches_filter`]
    pub fn matches_filter(&self, kind: LineKind, field_index: usize, values: &[String]) -> bool {
        self.as_line_ref().matches_filter(kind, field_index, values)
    }
}

/// A policy line borrowed from a [`PolicySet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRef<'a> {
    /// `p` line
    Tuple(&'a PolicyTuple),
    /// `g` line
    Role(&'a RoleLink),
}

impl<'a> LineRef<'a> {
    /// Kind of this line
    pub fn kind(self) -> LineKind {
        match self {
            LineRef::Tuple(_) => LineKind::Policy,
            LineRef::Role(_) => LineKind::Role,
        }
    }

    /// Fields after the kind column
    pub fn fields(self) -> Vec<&'a str> {
        match self {
            LineRef::Tuple(t) => t.fields().to_vec(),
            LineRef::Role(r) => vec![r.member.as_str(), r.group.as_str()],
        }
    }

    /// Whether `values` match the fields starting at `field_index`.
    /// Empty values match anything.
    pub fn matches_filter(self, kind: LineKind, field_index: usize, values: &[String]) -> bool {
        if self.kind() != kind {
            return false;
        }
        let fields = self.fields();
        values.iter().enumerate().all(|(i, value)| {
            value.is_empty()
                || fields
                    .get(field_index + i)
                    .is_some_and(|field| *field == value.as_str())
        })
    }
}

impl FromStr for PolicyLine {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err("empty field".to_string());
        }
        match parts.as_slice() {
            ["p", sub, dom, obj, act] => Ok(PolicyLine::Tuple(PolicyTuple::new(*sub, *dom, *obj, *act))),
            ["p", ..] => Err(format!("policy line needs 4 fields, found {}", parts.len() - 1)),
            ["g", member, group] => Ok(PolicyLine::Role(RoleLink::new(*member, *group))),
            ["g", ..] => Err(format!("role line needs 2 fields, found {}", parts.len() - 1)),
            [kind, ..] => Err(format!("unknown line type `{}`", kind)),
            [] => Err("empty line".to_string()),
        }
    }
}

impl fmt::Display for PolicyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyLine::Tuple(t) => write!(
                f,
                "p, {}, {}, {}, {}",
                t.subject, t.domain, t.object, t.action
            ),
            PolicyLine::Role(r) => write!(f, "g, {}, {}", r.member, r.group),
        }
    }
}

/// A complete rule set: tuples and role links, in load order, without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    tuples: Ordered<PolicyTuple>,
    roles: Ordered<RoleLink>,
}

impl PolicySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse policy text; any malformed line fails the whole parse
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = line
                .parse::<PolicyLine>()
                .map_err(|msg| PolicyError::parse(idx + 1, msg))?;
            set.insert(parsed);
        }
        Ok(set)
    }

    /// Add a line; returns false if it was already present
    pub fn insert(&mut self, line: PolicyLine) -> bool {
        match line {
            PolicyLine::Tuple(t) => self.tuples.push(t),
            PolicyLine::Role(r) => self.roles.push(r),
        }
    }

    /// Add a tuple; returns false if it was already present
    pub fn add_tuple(&mut self, tuple: PolicyTuple) -> bool {
        self.tuples.push(tuple)
    }

    /// Add a role link; returns false if it was already present
    pub fn add_role(&mut self, link: RoleLink) -> bool {
        self.roles.push(link)
    }

    /// Keep only lines for which `keep` returns true; returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(LineRef<'_>) -> bool) -> usize {
        let dropped = self.tuples.retain(|t| keep(LineRef::Tuple(t)));
        dropped + self.roles.retain(|r| keep(LineRef::Role(r)))
    }

    /// Remove one line; returns false if it was not present
    pub fn remove(&mut self, line: &PolicyLine) -> bool {
        match line {
            PolicyLine::Tuple(t) => self.tuples.remove(t),
            PolicyLine::Role(r) => self.roles.remove(r),
        }
    }

    /// Whether `line` is in the set
    pub fn contains(&self, line: &PolicyLine) -> bool {
        match line {
            PolicyLine::Tuple(t) => self.tuples.index.contains(t),
            PolicyLine::Role(r) => self.roles.index.contains(r),
        }
    }

    /// Loaded tuples in load order
    pub fn tuples(&self) -> &[PolicyTuple] {
        &self.tuples.items
    }

    /// Loaded role links in load order
    pub fn roles(&self) -> &[RoleLink] {
        &self.roles.items
    }

    /// All lines, tuples first
    pub fn lines(&self) -> impl Iterator<Item = PolicyLine> + '_ {
        self.tuples()
            .iter()
            .cloned()
            .map(PolicyLine::Tuple)
            .chain(self.roles().iter().cloned().map(PolicyLine::Role))
    }

    /// Render as policy text
    pub fn to_text(&self) -> String {
        self.lines().map(|l| format!("{}\n", l)).collect()
    }

    /// Whether the set holds no facts
    pub fn is_empty(&self) -> bool {
        self.tuples.items.is_empty() && self.roles.items.is_empty()
    }
}

/// Insertion-ordered items with a hash index for duplicate checks
#[derive(Debug, Clone)]
struct Ordered<T> {
    items: Vec<T>,
    index: HashSet<T>,
}

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashSet::new(),
        }
    }
}

impl<T: PartialEq> PartialEq for Ordered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Eq> Eq for Ordered<T> {}

impl<T: Clone + Eq + Hash> Ordered<T> {
    fn push(&mut self, item: T) -> bool {
        if !self.index.insert(item.clone()) {
            return false;
        }
        self.items.push(item);
        true
    }

    fn remove(&mut self, item: &T) -> bool {
        if !self.index.remove(item) {
            return false;
        }
        self.items.retain(|i| i != item);
        true
    }

    fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        let index = &mut self.index;
        self.items.retain(|item| {
            let kept = keep(item);
            if !kept {
                index.remove(item);
            }
            kept
        });
        before - self.items.len()
    }
}
