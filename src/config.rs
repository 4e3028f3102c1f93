//! Structured configuration tree consumed by factories
//!
//! The plan loader that parses an on-disk query description is an external
//! collaborator; this module only defines the in-memory node tree that the
//! engine's factories (hashers, comparators, affinitizer, operators)
//! consume, and typed accessors over it.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// One node of a configuration tree.
///
/// Mirrors the usual structured-config shape: scalars at the leaves,
/// ordered lists, and named groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Integer scalar
    Int(i64),
    /// Floating-point scalar
    Float(f64),
    /// String scalar
    Str(String),
    /// Ordered sequence of nodes
    List(Vec<Node>),
    /// Named children
    Group(BTreeMap<String, Node>),
}

impl Node {
    /// Creates an empty group node.
    pub fn group() -> Self {
        Node::Group(BTreeMap::new())
    }

    /// Inserts a child into a group node, replacing any existing entry.
    ///
    /// Panics if `self` is not a group; config trees are built by the
    /// loader before any worker runs.
    pub fn set(&mut self, key: &str, value: impl Into<Node>) -> &mut Self {
        match self {
            Node::Group(map) => {
                map.insert(key.to_string(), value.into());
            }
            _ => panic!("Node::set on a non-group node"),
        }
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Node>) -> Self {
        self.set(key, value);
        self
    }

    /// Looks up a direct child of a group node.
    pub fn child(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Group(map) => map.get(key),
            _ => None,
        }
    }

    /// True if a group node has a direct child named `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.child(key).is_some()
    }

    /// Required child lookup.
    pub fn require(&self, key: &str) -> Result<&Node> {
        self.child(key)
            .ok_or_else(|| Error::Config(format!("missing parameter `{key}`").into()))
    }

    /// Reads this node as an integer scalar.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Node::Int(v) => Ok(*v),
            _ => Err(Error::Config("expected an integer scalar".into())),
        }
    }

    /// Reads this node as a string scalar.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Node::Str(v) => Ok(v),
            _ => Err(Error::Config("expected a string scalar".into())),
        }
    }

    /// Reads this node as a list.
    pub fn as_list(&self) -> Result<&[Node]> {
        match self {
            Node::List(v) => Ok(v),
            _ => Err(Error::Config("expected a list".into())),
        }
    }

    /// Reads a required integer child.
    pub fn int(&self, key: &str) -> Result<i64> {
        self.require(key)?.as_int()
    }

    /// Reads a required string child.
    pub fn str(&self, key: &str) -> Result<&str> {
        self.require(key)?.as_str()
    }

    /// Reads an optional integer child, defaulting when absent.
    pub fn int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.child(key) {
            Some(node) => node.as_int(),
            None => Ok(default),
        }
    }

    /// Reads a required child as a fixed-length list of integers.
    pub fn int_list(&self, key: &str, len: usize) -> Result<Vec<i64>> {
        let list = self.require(key)?.as_list()?;
        if list.len() != len {
            return Err(Error::Config(
                format!("`{key}` must be a list of {len} integers").into(),
            ));
        }
        list.iter().map(Node::as_int).collect()
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Int(v)
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Float(v)
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::Str(v.to_string())
    }
}

impl From<Vec<i64>> for Node {
    fn from(v: Vec<i64>) -> Self {
        Node::List(v.into_iter().map(Node::Int).collect())
    }
}

impl From<Vec<Node>> for Node {
    fn from(v: Vec<Node>) -> Self {
        Node::List(v)
    }
}
