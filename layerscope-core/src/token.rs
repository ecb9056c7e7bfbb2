//! Token registry: human-readable names for hierarchical attribute identifiers.
//!
//! Identifiers are dotted namespace paths (`tcp.flags.syn`). A [`Token`]
//! pairs one identifier with its display name. The registry is append-only:
//! tokens are registered at startup or while a dissector is registered and
//! are never removed.
//!
//! One process-wide instance is available through [`TokenRegistry::global`];
//! it is handed to dissectors and renderers explicitly rather than looked up
//! ambiently, and tests build private registries with [`TokenRegistry::new`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use compact_str::CompactString;

use crate::error::{Error, Result};

/// An immutable (identifier, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    id: CompactString,
    name: CompactString,
}

impl Token {
    /// The dotted identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The display name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Name used for identifiers that were never registered: the last path segment.
pub fn fallback_name(id: &str) -> &str {
    id.rsplit('.').next().unwrap_or(id)
}

/// Append-only identifier → name mapping.
///
/// Registration is serialized internally, so dissectors may register
/// concurrently during startup.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<CompactString, CompactString>>,
}

static GLOBAL: OnceLock<Arc<TokenRegistry>> = OnceLock::new();

impl TokenRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<TokenRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TokenRegistry::new())))
    }

    /// Register `name` for `id`.
    ///
    /// Registering the same pair twice is a no-op; registering a different
    /// name for an existing identifier fails with
    /// [`Error::DuplicateIdentifier`].
    pub fn register(&self, id: &str, name: &str) -> Result<Token> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tokens.get(id) {
            if existing != name {
                return Err(Error::DuplicateIdentifier {
                    id: id.to_string(),
                    existing: existing.to_string(),
                    requested: name.to_string(),
                });
            }
        } else {
            tokens.insert(CompactString::new(id), CompactString::new(name));
        }
        Ok(Token {
            id: CompactString::new(id),
            name: CompactString::new(name),
        })
    }

    /// Register a batch of (identifier, name) pairs, stopping at the first conflict.
    pub fn register_all(&self, pairs: &[(&str, &str)]) -> Result<()> {
        for (id, name) in pairs {
            self.register(id, name)?;
        }
        Ok(())
    }

    /// Resolve an identifier to its display name.
    ///
    /// Unregistered identifiers resolve to their last path segment.
    pub fn resolve(&self, id: &str) -> CompactString {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(id) {
            Some(name) => name.clone(),
            None => CompactString::new(fallback_name(id)),
        }
    }

    /// Look up a registered token.
    pub fn get(&self, id: &str) -> Option<Token> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.get(id).map(|name| Token {
            id: CompactString::new(id),
            name: name.clone(),
        })
    }

    /// Check whether an identifier has been registered.
    pub fn contains(&self, id: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.contains_key(id)
    }

    /// All registered tokens, sorted by identifier.
    pub fn tokens(&self) -> Vec<Token> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Token> = tokens
            .iter()
            .map(|(id, name)| Token {
                id: id.clone(),
                name: name.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
