//! Channel addressing: `scope/namespace/path`.

use std::fmt;
use std::str::FromStr;

use crate::error::ChannelError;

/// Address of one logical channel.
///
/// The joined form `scope/namespace/path` is the identity key used by the
/// registry and embedded in every frame. The path may itself contain `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelIdentifier {
    scope: String,
    namespace: String,
    path: String,
    id: String,
}

impl ChannelIdentifier {
    /// Build an identifier without validating it. Use [`validate`](Self::validate)
    /// or [`parse`](Self::parse) to reject malformed input.
    pub fn new(
        scope: impl Into<String>,
        namespace: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let scope = scope.into();
        let namespace = namespace.into();
        let path = path.into();
        let id = format!("{scope}/{namespace}/{path}");
        Self {
            scope,
            namespace,
            path,
            id,
        }
    }

    /// Parse `scope/namespace/path`, splitting on the first two separators.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let mut parts = raw.splitn(3, '/');
        let (Some(scope), Some(namespace), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ChannelError::InvalidIdentifier {
                id: raw.to_string(),
                reason: "expected scope/namespace/path".to_string(),
            });
        };
        let ident = Self::new(scope, namespace, path);
        ident.validate()?;
        Ok(ident)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The joined identity key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        let invalid = |reason: &str| ChannelError::InvalidIdentifier {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.scope.is_empty() {
            return Err(invalid("empty scope"));
        }
        if self.namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if self.path.is_empty() {
            return Err(invalid("empty path"));
        }
        if self.scope.contains('/') || self.namespace.contains('/') {
            return Err(invalid("scope and namespace must not contain '/'"));
        }
        if self.path.split('/').any(str::is_empty) {
            return Err(invalid("path has an empty segment"));
        }
        if let Some(c) = self.id.chars().find(|c| !is_allowed(*c)) {
            return Err(invalid(&format!("character {c:?} is not allowed")));
        }
        Ok(())
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '=' | '/')
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl FromStr for ChannelIdentifier {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
