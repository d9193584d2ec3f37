/*!
Hierarchical storage keys.
*/

use std::fmt;
use std::sync::Arc;

use crate::{Result, SpoolError};

/// Root component under which every staged upload lives.
pub const UPLOADS_COMPONENT: &str = "uploadFiles";

/// A key made of a component and an optional parent key.
///
/// `KeyBuilder::uploads().append("trace").append(id)` addresses
/// `uploadFiles/trace/<id>`. Parents are shared, so appending is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyBuilder {
    component: String,
    parent: Option<Arc<KeyBuilder>>,
}

impl KeyBuilder {
    /// Create a root key with a single component
    pub fn new<S: Into<String>>(component: S) -> Self {
        Self {
            component: component.into(),
            parent: None,
        }
    }

    /// Root key of the upload staging area
    pub fn uploads() -> Self {
        Self::new(UPLOADS_COMPONENT)
    }

    /// Return a child key of this key
    pub fn append<S: Into<String>>(&self, component: S) -> Self {
        Self {
            component: component.into(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Last component of the key
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn parent(&self) -> Option<&KeyBuilder> {
        self.parent.as_deref()
    }

    /// All components, root first
    pub fn components(&self) -> Vec<&str> {
        let mut components = Vec::new();
        let mut current = Some(self);
        while let Some(key) = current {
            components.push(key.component.as_str());
            current = key.parent();
        }
        components.reverse();
        components
    }

    /// The key joined with `/`
    pub fn key(&self) -> String {
        self.components().join("/")
    }

    /// Check every component so the key cannot escape a storage root.
    pub fn validate(&self) -> Result<()> {
        for component in self.components() {
            if component.is_empty()
                || component == "."
                || component == ".."
                || component.contains('/')
                || component.contains('\\')
            {
                return Err(SpoolError::InvalidKey(format!(
                    "component {component:?} of key {:?} is not allowed",
                    self.key()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
