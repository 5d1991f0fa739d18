use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Marker for records that track dependency prerequisites, which are loaded
/// without a concrete asset type.
pub enum UntypedAsset {}

/// Identifies one cached resource: a location paired with the asset type it
/// was requested as.
///
/// Two requests for the same location but different types map to different
/// keys and therefore to independent cache records. Keys are cheap to clone;
/// the location is shared behind an [`Arc`].
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    location: Arc<str>,
    type_id: TypeId,
    type_name: &'static str,
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.location == other.location
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
        self.type_id.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.location)
    }
}

impl CacheKey {
    /// Creates the key under which `location` is cached when requested as `T`.
    pub fn for_asset<T: Any>(location: &str) -> Self {
        CacheKey {
            location: location.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Creates the key under which `location` is tracked as a dependency
    /// prerequisite of another record.
    pub fn untyped(location: &str) -> Self {
        Self::for_asset::<UntypedAsset>(location)
    }

    /// The asset location this key was derived from.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub(crate) fn location_arc(&self) -> Arc<str> {
        Arc::clone(&self.location)
    }

    /// The name of the type this key's asset was requested as.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Texture;
    struct Sprite;

    #[test]
    fn test_distinct_types_distinct_keys() {
        let a = CacheKey::for_asset::<Texture>("foo.png");
        let b = CacheKey::for_asset::<Sprite>("foo.png");
        let c = CacheKey::for_asset::<Texture>("foo.png");

        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, CacheKey::untyped("foo.png"));
        assert_ne!(a, CacheKey::for_asset::<Texture>("bar.png"));
    }

    #[test]
    fn test_display_names_the_type() {
        let key = CacheKey::for_asset::<Texture>("foo.png");
        let rendered = key.to_string();
        assert!(rendered.contains("Texture"));
        assert!(rendered.contains("foo.png"));
    }
}
