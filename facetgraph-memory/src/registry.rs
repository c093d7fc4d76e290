//! Vector space registry
//!
//! Facet name → dimensionality. A facet's dimensionality is fixed once any
//! node has stored a vector under it.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy)]
struct FacetSpace {
    dimension: usize,
    in_use: bool,
}

/// Registry of known facets and their dimensionality
#[derive(Debug, Default)]
pub struct VectorSpaceRegistry {
    spaces: RwLock<HashMap<String, FacetSpace>>,
}

impl VectorSpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated from configuration
    pub fn from_dimensions(dimensions: &BTreeMap<String, usize>) -> Self {
        let registry = Self::new();
        {
            let mut spaces = registry.spaces.write();
            for (facet, dimension) in dimensions {
                spaces.insert(
                    facet.clone(),
                    FacetSpace {
                        dimension: *dimension,
                        in_use: false,
                    },
                );
            }
        }
        registry
    }

    /// Register or redefine a facet. Redefining a facet that already has nodes fails.
    pub fn register(&self, facet: &str, dimension: usize) -> Result<()> {
        if facet.is_empty() || dimension == 0 {
            return Err(MemoryError::validation(
                "facet name must be non-empty and dimensionality positive",
            ));
        }
        let mut spaces = self.spaces.write();
        match spaces.get_mut(facet) {
            Some(space) if space.dimension == dimension => Ok(()),
            Some(space) if space.in_use => Err(MemoryError::validation(format!(
                "facet '{}' already holds {}-d vectors and cannot change to {}-d",
                facet, space.dimension, dimension
            ))),
            Some(space) => {
                space.dimension = dimension;
                Ok(())
            }
            None => {
                spaces.insert(
                    facet.to_string(),
                    FacetSpace {
                        dimension,
                        in_use: false,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn dimension(&self, facet: &str) -> Option<usize> {
        self.spaces.read().get(facet).map(|s| s.dimension)
    }

    pub fn contains(&self, facet: &str) -> bool {
        self.spaces.read().contains_key(facet)
    }

    /// Check a vector against the registered dimensionality
    pub fn validate(&self, facet: &str, vector: &[f32]) -> Result<()> {
        let expected = self.dimension(facet).ok_or_else(|| {
            MemoryError::validation(format!("facet '{}' is not registered", facet))
        })?;
        if vector.len() != expected {
            return Err(MemoryError::dimension_mismatch(facet, expected, vector.len()));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::validation(format!(
                "facet '{}' vector contains non-finite values",
                facet
            )));
        }
        Ok(())
    }

    /// Lock a facet's dimensionality once a node stores a vector under it
    pub fn mark_in_use(&self, facet: &str) {
        if let Some(space) = self.spaces.write().get_mut(facet) {
            space.in_use = true;
        }
    }

    pub fn facets(&self) -> Vec<String> {
        let mut facets: Vec<String> = self.spaces.read().keys().cloned().collect();
        facets.sort();
        facets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let registry = VectorSpaceRegistry::from_dimensions(&BTreeMap::from([(
            "role".to_string(),
            3,
        )]));
        assert!(registry.validate("role", &[0.1, 0.2, 0.3]).is_ok());

        let err = registry.validate("role", &[0.1, 0.2]).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));

        let err = registry.validate("skill", &[0.1]).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        assert!(registry.validate("role", &[0.1, f32::NAN, 0.3]).is_err());
    }

    #[test]
    fn test_dimension_frozen_once_in_use() {
        let registry = VectorSpaceRegistry::new();
        registry.register("role", 3).unwrap();
        // Not yet used, can still change
        registry.register("role", 4).unwrap();
        assert_eq!(registry.dimension("role"), Some(4));

        registry.mark_in_use("role");
        assert!(registry.register("role", 4).is_ok());
        assert!(registry.register("role", 8).is_err());
        assert_eq!(registry.dimension("role"), Some(4));
    }

    #[test]
    fn test_facets_sorted() {
        let registry = VectorSpaceRegistry::new();
        registry.register("skill", 2).unwrap();
        registry.register("role", 2).unwrap();
        assert_eq!(registry.facets(), vec!["role".to_string(), "skill".to_string()]);
    }
}
