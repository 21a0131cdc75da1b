//! Ownership of every live [`Surface`].

use std::collections::HashMap;

use super::{Surface, SurfaceId};

/// Owns every live surface, keyed by id.
///
/// Lookups for ids that were never registered or were already unregistered
/// return `None`; callers decide whether that is an error.
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, Surface>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self {
            surfaces: HashMap::new(),
        }
    }

    /// Creates a surface with empty pending and current state and registers it.
    pub fn register_new_surface(&mut self) -> SurfaceId {
        let surface = Surface::new();
        let id = surface.id();
        self.surfaces.insert(id, surface);
        tracing::trace!("Registered surface {:?}", id);
        id
    }

    pub fn get_surface(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn get_surface_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    /// Removes a surface from the registry, handing it back to the caller.
    ///
    /// The surface is unlinked from its parent's child list and its children
    /// lose their subsurface role, the way destroying the parent `wl_surface`
    /// unmaps them.
    pub fn unregister_surface(&mut self, id: SurfaceId) -> Option<Surface> {
        let mut surface = self.surfaces.remove(&id)?;

        if let Some(parent_id) = surface.parent.take() {
            if let Some(parent) = self.surfaces.get_mut(&parent_id) {
                parent.children.retain(|&child| child != id);
            }
        }
        for child_id in std::mem::take(&mut surface.children) {
            if let Some(child) = self.surfaces.get_mut(&child_id) {
                child.parent = None;
                child.subsurface = None;
            }
        }
        surface.subsurface = None;

        tracing::trace!("Unregistered surface {:?}", id);
        Some(surface)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.surfaces.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.surfaces.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subcompositor;

    #[test]
    fn test_register_and_get() {
        let mut registry = SurfaceRegistry::new();
        let id = registry.register_new_surface();
        assert!(registry.contains(id));
        assert_eq!(registry.get_surface(id).map(Surface::id), Some(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_unlinks_family() {
        let mut registry = SurfaceRegistry::new();
        let root = registry.register_new_surface();
        let middle = registry.register_new_surface();
        let leaf = registry.register_new_surface();
        subcompositor::get_subsurface(middle, root, &mut registry).unwrap();
        subcompositor::get_subsurface(leaf, middle, &mut registry).unwrap();

        let removed = registry.unregister_surface(middle).unwrap();
        assert_eq!(removed.id(), middle);
        assert!(!registry.contains(middle));
        assert!(registry.get_surface(root).unwrap().children().is_empty());

        let leaf_surface = registry.get_surface(leaf).unwrap();
        assert!(leaf_surface.parent().is_none());
        assert!(leaf_surface.subsurface().is_none());

        assert!(registry.unregister_surface(middle).is_none(), "Second removal is a no-op.");
    }
}
