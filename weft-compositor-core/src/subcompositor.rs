//! # Subcompositor Logic
//!
//! Parent/child relationships between surfaces (`wl_subsurface`) and the tree
//! queries the transaction engine needs: ancestry, the main (root) surface of
//! a tree, nesting depth and effective synchronization.
//!
//! The protocol binding calls into these functions; the registry is always
//! the last argument.

use thiserror::Error;

use crate::surface::surface_registry::SurfaceRegistry;
use crate::surface::SurfaceId;

/// Defines the synchronization behavior of a subsurface relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsurfaceSyncMode {
    /// The subsurface's commits are cached and only applied together with its
    /// parent's next commit. This is the default mode.
    #[default]
    Synchronized,
    /// The subsurface's commits apply independently of its parent, unless an
    /// ancestor is synchronized.
    Desynchronized,
}

/// Holds the state specific to a surface when it acts as a subsurface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsurfaceState {
    pub parent_id: SurfaceId,
    /// Set by `wl_subsurface.set_position`, picked up by the parent's next commit.
    pub pending_position: Option<(i32, i32)>,
    /// Position relative to the parent as of the last applied state.
    pub current_position: (i32, i32),
    pub sync_mode: SubsurfaceSyncMode,
}

impl SubsurfaceState {
    pub fn new(parent_id: SurfaceId) -> Self {
        Self {
            parent_id,
            pending_position: None,
            current_position: (0, 0),
            sync_mode: SubsurfaceSyncMode::default(),
        }
    }
}

/// Errors that can occur during subsurface operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubsurfaceError {
    #[error("surface {0:?} does not exist")]
    BadSurface(SurfaceId),
    #[error("parent surface {0:?} does not exist")]
    BadParent(SurfaceId),
    #[error("surface {0:?} already has a subsurface role")]
    SurfaceHasRole(SurfaceId),
    #[error("surface {0:?} is not a subsurface")]
    NotASubsurface(SurfaceId),
    #[error("making {surface:?} a child of {parent:?} would create a cycle")]
    CycleDetected { surface: SurfaceId, parent: SurfaceId },
}

/// Handles the `wl_subcompositor.get_subsurface` request.
///
/// Turns `surface_id` into a child of `parent_id`. New subsurfaces start out
/// synchronized and are stacked on top of their siblings.
///
/// # Errors
/// Fails if either surface is unknown, if `surface_id` already is a
/// subsurface, or if `surface_id` is `parent_id` or one of its ancestors.
pub fn get_subsurface(
    surface_id: SurfaceId,
    parent_id: SurfaceId,
    registry: &mut SurfaceRegistry,
) -> Result<(), SubsurfaceError> {
    if !registry.contains(surface_id) {
        return Err(SubsurfaceError::BadSurface(surface_id));
    }
    if !registry.contains(parent_id) {
        return Err(SubsurfaceError::BadParent(parent_id));
    }
    if surface_id == parent_id || is_ancestor(surface_id, parent_id, registry) {
        return Err(SubsurfaceError::CycleDetected {
            surface: surface_id,
            parent: parent_id,
        });
    }

    let surface = registry
        .get_surface_mut(surface_id)
        .ok_or(SubsurfaceError::BadSurface(surface_id))?;
    if surface.subsurface.is_some() {
        return Err(SubsurfaceError::SurfaceHasRole(surface_id));
    }
    surface.subsurface = Some(SubsurfaceState::new(parent_id));
    surface.parent = Some(parent_id);

    let parent = registry
        .get_surface_mut(parent_id)
        .ok_or(SubsurfaceError::BadParent(parent_id))?;
    parent.children.push(surface_id);
    tracing::debug!("Surface {:?} is now a subsurface of {:?}", surface_id, parent_id);
    Ok(())
}

/// Handles `wl_subsurface.destroy`.
///
/// The `wl_surface` itself survives but is unlinked from its parent. Calling
/// this on a surface without the role is a no-op.
pub fn destroy_subsurface_role(
    surface_id: SurfaceId,
    registry: &mut SurfaceRegistry,
) -> Result<(), SubsurfaceError> {
    let surface = registry
        .get_surface_mut(surface_id)
        .ok_or(SubsurfaceError::BadSurface(surface_id))?;
    let Some(state) = surface.subsurface.take() else {
        return Ok(());
    };
    surface.parent = None;

    // The parent may already be gone.
    if let Some(parent) = registry.get_surface_mut(state.parent_id) {
        parent.children.retain(|&child| child != surface_id);
    }
    Ok(())
}

/// Handles `wl_subsurface.set_position`.
///
/// The position is double-buffered on the parent: it takes effect with the
/// parent's next commit, not the child's.
pub fn set_position(
    surface_id: SurfaceId,
    x: i32,
    y: i32,
    registry: &mut SurfaceRegistry,
) -> Result<(), SubsurfaceError> {
    let surface = registry
        .get_surface_mut(surface_id)
        .ok_or(SubsurfaceError::BadSurface(surface_id))?;
    let state = surface
        .subsurface
        .as_mut()
        .ok_or(SubsurfaceError::NotASubsurface(surface_id))?;
    state.pending_position = Some((x, y));
    Ok(())
}

/// Takes the positions queued by `set_position` on the direct children of
/// `parent_id`, as `(child, position)` pairs in stacking order.
pub(crate) fn take_pending_positions(
    parent_id: SurfaceId,
    registry: &mut SurfaceRegistry,
) -> Vec<(SurfaceId, (i32, i32))> {
    let children = match registry.get_surface(parent_id) {
        Some(parent) => parent.children.clone(),
        None => return Vec::new(),
    };
    children
        .into_iter()
        .filter_map(|child_id| {
            let child = registry.get_surface_mut(child_id)?;
            let position = child.subsurface.as_mut()?.pending_position.take()?;
            Some((child_id, position))
        })
        .collect()
}

/// Makes a position carried by `parent_id`'s applied state current on
/// `child_id`. Ignored if the child left the parent in the meantime.
pub(crate) fn apply_position(
    parent_id: SurfaceId,
    child_id: SurfaceId,
    position: (i32, i32),
    registry: &mut SurfaceRegistry,
) {
    let Some(state) = registry.get_surface_mut(child_id).and_then(|child| child.subsurface.as_mut()) else {
        return;
    };
    if state.parent_id == parent_id {
        state.current_position = position;
    } else {
        tracing::debug!("Dropping position of {:?}, no longer a child of {:?}", child_id, parent_id);
    }
}

/// Handles `wl_subsurface.set_sync` and `wl_subsurface.set_desync`.
pub fn set_sync_mode(
    surface_id: SurfaceId,
    sync_mode: SubsurfaceSyncMode,
    registry: &mut SurfaceRegistry,
) -> Result<(), SubsurfaceError> {
    let surface = registry
        .get_surface_mut(surface_id)
        .ok_or(SubsurfaceError::BadSurface(surface_id))?;
    let state = surface
        .subsurface
        .as_mut()
        .ok_or(SubsurfaceError::NotASubsurface(surface_id))?;
    state.sync_mode = sync_mode;
    Ok(())
}

/// Returns `true` if `ancestor` is a strict ancestor of `surface`.
pub fn is_ancestor(ancestor: SurfaceId, surface: SurfaceId, registry: &SurfaceRegistry) -> bool {
    let mut current = registry.get_surface(surface).and_then(|s| s.parent());
    while let Some(id) = current {
        if id == ancestor {
            return true;
        }
        current = registry.get_surface(id).and_then(|s| s.parent());
    }
    false
}

/// The root of the tree `surface` belongs to. A surface without a parent is
/// its own main surface.
pub fn main_surface(surface: SurfaceId, registry: &SurfaceRegistry) -> SurfaceId {
    let mut current = surface;
    while let Some(parent) = registry.get_surface(current).and_then(|s| s.parent()) {
        current = parent;
    }
    current
}

/// Number of ancestors above `surface`.
pub fn depth(surface: SurfaceId, registry: &SurfaceRegistry) -> usize {
    let mut depth = 0;
    let mut current = surface;
    while let Some(parent) = registry.get_surface(current).and_then(|s| s.parent()) {
        depth += 1;
        current = parent;
    }
    depth
}

/// A subsurface is effectively synchronized if it, or any of its ancestors,
/// is in synchronized mode. Surfaces without the role never are.
pub fn is_effectively_synchronized(surface: SurfaceId, registry: &SurfaceRegistry) -> bool {
    let mut current = registry.get_surface(surface).and_then(|s| s.subsurface());
    while let Some(state) = current {
        if state.sync_mode == SubsurfaceSyncMode::Synchronized {
            return true;
        }
        current = registry.get_surface(state.parent_id).and_then(|s| s.subsurface());
    }
    false
}

/// All descendants of `surface`, parents before their children.
pub fn descendants(surface: SurfaceId, registry: &SurfaceRegistry) -> Vec<SurfaceId> {
    let mut out = Vec::new();
    let mut stack: Vec<SurfaceId> = registry
        .get_surface(surface)
        .map(|s| s.children().iter().rev().copied().collect())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        out.push(id);
        if let Some(s) = registry.get_surface(id) {
            stack.extend(s.children().iter().rev().copied());
        }
    }
    out
}
