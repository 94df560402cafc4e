//! In-memory voxel host backing Glimmer simulations outside the real engine.
//!
//! Stores a sparse block map and a shelter registry in ordered maps so that
//! scans and iteration are deterministic under a fixed RNG seed. Movement
//! resolution is a naive per-axis sweep: an axis whose destination block is
//! solid simply does not advance that tick.

use glimmer_core::{Ambient, BlockPos, HostWorld, ShelterState, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Block occupancy. Anything not present in the map is open air.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Block {
    /// Solid ground; fairies hover over it and cannot move into it.
    Solid,
    /// Open/air-like; fairies may occupy it.
    Open,
}

/// Sparse in-memory world state implementing [`HostWorld`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryWorld {
    blocks: BTreeMap<BlockPos, Block>,
    shelters: BTreeMap<BlockPos, ShelterState>,
    ambient: Ambient,
}

impl Default for InMemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorld {
    /// An empty, all-air world under a clear daytime sky.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            shelters: BTreeMap::new(),
            ambient: Ambient::clear_day(),
        }
    }

    /// A world with a solid square floor at height `floor_y`, spanning
    /// `[-extent, extent]` on both horizontal axes.
    #[must_use]
    pub fn with_flat_floor(extent: i32, floor_y: i32) -> Self {
        let mut world = Self::new();
        for x in -extent..=extent {
            for z in -extent..=extent {
                world.set_block(BlockPos::new(x, floor_y, z), Block::Solid);
            }
        }
        world
    }

    /// Place or replace a block.
    pub fn set_block(&mut self, pos: BlockPos, block: Block) {
        match block {
            Block::Open => {
                self.blocks.remove(&pos);
            }
            Block::Solid => {
                self.blocks.insert(pos, block);
            }
        }
    }

    /// Register a shelter structure.
    pub fn add_shelter(&mut self, pos: BlockPos, state: ShelterState) {
        self.shelters.insert(pos, state);
    }

    /// Tear down a shelter structure.
    pub fn remove_shelter(&mut self, pos: BlockPos) -> bool {
        self.shelters.remove(&pos).is_some()
    }

    /// Overwrite the ambient readout.
    pub fn set_ambient(&mut self, ambient: Ambient) {
        self.ambient = ambient;
    }

    /// Number of registered shelters in the given state.
    #[must_use]
    pub fn shelter_count(&self, state: ShelterState) -> usize {
        self.shelters.values().filter(|s| **s == state).count()
    }

    fn is_passable(&self, pos: BlockPos) -> bool {
        !matches!(self.blocks.get(&pos), Some(Block::Solid))
    }
}

impl HostWorld for InMemoryWorld {
    fn ambient(&self) -> Ambient {
        self.ambient
    }

    fn can_spawn_inside(&self, pos: BlockPos) -> bool {
        self.is_passable(pos)
    }

    fn shelter_state(&self, pos: BlockPos) -> Option<ShelterState> {
        self.shelters.get(&pos).copied()
    }

    fn set_shelter_state(&mut self, pos: BlockPos, state: ShelterState) {
        if let Some(slot) = self.shelters.get_mut(&pos) {
            debug!(?pos, ?state, "shelter state transition");
            *slot = state;
        }
    }

    fn shelters(&self) -> Vec<BlockPos> {
        self.shelters.keys().copied().collect()
    }

    fn resolve_move(&self, position: Vec3, velocity: Vec3) -> Vec3 {
        let mut next = position;

        let step_x = Vec3::new(next.x + velocity.x, next.y, next.z);
        if self.is_passable(BlockPos::from_world(step_x)) {
            next.x = step_x.x;
        }
        let step_y = Vec3::new(next.x, next.y + velocity.y, next.z);
        if self.is_passable(BlockPos::from_world(step_y)) {
            next.y = step_y.y;
        }
        let step_z = Vec3::new(next.x, next.y, next.z + velocity.z);
        if self.is_passable(BlockPos::from_world(step_z)) {
            next.z = step_z.z;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_blocks_are_open_air() {
        let world = InMemoryWorld::new();
        assert!(world.can_spawn_inside(BlockPos::new(0, 64, 0)));
    }

    #[test]
    fn flat_floor_is_solid() {
        let world = InMemoryWorld::with_flat_floor(4, 0);
        assert!(!world.can_spawn_inside(BlockPos::new(0, 0, 0)));
        assert!(!world.can_spawn_inside(BlockPos::new(-4, 0, 4)));
        assert!(world.can_spawn_inside(BlockPos::new(0, 1, 0)));
        assert!(world.can_spawn_inside(BlockPos::new(-5, 0, 0)));
    }

    #[test]
    fn resolve_move_blocks_solid_axes() {
        let mut world = InMemoryWorld::new();
        world.set_block(BlockPos::new(1, 0, 0), Block::Solid);

        let start = Vec3::new(0.5, 0.5, 0.5);
        let moved = world.resolve_move(start, Vec3::new(1.0, 0.0, 1.0));
        // X axis runs into the solid block and stalls; Z advances freely.
        assert_eq!(moved.x, 0.5);
        assert_eq!(moved.z, 1.5);
    }

    #[test]
    fn resolve_move_in_open_air_is_euler_integration() {
        let world = InMemoryWorld::new();
        let moved = world.resolve_move(Vec3::new(0.0, 10.0, 0.0), Vec3::new(0.25, -0.5, 1.0));
        assert_eq!(moved, Vec3::new(0.25, 9.5, 1.0));
    }

    #[test]
    fn shelter_state_transitions_require_registration() {
        let mut world = InMemoryWorld::new();
        let pos = BlockPos::new(3, 1, 3);
        world.set_shelter_state(pos, ShelterState::Closed);
        assert_eq!(world.shelter_state(pos), None);

        world.add_shelter(pos, ShelterState::Empty);
        world.set_shelter_state(pos, ShelterState::Closed);
        assert_eq!(world.shelter_state(pos), Some(ShelterState::Closed));
        assert_eq!(world.shelter_count(ShelterState::Closed), 1);
    }

    #[test]
    fn shelter_snapshot_is_ordered() {
        let mut world = InMemoryWorld::new();
        world.add_shelter(BlockPos::new(5, 0, 0), ShelterState::Open);
        world.add_shelter(BlockPos::new(-2, 0, 0), ShelterState::Open);
        world.add_shelter(BlockPos::new(1, 0, 0), ShelterState::Open);
        let snapshot = world.shelters();
        let mut sorted = snapshot.clone();
        sorted.sort();
        assert_eq!(snapshot, sorted);
    }
}
