//! Collaborator seam toward the game simulation.
//!
//! The transport core treats the simulation as an opaque producer of snapshot
//! blobs and a consumer of decoded inputs; everything it needs is behind the
//! [`Simulation`] trait. The crate ships [`LockstepWorld`], a minimal
//! deterministic implementation used by the binaries and the test suite.

use thiserror::Error;

/// Input type byte for forward movement.
pub const INPUT_FWD: u8 = 1;

/// Why a player slot could not be assigned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// Every slot is taken
    #[error("no free player slot")]
    Full,
}

/// Interface the session layer drives the simulation through.
pub trait Simulation {
    /// Feed one decoded input event, tagged with the sending client.
    fn apply_input(&mut self, client_id: u32, kind: u8, value: u8);

    /// Latest consistent snapshot: monotonically increasing sequence plus an
    /// opaque state blob.
    fn latest_snapshot(&self) -> (u32, Vec<u8>);

    /// Reserve a slot for a joining player; failure produces a KICK.
    fn assign_player_slot(&mut self, client_id: u32) -> Result<(), SlotError>;

    /// Release a departing player's slot.
    fn release_player_slot(&mut self, client_id: u32);

    /// Advance one tick, folding queued inputs into a fresh snapshot.
    fn advance(&mut self);
}

/// How many players one world accepts.
pub const MAX_PLAYERS: usize = 4;

struct PlayerSlot {
    client_id: u32,
    x: i32,
    velocity: i32,
}

/// Deterministic built-in world: each player is a single coordinate that
/// integrates its last forward input every tick. Snapshots serialize
/// `count(1)` then `client_id(4) x(4)` per player, big-endian.
#[derive(Default)]
pub struct LockstepWorld {
    players: Vec<PlayerSlot>,
    snapshot_seq: u32,
    snapshot: Vec<u8>,
}

impl LockstepWorld {
    /// Create an empty world.
    pub fn new() -> Self {
        let mut world = Self::default();
        world.rebuild_snapshot();
        world
    }

    fn rebuild_snapshot(&mut self) {
        let mut blob = Vec::with_capacity(1 + self.players.len() * 8);
        blob.push(self.players.len() as u8);
        for p in &self.players {
            blob.extend_from_slice(&p.client_id.to_be_bytes());
            blob.extend_from_slice(&p.x.to_be_bytes());
        }
        self.snapshot = blob;
    }

    /// Number of occupied slots.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

impl Simulation for LockstepWorld {
    fn apply_input(&mut self, client_id: u32, kind: u8, value: u8) {
        if kind != INPUT_FWD {
            return;
        }
        if let Some(p) = self.players.iter_mut().find(|p| p.client_id == client_id) {
            p.velocity = value as i32;
        }
    }

    fn latest_snapshot(&self) -> (u32, Vec<u8>) {
        (self.snapshot_seq, self.snapshot.clone())
    }

    fn assign_player_slot(&mut self, client_id: u32) -> Result<(), SlotError> {
        if self.players.iter().any(|p| p.client_id == client_id) {
            return Ok(());
        }
        if self.players.len() >= MAX_PLAYERS {
            return Err(SlotError::Full);
        }
        self.players.push(PlayerSlot {
            client_id,
            x: 0,
            velocity: 0,
        });
        Ok(())
    }

    fn release_player_slot(&mut self, client_id: u32) {
        self.players.retain(|p| p.client_id != client_id);
    }

    fn advance(&mut self) {
        for p in &mut self.players {
            p.x += p.velocity;
        }
        self.snapshot_seq = self.snapshot_seq.wrapping_add(1);
        self.rebuild_snapshot();
    }
}
