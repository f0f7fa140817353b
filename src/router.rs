//! Gateway routing core: game-server registry, least-loaded placement,
//! game-to-server routing, and CREATE correlation.
//!
//! The router owns every table and performs no I/O; handlers return the
//! packets to queue, addressed by connection handle, so the event loop stays
//! a thin shell and the logic stays testable.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use crate::control::{self, ControlCommand};
use crate::error::ProtocolError;

/// Opaque identifier of one TCP connection on the gateway.
pub type Handle = u64;

/// Identity of a registered game server: 16-byte IPv6 address and port.
pub type GsKey = ([u8; 16], u16);

/// A packet to queue on a connection's outbound buffer.
pub type Outgoing = (Handle, Vec<u8>);

/// Registry and routing state of the gateway process.
#[derive(Default)]
pub struct Router {
    /// Registered game servers, ordered by key so placement ties break
    /// deterministically toward the smallest key.
    gs_registry: BTreeMap<GsKey, Handle>,
    occupancy_cache: HashMap<GsKey, u8>,
    game_to_gs: HashMap<u32, GsKey>,
    /// gs_handle -> (waiting client handle, gametype)
    pending_creates: HashMap<Handle, (Handle, u8)>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of_handle(&self, handle: Handle) -> Option<GsKey> {
        self.gs_registry
            .iter()
            .find(|(_, &h)| h == handle)
            .map(|(key, _)| *key)
    }

    fn least_occupied(&self) -> Option<(GsKey, Handle)> {
        self.gs_registry
            .iter()
            .min_by_key(|(key, _)| self.occupancy_cache.get(*key).copied().unwrap_or(0))
            .map(|(key, &handle)| (*key, handle))
    }

    /// GS(20): register a game server under `(ip, port)`.
    ///
    /// A duplicate key is refused with GS_KO and the existing registration is
    /// left untouched.
    pub fn handle_register(&mut self, handle: Handle, ip: [u8; 16], port: u16) -> Outgoing {
        let key = (ip, port);
        if self.gs_registry.contains_key(&key) {
            warn!("duplicate GS registration for {}", control::endpoint_from_octets(&ip, port));
            return (handle, control::build_simple(ControlCommand::RegisterKo));
        }
        info!("registered game server {}", control::endpoint_from_octets(&ip, port));
        self.gs_registry.insert(key, handle);
        (handle, control::build_simple(ControlCommand::RegisterOk))
    }

    /// OCCUPANCY(23): update the load cache for the sending game server.
    pub fn handle_occupancy(&mut self, handle: Handle, occupancy: u8) -> Result<(), ProtocolError> {
        let key = self.key_of_handle(handle).ok_or(ProtocolError::UnknownGameServer)?;
        debug!(
            "occupancy {} for {}",
            occupancy,
            control::endpoint_from_octets(&key.0, key.1)
        );
        self.occupancy_cache.insert(key, occupancy);
        Ok(())
    }

    /// GID(24): route every listed game id to the sending game server.
    pub fn handle_game_ids(&mut self, handle: Handle, ids: &[u32]) -> Result<(), ProtocolError> {
        let key = self.key_of_handle(handle).ok_or(ProtocolError::UnknownGameServer)?;
        for &id in ids {
            self.game_to_gs.insert(id, key);
        }
        Ok(())
    }

    /// CREATE(3) from a client: forward to the least-occupied game server and
    /// remember who is waiting, or answer CREATE_KO when no server can take it.
    pub fn handle_create(&mut self, client: Handle, gametype: u8) -> Outgoing {
        match self.least_occupied() {
            Some((key, gs_handle)) => {
                debug!(
                    "routing CREATE(gametype={}) to {}",
                    gametype,
                    control::endpoint_from_octets(&key.0, key.1)
                );
                self.pending_creates.insert(gs_handle, (client, gametype));
                (gs_handle, control::build_create(gametype))
            }
            None => {
                warn!("CREATE with no registered game server");
                (client, control::build_simple(ControlCommand::CreateKo))
            }
        }
    }

    /// Whether a JOIN from `handle` is the reply to a forwarded CREATE.
    pub fn expects_create_reply(&self, handle: Handle) -> bool {
        self.pending_creates.contains_key(&handle)
    }

    /// JOIN(1) from a game server answering a CREATE: record the game route
    /// and pass the join on to the waiting client.
    pub fn handle_create_reply(
        &mut self,
        gs_handle: Handle,
        game_id: u32,
        ip: [u8; 16],
        port: u16,
    ) -> Option<Outgoing> {
        let (client, _gametype) = self.pending_creates.remove(&gs_handle)?;
        if let Some(key) = self.key_of_handle(gs_handle) {
            self.game_to_gs.insert(game_id, key);
        }
        info!("game {} created, notifying client", game_id);
        Some((client, control::build_join_reply(game_id, &ip, port)))
    }

    /// JOIN(1) from a client: forward to the game server hosting `game_id`,
    /// informing it of the incoming player, or answer JOIN_KO.
    pub fn handle_join_request(&mut self, sender: Handle, game_id: u32) -> Outgoing {
        if let Some(&key) = self.game_to_gs.get(&game_id) {
            if let Some(&gs_handle) = self.gs_registry.get(&key) {
                let (ip, port) = key;
                return (gs_handle, control::build_join_reply(game_id, &ip, port));
            }
        }
        debug!("JOIN for unknown game {}", game_id);
        (sender, control::build_simple(ControlCommand::JoinKo))
    }

    /// GAME_END(5): remove the route; only the owning game server may end a
    /// game.
    pub fn handle_game_end(&mut self, handle: Handle, game_id: u32) -> Result<(), ProtocolError> {
        let key = self.key_of_handle(handle).ok_or(ProtocolError::UnknownGameServer)?;
        match self.game_to_gs.get(&game_id) {
            Some(owner) if *owner == key => {
                info!("game {} ended", game_id);
                self.game_to_gs.remove(&game_id);
                Ok(())
            }
            Some(_) => Err(ProtocolError::NotOwner),
            // Already gone: fire-and-forget, nothing to do.
            None => Ok(()),
        }
    }

    /// Reclaim all state tied to a closed connection.
    ///
    /// A lost game server takes its registration, occupancy, and every game
    /// it owned with it; a CREATE still waiting on it resolves to CREATE_KO
    /// for the client. A lost client is scrubbed from pending CREATEs so the
    /// eventual reply has nowhere to go instead of going to a recycled handle.
    pub fn handle_disconnect(&mut self, handle: Handle) -> Vec<Outgoing> {
        let mut sends = Vec::new();

        if let Some(key) = self.key_of_handle(handle) {
            info!(
                "game server {} disconnected, purging its games",
                control::endpoint_from_octets(&key.0, key.1)
            );
            self.gs_registry.remove(&key);
            self.occupancy_cache.remove(&key);
            self.game_to_gs.retain(|_, owner| *owner != key);
        }

        if let Some((client, _)) = self.pending_creates.remove(&handle) {
            sends.push((client, control::build_simple(ControlCommand::CreateKo)));
        }
        self.pending_creates.retain(|_, (client, _)| *client != handle);

        sends
    }

    /// Number of registered game servers.
    pub fn registered(&self) -> usize {
        self.gs_registry.len()
    }

    /// Number of routed games.
    pub fn games(&self) -> usize {
        self.game_to_gs.len()
    }

    /// Game server currently hosting `game_id`, if any.
    pub fn owner_of(&self, game_id: u32) -> Option<GsKey> {
        self.game_to_gs.get(&game_id).copied()
    }
}
