//! Who takes part in a session.
//!
//! Players live in slots `0..num_players`; spectators take the first free slot in
//! `num_players..num_players + MAX_SPECTATORS`. Every lookup goes through a
//! generational [`PlayerHandle`].

use smallvec::SmallVec;

use crate::arena::{Arena, LookupError};
use crate::{PeerAddress, PlayerHandle, PlayerType, SessionError, MAX_PLAYERS, MAX_SPECTATORS};

pub(crate) type HandleVec = SmallVec<[PlayerHandle; MAX_PLAYERS]>;

#[derive(Debug, Clone)]
pub(crate) struct PlayerTable {
    num_players: usize,
    players: Arena<PlayerType>,
}

impl PlayerTable {
    pub(crate) fn new(num_players: usize) -> Self {
        Self {
            num_players,
            players: Arena::with_slots(num_players + MAX_SPECTATORS),
        }
    }

    /// Registers a participant. `player_num` picks the slot of a local or remote
    /// player and is ignored for spectators.
    pub(crate) fn add(
        &mut self,
        player_type: PlayerType,
        player_num: usize,
    ) -> Result<PlayerHandle, SessionError> {
        let index = match player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                if player_num >= self.num_players {
                    return Err(SessionError::PlayerOutOfRange {
                        index: player_num,
                        limit: self.num_players,
                    });
                }
                player_num
            },
            PlayerType::Spectator(_) => self
                .players
                .vacant_in(self.num_players..self.num_players + MAX_SPECTATORS)
                .ok_or(SessionError::TooManySpectators)?,
        };

        match self.players.insert_at(index, player_type) {
            Ok(handle) => Ok(PlayerHandle::from_arena(handle)),
            Err((LookupError::Occupied, _)) => Err(SessionError::invalid_request(format!(
                "player slot {} is already taken",
                index
            ))),
            Err((err, _)) => Err(lookup_error(err, PlayerHandle::new(index as u32, 0))),
        }
    }

    /// Resolves a handle to the participant's type.
    pub(crate) fn get(&self, handle: PlayerHandle) -> Result<PlayerType, SessionError> {
        self.players
            .get(handle.arena_handle())
            .copied()
            .map_err(|err| lookup_error(err, handle))
    }

    /// Resolves a handle that must name a player (not a spectator). Indices past the
    /// player slots are out of range even though spectators live there.
    pub(crate) fn player(&self, handle: PlayerHandle) -> Result<PlayerType, SessionError> {
        if handle.index() >= self.num_players {
            return Err(SessionError::PlayerOutOfRange {
                index: handle.index(),
                limit: self.num_players,
            });
        }
        match self.get(handle)? {
            PlayerType::Spectator(_) => Err(SessionError::InvalidPlayerHandle { handle }),
            player_type => Ok(player_type),
        }
    }

    pub(crate) fn local_handles(&self) -> HandleVec {
        self.handles_where(|player_type| matches!(player_type, PlayerType::Local))
    }

    pub(crate) fn remote_handles(&self) -> HandleVec {
        self.handles_where(|player_type| matches!(player_type, PlayerType::Remote(_)))
    }

    /// Players and spectators reachable at `addr`.
    pub(crate) fn handles_at(&self, addr: PeerAddress) -> HandleVec {
        self.handles_where(|player_type| match player_type {
            PlayerType::Remote(a) | PlayerType::Spectator(a) => *a == addr,
            PlayerType::Local => false,
        })
    }

    /// Handle currently occupying player slot `index`.
    pub(crate) fn handle_at_index(&self, index: usize) -> Option<PlayerHandle> {
        self.iter()
            .find(|(handle, _)| handle.index() == index)
            .map(|(handle, _)| handle)
    }

    pub(crate) fn num_registered_players(&self) -> usize {
        self.iter()
            .filter(|(handle, _)| handle.index() < self.num_players)
            .count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (PlayerHandle, PlayerType)> + '_ {
        self.players
            .iter()
            .map(|(handle, player_type)| (PlayerHandle::from_arena(handle), *player_type))
    }

    fn handles_where(&self, pred: impl Fn(&PlayerType) -> bool) -> HandleVec {
        self.iter()
            .filter(|(_, player_type)| pred(player_type))
            .map(|(handle, _)| handle)
            .collect()
    }
}

fn lookup_error(err: LookupError, handle: PlayerHandle) -> SessionError {
    match err {
        LookupError::OutOfRange { index, len } => SessionError::PlayerOutOfRange { index, limit: len },
        LookupError::Vacant | LookupError::Stale | LookupError::Occupied => {
            SessionError::InvalidPlayerHandle { handle }
        },
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::Ip(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn players_take_their_declared_slot() {
        let mut table = PlayerTable::new(2);
        let local = table.add(PlayerType::Local, 1).unwrap();
        let remote = table.add(PlayerType::Remote(addr(7000)), 0).unwrap();
        assert_eq!(local, PlayerHandle::new(1, 0));
        assert_eq!(remote, PlayerHandle::new(0, 0));
        assert_eq!(table.player(local), Ok(PlayerType::Local));
        assert_eq!(table.local_handles().as_slice(), &[local]);
        assert_eq!(table.remote_handles().as_slice(), &[remote]);
        assert_eq!(table.num_registered_players(), 2);
    }

    #[test]
    fn out_of_range_player_number() {
        let mut table = PlayerTable::new(2);
        assert_eq!(
            table.add(PlayerType::Local, 2),
            Err(SessionError::PlayerOutOfRange { index: 2, limit: 2 })
        );
    }

    #[test]
    fn occupied_slot_is_invalid_request() {
        let mut table = PlayerTable::new(2);
        table.add(PlayerType::Local, 0).unwrap();
        let err = table.add(PlayerType::Remote(addr(7000)), 0).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidRequest);
    }

    #[test]
    fn spectators_fill_slots_after_players() {
        let mut table = PlayerTable::new(2);
        let first = table.add(PlayerType::Spectator(addr(8000)), 0).unwrap();
        let second = table.add(PlayerType::Spectator(addr(8001)), 99).unwrap();
        assert_eq!(first.index(), 2);
        assert_eq!(second.index(), 3);
        assert_eq!(table.get(first), Ok(PlayerType::Spectator(addr(8000))));
        assert_eq!(table.get(second), Ok(PlayerType::Spectator(addr(8001))));
        assert_eq!(table.num_registered_players(), 0);
    }

    #[test]
    fn player_lookup_stops_at_the_player_slots() {
        let mut table = PlayerTable::new(2);
        table.add(PlayerType::Local, 0).unwrap();
        table.add(PlayerType::Local, 1).unwrap();
        let spectator = table.add(PlayerType::Spectator(addr(8000)), 0).unwrap();

        for handle in [PlayerHandle::new(2, 0), PlayerHandle::new(3, 0), spectator] {
            assert_eq!(
                table.player(handle),
                Err(SessionError::PlayerOutOfRange {
                    index: handle.index(),
                    limit: 2
                })
            );
        }
    }

    #[test]
    fn spectator_limit() {
        let mut table = PlayerTable::new(1);
        for port in 0..MAX_SPECTATORS as u16 {
            table.add(PlayerType::Spectator(addr(9000 + port)), 0).unwrap();
        }
        assert_eq!(
            table.add(PlayerType::Spectator(addr(1)), 0),
            Err(SessionError::TooManySpectators)
        );
    }

    #[test]
    fn lookups_distinguish_range_from_vacancy() {
        let mut table = PlayerTable::new(2);
        table.add(PlayerType::Local, 0).unwrap();

        let beyond = PlayerHandle::new(500, 0);
        assert!(matches!(
            table.get(beyond),
            Err(SessionError::PlayerOutOfRange { index: 500, .. })
        ));
        let vacant = PlayerHandle::new(1, 0);
        assert_eq!(
            table.get(vacant),
            Err(SessionError::InvalidPlayerHandle { handle: vacant })
        );
        let stale = PlayerHandle::new(0, 3);
        assert_eq!(
            table.get(stale),
            Err(SessionError::InvalidPlayerHandle { handle: stale })
        );
    }

    #[test]
    fn handles_by_address() {
        let mut table = PlayerTable::new(3);
        let a = table.add(PlayerType::Remote(addr(7000)), 0).unwrap();
        let b = table.add(PlayerType::Remote(addr(7000)), 2).unwrap();
        table.add(PlayerType::Remote(addr(7001)), 1).unwrap();
        assert_eq!(table.handles_at(addr(7000)).as_slice(), &[a, b]);
        assert_eq!(table.handle_at_index(2), Some(b));
        assert_eq!(table.handle_at_index(5), None);
    }
}
