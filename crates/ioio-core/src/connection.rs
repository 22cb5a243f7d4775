use crate::allocator::ResourceAllocator;

/// Identifies one connected session. Incremented on every entry into
/// [`ConnectionState::Connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Epoch(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Resetting,
}

/// Connection lifecycle: `Disconnected → Connecting → Connected →
/// (Disconnected | Resetting)`.
///
/// Every transition out of `Connected` takes the allocator and invalidates
/// all live handles before the new state is stored, so nobody can observe a
/// non-connected state while stale handles are still live.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    epoch: Epoch,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Disconnected, before the first session.
    pub const fn new() -> Self {
        Self { state: ConnectionState::Disconnected, epoch: Epoch(0) }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Epoch of the most recent connected session.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// `true` only in `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The epoch handles may be issued under, if connected.
    pub fn current_epoch(&self) -> Option<Epoch> {
        self.is_connected().then_some(self.epoch)
    }

    /// `Disconnected → Connecting`. Returns `false` in any other state.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.enter(ConnectionState::Connecting);
        true
    }

    /// `Connecting → Connected` with a fresh epoch.
    ///
    /// Returns `None` if the attempt was cancelled in the meantime (the state
    /// is no longer `Connecting`).
    pub fn complete_connect(&mut self) -> Option<Epoch> {
        if self.state != ConnectionState::Connecting {
            return None;
        }
        Some(self.enter_new_epoch())
    }

    /// `Connecting → Disconnected` after a failed or aborted handshake.
    pub fn abandon_connect(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.enter(ConnectionState::Disconnected);
        }
    }

    /// `Connected → Resetting`, invalidating every handle.
    pub fn begin_reset(&mut self, allocator: &mut ResourceAllocator) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        allocator.invalidate_all();
        self.enter(ConnectionState::Resetting);
        true
    }

    /// `Resetting → Connected` on the same link with a fresh epoch.
    pub fn complete_reset(&mut self) -> Option<Epoch> {
        if self.state != ConnectionState::Resetting {
            return None;
        }
        Some(self.enter_new_epoch())
    }

    /// Any state `→ Disconnected`, invalidating every handle.
    ///
    /// Returns the state that was left.
    pub fn drop_link(
        &mut self,
        allocator: &mut ResourceAllocator,
    ) -> ConnectionState {
        let previous = self.state;
        allocator.invalidate_all();
        self.enter(ConnectionState::Disconnected);
        previous
    }

    fn enter_new_epoch(&mut self) -> Epoch {
        self.epoch = Epoch(self.epoch.0.wrapping_add(1));
        self.enter(ConnectionState::Connected);
        self.epoch
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!("connection {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }
}
