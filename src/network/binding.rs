//! Association between a connection and its game session.
//!
//! The binding is monotonic: unbound → bound → cleared. It has its own lock,
//! separate from the I/O state, because session teardown may clear it from a
//! thread that does not own the connection.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use super::packet::Packet;

/// Game-logic side of an authenticated connection. Opaque to the engine
/// beyond routing.
pub trait GameSession: Send + Sync {
    /// Hand over one decoded gameplay packet.
    fn queue_packet(&self, packet: Packet);

    /// Latency reported by the client in its last ping (ms).
    fn set_latency(&self, _latency: u32) {}

    /// Privileged sessions are exempt from the ping-flood cutoff.
    fn is_privileged(&self) -> bool {
        false
    }

    /// The connection is gone; no more packets will be routed.
    fn on_socket_closed(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("session already bound")]
    AlreadyBound,

    #[error("session binding was cleared")]
    Cleared,
}

enum BindingState {
    Unbound,
    Bound(Arc<dyn GameSession>),
    Cleared,
}

/// Lock-protected, nullable session reference.
///
/// The lock is re-entrant: [`with_session`](Self::with_session) holds it
/// while the session runs, and that session may call [`clear`](Self::clear)
/// on the same thread.
pub struct SessionBinding {
    inner: ReentrantMutex<RefCell<BindingState>>,
}

impl SessionBinding {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(BindingState::Unbound)),
        }
    }

    /// Unbound → bound. Fails in any other state.
    pub fn bind(&self, session: Arc<dyn GameSession>) -> Result<(), BindError> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        match *state {
            BindingState::Unbound => {
                *state = BindingState::Bound(session);
                Ok(())
            }
            BindingState::Bound(_) => Err(BindError::AlreadyBound),
            BindingState::Cleared => Err(BindError::Cleared),
        }
    }

    /// Move to the terminal state, returning the session that was bound.
    pub fn clear(&self) -> Option<Arc<dyn GameSession>> {
        let guard = self.inner.lock();
        let previous = guard.replace(BindingState::Cleared);
        match previous {
            BindingState::Bound(session) => Some(session),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<Arc<dyn GameSession>> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        match &*state {
            BindingState::Bound(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_cleared(&self) -> bool {
        matches!(*self.inner.lock().borrow(), BindingState::Cleared)
    }

    /// Run `f` against the bound session with the binding locked, so a
    /// concurrent clear waits until `f` returns.
    pub fn with_session<R>(&self, f: impl FnOnce(&dyn GameSession) -> R) -> Option<R> {
        let guard = self.inner.lock();
        let session = match &*guard.borrow() {
            BindingState::Bound(session) => Arc::clone(session),
            _ => return None,
        };
        let result = f(session.as_ref());
        drop(guard);
        Some(result)
    }

    /// Route a packet to the bound session. Gives the packet back if there
    /// is none.
    pub fn route(&self, packet: Packet) -> Result<(), Packet> {
        let guard = self.inner.lock();
        let session = match &*guard.borrow() {
            BindingState::Bound(session) => Arc::clone(session),
            _ => return Err(packet),
        };
        session.queue_packet(packet);
        drop(guard);
        Ok(())
    }
}

impl Default for SessionBinding {
    fn default() -> Self {
        Self::new()
    }
}
