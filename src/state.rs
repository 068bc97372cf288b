//! Connection lifecycle state machine.
//!
//! A single [`StateMachine`] owns the current [`ConnectionState`] of a
//! Bluetooth object, rejects illegal transitions and remembers the state held
//! before the most recent transition so that listening can be undone.

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
   error::{BleError, Result},
   event::Callbacks,
};

/// Connection status of a Bluetooth object.
///
/// The integer code is part of the public contract; names and codes map
/// symmetrically through [`Self::code`]/[`Self::from_code`] and
/// `Display`/`FromStr`.
#[repr(i8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   /// Scanning for peripherals, not connected.
   Discovering = -2,
   /// Idle: no scan, no connection.
   Unconnected = -1,
   /// Connect request in flight.
   Connecting = 0,
   /// Session established, idle.
   Connected = 1,
   /// Connected and subscribed to characteristic notifications.
   Listening = 2,
}

impl ConnectionState {
   pub const fn code(self) -> i8 {
      self as i8
   }

   pub fn from_code(code: i8) -> Option<Self> {
      Self::from_repr(code)
   }

   pub fn name(self) -> &'static str {
      self.into()
   }

   /// A state counts as connected iff its code is positive.
   pub const fn is_connected(self) -> bool {
      self.code() > 0
   }

   /// Whether the lifecycle allows moving from `self` to `to`.
   pub const fn can_transition(self, to: Self) -> bool {
      use ConnectionState::*;
      matches!(
         (self, to),
         (Unconnected, Discovering)
            | (Discovering, Unconnected)
            | (Unconnected | Discovering, Connecting)
            | (Connecting, Connected | Unconnected)
            | (Connected, Listening)
            | (Listening, Connected)
            | (Connected | Listening, Unconnected)
      )
   }
}

/// Payload passed to `on_state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
   pub state: ConnectionState,
   pub connected: bool,
}

impl StateChange {
   pub const fn new(state: ConnectionState) -> Self {
      Self {
         state,
         connected: state.is_connected(),
      }
   }
}

/// Single source of truth for connection status.
///
/// The previous-state slot has depth exactly one: it is overwritten on every
/// transition and never stacked. Listening can only be entered from
/// connected, so one slot is enough to undo it.
#[derive(Debug)]
pub struct StateMachine {
   current: ConnectionState,
   previous: Option<ConnectionState>,
}

impl Default for StateMachine {
   fn default() -> Self {
      Self::new()
   }
}

impl StateMachine {
   pub const fn new() -> Self {
      Self {
         current: ConnectionState::Unconnected,
         previous: None,
      }
   }

   pub const fn current(&self) -> ConnectionState {
      self.current
   }

   pub const fn previous(&self) -> Option<ConnectionState> {
      self.previous
   }

   pub const fn is_connected(&self) -> bool {
      self.current.is_connected()
   }

   /// Moves to `to` if the lifecycle allows it.
   ///
   /// The returned change must be delivered to `on_state_change` by the
   /// caller once any lock around the machine has been released.
   pub fn transition(&mut self, to: ConnectionState) -> Result<StateChange> {
      if !self.current.can_transition(to) {
         return Err(BleError::InvalidTransition {
            from: self.current,
            to,
         });
      }
      Ok(self.apply(to))
   }

   /// Moves to `to` only when that is a legal transition, otherwise leaves
   /// the state untouched.
   pub fn try_transition(&mut self, to: ConnectionState) -> Option<StateChange> {
      self.transition(to).ok()
   }

   /// Returns to the state recorded before the most recent transition.
   pub fn restore(&mut self) -> Result<StateChange> {
      match self.previous {
         Some(previous) => self.transition(previous),
         None => Err(BleError::InvalidTransition {
            from: self.current,
            to: self.current,
         }),
      }
   }

   fn apply(&mut self, to: ConnectionState) -> StateChange {
      debug!("State {} -> {}", self.current, to);
      self.previous = Some(self.current);
      self.current = to;
      StateChange::new(to)
   }
}

/// State machine shared between the facade and platform event handlers.
///
/// Every accepted transition is reported to `on_state_change` after the lock
/// is released, so callbacks may read the state again.
pub struct Lifecycle {
   machine: Mutex<StateMachine>,
   callbacks: Callbacks,
}

impl Lifecycle {
   pub fn new(callbacks: Callbacks) -> Self {
      Self {
         machine: Mutex::new(StateMachine::new()),
         callbacks,
      }
   }

   pub fn callbacks(&self) -> &Callbacks {
      &self.callbacks
   }

   pub fn state(&self) -> ConnectionState {
      self.machine.lock().current()
   }

   pub fn is_connected(&self) -> bool {
      self.state().is_connected()
   }

   pub fn transition(&self, to: ConnectionState) -> Result<()> {
      let change = self.machine.lock().transition(to)?;
      self.callbacks.fire_state_change(change);
      Ok(())
   }

   /// Like [`Self::transition`], but an illegal move is silently skipped.
   pub fn try_transition(&self, to: ConnectionState) -> bool {
      let change = self.machine.lock().try_transition(to);
      match change {
         Some(change) => {
            self.callbacks.fire_state_change(change);
            true
         },
         None => false,
      }
   }

   /// Moves to `to` only while the current state is `from`.
   pub fn transition_if(&self, from: ConnectionState, to: ConnectionState) -> bool {
      let change = {
         let mut machine = self.machine.lock();
         if machine.current() != from {
            return false;
         }
         machine.try_transition(to)
      };
      match change {
         Some(change) => {
            self.callbacks.fire_state_change(change);
            true
         },
         None => false,
      }
   }

   /// Undoes `from` by returning to the previous state, if `from` is
   /// current.
   pub fn restore_from(&self, from: ConnectionState) -> bool {
      let change = {
         let mut machine = self.machine.lock();
         if machine.current() != from {
            return false;
         }
         machine.restore().ok()
      };
      match change {
         Some(change) => {
            self.callbacks.fire_state_change(change);
            true
         },
         None => false,
      }
   }

   /// Ends an established session: moves to unconnected, then fires
   /// `on_disconnect` followed by `on_state_change`.
   ///
   /// Returns false (and fires nothing) when no session was established, so
   /// a link loss racing an explicit disconnect is reported once.
   pub fn end_session(&self) -> bool {
      let change = {
         let mut machine = self.machine.lock();
         if !machine.is_connected() {
            return false;
         }
         machine.apply(ConnectionState::Unconnected)
      };
      self.callbacks.fire_disconnect();
      self.callbacks.fire_state_change(change);
      true
   }
}
