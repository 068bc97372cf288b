//! Characteristic value dispatch and the byte/string codec.
//!
//! Peripherals talking to this client assume a one-byte-per-character
//! encoding: every byte maps to the character with the same code, and every
//! outbound character is truncated to its low byte. This is not text
//! decoding and must not be replaced by UTF-8.

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::event::ValueCallback;

/// Encoded characteristic payload.
pub type Payload = SmallVec<[u8; 32]>;

/// Encodes `value` with one byte per UTF-16 code unit (low byte kept).
pub fn encode(value: &str) -> Payload {
   value.encode_utf16().map(|unit| unit as u8).collect()
}

/// Decodes `bytes` by mapping each byte to the character with that code.
pub fn decode(bytes: &[u8]) -> String {
   bytes.iter().copied().map(char::from).collect()
}

/// Value notification delivered by a native platform callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
   pub device_id: SmolStr,
   pub service_id: SmolStr,
   pub characteristic_id: SmolStr,
   pub value: Vec<u8>,
}

/// Browser-style `characteristicvaluechanged` event; the buffer sits inside
/// the target's `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChangedEvent {
   pub target: ValueTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTarget {
   pub uuid: SmolStr,
   pub value: Vec<u8>,
}

/// Either inbound event shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueEvent {
   Raw(RawNotification),
   Changed(ValueChangedEvent),
}

impl ValueEvent {
   pub fn characteristic(&self) -> &str {
      match self {
         Self::Raw(n) => &n.characteristic_id,
         Self::Changed(e) => &e.target.uuid,
      }
   }

   pub fn bytes(&self) -> &[u8] {
      match self {
         Self::Raw(n) => &n.value,
         Self::Changed(e) => &e.target.value,
      }
   }
}

impl From<RawNotification> for ValueEvent {
   fn from(n: RawNotification) -> Self {
      Self::Raw(n)
   }
}

impl From<ValueChangedEvent> for ValueEvent {
   fn from(e: ValueChangedEvent) -> Self {
      Self::Changed(e)
   }
}

/// Routes inbound value events from either backend into the single
/// characteristic-change callback.
#[derive(Default)]
pub struct Dispatcher {
   listener: Mutex<Option<ValueCallback>>,
}

impl Dispatcher {
   pub fn new() -> Self {
      Self::default()
   }

   /// Installs the listener receiving decoded values and returns the one it
   /// replaced.
   pub fn listen(&self, callback: Option<ValueCallback>) -> Option<ValueCallback> {
      std::mem::replace(&mut *self.listener.lock(), callback)
   }

   pub fn clear(&self) {
      self.listener.lock().take();
   }

   pub fn is_listening(&self) -> bool {
      self.listener.lock().is_some()
   }

   /// Decodes `event` and hands it to the listener, if any.
   ///
   /// The listener runs after the slot lock is released, so it may re-enter
   /// the dispatcher.
   pub fn dispatch(&self, event: impl Into<ValueEvent>) {
      let event = event.into();
      debug!(
         "← {}: {}",
         event.characteristic(),
         hex::encode(event.bytes())
      );
      let listener = self.listener.lock().clone();
      if let Some(listener) = listener {
         listener(&decode(event.bytes()));
      }
   }
}
