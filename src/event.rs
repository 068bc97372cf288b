//! Callback registry and event payloads.
//!
//! Callbacks are installed once, when the Bluetooth object is built, and
//! stay fixed for its lifetime. Firing an empty slot is a silent no-op.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::state::StateChange;

/// Callback taking no arguments.
pub type Callback = Arc<dyn Fn() + Send + Sync>;
/// Receives every state transition.
pub type StateCallback = Arc<dyn Fn(StateChange) + Send + Sync>;
/// Receives peripherals reported by a scan.
pub type DeviceFoundCallback = Arc<dyn Fn(&DeviceInfo) + Send + Sync>;
/// Receives decoded characteristic values (inbound or just written).
pub type ValueCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Peripheral reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
   pub device_id: SmolStr,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
}

/// Service record returned by native enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
   pub uuid: SmolStr,
   pub is_primary: bool,
}

/// Properties advertised by a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
   pub read: bool,
   pub write: bool,
   pub notify: bool,
   pub indicate: bool,
}

/// Characteristic record returned by native enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
   pub uuid: SmolStr,
   pub properties: CharacteristicProperties,
}

/// Named callback slots, each holding at most one callback.
#[derive(Default, Clone)]
pub struct Callbacks {
   on_init: Option<Callback>,
   on_state_change: Option<StateCallback>,
   on_device_found: Option<DeviceFoundCallback>,
   on_connect: Option<Callback>,
   on_disconnect: Option<Callback>,
   on_characteristic_change: Option<ValueCallback>,
   on_characteristic_written: Option<ValueCallback>,
   on_destroy: Option<Callback>,
}

impl fmt::Debug for Callbacks {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Callbacks")
         .field("on_init", &self.on_init.is_some())
         .field("on_state_change", &self.on_state_change.is_some())
         .field("on_device_found", &self.on_device_found.is_some())
         .field("on_connect", &self.on_connect.is_some())
         .field("on_disconnect", &self.on_disconnect.is_some())
         .field(
            "on_characteristic_change",
            &self.on_characteristic_change.is_some(),
         )
         .field(
            "on_characteristic_written",
            &self.on_characteristic_written.is_some(),
         )
         .field("on_destroy", &self.on_destroy.is_some())
         .finish()
   }
}

impl Callbacks {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
      self.on_init = Some(Arc::new(f));
      self
   }

   pub fn on_state_change(mut self, f: impl Fn(StateChange) + Send + Sync + 'static) -> Self {
      self.on_state_change = Some(Arc::new(f));
      self
   }

   /// Takes precedence over any callback passed to a scan call.
   pub fn on_device_found(mut self, f: impl Fn(&DeviceInfo) + Send + Sync + 'static) -> Self {
      self.on_device_found = Some(Arc::new(f));
      self
   }

   pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
      self.on_connect = Some(Arc::new(f));
      self
   }

   pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
      self.on_disconnect = Some(Arc::new(f));
      self
   }

   /// Takes precedence over any callback passed when listening starts.
   pub fn on_characteristic_change(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
      self.on_characteristic_change = Some(Arc::new(f));
      self
   }

   pub fn on_characteristic_written(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
      self.on_characteristic_written = Some(Arc::new(f));
      self
   }

   pub fn on_destroy(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
      self.on_destroy = Some(Arc::new(f));
      self
   }

   /// Picks the device-found callback for a scan: the registry slot wins
   /// over the call-site argument.
   pub(crate) fn device_found_or(
      &self,
      fallback: Option<DeviceFoundCallback>,
   ) -> Option<DeviceFoundCallback> {
      self.on_device_found.clone().or(fallback)
   }

   /// Picks the value-change callback for a subscription: the registry slot
   /// wins over the call-site argument.
   pub(crate) fn characteristic_change_or(
      &self,
      fallback: Option<ValueCallback>,
   ) -> Option<ValueCallback> {
      self.on_characteristic_change.clone().or(fallback)
   }

   pub(crate) fn fire_init(&self) {
      if let Some(cb) = &self.on_init {
         cb();
      }
   }

   pub(crate) fn fire_state_change(&self, change: StateChange) {
      if let Some(cb) = &self.on_state_change {
         cb(change);
      }
   }

   pub(crate) fn fire_connect(&self) {
      if let Some(cb) = &self.on_connect {
         cb();
      }
   }

   pub(crate) fn fire_disconnect(&self) {
      if let Some(cb) = &self.on_disconnect {
         cb();
      }
   }

   pub(crate) fn fire_characteristic_written(&self, value: &str) {
      if let Some(cb) = &self.on_characteristic_written {
         cb(value);
      }
   }

   pub(crate) fn fire_destroy(&self) {
      if let Some(cb) = &self.on_destroy {
         cb();
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use super::*;
   use crate::state::ConnectionState;

   #[test]
   fn test_empty_slots_are_noops() {
      let callbacks = Callbacks::new();
      callbacks.fire_init();
      callbacks.fire_state_change(StateChange::new(ConnectionState::Connected));
      callbacks.fire_connect();
      callbacks.fire_disconnect();
      callbacks.fire_characteristic_written("abc");
      callbacks.fire_destroy();
      assert!(callbacks.device_found_or(None).is_none());
      assert!(callbacks.characteristic_change_or(None).is_none());
   }

   #[test]
   fn test_registry_wins_over_call_site() {
      let hits = Arc::new(AtomicUsize::new(0));
      let registry_hits = hits.clone();
      let callbacks = Callbacks::new().on_characteristic_change(move |_| {
         registry_hits.fetch_add(1, Ordering::SeqCst);
      });

      let call_site: ValueCallback = Arc::new(|_: &str| panic!("call-site callback must not run"));
      let chosen = callbacks.characteristic_change_or(Some(call_site)).unwrap();
      chosen("x");
      assert_eq!(hits.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn test_call_site_used_when_registry_empty() {
      let hits = Arc::new(AtomicUsize::new(0));
      let call_hits = hits.clone();
      let call_site: DeviceFoundCallback = Arc::new(move |_: &DeviceInfo| {
         call_hits.fetch_add(1, Ordering::SeqCst);
      });
      let chosen = Callbacks::new().device_found_or(Some(call_site)).unwrap();
      chosen(&DeviceInfo {
         device_id: "AA:BB".into(),
         name: None,
         rssi: Some(-60),
      });
      assert_eq!(hits.load(Ordering::SeqCst), 1);
   }
}
