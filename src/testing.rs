//! Scripted platforms for unit tests.
//!
//! Both mocks record every platform call, can be told to fail specific calls
//! and can raise the events a real platform would deliver. Event handlers are
//! always invoked after the mock's own lock is released.

use std::{
   cell::RefCell,
   collections::{HashMap, HashSet},
   rc::Rc,
   sync::Arc,
};

pub use futures::executor::block_on;
use parking_lot::Mutex;
use smol_str::{SmolStr, format_smolstr};

use crate::{
   backend::{
      native::{ConnectionStateHandler, DeviceFoundHandler, NativePlatform, NotificationHandler},
      web::{
         DisconnectHandler, GattCharacteristic, GattPlatform, GattServer, GattService,
         ValueChangedHandler,
      },
   },
   config::RequestDeviceOptions,
   dispatch::{RawNotification, ValueChangedEvent, ValueTarget},
   error::PlatformError,
   event::{CharacteristicInfo, CharacteristicProperties, DeviceInfo, ServiceInfo},
};

// === Server-driven ===

#[derive(Default)]
struct NativeState {
   calls: Vec<String>,
   failures: HashMap<&'static str, i32>,
   connected: Option<SmolStr>,
   on_link: Option<ConnectionStateHandler>,
   on_found: Option<DeviceFoundHandler>,
   on_value: Option<NotificationHandler>,
}

/// Server-driven platform double.
#[derive(Clone, Default)]
pub struct MockNative {
   inner: Arc<Mutex<NativeState>>,
}

impl MockNative {
   pub fn new() -> Self {
      Self::default()
   }

   /// Every call so far, formatted as `"name arg arg"`.
   pub fn calls(&self) -> Vec<String> {
      self.inner.lock().calls.clone()
   }

   pub fn count(&self, call: &str) -> usize {
      let prefix = format!("{call} ");
      self
         .inner
         .lock()
         .calls
         .iter()
         .filter(|c| *c == call || c.starts_with(&prefix))
         .count()
   }

   /// Makes every later `call` fail with `code`.
   pub fn fail(&self, call: &'static str, code: i32) {
      self.inner.lock().failures.insert(call, code);
   }

   pub fn succeed(&self, call: &'static str) {
      self.inner.lock().failures.remove(call);
   }

   /// Reports that the link to `device` went down.
   pub fn drop_link(&self, device: &str) {
      let handler = {
         let mut state = self.inner.lock();
         if state.connected.as_deref() == Some(device) {
            state.connected = None;
         }
         state.on_link.clone()
      };
      if let Some(handler) = handler {
         handler(device, false);
      }
   }

   pub fn notify(&self, characteristic_id: &str, value: &[u8]) {
      let (handler, device) = {
         let state = self.inner.lock();
         (state.on_value.clone(), state.connected.clone().unwrap_or_default())
      };
      if let Some(handler) = handler {
         handler(RawNotification {
            device_id: device,
            service_id: "ffe0".into(),
            characteristic_id: characteristic_id.into(),
            value: value.to_vec(),
         });
      }
   }

   pub fn discover(&self, device_id: &str, name: &str) {
      let handler = self.inner.lock().on_found.clone();
      if let Some(handler) = handler {
         handler(DeviceInfo {
            device_id: device_id.into(),
            name: Some(name.into()),
            rssi: Some(-48),
         });
      }
   }

   fn record(&self, call: &'static str, args: &[&str]) -> Result<(), PlatformError> {
      let mut state = self.inner.lock();
      let mut line = call.to_string();
      for arg in args {
         line.push(' ');
         line.push_str(arg);
      }
      state.calls.push(line);
      match state.failures.get(call) {
         Some(&code) => Err(PlatformError::with_code(code, format!("{call} failed"))),
         None => Ok(()),
      }
   }
}

impl NativePlatform for MockNative {
   async fn open_adapter(&self) -> Result<(), PlatformError> {
      self.record("open_adapter", &[])
   }

   async fn close_adapter(&self) -> Result<(), PlatformError> {
      self.record("close_adapter", &[])
   }

   fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
      self.inner.lock().on_link = Some(handler);
   }

   fn on_device_found(&self, handler: DeviceFoundHandler) {
      self.inner.lock().on_found = Some(handler);
   }

   fn on_value_change(&self, handler: NotificationHandler) {
      self.inner.lock().on_value = Some(handler);
   }

   async fn start_discovery(&self) -> Result<(), PlatformError> {
      self.record("start_discovery", &[])
   }

   async fn stop_discovery(&self) -> Result<(), PlatformError> {
      self.record("stop_discovery", &[])
   }

   async fn create_connection(&self, device_id: &str) -> Result<(), PlatformError> {
      self.record("create_connection", &[device_id])?;
      self.inner.lock().connected = Some(device_id.into());
      Ok(())
   }

   async fn close_connection(&self, device_id: &str) -> Result<(), PlatformError> {
      self.record("close_connection", &[device_id])?;
      self.inner.lock().connected = None;
      Ok(())
   }

   async fn set_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, PlatformError> {
      self.record("set_mtu", &[device_id, &mtu.to_string()])?;
      Ok(mtu)
   }

   async fn services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, PlatformError> {
      self.record("services", &[device_id])?;
      Ok(vec![ServiceInfo {
         uuid: "0000ffe0-0000-1000-8000-00805f9b34fb".into(),
         is_primary: true,
      }])
   }

   async fn characteristics(
      &self,
      device_id: &str,
      service_id: &str,
   ) -> Result<Vec<CharacteristicInfo>, PlatformError> {
      self.record("characteristics", &[device_id, service_id])?;
      Ok(vec![CharacteristicInfo {
         uuid: "0000ffe1-0000-1000-8000-00805f9b34fb".into(),
         properties: CharacteristicProperties {
            read: true,
            write: true,
            notify: true,
            indicate: false,
         },
      }])
   }

   async fn rssi(&self, device_id: &str) -> Result<i16, PlatformError> {
      self.record("rssi", &[device_id])?;
      Ok(-61)
   }

   async fn write_value(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      value: &[u8],
   ) -> Result<(), PlatformError> {
      self.record(
         "write_value",
         &[device_id, service_id, characteristic_id, &hex::encode(value)],
      )
   }

   async fn set_notify(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      enable: bool,
   ) -> Result<(), PlatformError> {
      self.record(
         "set_notify",
         &[device_id, service_id, characteristic_id, &enable.to_string()],
      )
   }
}

// === Client-driven ===

#[derive(Default)]
struct GattState {
   unavailable: bool,
   reject_request: bool,
   fail_writes: bool,
   servers: usize,
   options: Vec<RequestDeviceOptions>,
   service_requests: Vec<String>,
   characteristic_requests: Vec<String>,
   failing_services: HashSet<String>,
   failing_characteristics: HashSet<String>,
   disconnects: usize,
   disconnect_handlers: Vec<(usize, Rc<dyn Fn()>)>,
   value_handlers: Vec<(SmolStr, Rc<dyn Fn(ValueChangedEvent)>)>,
   writes: Vec<(SmolStr, Vec<u8>)>,
   notifying: HashSet<SmolStr>,
}

/// Client-driven platform double.
#[derive(Clone, Default)]
pub struct MockGatt {
   inner: Rc<RefCell<GattState>>,
}

impl MockGatt {
   pub fn new() -> Self {
      Self::default()
   }

   /// A server handle that bypasses device selection.
   pub fn server(&self) -> MockServer {
      let index = {
         let mut state = self.inner.borrow_mut();
         state.servers += 1;
         state.servers
      };
      MockServer {
         gatt: self.clone(),
         index,
      }
   }

   pub fn set_available(&self, available: bool) {
      self.inner.borrow_mut().unavailable = !available;
   }

   pub fn reject_request(&self) {
      self.inner.borrow_mut().reject_request = true;
   }

   pub fn fail_writes(&self) {
      self.inner.borrow_mut().fail_writes = true;
   }

   pub fn fail_service(&self, uuid: &str) {
      self.inner.borrow_mut().failing_services.insert(uuid.into());
   }

   pub fn fail_characteristic(&self, uuid: &str) {
      self
         .inner
         .borrow_mut()
         .failing_characteristics
         .insert(uuid.into());
   }

   pub fn service_requests(&self) -> Vec<String> {
      self.inner.borrow().service_requests.clone()
   }

   pub fn characteristic_requests(&self) -> Vec<String> {
      self.inner.borrow().characteristic_requests.clone()
   }

   /// Options passed to every device request so far.
   pub fn requested_options(&self) -> Vec<RequestDeviceOptions> {
      self.inner.borrow().options.clone()
   }

   pub fn writes(&self) -> Vec<(SmolStr, Vec<u8>)> {
      self.inner.borrow().writes.clone()
   }

   pub fn disconnects(&self) -> usize {
      self.inner.borrow().disconnects
   }

   pub fn is_notifying(&self, uuid: &str) -> bool {
      self.inner.borrow().notifying.contains(uuid)
   }

   pub fn value_listeners(&self, uuid: &str) -> usize {
      self
         .inner
         .borrow()
         .value_handlers
         .iter()
         .filter(|(u, _)| u == uuid)
         .count()
   }

   /// Raises `gattserverdisconnected` on every server handed out so far.
   pub fn drop_link(&self) {
      let handlers: Vec<_> = self
         .inner
         .borrow()
         .disconnect_handlers
         .iter()
         .map(|(_, h)| h.clone())
         .collect();
      for handler in handlers {
         handler();
      }
   }

   /// Raises `characteristicvaluechanged` on `uuid`.
   pub fn notify(&self, uuid: &str, value: &[u8]) {
      let handlers: Vec<_> = self
         .inner
         .borrow()
         .value_handlers
         .iter()
         .filter(|(u, _)| u == uuid)
         .map(|(_, h)| h.clone())
         .collect();
      for handler in handlers {
         handler(ValueChangedEvent {
            target: ValueTarget {
               uuid: uuid.into(),
               value: value.to_vec(),
            },
         });
      }
   }
}

impl GattPlatform for MockGatt {
   type Server = MockServer;

   fn is_available(&self) -> bool {
      !self.inner.borrow().unavailable
   }

   async fn request_device(
      &self,
      options: &RequestDeviceOptions,
   ) -> Result<MockServer, PlatformError> {
      let rejected = {
         let mut state = self.inner.borrow_mut();
         state.options.push(options.clone());
         state.reject_request
      };
      if rejected {
         return Err(PlatformError::opaque(
            "NotFoundError: User cancelled the requestDevice() chooser.",
         ));
      }
      Ok(self.server())
   }
}

#[derive(Clone)]
pub struct MockServer {
   gatt: MockGatt,
   index: usize,
}

impl GattServer for MockServer {
   type Service = MockService;

   fn device_id(&self) -> SmolStr {
      format_smolstr!("device-{}", self.index)
   }

   async fn primary_service(&self, uuid: &str) -> Result<MockService, PlatformError> {
      let failing = {
         let mut state = self.gatt.inner.borrow_mut();
         state.service_requests.push(uuid.to_string());
         state.failing_services.contains(uuid)
      };
      if failing {
         return Err(PlatformError::opaque(format!(
            "NotFoundError: No Services matching UUID {uuid} found in Device."
         )));
      }
      Ok(MockService {
         gatt: self.gatt.clone(),
         uuid: uuid.into(),
      })
   }

   fn disconnect(&self) {
      let handlers: Vec<_> = {
         let mut state = self.gatt.inner.borrow_mut();
         state.disconnects += 1;
         state
            .disconnect_handlers
            .iter()
            .filter(|(index, _)| *index == self.index)
            .map(|(_, h)| h.clone())
            .collect()
      };
      for handler in handlers {
         handler();
      }
   }

   fn on_disconnected(&self, handler: DisconnectHandler) {
      self
         .gatt
         .inner
         .borrow_mut()
         .disconnect_handlers
         .push((self.index, Rc::from(handler)));
   }
}

#[derive(Clone)]
pub struct MockService {
   gatt: MockGatt,
   uuid: SmolStr,
}

impl GattService for MockService {
   type Characteristic = MockCharacteristic;

   fn uuid(&self) -> SmolStr {
      self.uuid.clone()
   }

   async fn characteristic(&self, uuid: &str) -> Result<MockCharacteristic, PlatformError> {
      let failing = {
         let mut state = self.gatt.inner.borrow_mut();
         state.characteristic_requests.push(uuid.to_string());
         state.failing_characteristics.contains(uuid)
      };
      if failing {
         return Err(PlatformError::opaque(format!(
            "NotFoundError: No Characteristics matching UUID {uuid} found in Service."
         )));
      }
      Ok(MockCharacteristic {
         gatt: self.gatt.clone(),
         uuid: uuid.into(),
      })
   }
}

#[derive(Clone)]
pub struct MockCharacteristic {
   gatt: MockGatt,
   uuid: SmolStr,
}

impl GattCharacteristic for MockCharacteristic {
   fn uuid(&self) -> SmolStr {
      self.uuid.clone()
   }

   async fn write_value(&self, value: &[u8]) -> Result<(), PlatformError> {
      let mut state = self.gatt.inner.borrow_mut();
      if state.fail_writes {
         return Err(PlatformError::opaque("NetworkError: GATT operation failed."));
      }
      state.writes.push((self.uuid.clone(), value.to_vec()));
      Ok(())
   }

   async fn start_notifications(&self) -> Result<(), PlatformError> {
      self.gatt.inner.borrow_mut().notifying.insert(self.uuid.clone());
      Ok(())
   }

   async fn stop_notifications(&self) -> Result<(), PlatformError> {
      self.gatt.inner.borrow_mut().notifying.remove(&self.uuid);
      Ok(())
   }

   fn on_value_changed(&self, handler: ValueChangedHandler) {
      self
         .gatt
         .inner
         .borrow_mut()
         .value_handlers
         .push((self.uuid.clone(), Rc::from(handler)));
   }
}
