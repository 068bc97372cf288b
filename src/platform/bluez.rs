//! BlueZ binding for the server-driven backend.
//!
//! Scanning, link monitoring and notifications are each pumped by a spawned
//! task feeding the handlers registered at init. Dropping a task's stream
//! (by aborting the task) stops the matching BlueZ operation.

use std::{collections::HashMap, fmt::Display, pin::pin, sync::Arc};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session,
   gatt::remote::{Characteristic, Service},
};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use crate::{
   backend::native::{
      ConnectionStateHandler, DeviceFoundHandler, NativePlatform, NotificationHandler,
   },
   dispatch::RawNotification,
   error::{ErrorCode, PlatformError},
   event::{CharacteristicInfo, CharacteristicProperties, DeviceInfo, ServiceInfo},
};

/// Bluetooth base UUID; 16-bit ids expand into bits 96..112.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

fn coded(code: ErrorCode, message: impl Display) -> PlatformError {
   PlatformError::with_code(code as i32, message.to_string())
}

/// Maps a BlueZ failure onto the advisory code table.
fn classify(e: bluer::Error, fallback: ErrorCode) -> PlatformError {
   let code = match e.kind {
      ErrorKind::NotReady => ErrorCode::NotAvailable,
      ErrorKind::ConnectionAttemptFailed => ErrorCode::ConnectionFail,
      ErrorKind::NotSupported | ErrorKind::NotPermitted => ErrorCode::PropertyNotSupport,
      ErrorKind::DoesNotExist => ErrorCode::NoDevice,
      _ => fallback,
   };
   coded(code, e)
}

/// Parses a full UUID or a 16-bit short id such as `FFE0`.
pub fn parse_uuid(id: &str) -> Option<Uuid> {
   if id.len() == 4 {
      let short = u16::from_str_radix(id, 16).ok()?;
      return Some(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96)));
   }
   Uuid::parse_str(id).ok()
}

struct Opened {
   _session: Session,
   adapter: Adapter,
}

#[derive(Default)]
struct Handlers {
   link: Option<ConnectionStateHandler>,
   found: Option<DeviceFoundHandler>,
   value: Option<NotificationHandler>,
}

#[derive(Default)]
struct Inner {
   adapter_name: Option<String>,
   opened: Mutex<Option<Opened>>,
   handlers: Mutex<Handlers>,
   scan: Mutex<Option<JoinHandle<()>>>,
   links: Mutex<HashMap<SmolStr, JoinHandle<()>>>,
   notifications: Mutex<HashMap<(SmolStr, SmolStr), JoinHandle<()>>>,
}

/// [`NativePlatform`] over the system's BlueZ daemon.
#[derive(Clone, Default)]
pub struct BluezPlatform {
   inner: Arc<Inner>,
}

impl BluezPlatform {
   /// Uses the named adapter, or the default one when `None`.
   pub fn new(adapter_name: Option<String>) -> Self {
      Self {
         inner: Arc::new(Inner {
            adapter_name,
            ..Default::default()
         }),
      }
   }

   fn adapter(&self) -> Result<Adapter, PlatformError> {
      self
         .inner
         .opened
         .lock()
         .as_ref()
         .map(|o| o.adapter.clone())
         .ok_or_else(|| coded(ErrorCode::NotInit, "adapter not opened"))
   }

   fn device(&self, device_id: &str) -> Result<Device, PlatformError> {
      let address: Address = device_id
         .parse()
         .map_err(|_| coded(ErrorCode::NoDevice, format!("invalid address {device_id}")))?;
      self
         .adapter()?
         .device(address)
         .map_err(|e| classify(e, ErrorCode::NoDevice))
   }

   async fn service(&self, device: &Device, service_id: &str) -> Result<Service, PlatformError> {
      let wanted = parse_uuid(service_id)
         .ok_or_else(|| coded(ErrorCode::NoService, format!("invalid service id {service_id}")))?;
      let services = device
         .services()
         .await
         .map_err(|e| classify(e, ErrorCode::NoService))?;
      for service in services {
         if service.uuid().await.ok() == Some(wanted) {
            return Ok(service);
         }
      }
      Err(coded(ErrorCode::NoService, format!("service {service_id} not found")))
   }

   async fn characteristic(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
   ) -> Result<Characteristic, PlatformError> {
      let device = self.device(device_id)?;
      let service = self.service(&device, service_id).await?;
      let wanted = parse_uuid(characteristic_id).ok_or_else(|| {
         coded(
            ErrorCode::NoCharacteristic,
            format!("invalid characteristic id {characteristic_id}"),
         )
      })?;
      let characteristics = service
         .characteristics()
         .await
         .map_err(|e| classify(e, ErrorCode::NoCharacteristic))?;
      for characteristic in characteristics {
         if characteristic.uuid().await.ok() == Some(wanted) {
            return Ok(characteristic);
         }
      }
      Err(coded(
         ErrorCode::NoCharacteristic,
         format!("characteristic {characteristic_id} not found"),
      ))
   }

   /// Reports every link change of `device` until it disconnects.
   async fn watch_link(&self, device_id: &str, device: Device) -> Result<(), PlatformError> {
      let inner = self.inner.clone();
      let id: SmolStr = device_id.into();
      let (ready, started) = oneshot::channel();
      let task = tokio::spawn({
         let id = id.clone();
         async move {
            let events = match device.events().await {
               Ok(events) => {
                  let _ = ready.send(Ok(()));
                  events
               },
               Err(e) => {
                  let _ = ready.send(Err(classify(e, ErrorCode::SystemError)));
                  return;
               },
            };
            let mut events = pin!(events);
            while let Some(event) = events.next().await {
               let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event else {
                  continue;
               };
               debug!("Link to {id}: connected={connected}");
               let handler = inner.handlers.lock().link.clone();
               if let Some(handler) = handler {
                  handler(&id, connected);
               }
               if !connected {
                  break;
               }
            }
         }
      });
      if let Some(old) = self.inner.links.lock().insert(id, task) {
         old.abort();
      }
      started_ok(started).await
   }

   fn stop_tasks_of(&self, device_id: &str) {
      if let Some(task) = self.inner.links.lock().remove(device_id) {
         task.abort();
      }
      self.inner.notifications.lock().retain(|(device, _), task| {
         let keep = device != device_id;
         if !keep {
            task.abort();
         }
         keep
      });
   }
}

type Started = oneshot::Receiver<Result<(), PlatformError>>;

/// Waits for a pump task to report whether its stream opened.
async fn started_ok(started: Started) -> Result<(), PlatformError> {
   started
      .await
      .unwrap_or_else(|_| Err(coded(ErrorCode::SystemError, "event task ended early")))
}

async fn describe_device(adapter: &Adapter, address: Address) -> DeviceInfo {
   let (name, rssi) = match adapter.device(address) {
      Ok(device) => (
         device.name().await.ok().flatten(),
         device.rssi().await.ok().flatten(),
      ),
      Err(_) => (None, None),
   };
   DeviceInfo {
      device_id: address.to_smolstr(),
      name: name.map(SmolStr::from),
      rssi,
   }
}

impl NativePlatform for BluezPlatform {
   async fn open_adapter(&self) -> Result<(), PlatformError> {
      let session = Session::new()
         .await
         .map_err(|e| classify(e, ErrorCode::NotInit))?;
      let adapter = match &self.inner.adapter_name {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      }
      .map_err(|e| classify(e, ErrorCode::NotAvailable))?;

      if !adapter.is_powered().await.unwrap_or(false) {
         adapter
            .set_powered(true)
            .await
            .map_err(|e| classify(e, ErrorCode::NotAvailable))?;
      }
      info!("Using Bluetooth adapter {}", adapter.name());

      *self.inner.opened.lock() = Some(Opened {
         _session: session,
         adapter,
      });
      Ok(())
   }

   async fn close_adapter(&self) -> Result<(), PlatformError> {
      if let Some(scan) = self.inner.scan.lock().take() {
         scan.abort();
      }
      for (_, task) in self.inner.links.lock().drain() {
         task.abort();
      }
      for (_, task) in self.inner.notifications.lock().drain() {
         task.abort();
      }
      self.inner.opened.lock().take();
      debug!("Adapter closed");
      Ok(())
   }

   fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
      self.inner.handlers.lock().link = Some(handler);
   }

   fn on_device_found(&self, handler: DeviceFoundHandler) {
      self.inner.handlers.lock().found = Some(handler);
   }

   fn on_value_change(&self, handler: NotificationHandler) {
      self.inner.handlers.lock().value = Some(handler);
   }

   async fn start_discovery(&self) -> Result<(), PlatformError> {
      let adapter = self.adapter()?;
      let inner = self.inner.clone();
      let (ready, started) = oneshot::channel();
      let task = tokio::spawn(async move {
         let events = match adapter.discover_devices().await {
            Ok(events) => {
               let _ = ready.send(Ok(()));
               events
            },
            Err(e) => {
               let _ = ready.send(Err(classify(e, ErrorCode::SystemError)));
               return;
            },
         };
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
               continue;
            };
            let info = describe_device(&adapter, address).await;
            let handler = inner.handlers.lock().found.clone();
            if let Some(handler) = handler {
               handler(info);
            }
         }
      });
      if let Some(old) = self.inner.scan.lock().replace(task) {
         old.abort();
      }
      started_ok(started).await
   }

   async fn stop_discovery(&self) -> Result<(), PlatformError> {
      if let Some(scan) = self.inner.scan.lock().take() {
         scan.abort();
      }
      Ok(())
   }

   async fn create_connection(&self, device_id: &str) -> Result<(), PlatformError> {
      let device = self.device(device_id)?;
      if !device.is_connected().await.unwrap_or(false) {
         device
            .connect()
            .await
            .map_err(|e| classify(e, ErrorCode::ConnectionFail))?;
      }
      self.watch_link(device_id, device).await
   }

   async fn close_connection(&self, device_id: &str) -> Result<(), PlatformError> {
      self.stop_tasks_of(device_id);
      let device = self.device(device_id)?;
      device
         .disconnect()
         .await
         .map_err(|e| classify(e, ErrorCode::SystemError))
   }

   async fn set_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, PlatformError> {
      // BlueZ negotiates the ATT MTU on its own; report what is in effect.
      let device = self.device(device_id)?;
      let services = device
         .services()
         .await
         .map_err(|e| classify(e, ErrorCode::NoService))?;
      for service in services {
         let Ok(characteristics) = service.characteristics().await else {
            continue;
         };
         if let Some(characteristic) = characteristics.first() {
            let effective = characteristic
               .mtu()
               .await
               .map_err(|e| classify(e, ErrorCode::SystemError))?;
            let effective = u16::try_from(effective).unwrap_or(u16::MAX);
            if effective < mtu {
               warn!("Requested MTU {mtu}, link negotiated {effective}");
            }
            return Ok(effective);
         }
      }
      Err(coded(ErrorCode::NoCharacteristic, "no characteristic to query MTU"))
   }

   async fn services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, PlatformError> {
      let device = self.device(device_id)?;
      let services = device
         .services()
         .await
         .map_err(|e| classify(e, ErrorCode::NoService))?;
      let mut infos = Vec::with_capacity(services.len());
      for service in services {
         let uuid = service
            .uuid()
            .await
            .map_err(|e| classify(e, ErrorCode::NoService))?;
         infos.push(ServiceInfo {
            uuid: uuid.to_smolstr(),
            is_primary: service.primary().await.unwrap_or(true),
         });
      }
      Ok(infos)
   }

   async fn characteristics(
      &self,
      device_id: &str,
      service_id: &str,
   ) -> Result<Vec<CharacteristicInfo>, PlatformError> {
      let device = self.device(device_id)?;
      let service = self.service(&device, service_id).await?;
      let characteristics = service
         .characteristics()
         .await
         .map_err(|e| classify(e, ErrorCode::NoCharacteristic))?;
      let mut infos = Vec::with_capacity(characteristics.len());
      for characteristic in characteristics {
         let uuid = characteristic
            .uuid()
            .await
            .map_err(|e| classify(e, ErrorCode::NoCharacteristic))?;
         let flags = characteristic
            .flags()
            .await
            .map_err(|e| classify(e, ErrorCode::NoCharacteristic))?;
         infos.push(CharacteristicInfo {
            uuid: uuid.to_smolstr(),
            properties: CharacteristicProperties {
               read: flags.read,
               write: flags.write || flags.write_without_response,
               notify: flags.notify,
               indicate: flags.indicate,
            },
         });
      }
      Ok(infos)
   }

   async fn rssi(&self, device_id: &str) -> Result<i16, PlatformError> {
      let device = self.device(device_id)?;
      device
         .rssi()
         .await
         .map_err(|e| classify(e, ErrorCode::SystemError))?
         .ok_or_else(|| coded(ErrorCode::NoConnection, "RSSI not available"))
   }

   async fn write_value(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      value: &[u8],
   ) -> Result<(), PlatformError> {
      let characteristic = self
         .characteristic(device_id, service_id, characteristic_id)
         .await?;
      characteristic
         .write(value)
         .await
         .map_err(|e| classify(e, ErrorCode::SystemError))
   }

   async fn set_notify(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      enable: bool,
   ) -> Result<(), PlatformError> {
      let key: (SmolStr, SmolStr) = (device_id.into(), characteristic_id.into());
      if !enable {
         if let Some(task) = self.inner.notifications.lock().remove(&key) {
            task.abort();
         }
         return Ok(());
      }

      let characteristic = self
         .characteristic(device_id, service_id, characteristic_id)
         .await?;
      let inner = self.inner.clone();
      let (device_id, service_id) = (key.0.clone(), SmolStr::from(service_id));
      let characteristic_id = key.1.clone();
      let (ready, started) = oneshot::channel();
      let task = tokio::spawn(async move {
         let values = match characteristic.notify().await {
            Ok(values) => {
               let _ = ready.send(Ok(()));
               values
            },
            Err(e) => {
               let _ = ready.send(Err(classify(e, ErrorCode::PropertyNotSupport)));
               return;
            },
         };
         let mut values = pin!(values);
         while let Some(value) = values.next().await {
            let handler = inner.handlers.lock().value.clone();
            if let Some(handler) = handler {
               handler(RawNotification {
                  device_id: device_id.clone(),
                  service_id: service_id.clone(),
                  characteristic_id: characteristic_id.clone(),
                  value,
               });
            }
         }
         debug!("Notification stream of {characteristic_id} ended");
      });
      if let Some(old) = self.inner.notifications.lock().insert(key, task) {
         old.abort();
      }
      started_ok(started).await
   }
}
