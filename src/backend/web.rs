//! Client-driven backend.
//!
//! WebBluetooth-style platforms pick the peripheral as part of connect and
//! hand out object handles: a GATT server, then one service object per
//! discovery request, then one characteristic object per request. Value
//! changes are delivered as events on the characteristic object.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   backend::{Backend, PlatformEvents},
   config::RequestDeviceOptions,
   dispatch::ValueChangedEvent,
   error::{BleError, PlatformError, Result},
   resolver::{self, Bindings, DeviceHandle, GattHandle, IdType},
};

/// Receives `gattserverdisconnected`.
pub type DisconnectHandler = Box<dyn Fn()>;
/// Receives `characteristicvaluechanged`.
pub type ValueChangedHandler = Box<dyn Fn(ValueChangedEvent)>;

/// Entry point of a client-driven platform (`navigator.bluetooth`).
#[allow(async_fn_in_trait)]
pub trait GattPlatform: 'static {
   type Server: GattServer;

   /// Whether the host exposes BLE at all.
   fn is_available(&self) -> bool;

   /// Lets the host pick a device matching `options` and connects its GATT
   /// server.
   async fn request_device(
      &self,
      options: &RequestDeviceOptions,
   ) -> Result<Self::Server, PlatformError>;
}

/// Connected GATT server of the selected device.
#[allow(async_fn_in_trait)]
pub trait GattServer: Clone + 'static {
   type Service: GattService;

   fn device_id(&self) -> SmolStr;

   async fn primary_service(&self, uuid: &str) -> Result<Self::Service, PlatformError>;

   fn disconnect(&self);

   fn on_disconnected(&self, handler: DisconnectHandler);
}

#[allow(async_fn_in_trait)]
pub trait GattService: Clone + 'static {
   type Characteristic: GattCharacteristic;

   fn uuid(&self) -> SmolStr;

   async fn characteristic(&self, uuid: &str) -> Result<Self::Characteristic, PlatformError>;
}

#[allow(async_fn_in_trait)]
pub trait GattCharacteristic: Clone + 'static {
   fn uuid(&self) -> SmolStr;

   async fn write_value(&self, value: &[u8]) -> Result<(), PlatformError>;

   async fn start_notifications(&self) -> Result<(), PlatformError>;

   async fn stop_notifications(&self) -> Result<(), PlatformError>;

   fn on_value_changed(&self, handler: ValueChangedHandler);
}

pub type ServiceOf<S> = <S as GattServer>::Service;
pub type CharacteristicOf<S> = <ServiceOf<S> as GattService>::Characteristic;

type ServerOf<G> = <G as GattPlatform>::Server;

struct WebSession<S: GattServer> {
   epoch: u64,
   server: S,
   handle: DeviceHandle<GattHandle<S>>,
}

type Session<S> = Arc<Mutex<Option<WebSession<S>>>>;

/// Backend over a [`GattPlatform`].
pub struct WebBackend<G: GattPlatform> {
   platform: G,
   options: RequestDeviceOptions,
   events: Mutex<Option<PlatformEvents>>,
   session: Session<ServerOf<G>>,
   epoch: AtomicU64,
}

impl<G: GattPlatform> WebBackend<G> {
   pub fn new(platform: G, options: RequestDeviceOptions) -> Self {
      Self {
         platform,
         options,
         events: Mutex::new(None),
         session: Arc::new(Mutex::new(None)),
         epoch: AtomicU64::new(0),
      }
   }

   pub fn platform(&self) -> &G {
      &self.platform
   }

   fn events(&self) -> Option<PlatformEvents> {
      self.events.lock().clone()
   }

   fn server(&self) -> Option<(u64, ServerOf<G>)> {
      self
         .session
         .lock()
         .as_ref()
         .map(|s| (s.epoch, s.server.clone()))
   }

   fn characteristic(&self, operation: &str) -> Result<CharacteristicOf<ServerOf<G>>> {
      self
         .session
         .lock()
         .as_ref()
         .and_then(|s| s.handle.get(operation))
         .and_then(|h| h.characteristic.clone())
         .ok_or_else(|| BleError::unresolved(operation))
   }

   /// Stores `resolved` for `operation` if the session it was discovered on
   /// is still the live one.
   fn install(&self, epoch: u64, operation: &str, resolved: GattHandle<ServerOf<G>>) -> Result<()> {
      match self.session.lock().as_mut() {
         Some(session) if session.epoch == epoch => {
            session.handle.insert(operation, resolved);
            Ok(())
         },
         _ => Err(stale_session()),
      }
   }
}

fn stale_session() -> BleError {
   BleError::Platform(PlatformError::opaque("GATT server disconnected"))
}

impl<G: GattPlatform> Backend for WebBackend<G> {
   const SELECTS_DEVICE: bool = true;

   async fn init(&self, events: PlatformEvents) -> Result<()> {
      *self.events.lock() = Some(events);
      Ok(())
   }

   fn ensure_supported(&self) -> Result<()> {
      if self.platform.is_available() {
         Ok(())
      } else {
         Err(BleError::BackendUnsupported)
      }
   }

   async fn open_session(&self) -> Result<()> {
      let server = self.platform.request_device(&self.options).await?;
      let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
      let device = server.device_id();
      info!("Selected device {device}");

      if let Some(events) = self.events() {
         let session = self.session.clone();
         server.on_disconnected(Box::new(move || {
            let ended = {
               let mut session = session.lock();
               let current = session.as_ref().is_some_and(|s| s.epoch == epoch);
               if current {
                  session.take();
               }
               current
            };
            if ended {
               warn!("GATT server disconnected");
               events.link_lost();
            }
         }));
      }

      // A fresh handle for every connect; nothing from an earlier session
      // survives.
      *self.session.lock() = Some(WebSession {
         epoch,
         server,
         handle: DeviceHandle::new(device),
      });
      Ok(())
   }

   async fn resolve(&self, bindings: &Bindings) -> Result<()> {
      let (epoch, server) = self.server().ok_or_else(stale_session)?;
      let resolved = resolver::discover_all(&server, bindings).await?;
      match self.session.lock().as_mut() {
         Some(session) if session.epoch == epoch => {
            debug!(
               "Resolved {} operation(s) on {}",
               resolved.len(),
               session.handle.id()
            );
            session.handle.replace_all(resolved);
            Ok(())
         },
         _ => Err(stale_session()),
      }
   }

   async fn rebind(&self, operation: &str, id_type: IdType, bindings: &Bindings) -> Result<()> {
      let Some((epoch, server)) = self.server() else {
         return Ok(());
      };
      let Some(binding) = bindings.get(operation).filter(|b| b.is_configured()) else {
         return Ok(());
      };
      debug!("Re-resolving {}", resolver::describe(operation, binding));

      let cached_service = match id_type {
         IdType::Service => None,
         IdType::Characteristic => self
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.handle.get(operation))
            .map(|h| h.service.clone()),
      };

      let resolved = match (cached_service, binding.characteristic_id.as_deref()) {
         (Some(service), Some(characteristic_id)) => {
            let characteristic = resolver::discover_characteristic::<ServerOf<G>>(
               &service,
               operation,
               characteristic_id,
            )
            .await?;
            GattHandle::new(service, Some(characteristic))
         },
         _ => resolver::run_chain(&server, operation, binding).await?,
      };
      self.install(epoch, operation, resolved)
   }

   async fn abandon(&self) {
      let Some(session) = self.session.lock().take() else {
         return;
      };
      debug!("Dropping half-open session on {}", session.handle.id());
      session.server.disconnect();
   }

   async fn disconnect(&self) -> Result<()> {
      let Some(session) = self.session.lock().take() else {
         return Ok(());
      };
      session.server.disconnect();
      info!("Disconnected from {}", session.handle.id());
      Ok(())
   }

   async fn write(&self, operation: &str, value: &[u8]) -> Result<()> {
      let characteristic = self.characteristic(operation)?;
      characteristic.write_value(value).await?;
      Ok(())
   }

   async fn subscribe(&self, operation: &str) -> Result<()> {
      let characteristic = self.characteristic(operation)?;
      let attach = self
         .session
         .lock()
         .as_mut()
         .and_then(|s| s.handle.get_mut(operation))
         .is_some_and(|h| !std::mem::replace(&mut h.listener_attached, true));
      if attach && let Some(events) = self.events() {
         characteristic.on_value_changed(Box::new(move |event| events.value(event)));
      }
      characteristic.start_notifications().await?;
      Ok(())
   }

   async fn unsubscribe(&self, operation: &str) -> Result<()> {
      let characteristic = self.characteristic(operation)?;
      characteristic.stop_notifications().await?;
      Ok(())
   }

   async fn shutdown(&self) -> Result<()> {
      self.events.lock().take();
      Ok(())
   }
}
