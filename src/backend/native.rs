//! Server-driven backend.
//!
//! Native mobile-style platforms address everything by id strings: the
//! platform enumerates services once connected, so handle resolution is a
//! plain lookup. Events (link state, scan results, notifications) arrive
//! through listeners registered once at init.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::time;

use crate::{
   backend::{Backend, PlatformEvents},
   config::BleConfig,
   dispatch::RawNotification,
   error::{BleError, PlatformError, Result, log_message},
   event::{CharacteristicInfo, DeviceFoundCallback, DeviceInfo, ServiceInfo},
   resolver::{self, Bindings, DeviceHandle, IdType, NativeHandle},
};

/// Grace period after the platform acknowledges a connection; some stacks
/// report success before the link can carry traffic.
pub const SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Receives `(device_id, connected)` link state changes.
pub type ConnectionStateHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Receives peripherals found while scanning.
pub type DeviceFoundHandler = Arc<dyn Fn(DeviceInfo) + Send + Sync>;
/// Receives characteristic value notifications.
pub type NotificationHandler = Arc<dyn Fn(RawNotification) + Send + Sync>;

/// Native BLE platform calls.
///
/// Failures carry the platform's numeric advisory code where it has one.
#[allow(async_fn_in_trait)]
pub trait NativePlatform: 'static {
   async fn open_adapter(&self) -> Result<(), PlatformError>;
   async fn close_adapter(&self) -> Result<(), PlatformError>;

   fn on_connection_state_change(&self, handler: ConnectionStateHandler);
   fn on_device_found(&self, handler: DeviceFoundHandler);
   fn on_value_change(&self, handler: NotificationHandler);

   async fn start_discovery(&self) -> Result<(), PlatformError>;
   async fn stop_discovery(&self) -> Result<(), PlatformError>;

   async fn create_connection(&self, device_id: &str) -> Result<(), PlatformError>;
   async fn close_connection(&self, device_id: &str) -> Result<(), PlatformError>;
   /// Requests an MTU and returns the one in effect.
   async fn set_mtu(&self, device_id: &str, mtu: u16) -> Result<u16, PlatformError>;

   async fn services(&self, device_id: &str) -> Result<Vec<ServiceInfo>, PlatformError>;
   async fn characteristics(
      &self,
      device_id: &str,
      service_id: &str,
   ) -> Result<Vec<CharacteristicInfo>, PlatformError>;
   async fn rssi(&self, device_id: &str) -> Result<i16, PlatformError>;

   async fn write_value(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      value: &[u8],
   ) -> Result<(), PlatformError>;
   async fn set_notify(
      &self,
      device_id: &str,
      service_id: &str,
      characteristic_id: &str,
      enable: bool,
   ) -> Result<(), PlatformError>;
}

/// Logs the diagnostic of a coded failure and wraps it.
fn report(e: PlatformError) -> BleError {
   if let Some(code) = e.code {
      log_message(code);
   }
   BleError::Platform(e)
}

type Session = Arc<Mutex<Option<DeviceHandle<NativeHandle>>>>;

/// Backend over a [`NativePlatform`].
pub struct NativeBackend<P: NativePlatform> {
   platform: P,
   mtu: Option<u16>,
   target: Mutex<Option<SmolStr>>,
   session: Session,
   scan_listener: Arc<Mutex<Option<DeviceFoundCallback>>>,
}

impl<P: NativePlatform> NativeBackend<P> {
   pub fn new(platform: P, config: &BleConfig) -> Self {
      Self {
         platform,
         mtu: config.mtu,
         target: Mutex::new(config.device_id.clone()),
         session: Arc::default(),
         scan_listener: Arc::default(),
      }
   }

   pub fn platform(&self) -> &P {
      &self.platform
   }

   /// Device the next connect goes to.
   pub fn target(&self) -> Option<SmolStr> {
      self.target.lock().clone()
   }

   pub fn set_target(&self, device_id: SmolStr) {
      *self.target.lock() = Some(device_id);
   }

   fn require_target(&self) -> Result<SmolStr> {
      self.target().ok_or(BleError::NoDeviceSelected)
   }

   /// Resolved handle for `operation` together with the session's device.
   fn handle(&self, operation: &str) -> Result<(SmolStr, NativeHandle)> {
      let session = self.session.lock();
      let handle = session
         .as_ref()
         .ok_or_else(|| BleError::unresolved(operation))?;
      let resolved = handle
         .get(operation)
         .cloned()
         .ok_or_else(|| BleError::unresolved(operation))?;
      Ok((handle.id().clone(), resolved))
   }

   pub async fn start_search(&self, listener: Option<DeviceFoundCallback>) -> Result<()> {
      *self.scan_listener.lock() = listener;
      self.platform.start_discovery().await.map_err(report)?;
      info!("Device discovery started");
      Ok(())
   }

   pub async fn stop_search(&self) -> Result<()> {
      self.platform.stop_discovery().await.map_err(report)?;
      info!("Device discovery stopped");
      Ok(())
   }

   pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
      let device = self.require_target()?;
      self.platform.services(&device).await.map_err(report)
   }

   pub async fn characteristics(&self, service_id: &str) -> Result<Vec<CharacteristicInfo>> {
      let device = self.require_target()?;
      self
         .platform
         .characteristics(&device, service_id)
         .await
         .map_err(report)
   }

   pub async fn rssi(&self) -> Result<i16> {
      let device = self.require_target()?;
      self.platform.rssi(&device).await.map_err(report)
   }
}

impl<P: NativePlatform> Backend for NativeBackend<P> {
   const SELECTS_DEVICE: bool = false;

   async fn init(&self, events: PlatformEvents) -> Result<()> {
      self.platform.open_adapter().await.map_err(report)?;

      let session = self.session.clone();
      let link_events = events.clone();
      self
         .platform
         .on_connection_state_change(Arc::new(move |device: &str, connected: bool| {
            if connected {
               return;
            }
            let ended = {
               let mut session = session.lock();
               let current = session.as_ref().is_some_and(|h| h.id() == device);
               if current {
                  session.take();
               }
               current
            };
            if ended {
               warn!("Link to {device} lost");
               link_events.link_lost();
            }
         }));

      let scan_listener = self.scan_listener.clone();
      self.platform.on_device_found(Arc::new(move |device: DeviceInfo| {
         debug!("Found device {}", device.device_id);
         let listener = scan_listener.lock().clone();
         if let Some(listener) = listener {
            listener(&device);
         }
      }));

      self
         .platform
         .on_value_change(Arc::new(move |notification: RawNotification| {
            events.value(notification)
         }));

      debug!("Native adapter ready");
      Ok(())
   }

   fn ensure_supported(&self) -> Result<()> {
      Ok(())
   }

   async fn open_session(&self) -> Result<()> {
      let device = self.require_target()?;
      info!("Connecting to {device}");
      self
         .platform
         .create_connection(&device)
         .await
         .map_err(report)?;
      // Stored before settling so a link drop during the delay ends it.
      *self.session.lock() = Some(DeviceHandle::new(device.clone()));

      time::sleep(SETTLE_DELAY).await;

      if let Some(mtu) = self.mtu {
         match self.platform.set_mtu(&device, mtu).await {
            Ok(effective) => debug!("MTU for {device}: {effective}"),
            Err(e) => {
               // MTU is advisory; the link stays usable with the default.
               warn!("Failed to set MTU {mtu} on {device}: {e}");
               if let Some(code) = e.code {
                  log_message(code);
               }
            },
         }
      }
      Ok(())
   }

   async fn resolve(&self, bindings: &Bindings) -> Result<()> {
      let resolved = resolver::lookup_all(bindings);
      let mut session = self.session.lock();
      let Some(handle) = session.as_mut() else {
         return Err(report(PlatformError::with_code(10006, "link dropped while resolving")));
      };
      debug!("Resolved {} operation(s) on {}", resolved.len(), handle.id());
      handle.replace_all(resolved);
      Ok(())
   }

   async fn rebind(&self, operation: &str, _id_type: IdType, bindings: &Bindings) -> Result<()> {
      // Services were enumerated at connect; only the lookup is redone.
      let Some(resolved) = bindings.get(operation).and_then(resolver::lookup) else {
         return Ok(());
      };
      if let Some(handle) = self.session.lock().as_mut() {
         handle.insert(operation, resolved);
      }
      Ok(())
   }

   async fn abandon(&self) {
      let Some(device) = self.session.lock().take().map(|h| h.id().clone()) else {
         return;
      };
      if let Err(e) = self.platform.close_connection(&device).await {
         debug!("Closing half-open link to {device} failed: {e}");
      }
   }

   async fn disconnect(&self) -> Result<()> {
      let Some(device) = self.session.lock().as_ref().map(|h| h.id().clone()) else {
         return Ok(());
      };
      self
         .platform
         .close_connection(&device)
         .await
         .map_err(report)?;
      self.session.lock().take();
      info!("Disconnected from {device}");
      Ok(())
   }

   async fn write(&self, operation: &str, value: &[u8]) -> Result<()> {
      let (device, handle) = self.handle(operation)?;
      self
         .platform
         .write_value(&device, &handle.service_id, &handle.characteristic_id, value)
         .await
         .map_err(report)
   }

   async fn subscribe(&self, operation: &str) -> Result<()> {
      let (device, handle) = self.handle(operation)?;
      self
         .platform
         .set_notify(&device, &handle.service_id, &handle.characteristic_id, true)
         .await
         .map_err(report)
   }

   async fn unsubscribe(&self, operation: &str) -> Result<()> {
      let (device, handle) = self.handle(operation)?;
      self
         .platform
         .set_notify(&device, &handle.service_id, &handle.characteristic_id, false)
         .await
         .map_err(report)
   }

   async fn shutdown(&self) -> Result<()> {
      self.scan_listener.lock().take();
      self.platform.close_adapter().await.map_err(report)
   }
}
