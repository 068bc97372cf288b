//! The Bluetooth object.
//!
//! [`Bluetooth`] is the one public entry point: it owns the bindings, the
//! lifecycle state machine and the dispatcher, and drives a [`Backend`]
//! through connect, discovery, writes and subscriptions. The same methods
//! exist for every backend; native-only extras live on
//! [`NativeBluetooth`].

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   backend::{
      Backend, PlatformEvents,
      native::{NativeBackend, NativePlatform},
      web::{GattPlatform, WebBackend},
   },
   config::BleConfig,
   dispatch::{Dispatcher, encode},
   error::{self, BleError, Result},
   event::{Callbacks, CharacteristicInfo, DeviceFoundCallback, ServiceInfo, ValueCallback},
   resolver::{Bindings, IdType, NOTIFY, WRITE},
   state::{ConnectionState, Lifecycle},
};

/// Bluetooth object over a server-driven platform.
pub type NativeBluetooth<P> = Bluetooth<NativeBackend<P>>;
/// Bluetooth object over a client-driven platform.
pub type WebBluetooth<G> = Bluetooth<WebBackend<G>>;

/// Clears the in-flight connect flag when the attempt ends, however it ends.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
   fn acquire(flag: &'a AtomicBool) -> Result<Self> {
      if flag.swap(true, Ordering::AcqRel) {
         return Err(BleError::AlreadyConnecting);
      }
      Ok(Self(flag))
   }
}

impl Drop for ConnectGuard<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

pub struct Bluetooth<B: Backend> {
   backend: B,
   lifecycle: Arc<Lifecycle>,
   dispatcher: Arc<Dispatcher>,
   bindings: Mutex<Bindings>,
   connecting: AtomicBool,
   destroyed: AtomicBool,
}

impl<B: Backend> Bluetooth<B> {
   /// Initializes `backend` and fires `on_init`.
   pub async fn new(config: &BleConfig, backend: B, callbacks: Callbacks) -> Result<Self> {
      let lifecycle = Arc::new(Lifecycle::new(callbacks));
      let dispatcher = Arc::new(Dispatcher::new());
      backend
         .init(PlatformEvents::new(lifecycle.clone(), dispatcher.clone()))
         .await?;

      let this = Self {
         backend,
         lifecycle,
         dispatcher,
         bindings: Mutex::new(config.bindings()),
         connecting: AtomicBool::new(false),
         destroyed: AtomicBool::new(false),
      };
      this.lifecycle.callbacks().fire_init();
      Ok(this)
   }

   pub fn backend(&self) -> &B {
      &self.backend
   }

   pub fn state(&self) -> ConnectionState {
      self.lifecycle.state()
   }

   pub fn state_code(&self) -> i8 {
      self.state().code()
   }

   pub fn is_connected(&self) -> bool {
      self.lifecycle.is_connected()
   }

   pub fn bindings(&self) -> Bindings {
      self.bindings.lock().clone()
   }

   fn ensure_alive(&self) -> Result<()> {
      if self.destroyed.load(Ordering::Acquire) {
         return Err(BleError::Destroyed);
      }
      Ok(())
   }

   /// Sets the service or characteristic id of `operation`.
   ///
   /// While connected, the operation is re-resolved right away. Setting an
   /// id to its current value does nothing.
   pub async fn set_id(
      &self,
      operation: &str,
      id_type: IdType,
      value: impl Into<SmolStr>,
   ) -> Result<()> {
      self.ensure_alive()?;
      let bindings = {
         let mut bindings = self.bindings.lock();
         if !bindings.set_id(operation, id_type, value) {
            return Ok(());
         }
         bindings.clone()
      };
      if self.is_connected() {
         self.backend.rebind(operation, id_type, &bindings).await?;
      }
      Ok(())
   }

   /// Connects and resolves every configured binding.
   ///
   /// Returns immediately when already connected. On any failure the
   /// half-open session is torn down and the state falls back to
   /// unconnected.
   pub async fn connect(&self) -> Result<()> {
      self.ensure_alive()?;
      if self.is_connected() {
         return Ok(());
      }
      self.backend.ensure_supported()?;
      let _guard = ConnectGuard::acquire(&self.connecting)?;

      match self.establish().await {
         Ok(()) => Ok(()),
         Err(e) => {
            warn!("Connect failed: {e}");
            self.backend.abandon().await;
            self.lifecycle.try_transition(ConnectionState::Unconnected);
            Err(e)
         },
      }
   }

   async fn establish(&self) -> Result<()> {
      if B::SELECTS_DEVICE {
         self.lifecycle.transition(ConnectionState::Discovering)?;
         self.backend.open_session().await?;
         self.lifecycle.transition(ConnectionState::Connecting)?;
      } else {
         self.lifecycle.transition(ConnectionState::Connecting)?;
         self.backend.open_session().await?;
      }

      let bindings = self.bindings();
      self.backend.resolve(&bindings).await?;

      self.lifecycle.callbacks().fire_connect();
      self.lifecycle.transition(ConnectionState::Connected)?;
      info!("Connected");
      Ok(())
   }

   /// Closes the session. Does nothing unless connected.
   pub async fn disconnect(&self) -> Result<()> {
      self.ensure_alive()?;
      self.close().await
   }

   async fn close(&self) -> Result<()> {
      if !self.is_connected() {
         return Ok(());
      }
      self.backend.disconnect().await?;
      if self.lifecycle.end_session() {
         self.dispatcher.clear();
      }
      Ok(())
   }

   /// Writes `value` through the `write` binding.
   pub async fn write_ble_characteristic(&self, value: &str) -> Result<()> {
      self.write_to(WRITE, value).await
   }

   /// Writes `value` through the binding of `operation`.
   pub async fn write_to(&self, operation: &str, value: &str) -> Result<()> {
      self.ensure_alive()?;
      let payload = encode(value);
      debug!("→ {operation}: {}", hex::encode(&payload));
      self.backend.write(operation, &payload).await?;
      self.lifecycle.callbacks().fire_characteristic_written(value);
      Ok(())
   }

   /// Subscribes to the `notify` binding.
   ///
   /// `callback` is ignored when `on_characteristic_change` was registered.
   pub async fn start_listen_value_change(&self, callback: Option<ValueCallback>) -> Result<()> {
      self.ensure_alive()?;
      let listener = self.lifecycle.callbacks().characteristic_change_or(callback);
      let previous = self.dispatcher.listen(listener);
      if let Err(e) = self.backend.subscribe(NOTIFY).await {
         self.dispatcher.listen(previous);
         return Err(e);
      }
      self
         .lifecycle
         .transition_if(ConnectionState::Connected, ConnectionState::Listening);
      Ok(())
   }

   /// Unsubscribes and returns to the state held before listening.
   pub async fn stop_listen_value_change(&self) -> Result<()> {
      self.ensure_alive()?;
      self.backend.unsubscribe(NOTIFY).await?;
      self.dispatcher.clear();
      self.lifecycle.restore_from(ConnectionState::Listening);
      Ok(())
   }

   /// Emits the diagnostic notice for a native failure code.
   pub fn log_message(&self, code: i32) {
      error::log_message(code);
   }

   /// Disconnects, fires `on_destroy` and releases the adapter.
   ///
   /// Only the first call does anything; every other operation fails with
   /// [`BleError::Destroyed`] afterwards.
   pub async fn destroy(&self) -> Result<()> {
      if self.destroyed.swap(true, Ordering::AcqRel) {
         return Ok(());
      }
      if let Err(e) = self.close().await {
         warn!("Disconnect during destroy failed: {e}");
      }
      self.lifecycle.callbacks().fire_destroy();
      self.backend.shutdown().await?;
      info!("Bluetooth object destroyed");
      Ok(())
   }
}

impl<P: NativePlatform> Bluetooth<NativeBackend<P>> {
   pub async fn native(platform: P, config: BleConfig, callbacks: Callbacks) -> Result<Self> {
      let backend = NativeBackend::new(platform, &config);
      Self::new(&config, backend, callbacks).await
   }

   pub fn device_id(&self) -> Option<SmolStr> {
      self.backend.target()
   }

   /// Selects the device the next connect goes to.
   pub fn set_device_id(&self, device_id: impl Into<SmolStr>) {
      self.backend.set_target(device_id.into());
   }

   /// Starts scanning.
   ///
   /// `callback` is ignored when `on_device_found` was registered.
   pub async fn start_search_device(&self, callback: Option<DeviceFoundCallback>) -> Result<()> {
      self.ensure_alive()?;
      let listener = self.lifecycle.callbacks().device_found_or(callback);
      self.backend.start_search(listener).await?;
      self
         .lifecycle
         .transition_if(ConnectionState::Unconnected, ConnectionState::Discovering);
      Ok(())
   }

   pub async fn stop_search_device(&self) -> Result<()> {
      self.ensure_alive()?;
      self.backend.stop_search().await?;
      self
         .lifecycle
         .transition_if(ConnectionState::Discovering, ConnectionState::Unconnected);
      Ok(())
   }

   pub async fn get_services(&self) -> Result<Vec<ServiceInfo>> {
      self.ensure_alive()?;
      self.backend.services().await
   }

   pub async fn get_characteristics(&self, service_id: &str) -> Result<Vec<CharacteristicInfo>> {
      self.ensure_alive()?;
      self.backend.characteristics(service_id).await
   }

   pub async fn get_device_rssi(&self) -> Result<i16> {
      self.ensure_alive()?;
      self.backend.rssi().await
   }
}

impl<G: GattPlatform> Bluetooth<WebBackend<G>> {
   /// Builds an object whose connect shows the host's device chooser with
   /// `config.options`.
   pub async fn web(platform: G, config: BleConfig, callbacks: Callbacks) -> Result<Self> {
      let backend = WebBackend::new(platform, config.options.clone());
      Self::new(&config, backend, callbacks).await
   }
}
