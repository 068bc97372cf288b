//! Capability backends.
//!
//! A [`Backend`] exposes one capability surface (connect, discover, write,
//! subscribe, ...) over a host platform. Two variants exist, chosen when the
//! Bluetooth object is built:
//!
//! - [`native::NativeBackend`] drives server-driven platforms that enumerate
//!   services on connect and report events through registered callbacks;
//! - [`web::WebBackend`] drives client-driven (WebBluetooth style) platforms
//!   that pick the device on connect and discover handles on request.

use std::sync::Arc;

use crate::{
   dispatch::{Dispatcher, ValueEvent},
   error::Result,
   resolver::{Bindings, IdType},
   state::Lifecycle,
};

pub mod native;
pub mod web;

/// Entry points through which a backend reports platform events.
#[derive(Clone)]
pub struct PlatformEvents {
   lifecycle: Arc<Lifecycle>,
   dispatcher: Arc<Dispatcher>,
}

impl PlatformEvents {
   pub(crate) fn new(lifecycle: Arc<Lifecycle>, dispatcher: Arc<Dispatcher>) -> Self {
      Self {
         lifecycle,
         dispatcher,
      }
   }

   /// Forwards an inbound characteristic value.
   pub fn value(&self, event: impl Into<ValueEvent>) {
      self.dispatcher.dispatch(event);
   }

   /// Reports that the platform dropped the link on its own.
   ///
   /// Ends the session if one is established; otherwise ignored.
   pub fn link_lost(&self) {
      if self.lifecycle.end_session() {
         self.dispatcher.clear();
      }
   }
}

/// Capability surface shared by every platform variant.
///
/// Every operation is asynchronous and reports failure by returning an
/// error; none of them retries.
#[allow(async_fn_in_trait)]
pub trait Backend: 'static {
   /// Whether connect includes picking the device (chooser shown by the host).
   const SELECTS_DEVICE: bool;

   /// Acquires adapter-level resources and registers platform listeners.
   async fn init(&self, events: PlatformEvents) -> Result<()>;

   /// Fails when the host has no usable BLE support.
   fn ensure_supported(&self) -> Result<()>;

   /// Establishes the link and starts a fresh, empty session.
   async fn open_session(&self) -> Result<()>;

   /// Resolves every configured binding against the current session. The
   /// session's handles are replaced as a whole, and only on success.
   async fn resolve(&self, bindings: &Bindings) -> Result<()>;

   /// Re-resolves `operation` after one of its ids changed.
   async fn rebind(&self, operation: &str, id_type: IdType, bindings: &Bindings) -> Result<()>;

   /// Tears down the session after a failed connect; best effort.
   async fn abandon(&self);

   /// Closes the link. No-op without a session; the session is cleared
   /// before this returns.
   async fn disconnect(&self) -> Result<()>;

   async fn write(&self, operation: &str, value: &[u8]) -> Result<()>;

   async fn subscribe(&self, operation: &str) -> Result<()>;

   async fn unsubscribe(&self, operation: &str) -> Result<()>;

   /// Releases adapter-level resources.
   async fn shutdown(&self) -> Result<()>;
}
