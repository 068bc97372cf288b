//! `navigator.bluetooth` binding for the client-driven backend.
//!
//! Reaches the WebBluetooth objects through `js_sys::Reflect` so no
//! unstable `web-sys` bindings are needed. Every rejected promise becomes an
//! opaque [`PlatformError`] carrying the DOMException name and message.

use js_sys::{Array, DataView, Function, Promise, Reflect, Uint8Array};
use log::{debug, warn};
use serde::Serialize;
use smol_str::SmolStr;
use wasm_bindgen::{JsCast, JsValue, closure::Closure};
use wasm_bindgen_futures::JsFuture;

use crate::{
   backend::web::{
      DisconnectHandler, GattCharacteristic, GattPlatform, GattServer, GattService,
      ValueChangedHandler,
   },
   config::RequestDeviceOptions,
   dispatch::{ValueChangedEvent, ValueTarget},
   error::PlatformError,
};

fn js_error(value: JsValue) -> PlatformError {
   let field = |key: &str| {
      Reflect::get(&value, &JsValue::from_str(key))
         .ok()
         .and_then(|v| v.as_string())
   };
   let message = match (field("name"), field("message")) {
      (Some(name), Some(message)) => format!("{name}: {message}"),
      (None, Some(message)) => message,
      _ => value.as_string().unwrap_or_else(|| format!("{value:?}")),
   };
   PlatformError::opaque(message)
}

fn get(target: &JsValue, key: &str) -> Result<JsValue, PlatformError> {
   Reflect::get(target, &JsValue::from_str(key)).map_err(js_error)
}

fn method(target: &JsValue, name: &str) -> Result<Function, PlatformError> {
   get(target, name)?
      .dyn_into::<Function>()
      .map_err(|_| PlatformError::opaque(format!("{name} is not a function")))
}

/// Calls a promise-returning method and awaits it.
async fn call_async(target: &JsValue, name: &str, args: &Array) -> Result<JsValue, PlatformError> {
   let promise = method(target, name)?
      .apply(target, args)
      .map_err(js_error)?
      .dyn_into::<Promise>()
      .map_err(|_| PlatformError::opaque(format!("{name} did not return a promise")))?;
   JsFuture::from(promise).await.map_err(js_error)
}

fn add_listener(target: &JsValue, event: &str, listener: JsValue) -> Result<(), PlatformError> {
   method(target, "addEventListener")?
      .call2(target, &JsValue::from_str(event), &listener)
      .map_err(js_error)?;
   Ok(())
}

fn bluetooth() -> Option<JsValue> {
   let navigator = Reflect::get(&js_sys::global(), &JsValue::from_str("navigator")).ok()?;
   let bluetooth = Reflect::get(&navigator, &JsValue::from_str("bluetooth")).ok()?;
   (!bluetooth.is_undefined() && !bluetooth.is_null()).then_some(bluetooth)
}

/// [`GattPlatform`] over the browser's `navigator.bluetooth`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebBluetoothPlatform;

impl GattPlatform for WebBluetoothPlatform {
   type Server = JsServer;

   fn is_available(&self) -> bool {
      bluetooth().is_some()
   }

   async fn request_device(
      &self,
      options: &RequestDeviceOptions,
   ) -> Result<JsServer, PlatformError> {
      let bluetooth =
         bluetooth().ok_or_else(|| PlatformError::opaque("navigator.bluetooth is unavailable"))?;
      let js_options = options
         .to_json()
         .map_err(|e| PlatformError::opaque(e.to_string()))?
         .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
         .map_err(|e| PlatformError::opaque(e.to_string()))?;

      let device = call_async(&bluetooth, "requestDevice", &Array::of1(&js_options)).await?;
      let gatt = get(&device, "gatt")?;
      let server = call_async(&gatt, "connect", &Array::new()).await?;
      Ok(JsServer { device, server })
   }
}

/// `BluetoothRemoteGATTServer` and the device it belongs to.
#[derive(Clone)]
pub struct JsServer {
   device: JsValue,
   server: JsValue,
}

impl GattServer for JsServer {
   type Service = JsService;

   fn device_id(&self) -> SmolStr {
      get(&self.device, "id")
         .ok()
         .and_then(|id| id.as_string())
         .map(SmolStr::from)
         .unwrap_or_default()
   }

   async fn primary_service(&self, uuid: &str) -> Result<JsService, PlatformError> {
      let object = call_async(
         &self.server,
         "getPrimaryService",
         &Array::of1(&JsValue::from_str(uuid)),
      )
      .await?;
      Ok(JsService {
         object,
         uuid: uuid.into(),
      })
   }

   fn disconnect(&self) {
      let outcome = method(&self.server, "disconnect")
         .and_then(|f| f.call0(&self.server).map_err(js_error));
      if let Err(e) = outcome {
         debug!("GATT disconnect failed: {e}");
      }
   }

   fn on_disconnected(&self, handler: DisconnectHandler) {
      let listener = Closure::<dyn Fn()>::new(move || handler()).into_js_value();
      if let Err(e) = add_listener(&self.device, "gattserverdisconnected", listener) {
         warn!("Cannot watch GATT disconnects: {e}");
      }
   }
}

#[derive(Clone)]
pub struct JsService {
   object: JsValue,
   uuid: SmolStr,
}

impl GattService for JsService {
   type Characteristic = JsCharacteristic;

   fn uuid(&self) -> SmolStr {
      self.uuid.clone()
   }

   async fn characteristic(&self, uuid: &str) -> Result<JsCharacteristic, PlatformError> {
      let object = call_async(
         &self.object,
         "getCharacteristic",
         &Array::of1(&JsValue::from_str(uuid)),
      )
      .await?;
      Ok(JsCharacteristic {
         object,
         uuid: uuid.into(),
      })
   }
}

#[derive(Clone)]
pub struct JsCharacteristic {
   object: JsValue,
   uuid: SmolStr,
}

/// Copies the bytes out of a `characteristicvaluechanged` event.
fn event_bytes(event: &JsValue) -> Result<Vec<u8>, PlatformError> {
   let view = get(&get(event, "target")?, "value")?
      .dyn_into::<DataView>()
      .map_err(|_| PlatformError::opaque("characteristic value is not a DataView"))?;
   let bytes = Uint8Array::new_with_byte_offset_and_length(
      &view.buffer(),
      view.byte_offset() as u32,
      view.byte_length() as u32,
   );
   Ok(bytes.to_vec())
}

impl GattCharacteristic for JsCharacteristic {
   fn uuid(&self) -> SmolStr {
      self.uuid.clone()
   }

   async fn write_value(&self, value: &[u8]) -> Result<(), PlatformError> {
      let buffer = Uint8Array::from(value);
      call_async(&self.object, "writeValue", &Array::of1(&buffer)).await?;
      Ok(())
   }

   async fn start_notifications(&self) -> Result<(), PlatformError> {
      call_async(&self.object, "startNotifications", &Array::new()).await?;
      Ok(())
   }

   async fn stop_notifications(&self) -> Result<(), PlatformError> {
      call_async(&self.object, "stopNotifications", &Array::new()).await?;
      Ok(())
   }

   fn on_value_changed(&self, handler: ValueChangedHandler) {
      let uuid = self.uuid.clone();
      let listener = Closure::<dyn Fn(JsValue)>::new(move |event: JsValue| {
         match event_bytes(&event) {
            Ok(value) => handler(ValueChangedEvent {
               target: ValueTarget {
                  uuid: uuid.clone(),
                  value,
               },
            }),
            Err(e) => warn!("Dropping value change on {uuid}: {e}"),
         }
      })
      .into_js_value();
      if let Err(e) = add_listener(&self.object, "characteristicvaluechanged", listener) {
         warn!("Cannot listen on {}: {e}", self.uuid);
      }
   }
}
