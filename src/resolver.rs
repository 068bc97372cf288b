//! Operation bindings and handle resolution.
//!
//! An operation (`"write"`, `"notify"` or any custom name) is bound to a
//! service id and a characteristic id. Before a binding can be used it has to
//! be resolved against the live session:
//!
//! - server-driven platforms enumerate everything at connect time, so
//!   resolution is a lookup of the configured ids;
//! - client-driven platforms need one discovery request per service and per
//!   characteristic. Each configured operation runs its own chain
//!   (service, then characteristic) and all chains run concurrently.

use std::collections::{BTreeMap, HashMap};

use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

use crate::{
   backend::web::{CharacteristicOf, GattServer, GattService, ServiceOf},
   error::{BleError, PlatformError, Result},
};

/// Operation used by `write_ble_characteristic`.
pub const WRITE: &str = "write";
/// Operation used by `start_listen_value_change`.
pub const NOTIFY: &str = "notify";

/// Which half of a binding an id refers to.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IdType {
   Service,
   Characteristic,
}

/// Service and characteristic ids configured for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBinding {
   pub service_id: Option<SmolStr>,
   pub characteristic_id: Option<SmolStr>,
}

impl OperationBinding {
   pub fn new(service_id: impl Into<SmolStr>, characteristic_id: impl Into<SmolStr>) -> Self {
      Self {
         service_id: Some(service_id.into()),
         characteristic_id: Some(characteristic_id.into()),
      }
   }

   pub fn id(&self, id_type: IdType) -> Option<&SmolStr> {
      match id_type {
         IdType::Service => self.service_id.as_ref(),
         IdType::Characteristic => self.characteristic_id.as_ref(),
      }
   }

   /// Returns whether the stored id changed.
   pub fn set_id(&mut self, id_type: IdType, value: SmolStr) -> bool {
      let slot = match id_type {
         IdType::Service => &mut self.service_id,
         IdType::Characteristic => &mut self.characteristic_id,
      };
      if slot.as_ref() == Some(&value) {
         return false;
      }
      *slot = Some(value);
      true
   }

   /// A binding takes part in connect once its service is known.
   pub fn is_configured(&self) -> bool {
      self.service_id.is_some()
   }
}

/// All operation bindings of a Bluetooth object, keyed by operation name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<SmolStr, OperationBinding>);

impl Bindings {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn get(&self, operation: &str) -> Option<&OperationBinding> {
      self.0.get(operation)
   }

   pub fn insert(&mut self, operation: impl Into<SmolStr>, binding: OperationBinding) {
      self.0.insert(operation.into(), binding);
   }

   /// Sets one id of `operation`, creating the binding when needed.
   /// Returns whether anything changed.
   pub fn set_id(&mut self, operation: &str, id_type: IdType, value: impl Into<SmolStr>) -> bool {
      self
         .0
         .entry(operation.into())
         .or_default()
         .set_id(id_type, value.into())
   }

   /// Bindings that take part in connect.
   pub fn configured(&self) -> impl Iterator<Item = (&SmolStr, &OperationBinding)> {
      self.0.iter().filter(|(_, b)| b.is_configured())
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }
}

/// Opaque reference to a connected peripheral.
///
/// Holds the platform-scoped identifier and one resolved sub-handle per
/// operation. A handle belongs to exactly one session; a new connect always
/// builds a fresh one.
#[derive(Debug)]
pub struct DeviceHandle<H> {
   id: SmolStr,
   resolved: HashMap<SmolStr, H>,
}

impl<H> DeviceHandle<H> {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self {
         id: id.into(),
         resolved: HashMap::new(),
      }
   }

   pub fn id(&self) -> &SmolStr {
      &self.id
   }

   pub fn get(&self, operation: &str) -> Option<&H> {
      self.resolved.get(operation)
   }

   pub fn get_mut(&mut self, operation: &str) -> Option<&mut H> {
      self.resolved.get_mut(operation)
   }

   pub fn insert(&mut self, operation: impl Into<SmolStr>, handle: H) {
      self.resolved.insert(operation.into(), handle);
   }

   /// Replaces every resolved sub-handle at once.
   pub fn replace_all(&mut self, resolved: HashMap<SmolStr, H>) {
      self.resolved = resolved;
   }

   pub fn is_resolved(&self, operation: &str) -> bool {
      self.resolved.contains_key(operation)
   }
}

// === Server-driven resolution ===

/// Sub-handle on a server-driven platform: the ids the platform addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeHandle {
   pub service_id: SmolStr,
   pub characteristic_id: SmolStr,
}

/// Resolves a single binding; needs both ids.
pub fn lookup(binding: &OperationBinding) -> Option<NativeHandle> {
   Some(NativeHandle {
      service_id: binding.service_id.clone()?,
      characteristic_id: binding.characteristic_id.clone()?,
   })
}

/// Resolves every fully configured binding without any round trip.
pub fn lookup_all(bindings: &Bindings) -> HashMap<SmolStr, NativeHandle> {
   bindings
      .configured()
      .filter_map(|(name, binding)| lookup(binding).map(|h| (name.clone(), h)))
      .collect()
}

// === Client-driven resolution ===

/// Sub-handle on a client-driven platform.
pub struct GattHandle<S: GattServer> {
   pub service: ServiceOf<S>,
   pub characteristic: Option<CharacteristicOf<S>>,
   /// Whether the value-change listener is attached to `characteristic`.
   pub listener_attached: bool,
}

impl<S: GattServer> GattHandle<S> {
   pub fn new(service: ServiceOf<S>, characteristic: Option<CharacteristicOf<S>>) -> Self {
      Self {
         service,
         characteristic,
         listener_attached: false,
      }
   }
}

fn discovery_failed(operation: &str, id_type: IdType, id: &str, source: PlatformError) -> BleError {
   warn!("Discovery of {id_type} {id} for {operation} failed: {source}");
   BleError::DiscoveryFailed {
      operation: operation.into(),
      id_type,
      id: id.into(),
      source,
   }
}

/// Requests the primary service `service_id` from `server`.
pub async fn discover_service<S: GattServer>(
   server: &S,
   operation: &str,
   service_id: &str,
) -> Result<ServiceOf<S>> {
   let uuid = service_id.to_lowercase();
   debug!("Discovering service {uuid} for {operation}");
   server
      .primary_service(&uuid)
      .await
      .map_err(|e| discovery_failed(operation, IdType::Service, &uuid, e))
}

/// Requests the characteristic `characteristic_id` from `service`.
pub async fn discover_characteristic<S: GattServer>(
   service: &ServiceOf<S>,
   operation: &str,
   characteristic_id: &str,
) -> Result<CharacteristicOf<S>> {
   let uuid = characteristic_id.to_lowercase();
   debug!("Discovering characteristic {uuid} for {operation}");
   service
      .characteristic(&uuid)
      .await
      .map_err(|e| discovery_failed(operation, IdType::Characteristic, &uuid, e))
}

/// Runs the discovery chain of one operation: service, then characteristic
/// when one is configured.
pub async fn run_chain<S: GattServer>(
   server: &S,
   operation: &str,
   binding: &OperationBinding,
) -> Result<GattHandle<S>> {
   let Some(service_id) = binding.service_id.as_deref() else {
      return Err(BleError::unresolved(operation));
   };
   let service = discover_service(server, operation, service_id).await?;
   let characteristic = match binding.characteristic_id.as_deref() {
      Some(id) => Some(discover_characteristic::<S>(&service, operation, id).await?),
      None => None,
   };
   Ok(GattHandle::new(service, characteristic))
}

/// Runs the chains of every configured binding concurrently.
///
/// Completes only once every chain has finished. Chains are not cancelled
/// when a sibling fails; the first failure (in operation order) is returned
/// and nothing is partially resolved.
pub async fn discover_all<S: GattServer>(
   server: &S,
   bindings: &Bindings,
) -> Result<HashMap<SmolStr, GattHandle<S>>> {
   let chains = bindings.configured().map(|(name, binding)| async move {
      let handle = run_chain(server, name, binding).await;
      (name.clone(), handle)
   });

   let mut resolved = HashMap::new();
   let mut first_error = None;
   for (name, outcome) in join_all(chains).await {
      match outcome {
         Ok(handle) => {
            resolved.insert(name, handle);
         },
         Err(e) => {
            first_error.get_or_insert(e);
         },
      }
   }
   match first_error {
      Some(e) => Err(e),
      None => Ok(resolved),
   }
}

/// Label for an operation/id pair in logs.
pub fn describe(operation: &str, binding: &OperationBinding) -> SmolStr {
   format_smolstr!(
      "{operation}({}/{})",
      binding.service_id.as_deref().unwrap_or("-"),
      binding.characteristic_id.as_deref().unwrap_or("-"),
   )
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::{MockGatt, block_on};

   fn both() -> Bindings {
      let mut bindings = Bindings::new();
      bindings.insert(WRITE, OperationBinding::new("FFE0", "FFE1"));
      bindings.insert(NOTIFY, OperationBinding::new("FFE0", "FFE2"));
      bindings
   }

   #[test]
   fn test_set_id_reports_changes() {
      let mut bindings = Bindings::new();
      assert!(bindings.set_id(WRITE, IdType::Service, "ffe0"));
      assert!(!bindings.set_id(WRITE, IdType::Service, "ffe0"));
      assert!(bindings.set_id(WRITE, IdType::Characteristic, "ffe1"));
      assert_eq!(
         bindings.get(WRITE),
         Some(&OperationBinding::new("ffe0", "ffe1"))
      );
      assert_eq!(
         "characteristic".parse::<IdType>().unwrap(),
         IdType::Characteristic
      );
   }

   #[test]
   fn test_configured_requires_service() {
      let mut bindings = both();
      bindings.set_id("custom", IdType::Characteristic, "abcd");
      let names: Vec<_> = bindings.configured().map(|(n, _)| n.as_str()).collect();
      assert_eq!(names, vec![NOTIFY, WRITE]);
   }

   #[test]
   fn test_lookup_needs_both_ids() {
      let mut bindings = both();
      bindings.set_id("half", IdType::Service, "180f");
      let resolved = lookup_all(&bindings);
      assert_eq!(resolved.len(), 2);
      assert_eq!(
         resolved[WRITE],
         NativeHandle {
            service_id: "FFE0".into(),
            characteristic_id: "FFE1".into(),
         }
      );
      assert!(!resolved.contains_key("half"));
   }

   #[test]
   fn test_device_handle_replace_all() {
      let mut handle = DeviceHandle::new("dev-1");
      handle.insert(WRITE, 1);
      assert!(handle.is_resolved(WRITE));
      handle.replace_all(HashMap::from([(SmolStr::new(NOTIFY), 2)]));
      assert!(!handle.is_resolved(WRITE));
      assert_eq!(handle.get(NOTIFY), Some(&2));
      assert_eq!(handle.id(), "dev-1");
   }

   #[test]
   fn test_discover_all_lowercases_ids() {
      let gatt = MockGatt::new();
      let server = gatt.server();
      let resolved = block_on(discover_all(&server, &both())).unwrap();
      assert_eq!(resolved.len(), 2);
      let write = &resolved[WRITE];
      assert_eq!(write.service.uuid().as_str(), "ffe0");
      assert!(write.characteristic.is_some());
      assert_eq!(gatt.service_requests(), vec!["ffe0", "ffe0"]);
   }

   #[test]
   fn test_discover_all_fails_as_a_whole() {
      let gatt = MockGatt::new();
      gatt.fail_characteristic("ffe2");
      let server = gatt.server();
      let err = block_on(discover_all(&server, &both())).err().unwrap();
      match err {
         BleError::DiscoveryFailed {
            operation, id_type, ..
         } => {
            assert_eq!(operation.as_str(), NOTIFY);
            assert_eq!(id_type, IdType::Characteristic);
         },
         other => panic!("unexpected error: {other}"),
      }
      // The write chain still ran to completion.
      assert!(gatt.characteristic_requests().contains(&"ffe1".to_string()));
   }

   #[test]
   fn test_chain_without_characteristic() {
      let gatt = MockGatt::new();
      let server = gatt.server();
      let binding = OperationBinding {
         service_id: Some("180F".into()),
         characteristic_id: None,
      };
      let handle = block_on(run_chain(&server, "battery", &binding)).unwrap();
      assert!(handle.characteristic.is_none());
      assert!(gatt.characteristic_requests().is_empty());
   }
}
