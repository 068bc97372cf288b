//! Construct-time configuration.
//!
//! A [`BleConfig`] carries the write/notify bindings, the native preset
//! target and the device-selection options forwarded to client-driven
//! platforms. It can be built in code or loaded from a TOML file.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::{
   error::{BleError, Result},
   resolver::{Bindings, IdType, NOTIFY, WRITE},
};

/// Configuration of one Bluetooth object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
   #[serde(default, alias = "write_serviceId", skip_serializing_if = "Option::is_none")]
   pub write_service_id: Option<SmolStr>,

   #[serde(
      default,
      alias = "write_characteristicId",
      skip_serializing_if = "Option::is_none"
   )]
   pub write_characteristic_id: Option<SmolStr>,

   #[serde(default, alias = "notify_serviceId", skip_serializing_if = "Option::is_none")]
   pub notify_service_id: Option<SmolStr>,

   #[serde(
      default,
      alias = "notify_characteristicId",
      skip_serializing_if = "Option::is_none"
   )]
   pub notify_characteristic_id: Option<SmolStr>,

   /// Native only: device the first connect goes to.
   #[serde(default, alias = "deviceId", skip_serializing_if = "Option::is_none")]
   pub device_id: Option<SmolStr>,

   /// Native only: MTU requested after the link settles.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub mtu: Option<u16>,

   /// Client-driven only: device-selection options.
   #[serde(default)]
   pub options: RequestDeviceOptions,
}

/// Options handed to the host's device chooser.
///
/// Keys this type does not model are kept in `extra` and forwarded as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDeviceOptions {
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub filters: Vec<ScanFilter>,

   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub optional_services: Vec<SmolStr>,

   #[serde(default, skip_serializing_if = "std::ops::Not::not")]
   pub accept_all_devices: bool,

   #[serde(flatten)]
   pub extra: Map<String, Value>,
}

/// One entry of `filters`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFilter {
   #[serde(default, skip_serializing_if = "Vec::is_empty")]
   pub services: Vec<SmolStr>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name: Option<SmolStr>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub name_prefix: Option<SmolStr>,
}

impl RequestDeviceOptions {
   /// JSON form handed to the host, with camelCase keys.
   pub fn to_json(&self) -> Result<Value> {
      Ok(serde_json::to_value(self)?)
   }
}

impl BleConfig {
   pub fn write(
      mut self,
      service_id: impl Into<SmolStr>,
      characteristic_id: impl Into<SmolStr>,
   ) -> Self {
      self.write_service_id = Some(service_id.into());
      self.write_characteristic_id = Some(characteristic_id.into());
      self
   }

   pub fn notify(
      mut self,
      service_id: impl Into<SmolStr>,
      characteristic_id: impl Into<SmolStr>,
   ) -> Self {
      self.notify_service_id = Some(service_id.into());
      self.notify_characteristic_id = Some(characteristic_id.into());
      self
   }

   /// Binding table seeded from the write and notify ids.
   pub fn bindings(&self) -> Bindings {
      let mut bindings = Bindings::new();
      let ids = [
         (WRITE, IdType::Service, &self.write_service_id),
         (WRITE, IdType::Characteristic, &self.write_characteristic_id),
         (NOTIFY, IdType::Service, &self.notify_service_id),
         (NOTIFY, IdType::Characteristic, &self.notify_characteristic_id),
      ];
      for (operation, id_type, id) in ids {
         if let Some(id) = id {
            bindings.set_id(operation, id_type, id.clone());
         }
      }
      bindings
   }

   pub fn from_toml_str(contents: &str) -> Result<Self> {
      Ok(toml::from_str(contents)?)
   }

   /// Loads the configuration from the default location, writing a default
   /// file there first if none exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads the configuration at `path`, creating a default file if missing.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         debug!("Loading config from {}", path.display());
         let contents = fs::read_to_string(path)?;
         Self::from_toml_str(&contents)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         info!("Wrote default config to {}", path.display());
         Ok(config)
      }
   }

   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;
      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("UNIBLE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(BleError::ConfigDirNotFound);
      };

      Ok(config_dir.join("unible").join("config.toml"))
   }
}
