//! Error types for the BLE client.
//!
//! This module defines the error enum surfaced by every asynchronous
//! operation, the error carrier for failed platform calls, and the table of
//! numeric advisory codes reported by native platforms.

use std::{borrow::Cow, fmt};

use log::warn;
use smol_str::SmolStr;
use strum::EnumMessage;
use thiserror::Error;

use crate::{resolver::IdType, state::ConnectionState};

/// Main error type for the BLE client.
#[derive(Error, Debug)]
pub enum BleError {
   #[error("Bluetooth is not supported by this browser")]
   BackendUnsupported,

   #[error("Handle for operation '{operation}' has not been resolved")]
   HandleNotResolved { operation: SmolStr },

   #[error("Platform operation failed: {0}")]
   Platform(#[from] PlatformError),

   #[error("Discovery of {id_type} '{id}' for operation '{operation}' failed: {source}")]
   DiscoveryFailed {
      operation: SmolStr,
      id_type: IdType,
      id: SmolStr,
      #[source]
      source: PlatformError,
   },

   #[error("No device selected")]
   NoDeviceSelected,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Illegal state transition: {from} -> {to}")]
   InvalidTransition {
      from: ConnectionState,
      to: ConnectionState,
   },

   #[error("Bluetooth object has been destroyed")]
   Destroyed,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),
}

impl BleError {
   pub(crate) fn unresolved(operation: &str) -> Self {
      Self::HandleNotResolved {
         operation: operation.into(),
      }
   }

   /// Numeric advisory code carried by the underlying platform failure, if any.
   pub fn code(&self) -> Option<i32> {
      match self {
         Self::Platform(e) | Self::DiscoveryFailed { source: e, .. } => e.code,
         _ => None,
      }
   }
}

/// Convenience type alias for Results with `BleError`.
pub type Result<T, E = BleError> = std::result::Result<T, E>;

/// Failure reported by a platform call.
///
/// Native platforms attach a numeric code (see [`ErrorCode`]); browser
/// failures are opaque and only carry a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformError {
   pub code: Option<i32>,
   pub message: String,
}

impl PlatformError {
   pub fn with_code(code: i32, message: impl Into<String>) -> Self {
      Self {
         code: Some(code),
         message: message.into(),
      }
   }

   pub fn opaque(message: impl Into<String>) -> Self {
      Self {
         code: None,
         message: message.into(),
      }
   }
}

impl fmt::Display for PlatformError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.code {
         Some(code) => write!(f, "[{code}] {} ({})", diagnostic(code), self.message),
         None => f.write_str(&self.message),
      }
   }
}

impl std::error::Error for PlatformError {}

/// Advisory codes reported by native BLE platforms.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::EnumMessage)]
pub enum ErrorCode {
   #[strum(message = "adapter not initialized")]
   NotInit = 10000,
   #[strum(message = "bluetooth unavailable, turn bluetooth on and retry")]
   NotAvailable = 10001,
   #[strum(message = "device not found")]
   NoDevice = 10002,
   #[strum(message = "connection failed")]
   ConnectionFail = 10003,
   #[strum(message = "service not found")]
   NoService = 10004,
   #[strum(message = "characteristic not found")]
   NoCharacteristic = 10005,
   #[strum(message = "connection lost")]
   NoConnection = 10006,
   #[strum(message = "characteristic does not support this operation")]
   PropertyNotSupport = 10007,
   #[strum(message = "other system-reported error")]
   SystemError = 10008,
   #[strum(message = "BLE is not supported below Android 4.3")]
   SystemNotSupport = 10009,
}

impl ErrorCode {
   pub fn message(self) -> &'static str {
      self.get_message().unwrap_or("unknown error")
   }
}

/// Maps an advisory code to its fixed diagnostic string.
///
/// Unmapped codes fall through to the raw code.
pub fn diagnostic(code: i32) -> Cow<'static, str> {
   match ErrorCode::from_repr(code) {
      Some(known) => Cow::Borrowed(known.message()),
      None => Cow::Owned(code.to_string()),
   }
}

/// Emits the diagnostic notice for a native failure code.
///
/// `0` means success and produces nothing. The notice is informational
/// only; it never changes control flow.
pub fn log_message(code: i32) -> Option<Cow<'static, str>> {
   if code == 0 {
      return None;
   }
   let message = diagnostic(code);
   warn!("{message}");
   Some(message)
}
