//! Concrete platform bindings.
//!
//! Each binding implements one backend's platform trait and is compiled
//! only where its host API exists.

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;

#[cfg(all(feature = "web", target_arch = "wasm32"))]
pub mod webbluetooth;
