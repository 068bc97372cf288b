//! `uniblectl`: drives one BLE peripheral over BlueZ.
//!
//! ```text
//! uniblectl scan [SECONDS]
//! uniblectl [DEVICE] [MESSAGE]
//! ```
//!
//! Bindings come from the config file. With a device, the tool connects,
//! writes `MESSAGE` when given, then prints notifications until Ctrl-C.

use std::{env, time::Duration};

use log::{info, warn};
use tokio::{signal, time};

use unible::{
   BleConfig, Callbacks, NOTIFY, NativeBluetooth, Result, platform::bluez::BluezPlatform,
};

const DEFAULT_SCAN_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let config = BleConfig::load()?;
   let mut args = env::args().skip(1);
   let first = args.next();

   let callbacks = Callbacks::new()
      .on_state_change(|change| info!("State: {}", change.state))
      .on_device_found(|device| {
         println!(
            "{}\t{}\t{}",
            device.device_id,
            device.name.as_deref().unwrap_or("-"),
            device.rssi.map_or_else(|| "-".to_owned(), |rssi| rssi.to_string()),
         );
      })
      .on_characteristic_change(|value| println!("{value}"))
      .on_disconnect(|| warn!("Peripheral disconnected"));

   let ble = NativeBluetooth::native(BluezPlatform::new(None), config, callbacks).await?;

   if first.as_deref() == Some("scan") {
      let secs = args
         .next()
         .and_then(|s| s.parse().ok())
         .unwrap_or(DEFAULT_SCAN_SECS);
      ble.start_search_device(None).await?;
      time::sleep(Duration::from_secs(secs)).await;
      ble.stop_search_device().await?;
      return ble.destroy().await;
   }

   if let Some(device) = first {
      ble.set_device_id(device);
   }
   ble.connect().await?;

   if let Some(message) = args.next() {
      ble.write_ble_characteristic(&message).await?;
   }

   let bindings = ble.bindings();
   if bindings.get(NOTIFY).is_some_and(|b| b.is_configured()) {
      ble.start_listen_value_change(None).await?;
      info!("Listening, press Ctrl-C to exit");
      signal::ctrl_c().await?;
   }

   ble.destroy().await
}
