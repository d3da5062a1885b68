//! Data model types

pub mod device;

pub use device::{DevicePatch, DeviceRecord};
