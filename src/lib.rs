//! USB Mass Storage Class device implementation
//!
//! This crate implements the device side of the USB Mass Storage Class
//! over the [Bulk Only Transport], together with a device controller
//! driver for the STM32 "USB A"/FSDev full-speed peripheral.
//!
//! # Layers
//! * [MscClass] - the Bulk Only Transport state machine and built-in SCSI
//!   command processor. It is driven with transfer-complete events by the
//!   USB device core and services the application through the
//!   [BlockDevice] trait.
//! * [UsbdBus] - the endpoint services the device core must provide to
//!   the class.
//! * [fsdev] - the STM32 FSDev controller driver: packet memory
//!   management, endpoint registers and the interrupt-driven transfer
//!   engine.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `fsdev` | Include the STM32 FSDev controller driver (default) |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [Bulk Only Transport]: crate::bot
//! [MscClass]: crate::bot::MscClass
//! [BlockDevice]: crate::scsi::BlockDevice
//! [UsbdBus]: crate::usbd::UsbdBus
//! [fsdev]: crate::fsdev

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bot;
pub(crate) mod fmt;
#[cfg(feature = "fsdev")]
pub mod fsdev;
pub mod scsi;
pub mod usbd;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;

/// SCSI transparent command set subclass code
pub const SUBCLASS_SCSI: u8 = 0x06;

/// Bulk Only Transport interface protocol
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;
