//! A USB device controller engine for FIFO-based function controllers
//!
//! `usbd-fifo` drives a USB 2.0 function controller that exposes per-endpoint
//! FIFOs through memory-mapped registers. It tracks the chapter 9 device
//! state machine, answers standard control requests, accounts for FIFO
//! memory, and moves data in max-packet-size chunks.
//!
//! The engine reaches the hardware through the [`Hardware`] trait. For a
//! memory-mapped controller, implement [`Peripherals`] and use [`Mmio`].
//!
//! # Usage
//!
//! 1. Allocate [`EndpointEvents`] in a `static`.
//! 2. Create a [`Driver`] with a [`Config`], and create your endpoints.
//! 3. [`attach()`](Driver::attach) once the bus is present.
//! 4. Wrap the driver and your [`Handlers`] in a [`Device`], and share it
//!    with the USB interrupt through a [`BusAdapter`].
//! 5. Poll endpoint events from the foreground, and move data with
//!    [`BusAdapter::transfer`]. It lets the USB interrupt run between
//!    packets.
//!
//! Enable the `defmt` feature to log through [`defmt`](https://crates.io/crates/defmt).

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;

mod bus;
mod config;
mod context;
mod control;
mod device;
mod driver;
mod endpoint;
mod error;
mod hw;
mod setup;
mod state;

pub mod ral;

#[cfg(test)]
mod fake;

pub use bus::BusAdapter;
pub use config::{Config, Speed, DEFAULT_FIFO_BYTES};
pub use context::{DeviceState, TestMode};
pub use control::{
    BusListener, ConfigurationHandler, DescriptorProvider, FeatureFilter, Handlers,
    InterfaceHandler, RequestHandler,
};
pub use device::Device;
pub use driver::{Buffer, Driver, Transfer, TransferMode};
pub use endpoint::{EndpointCallback, EndpointConfig};
pub use error::{Error, Result};
pub use hw::{CommonInterrupt, EndpointControl, EndpointStatus, FunctionControl, Hardware};
pub use ral::{Mmio, Peripherals};
pub use setup::SetupPacket;
pub use state::{EndpointEvents, MAX_ENDPOINTS};
