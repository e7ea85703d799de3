//! Endpoint table and FIFO accounting
//!
//! The table holds one descriptor per logical endpoint. A descriptor is
//! *registered* once an endpoint is created, and stays registered until
//! it's freed; it's *enabled* while it owns FIFO memory and accepts
//! transfers. Bus reset and detach disable endpoints, but keep them
//! registered so they can be restored without help from the application.

use crate::{
    config::Speed,
    error::{Error, Result},
    hw::EndpointControl,
    state::MAX_ENDPOINTS,
};
use usb_device::{
    endpoint::{EndpointType, IsochronousSynchronizationType, IsochronousUsageType},
    UsbDirection,
};

/// Called when an endpoint has work for the application.
///
/// The argument is the endpoint number.
pub type EndpointCallback = fn(u8);

/// Endpoint parameters.
///
/// ```
/// use usbd_fifo::EndpointConfig;
/// use usb_device::UsbDirection;
///
/// let config = EndpointConfig::bulk(UsbDirection::In, 512).double_buffered();
/// assert_eq!(config.fifo_bytes(), 1024);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    pub ep_type: EndpointType,
    /// Ignored for the control endpoint, which is bidirectional.
    pub direction: UsbDirection,
    pub max_packet_size: u16,
    pub double_buffered: bool,
}

impl EndpointConfig {
    /// Control endpoint parameters.
    pub const fn control(max_packet_size: u16) -> Self {
        Self::new(EndpointType::Control, UsbDirection::Out, max_packet_size)
    }

    pub const fn bulk(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(EndpointType::Bulk, direction, max_packet_size)
    }

    pub const fn interrupt(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(EndpointType::Interrupt, direction, max_packet_size)
    }

    pub const fn isochronous(direction: UsbDirection, max_packet_size: u16) -> Self {
        Self::new(
            EndpointType::Isochronous {
                synchronization: IsochronousSynchronizationType::NoSynchronization,
                usage: IsochronousUsageType::Data,
            },
            direction,
            max_packet_size,
        )
    }

    const fn new(ep_type: EndpointType, direction: UsbDirection, max_packet_size: u16) -> Self {
        EndpointConfig {
            ep_type,
            direction,
            max_packet_size,
            double_buffered: false,
        }
    }

    /// Back the endpoint with two FIFO buffers.
    pub const fn double_buffered(mut self) -> Self {
        self.double_buffered = true;
        self
    }

    /// FIFO memory consumed by this endpoint while it's enabled.
    pub const fn fifo_bytes(&self) -> usize {
        let bytes = self.max_packet_size as usize;
        if self.double_buffered {
            bytes * 2
        } else {
            bytes
        }
    }

    /// Returns `true` for isochronous endpoints.
    pub fn is_isochronous(&self) -> bool {
        matches!(self.ep_type, EndpointType::Isochronous { .. })
    }

    /// The control register value for endpoint `number`.
    pub(crate) fn control_register(&self, number: u8) -> EndpointControl {
        if number == 0 {
            EndpointControl::control(self.max_packet_size)
        } else {
            EndpointControl::endpoint(
                self.ep_type,
                self.direction,
                self.max_packet_size,
                self.double_buffered,
            )
        }
    }

    /// Check the packet size against the type and bus speed.
    pub(crate) fn validate(&self, number: u8, speed: Speed) -> Result<()> {
        let size = self.max_packet_size;
        if !size.is_power_of_two() || !(8..=1024).contains(&size) {
            return Err(Error::InvalidParameter);
        }
        let limit = match (self.ep_type, speed) {
            (EndpointType::Control, _) => 64,
            (EndpointType::Bulk, Speed::Full) => 64,
            (EndpointType::Bulk, Speed::High) => 512,
            (EndpointType::Interrupt, Speed::Full) => 64,
            (EndpointType::Interrupt, Speed::High) => 1024,
            (EndpointType::Isochronous { .. }, Speed::Full) => 512,
            (EndpointType::Isochronous { .. }, Speed::High) => 1024,
        };
        let control = self.ep_type == EndpointType::Control;
        if size > limit || control != (number == 0) {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

/// Per-endpoint bookkeeping.
#[derive(Clone, Copy, Default)]
pub(crate) struct Descriptor {
    pub config: Option<EndpointConfig>,
    pub enabled: bool,
    pub callback: Option<EndpointCallback>,
}

/// The endpoint table.
///
/// Only `capacity` descriptors are usable; the rest stay zeroed.
pub(crate) struct EndpointTable {
    descriptors: [Descriptor; MAX_ENDPOINTS],
    capacity: usize,
    fifo_bytes: usize,
}

impl EndpointTable {
    pub fn new(capacity: usize, fifo_bytes: usize) -> Self {
        EndpointTable {
            descriptors: [Descriptor::default(); MAX_ENDPOINTS],
            capacity: capacity.min(MAX_ENDPOINTS),
            fifo_bytes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the descriptor, if `number` is in range.
    pub fn get(&self, number: u8) -> Option<&Descriptor> {
        self.descriptors[..self.capacity].get(number as usize)
    }

    pub fn get_mut(&mut self, number: u8) -> Option<&mut Descriptor> {
        self.descriptors[..self.capacity].get_mut(number as usize)
    }

    /// Returns the configuration of an enabled endpoint.
    pub fn enabled(&self, number: u8) -> Result<&EndpointConfig> {
        let desc = self.get(number).ok_or(Error::InvalidParameter)?;
        match desc.config.as_ref() {
            Some(config) if desc.enabled => Ok(config),
            _ => Err(Error::NotConfigured),
        }
    }

    /// FIFO bytes held by enabled endpoints, other than `excluded`.
    pub fn fifo_in_use(&self, excluded: u8) -> usize {
        self.iter()
            .filter(|(number, desc)| desc.enabled && *number != excluded)
            .filter_map(|(_, desc)| desc.config.as_ref())
            .map(EndpointConfig::fifo_bytes)
            .sum()
    }

    /// Check that (re)configuring `number` with `config` fits in the
    /// FIFO budget. The endpoint's current cost is not counted.
    pub fn check_budget(&self, number: u8, config: &EndpointConfig) -> Result<()> {
        let total = self.fifo_in_use(number) + config.fifo_bytes();
        if total > self.fifo_bytes {
            return Err(Error::ResourceExhausted);
        }
        Ok(())
    }

    /// Disable every non-control endpoint, keeping registrations.
    pub fn disable_all(&mut self) {
        for desc in self.descriptors[1..].iter_mut() {
            desc.enabled = false;
        }
    }

    /// Zero all descriptors.
    pub fn clear(&mut self) {
        self.descriptors = [Descriptor::default(); MAX_ENDPOINTS];
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Descriptor)> {
        self.descriptors[..self.capacity]
            .iter()
            .enumerate()
            .map(|(number, desc)| (number as u8, desc))
    }
}
