//! Engine configuration

use crate::endpoint::EndpointCallback;

/// USB full / high speed setting.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// Full speed, 12 Mbit/s.
    ///
    /// As a ceiling, this prevents the device from enumerating as a
    /// high-speed device, even if the host is capable of high speed.
    Full,
    /// High speed, 480 Mbit/s.
    ///
    /// A high-speed device can still interface a full speed host, so
    /// use this setting for the most flexibility.
    #[default]
    High,
}

/// The default hardware FIFO budget, shared by all endpoints.
pub const DEFAULT_FIFO_BYTES: usize = 4096;

/// Engine configuration.
///
/// Use the builder methods to override the defaults:
///
/// ```
/// use usbd_fifo::{Config, Speed};
///
/// const CONFIG: Config = Config::new()
///     .speed(Speed::Full)
///     .ep0_size(16)
///     .in_timeout(20);
///
/// assert_eq!(CONFIG.max_speed(), Speed::Full);
/// assert_eq!(CONFIG.control_packet_size(), 16);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub(crate) speed: Speed,
    pub(crate) ep0_size: u16,
    pub(crate) fifo_bytes: usize,
    pub(crate) in_timeout: u32,
    pub(crate) poll_interval_us: u32,
    pub(crate) out_timeout: Option<u32>,
    pub(crate) ep0_callback: Option<EndpointCallback>,
}

impl Config {
    /// High speed ceiling, 64 byte control endpoint, 4 KiB FIFO
    /// budget, 10 × 200us IN timeout and unbounded OUT waits.
    pub const fn new() -> Self {
        Config {
            speed: Speed::High,
            ep0_size: 64,
            fifo_bytes: DEFAULT_FIFO_BYTES,
            in_timeout: 10,
            poll_interval_us: 200,
            out_timeout: None,
            ep0_callback: None,
        }
    }

    /// Set the ceiling on the negotiated bus speed.
    pub const fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    /// Set the control endpoint's max packet size.
    ///
    /// The value is rounded down to a power of two, and clamped to 8..=64.
    pub const fn ep0_size(mut self, size: u16) -> Self {
        let size = if size < 8 {
            8
        } else if size > 64 {
            64
        } else {
            1 << (15 - size.leading_zeros())
        };
        self.ep0_size = size;
        self
    }

    /// Set the hardware FIFO budget, in bytes.
    pub const fn fifo_bytes(mut self, bytes: usize) -> Self {
        self.fifo_bytes = bytes;
        self
    }

    /// Number of polls to wait for an IN buffer to drain on a non-zero
    /// endpoint before the packet is flushed.
    pub const fn in_timeout(mut self, polls: u32) -> Self {
        self.in_timeout = polls;
        self
    }

    /// Delay between polls of a bounded wait, in microseconds.
    pub const fn poll_interval_us(mut self, us: u32) -> Self {
        self.poll_interval_us = us;
        self
    }

    /// Number of polls to wait for OUT data on a non-zero endpoint.
    ///
    /// `None` waits until data arrives or the bus goes away.
    pub const fn out_timeout(mut self, polls: Option<u32>) -> Self {
        self.out_timeout = polls;
        self
    }

    /// Callback for control endpoint activity outside of SETUP handling.
    ///
    /// Runs at interrupt priority.
    pub const fn ep0_callback(mut self, callback: EndpointCallback) -> Self {
        self.ep0_callback = Some(callback);
        self
    }

    /// Returns the bus speed ceiling.
    pub const fn max_speed(&self) -> Speed {
        self.speed
    }

    /// Returns the control endpoint's max packet size.
    pub const fn control_packet_size(&self) -> u16 {
        self.ep0_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Speed};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_speed(), Speed::High);
        assert_eq!(config.control_packet_size(), 64);
        assert_eq!(config.fifo_bytes, 4096);
        assert_eq!(config.in_timeout * config.poll_interval_us, 2000);
        assert!(config.out_timeout.is_none());
        assert!(config.ep0_callback.is_none());
    }

    #[test]
    fn ep0_size_clamped() {
        assert_eq!(Config::new().ep0_size(0).control_packet_size(), 8);
        assert_eq!(Config::new().ep0_size(8).control_packet_size(), 8);
        assert_eq!(Config::new().ep0_size(33).control_packet_size(), 32);
        assert_eq!(Config::new().ep0_size(64).control_packet_size(), 64);
        assert_eq!(Config::new().ep0_size(512).control_packet_size(), 64);
    }
}
