//! Engine errors

use core::fmt;

/// Errors returned by the device controller engine.
///
/// Short transfers are not errors. Transfer primitives report the
/// number of bytes they moved, and a host abort, disconnect or timeout
/// shows up as a shorter count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Out-of-range endpoint number, or an unsupported parameter for
    /// the endpoint type and bus speed.
    InvalidParameter,
    /// The endpoint is not enabled.
    NotConfigured,
    /// The FIFO budget would be exceeded.
    ResourceExhausted,
    /// The operation does not apply, or the request is not implemented.
    NotSupported,
    /// There's no bus presence (VBUS).
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidParameter => "invalid parameter",
            Error::NotConfigured => "endpoint not configured",
            Error::ResourceExhausted => "endpoint FIFO memory exhausted",
            Error::NotSupported => "operation not supported",
            Error::Disconnected => "device disconnected",
        };
        f.write_str(msg)
    }
}

impl From<Error> for usb_device::UsbError {
    fn from(err: Error) -> Self {
        use usb_device::UsbError;
        match err {
            Error::InvalidParameter => UsbError::InvalidEndpoint,
            Error::NotConfigured => UsbError::InvalidState,
            Error::ResourceExhausted => UsbError::EndpointMemoryOverflow,
            Error::NotSupported => UsbError::Unsupported,
            Error::Disconnected => UsbError::InvalidState,
        }
    }
}

/// Engine result type.
pub type Result<T> = core::result::Result<T, Error>;
