//! Control request dispatch
//!
//! Each SETUP packet is classified by its request type. Standard
//! requests are answered here, with help from the application's handlers;
//! class and vendor requests go straight to the application. Any request
//! that fails stalls the control endpoint.

use crate::{
    context::{DeviceState, TestMode},
    driver::{Buffer, Driver},
    error::{Error, Result},
    hw::Hardware,
    setup::SetupPacket,
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

/// `TEST_MODE` feature selector.
const FEATURE_TEST_MODE: u16 = 2;
/// Configuration descriptor type.
const CONFIGURATION_DESCRIPTOR: u8 = 2;
/// `bmAttributes` offset in a configuration descriptor.
const ATTRIBUTES_OFFSET: usize = 7;
const ATTRIBUTE_SELF_POWERED: u8 = 1 << 6;
const ATTRIBUTE_REMOTE_WAKEUP: u8 = 1 << 5;

const STATUS_SELF_POWERED: u8 = 1 << 0;
const STATUS_REMOTE_WAKEUP: u8 = 1 << 1;
const STATUS_HALT: u8 = 1 << 0;

/// Handles a whole control transfer, data and status stages included.
///
/// Use [`Driver::transfer_ep0`] for the data stage, then
/// [`Driver::ack_in`] or [`Driver::ack_out`] for the status stage.
/// Returning an error stalls the control endpoint.
pub trait RequestHandler<H>: Send {
    fn request(&mut self, driver: &mut Driver<'_, H>, setup: &SetupPacket) -> Result<()>;
}

/// Supplies descriptors for GET_DESCRIPTOR.
///
/// The descriptor type and index are in `setup.value`. The engine sends at
/// most `setup.length` bytes of the returned descriptor.
pub trait DescriptorProvider: Send {
    fn descriptor(&mut self, setup: &SetupPacket) -> Result<&[u8]>;
}

/// Told about SET_CONFIGURATION before the engine applies it.
pub trait ConfigurationHandler: Send {
    fn set_configuration(&mut self, setup: &SetupPacket) -> Result<()>;
}

pub trait InterfaceHandler: Send {
    fn set_interface(&mut self, _setup: &SetupPacket) -> Result<()> {
        Err(Error::NotSupported)
    }
    /// Returns the interface's alternate setting.
    fn get_interface(&mut self, _setup: &SetupPacket) -> Result<u8> {
        Err(Error::NotSupported)
    }
}

/// Approves SET_FEATURE and CLEAR_FEATURE requests before they're applied.
pub trait FeatureFilter: Send {
    fn feature(&mut self, setup: &SetupPacket) -> Result<()>;
}

/// Bus events. All methods run in interrupt context.
pub trait BusListener: Send {
    fn reset(&mut self) {}
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
    /// A start-of-frame arrived.
    fn sof(&mut self, _frame: u16) {}
}

/// The application's hooks into control request handling.
///
/// Every hook is optional. Without a `standard` handler, standard requests
/// are answered by the engine. Without a `class` or `vendor` handler,
/// those requests stall.
pub struct Handlers<'a, H> {
    /// Replaces the engine's standard request handling.
    ///
    /// The handler drives the state machine through
    /// [`Driver::set_address`] and [`Driver::set_configuration`].
    pub standard: Option<&'a mut dyn RequestHandler<H>>,
    pub class: Option<&'a mut dyn RequestHandler<H>>,
    pub vendor: Option<&'a mut dyn RequestHandler<H>>,
    pub descriptor: Option<&'a mut dyn DescriptorProvider>,
    pub configuration: Option<&'a mut dyn ConfigurationHandler>,
    pub interface: Option<&'a mut dyn InterfaceHandler>,
    pub endpoint_feature: Option<&'a mut dyn FeatureFilter>,
    pub device_feature: Option<&'a mut dyn FeatureFilter>,
    pub bus: Option<&'a mut dyn BusListener>,
}

impl<H> Handlers<'_, H> {
    pub const fn new() -> Self {
        Handlers {
            standard: None,
            class: None,
            vendor: None,
            descriptor: None,
            configuration: None,
            interface: None,
            endpoint_feature: None,
            device_feature: None,
            bus: None,
        }
    }
}

impl<H> Default for Handlers<'_, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hardware> Handlers<'_, H> {
    /// Read and answer the pending SETUP packet.
    pub(crate) fn dispatch(&mut self, driver: &mut Driver<'_, H>) {
        let setup = driver.read_setup();
        trace!("SETUP {}", setup);

        let result = match setup.kind() {
            RequestType::Standard => match self.standard.as_deref_mut() {
                Some(handler) => handler.request(driver, &setup),
                None => self.standard_request(driver, &setup),
            },
            RequestType::Class => delegate(self.class.as_deref_mut(), driver, &setup),
            RequestType::Vendor => delegate(self.vendor.as_deref_mut(), driver, &setup),
            RequestType::Reserved => Err(Error::NotSupported),
        };

        if let Err(_err) = result {
            debug!("SETUP {} failed: {}", setup, _err);
            // The control endpoint is always enabled.
            let _ = driver.stall(0);
        }
    }

    fn standard_request(&mut self, driver: &mut Driver<'_, H>, setup: &SetupPacket) -> Result<()> {
        match setup.request {
            Request::GET_STATUS => self.get_status(driver, setup),
            Request::CLEAR_FEATURE | Request::SET_FEATURE => self.feature(driver, setup),
            Request::SET_ADDRESS => {
                driver.set_address(setup.value)?;
                driver.ack_in();
                Ok(())
            }
            Request::GET_DESCRIPTOR => {
                let provider = self.descriptor.as_deref_mut().ok_or(Error::NotSupported)?;
                let descriptor = provider.descriptor(setup)?;
                let len = descriptor.len().min(setup.length as usize);
                driver.transfer_ep0(Buffer::In(&descriptor[..len]), setup.length as usize);
                driver.ack_out();
                Ok(())
            }
            Request::GET_CONFIGURATION => {
                let configuration = [driver.configuration()];
                driver.transfer_ep0(Buffer::In(&configuration), setup.length as usize);
                driver.ack_out();
                Ok(())
            }
            Request::SET_CONFIGURATION => {
                let value = u8::try_from(setup.value).map_err(|_| Error::InvalidParameter)?;
                if !matches!(driver.state(), DeviceState::Address | DeviceState::Configured) {
                    return Err(Error::NotSupported);
                }
                if let Some(handler) = self.configuration.as_deref_mut() {
                    handler.set_configuration(setup)?;
                }
                driver.set_configuration(value)?;
                driver.ack_in();
                Ok(())
            }
            Request::GET_INTERFACE => {
                let handler = self.interface.as_deref_mut().ok_or(Error::NotSupported)?;
                let alternate = [handler.get_interface(setup)?];
                driver.transfer_ep0(Buffer::In(&alternate), setup.length as usize);
                driver.ack_out();
                Ok(())
            }
            Request::SET_INTERFACE => {
                let handler = self.interface.as_deref_mut().ok_or(Error::NotSupported)?;
                handler.set_interface(setup)?;
                driver.ack_in();
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn get_status(&mut self, driver: &mut Driver<'_, H>, setup: &SetupPacket) -> Result<()> {
        if setup.direction() != UsbDirection::In {
            return Err(Error::NotSupported);
        }
        let mut status = [0u8; 2];
        match setup.recipient() {
            Recipient::Device => {
                let attributes = self.configuration_attributes();
                if attributes & ATTRIBUTE_REMOTE_WAKEUP != 0 && driver.remote_wakeup_enabled() {
                    status[0] |= STATUS_REMOTE_WAKEUP;
                }
                if attributes & ATTRIBUTE_SELF_POWERED != 0 {
                    status[0] |= STATUS_SELF_POWERED;
                }
            }
            Recipient::Endpoint => {
                let ep = setup.endpoint_number();
                if !halt_permitted(driver.state(), ep) {
                    return Err(Error::NotSupported);
                }
                if driver.get_endpoint_stalled(ep)? {
                    status[0] |= STATUS_HALT;
                }
            }
            _ => return Err(Error::NotSupported),
        }
        driver.transfer_ep0(Buffer::In(&status), setup.length as usize);
        driver.ack_out();
        Ok(())
    }

    /// `bmAttributes` of the current configuration descriptor, or zero if
    /// there's no descriptor to consult.
    fn configuration_attributes(&mut self) -> u8 {
        let request = SetupPacket {
            request_type: UsbDirection::In as u8,
            request: Request::GET_DESCRIPTOR,
            value: (CONFIGURATION_DESCRIPTOR as u16) << 8,
            index: 0,
            length: 255,
        };
        self.descriptor
            .as_deref_mut()
            .and_then(|provider| provider.descriptor(&request).ok())
            .and_then(|descriptor| descriptor.get(ATTRIBUTES_OFFSET).copied())
            .unwrap_or(0)
    }

    fn feature(&mut self, driver: &mut Driver<'_, H>, setup: &SetupPacket) -> Result<()> {
        let set = setup.request == Request::SET_FEATURE;
        match setup.recipient() {
            Recipient::Endpoint => {
                if setup.value != Request::FEATURE_ENDPOINT_HALT {
                    return Err(Error::NotSupported);
                }
                let ep = setup.endpoint_number();
                if !halt_permitted(driver.state(), ep) {
                    return Err(Error::NotSupported);
                }
                filter(self.endpoint_feature.as_deref_mut(), setup)?;
                if set {
                    driver.stall(ep)?;
                } else {
                    driver.clear_endpoint_stall(ep)?;
                }
                driver.ack_in();
                Ok(())
            }
            Recipient::Device => {
                let test_mode = match setup.value {
                    Request::FEATURE_DEVICE_REMOTE_WAKEUP => None,
                    FEATURE_TEST_MODE if set && setup.index & 0xFF == 0 => {
                        Some(TestMode::try_from((setup.index >> 8) as u8)?)
                    }
                    _ => return Err(Error::NotSupported),
                };
                filter(self.device_feature.as_deref_mut(), setup)?;
                if test_mode.is_none() {
                    driver.set_remote_wakeup_enabled(set);
                }
                driver.ack_in();
                // Test mode starts after the status stage.
                if let Some(mode) = test_mode {
                    driver.set_test_mode(mode);
                }
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }
}

/// Endpoint halt requests are honored for the control endpoint at any
/// time, and for other endpoints once configured.
fn halt_permitted(state: DeviceState, ep: u8) -> bool {
    ep == 0 || state >= DeviceState::Configured
}

fn filter(filter: Option<&mut (dyn FeatureFilter + '_)>, setup: &SetupPacket) -> Result<()> {
    match filter {
        Some(filter) => filter.feature(setup),
        None => Ok(()),
    }
}

fn delegate<H: Hardware>(
    handler: Option<&mut (dyn RequestHandler<H> + '_)>,
    driver: &mut Driver<'_, H>,
    setup: &SetupPacket,
) -> Result<()> {
    handler
        .ok_or(Error::NotSupported)?
        .request(driver, setup)
}
