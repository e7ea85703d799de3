//! Device state machine
//!
//! [`DeviceContext`] tracks the chapter 9 device state, the selected
//! configuration and the remote wakeup and test mode features. Its
//! methods only compute transitions; the driver applies them to the
//! hardware.

use crate::{
    config::Speed,
    error::{Error, Result},
};

/// USB device state.
///
/// States are ordered: a state compares greater than every state that
/// precedes it in the enumeration sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// Not attached; hardware disabled.
    None,
    /// Hardware enabled.
    Attached,
    /// Bus presence detected and speed negotiated.
    Powered,
    /// The host reset the bus.
    Default,
    /// The host assigned an address.
    Address,
    /// The host selected a configuration.
    Configured,
    /// The bus is suspended. Resume restores the previous state.
    Suspended,
}

/// USB 2.0 test modes, by test selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TestMode {
    TestJ = 1,
    TestK = 2,
    Se0Nak = 3,
    Packet = 4,
}

impl TryFrom<u8> for TestMode {
    type Error = Error;
    fn try_from(selector: u8) -> Result<Self> {
        match selector {
            1 => Ok(TestMode::TestJ),
            2 => Ok(TestMode::TestK),
            3 => Ok(TestMode::Se0Nak),
            4 => Ok(TestMode::Packet),
            _ => Err(Error::NotSupported),
        }
    }
}

/// Device-wide state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeviceContext {
    state: DeviceState,
    /// State to restore on resume.
    resume_to: DeviceState,
    configuration: u8,
    remote_wakeup: bool,
    test_mode: Option<TestMode>,
    speed: Speed,
}

impl DeviceContext {
    /// `speed` is reported until the next attach negotiates one.
    pub const fn new(speed: Speed) -> Self {
        DeviceContext {
            state: DeviceState::None,
            resume_to: DeviceState::None,
            configuration: 0,
            remote_wakeup: false,
            test_mode: None,
            speed,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    pub fn set_remote_wakeup(&mut self, enable: bool) {
        self.remote_wakeup = enable;
    }

    pub fn test_mode(&self) -> Option<TestMode> {
        self.test_mode
    }

    pub fn select_test_mode(&mut self, mode: TestMode) {
        self.test_mode = Some(mode);
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// `None` → `Attached`. Returns `false` from any other state.
    pub fn attached(&mut self) -> bool {
        if self.state == DeviceState::None {
            self.state = DeviceState::Attached;
            true
        } else {
            false
        }
    }

    /// Speed negotiation finished.
    pub fn powered(&mut self, speed: Speed) {
        self.speed = speed;
        self.configuration = 0;
        self.state = DeviceState::Powered;
    }

    /// Enter `Default`, from any state.
    pub fn bus_reset(&mut self) {
        self.remote_wakeup = false;
        self.state = DeviceState::Default;
    }

    /// Suspend from `Default`, `Address` or `Configured`.
    ///
    /// Returns `false` if the suspend is ignored.
    pub fn suspend(&mut self) -> bool {
        if (DeviceState::Default..=DeviceState::Configured).contains(&self.state) {
            self.resume_to = self.state;
            self.state = DeviceState::Suspended;
            true
        } else {
            false
        }
    }

    /// Returns `false` if the device wasn't suspended.
    pub fn resume(&mut self) -> bool {
        if self.state == DeviceState::Suspended {
            self.state = self.resume_to;
            true
        } else {
            false
        }
    }

    pub fn detach(&mut self) {
        self.state = DeviceState::None;
        self.configuration = 0;
        self.test_mode = None;
    }

    /// Apply a SET_ADDRESS request.
    ///
    /// Returns the value to program in the address register, or `None` if
    /// the request doesn't change the address.
    pub fn set_address(&mut self, address: u16) -> Result<Option<u8>> {
        if address > 127 {
            return Err(Error::InvalidParameter);
        }
        let address = address as u8;
        match (self.state, address) {
            (DeviceState::Default, 0) => return Ok(None),
            (DeviceState::Default, _) => self.state = DeviceState::Address,
            (DeviceState::Address, 0) => self.state = DeviceState::Default,
            (DeviceState::Address, _) => {}
            _ => return Err(Error::NotSupported),
        }
        self.configuration = 0;
        Ok(Some(address))
    }

    /// Apply a SET_CONFIGURATION request.
    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        match self.state {
            DeviceState::Address | DeviceState::Configured => {
                self.state = if value != 0 {
                    DeviceState::Configured
                } else {
                    DeviceState::Address
                };
                self.configuration = value;
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }
}
