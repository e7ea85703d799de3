//! USB device controller driver
//!
//! The driver owns the hardware, the endpoint table and the device
//! context. Everything that changes endpoint or device state goes
//! through its methods, so the FIFO budget is checked on every
//! structural change.

mod transfer;

pub use transfer::{Buffer, Transfer, TransferMode};

use crate::{
    config::{Config, Speed},
    context::{DeviceContext, DeviceState, TestMode},
    endpoint::{Descriptor, EndpointCallback, EndpointConfig, EndpointTable},
    error::{Error, Result},
    hw::{CommonInterrupt, EndpointControl, EndpointStatus, FunctionControl, Hardware},
    setup::SetupPacket,
    state::{EndpointEvents, Events, MAX_ENDPOINTS},
};

/// Highest endpoint number a USB device can address.
const MAX_ENDPOINT_NUMBER: u8 = 15;

/// Resume signaling must last at least 1ms; hold it for 2ms.
const REMOTE_WAKEUP_US: u32 = 2000;

/// Micro-frames arrive every 125us at high speed.
const MICRO_FRAME_US: u32 = 125 + 5;

/// The USB 2.0 test packet, without SYNC, PID and CRC.
const TEST_PACKET: [u8; 53] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // JKJKJKJK x9
    0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, // JJKKJJKK x8
    0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, // JJJJKKKK x8
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // JJJJJJJKKKKKKK x8
    0x7F, 0xBF, 0xDF, 0xEF, 0xF7, 0xFB, 0xFD, // JJJJJJJK x8
    0xFC, 0x7E, 0xBF, 0xDF, 0xEF, 0xF7, 0xFB, 0xFD, 0x7E, // JKKKKKKK x10, JK
];

/// A USB device controller driver
///
/// After you create a `Driver` with [`new()`](Driver::new), register your
/// endpoints with [`create_endpoint()`](Driver::create_endpoint) and call
/// [`attach()`](Driver::attach) once the bus is present. Then, forward
/// the USB interrupt to a [`Device`](crate::Device).
pub struct Driver<'a, H> {
    hw: H,
    config: Config,
    endpoints: EndpointTable,
    events: Events<'a>,
    context: DeviceContext,
}

impl<'a, H: Hardware> Driver<'a, H> {
    /// Create a new `Driver`
    ///
    /// The control endpoint is created with the configured packet size
    /// and callback. The device starts detached.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint events have already been assigned to
    /// another driver, if they hold no endpoints, or if the FIFO budget
    /// can't hold the control endpoint.
    pub fn new<const COUNT: usize>(
        hw: H,
        config: Config,
        events: &'a EndpointEvents<COUNT>,
    ) -> Self {
        let events = events.take().expect("Endpoint events already assigned");
        let capacity = events.capacity().min(hw.endpoint_count());
        assert!(capacity > 0, "No room for the control endpoint");

        let mut driver = Driver {
            hw,
            config,
            endpoints: EndpointTable::new(capacity, config.fifo_bytes),
            events,
            context: DeviceContext::new(config.speed),
        };
        driver
            .create_endpoint(
                0,
                EndpointConfig::control(config.ep0_size),
                config.ep0_callback,
            )
            .expect("Control endpoint exceeds the FIFO budget");
        driver
    }

    /// Detach, forget all endpoints, and release the hardware.
    pub fn finalise(mut self) -> H {
        self.detach();
        self.endpoints.clear();
        self.hw
    }

    /// Read-only access to the hardware.
    ///
    /// Register writes go through the driver, so that every endpoint
    /// change is checked against the FIFO budget.
    ///
    /// ```compile_fail
    /// use usbd_fifo::{Driver, EndpointControl, Hardware};
    ///
    /// fn poke<H: Hardware>(driver: &mut Driver<'_, H>) {
    ///     driver
    ///         .hardware_mut()
    ///         .set_endpoint_control(1, EndpointControl::empty());
    /// }
    /// ```
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub(crate) fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the current device state.
    pub fn state(&self) -> DeviceState {
        self.context.state()
    }

    /// Returns the negotiated bus speed.
    ///
    /// Until the first attach, this is the configured ceiling.
    pub fn speed(&self) -> Speed {
        self.context.speed()
    }

    /// Returns the selected configuration, or zero if unconfigured.
    pub fn configuration(&self) -> u8 {
        self.context.configuration()
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.context.remote_wakeup_enabled()
    }

    /// Returns the test mode the host selected, if any.
    pub fn test_mode(&self) -> Option<TestMode> {
        self.context.test_mode()
    }

    /// Returns `true` if the bus is present.
    pub fn is_connected(&self) -> bool {
        self.hw.vbus()
    }

    /// Attach to the bus, and negotiate a speed.
    ///
    /// Succeeds without effect if the device is already powered. Returns
    /// [`Error::Disconnected`] if there's no bus presence, or if the bus
    /// goes away during speed negotiation. In the latter case, the device
    /// is detached again.
    pub fn attach(&mut self) -> Result<()> {
        if !self.hw.vbus() {
            return Err(Error::Disconnected);
        }
        if self.context.state() >= DeviceState::Powered {
            return Ok(());
        }
        if self.context.attached() {
            self.enable_hardware();
            debug!("ATTACHED");
        }

        self.hw.set_address(0);
        self.restore_all_endpoints();
        self.hw.set_phy_enabled(true);

        match self.negotiate_speed() {
            Some(speed) => {
                self.context.powered(speed);
                debug!("POWERED {}", speed);
                Ok(())
            }
            None => {
                warn!("Disconnected during speed negotiation");
                self.detach();
                Err(Error::Disconnected)
            }
        }
    }

    fn enable_hardware(&mut self) {
        let fctrl = if self.config.speed == Speed::Full {
            FunctionControl::FULL_SPEED_ONLY
        } else {
            FunctionControl::empty()
        };
        self.hw.set_function_control(fctrl);
        self.hw.clear_common_interrupts(CommonInterrupt::all());
        self.hw.set_common_interrupt_enable(CommonInterrupt::all());
        let endpoints = ((1u32 << self.endpoints.capacity()) - 1) as u16;
        self.hw.set_endpoint_interrupt_enable(endpoints);
    }

    /// Returns `None` if the bus goes away.
    fn negotiate_speed(&mut self) -> Option<Speed> {
        let fctrl = self.hw.function_control();
        if fctrl.contains(FunctionControl::DEVICE_ENABLE) {
            self.hw
                .set_function_control(fctrl - FunctionControl::DEVICE_ENABLE);
            self.hw.delay_us(200);
        }

        if self.config.speed == Speed::Full {
            self.hw.set_function_control(
                FunctionControl::DEVICE_ENABLE | FunctionControl::FULL_SPEED_ONLY,
            );
            return Some(Speed::Full);
        }

        self.hw.set_function_control(FunctionControl::DEVICE_ENABLE);
        while !self.hw.common_interrupts().contains(CommonInterrupt::SOF) {
            if !self.hw.vbus() {
                return None;
            }
        }
        self.hw.clear_common_interrupts(CommonInterrupt::SOF);
        self.hw.delay_us(MICRO_FRAME_US);
        if self.hw.common_interrupts().contains(CommonInterrupt::SOF) {
            Some(Speed::High)
        } else {
            Some(Speed::Full)
        }
    }

    /// Disable all endpoints and the hardware, and return to
    /// [`DeviceState::None`].
    ///
    /// Endpoints stay registered, and they're restored on the next
    /// attach.
    pub fn detach(&mut self) {
        self.context.detach();
        self.endpoints.disable_all();

        self.hw.set_endpoint_interrupt_enable(0);
        self.hw.set_common_interrupt_enable(CommonInterrupt::empty());
        self.hw.set_function_control(FunctionControl::empty());
        self.hw.delay_us(1000);
        self.hw.set_phy_enabled(false);
        self.hw.delay_us(1000);

        for ep in 1..self.endpoints.capacity() {
            self.events.take_all(ep);
        }
        debug!("DETACHED");
    }

    /// Handle a bus reset.
    ///
    /// Clears the address and the remote wakeup feature, then restores
    /// every registered endpoint. Returns `false`, and does nothing, if
    /// the device isn't attached.
    pub fn bus_reset(&mut self) -> bool {
        if !self.reset_device() {
            return false;
        }
        self.restore_all_endpoints();
        true
    }

    /// The first half of [`bus_reset()`](Driver::bus_reset): everything
    /// but the endpoint restore.
    pub(crate) fn reset_device(&mut self) -> bool {
        if self.context.state() == DeviceState::None {
            return false;
        }
        self.hw.set_address(0);
        self.endpoints.disable_all();
        self.context.bus_reset();
        debug!("RESET");
        true
    }

    /// Suspend the device, and power down the transceiver.
    ///
    /// Ignored (returns `false`) unless the bus is present and the device
    /// has been reset by the host.
    pub fn suspend(&mut self) -> bool {
        if !self.hw.vbus() || !self.context.suspend() {
            return false;
        }
        self.hw.set_phy_enabled(false);
        debug!("SUSPEND");
        true
    }

    /// Resume a suspended device.
    pub fn resume(&mut self) -> bool {
        if !self.context.resume() {
            return false;
        }
        self.hw.set_phy_enabled(true);
        debug!("RESUME {}", self.context.state());
        true
    }

    /// Signal remote wakeup to the host.
    ///
    /// Does nothing, and returns `false`, unless the host enabled the
    /// remote wakeup feature. Blocks for the resume signaling interval.
    pub fn request_remote_wakeup(&mut self) -> bool {
        if !self.context.remote_wakeup_enabled() {
            return false;
        }
        self.hw.set_remote_wakeup(true);
        self.hw.delay_us(REMOTE_WAKEUP_US);
        self.hw.set_remote_wakeup(false);
        self.hw.set_phy_enabled(true);
        true
    }

    /// Create (or reconfigure) an endpoint.
    ///
    /// On success, the endpoint is enabled. On failure, neither the
    /// endpoint table nor the hardware is changed.
    ///
    /// - [`Error::InvalidParameter`]: `number` isn't a USB endpoint number,
    ///   the packet size isn't supported for the type and bus speed, or
    ///   an enabled endpoint would change direction or type.
    /// - [`Error::NotSupported`]: `number` exceeds the endpoint table.
    /// - [`Error::ResourceExhausted`]: the FIFO budget would be exceeded.
    pub fn create_endpoint(
        &mut self,
        number: u8,
        config: EndpointConfig,
        callback: Option<EndpointCallback>,
    ) -> Result<()> {
        if number > MAX_ENDPOINT_NUMBER {
            return Err(Error::InvalidParameter);
        }
        let current = *self.endpoints.get(number).ok_or(Error::NotSupported)?;
        config.validate(number, self.context.speed())?;
        if let Some(existing) = current.config.filter(|_| current.enabled && number != 0) {
            if existing.direction != config.direction || existing.ep_type != config.ep_type {
                return Err(Error::InvalidParameter);
            }
        }
        self.endpoints.check_budget(number, &config)?;

        self.hw
            .set_endpoint_control(number, config.control_register(number));
        if let Some(desc) = self.endpoints.get_mut(number) {
            *desc = Descriptor {
                config: Some(config),
                enabled: true,
                callback,
            };
        }
        debug!("EP{} CREATE {}", number, config);
        Ok(())
    }

    /// Disable an endpoint, and forget its configuration.
    ///
    /// The control endpoint can't be freed.
    pub fn free_endpoint(&mut self, number: u8) -> Result<()> {
        if number == 0 {
            return Err(Error::InvalidParameter);
        }
        let desc = self
            .endpoints
            .get_mut(number)
            .ok_or(Error::InvalidParameter)?;
        *desc = Descriptor::default();
        self.hw.set_endpoint_control(number, EndpointControl::empty());
        self.events.take_all(number as usize);
        debug!("EP{} FREE", number);
        Ok(())
    }

    /// Re-program and enable every registered endpoint.
    ///
    /// The hardware clears endpoint configurations on bus reset; this
    /// puts them back.
    pub fn restore_all_endpoints(&mut self) {
        for number in 0..self.endpoints.capacity() as u8 {
            let Some(config) = self.endpoints.get(number).and_then(|desc| desc.config) else {
                continue;
            };
            if self.endpoints.check_budget(number, &config).is_err() {
                warn!("EP{} not restored; FIFO budget exceeded", number);
                continue;
            }
            self.hw
                .set_endpoint_control(number, config.control_register(number));
            if let Some(desc) = self.endpoints.get_mut(number) {
                desc.enabled = true;
            }
        }
        trace!("RESTORED");
    }

    /// Returns the max packet size of an enabled endpoint.
    pub fn endpoint_max_packet_size(&self, ep: u8) -> Result<u16> {
        Ok(self.endpoints.enabled(ep)?.max_packet_size)
    }

    /// Stall an endpoint.
    ///
    /// For the control endpoint, this is a protocol stall that ends when
    /// the next SETUP packet arrives. For other endpoints, the data toggle
    /// is reset and the FIFO is flushed, discarding pending events.
    /// Isochronous endpoints can't be stalled.
    pub fn stall_endpoint(&mut self, ep: u8) -> Result<()> {
        self.stall(ep)?;
        self.events.take_all(ep as usize);
        Ok(())
    }

    /// Stall without touching the event counters, for use in interrupt
    /// context.
    pub(crate) fn stall(&mut self, ep: u8) -> Result<()> {
        let config = *self.endpoints.enabled(ep)?;
        if ep != 0 && config.is_isochronous() {
            return Err(Error::NotSupported);
        }
        let ctrl = self.hw.endpoint_control(ep);
        self.hw.set_endpoint_control(ep, ctrl | EndpointControl::STALL);
        if ep != 0 {
            self.hw.write_endpoint_status(
                ep,
                EndpointStatus::CLEAR_TOGGLE | EndpointStatus::FIFO_FLUSH,
            );
        }
        debug!("EP{} STALL", ep);
        Ok(())
    }

    /// Clear an endpoint stall, and reset the data toggle.
    pub fn clear_endpoint_stall(&mut self, ep: u8) -> Result<()> {
        self.endpoints.enabled(ep)?;
        if ep != 0 {
            self.hw
                .write_endpoint_status(ep, EndpointStatus::CLEAR_TOGGLE);
        }
        let ctrl = self.hw.endpoint_control(ep);
        self.hw.set_endpoint_control(ep, ctrl - EndpointControl::STALL);
        Ok(())
    }

    /// Returns `true` if the endpoint is stalled.
    pub fn get_endpoint_stalled(&self, ep: u8) -> Result<bool> {
        self.endpoints.enabled(ep)?;
        Ok(self
            .hw
            .endpoint_control(ep)
            .contains(EndpointControl::STALL))
    }

    /// End a control endpoint stall before a new SETUP is handled.
    pub(crate) fn end_control_stall(&mut self) {
        let ctrl = self.hw.endpoint_control(0);
        if ctrl.contains(EndpointControl::STALL) {
            self.hw.set_endpoint_control(0, ctrl - EndpointControl::STALL);
            self.hw
                .write_endpoint_status(0, EndpointStatus::STALL_SENT);
        }
    }

    /// Returns `true` if an IN packet is still waiting to be sent, or if
    /// an OUT packet is waiting to be read.
    pub fn buffer_full(&self, ep: u8) -> Result<bool> {
        let config = self.endpoints.enabled(ep)?;
        let status = self.hw.endpoint_status(ep);
        let flag = match config.direction {
            usb_device::UsbDirection::In => EndpointStatus::IN_READY,
            usb_device::UsbDirection::Out => EndpointStatus::OUT_READY,
        };
        Ok(status.contains(flag))
    }

    /// Number of bytes waiting in the endpoint's OUT FIFO.
    pub fn rx_count(&self, ep: u8) -> Result<u16> {
        self.endpoints.enabled(ep)?;
        if ep == 0 || self.hw.endpoint_status(ep).contains(EndpointStatus::OUT_READY) {
            Ok(self.hw.rx_count(ep))
        } else {
            Ok(0)
        }
    }

    /// Cancel any transfer in progress.
    ///
    /// Flushes the FIFO and resets the data toggle. Pending events are
    /// discarded.
    pub fn flush_endpoint(&mut self, ep: u8) -> Result<()> {
        self.endpoints.enabled(ep)?;
        self.hw.write_endpoint_status(
            ep,
            EndpointStatus::FIFO_FLUSH | EndpointStatus::CLEAR_TOGGLE,
        );
        self.events.take_all(ep as usize);
        Ok(())
    }

    /// Returns the number of unconsumed events for an endpoint.
    pub fn pending_events(&self, ep: u8) -> u32 {
        self.events.pending(ep as usize)
    }

    /// Consume endpoint events.
    ///
    /// Every enabled endpoint with pending events has its callback called
    /// once. Returns a bitmask of the endpoints that had events.
    pub fn poll_endpoints(&mut self) -> u16 {
        let serviced = self.take_events();
        for (number, callback) in self.callbacks(serviced).iter().enumerate() {
            if let Some(callback) = callback {
                callback(number as u8);
            }
        }
        serviced
    }

    /// Consume endpoint events, without running callbacks.
    ///
    /// Returns a bitmask of the enabled endpoints that had events.
    pub fn take_events(&mut self) -> u16 {
        let mut serviced = 0;
        for (number, desc) in self.endpoints.iter().skip(1) {
            if desc.enabled && self.events.take_all(number as usize) > 0 {
                serviced |= 1 << number;
            }
        }
        serviced
    }

    /// The callbacks of the endpoints in `mask`.
    pub(crate) fn callbacks(&self, mask: u16) -> [Option<EndpointCallback>; MAX_ENDPOINTS] {
        let mut callbacks = [None; MAX_ENDPOINTS];
        for (number, desc) in self.endpoints.iter() {
            if mask & (1 << number) != 0 {
                callbacks[number as usize] = desc.callback;
            }
        }
        callbacks
    }

    /// Put the transceiver in a USB 2.0 test mode.
    ///
    /// Only a power cycle leaves test mode.
    pub fn set_test_mode(&mut self, mode: TestMode) {
        let select = match mode {
            TestMode::TestJ => FunctionControl::TEST_SELECT0,
            TestMode::TestK => FunctionControl::TEST_SELECT1,
            TestMode::Se0Nak => FunctionControl::empty(),
            TestMode::Packet => FunctionControl::TEST_SELECT0 | FunctionControl::TEST_SELECT1,
        };
        if mode == TestMode::Packet {
            let status = self.hw.endpoint_status(0);
            if status.contains(EndpointStatus::STALL_SENT) {
                self.hw.write_endpoint_status(
                    0,
                    EndpointStatus::STALL_SENT | EndpointStatus::DATA_END,
                );
            }
            self.hw.write_fifo(0, &TEST_PACKET);
        }
        let fctrl = self.hw.function_control()
            - (FunctionControl::TEST_SELECT0 | FunctionControl::TEST_SELECT1);
        self.hw
            .set_function_control(fctrl | select | FunctionControl::TEST_ENABLE);
        self.context.select_test_mode(mode);
        debug!("TEST MODE {}", mode);
    }

    pub(crate) fn set_remote_wakeup_enabled(&mut self, enable: bool) {
        self.context.set_remote_wakeup(enable);
    }

    /// Apply SET_ADDRESS to the state machine and the address register.
    ///
    /// The built-in request handling calls this. A replacement standard
    /// request handler calls it before it acknowledges the request.
    ///
    /// Fails with [`Error::InvalidParameter`] for addresses above 127, and
    /// with [`Error::NotSupported`] outside of the `Default` and `Address`
    /// states.
    pub fn set_address(&mut self, address: u16) -> Result<()> {
        if let Some(address) = self.context.set_address(address)? {
            self.hw.set_address(address);
            debug!("ADDRESS {}", address);
        }
        Ok(())
    }

    /// Apply SET_CONFIGURATION. A non-zero configuration re-enables every
    /// registered endpoint.
    ///
    /// Fails with [`Error::NotSupported`] unless the device has an
    /// address.
    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.context.set_configuration(value)?;
        if value != 0 {
            self.restore_all_endpoints();
        }
        debug!("CONFIGURED {}", value);
        Ok(())
    }

    /// Read the SETUP packet, and let the control endpoint accept the
    /// following data and status stages.
    pub(crate) fn read_setup(&mut self) -> SetupPacket {
        let mut raw = [0; SetupPacket::LEN];
        self.hw.read_fifo(0, &mut raw);
        self.hw.write_endpoint_status(0, EndpointStatus::SETUP);
        SetupPacket::parse(raw)
    }

    pub(crate) fn ep0_callback(&self) -> Option<EndpointCallback> {
        self.endpoints.get(0).and_then(|desc| desc.callback)
    }

    /// Count an endpoint event. Interrupt context only.
    pub(crate) fn signal(&self, ep: u8) {
        self.events.signal(ep as usize);
    }
}
