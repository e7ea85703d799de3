//! Interrupt handling
//!
//! A [`Device`] pairs the driver with the application's handlers. Call
//! [`on_interrupt()`](Device::on_interrupt) from the USB interrupt, and
//! [`Driver::poll_endpoints`] from the foreground to run endpoint
//! callbacks.

use crate::{
    control::Handlers,
    driver::Driver,
    hw::{CommonInterrupt, EndpointStatus, Hardware},
};

/// A USB device: the driver, plus the hooks that answer the host.
pub struct Device<'a, H> {
    driver: Driver<'a, H>,
    handlers: Handlers<'a, H>,
}

impl<'a, H: Hardware> Device<'a, H> {
    pub fn new(driver: Driver<'a, H>, handlers: Handlers<'a, H>) -> Self {
        Device { driver, handlers }
    }

    pub fn driver(&self) -> &Driver<'a, H> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut Driver<'a, H> {
        &mut self.driver
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers<'a, H> {
        &mut self.handlers
    }

    /// Release the driver and the handlers.
    pub fn release(self) -> (Driver<'a, H>, Handlers<'a, H>) {
        (self.driver, self.handlers)
    }

    /// Service the USB interrupt.
    ///
    /// Device-level events are handled first. Then, a pending SETUP packet
    /// is answered, and activity on other endpoints is counted for
    /// [`Driver::poll_endpoints`].
    pub fn on_interrupt(&mut self) {
        self.common_interrupts();
        self.endpoint_interrupts();
    }

    fn common_interrupts(&mut self) {
        let irqs = self.driver.hardware().common_interrupts();
        if irqs.is_empty() {
            return;
        }
        self.driver.hardware_mut().clear_common_interrupts(irqs);

        if irqs.contains(CommonInterrupt::RESET) {
            // Resets before the first attach are noise.
            if !self.driver.reset_device() {
                return;
            }
            if let Some(bus) = self.handlers.bus.as_deref_mut() {
                bus.reset();
            }
            self.driver.restore_all_endpoints();
        }
        if irqs.contains(CommonInterrupt::SUSPEND) && self.driver.suspend() {
            if let Some(bus) = self.handlers.bus.as_deref_mut() {
                bus.suspend();
            }
        }
        if irqs.contains(CommonInterrupt::RESUME) && self.driver.resume() {
            if let Some(bus) = self.handlers.bus.as_deref_mut() {
                bus.resume();
            }
        }
        if irqs.contains(CommonInterrupt::SOF) {
            let frame = self.driver.hardware().frame_number();
            if let Some(bus) = self.handlers.bus.as_deref_mut() {
                bus.sof(frame);
            }
        }
    }

    fn endpoint_interrupts(&mut self) {
        let irqs = self.driver.hardware().endpoint_interrupts();
        if irqs == 0 {
            return;
        }
        self.driver.hardware_mut().clear_endpoint_interrupts(irqs);

        if irqs & 1 != 0 {
            let status = self.driver.hardware().endpoint_status(0);
            if status.contains(EndpointStatus::SETUP) {
                self.driver.end_control_stall();
                self.handlers.dispatch(&mut self.driver);
            } else if let Some(callback) = self.driver.ep0_callback() {
                callback(0);
            }
        }

        for ep in 1..16u8 {
            if irqs & (1 << ep) != 0 {
                self.driver.signal(ep);
            }
        }
    }
}
