//! Interrupt-safe device sharing

use crate::{
    device::Device,
    driver::{Buffer, Driver, TransferMode},
    error::Result,
    hw::Hardware,
};
use core::cell::RefCell;
use cortex_m::interrupt::{CriticalSection, Mutex};

/// Shares a [`Device`] between the USB interrupt and foreground code.
///
/// Call [`on_interrupt()`](BusAdapter::on_interrupt) from your USB
/// interrupt handler. Foreground code reaches the driver through
/// [`with_driver()`](BusAdapter::with_driver), which masks interrupts for
/// the duration of the closure. Don't block in that closure; move data
/// with [`transfer()`](BusAdapter::transfer), which lets the interrupt
/// run while it waits.
pub struct BusAdapter<'a, H> {
    device: Mutex<RefCell<Device<'a, H>>>,
}

impl<'a, H: Hardware> BusAdapter<'a, H> {
    /// Wrap a device.
    ///
    /// Create your endpoints and attach before wrapping the device, or do
    /// so later with [`with_driver()`](BusAdapter::with_driver).
    pub fn new(device: Device<'a, H>) -> Self {
        BusAdapter {
            device: Mutex::new(RefCell::new(device)),
        }
    }

    /// Service the USB interrupt.
    pub fn on_interrupt(&self) {
        self.with_device(|device| device.on_interrupt());
    }

    /// Interrupt-safe, mutable access to the device
    pub fn with_device<R>(&self, func: impl FnOnce(&mut Device<'a, H>) -> R) -> R {
        free(|cs| {
            let device = self.device.borrow(cs);
            let mut device = device.borrow_mut();
            func(&mut device)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    pub fn with_driver<R>(&self, func: impl FnOnce(&mut Driver<'a, H>) -> R) -> R {
        self.with_device(|device| func(device.driver_mut()))
    }

    /// Move data on a non-zero endpoint.
    ///
    /// Behaves like [`Driver::transfer`], but interrupts are only masked
    /// while a packet moves, or for one poll interval of a wait. The USB
    /// interrupt keeps answering the host in between.
    pub fn transfer(
        &self,
        ep: u8,
        buffer: Buffer<'_>,
        mode: TransferMode,
        offset: usize,
    ) -> Result<usize> {
        let mut transfer =
            self.with_driver(|driver| driver.start_transfer(ep, buffer, mode, offset))?;
        loop {
            if let Some(moved) = self.with_driver(|driver| transfer.poll(driver)) {
                return Ok(moved);
            }
        }
    }

    /// Consume endpoint events, and run endpoint callbacks.
    ///
    /// Unlike [`Driver::poll_endpoints`], the callbacks run with interrupts
    /// unmasked, so they may call [`with_driver()`](BusAdapter::with_driver).
    /// Returns a bitmask of the endpoints that had events.
    pub fn poll(&self) -> u16 {
        let (serviced, callbacks) = self.with_driver(|driver| {
            let serviced = driver.take_events();
            (serviced, driver.callbacks(serviced))
        });
        for (number, callback) in callbacks.iter().enumerate() {
            if let Some(callback) = callback {
                callback(number as u8);
            }
        }
        serviced
    }
}

#[cfg(not(test))]
fn free<R>(func: impl FnOnce(&CriticalSection) -> R) -> R {
    cortex_m::interrupt::free(func)
}

/// Host tests have no interrupts to mask.
#[cfg(test)]
fn free<R>(func: impl FnOnce(&CriticalSection) -> R) -> R {
    // Safety: tests are the only context that touches the adapter.
    func(&unsafe { CriticalSection::new() })
}
