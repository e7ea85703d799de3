//! Hardware register façade
//!
//! The engine only touches the USB function controller through the
//! [`Hardware`] trait. Register values are typed, so the engine never
//! shifts bits on its own. [`Mmio`](crate::Mmio) implements the trait for
//! the memory-mapped controller; tests supply an in-memory fake.

use bitflags::bitflags;
use usb_device::{endpoint::EndpointType, UsbDirection};

bitflags! {
    /// Function control register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FunctionControl: u8 {
        /// Connect the function to the bus.
        const DEVICE_ENABLE = 1 << 0;
        /// Never chirp; stay at full speed.
        const FULL_SPEED_ONLY = 1 << 1;
        /// Test mode selector, low bit.
        const TEST_SELECT0 = 1 << 2;
        /// Test mode selector, high bit.
        const TEST_SELECT1 = 1 << 3;
        /// Drive the selected test mode.
        const TEST_ENABLE = 1 << 4;
    }
}

bitflags! {
    /// Common (device-level) interrupt causes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CommonInterrupt: u8 {
        const RESET = 1 << 0;
        const SUSPEND = 1 << 1;
        const RESUME = 1 << 2;
        const SOF = 1 << 3;
        const PHY = 1 << 4;
        const PID = 1 << 5;
        const CRC16 = 1 << 6;
        const CRC5 = 1 << 7;
    }
}

bitflags! {
    /// Endpoint status register.
    ///
    /// Every bit is write-one-to-act. Writing zero bits has no effect.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EndpointStatus: u8 {
        /// Read: an OUT packet waits in the FIFO.
        /// Write: release the packet.
        const OUT_READY = 1 << 0;
        /// Read: the committed IN packet has not been sent yet.
        /// Write: commit the FIFO contents as the next IN packet.
        const IN_READY = 1 << 1;
        /// Read: a SETUP packet waits in the control FIFO.
        /// Write: acknowledge the SETUP packet.
        const SETUP = 1 << 2;
        /// Read: the controller sent a STALL handshake.
        /// Write: clear the flag.
        const STALL_SENT = 1 << 3;
        /// Write (control endpoint only): the packet written with this
        /// bit ends the data stage.
        const DATA_END = 1 << 4;
        /// Write: reset the data toggle to DATA0.
        const CLEAR_TOGGLE = 1 << 5;
        /// Write: discard the FIFO contents.
        const FIFO_FLUSH = 1 << 6;
    }
}

bitflags! {
    /// Endpoint control register.
    ///
    /// Holds the max packet size and transfer type fields, along with the
    /// single-bit flags below. Use the field accessors rather than the
    /// raw bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EndpointControl: u8 {
        /// Max packet size field; `log2(size) - 3`.
        const SIZE = 0b111;
        /// Transfer type field; zero disables the endpoint.
        const TYPE = 0b11 << 3;
        /// The endpoint transmits to the host.
        const DIR_IN = 1 << 5;
        /// Two FIFO buffers back the endpoint.
        const DOUBLE_BUFFER = 1 << 6;
        /// Respond to host tokens with STALL.
        const STALL = 1 << 7;
    }
}

const TYPE_OFFSET: u8 = 3;
const TYPE_BULK: u8 = 1;
const TYPE_INTERRUPT: u8 = 2;
const TYPE_ISOCHRONOUS: u8 = 3;

impl EndpointControl {
    /// Control register value for the control endpoint.
    pub fn control(max_packet_size: u16) -> Self {
        Self::empty().with_max_packet_size(max_packet_size)
    }

    /// Control register value for a non-zero endpoint.
    ///
    /// Control endpoints only encode the packet size.
    pub fn endpoint(
        ep_type: EndpointType,
        direction: UsbDirection,
        max_packet_size: u16,
        double_buffered: bool,
    ) -> Self {
        let kind = match ep_type {
            EndpointType::Control => 0,
            EndpointType::Bulk => TYPE_BULK,
            EndpointType::Interrupt => TYPE_INTERRUPT,
            EndpointType::Isochronous { .. } => TYPE_ISOCHRONOUS,
        };
        let mut ctrl = Self::from_bits_retain(kind << TYPE_OFFSET)
            .with_max_packet_size(max_packet_size);
        ctrl.set(Self::DIR_IN, direction == UsbDirection::In);
        ctrl.set(Self::DOUBLE_BUFFER, double_buffered);
        ctrl
    }

    /// Replace the size field.
    ///
    /// `size` is a power of two in 8..=1024.
    pub fn with_max_packet_size(self, size: u16) -> Self {
        let code = (size.max(8).trailing_zeros() - 3) as u8;
        Self::from_bits_retain((self.bits() & !Self::SIZE.bits()) | (code & Self::SIZE.bits()))
    }

    /// Returns the max packet size, in bytes.
    pub fn max_packet_size(self) -> u16 {
        8 << (self.bits() & Self::SIZE.bits())
    }

    /// Returns the raw transfer type field.
    pub fn type_field(self) -> u8 {
        (self.bits() & Self::TYPE.bits()) >> TYPE_OFFSET
    }
}

/// Access to a FIFO-based USB function controller.
///
/// Reads take `&self`; anything that changes controller state takes
/// `&mut self`. Endpoint numbers are always below
/// [`endpoint_count()`](Hardware::endpoint_count).
pub trait Hardware {
    /// Number of endpoints the controller implements, control included.
    fn endpoint_count(&self) -> usize;

    /// Bus presence.
    fn vbus(&self) -> bool;

    fn function_control(&self) -> FunctionControl;
    fn set_function_control(&mut self, fctrl: FunctionControl);

    /// Program the function address. Zero leaves the address filter
    /// disabled.
    fn set_address(&mut self, address: u8);

    fn common_interrupts(&self) -> CommonInterrupt;
    /// Write-one-to-clear.
    fn clear_common_interrupts(&mut self, irqs: CommonInterrupt);
    fn set_common_interrupt_enable(&mut self, irqs: CommonInterrupt);

    /// One bit per endpoint.
    fn endpoint_interrupts(&self) -> u16;
    /// Write-one-to-clear.
    fn clear_endpoint_interrupts(&mut self, mask: u16);
    fn set_endpoint_interrupt_enable(&mut self, mask: u16);

    /// The last frame number the controller saw.
    fn frame_number(&self) -> u16;

    fn endpoint_control(&self, ep: u8) -> EndpointControl;
    fn set_endpoint_control(&mut self, ep: u8, ctrl: EndpointControl);

    fn endpoint_status(&self, ep: u8) -> EndpointStatus;
    /// See [`EndpointStatus`] for the meaning of each written bit.
    fn write_endpoint_status(&mut self, ep: u8, status: EndpointStatus);

    /// Number of bytes waiting in the endpoint's OUT FIFO.
    fn rx_count(&self, ep: u8) -> u16;

    /// Pop `buffer.len()` bytes from the endpoint's FIFO.
    fn read_fifo(&mut self, ep: u8, buffer: &mut [u8]);
    /// Push `data` into the endpoint's FIFO.
    fn write_fifo(&mut self, ep: u8, data: &[u8]);

    /// Power the analog transceiver.
    fn set_phy_enabled(&mut self, enable: bool);
    /// Drive (or stop driving) resume signaling on the bus.
    fn set_remote_wakeup(&mut self, signal: bool);

    /// Busy-wait.
    fn delay_us(&mut self, us: u32);
}

#[cfg(test)]
mod tests {
    use super::{EndpointControl, EndpointStatus};
    use usb_device::{endpoint::EndpointType, UsbDirection};

    #[test]
    fn control_size_field() {
        for (size, code) in [(8, 0), (16, 1), (32, 2), (64, 3)] {
            let ctrl = EndpointControl::control(size);
            assert_eq!(ctrl.bits(), code);
            assert_eq!(ctrl.max_packet_size(), size);
        }
    }

    #[test]
    fn bulk_in_double_buffered() {
        let ctrl = EndpointControl::endpoint(EndpointType::Bulk, UsbDirection::In, 512, true);
        assert_eq!(ctrl.bits(), 0b0110_1110);
        assert_eq!(ctrl.max_packet_size(), 512);
        assert_eq!(ctrl.type_field(), 1);
    }

    #[test]
    fn interrupt_out() {
        let ctrl = EndpointControl::endpoint(EndpointType::Interrupt, UsbDirection::Out, 1024, false);
        assert_eq!(ctrl.bits(), 0b0001_0111);
        assert!(!ctrl.contains(EndpointControl::DIR_IN));
    }

    #[test]
    fn stall_preserves_fields() {
        let ctrl = EndpointControl::endpoint(EndpointType::Bulk, UsbDirection::Out, 64, false);
        let stalled = ctrl | EndpointControl::STALL;
        assert_eq!(stalled.max_packet_size(), 64);
        assert_eq!(stalled.type_field(), 1);
        assert_eq!(stalled - EndpointControl::STALL, ctrl);
    }

    #[test]
    fn status_bits_distinct() {
        let all = EndpointStatus::all();
        assert_eq!(all.bits().count_ones(), 7);
    }
}
