//! Register access for the memory-mapped function controller
//!
//! The register block is described with `ral-registers` types, and
//! accessed with its `read_reg!` / `write_reg!` / `modify_reg!` macros.
//! [`Mmio`] adapts the block to the [`Hardware`] façade.

use crate::hw::{CommonInterrupt, EndpointControl, EndpointStatus, FunctionControl, Hardware};

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

/// Number of endpoint register groups in the block.
pub const ENDPOINT_REGISTERS: usize = 16;

/// USB function controller registers.
#[allow(non_snake_case, non_upper_case_globals)]
pub mod usbd {
    use super::{RORegister, RWRegister, ENDPOINT_REGISTERS};

    /// Per-endpoint registers.
    #[repr(C)]
    pub struct EndpointRegisters {
        /// Endpoint control.
        pub EPCR: RWRegister<u32>,
        /// Endpoint status; write-one-to-act.
        pub EPSR: RWRegister<u32>,
        /// OUT FIFO byte count.
        pub EPCNT: RORegister<u32>,
        /// Byte-wide FIFO data port.
        pub EPFIFO: RWRegister<u8>,
        _reserved: [u8; 3],
    }

    #[repr(C)]
    pub struct RegisterBlock {
        pub FCTRL: RWRegister<u32>,
        pub FADDR: RWRegister<u32>,
        /// Common interrupt flags; write-one-to-clear.
        pub CMIF: RWRegister<u32>,
        pub CMIE: RWRegister<u32>,
        /// Endpoint interrupt flags; write-one-to-clear.
        pub EPIF: RWRegister<u32>,
        pub EPIE: RWRegister<u32>,
        pub FRAME: RORegister<u32>,
        pub PHYCTRL: RWRegister<u32>,
        _reserved: [u32; 8],
        pub EP: [EndpointRegisters; ENDPOINT_REGISTERS],
    }

    pub mod FADDR {
        pub mod ADDR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7F << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod EN {
            pub const offset: u32 = 7;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod FRAME {
        pub mod FRAME {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7FF << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod PHYCTRL {
        pub mod PHY_EN {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod RWAKE {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        /// Read only.
        pub mod VBUS {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod EPCNT {
        pub mod COUNT {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7FF << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }
}

/// A type that owns the USB function controller registers
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// register block. The returned pointer is assumed to be valid for the
/// lifetime of the object, and is cast to [`usbd::RegisterBlock`].
///
/// # Example
///
/// ```
/// use usbd_fifo::Peripherals;
///
/// struct Usbd(());
///
/// impl Usbd {
///     const ADDRESS: usize = 0x1010_0000;
/// }
///
/// unsafe impl Peripherals for Usbd {
///     fn usbd(&self) -> *const () {
///         Self::ADDRESS as *const ()
///     }
/// }
///
/// assert_eq!(Usbd(()).usbd(), 0x1010_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the function controller registers.
    fn usbd(&self) -> *const ();
}

/// Memory-mapped [`Hardware`] implementation.
///
/// Delays spin the core; `cycles_per_us` is the core clock in MHz.
pub struct Mmio<P> {
    peripherals: P,
    cycles_per_us: u32,
}

impl<P: Peripherals> Mmio<P> {
    pub fn new(peripherals: P, cycles_per_us: u32) -> Self {
        Mmio {
            peripherals,
            cycles_per_us,
        }
    }

    /// Release the peripherals.
    pub fn release(self) -> P {
        self.peripherals
    }

    fn regs(&self) -> &usbd::RegisterBlock {
        // Safety: Peripherals implementation guarantees the block is valid.
        unsafe { &*self.peripherals.usbd().cast() }
    }

    fn ep(&self, ep: u8) -> &usbd::EndpointRegisters {
        &self.regs().EP[ep as usize]
    }
}

impl<P: Peripherals> Hardware for Mmio<P> {
    fn endpoint_count(&self) -> usize {
        ENDPOINT_REGISTERS
    }

    fn vbus(&self) -> bool {
        read_reg!(usbd, self.regs(), PHYCTRL, VBUS == 1)
    }

    fn function_control(&self) -> FunctionControl {
        FunctionControl::from_bits_truncate(read_reg!(usbd, self.regs(), FCTRL) as u8)
    }

    fn set_function_control(&mut self, fctrl: FunctionControl) {
        write_reg!(usbd, self.regs(), FCTRL, fctrl.bits() as u32);
    }

    fn set_address(&mut self, address: u8) {
        write_reg!(usbd, self.regs(), FADDR, ADDR: address as u32, EN: (address != 0) as u32);
    }

    fn common_interrupts(&self) -> CommonInterrupt {
        CommonInterrupt::from_bits_truncate(read_reg!(usbd, self.regs(), CMIF) as u8)
    }

    fn clear_common_interrupts(&mut self, irqs: CommonInterrupt) {
        write_reg!(usbd, self.regs(), CMIF, irqs.bits() as u32);
    }

    fn set_common_interrupt_enable(&mut self, irqs: CommonInterrupt) {
        write_reg!(usbd, self.regs(), CMIE, irqs.bits() as u32);
    }

    fn endpoint_interrupts(&self) -> u16 {
        read_reg!(usbd, self.regs(), EPIF) as u16
    }

    fn clear_endpoint_interrupts(&mut self, mask: u16) {
        write_reg!(usbd, self.regs(), EPIF, mask as u32);
    }

    fn set_endpoint_interrupt_enable(&mut self, mask: u16) {
        write_reg!(usbd, self.regs(), EPIE, mask as u32);
    }

    fn frame_number(&self) -> u16 {
        read_reg!(usbd, self.regs(), FRAME, FRAME) as u16
    }

    fn endpoint_control(&self, ep: u8) -> EndpointControl {
        EndpointControl::from_bits_retain(read_reg!(usbd, self.ep(ep), EPCR) as u8)
    }

    fn set_endpoint_control(&mut self, ep: u8, ctrl: EndpointControl) {
        write_reg!(usbd, self.ep(ep), EPCR, ctrl.bits() as u32);
    }

    fn endpoint_status(&self, ep: u8) -> EndpointStatus {
        EndpointStatus::from_bits_truncate(read_reg!(usbd, self.ep(ep), EPSR) as u8)
    }

    fn write_endpoint_status(&mut self, ep: u8, status: EndpointStatus) {
        write_reg!(usbd, self.ep(ep), EPSR, status.bits() as u32);
    }

    fn rx_count(&self, ep: u8) -> u16 {
        read_reg!(usbd, self.ep(ep), EPCNT, COUNT) as u16
    }

    fn read_fifo(&mut self, ep: u8, buffer: &mut [u8]) {
        let fifo = &self.ep(ep).EPFIFO;
        for byte in buffer.iter_mut() {
            *byte = fifo.read();
        }
    }

    fn write_fifo(&mut self, ep: u8, data: &[u8]) {
        let fifo = &self.ep(ep).EPFIFO;
        for byte in data {
            fifo.write(*byte);
        }
    }

    fn set_phy_enabled(&mut self, enable: bool) {
        modify_reg!(usbd, self.regs(), PHYCTRL, PHY_EN: enable as u32);
    }

    fn set_remote_wakeup(&mut self, signal: bool) {
        modify_reg!(usbd, self.regs(), PHYCTRL, RWAKE: signal as u32);
    }

    fn delay_us(&mut self, us: u32) {
        cortex_m::asm::delay(us.saturating_mul(self.cycles_per_us));
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<usbd::EndpointRegisters>() == 16) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<usbd::RegisterBlock>() == 0x140) as usize];

#[cfg(test)]
mod tests {
    use super::{usbd, Mmio, Peripherals};
    use crate::hw::{EndpointControl, EndpointStatus, FunctionControl, Hardware};
    use std::boxed::Box;

    struct Block(Box<usbd::RegisterBlock>);

    impl Block {
        fn new() -> Self {
            // Safety: registers are plain integers in cells; zero is valid.
            Block(Box::new(unsafe { core::mem::zeroed() }))
        }
    }

    unsafe impl Peripherals for &Block {
        fn usbd(&self) -> *const () {
            &*self.0 as *const _ as _
        }
    }

    #[test]
    fn address_enable_bit() {
        let block = Block::new();
        let mut mmio = Mmio::new(&block, 1);
        mmio.set_address(5);
        assert_eq!(block.0.FADDR.read(), 0x85);
        mmio.set_address(0);
        assert_eq!(block.0.FADDR.read(), 0);
    }

    #[test]
    fn vbus_and_phy() {
        let block = Block::new();
        let mut mmio = Mmio::new(&block, 1);
        assert!(!mmio.vbus());
        block.0.PHYCTRL.write(1 << 8);
        assert!(mmio.vbus());
        mmio.set_phy_enabled(true);
        mmio.set_remote_wakeup(true);
        assert_eq!(block.0.PHYCTRL.read(), (1 << 8) | 0b11);
        mmio.set_phy_enabled(false);
        assert_eq!(block.0.PHYCTRL.read(), (1 << 8) | 0b10);
    }

    #[test]
    fn endpoint_registers() {
        let block = Block::new();
        let mut mmio = Mmio::new(&block, 1);
        let ctrl = EndpointControl::control(64);
        mmio.set_endpoint_control(3, ctrl);
        assert_eq!(block.0.EP[3].EPCR.read(), ctrl.bits() as u32);
        assert_eq!(mmio.endpoint_control(3), ctrl);

        mmio.write_endpoint_status(2, EndpointStatus::IN_READY | EndpointStatus::DATA_END);
        assert_eq!(block.0.EP[2].EPSR.read(), 0b1_0010);

        mmio.write_fifo(1, &[0xAB]);
        assert_eq!(block.0.EP[1].EPFIFO.read(), 0xAB);
    }

    #[test]
    fn function_control() {
        let block = Block::new();
        let mut mmio = Mmio::new(&block, 1);
        mmio.set_function_control(FunctionControl::DEVICE_ENABLE | FunctionControl::FULL_SPEED_ONLY);
        assert_eq!(block.0.FCTRL.read(), 0b11);
        assert_eq!(
            mmio.function_control(),
            FunctionControl::DEVICE_ENABLE | FunctionControl::FULL_SPEED_ONLY
        );
    }
}
