//! An in-memory function controller, and a host that drives it.

use crate::{
    config::Speed,
    hw::{CommonInterrupt, EndpointControl, EndpointStatus, FunctionControl, Hardware},
    setup::SetupPacket,
};
use std::{
    cell::Cell,
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    vec::Vec,
};

/// A packet committed for the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub data_end: bool,
}

#[derive(Default)]
struct Endpoint {
    control: EndpointControl,
    in_fifo: Vec<u8>,
    in_busy: bool,
    /// Committed IN packets stay unsent.
    hold_in: bool,
    sent: Vec<Packet>,
    /// OUT packets from the host; `true` marks a SETUP packet.
    rx: VecDeque<(Vec<u8>, bool)>,
    rx_pos: usize,
    stall_sent: bool,
    /// The host aborts the data stage after the next committed packet.
    abort_after_commit: bool,
    flushes: usize,
    toggle_clears: usize,
    status_outs: usize,
}

impl Endpoint {
    fn pop(&mut self, setup: bool) -> bool {
        if matches!(self.rx.front(), Some((_, is_setup)) if *is_setup == setup) {
            self.rx.pop_front();
            self.rx_pos = 0;
            true
        } else {
            false
        }
    }
}

pub struct FakeHardware {
    vbus: bool,
    poll_budget: Cell<usize>,
    accesses: Cell<usize>,
    control_writes: Arc<AtomicUsize>,
    host_speed: Speed,
    sof_silent: bool,
    fctrl: FunctionControl,
    address: u8,
    cmif: CommonInterrupt,
    cmie: CommonInterrupt,
    epif: u16,
    epie: u16,
    frame: u16,
    phy: bool,
    wakeup: bool,
    wakeup_us: u32,
    endpoints: Vec<Endpoint>,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self::with_endpoints(16)
    }

    pub fn with_endpoints(count: usize) -> Self {
        FakeHardware {
            vbus: true,
            poll_budget: Cell::new(100_000),
            accesses: Cell::new(0),
            control_writes: Arc::new(AtomicUsize::new(0)),
            host_speed: Speed::High,
            sof_silent: false,
            fctrl: FunctionControl::empty(),
            address: 0,
            cmif: CommonInterrupt::empty(),
            cmie: CommonInterrupt::empty(),
            epif: 0,
            epie: 0,
            frame: 0,
            phy: false,
            wakeup: false,
            wakeup_us: 0,
            endpoints: (0..count).map(|_| Endpoint::default()).collect(),
        }
    }

    fn touch(&self) {
        self.accesses.set(self.accesses.get() + 1);
    }

    fn ep(&self, ep: u8) -> &Endpoint {
        &self.endpoints[ep as usize]
    }

    fn ep_mut(&mut self, ep: u8) -> &mut Endpoint {
        &mut self.endpoints[ep as usize]
    }

    /// Number of trait calls so far.
    pub fn accesses(&self) -> usize {
        self.accesses.get()
    }

    /// Counts endpoint control register writes.
    pub fn control_writes(&self) -> Arc<AtomicUsize> {
        self.control_writes.clone()
    }

    pub fn set_vbus(&mut self, vbus: bool) {
        self.vbus = vbus;
    }

    /// Bus presence drops after `polls` more checks.
    pub fn set_poll_budget(&mut self, polls: usize) {
        self.poll_budget.set(polls);
    }

    pub fn set_host_speed(&mut self, speed: Speed) {
        self.host_speed = speed;
    }

    /// The host never sends start-of-frame.
    pub fn silence_sof(&mut self) {
        self.sof_silent = true;
    }

    pub fn phy_enabled(&self) -> bool {
        self.phy
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn common_interrupt_enable(&self) -> CommonInterrupt {
        self.cmie
    }

    pub fn endpoint_interrupt_enable(&self) -> u16 {
        self.epie
    }

    pub fn wakeup_signaling(&self) -> bool {
        self.wakeup
    }

    /// How long resume signaling was driven.
    pub fn wakeup_signal_us(&self) -> u32 {
        self.wakeup_us
    }

    /// What the controller does to endpoint configurations on bus reset.
    pub fn clear_endpoint_registers(&mut self) {
        for ep in self.endpoints.iter_mut() {
            ep.control = EndpointControl::empty();
        }
    }

    pub fn host_reset(&mut self) {
        self.clear_endpoint_registers();
        self.cmif |= CommonInterrupt::RESET;
    }

    pub fn raise_common(&mut self, irqs: CommonInterrupt) {
        self.cmif |= irqs;
    }

    pub fn host_sof(&mut self, frame: u16) {
        self.frame = frame;
        self.cmif |= CommonInterrupt::SOF;
    }

    pub fn raise_endpoint(&mut self, ep: u8) {
        self.epif |= 1 << ep;
    }

    pub fn host_setup(&mut self, setup: SetupPacket) {
        self.ep_mut(0).rx.push_back((setup.to_bytes().to_vec(), true));
        self.raise_endpoint(0);
    }

    pub fn host_out(&mut self, ep: u8, data: &[u8]) {
        self.ep_mut(ep).rx.push_back((data.to_vec(), false));
    }

    pub fn host_stall_sent(&mut self, ep: u8) {
        self.ep_mut(ep).stall_sent = true;
    }

    /// After the next IN packet, the host answers with an OUT token: the
    /// controller stalls, and never takes another IN packet.
    pub fn abort_after_commit(&mut self, ep: u8) {
        self.ep_mut(ep).abort_after_commit = true;
    }

    pub fn hold_in(&mut self, ep: u8, hold: bool) {
        self.ep_mut(ep).hold_in = hold;
    }

    pub fn sent(&self, ep: u8) -> &[Packet] {
        &self.ep(ep).sent
    }

    pub fn take_sent(&mut self, ep: u8) -> Vec<Packet> {
        std::mem::take(&mut self.ep_mut(ep).sent)
    }

    /// Bytes written, but not committed.
    pub fn in_fifo(&self, ep: u8) -> &[u8] {
        &self.ep(ep).in_fifo
    }

    /// OUT packets the host queued that the device hasn't released.
    pub fn unread(&self, ep: u8) -> usize {
        self.ep(ep).rx.len()
    }

    pub fn flushes(&self, ep: u8) -> usize {
        self.ep(ep).flushes
    }

    pub fn toggle_clears(&self, ep: u8) -> usize {
        self.ep(ep).toggle_clears
    }

    /// Control status stages the device accepted from the host.
    pub fn status_outs(&self) -> usize {
        self.ep(0).status_outs
    }
}

impl Hardware for FakeHardware {
    fn endpoint_count(&self) -> usize {
        self.touch();
        self.endpoints.len()
    }

    fn vbus(&self) -> bool {
        self.touch();
        match self.poll_budget.get() {
            0 => false,
            polls => {
                self.poll_budget.set(polls - 1);
                self.vbus
            }
        }
    }

    fn function_control(&self) -> FunctionControl {
        self.touch();
        self.fctrl
    }

    fn set_function_control(&mut self, fctrl: FunctionControl) {
        self.touch();
        let enabling = fctrl.contains(FunctionControl::DEVICE_ENABLE)
            && !self.fctrl.contains(FunctionControl::DEVICE_ENABLE);
        self.fctrl = fctrl;
        if enabling && self.vbus && !self.sof_silent {
            self.cmif |= CommonInterrupt::SOF;
        }
    }

    fn set_address(&mut self, address: u8) {
        self.touch();
        self.address = address;
    }

    fn common_interrupts(&self) -> CommonInterrupt {
        self.touch();
        self.cmif
    }

    fn clear_common_interrupts(&mut self, irqs: CommonInterrupt) {
        self.touch();
        self.cmif -= irqs;
    }

    fn set_common_interrupt_enable(&mut self, irqs: CommonInterrupt) {
        self.touch();
        self.cmie = irqs;
    }

    fn endpoint_interrupts(&self) -> u16 {
        self.touch();
        self.epif
    }

    fn clear_endpoint_interrupts(&mut self, mask: u16) {
        self.touch();
        self.epif &= !mask;
    }

    fn set_endpoint_interrupt_enable(&mut self, mask: u16) {
        self.touch();
        self.epie = mask;
    }

    fn frame_number(&self) -> u16 {
        self.touch();
        self.frame
    }

    fn endpoint_control(&self, ep: u8) -> EndpointControl {
        self.touch();
        self.ep(ep).control
    }

    fn set_endpoint_control(&mut self, ep: u8, ctrl: EndpointControl) {
        self.touch();
        self.control_writes.fetch_add(1, Ordering::SeqCst);
        self.ep_mut(ep).control = ctrl;
    }

    fn endpoint_status(&self, ep: u8) -> EndpointStatus {
        self.touch();
        let endpoint = self.ep(ep);
        let mut status = match endpoint.rx.front() {
            Some((_, true)) => EndpointStatus::SETUP,
            Some((_, false)) => EndpointStatus::OUT_READY,
            None => EndpointStatus::empty(),
        };
        status.set(EndpointStatus::IN_READY, endpoint.in_busy);
        status.set(EndpointStatus::STALL_SENT, endpoint.stall_sent);
        status
    }

    fn write_endpoint_status(&mut self, ep: u8, status: EndpointStatus) {
        self.touch();
        let endpoint = self.ep_mut(ep);
        if status.contains(EndpointStatus::SETUP) {
            endpoint.pop(true);
        }
        if status.contains(EndpointStatus::FIFO_FLUSH) {
            endpoint.in_fifo.clear();
            endpoint.in_busy = false;
            endpoint.pop(false);
            endpoint.flushes += 1;
        }
        if status.contains(EndpointStatus::OUT_READY)
            && !endpoint.pop(false)
            && status.contains(EndpointStatus::DATA_END)
        {
            endpoint.status_outs += 1;
        }
        if status.contains(EndpointStatus::IN_READY) {
            if endpoint.hold_in {
                endpoint.in_busy = true;
            } else {
                let data = std::mem::take(&mut endpoint.in_fifo);
                endpoint.sent.push(Packet {
                    data,
                    data_end: status.contains(EndpointStatus::DATA_END),
                });
                if std::mem::take(&mut endpoint.abort_after_commit) {
                    endpoint.stall_sent = true;
                    endpoint.in_busy = true;
                    endpoint.hold_in = true;
                }
            }
        }
        if status.contains(EndpointStatus::STALL_SENT) {
            endpoint.stall_sent = false;
        }
        if status.contains(EndpointStatus::CLEAR_TOGGLE) {
            endpoint.toggle_clears += 1;
        }
    }

    fn rx_count(&self, ep: u8) -> u16 {
        self.touch();
        let endpoint = self.ep(ep);
        match endpoint.rx.front() {
            Some((data, _)) => data.len().saturating_sub(endpoint.rx_pos) as u16,
            None => 0,
        }
    }

    fn read_fifo(&mut self, ep: u8, buffer: &mut [u8]) {
        self.touch();
        let endpoint = self.ep_mut(ep);
        let Some((data, _)) = endpoint.rx.front() else {
            buffer.fill(0);
            return;
        };
        let available = &data[endpoint.rx_pos.min(data.len())..];
        let len = available.len().min(buffer.len());
        buffer[..len].copy_from_slice(&available[..len]);
        buffer[len..].fill(0);
        endpoint.rx_pos += len;
    }

    fn write_fifo(&mut self, ep: u8, data: &[u8]) {
        self.touch();
        self.ep_mut(ep).in_fifo.extend_from_slice(data);
    }

    fn set_phy_enabled(&mut self, enable: bool) {
        self.touch();
        self.phy = enable;
    }

    fn set_remote_wakeup(&mut self, signal: bool) {
        self.touch();
        self.wakeup = signal;
    }

    fn delay_us(&mut self, us: u32) {
        self.touch();
        if self.wakeup {
            self.wakeup_us += us;
        }
        let enabled = self.fctrl.contains(FunctionControl::DEVICE_ENABLE);
        if enabled && self.vbus && !self.sof_silent && self.host_speed == Speed::High && us >= 125 {
            self.cmif |= CommonInterrupt::SOF;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FakeHardware, Packet};
    use crate::hw::{EndpointStatus, Hardware};

    #[test]
    fn out_packets_are_consumed_in_order() {
        let mut fake = FakeHardware::new();
        fake.host_out(1, &[1, 2, 3]);
        fake.host_out(1, &[4]);
        assert!(fake.endpoint_status(1).contains(EndpointStatus::OUT_READY));
        assert_eq!(fake.rx_count(1), 3);

        let mut buf = [0; 2];
        fake.read_fifo(1, &mut buf);
        assert_eq!(buf, [1, 2]);
        assert_eq!(fake.rx_count(1), 1);

        fake.write_endpoint_status(1, EndpointStatus::OUT_READY);
        assert_eq!(fake.rx_count(1), 1);
        fake.write_endpoint_status(1, EndpointStatus::OUT_READY);
        assert!(!fake.endpoint_status(1).contains(EndpointStatus::OUT_READY));
    }

    #[test]
    fn committed_packets_are_recorded() {
        let mut fake = FakeHardware::new();
        fake.write_fifo(2, &[9, 9]);
        fake.write_endpoint_status(2, EndpointStatus::IN_READY | EndpointStatus::DATA_END);
        assert_eq!(
            fake.sent(2),
            &[Packet {
                data: vec![9, 9],
                data_end: true
            }]
        );
        assert!(fake.in_fifo(2).is_empty());
    }

    #[test]
    fn held_packets_are_flushed() {
        let mut fake = FakeHardware::new();
        fake.hold_in(3, true);
        fake.write_fifo(3, &[1]);
        fake.write_endpoint_status(3, EndpointStatus::IN_READY);
        assert!(fake.endpoint_status(3).contains(EndpointStatus::IN_READY));
        fake.write_endpoint_status(3, EndpointStatus::FIFO_FLUSH);
        assert!(!fake.endpoint_status(3).contains(EndpointStatus::IN_READY));
        assert!(fake.sent(3).is_empty());
        assert_eq!(fake.flushes(3), 1);
    }

    #[test]
    fn vbus_budget() {
        let mut fake = FakeHardware::new();
        fake.set_poll_budget(2);
        assert!(fake.vbus());
        assert!(fake.vbus());
        assert!(!fake.vbus());
    }
}
