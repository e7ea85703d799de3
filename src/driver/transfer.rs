//! Packet-level data movement
//!
//! Control transfers move through [`Driver::transfer_ep0`]. Every other
//! endpoint moves data through a [`Transfer`], which [`Driver::transfer`]
//! polls to completion. Both split the caller's buffer into
//! max-packet-size chunks.
//!
//! Every wait re-checks bus presence and the device state. If the bus goes
//! away, or the device detaches, the transfer ends early and reports what
//! it moved so far.

use super::Driver;
use crate::{
    context::DeviceState,
    error::{Error, Result},
    hw::{EndpointStatus, Hardware},
};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Transfer data, and its direction.
#[derive(Debug)]
pub enum Buffer<'b> {
    /// Send to the host.
    In(&'b [u8]),
    /// Receive from the host.
    Out(&'b mut [u8]),
}

impl Buffer<'_> {
    pub fn direction(&self) -> UsbDirection {
        match self {
            Buffer::In(_) => UsbDirection::In,
            Buffer::Out(_) => UsbDirection::Out,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::In(data) => data.len(),
            Buffer::Out(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a transfer ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferMode {
    /// The buffer holds the whole transfer.
    ///
    /// The last IN packet is committed, with a zero length packet if the
    /// transfer fills its last packet. The last OUT packet is released.
    #[default]
    Normal,
    /// The buffer holds part of a transfer; more calls follow.
    ///
    /// The last packet stays in the FIFO, so that the next call (with the
    /// matching offset) can continue it.
    Partial,
}

impl<H: Hardware> Driver<'_, H> {
    /// Move one control data stage.
    ///
    /// `requested_length` is the SETUP packet's `wLength`. When an IN data
    /// stage is shorter than requested, and it fills its last packet, a
    /// zero length packet ends the stage.
    ///
    /// Returns the number of bytes moved. The count is short if the host
    /// sends a short OUT packet, if the endpoint stalls, or if the bus goes
    /// away.
    pub fn transfer_ep0(&mut self, buffer: Buffer<'_>, requested_length: usize) -> usize {
        let max = self.config.ep0_size as usize;
        match buffer {
            Buffer::In(data) => self.control_in(data, requested_length, max),
            Buffer::Out(data) => self.control_out(data, max),
        }
    }

    /// Complete a control transfer with a zero length IN status stage.
    pub fn ack_in(&mut self) {
        self.transfer_ep0(Buffer::In(&[]), 0);
    }

    /// Accept the host's zero length OUT status stage.
    pub fn ack_out(&mut self) {
        self.transfer_ep0(Buffer::Out(&mut []), 0);
    }

    fn control_in(&mut self, data: &[u8], requested_length: usize, max: usize) -> usize {
        let mut remaining = data;
        let mut sent = 0;
        loop {
            let len = remaining.len().min(max);
            let (packet, rest) = remaining.split_at(len);
            remaining = rest;

            if !self.wait_control_in(sent) {
                break;
            }
            self.hw.write_fifo(0, packet);
            sent += len;

            if !remaining.is_empty() {
                self.hw.write_endpoint_status(0, EndpointStatus::IN_READY);
                continue;
            }

            // A short stage that fills its last packet needs a zero length
            // packet to end it. The empty FIFO committed below is that packet.
            if len == max && data.len() < requested_length {
                self.hw.write_endpoint_status(0, EndpointStatus::IN_READY);
                if !self.wait_control_in(sent) {
                    break;
                }
            }
            self.hw
                .write_endpoint_status(0, EndpointStatus::IN_READY | EndpointStatus::DATA_END);
            break;
        }
        sent
    }

    /// Wait until the control endpoint can take another IN packet.
    ///
    /// Returns `false` if the bus goes away, or if the host ended the data
    /// stage early. The latter shows up as a STALL handshake, which is
    /// acknowledged here.
    fn wait_control_in(&mut self, sent: usize) -> bool {
        let Some(status) = self.wait_status(0, |status| {
            !status.contains(EndpointStatus::IN_READY)
                || status.contains(EndpointStatus::STALL_SENT)
        }) else {
            return false;
        };
        if status.contains(EndpointStatus::STALL_SENT) {
            self.hw
                .write_endpoint_status(0, EndpointStatus::STALL_SENT | EndpointStatus::DATA_END);
            warn!("EP0 IN stalled after {} bytes", sent);
            return false;
        }
        true
    }

    fn control_out(&mut self, buffer: &mut [u8], max: usize) -> usize {
        let total = buffer.len();
        let mut position = 0;
        let mut received = 0;
        loop {
            let len = (total - position).min(max);
            let mut read = 0;
            if len > 0 {
                if self
                    .wait_status(0, |status| status.contains(EndpointStatus::OUT_READY))
                    .is_none()
                {
                    break;
                }
                read = (self.hw.rx_count(0) as usize).min(len);
                self.hw
                    .read_fifo(0, &mut buffer[position..position + read]);
                received += read;
            }
            position += len;

            if position == total {
                self.hw
                    .write_endpoint_status(0, EndpointStatus::OUT_READY | EndpointStatus::DATA_END);
                // Nothing left to do if the bus goes away here.
                let _ = self.wait_status(0, |status| !status.contains(EndpointStatus::OUT_READY));
                break;
            }

            self.hw.write_endpoint_status(0, EndpointStatus::OUT_READY);
            if read < max {
                break;
            }
        }
        received
    }

    /// Move data on a non-zero endpoint.
    ///
    /// `offset` is the number of bytes already in the endpoint's current
    /// packet, from an earlier [`TransferMode::Partial`] call. Only its
    /// remainder modulo the max packet size matters.
    ///
    /// Returns the number of bytes moved. An OUT transfer ends early on a
    /// short packet. An IN transfer ends early if the host doesn't take a
    /// packet before the IN timeout; the stuck packet is flushed. Interrupt
    /// endpoints never block, and never send a zero length packet.
    ///
    /// Blocks until the transfer ends. When the driver is shared with the
    /// USB interrupt, use [`BusAdapter::transfer`](crate::BusAdapter::transfer)
    /// instead, or poll a [`Transfer`] from
    /// [`start_transfer()`](Driver::start_transfer).
    ///
    /// Fails without touching the hardware if the endpoint number is zero
    /// or out of range ([`Error::InvalidParameter`]), if the endpoint isn't
    /// enabled ([`Error::NotConfigured`]), or if the buffer direction
    /// doesn't match the endpoint ([`Error::InvalidParameter`]).
    pub fn transfer(
        &mut self,
        ep: u8,
        buffer: Buffer<'_>,
        mode: TransferMode,
        offset: usize,
    ) -> Result<usize> {
        let mut transfer = self.start_transfer(ep, buffer, mode, offset)?;
        loop {
            if let Some(moved) = transfer.poll(self) {
                return Ok(moved);
            }
        }
    }

    /// Prepare a transfer on a non-zero endpoint, without moving any data.
    ///
    /// [`Transfer::poll`] moves the data. The arguments and errors are the
    /// same as [`transfer()`](Driver::transfer).
    pub fn start_transfer<'b>(
        &self,
        ep: u8,
        buffer: Buffer<'b>,
        mode: TransferMode,
        offset: usize,
    ) -> Result<Transfer<'b>> {
        if ep == 0 {
            return Err(Error::InvalidParameter);
        }
        let config = *self.endpoints.enabled(ep)?;
        if buffer.direction() != config.direction {
            return Err(Error::InvalidParameter);
        }

        let max = config.max_packet_size as usize;
        let (stage, polls) = match buffer {
            Buffer::In(data) => (Stage::In(data), Some(self.config.in_timeout)),
            Buffer::Out(data) => (Stage::Out(data), self.config.out_timeout),
        };
        Ok(Transfer {
            ep,
            max,
            offset: offset % max,
            mode,
            blocking: config.ep_type != EndpointType::Interrupt,
            polls,
            moved: 0,
            stage,
        })
    }

    /// `false` once the device can no longer move data: the bus is gone,
    /// or the device dropped below the `Default` state.
    fn present(&self) -> bool {
        self.context.state() >= DeviceState::Default && self.hw.vbus()
    }

    /// Poll an endpoint's status until `ready` accepts it.
    ///
    /// Returns `None` if the bus goes away first.
    fn wait_status(
        &mut self,
        ep: u8,
        ready: impl Fn(EndpointStatus) -> bool,
    ) -> Option<EndpointStatus> {
        loop {
            let status = self.hw.endpoint_status(ep);
            if ready(status) {
                return Some(status);
            }
            if !self.present() {
                warn!("EP{} wait aborted; device gone", ep);
                return None;
            }
        }
    }
}

/// A transfer on a non-zero endpoint, in progress.
///
/// Each [`poll()`](Transfer::poll) moves at most one packet, or waits at
/// most one poll interval, and then returns. Between polls, the driver is
/// free for other work, like the USB interrupt.
#[derive(Debug)]
pub struct Transfer<'b> {
    ep: u8,
    max: usize,
    /// Bytes already in the current packet.
    offset: usize,
    mode: TransferMode,
    /// `false` for interrupt endpoints.
    blocking: bool,
    /// Polls left in the current wait; `None` waits without a limit.
    polls: Option<u32>,
    moved: usize,
    stage: Stage<'b>,
}

#[derive(Debug)]
enum Stage<'b> {
    /// IN data still to write.
    In(&'b [u8]),
    /// The last IN packet was full; a zero length packet follows.
    Zlp,
    /// The whole OUT buffer; `moved` bytes are filled.
    Out(&'b mut [u8]),
    Done,
}

/// The outcome of one wait poll.
enum Wait {
    Ready,
    Pending,
    Failed,
}

impl<'b> Transfer<'b> {
    /// The endpoint this transfer moves data on.
    pub fn endpoint(&self) -> u8 {
        self.ep
    }

    /// Make progress.
    ///
    /// Returns the number of bytes moved once the transfer is over, and
    /// `None` while it's still going. The transfer ends early if its
    /// endpoint is freed, or if the device detaches.
    pub fn poll<H: Hardware>(&mut self, driver: &mut Driver<'_, H>) -> Option<usize> {
        if matches!(self.stage, Stage::Done) {
            return Some(self.moved);
        }
        if driver.endpoints.enabled(self.ep).is_err() {
            self.stage = Stage::Done;
            return Some(self.moved);
        }
        let done = match core::mem::replace(&mut self.stage, Stage::Done) {
            Stage::In(data) => self.poll_in(driver, data),
            Stage::Zlp => self.poll_zlp(driver),
            Stage::Out(buffer) => self.poll_out(driver, buffer),
            Stage::Done => true,
        };
        if done {
            trace!("EP{} transfer done; {} bytes", self.ep, self.moved);
            Some(self.moved)
        } else {
            None
        }
    }

    /// Park the transfer in `stage` until the next poll.
    fn resume(&mut self, stage: Stage<'b>) -> bool {
        self.stage = stage;
        false
    }

    fn poll_in<H: Hardware>(&mut self, driver: &mut Driver<'_, H>, data: &'b [u8]) -> bool {
        let ep = self.ep;
        if self.blocking {
            match self.wait_in_ready(driver) {
                Wait::Ready => {}
                Wait::Pending => return self.resume(Stage::In(data)),
                Wait::Failed => return true,
            }
        }

        let len = data.len().min(self.max - self.offset);
        let (chunk, rest) = data.split_at(len);
        driver.hw.write_fifo(ep, chunk);
        self.moved += len;

        if !rest.is_empty() {
            driver.hw.write_endpoint_status(ep, EndpointStatus::IN_READY);
            self.offset = 0;
            return self.resume(Stage::In(rest));
        }

        if len != 0 && (len + self.offset) % self.max == 0 && self.blocking {
            driver.hw.write_endpoint_status(ep, EndpointStatus::IN_READY);
            if self.mode == TransferMode::Normal {
                return self.resume(Stage::Zlp);
            }
        }
        if self.mode == TransferMode::Normal {
            driver.hw.write_endpoint_status(ep, EndpointStatus::IN_READY);
        }
        true
    }

    fn poll_zlp<H: Hardware>(&mut self, driver: &mut Driver<'_, H>) -> bool {
        // The zero length packet goes out whether or not the full one
        // drained.
        if let Wait::Pending = self.wait_in_ready(driver) {
            return self.resume(Stage::Zlp);
        }
        driver
            .hw
            .write_endpoint_status(self.ep, EndpointStatus::IN_READY);
        true
    }

    fn poll_out<H: Hardware>(&mut self, driver: &mut Driver<'_, H>, buffer: &'b mut [u8]) -> bool {
        let ep = self.ep;
        if self.blocking {
            match self.wait_out_ready(driver) {
                Wait::Ready => {}
                Wait::Pending => return self.resume(Stage::Out(buffer)),
                Wait::Failed => return true,
            }
        }

        let position = self.moved;
        let len = (buffer.len() - position).min(self.max - self.offset);
        let available = if driver.hw.endpoint_status(ep).contains(EndpointStatus::OUT_READY) {
            driver.hw.rx_count(ep) as usize
        } else {
            0
        };
        let read = available.min(len);
        driver
            .hw
            .read_fifo(ep, &mut buffer[position..position + read]);
        self.moved += read;

        if read < len {
            driver.hw.write_endpoint_status(ep, EndpointStatus::OUT_READY);
            return true;
        }
        if self.moved == buffer.len() {
            if self.mode == TransferMode::Normal {
                driver.hw.write_endpoint_status(ep, EndpointStatus::OUT_READY);
            }
            return true;
        }
        driver.hw.write_endpoint_status(ep, EndpointStatus::OUT_READY);
        self.offset = 0;
        self.resume(Stage::Out(buffer))
    }

    /// One poll of the wait for the previous IN packet to go out.
    ///
    /// On timeout, the stuck packet is flushed.
    fn wait_in_ready<H: Hardware>(&mut self, driver: &mut Driver<'_, H>) -> Wait {
        let ep = self.ep;
        if !driver.hw.endpoint_status(ep).contains(EndpointStatus::IN_READY) {
            self.polls = Some(driver.config.in_timeout);
            return Wait::Ready;
        }
        if !driver.present() {
            return Wait::Failed;
        }
        match self.polls {
            Some(0) | None => {
                driver.hw.write_endpoint_status(ep, EndpointStatus::FIFO_FLUSH);
                warn!("EP{} IN timeout; packet flushed", ep);
                self.polls = Some(driver.config.in_timeout);
                Wait::Failed
            }
            Some(polls) => {
                self.polls = Some(polls - 1);
                driver.hw.delay_us(driver.config.poll_interval_us);
                Wait::Pending
            }
        }
    }

    /// One poll of the wait for an OUT packet.
    fn wait_out_ready<H: Hardware>(&mut self, driver: &mut Driver<'_, H>) -> Wait {
        let ep = self.ep;
        if driver.hw.endpoint_status(ep).contains(EndpointStatus::OUT_READY) {
            self.polls = driver.config.out_timeout;
            return Wait::Ready;
        }
        if !driver.present() {
            warn!("EP{} wait aborted; device gone", ep);
            return Wait::Failed;
        }
        match self.polls {
            Some(0) => {
                warn!("EP{} OUT timeout", ep);
                self.polls = driver.config.out_timeout;
                Wait::Failed
            }
            Some(polls) => {
                self.polls = Some(polls - 1);
                driver.hw.delay_us(driver.config.poll_interval_us);
                Wait::Pending
            }
            None => Wait::Pending,
        }
    }
}
