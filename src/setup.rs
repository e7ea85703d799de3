//! SETUP packet decoding

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// The 8-byte request that starts every control transfer.
///
/// Multi-byte fields are little endian on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`, the size of the data stage.
    pub length: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet on the wire.
    pub const LEN: usize = 8;

    pub const fn parse(raw: [u8; Self::LEN]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub const fn to_bytes(&self) -> [u8; Self::LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Endpoint number addressed by an endpoint-recipient request.
    pub fn endpoint_number(&self) -> u8 {
        (self.index & 0x0F) as u8
    }
}
