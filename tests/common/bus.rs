use std::collections::VecDeque;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};
use usbd_msc::usbd::{Deferred, UsbdBus};

const CSW_LEN: usize = 13;
const CSW_SIGNATURE: u32 = 0x53425355;

/// Command Block Wrapper as built by a USB host
pub struct HostCbw {
    pub tag: u32,
    pub total: u32,
    pub dir_in: bool,
    pub lun: u8,
    pub cdb: Vec<u8>,
}

impl HostCbw {
    pub fn to_bytes(&self) -> Vec<u8> {
        const CBW_SIGNATURE: u32 = 0x43425355;
        assert!((1..=16).contains(&self.cdb.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(&CBW_SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&self.tag.to_le_bytes());
        bytes.extend_from_slice(&self.total.to_le_bytes());
        bytes.push(if self.dir_in { 1 << 7 } else { 0 });
        bytes.push(self.lun);
        bytes.push(self.cdb.len() as u8);

        let mut cdb = [0u8; 16];
        cdb[..self.cdb.len()].copy_from_slice(&self.cdb);
        bytes.extend_from_slice(&cdb);

        bytes
    }
}

/// Command Status Wrapper as parsed by a USB host
#[derive(Debug, Eq, PartialEq)]
pub struct HostCsw {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl HostCsw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(
            CSW_SIGNATURE,
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            "bad CSW signature"
        );
        HostCsw {
            tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status: bytes[12],
        }
    }
}

/// A stand-in for the USB device core: transfer-level endpoint services
/// over in-memory queues, with host-side accessors for the test body.
pub struct MockBus {
    ep_out: EndpointAddress,
    ep_in: EndpointAddress,
    /// transfers the host has queued towards the device
    host_out: VecDeque<Vec<u8>>,
    /// completed device-to-host transfers
    host_in: VecDeque<Vec<u8>>,
    /// outstanding OUT arm, if any
    armed_out: Option<usize>,
    /// payload of the last completed OUT transfer, until the class reads it
    rx: Option<Vec<u8>>,
    out_stalled: bool,
    in_stalled: bool,
    events: VecDeque<(EndpointAddress, usize)>,
    deferred: VecDeque<Deferred>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus {
            ep_out: EndpointAddress::from_parts(1, UsbDirection::Out),
            ep_in: EndpointAddress::from_parts(1, UsbDirection::In),
            host_out: VecDeque::new(),
            host_in: VecDeque::new(),
            armed_out: None,
            rx: None,
            out_stalled: false,
            in_stalled: false,
            events: VecDeque::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn ep_out(&self) -> EndpointAddress {
        self.ep_out
    }

    pub fn ep_in(&self) -> EndpointAddress {
        self.ep_in
    }

    /// Queues a transfer as written by the host
    pub fn host_write(&mut self, data: &[u8]) {
        self.host_out.push_back(data.to_vec());
        self.try_deliver_out();
    }

    pub fn host_write_cbw(&mut self, cbw: &HostCbw) {
        self.host_write(&cbw.to_bytes());
    }

    /// Reads the next completed device-to-host transfer
    pub fn host_read(&mut self) -> Option<Vec<u8>> {
        self.host_in.pop_front()
    }

    /// Reads the next device-to-host transfer and parses it as a CSW
    pub fn host_read_csw(&mut self) -> Option<HostCsw> {
        self.host_read().map(|bytes| HostCsw::from_bytes(&bytes))
    }

    pub fn host_pending_in(&self) -> usize {
        self.host_in.len()
    }

    pub fn out_armed(&self) -> bool {
        self.armed_out.is_some()
    }

    pub fn pop_event(&mut self) -> Option<(EndpointAddress, usize)> {
        self.events.pop_front()
    }

    pub fn pop_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    fn try_deliver_out(&mut self) {
        let Some(armed) = self.armed_out else {
            return;
        };
        let Some(mut transfer) = self.host_out.pop_front() else {
            return;
        };

        // the device armed less than the host wrote: deliver what fits,
        // the rest stays queued
        let delivered = if transfer.len() > armed {
            let rest = transfer.split_off(armed);
            self.host_out.push_front(rest);
            transfer
        } else {
            transfer
        };

        self.armed_out = None;
        self.events.push_back((self.ep_out, delivered.len()));
        self.rx = Some(delivered);
    }
}

impl UsbdBus for MockBus {
    fn open_bulk_pair(
        &mut self,
        _max_packet_size: u16,
    ) -> Result<(EndpointAddress, EndpointAddress), UsbError> {
        Ok((self.ep_out, self.ep_in))
    }

    fn xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), UsbError> {
        assert_eq!(self.ep_in, ep_addr);
        self.host_in.push_back(data.to_vec());
        self.events.push_back((self.ep_in, data.len()));
        Ok(())
    }

    fn xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), UsbError> {
        assert_eq!(self.ep_out, ep_addr);
        assert!(self.armed_out.is_none(), "OUT armed twice");
        self.armed_out = Some(len);
        self.try_deliver_out();
        Ok(())
    }

    fn read(&mut self, ep_addr: EndpointAddress, dst: &mut [u8]) -> Result<usize, UsbError> {
        assert_eq!(self.ep_out, ep_addr);
        let rx = self.rx.take().ok_or(UsbError::WouldBlock)?;
        let count = rx.len().min(dst.len());
        dst[..count].copy_from_slice(&rx[..count]);
        Ok(count)
    }

    fn stall(&mut self, ep_addr: EndpointAddress) {
        if ep_addr == self.ep_in {
            self.in_stalled = true;
        } else if ep_addr == self.ep_out {
            self.out_stalled = true;
        }
    }

    fn clear_stall(&mut self, ep_addr: EndpointAddress) {
        if ep_addr == self.ep_in {
            self.in_stalled = false;
        } else if ep_addr == self.ep_out {
            self.out_stalled = false;
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        if ep_addr == self.ep_in {
            self.in_stalled
        } else {
            self.out_stalled
        }
    }

    fn is_ready(&self, ep_addr: EndpointAddress) -> bool {
        if ep_addr == self.ep_out {
            self.armed_out.is_none()
        } else {
            true
        }
    }

    fn defer(&mut self, event: Deferred, _in_isr: bool) {
        self.deferred.push_back(event);
    }

    fn notify_xfer_complete(&mut self, ep_addr: EndpointAddress, len: usize) {
        self.events.push_back((ep_addr, len));
    }
}
