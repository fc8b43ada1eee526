use core::borrow::BorrowMut;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;
use usbd_msc::bot::MscClass;
use usbd_msc::scsi::BlockDevice;
use usbd_msc::usbd::ControlResult;

pub mod bus;
pub mod device;
pub mod scsi;

use bus::MockBus;

/// Runs the device until no completion or deferred event is pending
pub fn pump<D: BlockDevice, Buf: BorrowMut<[u8]>>(msc: &mut MscClass<D, Buf>, bus: &mut MockBus) {
    for _ in 0..10_000 {
        if let Some((ep_addr, len)) = bus.pop_event() {
            msc.transfer_complete(bus, ep_addr, len).unwrap();
        } else if let Some(event) = bus.pop_deferred() {
            msc.process_deferred(bus, event).unwrap();
        } else {
            return;
        }
    }
    panic!("device did not become idle");
}

/// A class request addressed to the MSC interface
pub fn class_request(dir_in: bool, request: u8, value: u16, length: u16) -> Request {
    Request {
        direction: if dir_in {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value,
        index: 0,
        length,
    }
}

pub fn bulk_only_reset() -> Request {
    class_request(false, 0xFF, 0, 0)
}

pub fn get_max_lun() -> Request {
    class_request(true, 0xFE, 0, 1)
}

fn clear_feature_request(ep_addr: EndpointAddress) -> Request {
    Request {
        direction: UsbDirection::Out,
        request_type: RequestType::Standard,
        recipient: Recipient::Endpoint,
        request: Request::CLEAR_FEATURE,
        value: Request::FEATURE_ENDPOINT_HALT,
        index: u16::from(u8::from(ep_addr)),
        length: 0,
    }
}

/// What the device core does for a host Clear Feature(ENDPOINT_HALT):
/// un-stall the endpoint, then notify the class
pub fn host_clear_feature<D: BlockDevice, Buf: BorrowMut<[u8]>>(
    msc: &mut MscClass<D, Buf>,
    bus: &mut MockBus,
    ep_addr: EndpointAddress,
) -> ControlResult {
    usbd_msc::usbd::UsbdBus::clear_stall(bus, ep_addr);
    msc.control_request(bus, &clear_feature_request(ep_addr))
}
