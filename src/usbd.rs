//! Services of the USB device core
//!
//! The class driver does not talk to a controller directly. Enumeration,
//! control transfer dispatch and the event queue live in the device core,
//! which exposes the endpoint services below. Transfer completions flow
//! back through [MscClass::transfer_complete] and deferred work through
//! [MscClass::process_deferred].
//!
//! [MscClass::transfer_complete]: crate::bot::MscClass::transfer_complete
//! [MscClass::process_deferred]: crate::bot::MscClass::process_deferred

use crate::scsi::IoStatus;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;

/// Work item queued with [UsbdBus::defer] and handed back to the class
/// from task context.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Deferred {
    /// An asynchronous block device operation finished
    AsyncIo(IoStatus),
}

/// Reply of the class to a control request routed to its interface
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlResult {
    /// The request is not addressed to this class
    Ignored,
    /// Handled; respond with a zero length status
    Accepted,
    /// Handled; respond with the given Max LUN value
    MaxLun(u8),
    /// Unsupported; stall the control pipe
    Rejected,
}

/// Endpoint services the device core provides to class drivers.
///
/// Transfers are asynchronous: `xfer_in`/`xfer_out` only queue work, the
/// completion arrives later as a transfer-complete event carrying the
/// transferred byte count. IN data is copied out of the caller's buffer
/// before `xfer_in` returns; OUT data is fetched with [read] after the
/// completion event.
///
/// [read]: UsbdBus::read
pub trait UsbdBus {
    /// Allocates the bulk endpoint pair of an interface.
    ///
    /// Returns `(out, in)` endpoint addresses.
    fn open_bulk_pair(
        &mut self,
        max_packet_size: u16,
    ) -> Result<(EndpointAddress, EndpointAddress), UsbError>;

    /// Queues an IN transfer of `data`
    fn xfer_in(&mut self, ep_addr: EndpointAddress, data: &[u8]) -> Result<(), UsbError>;

    /// Arms an OUT transfer of up to `len` bytes
    fn xfer_out(&mut self, ep_addr: EndpointAddress, len: usize) -> Result<(), UsbError>;

    /// Copies the payload of a completed OUT transfer into `dst`,
    /// returning the number of bytes copied
    fn read(&mut self, ep_addr: EndpointAddress, dst: &mut [u8]) -> Result<usize, UsbError>;

    fn stall(&mut self, ep_addr: EndpointAddress);

    fn clear_stall(&mut self, ep_addr: EndpointAddress);

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool;

    /// Whether no transfer is currently queued on the endpoint
    fn is_ready(&self, ep_addr: EndpointAddress) -> bool;

    /// Queues `event` for redelivery from task context.
    ///
    /// The core must hand the event back via
    /// [MscClass::process_deferred] once the event queue drains to it.
    /// `in_isr` tells the core which enqueue path is safe to use.
    ///
    /// [MscClass::process_deferred]: crate::bot::MscClass::process_deferred
    fn defer(&mut self, event: Deferred, in_isr: bool);

    /// Queues a synthesized transfer-complete event for `ep_addr`.
    ///
    /// No data moves; the event is redelivered through the regular
    /// completion path. The class uses this to re-enter itself when the
    /// application reports a busy block device.
    fn notify_xfer_complete(&mut self, ep_addr: EndpointAddress, len: usize);
}
