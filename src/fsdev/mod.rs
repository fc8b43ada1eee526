//! STM32 FSDev device controller driver
//!
//! Driver for the "USB A"/PCD full-speed device peripheral of the STM32
//! F0/F1/F3/G0/G4/L0/L1/L4/L5/U0/U5/WB families and compatibles. The
//! peripheral talks to the CPU through a dedicated packet memory area
//! holding the buffer description table and all endpoint buffers, and a
//! set of endpoint registers with write-to-toggle semantics that [epr]
//! wraps.
//!
//! The chip flavor (register addresses, packet memory size and mapping,
//! bus width, pull-up control) comes in through the [UsbPeripheral]
//! trait. Call [FsDev::poll] from the USB interrupt; completed transfers,
//! setup packets and bus signals are reported through [EventHandler].
//!
//! Assumptions carried over from the hardware:
//! - a single USB peripheral per device
//! - the packet buffer is not shared with CAN
//! - endpoint buffers are sized once per configuration; allocations are
//!   only reclaimed by a bus reset or [FsDev::close_all]

mod epr;
mod pma;

use crate::fmt::trace;
use core::marker::PhantomData;
use core::ptr::{read_volatile, write_volatile};
use epr::{Epr, EpStatus};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

/// Register block offsets, from the endpoint register base
mod regs {
    pub const CNTR: usize = 0x40;
    pub const ISTR: usize = 0x44;
    pub const FNR: usize = 0x48;
    pub const DADDR: usize = 0x4C;
    pub const BTABLE: usize = 0x50;
    pub const BCDR: usize = 0x58;
}

mod cntr {
    pub const FRES: u32 = 1 << 0;
    pub const PDWN: u32 = 1 << 1;
    pub const LPMODE: u32 = 1 << 2;
    pub const FSUSP: u32 = 1 << 3;
    pub const RESUME: u32 = 1 << 4;
    pub const ESOFM: u32 = 1 << 8;
    pub const SOFM: u32 = 1 << 9;
    pub const RESETM: u32 = 1 << 10;
    pub const SUSPM: u32 = 1 << 11;
    pub const WKUPM: u32 = 1 << 12;
    pub const CTRM: u32 = 1 << 15;
}

mod istr {
    pub const EP_ID: u32 = 0x000F;
    pub const DIR: u32 = 1 << 4;
    pub const ESOF: u32 = 1 << 8;
    pub const SOF: u32 = 1 << 9;
    pub const RESET: u32 = 1 << 10;
    pub const SUSP: u32 = 1 << 11;
    pub const WKUP: u32 = 1 << 12;
    pub const CTR: u32 = 1 << 15;
}

const DADDR_EF: u32 = 1 << 7;
const BCDR_DPPU: u32 = 1 << 15;
const FNR_FN: u32 = 0x7FF;

const MAX_EP_COUNT: usize = 8;

const DIR_OUT: usize = 0;
const DIR_IN: usize = 1;

fn dir_idx(dir: UsbDirection) -> usize {
    match dir {
        UsbDirection::Out => DIR_OUT,
        UsbDirection::In => DIR_IN,
    }
}

/// One flavor of the FSDev peripheral.
///
/// # Safety
/// `register_base` and `pma_base` must point at the device's USB register
/// block and packet memory, sized and mapped as the other items describe.
pub unsafe trait UsbPeripheral {
    /// Pointer to the register block; USB_EP0R at offset 0
    fn register_base() -> *mut ();

    /// Pointer to the packet memory area as the CPU sees it
    fn pma_base() -> *mut ();

    /// Usable packet memory in bytes (512, 1024 or 2048)
    const PMA_SIZE: u16;

    /// CPU halfwords per packet memory halfword. 2 on parts that map the
    /// PMA as `u16[N * 2]`
    const PMA_STRIDE: u16 = 1;

    /// 32-bit register and packet memory bus (G0, H5, U5)
    const BUS_32BIT: bool = false;

    /// Offset of the buffer description table inside the PMA
    const BTABLE_BASE: u16 = 0;

    /// Endpoint register pairs of this part
    const EP_COUNT: u8 = 8;

    /// Whether the internal D+ pull-up is controlled through BCDR
    const DP_PULL_UP: bool;

    /// Busy wait of a few microseconds, used while sequencing the
    /// transceiver power-up
    fn startup_delay();

    /// Wait before reading the PMA after an OUT completion. The 32-bit
    /// bus parts have an errata where the buffer descriptor update may
    /// complete up to 800 ns after the interrupt triggers.
    fn errata_delay() {
        for _ in 0..60 {
            core::hint::spin_loop();
        }
    }
}

/// Receiver of the events the interrupt service decodes
pub trait EventHandler {
    fn bus_reset(&mut self);
    fn sof(&mut self, frame_number: u16);
    fn suspend(&mut self);
    fn resume(&mut self);
    fn setup_received(&mut self, setup: [u8; 8]);
    fn xfer_complete(&mut self, ep_addr: EndpointAddress, len: u16);
}

fn reg_ptr<P: UsbPeripheral>(offset: usize) -> *mut u8 {
    unsafe { (P::register_base() as *mut u8).add(offset) }
}

fn reg_read<P: UsbPeripheral>(offset: usize) -> u32 {
    unsafe {
        if P::BUS_32BIT {
            read_volatile(reg_ptr::<P>(offset) as *const u32)
        } else {
            u32::from(read_volatile(reg_ptr::<P>(offset) as *const u16))
        }
    }
}

fn reg_write<P: UsbPeripheral>(offset: usize, value: u32) {
    unsafe {
        if P::BUS_32BIT {
            write_volatile(reg_ptr::<P>(offset) as *mut u32, value);
        } else {
            write_volatile(reg_ptr::<P>(offset) as *mut u16, value as u16);
        }
    }
}

/// Acknowledges an ISTR bit; they are write-0-to-clear
fn istr_clear<P: UsbPeripheral>(bit: u32) {
    reg_write::<P>(regs::ISTR, !bit);
}

fn read_epr<P: UsbPeripheral>(ep_idx: u8) -> Epr {
    Epr(reg_read::<P>(4 * usize::from(ep_idx)))
}

fn write_epr<P: UsbPeripheral>(ep_idx: u8, value: Epr) {
    reg_write::<P>(4 * usize::from(ep_idx), value.0);
}

/// Transfer state of one endpoint direction
#[derive(Copy, Clone)]
struct XferCtl {
    buf: *mut u8,
    total_len: u16,
    queued_len: u16,
    max_packet_size: u16,
    ep_idx: u8,            // index into the endpoint registers
    iso_in_sending: bool,  // ISO IN completions cannot be masked; this
                           // marks the ones we actually scheduled
}

impl XferCtl {
    const INIT: XferCtl = XferCtl {
        buf: core::ptr::null_mut(),
        total_len: 0,
        queued_len: 0,
        max_packet_size: 0,
        ep_idx: 0,
        iso_in_sending: false,
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EpKind {
    Control,
    Bulk,
    Interrupt,
    Iso,
}

fn kind_of(ep_type: EndpointType) -> EpKind {
    match ep_type {
        EndpointType::Control => EpKind::Control,
        EndpointType::Bulk => EpKind::Bulk,
        EndpointType::Interrupt => EpKind::Interrupt,
        EndpointType::Isochronous { .. } => EpKind::Iso,
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct EpSlot {
    ep_num: Option<u8>,
    ep_type: Option<EpKind>,
    allocated: [bool; 2],
}

/// Hardware endpoint slot allocator. IN and OUT of one logical endpoint
/// number share a slot unless the type is isochronous, which takes the
/// slot for itself.
struct EpSlots {
    slots: [EpSlot; MAX_EP_COUNT],
}

impl EpSlots {
    const fn new() -> Self {
        const FREE: EpSlot = EpSlot {
            ep_num: None,
            ep_type: None,
            allocated: [false; 2],
        };
        EpSlots {
            slots: [FREE; MAX_EP_COUNT],
        }
    }

    fn reset(&mut self, from: usize) {
        for slot in &mut self.slots[from..] {
            *slot = EpSlot::default();
        }
    }

    fn allocate(&mut self, ep_num: u8, dir: UsbDirection, kind: EpKind, count: u8) -> Option<u8> {
        let dir = dir_idx(dir);

        for i in 0..usize::from(count) {
            let slot = &mut self.slots[i];

            // opened before with the same shape
            if slot.allocated[dir] && slot.ep_type == Some(kind) && slot.ep_num == Some(ep_num) {
                return Some(i as u8);
            }

            // this direction must be free; an isochronous endpoint also
            // claims the opposite direction
            if !slot.allocated[dir] && (kind != EpKind::Iso || !slot.allocated[dir ^ 1]) {
                if slot.ep_num.is_none() || slot.ep_num == Some(ep_num) {
                    // one register pair carries one endpoint type
                    if slot.ep_type.is_none() || slot.ep_type == Some(kind) {
                        slot.ep_num = Some(ep_num);
                        slot.ep_type = Some(kind);
                        slot.allocated[dir] = true;
                        return Some(i as u8);
                    }
                }
            }
        }
        None
    }
}

/// The FSDev device controller.
///
/// One instance per peripheral. The integrator owns it, shares it between
/// task and interrupt context behind its platform's mutual exclusion, and
/// calls [poll](FsDev::poll) from the USB interrupt.
pub struct FsDev<P: UsbPeripheral> {
    xfer: [[XferCtl; 2]; MAX_EP_COUNT],
    slots: EpSlots,
    pma_cursor: u16,
    remote_wake_countdown: u8,
    pending_address: Option<u8>,
    _periph: PhantomData<P>,
}

// The raw buffer pointers inside make this !Send by default; their
// validity across contexts is already part of the xfer contract.
unsafe impl<P: UsbPeripheral> Send for FsDev<P> {}

impl<P: UsbPeripheral> Default for FsDev<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: UsbPeripheral> FsDev<P> {
    /// Packet size of the default control endpoint
    pub const EP0_SIZE: u16 = 64;

    pub const fn new() -> Self {
        FsDev {
            xfer: [[XferCtl::INIT; 2]; MAX_EP_COUNT],
            slots: EpSlots::new(),
            pma_cursor: 0,
            remote_wake_countdown: 0,
            pending_address: None,
            _periph: PhantomData,
        }
    }

    /// Brings the peripheral out of power down, installs the interrupt
    /// mask, performs a bus reset and connects the pull-up.
    ///
    /// The peripheral clock must already run; crystal-less parts must
    /// have their clock recovery system set up.
    pub fn init(&mut self) {
        // the reference manual wants a specific ordering of PDWN and
        // FRES with settle time in between
        P::startup_delay();
        reg_write::<P>(regs::CNTR, cntr::FRES | cntr::PDWN);
        P::startup_delay();
        reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) & !cntr::PDWN);
        P::startup_delay();
        reg_write::<P>(regs::CNTR, 0);

        if !P::BUS_32BIT {
            // the 32-bit parts have no BTABLE register; the table is
            // fixed at the SRAM base
            reg_write::<P>(regs::BTABLE, u32::from(P::BTABLE_BASE));
        }
        reg_write::<P>(regs::ISTR, 0);

        // disable all endpoints. This cannot clear the toggle bits but
        // does reset the type.
        for i in 0..P::EP_COUNT {
            write_epr::<P>(i, Epr(0));
        }

        reg_write::<P>(
            regs::CNTR,
            cntr::RESETM | cntr::ESOFM | cntr::CTRM | cntr::SUSPM | cntr::WKUPM,
        );
        self.handle_bus_reset();

        self.connect();
    }

    /// Enables the D+ pull-up if the part controls it internally
    pub fn connect(&mut self) {
        if P::DP_PULL_UP {
            reg_write::<P>(regs::BCDR, reg_read::<P>(regs::BCDR) | BCDR_DPPU);
        }
    }

    pub fn disconnect(&mut self) {
        if P::DP_PULL_UP {
            reg_write::<P>(regs::BCDR, reg_read::<P>(regs::BCDR) & !BCDR_DPPU);
        }
    }

    pub fn sof_enable(&mut self, enable: bool) {
        let v = reg_read::<P>(regs::CNTR);
        if enable {
            reg_write::<P>(regs::CNTR, v | cntr::SOFM);
        } else {
            reg_write::<P>(regs::CNTR, v & !cntr::SOFM);
        }
    }

    /// Starts remote wakeup signaling; held for 4 frames by the ESOF
    /// countdown (required 1 to 15 ms)
    pub fn remote_wakeup(&mut self) {
        reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) | cntr::RESUME);
        self.remote_wake_countdown = 4;
    }

    /// Queues the status packet of a SET ADDRESS request. The address
    /// itself is applied by [edpt0_status_complete](FsDev::edpt0_status_complete)
    /// because the hardware must answer the status stage on address 0.
    pub fn set_address(&mut self, dev_addr: u8) {
        self.pending_address = Some(dev_addr);
        unsafe {
            self.xfer(
                EndpointAddress::from_parts(0, UsbDirection::In),
                core::ptr::null_mut(),
                0,
            );
        }
    }

    /// Invoked by the core when a control status stage completed
    pub fn edpt0_status_complete(&mut self) {
        if let Some(addr) = self.pending_address.take() {
            reg_write::<P>(regs::DADDR, DADDR_EF | u32::from(addr));
        }
    }

    fn handle_bus_reset(&mut self) {
        reg_write::<P>(regs::DADDR, 0); // USB function off while reconfiguring

        self.slots.reset(0);
        self.pending_address = None;
        self.pma_cursor = P::BTABLE_BASE + 8 * u16::from(P::EP_COUNT);

        self.open_endpoint0();

        reg_write::<P>(regs::DADDR, DADDR_EF);
    }

    /// Opens the default control endpoint, both directions
    fn open_endpoint0(&mut self) {
        self.slots
            .allocate(0, UsbDirection::Out, EpKind::Control, P::EP_COUNT);
        self.slots
            .allocate(0, UsbDirection::In, EpKind::Control, P::EP_COUNT);

        for dir in [DIR_OUT, DIR_IN] {
            self.xfer[0][dir].max_packet_size = Self::EP0_SIZE;
            self.xfer[0][dir].ep_idx = 0;
        }

        let rx_addr = self.pma_alloc(Self::EP0_SIZE, false) as u16;
        let tx_addr = self.pma_alloc(Self::EP0_SIZE, false) as u16;
        pma::btable_set_addr::<P>(0, pma::BUF_RX, rx_addr);
        pma::btable_set_addr::<P>(0, pma::BUF_TX, tx_addr);

        let w = Epr(read_epr::<P>(0).0 & !epr::INVARIANT_MASK);
        let w = Epr(w.0 | epr::TYPE_CONTROL | epr::CTR_RX | epr::CTR_TX);
        // the DTOG bits are carried in the write value and need no
        // explicit correction here
        let w = w.add_tx_status(EpStatus::Nak).add_rx_status(EpStatus::Nak);
        write_epr::<P>(0, w);
    }

    /// Claims a hardware slot and packet memory for a bulk or interrupt
    /// endpoint and leaves it NAKing with DATA0.
    ///
    /// Isochronous endpoints go through [iso_alloc](FsDev::iso_alloc) and
    /// [iso_activate](FsDev::iso_activate) instead.
    ///
    /// # Panics
    /// Panics when endpoint slots or packet memory are exhausted; both
    /// are configuration errors.
    pub fn open_endpoint(
        &mut self,
        ep_addr: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) {
        let ep_num = ep_addr.index() as u8;
        let dir = ep_addr.direction();
        let kind = kind_of(ep_type);
        assert!(matches!(kind, EpKind::Bulk | EpKind::Interrupt));

        let ep_idx = self
            .slots
            .allocate(ep_num, dir, kind, P::EP_COUNT)
            .expect("endpoint slots exhausted");

        trace!("usb: fsdev: Open ep {=u8:x} on slot {}", u8::from(ep_addr), ep_idx);

        let mut w = Epr(read_epr::<P>(ep_idx).0 & !epr::INVARIANT_MASK);
        w.0 |= u32::from(ep_num) | epr::CTR_RX | epr::CTR_TX;
        w.0 |= match kind {
            // the hardware services CONTROL and BULK identically outside
            // of setup transactions
            EpKind::Bulk => epr::TYPE_CONTROL,
            _ => epr::TYPE_INTERRUPT,
        };

        let pma_addr = self.pma_alloc(max_packet_size, false) as u16;
        let buf_id = if dir == UsbDirection::In {
            pma::BUF_TX
        } else {
            pma::BUF_RX
        };
        pma::btable_set_addr::<P>(ep_idx, buf_id, pma_addr);

        let x = &mut self.xfer[usize::from(ep_num)][dir_idx(dir)];
        x.max_packet_size = max_packet_size;
        x.ep_idx = ep_idx;

        let w = if dir == UsbDirection::In {
            let w = w.add_tx_status(EpStatus::Nak).add_tx_dtog(false);
            Epr(w.0 & !(epr::STAT_RX | epr::DTOG_RX))
        } else {
            let w = w.add_rx_status(EpStatus::Nak).add_rx_dtog(false);
            Epr(w.0 & !(epr::STAT_TX | epr::DTOG_TX))
        };
        write_epr::<P>(ep_idx, w);
    }

    /// Disables one direction of an endpoint. Any transfer in progress
    /// on it is dropped.
    pub fn close_endpoint(&mut self, ep_addr: EndpointAddress) {
        let ep_idx = self.xfer_ctl(ep_addr).ep_idx;
        if ep_addr.direction() == UsbDirection::In {
            self.set_tx_status(ep_idx, EpStatus::Disabled);
        } else {
            self.set_rx_status(ep_idx, EpStatus::Disabled);
        }
    }

    /// Disables every endpoint except the control pair and releases
    /// their slots and packet memory
    pub fn close_all(&mut self) {
        for i in 1..P::EP_COUNT {
            write_epr::<P>(i, Epr(0));
        }
        self.slots.reset(1);

        // everything above the BTABLE and the control buffers is free again
        self.pma_cursor = P::BTABLE_BASE + 8 * u16::from(P::EP_COUNT) + 2 * Self::EP0_SIZE;
    }

    /// Reserves the double-buffered packet memory of an isochronous
    /// endpoint and programs both buffer descriptors.
    ///
    /// # Panics
    /// Panics when endpoint slots or packet memory are exhausted.
    pub fn iso_alloc(&mut self, ep_addr: EndpointAddress, largest_packet_size: u16) {
        let ep_num = ep_addr.index() as u8;
        let dir = ep_addr.direction();

        let ep_idx = self
            .slots
            .allocate(ep_num, dir, EpKind::Iso, P::EP_COUNT)
            .expect("endpoint slots exhausted");

        let pair = self.pma_alloc(largest_packet_size, true);
        pma::btable_set_addr::<P>(ep_idx, 0, pair as u16);
        pma::btable_set_addr::<P>(ep_idx, 1, (pair >> 16) as u16);

        self.xfer[usize::from(ep_num)][dir_idx(dir)].ep_idx = ep_idx;

        write_epr::<P>(ep_idx, read_epr::<P>(ep_idx).set_type(epr::TYPE_ISO));
    }

    /// Activates an isochronous endpoint allocated with
    /// [iso_alloc](FsDev::iso_alloc): both directions disabled, the data
    /// toggle preconfigured so the first transfer uses the first buffer
    pub fn iso_activate(&mut self, ep_addr: EndpointAddress, max_packet_size: u16) {
        let ep_num = ep_addr.index() as u8;
        let dir = ep_addr.direction();
        let ep_idx = self.xfer_ctl(ep_addr).ep_idx;

        self.xfer[usize::from(ep_num)][dir_idx(dir)].max_packet_size = max_packet_size;

        let w = Epr(read_epr::<P>(ep_idx).0 & !epr::INVARIANT_MASK);
        let w = Epr(w.0 | u32::from(ep_num) | epr::TYPE_ISO | epr::CTR_RX | epr::CTR_TX);
        let w = w
            .add_tx_status(EpStatus::Disabled)
            .add_rx_status(EpStatus::Disabled);
        let w = if dir == UsbDirection::In {
            w.add_rx_dtog(true)
        } else {
            w.add_tx_dtog(true)
        };
        write_epr::<P>(ep_idx, w);
    }

    /// Submits a transfer.
    ///
    /// IN: transmits `total_len` bytes from `buf`, chunked to the packet
    /// size by the interrupt service. OUT: receives up to `total_len`
    /// bytes into `buf`. Completion is reported through
    /// [EventHandler::xfer_complete].
    ///
    /// # Safety
    /// `buf` must stay valid, and for OUT transfers exclusively owned by
    /// the driver, until the completion event is delivered or the bus is
    /// reset. It may be null only when `total_len` is 0.
    pub unsafe fn xfer(&mut self, ep_addr: EndpointAddress, buf: *mut u8, total_len: u16) {
        debug_assert!(!buf.is_null() || total_len == 0);

        let x = &mut self.xfer[ep_addr.index()][dir_idx(ep_addr.direction())];
        x.buf = buf;
        x.total_len = total_len;
        x.queued_len = 0;

        self.edpt_xfer(ep_addr);
    }

    /// Queues a single IN packet assembled from the linear and wrapped
    /// parts a ring buffer yields. The copy happens before this returns,
    /// so no buffer is retained; the completion event reports the
    /// combined length.
    ///
    /// # Panics
    /// Panics if the parts exceed the endpoint's packet size.
    pub fn xfer_in_ring(&mut self, ep_addr: EndpointAddress, parts: (&[u8], &[u8])) {
        let ep_num = ep_addr.index();
        let len = (parts.0.len() + parts.1.len()) as u16;

        let ep_idx = {
            let x = &mut self.xfer[ep_num][DIR_IN];
            assert!(len <= x.max_packet_size);
            x.buf = core::ptr::null_mut();
            x.total_len = len;
            x.queued_len = len; // single packet; complete on the next CTR
            x.ep_idx
        };

        let v = read_epr::<P>(ep_idx);
        let is_iso = v.is_iso();
        let buf_id = if is_iso {
            if v.tx_dtog() {
                1
            } else {
                0
            }
        } else {
            pma::BUF_TX
        };

        let addr = pma::btable_get_addr::<P>(ep_idx, buf_id);
        pma::btable_set_count::<P>(ep_idx, buf_id, len);
        pma::write_packet_mem_split::<P>(addr, parts.0, parts.1);

        if is_iso {
            // observable before the completion interrupt can fire
            self.xfer[ep_num][DIR_IN].iso_in_sending = true;
        }
        self.set_tx_status(ep_idx, EpStatus::Valid);
    }

    pub fn stall(&mut self, ep_addr: EndpointAddress) {
        let ep_idx = self.xfer_ctl(ep_addr).ep_idx;
        if ep_addr.direction() == UsbDirection::In {
            self.set_tx_status(ep_idx, EpStatus::Stall);
        } else {
            self.set_rx_status(ep_idx, EpStatus::Stall);
        }
    }

    /// Removes a stall and resets the endpoint to DATA0, in a single
    /// register update
    pub fn clear_stall(&mut self, ep_addr: EndpointAddress) {
        let ep_idx = self.xfer_ctl(ep_addr).ep_idx;
        let v = read_epr::<P>(ep_idx);

        if ep_addr.direction() == UsbDirection::In {
            if v.is_iso() {
                // iso has no NAK state; only the toggle needs care
                if v.tx_dtog() {
                    write_epr::<P>(ep_idx, v.toggle_tx_dtog());
                }
            } else {
                write_epr::<P>(ep_idx, v.set_tx_status_clear_dtog(EpStatus::Nak));
            }
        } else if v.is_iso() {
            if v.rx_dtog() {
                write_epr::<P>(ep_idx, v.toggle_rx_dtog());
            }
        } else {
            write_epr::<P>(ep_idx, v.set_rx_status_clear_dtog(EpStatus::Nak));
        }
    }

    pub fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let ep_idx = self.xfer_ctl(ep_addr).ep_idx;
        let v = read_epr::<P>(ep_idx);
        let stalled = u32::from(EpStatus::Stall as u8);
        if ep_addr.direction() == UsbDirection::In {
            v.tx_status() == stalled
        } else {
            v.rx_status() == stalled
        }
    }

    /// The interrupt service routine. Decodes every pending condition,
    /// drains all endpoint completions and reports upward through
    /// `handler`.
    pub fn poll<H: EventHandler>(&mut self, handler: &mut H) {
        let status = reg_read::<P>(regs::ISTR);

        // SOF first, for the least jitter when it is used for timing
        if status & istr::SOF != 0 {
            istr_clear::<P>(istr::SOF);
            handler.sof((reg_read::<P>(regs::FNR) & FNR_FN) as u16);
        }

        if status & istr::RESET != 0 {
            // start of bus reset; any other pending condition is stale
            istr_clear::<P>(istr::RESET);
            self.handle_bus_reset();
            handler.bus_reset();
            return;
        }

        if status & istr::CTR != 0 {
            self.ctr_handler(handler);
        }

        if status & istr::WKUP != 0 {
            reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) & !cntr::LPMODE);
            reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) & !cntr::FSUSP);
            istr_clear::<P>(istr::WKUP);
            handler.resume();
        }

        if status & istr::SUSP != 0 {
            // asserted for suspend and unplug alike; without VBUS sensing
            // they cannot be told apart
            reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) | cntr::FSUSP);
            reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) | cntr::LPMODE);
            // ISTR must be cleared after FSUSP is set
            istr_clear::<P>(istr::SUSP);
            handler.suspend();
        }

        if status & istr::ESOF != 0 {
            if self.remote_wake_countdown == 1 {
                reg_write::<P>(regs::CNTR, reg_read::<P>(regs::CNTR) & !cntr::RESUME);
            }
            if self.remote_wake_countdown > 0 {
                self.remote_wake_countdown -= 1;
            }
            istr_clear::<P>(istr::ESOF);
        }
    }

    /// Services correct-transfer conditions until none is pending. A
    /// single interrupt can cover several endpoints; the loop preserves
    /// the peripheral's internal ordering.
    fn ctr_handler<H: EventHandler>(&mut self, handler: &mut H) {
        loop {
            let status = reg_read::<P>(regs::ISTR);
            if status & istr::CTR == 0 {
                break;
            }
            if status & istr::DIR == 0 {
                self.ctr_tx_handler(handler, status);
            } else {
                self.ctr_rx_handler(handler, status);
            }
        }
    }

    fn ctr_tx_handler<H: EventHandler>(&mut self, handler: &mut H, status: u32) {
        let ep_idx = (status & istr::EP_ID) as u8;
        let v = read_epr::<P>(ep_idx);
        let ep_num = (v.0 & epr::EP_ADDR) as u8;

        if !v.tx_ctr() {
            return;
        }

        write_epr::<P>(ep_idx, v.clear_tx_ctr());

        if v.is_iso() {
            // the host may send an IN token while there is no data; ISO
            // has no NAK, so the resulting zero length packet interrupts
            // like a completion. Only handle what was scheduled.
            let x = &mut self.xfer[usize::from(ep_num)][DIR_IN];
            if !x.iso_in_sending {
                return;
            }
            x.iso_in_sending = false;

            // DTOG_TX already points at the buffer of the next frame
            let buf_id = if v.tx_dtog() { 0 } else { 1 };
            pma::btable_set_count::<P>(ep_idx, buf_id, 0);
        }

        let (total, queued) = {
            let x = &self.xfer[usize::from(ep_num)][DIR_IN];
            (x.total_len, x.queued_len)
        };

        if total != queued {
            self.transmit_packet(ep_num, ep_idx);
        } else {
            handler.xfer_complete(
                EndpointAddress::from_parts(usize::from(ep_num), UsbDirection::In),
                total,
            );
        }
    }

    fn ctr_rx_handler<H: EventHandler>(&mut self, handler: &mut H, status: u32) {
        if P::BUS_32BIT {
            // the buffer descriptor may still be updating when CTR fires
            P::errata_delay();
        }

        let ep_idx = (status & istr::EP_ID) as u8;
        let v = read_epr::<P>(ep_idx);
        let ep_num = (v.0 & epr::EP_ADDR) as u8;

        if !v.rx_ctr() {
            return;
        }

        if v.setup() {
            // a setup packet is always 8 bytes; anything else is dropped
            // and the host retries
            let count = pma::btable_get_count::<P>(ep_idx, pma::BUF_RX);
            if count == 8 {
                let rx_addr = pma::btable_get_addr::<P>(ep_idx, pma::BUF_RX);
                let mut setup = [0u8; 8];
                pma::read_packet_mem::<P>(&mut setup, rx_addr);

                // back to NAK in case the endpoint was stalling, and
                // DATA1 follows a setup packet
                let w = v
                    .add_tx_status(EpStatus::Nak)
                    .add_rx_status(EpStatus::Nak)
                    .add_tx_dtog(true)
                    .add_rx_dtog(true);
                write_epr::<P>(0, Epr(w.0 | epr::CTR_RX | epr::CTR_TX));

                handler.setup_received(setup);
            }
        } else {
            // the data is read before CTR is cleared so a new packet
            // cannot overwrite it; endpoint 0 defers the clear further,
            // see below
            if ep_num != 0 {
                write_epr::<P>(ep_idx, read_epr::<P>(ep_idx).clear_rx_ctr());
            }

            let buf_id = if v.is_iso() {
                // double buffered: DTOG_RX points at the buffer the
                // hardware fills next, the completed one is the other
                if v.rx_dtog() {
                    0
                } else {
                    1
                }
            } else {
                pma::BUF_RX
            };
            let count = pma::btable_get_count::<P>(ep_idx, buf_id);
            let addr = pma::btable_get_addr::<P>(ep_idx, buf_id);

            let (buf, queued, total, mps) = {
                let x = &self.xfer[usize::from(ep_num)][DIR_OUT];
                (x.buf, x.queued_len, x.total_len, x.max_packet_size)
            };

            if count != 0 && !buf.is_null() {
                let dst = unsafe {
                    core::slice::from_raw_parts_mut(
                        buf.add(usize::from(queued)),
                        usize::from(count),
                    )
                };
                pma::read_packet_mem::<P>(dst, addr);
            }
            let queued = queued + count;
            self.xfer[usize::from(ep_num)][DIR_OUT].queued_len = queued;

            if count < mps || queued == total {
                // short packet or everything received
                handler.xfer_complete(
                    EndpointAddress::from_parts(usize::from(ep_num), UsbDirection::Out),
                    queued,
                );
            } else {
                // keep the endpoint receiving; isochronous endpoints stay
                // armed on their own
                if !v.is_iso() {
                    let cnt = (total - queued).min(mps);
                    pma::btable_set_rx_bufsize::<P>(ep_idx, pma::BUF_RX, cnt);
                }
                self.set_rx_status(ep_idx, EpStatus::Valid);
            }
        }

        if ep_num == 0 {
            // always be prepared for another setup packet. CTR is
            // cleared last so a new packet cannot overwrite the one just
            // read; setup packets are accepted again once it is clear.
            pma::btable_set_rx_bufsize::<P>(0, pma::BUF_RX, Self::EP0_SIZE);
            write_epr::<P>(0, read_epr::<P>(0).clear_rx_ctr());
        }
    }

    /// Copies the next chunk of an IN transfer into packet memory and
    /// marks the endpoint valid
    fn transmit_packet(&mut self, ep_num: u8, ep_idx: u8) {
        let x = self.xfer[usize::from(ep_num)][DIR_IN];
        let len = (x.total_len - x.queued_len).min(x.max_packet_size);

        let v = read_epr::<P>(ep_idx);
        let is_iso = v.is_iso();
        let buf_id = if is_iso {
            if v.tx_dtog() {
                1
            } else {
                0
            }
        } else {
            pma::BUF_TX
        };

        let addr = pma::btable_get_addr::<P>(ep_idx, buf_id);
        pma::btable_set_count::<P>(ep_idx, buf_id, len);

        if len > 0 {
            let src = unsafe {
                core::slice::from_raw_parts(x.buf.add(usize::from(x.queued_len)), usize::from(len))
            };
            pma::write_packet_mem::<P>(addr, src);
        }

        let x = &mut self.xfer[usize::from(ep_num)][DIR_IN];
        x.queued_len += len;
        if is_iso {
            // set before VALID: the completion interrupt must observe it
            x.iso_in_sending = true;
        }
        self.set_tx_status(ep_idx, EpStatus::Valid);
    }

    fn edpt_xfer(&mut self, ep_addr: EndpointAddress) {
        let ep_num = ep_addr.index();
        let x = self.xfer[ep_num][dir_idx(ep_addr.direction())];
        let ep_idx = x.ep_idx;

        if ep_addr.direction() == UsbDirection::In {
            self.transmit_packet(ep_num as u8, ep_idx);
        } else {
            let cnt = x.total_len.min(x.max_packet_size);
            if read_epr::<P>(ep_idx).is_iso() {
                pma::btable_set_rx_bufsize::<P>(ep_idx, 0, cnt);
                pma::btable_set_rx_bufsize::<P>(ep_idx, 1, cnt);
            } else {
                pma::btable_set_rx_bufsize::<P>(ep_idx, pma::BUF_RX, cnt);
            }
            self.set_rx_status(ep_idx, EpStatus::Valid);
        }
    }

    fn set_tx_status(&mut self, ep_idx: u8, status: EpStatus) {
        write_epr::<P>(ep_idx, read_epr::<P>(ep_idx).set_tx_status(status));
    }

    fn set_rx_status(&mut self, ep_idx: u8, status: EpStatus) {
        write_epr::<P>(ep_idx, read_epr::<P>(ep_idx).set_rx_status(status));
    }

    fn xfer_ctl(&self, ep_addr: EndpointAddress) -> &XferCtl {
        &self.xfer[ep_addr.index()][dir_idx(ep_addr.direction())]
    }

    /// Bump-allocates packet memory, rounded to the hardware block
    /// granularity. For a double-buffered allocation the second buffer's
    /// offset is returned in the upper half.
    ///
    /// There is no free operation; the cursor is reset wholesale by a bus
    /// reset or [close_all](FsDev::close_all).
    fn pma_alloc(&mut self, len: u16, dbuf: bool) -> u32 {
        let aligned = pma::align_buffer_size(len);

        let mut addr = u32::from(self.pma_cursor);
        self.pma_cursor += aligned;

        if dbuf {
            addr |= u32::from(self.pma_cursor) << 16;
            self.pma_cursor += aligned;
        }

        assert!(self.pma_cursor <= P::PMA_SIZE, "packet memory exhausted");
        addr
    }
}

#[cfg(test)]
macro_rules! test_peripheral {
    ($name:ident, size: $size:expr, stride: $stride:expr, bus32: $bus32:expr) => {
        struct $name;

        impl $name {
            fn backing() -> *mut u32 {
                use core::sync::atomic::{AtomicPtr, Ordering};
                static MEM: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
                let mut p = MEM.load(Ordering::Acquire);
                if p.is_null() {
                    let b: std::boxed::Box<[u32]> =
                        std::vec![0u32; $size as usize * $stride as usize / 4].into();
                    p = std::boxed::Box::leak(b).as_mut_ptr();
                    MEM.store(p, Ordering::Release);
                }
                p
            }

            fn reg_backing() -> *mut u32 {
                use core::sync::atomic::{AtomicPtr, Ordering};
                static REGS: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
                let mut p = REGS.load(Ordering::Acquire);
                if p.is_null() {
                    let b: std::boxed::Box<[u32]> = std::vec![0u32; 32].into();
                    p = std::boxed::Box::leak(b).as_mut_ptr();
                    REGS.store(p, Ordering::Release);
                }
                p
            }
        }

        unsafe impl crate::fsdev::UsbPeripheral for $name {
            fn register_base() -> *mut () {
                Self::reg_backing() as *mut ()
            }
            fn pma_base() -> *mut () {
                Self::backing() as *mut ()
            }
            const PMA_SIZE: u16 = $size;
            const PMA_STRIDE: u16 = $stride;
            const BUS_32BIT: bool = $bus32;
            const DP_PULL_UP: bool = true;
            fn startup_delay() {}
        }
    };
}

#[cfg(test)]
pub(crate) use test_peripheral;
