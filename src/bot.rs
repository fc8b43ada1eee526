//! Bulk Only Transport (BOT/BBB)
//!
//! The protocol engine of the Mass Storage class: each command is a
//! 31-byte Command Block Wrapper on the bulk OUT endpoint, an optional
//! data phase in either direction, and a 13-byte Command Status Wrapper
//! on the bulk IN endpoint. The engine resolves the thirteen
//! command/data/status mismatch cases of the Bulk Only spec, streams
//! READ(10)/WRITE(10) through the staging buffer and recovers from
//! protocol faults with endpoint stalls and the class reset request.

use crate::fmt::{debug, info, trace, warning};
use crate::scsi::{self, BlockDevice, IoStatus, ScsiOpcode, Sense, CDB_LEN};
use crate::usbd::{ControlResult, Deferred, UsbdBus};
use core::borrow::BorrowMut;
use num_enum::TryFromPrimitive;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;

const CBW_SIGNATURE: u32 = 0x43425355;
const CSW_SIGNATURE: u32 = 0x53425355;

/// Length of a Command Block Wrapper
pub const CBW_LEN: usize = 31;
/// Length of a Command Status Wrapper
pub const CSW_LEN: usize = 13;

// Class specific requests, spec. sections 3.1 and 3.2
const REQ_BULK_ONLY_RESET: u8 = 0xFF;
const REQ_GET_MAX_LUN: u8 = 0xFE;

/// Mass Storage class error
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// USB stack error
    Usb(UsbError),
    /// The staging buffer cannot fit a CBW, a full packet or an INQUIRY
    /// response
    BufferTooSmall,
}

impl From<UsbError> for Error {
    fn from(err: UsbError) -> Self {
        Error::Usb(err)
    }
}

/// The status reported in a CSW.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Stage {
    #[default]
    Cmd, // waiting for a CBW
    Data,       // streaming the data phase
    Status,     // data done, CSW not yet queued
    StatusSent, // CSW queued, waiting for its completion
    NeedReset,  // invalid CBW; both endpoints stalled until reset recovery
}

/// Parsed Command Block Wrapper
#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Cbw {
    tag: u32,
    total_bytes: u32,
    dir_in: bool,
    lun: u8,
    cmd_len: u8,
    command: [u8; CDB_LEN],
}

impl Cbw {
    /// Parses a 31-byte CBW; `None` if the signature does not match.
    ///
    /// LUN, flags and command length are not validated here, an unknown
    /// command fails later in the SCSI processor.
    fn parse(raw: &[u8]) -> Option<Cbw> {
        if u32::from_le_bytes(raw[0..4].try_into().unwrap()) != CBW_SIGNATURE {
            return None;
        }

        Some(Cbw {
            tag: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            total_bytes: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            dir_in: (raw[12] & 0x80) != 0,
            lun: raw[13] & 0x0F,
            cmd_len: raw[14],
            command: raw[15..31].try_into().unwrap(),
        })
    }
}

/// Command Status Wrapper
#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Csw {
    tag: u32,
    data_residue: u32,
    status: CommandStatus,
}

impl Csw {
    fn to_bytes(self) -> [u8; CSW_LEN] {
        let mut raw = [0u8; CSW_LEN];
        raw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        raw[12] = self.status as u8;
        raw
    }
}

/// The 13 cases of the Bulk Only spec, section 6.7, for the streaming
/// commands. Case 5 (Hi > Di) is resolved later, when the status stage
/// stalls the IN endpoint before the CSW.
fn validate_rdwr10(cbw: &Cbw) -> CommandStatus {
    let block_count = scsi::rdwr10_block_count(&cbw.command);

    if cbw.total_bytes == 0 {
        if block_count != 0 {
            debug!("usb: msc: case 2/3 (Hn < Di, Hn < Do)");
            return CommandStatus::PhaseError;
        }
        // no data transfer requested and none offered
        return CommandStatus::Passed;
    }

    if cbw.command[0] == ScsiOpcode::Read10 as u8 && !cbw.dir_in {
        debug!("usb: msc: case 10 (Ho <> Di)");
        CommandStatus::PhaseError
    } else if cbw.command[0] == ScsiOpcode::Write10 as u8 && cbw.dir_in {
        debug!("usb: msc: case 8 (Hi <> Do)");
        CommandStatus::PhaseError
    } else if block_count == 0 {
        debug!("usb: msc: case 4/9 (Hi > Dn, Ho > Dn)");
        CommandStatus::Failed
    } else if cbw.total_bytes / u32::from(block_count) == 0 {
        debug!("usb: msc: case 7/13 (Hi < Di, Ho < Do)");
        CommandStatus::PhaseError
    } else {
        CommandStatus::Passed
    }
}

/// Mass Storage class function
///
/// Owns one interface worth of Bulk Only state: the current CBW/CSW,
/// the stage of the protocol engine and the staging buffer the data
/// phase streams through. Driven by the device core with
/// [transfer_complete], [control_request] and [process_deferred];
/// backed by the application through [BlockDevice].
///
/// [transfer_complete]: MscClass::transfer_complete
/// [control_request]: MscClass::control_request
/// [process_deferred]: MscClass::process_deferred
pub struct MscClass<D: BlockDevice, Buf: BorrowMut<[u8]>> {
    device: D,
    buf: Buf,
    ep_in: EndpointAddress,
    ep_out: EndpointAddress,
    stage: Stage,
    cbw: Cbw,
    csw: Csw,
    total_len: u32,   // bytes of the data phase, can be less than cbw.total_bytes
    xferred_len: u32, // bytes moved so far in the data phase
    sense: Sense,
    pending_io: bool, // an asynchronous block device op is in flight
    pending_rx: bool, // an armed OUT transfer whose payload must be fetched
}

impl<D, Buf> MscClass<D, Buf>
where
    D: BlockDevice,
    Buf: BorrowMut<[u8]>,
{
    /// Creates the class function, opens its bulk endpoint pair and arms
    /// the first CBW read.
    ///
    /// # Arguments
    /// * `bus` - endpoint services of the device core
    /// * `device` - the application block device
    /// * `max_packet_size` - bulk packet size. Allowed values: 8,16,32,64
    /// * `buf` - the staging buffer. It is **required** to fit a CBW, a
    ///   single full packet and an INQUIRY response; it is **recommended**
    ///   that it fits one block
    ///
    /// # Errors
    /// * [Error::BufferTooSmall]
    /// * [Error::Usb] if endpoint allocation fails
    pub fn new<B: UsbdBus>(
        bus: &mut B,
        device: D,
        max_packet_size: u16,
        buf: Buf,
    ) -> Result<Self, Error> {
        let buf_len = buf.borrow().len();
        if buf_len < CBW_LEN
            || buf_len < usize::from(max_packet_size)
            || buf_len < scsi::INQUIRY_RESP_LEN
        {
            return Err(Error::BufferTooSmall);
        }

        let (ep_out, ep_in) = bus.open_bulk_pair(max_packet_size)?;

        let mut msc = MscClass {
            device,
            buf,
            ep_in,
            ep_out,
            stage: Stage::default(),
            cbw: Cbw::default(),
            csw: Csw::default(),
            total_len: 0,
            xferred_len: 0,
            sense: Sense::default(),
            pending_io: false,
            pending_rx: false,
        };
        msc.prepare_cbw(bus)?;
        Ok(msc)
    }

    /// Handles a USB bus reset: drops all protocol state.
    ///
    /// Transfers in flight are gone with the bus; a pending asynchronous
    /// IO completion arriving after this point is discarded. The core is
    /// expected to re-arm the interface when the host configures it
    /// again.
    pub fn reset(&mut self) {
        info!("usb: msc: Recv bus reset");
        self.stage = Stage::Cmd;
        self.cbw = Cbw::default();
        self.csw = Csw::default();
        self.total_len = 0;
        self.xferred_len = 0;
        self.sense.clear();
        self.pending_io = false;
        self.pending_rx = false;
    }

    /// Re-arms the CBW read, e.g. after the host selected a configuration
    pub fn activate<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), Error> {
        self.prepare_cbw(bus)?;
        Ok(())
    }

    /// Sets the sense data reported by the next REQUEST SENSE
    pub fn set_sense(&mut self, key: u8, asc: u8, ascq: u8) {
        self.sense.set(key, asc, ascq);
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The staging buffer of the current command.
    ///
    /// An asynchronous read places its data here before reporting
    /// [async_io_done](MscClass::async_io_done).
    pub fn staging_buffer(&mut self) -> &mut [u8] {
        self.buf.borrow_mut()
    }

    /// Handles a control request routed to this interface or its
    /// endpoints.
    ///
    /// Understands the Bulk Only reset and Get Max LUN class requests and
    /// the Clear Feature(ENDPOINT_HALT) notifications that drive reset
    /// recovery. The core performs the actual un-stall of a Clear Feature
    /// before calling this.
    pub fn control_request<B: UsbdBus>(&mut self, bus: &mut B, req: &Request) -> ControlResult {
        if req.request_type == RequestType::Standard
            && req.recipient == Recipient::Endpoint
            && req.request == Request::CLEAR_FEATURE
            && req.value == Request::FEATURE_ENDPOINT_HALT
        {
            let ep_addr = EndpointAddress::from(req.index as u8);
            if ep_addr != self.ep_in && ep_addr != self.ep_out {
                return ControlResult::Ignored;
            }

            info!("usb: msc: Clear Feature on {}", u8::from(ep_addr));

            if self.stage == Stage::NeedReset {
                // only a Bulk Only reset recovers from an invalid CBW;
                // keep the endpoint stalled
                bus.stall(ep_addr);
            } else if ep_addr == self.ep_in {
                if self.stage == Stage::Status {
                    // resume the status withheld while the endpoint was
                    // stalled (case 5, Hi > Di)
                    if self.send_csw(bus).is_err() {
                        return ControlResult::Rejected;
                    }
                }
            } else if self.stage == Stage::Cmd && bus.is_ready(self.ep_out) {
                // reset recovery: prepare for a new command unless one is
                // already queued
                if self.prepare_cbw(bus).is_err() {
                    return ControlResult::Rejected;
                }
            }
            return ControlResult::Accepted;
        }

        if req.request_type != RequestType::Class || req.recipient != Recipient::Interface {
            return ControlResult::Ignored;
        }

        match req.request {
            REQ_BULK_ONLY_RESET => {
                if req.value != 0 || req.length != 0 {
                    return ControlResult::Rejected;
                }
                info!("usb: msc: Bulk Only reset");
                // endpoints stay stalled until the host clears them
                self.stage = Stage::Cmd;
                self.total_len = 0;
                self.xferred_len = 0;
                self.sense.clear();
                ControlResult::Accepted
            }

            REQ_GET_MAX_LUN => {
                if req.value != 0 || req.length != 1 {
                    return ControlResult::Rejected;
                }
                let lun_count = self.device.lun_count();
                if lun_count == 0 {
                    return ControlResult::Rejected;
                }
                // MAX LUN is the count minus one by spec
                ControlResult::MaxLun(lun_count - 1)
            }

            _ => ControlResult::Rejected,
        }
    }

    /// Handles a completion event of either bulk endpoint.
    ///
    /// This is the engine of the class: every CBW, data chunk and CSW
    /// passes through here.
    pub fn transfer_complete<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        ep_addr: EndpointAddress,
        xferred_bytes: usize,
    ) -> Result<(), Error> {
        match self.stage {
            Stage::Cmd => self.on_cmd_complete(bus, ep_addr, xferred_bytes)?,
            Stage::Data => self.on_data_complete(bus, xferred_bytes)?,
            Stage::Status => {
                // resolved below, nothing completes in this stage
            }
            Stage::StatusSent => self.on_status_sent(bus, ep_addr, xferred_bytes)?,
            Stage::NeedReset => {}
        }

        if self.stage == Stage::Status {
            self.process_stage_status(bus)?;
        }
        Ok(())
    }

    /// Reports the completion of an asynchronous [BlockDevice::read] or
    /// [BlockDevice::write].
    ///
    /// The result is not processed here but queued on the core and
    /// replayed from task context through [process_deferred]. Returns
    /// `false` if no asynchronous operation is in flight.
    ///
    /// [process_deferred]: MscClass::process_deferred
    pub fn async_io_done<B: UsbdBus>(&mut self, bus: &mut B, status: IoStatus, in_isr: bool) -> bool {
        if !self.pending_io {
            return false;
        }

        // a zero-byte or busy completion makes no sense here
        let status = match status {
            IoStatus::Bytes(0) | IoStatus::Busy | IoStatus::Async => IoStatus::Error,
            other => other,
        };

        bus.defer(Deferred::AsyncIo(status), in_isr);
        true
    }

    /// Handles a deferred event the core queued on our behalf
    pub fn process_deferred<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        event: Deferred,
    ) -> Result<(), Error> {
        let Deferred::AsyncIo(status) = event;

        // discarded when a reset beat the completion to it
        if !self.pending_io {
            return Ok(());
        }
        self.pending_io = false;

        match ScsiOpcode::try_from_primitive(self.cbw.command[0]) {
            Ok(ScsiOpcode::Read10) => self.read_io_data(bus, status)?,
            Ok(ScsiOpcode::Write10) => {
                let consumed = match status {
                    IoStatus::Bytes(n) => n as usize,
                    _ => 0,
                };
                self.write_io_data(bus, consumed, status)?;
            }
            _ => {}
        }

        if self.stage == Stage::Status {
            self.process_stage_status(bus)?;
        }
        Ok(())
    }

    /// Queues the next CBW read
    fn prepare_cbw<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), UsbError> {
        self.stage = Stage::Cmd;
        bus.xfer_out(self.ep_out, CBW_LEN)?;
        self.pending_rx = true;
        Ok(())
    }

    /// Queues the CSW; data residue is always host expectation minus what
    /// was actually moved
    fn send_csw<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), UsbError> {
        self.csw.data_residue = self.cbw.total_bytes - self.xferred_len;
        self.stage = Stage::StatusSent;
        info!("usb: msc: Send CSW: {}", self.csw);
        bus.xfer_in(self.ep_in, &self.csw.to_bytes())
    }

    /// Copies the payload of a completed OUT transfer into the staging
    /// buffer. Synthesized completions carry no payload and are skipped.
    fn fetch_rx<B: UsbdBus>(&mut self, bus: &mut B, len: usize) -> Result<(), UsbError> {
        if self.pending_rx {
            self.pending_rx = false;
            if len > 0 {
                bus.read(self.ep_out, &mut self.buf.borrow_mut()[..len])?;
            }
        }
        Ok(())
    }

    /// Fails the current command: sets the CSW, defaults the sense data
    /// and stalls the data endpoint if the data phase is incomplete
    fn fail_scsi_op<B: UsbdBus>(&mut self, bus: &mut B, status: CommandStatus) {
        self.csw.status = status;
        self.csw.data_residue = self.cbw.total_bytes - self.xferred_len;
        self.stage = Stage::Status;

        // failed but no sense set: default to Illegal Request
        if !self.sense.is_set() {
            self.sense.set(scsi::SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00);
        }

        if self.cbw.total_bytes != 0 && self.csw.data_residue != 0 {
            if self.cbw.dir_in {
                bus.stall(self.ep_in);
            } else {
                bus.stall(self.ep_out);
            }
        }
    }

    /// Finishes the status stage: either stalls the IN endpoint (case 5,
    /// Hi > Di) or queues the CSW. Skipped while the endpoint is stalled;
    /// the Clear Feature handler resumes it.
    fn process_stage_status<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), UsbError> {
        if !bus.is_stalled(self.ep_in) {
            if self.cbw.total_bytes > self.xferred_len && self.cbw.dir_in {
                debug!(
                    "usb: msc: case 5 (Hi > Di): {} > {}",
                    self.cbw.total_bytes,
                    self.xferred_len
                );
                bus.stall(self.ep_in);
            } else {
                self.send_csw(bus)?;
            }
        }
        Ok(())
    }

    fn on_cmd_complete<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        ep_addr: EndpointAddress,
        xferred_bytes: usize,
    ) -> Result<(), Error> {
        // an IN completion while waiting for a command is the status of a
        // previous op, ignore it
        if ep_addr != self.ep_out {
            return Ok(());
        }

        self.fetch_rx(bus, xferred_bytes.min(CBW_LEN))?;

        let cbw = if xferred_bytes == CBW_LEN {
            Cbw::parse(&self.buf.borrow()[..CBW_LEN])
        } else {
            None
        };

        let Some(cbw) = cbw else {
            // spec. 6.6.1: invalid CBW, stall both endpoints until reset
            // recovery
            warning!("usb: msc: Invalid CBW ({} bytes)", xferred_bytes);
            self.stage = Stage::NeedReset;
            bus.stall(self.ep_in);
            bus.stall(self.ep_out);
            return Ok(());
        };

        debug!(
            "usb: msc: Command {=u8:x} len {} [Lun {}]",
            cbw.command[0],
            cbw.cmd_len,
            cbw.lun
        );

        self.cbw = cbw;
        self.csw = Csw {
            tag: cbw.tag,
            data_residue: 0,
            status: CommandStatus::Passed,
        };

        // parse the command and prepare the data phase
        self.stage = Stage::Data;
        self.total_len = cbw.total_bytes;
        self.xferred_len = 0;

        match ScsiOpcode::try_from_primitive(cbw.command[0]) {
            Ok(ScsiOpcode::Read10) | Ok(ScsiOpcode::Write10) => {
                let status = validate_rdwr10(&self.cbw);
                if status != CommandStatus::Passed {
                    self.fail_scsi_op(bus, status);
                } else if self.cbw.total_bytes != 0 {
                    if cbw.command[0] == ScsiOpcode::Read10 as u8 {
                        self.stream_read10(bus)?;
                    } else {
                        self.start_write10(bus)?;
                    }
                } else {
                    // no data transfer, only seen from compliance suites
                    self.stage = Stage::Status;
                }
            }

            _ => {
                if cbw.total_bytes > 0 && !cbw.dir_in {
                    // queue the OUT payload first, the command is handled
                    // once it arrived
                    if cbw.total_bytes as usize > self.buf.borrow().len() {
                        debug!("usb: msc: Reject OUT command with large data");
                        self.fail_scsi_op(bus, CommandStatus::Failed);
                    } else {
                        // case 9 (Ho > Dn) is not checked here; receiving
                        // the data and then failing is acceptable
                        bus.xfer_out(self.ep_out, self.total_len as usize)?;
                        self.pending_rx = true;
                    }
                } else {
                    let mut resplen = scsi::process_builtin(
                        &mut self.device,
                        &mut self.sense,
                        cbw.lun,
                        &cbw.command,
                        self.buf.borrow_mut(),
                    );

                    // not built-in: offer it to the application
                    if resplen.is_none() && !self.sense.is_set() {
                        resplen =
                            self.device
                                .vendor_command(cbw.lun, &cbw.command, self.buf.borrow_mut());
                    }

                    match resplen {
                        None => {
                            debug!("usb: msc: Unsupported or failed command");
                            self.fail_scsi_op(bus, CommandStatus::Failed);
                        }
                        Some(0) => {
                            if self.cbw.total_bytes > 0 {
                                // case 4 (Hi > Dn)
                                self.fail_scsi_op(bus, CommandStatus::Failed);
                            } else {
                                // case 1 (Hn = Dn)
                                self.stage = Stage::Status;
                            }
                        }
                        Some(n) => {
                            if self.cbw.total_bytes == 0 {
                                // case 2 (Hn < Di)
                                self.fail_scsi_op(bus, CommandStatus::Failed);
                            } else {
                                // never return more than the host expects
                                self.total_len = n.min(self.cbw.total_bytes);
                                let len = self.total_len as usize;
                                bus.xfer_in(self.ep_in, &self.buf.borrow()[..len])?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_data_complete<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        xferred_bytes: usize,
    ) -> Result<(), Error> {
        trace!("usb: msc: Data [Lun {}]: {} bytes", self.cbw.lun, xferred_bytes);

        match ScsiOpcode::try_from_primitive(self.cbw.command[0]) {
            Ok(ScsiOpcode::Read10) => {
                self.xferred_len += xferred_bytes as u32;
                if self.xferred_len >= self.total_len {
                    self.stage = Stage::Status;
                } else {
                    self.stream_read10(bus)?;
                }
            }

            Ok(ScsiOpcode::Write10) => self.on_write10_data(bus, xferred_bytes)?,

            _ => {
                self.fetch_rx(bus, xferred_bytes)?;
                self.xferred_len += xferred_bytes as u32;

                // OUT data of a non streaming command has arrived
                if !self.cbw.dir_in {
                    let total = self.total_len as usize;
                    let resplen = self.device.vendor_command(
                        self.cbw.lun,
                        &self.cbw.command,
                        &mut self.buf.borrow_mut()[..total],
                    );
                    if resplen.is_none() {
                        debug!("usb: msc: Unsupported command");
                        self.fail_scsi_op(bus, CommandStatus::Failed);
                    }
                }

                if self.xferred_len >= self.total_len {
                    self.stage = Stage::Status;
                } else if self.stage == Stage::Data {
                    // commands needing more than one transfer were
                    // rejected at the command stage
                    self.fail_scsi_op(bus, CommandStatus::PhaseError);
                }
            }
        }
        Ok(())
    }

    fn on_status_sent<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        ep_addr: EndpointAddress,
        xferred_bytes: usize,
    ) -> Result<(), Error> {
        if ep_addr == self.ep_in && xferred_bytes == CSW_LEN {
            trace!("usb: msc: Status [Lun {}] = {}", self.cbw.lun, self.csw.status);

            match ScsiOpcode::try_from_primitive(self.cbw.command[0]) {
                Ok(ScsiOpcode::Read10) => self.device.read_complete(self.cbw.lun),
                Ok(ScsiOpcode::Write10) => self.device.write_complete(self.cbw.lun),
                _ => self.device.command_complete(self.cbw.lun, &self.cbw.command),
            }

            self.prepare_cbw(bus)?;
        } else {
            // any other transfer ending here is an unknown error
            warning!("usb: msc: Expected CSW completion, got {} bytes", xferred_bytes);
        }
        Ok(())
    }

    /// One READ(10) chunk: asks the application for the next stretch of
    /// blocks and queues it on the IN endpoint
    fn stream_read10<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), Error> {
        let block_size = scsi::rdwr10_block_size(&self.cbw.command, self.cbw.total_bytes);
        let lba = scsi::rdwr10_lba(&self.cbw.command) + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;

        // remaining bytes capped at the staging buffer
        let buf_len = self.buf.borrow().len() as u32;
        let nbytes = (self.cbw.total_bytes - self.xferred_len).min(buf_len) as usize;

        self.pending_io = true;
        let status = self.device.read(
            self.cbw.lun,
            lba,
            offset,
            &mut self.buf.borrow_mut()[..nbytes],
        );
        if status != IoStatus::Async {
            self.pending_io = false;
            self.read_io_data(bus, status)?;
        }
        Ok(())
    }

    fn read_io_data<B: UsbdBus>(&mut self, bus: &mut B, status: IoStatus) -> Result<(), Error> {
        match status {
            IoStatus::Bytes(n) if n > 0 => {
                bus.xfer_in(self.ep_in, &self.buf.borrow()[..n as usize])?;
            }
            IoStatus::Bytes(_) | IoStatus::Busy => {
                // not ready yet: synthesize a completion so this driver
                // is entered again
                bus.notify_xfer_complete(self.ep_in, 0);
            }
            IoStatus::Error => {
                debug!("usb: msc: IO read failed");
                self.sense.set_medium_not_present();
                self.fail_scsi_op(bus, CommandStatus::Failed);
            }
            IoStatus::Async => {}
        }
        Ok(())
    }

    /// One WRITE(10) chunk: checks write protection and arms the OUT
    /// endpoint for the next stretch of host data
    fn start_write10<B: UsbdBus>(&mut self, bus: &mut B) -> Result<(), Error> {
        if !self.device.is_writable(self.cbw.lun) {
            self.sense
                .set(scsi::SENSE_KEY_DATA_PROTECT, 0x27, 0x00);
            self.fail_scsi_op(bus, CommandStatus::Failed);
            return Ok(());
        }

        let buf_len = self.buf.borrow().len() as u32;
        let nbytes = (self.cbw.total_bytes - self.xferred_len).min(buf_len) as usize;

        bus.xfer_out(self.ep_out, nbytes)?;
        self.pending_rx = true;
        Ok(())
    }

    /// Host data of a WRITE(10) chunk arrived; hand it to the application
    fn on_write10_data<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        xferred_bytes: usize,
    ) -> Result<(), Error> {
        self.fetch_rx(bus, xferred_bytes)?;

        let block_size = scsi::rdwr10_block_size(&self.cbw.command, self.cbw.total_bytes);
        let lba = scsi::rdwr10_lba(&self.cbw.command) + self.xferred_len / block_size;
        let offset = self.xferred_len % block_size;

        self.pending_io = true;
        let status = self.device.write(
            self.cbw.lun,
            lba,
            offset,
            &self.buf.borrow()[..xferred_bytes],
        );
        if status != IoStatus::Async {
            self.pending_io = false;
            self.write_io_data(bus, xferred_bytes, status)?;
        }
        Ok(())
    }

    fn write_io_data<B: UsbdBus>(
        &mut self,
        bus: &mut B,
        xferred_bytes: usize,
        status: IoStatus,
    ) -> Result<(), Error> {
        match status {
            IoStatus::Error => {
                debug!("usb: msc: IO write failed");
                self.sense.set_medium_not_present();
                self.fail_scsi_op(bus, CommandStatus::Failed);
            }
            IoStatus::Async => {}
            IoStatus::Busy | IoStatus::Bytes(_) => {
                let consumed = match status {
                    IoStatus::Bytes(n) => (n as usize).min(xferred_bytes),
                    _ => 0,
                };

                if consumed < xferred_bytes {
                    // the application consumed only part of the chunk;
                    // count what it took, move the rest up front and
                    // offer it again with adjusted lba and offset
                    let left_over = xferred_bytes - consumed;
                    if consumed > 0 {
                        self.xferred_len += consumed as u32;
                        self.buf
                            .borrow_mut()
                            .copy_within(consumed..xferred_bytes, 0);
                    }
                    bus.notify_xfer_complete(self.ep_out, left_over);
                } else {
                    self.xferred_len += xferred_bytes as u32;
                    if self.xferred_len >= self.total_len {
                        self.stage = Stage::Status;
                    } else {
                        // receive more host data
                        self.start_write10(bus)?;
                    }
                }
            }
        }
        Ok(())
    }
}
