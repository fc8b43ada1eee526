//! SCSI command processing
//!
//! Built-in handlers for the small command set a removable block device
//! needs, plus the [BlockDevice] trait through which the application
//! backs them. Anything not handled here is offered to
//! [BlockDevice::vendor_command].
//!
//! Refer to the SCSI specifications (SPC, SBC, MMC) for the wire formats.

use crate::fmt::debug;
use num_enum::TryFromPrimitive;

/// Length of a command descriptor block as carried in a CBW
pub const CDB_LEN: usize = 16;

/// Length of a standard INQUIRY response
pub const INQUIRY_RESP_LEN: usize = 36;

const READ_CAPACITY10_RESP_LEN: usize = 8;
const READ_FORMAT_CAPACITY_RESP_LEN: usize = 12;
const MODE_SENSE6_RESP_LEN: usize = 4;
const REQUEST_SENSE_RESP_LEN: usize = 18;

/* Sense keys (SPC table 27) */
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;

/// Operation codes of the built-in command set
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScsiOpcode {
    /* SPC */
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    /* SBC */
    StartStopUnit = 0x1B,
    PreventAllowMediumRemoval = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    /* MMC */
    ReadFormatCapacity = 0x23,
}

/// Result of a block device read or write
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoStatus {
    /// Bytes produced (read) or consumed (write).
    ///
    /// `Bytes(0)` is treated as [Busy](IoStatus::Busy).
    Bytes(u32),
    /// Device is not ready yet; the operation is retried with the same
    /// arguments
    Busy,
    /// Unrecoverable error; the command fails with MEDIUM NOT PRESENT
    Error,
    /// The operation completes later via [async_io_done]
    ///
    /// [async_io_done]: crate::bot::MscClass::async_io_done
    Async,
}

/// Sense data of the current or last failed command
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub(crate) fn set(&mut self, key: u8, asc: u8, ascq: u8) {
        self.key = key;
        self.asc = asc;
        self.ascq = ascq;
    }

    pub(crate) fn clear(&mut self) {
        *self = Sense::default();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.key != 0
    }

    /// NOT READY, MEDIUM NOT PRESENT; the default for failed device access
    pub(crate) fn set_medium_not_present(&mut self) {
        self.set(SENSE_KEY_NOT_READY, 0x3A, 0x00);
    }
}

/// Vendor identification strings reported by INQUIRY
#[derive(Debug, Default, Copy, Clone)]
pub struct InquiryStrings {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
}

/// Standard INQUIRY response
///
/// The library presets every field a typical device wants; override what
/// you must in [BlockDevice::inquiry].
#[derive(Debug, Copy, Clone)]
pub struct InquiryResponse {
    /// Peripheral qualifier and device type; 0 = direct access block device
    pub peripheral_device_type: u8,
    pub removable: bool,
    pub version: u8,
    pub response_data_format: u8,
    pub additional_length: u8,
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_rev: [u8; 4],
}

impl Default for InquiryResponse {
    fn default() -> Self {
        InquiryResponse {
            peripheral_device_type: 0,
            removable: true,
            version: 2,
            response_data_format: 2,
            additional_length: (INQUIRY_RESP_LEN - 5) as u8,
            vendor_id: [0; 8],
            product_id: [0; 16],
            product_rev: [0; 4],
        }
    }
}

impl InquiryResponse {
    fn to_bytes(self) -> [u8; INQUIRY_RESP_LEN] {
        let mut raw = [0u8; INQUIRY_RESP_LEN];
        raw[0] = self.peripheral_device_type;
        raw[1] = (self.removable as u8) << 7;
        raw[2] = self.version;
        raw[3] = self.response_data_format & 0x0F;
        raw[4] = self.additional_length;
        raw[8..16].copy_from_slice(&self.vendor_id);
        raw[16..32].copy_from_slice(&self.product_id);
        raw[32..36].copy_from_slice(&self.product_rev);
        raw
    }
}

/// The application side of the Mass Storage class.
///
/// `capacity`, `read` and `write` are required; everything else has a
/// library-supplied default suitable for a simple removable drive.
///
/// `read` and `write` may complete asynchronously by returning
/// [IoStatus::Async] and later calling [async_io_done], or ask to be
/// polled again with [IoStatus::Busy].
///
/// [async_io_done]: crate::bot::MscClass::async_io_done
pub trait BlockDevice {
    /// Reports `(block_count, block_size)` of the unit.
    ///
    /// Return `(0, _)` or `(_, 0)` while no medium is present.
    fn capacity(&mut self, lun: u8) -> (u32, u16);

    /// Reads up to `buf.len()` bytes starting `offset` bytes into block
    /// `lba`
    fn read(&mut self, lun: u8, lba: u32, offset: u32, buf: &mut [u8]) -> IoStatus;

    /// Writes `buf` starting `offset` bytes into block `lba`, returning
    /// how much of it was consumed
    fn write(&mut self, lun: u8, lba: u32, offset: u32, buf: &[u8]) -> IoStatus;

    /// Fills the full INQUIRY response, returning the response length.
    ///
    /// Return 0 to fall back to [inquiry_strings](Self::inquiry_strings).
    fn inquiry(&mut self, _lun: u8, _resp: &mut InquiryResponse) -> u32 {
        0
    }

    /// Vendor identification used when [inquiry](Self::inquiry) is not
    /// overridden
    fn inquiry_strings(&mut self, _lun: u8) -> InquiryStrings {
        InquiryStrings::default()
    }

    fn test_unit_ready(&mut self, _lun: u8) -> bool {
        true
    }

    fn is_writable(&mut self, _lun: u8) -> bool {
        true
    }

    fn start_stop(&mut self, _lun: u8, _power_condition: u8, _start: bool, _load_eject: bool) -> bool {
        true
    }

    fn prevent_allow_medium_removal(&mut self, _lun: u8, _prohibit: bool, _control: u8) -> bool {
        true
    }

    /// Handles a command outside the built-in set, returning the number
    /// of response bytes placed into `buf`.
    ///
    /// For an OUT command `buf` holds the received payload. `None` fails
    /// the command.
    fn vendor_command(&mut self, _lun: u8, _cdb: &[u8; CDB_LEN], _buf: &mut [u8]) -> Option<u32> {
        None
    }

    /// Overrides the REQUEST SENSE response prepared by the library
    fn request_sense(&mut self, _lun: u8, _buf: &mut [u8]) -> Option<u32> {
        None
    }

    /// Number of logical units, at least 1
    fn lun_count(&mut self) -> u8 {
        1
    }

    fn read_complete(&mut self, _lun: u8) {}

    fn write_complete(&mut self, _lun: u8) {}

    fn command_complete(&mut self, _lun: u8, _cdb: &[u8; CDB_LEN]) {}
}

/* READ(10)/WRITE(10) CDB fields; big-endian on the wire */

pub(crate) fn rdwr10_lba(cdb: &[u8; CDB_LEN]) -> u32 {
    u32::from_be_bytes(cdb[2..6].try_into().unwrap())
}

pub(crate) fn rdwr10_block_count(cdb: &[u8; CDB_LEN]) -> u16 {
    u16::from_be_bytes(cdb[7..9].try_into().unwrap())
}

pub(crate) fn rdwr10_block_size(cdb: &[u8; CDB_LEN], total_bytes: u32) -> u32 {
    let block_count = rdwr10_block_count(cdb);
    if block_count == 0 {
        return 0; // invalid block count
    }
    total_bytes / u32::from(block_count)
}

/// Runs a built-in command, returning the number of bytes placed into
/// `buf`, or `None` for an unsupported or failed command. A failure that
/// leaves `sense` unset is reported as ILLEGAL REQUEST by the caller.
///
/// READ(10)/WRITE(10) are not handled here; they are data streaming
/// commands dispatched by the transport.
pub(crate) fn process_builtin<D: BlockDevice>(
    device: &mut D,
    sense: &mut Sense,
    lun: u8,
    cdb: &[u8; CDB_LEN],
    buf: &mut [u8],
) -> Option<u32> {
    let Ok(opcode) = ScsiOpcode::try_from_primitive(cdb[0]) else {
        return None;
    };

    match opcode {
        ScsiOpcode::TestUnitReady => {
            if device.test_unit_ready(lun) {
                Some(0)
            } else {
                if !sense.is_set() {
                    sense.set_medium_not_present();
                }
                None
            }
        }

        ScsiOpcode::StartStopUnit => {
            let power_condition = cdb[4] >> 4;
            let start = (cdb[4] & 0x01) != 0;
            let load_eject = (cdb[4] & 0x02) != 0;

            if device.start_stop(lun, power_condition, start, load_eject) {
                Some(0)
            } else {
                if !sense.is_set() {
                    sense.set_medium_not_present();
                }
                None
            }
        }

        ScsiOpcode::PreventAllowMediumRemoval => {
            let prohibit = (cdb[4] & 0x01) != 0;
            let control = cdb[5];

            if device.prevent_allow_medium_removal(lun, prohibit, control) {
                Some(0)
            } else {
                if !sense.is_set() {
                    sense.set_medium_not_present();
                }
                None
            }
        }

        ScsiOpcode::ReadCapacity10 => {
            let (block_count, block_size) = device.capacity(lun);

            // Zero block size/count means the unit is not ready
            if block_count == 0 || block_size == 0 {
                if !sense.is_set() {
                    sense.set_medium_not_present();
                }
                None
            } else {
                buf[0..4].copy_from_slice(&(block_count - 1).to_be_bytes());
                buf[4..8].copy_from_slice(&u32::from(block_size).to_be_bytes());
                Some(READ_CAPACITY10_RESP_LEN as u32)
            }
        }

        ScsiOpcode::ReadFormatCapacity => {
            let (block_count, block_size) = device.capacity(lun);

            if block_count == 0 || block_size == 0 {
                if !sense.is_set() {
                    sense.set_medium_not_present();
                }
                None
            } else {
                buf[0..3].fill(0);
                buf[3] = 8; // capacity list length
                buf[4..8].copy_from_slice(&block_count.to_be_bytes());
                buf[8] = 2; // formatted media
                buf[9] = 0;
                buf[10..12].copy_from_slice(&block_size.to_be_bytes());
                Some(READ_FORMAT_CAPACITY_RESP_LEN as u32)
            }
        }

        ScsiOpcode::Inquiry => {
            let mut resp = InquiryResponse::default();

            let mut resplen = device.inquiry(lun, &mut resp);
            if resplen == 0 {
                // no full response from the application, ask for strings
                let strings = device.inquiry_strings(lun);
                resp.vendor_id = strings.vendor;
                resp.product_id = strings.product;
                resp.product_rev = strings.revision;
                resplen = INQUIRY_RESP_LEN as u32;
            }

            let resplen = resplen.min(INQUIRY_RESP_LEN as u32);
            buf[..INQUIRY_RESP_LEN].copy_from_slice(&resp.to_bytes());
            Some(resplen)
        }

        ScsiOpcode::ModeSense6 => {
            let write_protected = !device.is_writable(lun);

            buf[0] = (MODE_SENSE6_RESP_LEN - 1) as u8; // mode data length
            buf[1] = 0; // medium type
            buf[2] = (write_protected as u8) << 7;
            buf[3] = 0; // no block descriptors
            Some(MODE_SENSE6_RESP_LEN as u32)
        }

        ScsiOpcode::RequestSense => {
            buf[..REQUEST_SENSE_RESP_LEN].fill(0);
            buf[0] = 0x70 | 0x80; // current error, fixed format, valid
            buf[2] = sense.key & 0x0F;
            buf[7] = (REQUEST_SENSE_RESP_LEN - 8) as u8;
            buf[12] = sense.asc;
            buf[13] = sense.ascq;

            let resplen = device
                .request_sense(lun, buf)
                .unwrap_or(REQUEST_SENSE_RESP_LEN as u32);

            // sense data is cleared once reported
            debug!("usb: msc: Sense reported and cleared: {}", *sense);
            sense.clear();
            Some(resplen)
        }

        ScsiOpcode::Read10 | ScsiOpcode::Write10 => None,
    }
}
