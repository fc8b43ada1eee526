use usbd_msc::scsi::{BlockDevice, InquiryStrings, IoStatus, CDB_LEN};

/// How the next read/write calls should behave
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoMode {
    Normal,
    /// Report busy this many times, then serve normally
    Busy(u32),
    /// Report asynchronous completion; the test finishes the operation
    /// through `async_io_done`
    Async,
    Error,
}

/// An in-memory block device with scripting knobs for the protocol
/// corner cases
pub struct RamDisk {
    pub data: Vec<u8>,
    pub block_size: u16,
    pub ready: bool,
    pub writable: bool,
    pub read_mode: IoMode,
    pub write_mode: IoMode,
    /// consume at most this many bytes per write call
    pub write_chunk_limit: Option<usize>,
    /// response served for commands outside the built-in set
    pub vendor_response: Option<Vec<u8>>,
    /// captured parameters of an async read request
    pub pending_read: Option<(u32, u32, usize)>,
    pub reads_completed: usize,
    pub writes_completed: usize,
}

impl RamDisk {
    pub fn new(blocks: usize, block_size: u16) -> Self {
        RamDisk {
            data: vec![0u8; blocks * usize::from(block_size)],
            block_size,
            ready: true,
            writable: true,
            read_mode: IoMode::Normal,
            write_mode: IoMode::Normal,
            write_chunk_limit: None,
            vendor_response: None,
            pending_read: None,
            reads_completed: 0,
            writes_completed: 0,
        }
    }

    pub fn block_at(&self, lba: u32) -> &[u8] {
        let bs = usize::from(self.block_size);
        &self.data[lba as usize * bs..][..bs]
    }

    fn byte_offset(&self, lba: u32, offset: u32) -> usize {
        lba as usize * usize::from(self.block_size) + offset as usize
    }
}

impl BlockDevice for RamDisk {
    fn capacity(&mut self, _lun: u8) -> (u32, u16) {
        if self.ready {
            (
                (self.data.len() / usize::from(self.block_size)) as u32,
                self.block_size,
            )
        } else {
            (0, 0)
        }
    }

    fn read(&mut self, _lun: u8, lba: u32, offset: u32, buf: &mut [u8]) -> IoStatus {
        match self.read_mode {
            IoMode::Busy(0) => self.read_mode = IoMode::Normal,
            IoMode::Busy(n) => {
                self.read_mode = IoMode::Busy(n - 1);
                return IoStatus::Busy;
            }
            IoMode::Async => {
                self.pending_read = Some((lba, offset, buf.len()));
                return IoStatus::Async;
            }
            IoMode::Error => return IoStatus::Error,
            IoMode::Normal => {}
        }

        let start = self.byte_offset(lba, offset);
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        IoStatus::Bytes(buf.len() as u32)
    }

    fn write(&mut self, _lun: u8, lba: u32, offset: u32, buf: &[u8]) -> IoStatus {
        match self.write_mode {
            IoMode::Busy(0) => self.write_mode = IoMode::Normal,
            IoMode::Busy(n) => {
                self.write_mode = IoMode::Busy(n - 1);
                return IoStatus::Busy;
            }
            IoMode::Async => return IoStatus::Async,
            IoMode::Error => return IoStatus::Error,
            IoMode::Normal => {}
        }

        let count = self.write_chunk_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        let start = self.byte_offset(lba, offset);
        self.data[start..start + count].copy_from_slice(&buf[..count]);
        IoStatus::Bytes(count as u32)
    }

    fn test_unit_ready(&mut self, _lun: u8) -> bool {
        self.ready
    }

    fn is_writable(&mut self, _lun: u8) -> bool {
        self.writable
    }

    fn inquiry_strings(&mut self, _lun: u8) -> InquiryStrings {
        InquiryStrings {
            vendor: *b"RAMDISK ",
            product: *b"UNIT TEST MEDIUM",
            revision: *b"1.0 ",
        }
    }

    fn vendor_command(&mut self, _lun: u8, _cdb: &[u8; CDB_LEN], buf: &mut [u8]) -> Option<u32> {
        let response = self.vendor_response.as_ref()?;
        let len = response.len().min(buf.len());
        buf[..len].copy_from_slice(&response[..len]);
        Some(len as u32)
    }

    fn read_complete(&mut self, _lun: u8) {
        self.reads_completed += 1;
    }

    fn write_complete(&mut self, _lun: u8) {
        self.writes_completed += 1;
    }
}
