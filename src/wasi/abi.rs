//! `wasi_snapshot_preview1` constants and guest memory access.

pub type Errno = u16;

pub mod errno {
    use super::Errno;

    pub const SUCCESS: Errno = 0;
    pub const BADF: Errno = 8;
    pub const EXIST: Errno = 20;
    pub const FAULT: Errno = 21;
    pub const FBIG: Errno = 22;
    pub const ILSEQ: Errno = 25;
    pub const INVAL: Errno = 28;
    pub const IO: Errno = 29;
    pub const ISDIR: Errno = 31;
    pub const NOENT: Errno = 44;
    pub const NOSYS: Errno = 52;
    pub const NOTDIR: Errno = 54;
    pub const NOTEMPTY: Errno = 55;
    pub const NOTSUP: Errno = 58;
    pub const SPIPE: Errno = 70;
    pub const NOTCAPABLE: Errno = 76;
}

pub mod filetype {
    pub const UNKNOWN: u8 = 0;
    pub const CHARACTER_DEVICE: u8 = 2;
    pub const DIRECTORY: u8 = 3;
    pub const REGULAR_FILE: u8 = 4;
}

pub mod oflags {
    pub const CREAT: u16 = 1;
    pub const DIRECTORY: u16 = 2;
    pub const EXCL: u16 = 4;
    pub const TRUNC: u16 = 8;
}

pub mod fdflags {
    pub const APPEND: u16 = 1;
}

pub mod whence {
    pub const SET: u8 = 0;
    pub const CUR: u8 = 1;
    pub const END: u8 = 2;
}

pub mod clock {
    pub const REALTIME: u32 = 0;
    pub const MONOTONIC: u32 = 1;
    pub const PROCESS_CPUTIME: u32 = 2;
    pub const THREAD_CPUTIME: u32 = 3;
}

pub mod eventtype {
    pub const CLOCK: u8 = 0;
    pub const FD_READ: u8 = 1;
    pub const FD_WRITE: u8 = 2;
}

pub const RIGHTS_ALL: u64 = 0x1FFF_FFFF;
pub const PREOPEN_TYPE_DIR: u8 = 0;
pub const DIRENT_HEADER_LEN: usize = 24;
pub const FILESTAT_LEN: usize = 64;
pub const SUBSCRIPTION_LEN: u32 = 48;
pub const EVENT_LEN: u32 = 32;

/// `filestat` as laid out in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filestat {
    pub ino: u64,
    pub filetype: u8,
    pub size: u64,
}

impl Filestat {
    pub fn encode(&self) -> [u8; FILESTAT_LEN] {
        let mut out = [0u8; FILESTAT_LEN];
        out[8..16].copy_from_slice(&self.ino.to_le_bytes());
        out[16] = self.filetype;
        out[24..32].copy_from_slice(&1u64.to_le_bytes());
        out[32..40].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Bounds-checked view of a module's linear memory
pub struct GuestMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    fn range(&self, ptr: u32, len: usize) -> Result<std::ops::Range<usize>, Errno> {
        let start = ptr as usize;
        let end = start.checked_add(len).ok_or(errno::FAULT)?;
        if end > self.bytes.len() {
            return Err(errno::FAULT);
        }
        Ok(start..end)
    }

    pub fn slice(&self, ptr: u32, len: u32) -> Result<&[u8], Errno> {
        let range = self.range(ptr, len as usize)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], Errno> {
        let range = self.range(ptr, len as usize)?;
        Ok(&mut self.bytes[range])
    }

    pub fn write(&mut self, ptr: u32, data: &[u8]) -> Result<(), Errno> {
        let range = self.range(ptr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, ptr: u32) -> Result<u32, Errno> {
        let raw = self.slice(ptr, 4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&self, ptr: u32) -> Result<u64, Errno> {
        let raw = self.slice(ptr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u16(&self, ptr: u32) -> Result<u16, Errno> {
        let raw = self.slice(ptr, 2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn read_u8(&self, ptr: u32) -> Result<u8, Errno> {
        Ok(self.slice(ptr, 1)?[0])
    }

    pub fn write_u8(&mut self, ptr: u32, value: u8) -> Result<(), Errno> {
        self.write(ptr, &[value])
    }

    pub fn write_u16(&mut self, ptr: u32, value: u16) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, ptr: u32, value: u64) -> Result<(), Errno> {
        self.write(ptr, &value.to_le_bytes())
    }

    /// UTF-8 path or name passed by the guest
    pub fn read_str(&self, ptr: u32, len: u32) -> Result<String, Errno> {
        let raw = self.slice(ptr, len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| errno::ILSEQ)
    }

    /// `(buf, buf_len)` pairs of an iovec array
    pub fn iovecs(&self, iovs: u32, count: u32) -> Result<Vec<(u32, u32)>, Errno> {
        (0..count)
            .map(|i| -> Result<(u32, u32), Errno> {
                let at = iovs.checked_add(i.checked_mul(8).ok_or(errno::FAULT)?).ok_or(errno::FAULT)?;
                let len_at = at.checked_add(4).ok_or(errno::FAULT)?;
                Ok((self.read_u32(at)?, self.read_u32(len_at)?))
            })
            .collect()
    }

    /// Concatenate the contents of an iovec array
    pub fn gather(&self, iovs: u32, count: u32) -> Result<Vec<u8>, Errno> {
        let mut out = Vec::new();
        for (ptr, len) in self.iovecs(iovs, count)? {
            out.extend_from_slice(self.slice(ptr, len)?);
        }
        Ok(out)
    }

    /// Spread `data` across an iovec array, returning bytes placed
    pub fn scatter(&mut self, iovs: u32, count: u32, data: &[u8]) -> Result<usize, Errno> {
        let mut placed = 0;
        for (ptr, len) in self.iovecs(iovs, count)? {
            if placed == data.len() {
                break;
            }
            let take = (len as usize).min(data.len() - placed);
            self.write(ptr, &data[placed..placed + take])?;
            placed += take;
        }
        Ok(placed)
    }

    /// Total capacity of an iovec array
    pub fn capacity(&self, iovs: u32, count: u32) -> Result<usize, Errno> {
        Ok(self
            .iovecs(iovs, count)?
            .iter()
            .map(|(_, len)| *len as usize)
            .sum())
    }
}
