//! Host state behind the preview1 imports: descriptor table over the
//! in-memory mounts plus the redirected stdio sinks.

use super::abi::{clock, errno, eventtype, fdflags, filetype, oflags, whence, Errno, Filestat};
use crate::stdio::{OutputSink, Redirect};
use crate::virtual_fs::{Directory, Entry, MountTable};
use rand::RngCore;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const STDIN: u32 = 0;
pub const STDOUT: u32 = 1;
pub const STDERR: u32 = 2;
pub const FIRST_PREOPEN: u32 = 3;

/// File growth allowed when the invocation sets no memory cap
pub const DEFAULT_FILE_BUDGET: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
enum Descriptor {
    Stdin,
    Output(Stream),
    Dir {
        mount: usize,
        path: Vec<String>,
        preopen: bool,
    },
    File {
        mount: usize,
        path: Vec<String>,
        position: u64,
        append: bool,
    },
}

enum Node<'a> {
    Dir(&'a Directory),
    File(&'a [u8]),
}

/// A parsed `poll_oneoff` subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Clock {
        userdata: u64,
        id: u32,
        timeout: u64,
        absolute: bool,
    },
    Fd {
        userdata: u64,
        fd: u32,
        kind: u8,
    },
}

/// The invocation deadline passed while the guest was blocked in the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded;

/// A `poll_oneoff` event to report back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub userdata: u64,
    pub error: Errno,
    pub kind: u8,
}

pub struct WasiHost {
    args: Vec<String>,
    env: Vec<String>,
    mounts: MountTable,
    fds: HashMap<u32, Descriptor>,
    next_fd: u32,
    stdout: OutputSink,
    stderr: OutputSink,
    started: Instant,
    deadline: Option<Instant>,
    file_budget: u64,
}

impl WasiHost {
    pub fn new(
        args: Vec<String>,
        env: Vec<String>,
        mounts: MountTable,
        stdout: Redirect,
        stderr: Redirect,
    ) -> Self {
        let mut fds = HashMap::new();
        fds.insert(STDIN, Descriptor::Stdin);
        fds.insert(STDOUT, Descriptor::Output(Stream::Stdout));
        fds.insert(STDERR, Descriptor::Output(Stream::Stderr));
        for index in 0..mounts.len() {
            fds.insert(
                FIRST_PREOPEN + index as u32,
                Descriptor::Dir {
                    mount: index,
                    path: Vec::new(),
                    preopen: true,
                },
            );
        }

        Self {
            args,
            env,
            next_fd: FIRST_PREOPEN + mounts.len() as u32,
            mounts,
            fds,
            stdout: OutputSink::new(stdout),
            stderr: OutputSink::new(stderr),
            started: Instant::now(),
            deadline: None,
            file_budget: DEFAULT_FILE_BUDGET,
        }
    }

    /// Blocking host calls give up once `deadline` passes
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Total bytes the guest may add to files across the invocation.
    /// Shrinking a file returns its bytes to the budget.
    pub fn set_file_budget(&mut self, bytes: u64) {
        self.file_budget = bytes;
    }

    pub fn file_budget(&self) -> u64 {
        self.file_budget
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Flush stdio and hand back `(stdout, stderr, mounts)`
    pub fn finish(self) -> (String, String, MountTable) {
        (self.stdout.finish(), self.stderr.finish(), self.mounts)
    }

    fn alloc_fd(&mut self, descriptor: Descriptor) -> u32 {
        while self.fds.contains_key(&self.next_fd) {
            self.next_fd += 1;
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, descriptor);
        fd
    }

    fn root(&self, mount: usize) -> Result<&Directory, Errno> {
        self.mounts
            .by_index(mount)
            .map(|m| &m.root)
            .ok_or(errno::BADF)
    }

    fn root_mut(&mut self, mount: usize) -> Result<&mut Directory, Errno> {
        self.mounts
            .by_index_mut(mount)
            .map(|m| &mut m.root)
            .ok_or(errno::BADF)
    }

    fn node(&self, mount: usize, path: &[String]) -> Result<Node<'_>, Errno> {
        let root = self.root(mount)?;
        if path.is_empty() {
            return Ok(Node::Dir(root));
        }
        match root.lookup(path) {
            Some(Entry::Directory(dir)) => Ok(Node::Dir(dir)),
            Some(Entry::File(bytes)) => Ok(Node::File(bytes.as_slice())),
            None => Err(errno::NOENT),
        }
    }

    /// Resolve `path` against a directory descriptor, confined to its mount
    fn resolve(&self, dirfd: u32, path: &str) -> Result<(usize, Vec<String>), Errno> {
        let (mount, mut segments) = match self.fds.get(&dirfd) {
            Some(Descriptor::Dir { mount, path, .. }) => (*mount, path.clone()),
            Some(_) => return Err(errno::NOTDIR),
            None => return Err(errno::BADF),
        };
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(errno::NOTCAPABLE);
                    }
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok((mount, segments))
    }

    fn stat_of(&self, mount: usize, path: &[String]) -> Result<Filestat, Errno> {
        let (kind, size) = match self.node(mount, path)? {
            Node::Dir(dir) => (filetype::DIRECTORY, dir.len() as u64),
            Node::File(bytes) => (filetype::REGULAR_FILE, bytes.len() as u64),
        };
        Ok(Filestat {
            ino: inode(mount, path),
            filetype: kind,
            size,
        })
    }

    pub fn fd_write(&mut self, fd: u32, data: &[u8]) -> Result<usize, Errno> {
        match self.fds.get_mut(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin => Err(errno::BADF),
            Descriptor::Output(Stream::Stdout) => {
                self.stdout.write(data);
                Ok(data.len())
            }
            Descriptor::Output(Stream::Stderr) => {
                self.stderr.write(data);
                Ok(data.len())
            }
            Descriptor::Dir { .. } => Err(errno::ISDIR),
            Descriptor::File {
                mount,
                path,
                position,
                append,
            } => {
                let bytes = file_bytes_mut(&mut self.mounts, *mount, path)?;
                let offset = if *append { bytes.len() as u64 } else { *position };
                write_at(bytes, offset, data, &mut self.file_budget)?;
                *position = offset + data.len() as u64;
                Ok(data.len())
            }
        }
    }

    /// Positional writes only make sense on files; output streams are pipes
    pub fn fd_pwrite(&mut self, fd: u32, data: &[u8], offset: u64) -> Result<usize, Errno> {
        match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin | Descriptor::Output(_) => Err(errno::SPIPE),
            Descriptor::Dir { .. } => Err(errno::ISDIR),
            Descriptor::File { mount, path, .. } => {
                let bytes = file_bytes_mut(&mut self.mounts, *mount, path)?;
                write_at(bytes, offset, data, &mut self.file_budget)?;
                Ok(data.len())
            }
        }
    }

    pub fn fd_read(&mut self, fd: u32, max: usize) -> Result<Vec<u8>, Errno> {
        match self.fds.get_mut(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin => Ok(Vec::new()),
            Descriptor::Output(_) => Err(errno::BADF),
            Descriptor::Dir { .. } => Err(errno::ISDIR),
            Descriptor::File {
                mount,
                path,
                position,
                ..
            } => {
                let bytes = file_bytes(&self.mounts, *mount, path)?;
                let data = read_at(bytes, *position, max);
                *position += data.len() as u64;
                Ok(data)
            }
        }
    }

    pub fn fd_pread(&self, fd: u32, max: usize, offset: u64) -> Result<Vec<u8>, Errno> {
        match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin | Descriptor::Output(_) => Err(errno::SPIPE),
            Descriptor::Dir { .. } => Err(errno::ISDIR),
            Descriptor::File { mount, path, .. } => {
                let bytes = file_bytes(&self.mounts, *mount, path)?;
                Ok(read_at(bytes, offset, max))
            }
        }
    }

    pub fn fd_seek(&mut self, fd: u32, offset: i64, from: u8) -> Result<u64, Errno> {
        match self.fds.get_mut(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin | Descriptor::Output(_) => Err(errno::SPIPE),
            Descriptor::Dir { .. } => Err(errno::BADF),
            Descriptor::File {
                mount,
                path,
                position,
                ..
            } => {
                let base = match from {
                    whence::SET => 0,
                    whence::CUR => *position as i64,
                    whence::END => file_bytes(&self.mounts, *mount, path)?.len() as i64,
                    _ => return Err(errno::INVAL),
                };
                let target = base.checked_add(offset).ok_or(errno::INVAL)?;
                if target < 0 {
                    return Err(errno::INVAL);
                }
                *position = target as u64;
                Ok(*position)
            }
        }
    }

    pub fn fd_close(&mut self, fd: u32) -> Result<(), Errno> {
        self.fds.remove(&fd).map(|_| ()).ok_or(errno::BADF)
    }

    pub fn fd_renumber(&mut self, from: u32, to: u32) -> Result<(), Errno> {
        if !self.fds.contains_key(&to) {
            return Err(errno::BADF);
        }
        let descriptor = self.fds.remove(&from).ok_or(errno::BADF)?;
        self.fds.insert(to, descriptor);
        Ok(())
    }

    /// `(filetype, fdflags)` of a descriptor
    pub fn fd_fdstat(&self, fd: u32) -> Result<(u8, u16), Errno> {
        Ok(match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin => (filetype::CHARACTER_DEVICE, 0),
            Descriptor::Output(_) => (filetype::CHARACTER_DEVICE, fdflags::APPEND),
            Descriptor::Dir { .. } => (filetype::DIRECTORY, 0),
            Descriptor::File { append, .. } => {
                let flags = if *append { fdflags::APPEND } else { 0 };
                (filetype::REGULAR_FILE, flags)
            }
        })
    }

    pub fn fd_fdstat_set_flags(&mut self, fd: u32, flags: u16) -> Result<(), Errno> {
        match self.fds.get_mut(&fd).ok_or(errno::BADF)? {
            Descriptor::File { append, .. } => {
                *append = flags & fdflags::APPEND != 0;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn fd_filestat(&self, fd: u32) -> Result<Filestat, Errno> {
        match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Stdin | Descriptor::Output(_) => Ok(Filestat {
                ino: u64::from(fd) + 1,
                filetype: filetype::CHARACTER_DEVICE,
                size: 0,
            }),
            Descriptor::Dir { mount, path, .. } | Descriptor::File { mount, path, .. } => {
                self.stat_of(*mount, path)
            }
        }
    }

    pub fn fd_filestat_set_size(&mut self, fd: u32, size: u64) -> Result<(), Errno> {
        match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::File { mount, path, .. } => {
                let bytes = file_bytes_mut(&mut self.mounts, *mount, path)?;
                resize_within(bytes, size, &mut self.file_budget)
            }
            Descriptor::Dir { .. } => Err(errno::ISDIR),
            _ => Err(errno::INVAL),
        }
    }

    /// Fails unless `fd` names an open descriptor
    pub fn fd_check(&self, fd: u32) -> Result<(), Errno> {
        self.fds.get(&fd).map(|_| ()).ok_or(errno::BADF)
    }

    /// Mount name of a preopened directory
    pub fn fd_prestat_name(&self, fd: u32) -> Result<&str, Errno> {
        match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Dir {
                mount,
                preopen: true,
                ..
            } => self
                .mounts
                .by_index(*mount)
                .map(|m| m.name.as_str())
                .ok_or(errno::BADF),
            _ => Err(errno::BADF),
        }
    }

    /// Serialized dirents starting at `cookie`, stopping once `limit`
    /// bytes are produced
    pub fn fd_readdir(&self, fd: u32, cookie: u64, limit: usize) -> Result<Vec<u8>, Errno> {
        let (mount, path) = match self.fds.get(&fd).ok_or(errno::BADF)? {
            Descriptor::Dir { mount, path, .. } => (*mount, path),
            Descriptor::File { .. } => return Err(errno::NOTDIR),
            _ => return Err(errno::BADF),
        };
        let Node::Dir(dir) = self.node(mount, path)? else {
            return Err(errno::NOTDIR);
        };

        let mut out = Vec::new();
        let mut child = path.clone();
        for (index, (name, entry)) in dir.iter().enumerate().skip(cookie as usize) {
            if out.len() >= limit {
                break;
            }
            child.push(name.clone());
            let kind = if entry.is_dir() {
                filetype::DIRECTORY
            } else {
                filetype::REGULAR_FILE
            };
            out.extend_from_slice(&(index as u64 + 1).to_le_bytes());
            out.extend_from_slice(&inode(mount, &child).to_le_bytes());
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(&[kind, 0, 0, 0]);
            out.extend_from_slice(name.as_bytes());
            child.pop();
        }
        Ok(out)
    }

    pub fn path_open(&mut self, dirfd: u32, path: &str, open: u16, flags: u16) -> Result<u32, Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        let exclusive = open & oflags::CREAT != 0 && open & oflags::EXCL != 0;
        let append = flags & fdflags::APPEND != 0;

        let existing = match self.node(mount, &segments) {
            Ok(Node::Dir(_)) => Some(true),
            Ok(Node::File(_)) => Some(false),
            Err(errno::NOENT) => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(_) if exclusive => Err(errno::EXIST),
            Some(true) => {
                if open & oflags::TRUNC != 0 {
                    return Err(errno::ISDIR);
                }
                Ok(self.alloc_fd(Descriptor::Dir {
                    mount,
                    path: segments,
                    preopen: false,
                }))
            }
            Some(false) => {
                if open & oflags::DIRECTORY != 0 {
                    return Err(errno::NOTDIR);
                }
                if open & oflags::TRUNC != 0 {
                    let bytes = file_bytes_mut(&mut self.mounts, mount, &segments)?;
                    resize_within(bytes, 0, &mut self.file_budget)?;
                }
                Ok(self.alloc_fd(Descriptor::File {
                    mount,
                    path: segments,
                    position: 0,
                    append,
                }))
            }
            None => {
                if open & oflags::CREAT == 0 {
                    return Err(errno::NOENT);
                }
                if open & oflags::DIRECTORY != 0 {
                    return Err(errno::INVAL);
                }
                let (name, parents) = segments.split_last().ok_or(errno::INVAL)?;
                let parent = self
                    .root_mut(mount)?
                    .dir_at_mut(parents)
                    .ok_or(errno::NOENT)?;
                parent.insert(name.clone(), Entry::file(Vec::new()));
                Ok(self.alloc_fd(Descriptor::File {
                    mount,
                    path: segments,
                    position: 0,
                    append,
                }))
            }
        }
    }

    pub fn path_create_directory(&mut self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        let (name, parents) = segments.split_last().ok_or(errno::EXIST)?;
        let parent = self
            .root_mut(mount)?
            .dir_at_mut(parents)
            .ok_or(errno::NOENT)?;
        if parent.contains(name) {
            return Err(errno::EXIST);
        }
        parent.insert(name.clone(), Entry::Directory(Directory::new()));
        Ok(())
    }

    pub fn path_filestat(&self, dirfd: u32, path: &str) -> Result<Filestat, Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        self.stat_of(mount, &segments)
    }

    /// Succeeds when the path exists; timestamps are not tracked
    pub fn path_touch(&self, dirfd: u32, path: &str) -> Result<(), Errno> {
        self.path_filestat(dirfd, path).map(|_| ())
    }

    pub fn path_unlink_file(&mut self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        match self.node(mount, &segments)? {
            Node::Dir(_) => return Err(errno::ISDIR),
            Node::File(_) => {}
        }
        self.detach(mount, &segments).map(|_| ())
    }

    pub fn path_remove_directory(&mut self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        if segments.is_empty() {
            return Err(errno::INVAL);
        }
        match self.node(mount, &segments)? {
            Node::File(_) => return Err(errno::NOTDIR),
            Node::Dir(dir) if !dir.is_empty() => return Err(errno::NOTEMPTY),
            Node::Dir(_) => {}
        }
        self.detach(mount, &segments).map(|_| ())
    }

    pub fn path_rename(&mut self, fd: u32, old: &str, new_fd: u32, new: &str) -> Result<(), Errno> {
        let (src_mount, src) = self.resolve(fd, old)?;
        let (dst_mount, dst) = self.resolve(new_fd, new)?;
        if src.is_empty() || dst.is_empty() {
            return Err(errno::INVAL);
        }
        if src_mount == dst_mount {
            if src == dst {
                return self.node(src_mount, &src).map(|_| ());
            }
            if dst.len() > src.len() && dst.starts_with(&src) {
                return Err(errno::INVAL);
            }
        }

        let src_is_dir = matches!(self.node(src_mount, &src)?, Node::Dir(_));
        match self.node(dst_mount, &dst) {
            Ok(Node::Dir(_)) if !src_is_dir => return Err(errno::ISDIR),
            Ok(Node::Dir(dir)) if !dir.is_empty() => return Err(errno::NOTEMPTY),
            Ok(Node::File(_)) if src_is_dir => return Err(errno::NOTDIR),
            Ok(_) | Err(errno::NOENT) => {}
            Err(e) => return Err(e),
        }
        let (dst_name, dst_parents) = dst.split_last().ok_or(errno::INVAL)?;
        if self.root(dst_mount)?.dir_at(dst_parents).is_none() {
            return Err(errno::NOENT);
        }

        let entry = self.detach(src_mount, &src)?;
        self.root_mut(dst_mount)?
            .dir_at_mut(dst_parents)
            .ok_or(errno::NOENT)?
            .insert(dst_name.clone(), entry);
        Ok(())
    }

    /// Symlinks do not exist here, so every existing path is "not a link"
    pub fn path_readlink(&self, dirfd: u32, path: &str) -> Result<Vec<u8>, Errno> {
        let (mount, segments) = self.resolve(dirfd, path)?;
        self.node(mount, &segments)?;
        Err(errno::INVAL)
    }

    fn detach(&mut self, mount: usize, segments: &[String]) -> Result<Entry, Errno> {
        let (name, parents) = segments.split_last().ok_or(errno::INVAL)?;
        self.root_mut(mount)?
            .dir_at_mut(parents)
            .and_then(|dir| dir.remove(name))
            .ok_or(errno::NOENT)
    }

    pub fn clock_time(&self, id: u32) -> Result<u64, Errno> {
        match id {
            clock::REALTIME => Ok(chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .max(0) as u64),
            clock::MONOTONIC | clock::PROCESS_CPUTIME | clock::THREAD_CPUTIME => {
                Ok(self.started.elapsed().as_nanos() as u64)
            }
            _ => Err(errno::INVAL),
        }
    }

    pub fn clock_resolution(&self, id: u32) -> Result<u64, Errno> {
        match id {
            clock::REALTIME
            | clock::MONOTONIC
            | clock::PROCESS_CPUTIME
            | clock::THREAD_CPUTIME => Ok(1_000),
            _ => Err(errno::INVAL),
        }
    }

    pub fn fill_random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    /// Fd subscriptions are always ready; with only clocks, block until
    /// the earliest one fires or the deadline passes, whichever is first.
    pub fn poll(&self, subscriptions: &[Subscription]) -> Result<Vec<PollEvent>, DeadlineExceeded> {
        let fd_events: Vec<PollEvent> = subscriptions
            .iter()
            .filter_map(|sub| match sub {
                Subscription::Fd { userdata, fd, kind } => Some(PollEvent {
                    userdata: *userdata,
                    error: match self.fd_check(*fd) {
                        Ok(()) => errno::SUCCESS,
                        Err(e) => e,
                    },
                    kind: *kind,
                }),
                Subscription::Clock { .. } => None,
            })
            .collect();
        if !fd_events.is_empty() {
            return Ok(fd_events);
        }

        let wait = subscriptions
            .iter()
            .filter_map(|sub| match sub {
                Subscription::Clock {
                    id,
                    timeout,
                    absolute,
                    ..
                } => {
                    let delay = if *absolute {
                        timeout.saturating_sub(self.clock_time(*id).unwrap_or(0))
                    } else {
                        *timeout
                    };
                    Some(delay)
                }
                Subscription::Fd { .. } => None,
            })
            .min();
        if let Some(nanos) = wait {
            let wait = Duration::from_nanos(nanos);
            match self.deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if wait >= left {
                        std::thread::sleep(left);
                        return Err(DeadlineExceeded);
                    }
                    std::thread::sleep(wait);
                }
                None => std::thread::sleep(wait),
            }
        }

        Ok(subscriptions
            .iter()
            .filter_map(|sub| match sub {
                Subscription::Clock { userdata, .. } => Some(PollEvent {
                    userdata: *userdata,
                    error: errno::SUCCESS,
                    kind: eventtype::CLOCK,
                }),
                Subscription::Fd { .. } => None,
            })
            .collect())
    }
}

fn file_bytes<'m>(mounts: &'m MountTable, mount: usize, path: &[String]) -> Result<&'m [u8], Errno> {
    let root = &mounts.by_index(mount).ok_or(errno::BADF)?.root;
    match root.lookup(path) {
        Some(Entry::File(bytes)) => Ok(bytes.as_slice()),
        Some(Entry::Directory(_)) => Err(errno::ISDIR),
        None => Err(errno::NOENT),
    }
}

fn file_bytes_mut<'m>(
    mounts: &'m mut MountTable,
    mount: usize,
    path: &[String],
) -> Result<&'m mut Vec<u8>, Errno> {
    let root = &mut mounts.by_index_mut(mount).ok_or(errno::BADF)?.root;
    match root.lookup_mut(path) {
        Some(Entry::File(bytes)) => Ok(Arc::make_mut(bytes)),
        Some(Entry::Directory(_)) => Err(errno::ISDIR),
        None => Err(errno::NOENT),
    }
}

fn read_at(bytes: &[u8], offset: u64, max: usize) -> Vec<u8> {
    let start = (offset.min(bytes.len() as u64)) as usize;
    let end = start.saturating_add(max).min(bytes.len());
    bytes[start..end].to_vec()
}

fn write_at(bytes: &mut Vec<u8>, offset: u64, data: &[u8], budget: &mut u64) -> Result<(), Errno> {
    let end = offset.checked_add(data.len() as u64).ok_or(errno::FBIG)?;
    if (bytes.len() as u64) < end {
        resize_within(bytes, end, budget)?;
    }
    bytes[offset as usize..end as usize].copy_from_slice(data);
    Ok(())
}

/// Growth is charged to `budget` before anything is allocated
fn resize_within(bytes: &mut Vec<u8>, len: u64, budget: &mut u64) -> Result<(), Errno> {
    let current = bytes.len() as u64;
    if len > current {
        let grow = len - current;
        if grow > *budget {
            return Err(errno::FBIG);
        }
        *budget -= grow;
    } else {
        *budget = budget.saturating_add(current - len);
    }
    bytes.resize(len as usize, 0);
    Ok(())
}

/// Stable per-path inode number
fn inode(mount: usize, path: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    mount.hash(&mut hasher);
    path.hash(&mut hasher);
    hasher.finish() | 1
}
