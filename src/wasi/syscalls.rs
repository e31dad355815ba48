//! `wasi_snapshot_preview1` imports wired onto a `WasiHost`.
//!
//! Every call decodes guest pointers through `GuestMemory`, defers to the
//! host and returns an errno. Only `proc_exit` unwinds the guest.

use super::abi::{
    errno, eventtype, Errno, GuestMemory, EVENT_LEN, PREOPEN_TYPE_DIR, RIGHTS_ALL,
    SUBSCRIPTION_LEN,
};
use super::host::{DeadlineExceeded, PollEvent, Subscription, WasiHost};
use super::{ProcExit, StoreState};
use wasmtime::{Caller, Extern, Linker, Trap};

const MODULE: &str = "wasi_snapshot_preview1";

type Ctx<'a> = Caller<'a, StoreState>;

/// Run `f` against guest memory and the host, mapping the outcome to an
/// errno for the guest.
fn with_host<F>(caller: &mut Ctx<'_>, f: F) -> anyhow::Result<i32>
where
    F: FnOnce(&mut GuestMemory<'_>, &mut WasiHost) -> Result<(), Errno>,
{
    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("module does not export its memory"))?;
    let (data, state) = memory.data_and_store_mut(caller);
    let mut mem = GuestMemory::new(data);
    Ok(match f(&mut mem, &mut state.host) {
        Ok(()) => errno::SUCCESS as i32,
        Err(code) => code as i32,
    })
}

/// Errno-only calls that need no memory access
fn host_only<F>(caller: &mut Ctx<'_>, f: F) -> i32
where
    F: FnOnce(&mut WasiHost) -> Result<(), Errno>,
{
    match f(&mut caller.data_mut().host) {
        Ok(()) => errno::SUCCESS as i32,
        Err(code) => code as i32,
    }
}

/// Lay out a string list the way `args_get` and `environ_get` expect
fn write_string_list(
    mem: &mut GuestMemory<'_>,
    items: &[String],
    ptrs: u32,
    buf: u32,
) -> Result<(), Errno> {
    let mut cursor = buf;
    for (index, item) in items.iter().enumerate() {
        let slot = ptrs
            .checked_add(index as u32 * 4)
            .ok_or(errno::FAULT)?;
        mem.write_u32(slot, cursor)?;
        mem.write(cursor, item.as_bytes())?;
        let nul = cursor
            .checked_add(item.len() as u32)
            .ok_or(errno::FAULT)?;
        mem.write_u8(nul, 0)?;
        cursor = nul + 1;
    }
    Ok(())
}

fn list_sizes(
    mem: &mut GuestMemory<'_>,
    items: &[String],
    count_ptr: u32,
    size_ptr: u32,
) -> Result<(), Errno> {
    let size: usize = items.iter().map(|item| item.len() + 1).sum();
    mem.write_u32(count_ptr, items.len() as u32)?;
    mem.write_u32(size_ptr, size as u32)
}

fn read_subscriptions(mem: &GuestMemory<'_>, ptr: u32, count: u32) -> Result<Vec<Subscription>, Errno> {
    (0..count)
        .map(|i| -> Result<Subscription, Errno> {
            let base = i
                .checked_mul(SUBSCRIPTION_LEN)
                .and_then(|offset| ptr.checked_add(offset))
                .ok_or(errno::FAULT)?;
            let field = |offset: u32| base.checked_add(offset).ok_or(errno::FAULT);
            let userdata = mem.read_u64(base)?;
            match mem.read_u8(field(8)?)? {
                eventtype::CLOCK => Ok(Subscription::Clock {
                    userdata,
                    id: mem.read_u32(field(16)?)?,
                    timeout: mem.read_u64(field(24)?)?,
                    absolute: mem.read_u16(field(40)?)? & 1 != 0,
                }),
                kind @ (eventtype::FD_READ | eventtype::FD_WRITE) => Ok(Subscription::Fd {
                    userdata,
                    fd: mem.read_u32(field(16)?)?,
                    kind,
                }),
                _ => Err(errno::INVAL),
            }
        })
        .collect()
}

fn write_events(mem: &mut GuestMemory<'_>, ptr: u32, events: &[PollEvent]) -> Result<(), Errno> {
    for (i, event) in events.iter().enumerate() {
        let base = (i as u32)
            .checked_mul(EVENT_LEN)
            .and_then(|offset| ptr.checked_add(offset))
            .ok_or(errno::FAULT)?;
        mem.write(base, &[0u8; EVENT_LEN as usize])?;
        mem.write_u64(base, event.userdata)?;
        mem.write_u16(base + 8, event.error)?;
        mem.write_u8(base + 10, event.kind)?;
    }
    Ok(())
}

/// Define every supported preview1 import on `linker`
pub fn add_to_linker(linker: &mut Linker<StoreState>) -> anyhow::Result<()> {
    // args and environment
    linker.func_wrap(MODULE, "args_get", |mut caller: Ctx<'_>, argv: i32, buf: i32| {
        with_host(&mut caller, |mem, host| {
            write_string_list(mem, host.args(), argv as u32, buf as u32)
        })
    })?;
    linker.func_wrap(MODULE, "args_sizes_get", |mut caller: Ctx<'_>, count: i32, size: i32| {
        with_host(&mut caller, |mem, host| {
            list_sizes(mem, host.args(), count as u32, size as u32)
        })
    })?;
    linker.func_wrap(MODULE, "environ_get", |mut caller: Ctx<'_>, environ: i32, buf: i32| {
        with_host(&mut caller, |mem, host| {
            write_string_list(mem, host.env(), environ as u32, buf as u32)
        })
    })?;
    linker.func_wrap(MODULE, "environ_sizes_get", |mut caller: Ctx<'_>, count: i32, size: i32| {
        with_host(&mut caller, |mem, host| {
            list_sizes(mem, host.env(), count as u32, size as u32)
        })
    })?;

    // clocks and randomness
    linker.func_wrap(MODULE, "clock_res_get", |mut caller: Ctx<'_>, id: i32, out: i32| {
        with_host(&mut caller, |mem, host| {
            let resolution = host.clock_resolution(id as u32)?;
            mem.write_u64(out as u32, resolution)
        })
    })?;
    linker.func_wrap(
        MODULE,
        "clock_time_get",
        |mut caller: Ctx<'_>, id: i32, _precision: i64, out: i32| {
            with_host(&mut caller, |mem, host| {
                let now = host.clock_time(id as u32)?;
                mem.write_u64(out as u32, now)
            })
        },
    )?;
    linker.func_wrap(MODULE, "random_get", |mut caller: Ctx<'_>, buf: i32, len: i32| {
        with_host(&mut caller, |mem, host| {
            host.fill_random(mem.slice_mut(buf as u32, len as u32)?);
            Ok(())
        })
    })?;

    // descriptors
    linker.func_wrap(
        MODULE,
        "fd_advise",
        |mut caller: Ctx<'_>, fd: i32, _offset: i64, _len: i64, _advice: i32| {
            host_only(&mut caller, |host| host.fd_check(fd as u32))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fd_allocate",
        |_caller: Ctx<'_>, _fd: i32, _offset: i64, _len: i64| errno::NOTSUP as i32,
    )?;
    linker.func_wrap(MODULE, "fd_close", |mut caller: Ctx<'_>, fd: i32| {
        host_only(&mut caller, |host| host.fd_close(fd as u32))
    })?;
    linker.func_wrap(MODULE, "fd_datasync", |mut caller: Ctx<'_>, fd: i32| {
        host_only(&mut caller, |host| host.fd_check(fd as u32))
    })?;
    linker.func_wrap(MODULE, "fd_sync", |mut caller: Ctx<'_>, fd: i32| {
        host_only(&mut caller, |host| host.fd_check(fd as u32))
    })?;
    linker.func_wrap(MODULE, "fd_fdstat_get", |mut caller: Ctx<'_>, fd: i32, out: i32| {
        with_host(&mut caller, |mem, host| {
            let (kind, flags) = host.fd_fdstat(fd as u32)?;
            let out = out as u32;
            mem.write(out, &[0u8; 24])?;
            mem.write_u8(out, kind)?;
            mem.write_u16(out + 2, flags)?;
            mem.write_u64(out + 8, RIGHTS_ALL)?;
            mem.write_u64(out + 16, RIGHTS_ALL)
        })
    })?;
    linker.func_wrap(MODULE, "fd_fdstat_set_flags", |mut caller: Ctx<'_>, fd: i32, flags: i32| {
        host_only(&mut caller, |host| {
            host.fd_fdstat_set_flags(fd as u32, flags as u16)
        })
    })?;
    linker.func_wrap(
        MODULE,
        "fd_fdstat_set_rights",
        |mut caller: Ctx<'_>, fd: i32, _base: i64, _inheriting: i64| {
            host_only(&mut caller, |host| host.fd_check(fd as u32))
        },
    )?;
    linker.func_wrap(MODULE, "fd_filestat_get", |mut caller: Ctx<'_>, fd: i32, out: i32| {
        with_host(&mut caller, |mem, host| {
            let stat = host.fd_filestat(fd as u32)?;
            mem.write(out as u32, &stat.encode())
        })
    })?;
    linker.func_wrap(MODULE, "fd_filestat_set_size", |mut caller: Ctx<'_>, fd: i32, size: i64| {
        host_only(&mut caller, |host| {
            host.fd_filestat_set_size(fd as u32, size as u64)
        })
    })?;
    linker.func_wrap(
        MODULE,
        "fd_filestat_set_times",
        |mut caller: Ctx<'_>, fd: i32, _atim: i64, _mtim: i64, _flags: i32| {
            host_only(&mut caller, |host| host.fd_check(fd as u32))
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fd_pread",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, offset: i64, nread: i32| {
            with_host(&mut caller, |mem, host| {
                let capacity = mem.capacity(iovs as u32, iovs_len as u32)?;
                let data = host.fd_pread(fd as u32, capacity, offset as u64)?;
                let placed = mem.scatter(iovs as u32, iovs_len as u32, &data)?;
                mem.write_u32(nread as u32, placed as u32)
            })
        },
    )?;
    linker.func_wrap(MODULE, "fd_prestat_get", |mut caller: Ctx<'_>, fd: i32, out: i32| {
        with_host(&mut caller, |mem, host| {
            let name_len = host.fd_prestat_name(fd as u32)?.len() as u32;
            let out = out as u32;
            mem.write(out, &[0u8; 8])?;
            mem.write_u8(out, PREOPEN_TYPE_DIR)?;
            mem.write_u32(out + 4, name_len)
        })
    })?;
    linker.func_wrap(
        MODULE,
        "fd_prestat_dir_name",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| {
            with_host(&mut caller, |mem, host| {
                let name = host.fd_prestat_name(fd as u32)?;
                if name.len() > path_len as u32 as usize {
                    return Err(errno::INVAL);
                }
                mem.write(path as u32, name.as_bytes())
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fd_pwrite",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, offset: i64, nwritten: i32| {
            with_host(&mut caller, |mem, host| {
                let data = mem.gather(iovs as u32, iovs_len as u32)?;
                let written = host.fd_pwrite(fd as u32, &data, offset as u64)?;
                mem.write_u32(nwritten as u32, written as u32)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fd_read",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, nread: i32| {
            with_host(&mut caller, |mem, host| {
                let capacity = mem.capacity(iovs as u32, iovs_len as u32)?;
                let data = host.fd_read(fd as u32, capacity)?;
                let placed = mem.scatter(iovs as u32, iovs_len as u32, &data)?;
                mem.write_u32(nread as u32, placed as u32)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "fd_readdir",
        |mut caller: Ctx<'_>, fd: i32, buf: i32, buf_len: i32, cookie: i64, used: i32| {
            with_host(&mut caller, |mem, host| {
                let limit = buf_len as u32 as usize;
                let entries = host.fd_readdir(fd as u32, cookie as u64, limit)?;
                let take = entries.len().min(limit);
                mem.write(buf as u32, &entries[..take])?;
                mem.write_u32(used as u32, take as u32)
            })
        },
    )?;
    linker.func_wrap(MODULE, "fd_renumber", |mut caller: Ctx<'_>, fd: i32, to: i32| {
        host_only(&mut caller, |host| host.fd_renumber(fd as u32, to as u32))
    })?;
    linker.func_wrap(
        MODULE,
        "fd_seek",
        |mut caller: Ctx<'_>, fd: i32, offset: i64, whence: i32, out: i32| {
            with_host(&mut caller, |mem, host| {
                let position = host.fd_seek(fd as u32, offset, whence as u8)?;
                mem.write_u64(out as u32, position)
            })
        },
    )?;
    linker.func_wrap(MODULE, "fd_tell", |mut caller: Ctx<'_>, fd: i32, out: i32| {
        with_host(&mut caller, |mem, host| {
            let position = host.fd_seek(fd as u32, 0, super::abi::whence::CUR)?;
            mem.write_u64(out as u32, position)
        })
    })?;
    linker.func_wrap(
        MODULE,
        "fd_write",
        |mut caller: Ctx<'_>, fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| {
            with_host(&mut caller, |mem, host| {
                let data = mem.gather(iovs as u32, iovs_len as u32)?;
                let written = host.fd_write(fd as u32, &data)?;
                mem.write_u32(nwritten as u32, written as u32)
            })
        },
    )?;

    // paths
    linker.func_wrap(
        MODULE,
        "path_create_directory",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                host.path_create_directory(fd as u32, &path)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_filestat_get",
        |mut caller: Ctx<'_>, fd: i32, _flags: i32, path: i32, path_len: i32, out: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                let stat = host.path_filestat(fd as u32, &path)?;
                mem.write(out as u32, &stat.encode())
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_filestat_set_times",
        |mut caller: Ctx<'_>,
         fd: i32,
         _flags: i32,
         path: i32,
         path_len: i32,
         _atim: i64,
         _mtim: i64,
         _fst_flags: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                host.path_touch(fd as u32, &path)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_link",
        |_caller: Ctx<'_>, _fd: i32, _flags: i32, _old: i32, _old_len: i32, _new_fd: i32, _new: i32, _new_len: i32| {
            errno::NOTSUP as i32
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_open",
        |mut caller: Ctx<'_>,
         fd: i32,
         _dirflags: i32,
         path: i32,
         path_len: i32,
         oflags: i32,
         _rights_base: i64,
         _rights_inheriting: i64,
         fdflags: i32,
         opened: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                let new_fd = host.path_open(fd as u32, &path, oflags as u16, fdflags as u16)?;
                mem.write_u32(opened as u32, new_fd)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_readlink",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32, buf: i32, buf_len: i32, used: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                let target = host.path_readlink(fd as u32, &path)?;
                let take = target.len().min(buf_len as u32 as usize);
                mem.write(buf as u32, &target[..take])?;
                mem.write_u32(used as u32, take as u32)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_remove_directory",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                host.path_remove_directory(fd as u32, &path)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_rename",
        |mut caller: Ctx<'_>, fd: i32, old: i32, old_len: i32, new_fd: i32, new: i32, new_len: i32| {
            with_host(&mut caller, |mem, host| {
                let old = mem.read_str(old as u32, old_len as u32)?;
                let new = mem.read_str(new as u32, new_len as u32)?;
                host.path_rename(fd as u32, &old, new_fd as u32, &new)
            })
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_symlink",
        |_caller: Ctx<'_>, _old: i32, _old_len: i32, _fd: i32, _new: i32, _new_len: i32| {
            errno::NOTSUP as i32
        },
    )?;
    linker.func_wrap(
        MODULE,
        "path_unlink_file",
        |mut caller: Ctx<'_>, fd: i32, path: i32, path_len: i32| {
            with_host(&mut caller, |mem, host| {
                let path = mem.read_str(path as u32, path_len as u32)?;
                host.path_unlink_file(fd as u32, &path)
            })
        },
    )?;

    // scheduling and process
    linker.func_wrap(
        MODULE,
        "poll_oneoff",
        |mut caller: Ctx<'_>, input: i32, output: i32, count: i32, nevents: i32| {
            let mut expired = false;
            let code = with_host(&mut caller, |mem, host| {
                if count <= 0 {
                    return Err(errno::INVAL);
                }
                let subscriptions = read_subscriptions(mem, input as u32, count as u32)?;
                let events = match host.poll(&subscriptions) {
                    Ok(events) => events,
                    Err(DeadlineExceeded) => {
                        expired = true;
                        return Ok(());
                    }
                };
                write_events(mem, output as u32, &events)?;
                mem.write_u32(nevents as u32, events.len() as u32)
            })?;
            // same outcome as the epoch watchdog firing mid-instruction
            if expired {
                return Err(Trap::Interrupt.into());
            }
            Ok(code)
        },
    )?;
    linker.func_wrap(MODULE, "proc_exit", |_caller: Ctx<'_>, code: i32| -> anyhow::Result<()> {
        Err(ProcExit(code).into())
    })?;
    linker.func_wrap(MODULE, "proc_raise", |_caller: Ctx<'_>, _signal: i32| {
        errno::NOSYS as i32
    })?;
    linker.func_wrap(MODULE, "sched_yield", |_caller: Ctx<'_>| {
        std::thread::yield_now();
        errno::SUCCESS as i32
    })?;

    Ok(())
}
