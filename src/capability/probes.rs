//! Host probes for the interception primitives.
//!
//! Every probe works on a throwaway resource: a forked child that dies with
//! its seccomp filter, a `/dev/fuse` handle, or a loopback socket. Nothing
//! outlives `exercise`.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use super::{Capability, Probe};

/// `timeout` bounds work a probe hands to other processes; the detector
/// applies its own deadline on top.
pub fn default_probes(timeout: Duration) -> Vec<Arc<dyn Probe>> {
    #[cfg(target_os = "linux")]
    {
        vec![
            Arc::new(linux::SeccompNotifyProbe {
                child_timeout: timeout * 3 / 4,
            }),
            Arc::new(linux::FuseProbe::default()),
            Arc::new(linux::TransparentRedirectProbe::default()),
        ]
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = timeout;
        Capability::ALL
            .into_iter()
            .map(|capability| Arc::new(UnavailableProbe(capability)) as Arc<dyn Probe>)
            .collect()
    }
}

/// Stand-in for platforms without any of the Linux primitives.
pub struct UnavailableProbe(pub Capability);

impl Probe for UnavailableProbe {
    fn capability(&self) -> Capability {
        self.0
    }

    fn advertised(&self) -> bool {
        false
    }

    fn exercise(&self) -> Result<String> {
        Err(anyhow::anyhow!("{} is not available on this platform", self.0))
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::*;
    use anyhow::{anyhow, Context};
    use std::os::fd::AsRawFd;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    /// libseccomp API level that introduced user-space notification.
    const NOTIFY_API_LEVEL: u32 = 5;

    const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
    const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_uint = 1 << 3;
    const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
    const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;

    const BPF_LD: u16 = 0x00;
    const BPF_W: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    const SYSCALL_NR_OFFSET: u32 = 0;

    /// `getppid` goes to a notify listener, everything else is allowed.
    static NOTIFY_FILTER: [libc::sock_filter; 4] = [
        libc::sock_filter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: SYSCALL_NR_OFFSET,
        },
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: libc::SYS_getppid as u32,
        },
        libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_USER_NOTIF,
        },
        libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: SECCOMP_RET_ALLOW,
        },
    ];

    fn last_errno() -> i32 {
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO)
    }

    /// Runs `f` in a forked child and waits at most `timeout` for the status
    /// it reports: 0 for success, otherwise an errno. The parent may have
    /// other threads, so `f` must restrict itself to raw syscalls with no
    /// allocation or locking. A child that misses the deadline is killed;
    /// it is always reaped before this returns.
    pub fn run_in_child(f: fn() -> i32, timeout: Duration) -> Result<()> {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(anyhow!(std::io::Error::last_os_error())).context("probe: pipe failed");
        }

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(anyhow!(err)).context("probe: fork failed");
        }

        if pid == 0 {
            unsafe { libc::close(fds[0]) };
            let status = f().to_le_bytes();
            unsafe {
                libc::write(
                    fds[1],
                    status.as_ptr() as *const libc::c_void,
                    status.len(),
                );
                libc::_exit(0);
            }
        }

        unsafe { libc::close(fds[1]) };
        let report = match wait_readable(fds[0], timeout) {
            Ok(true) => read_status(fds[0]),
            Ok(false) => Err(anyhow!(
                "probe child did not report within {} ms",
                timeout.as_millis()
            )),
            Err(err) => Err(err),
        };
        unsafe { libc::close(fds[0]) };
        if report.is_err() {
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        reap(pid);

        match report? {
            0 => Ok(()),
            errno => Err(anyhow!(std::io::Error::from_raw_os_error(errno))),
        }
    }

    fn wait_readable(fd: libc::c_int, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX);
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc > 0 {
                return Ok(true);
            }
            if rc == 0 {
                return Ok(false);
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                return Err(anyhow!(std::io::Error::from_raw_os_error(errno)))
                    .context("probe: poll failed");
            }
        }
    }

    fn read_status(fd: libc::c_int) -> Result<i32> {
        let mut buf = [0u8; 4];
        let mut offset = 0;
        while offset < buf.len() {
            let rc = unsafe {
                libc::read(
                    fd,
                    buf[offset..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - offset,
                )
            };
            if rc < 0 && last_errno() == libc::EINTR {
                continue;
            }
            if rc <= 0 {
                return Err(anyhow!("probe child exited without a report"));
            }
            offset += rc as usize;
        }
        Ok(i32::from_le_bytes(buf))
    }

    fn reap(pid: libc::pid_t) {
        let mut status = 0;
        loop {
            let rc = unsafe { libc::waitpid(pid, &mut status as *mut libc::c_int, 0) };
            if rc >= 0 || last_errno() != libc::EINTR {
                return;
            }
        }
    }

    /// Child side of the notify probe. Raw syscalls only.
    fn install_notify_filter() -> i32 {
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            return last_errno();
        }
        let prog = libc::sock_fprog {
            len: NOTIFY_FILTER.len() as libc::c_ushort,
            filter: NOTIFY_FILTER.as_ptr() as *mut libc::sock_filter,
        };
        let listener = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_NEW_LISTENER,
                &prog as *const libc::sock_fprog,
            )
        };
        if listener < 0 {
            return last_errno();
        }
        0
    }

    /// seccomp user notification, required by the command shim.
    ///
    /// Some runtimes report a notify-capable libseccomp yet reject the filter
    /// at load time, so the probe installs a real notify filter in a child
    /// and asks for its listener fd.
    pub struct SeccompNotifyProbe {
        pub child_timeout: Duration,
    }

    impl Probe for SeccompNotifyProbe {
        fn capability(&self) -> Capability {
            Capability::CommandNotify
        }

        fn advertised(&self) -> bool {
            libseccomp::get_api() >= NOTIFY_API_LEVEL
        }

        fn exercise(&self) -> Result<String> {
            run_in_child(install_notify_filter, self.child_timeout)
                .context("notify filter with listener rejected")?;
            Ok(format!(
                "notify filter installed (libseccomp api {})",
                libseccomp::get_api()
            ))
        }
    }

    /// FUSE device access, required by the filesystem shim.
    pub struct FuseProbe {
        pub device: PathBuf,
    }

    impl Default for FuseProbe {
        fn default() -> Self {
            Self {
                device: PathBuf::from("/dev/fuse"),
            }
        }
    }

    impl Probe for FuseProbe {
        fn capability(&self) -> Capability {
            Capability::FsIntercept
        }

        fn advertised(&self) -> bool {
            self.device.exists()
        }

        fn exercise(&self) -> Result<String> {
            let handle = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.device)
                .with_context(|| format!("cannot open {}", self.device.display()))?;
            drop(handle);
            Ok(format!("{} opened read-write", self.device.display()))
        }
    }

    /// Transparent redirection (netfilter + IP_TRANSPARENT), required by the
    /// network shim.
    pub struct TransparentRedirectProbe {
        pub markers: Vec<PathBuf>,
    }

    impl Default for TransparentRedirectProbe {
        fn default() -> Self {
            Self {
                markers: vec![
                    PathBuf::from("/proc/net/ip_tables_names"),
                    PathBuf::from("/proc/sys/net/netfilter"),
                ],
            }
        }
    }

    impl Probe for TransparentRedirectProbe {
        fn capability(&self) -> Capability {
            Capability::NetIntercept
        }

        fn advertised(&self) -> bool {
            self.markers.iter().any(|marker| Path::new(marker).exists())
        }

        fn exercise(&self) -> Result<String> {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")
                .context("cannot bind loopback probe socket")?;
            let one: libc::c_int = 1;
            let rc = unsafe {
                libc::setsockopt(
                    listener.as_raw_fd(),
                    libc::SOL_IP,
                    libc::IP_TRANSPARENT,
                    &one as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(anyhow!(std::io::Error::last_os_error()))
                    .context("IP_TRANSPARENT rejected");
            }
            Ok("transparent socket option accepted".to_string())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn succeed() -> i32 {
            0
        }

        fn refuse() -> i32 {
            libc::EPERM
        }

        fn stall() -> i32 {
            loop {
                unsafe { libc::pause() };
            }
        }

        #[test]
        fn child_status_is_reported() {
            run_in_child(succeed, Duration::from_secs(5)).expect("child report");
            let err = run_in_child(refuse, Duration::from_secs(5))
                .expect_err("child errno should surface");
            assert_eq!(
                err.downcast_ref::<std::io::Error>()
                    .and_then(|e| e.raw_os_error()),
                Some(libc::EPERM)
            );
        }

        #[test]
        fn stalled_child_is_killed_and_reaped_at_the_deadline() {
            let started = Instant::now();
            let err = run_in_child(stall, Duration::from_millis(100))
                .expect_err("stalled child should time out");
            assert!(err.to_string().contains("did not report"));
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn missing_fuse_device_is_not_advertised() {
            let probe = FuseProbe {
                device: PathBuf::from("/nonexistent/fuse"),
            };
            assert!(!probe.advertised());
            assert!(probe.exercise().is_err());
        }
    }
}
