use rama::telemetry::tracing;

pub use libc::rlim_t;

/// Raises the soft open-files limit towards `target`, capped by the hard
/// limit, and returns the soft limit in effect afterwards.
pub fn raise_nofile(target: rlim_t) -> std::io::Result<rlim_t> {
    use std::{io, mem};

    // SAFETY: `lim` is a plain C struct fully written by getrlimit before use.
    unsafe {
        let mut lim: libc::rlimit = mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            return Err(io::Error::last_os_error());
        }

        let new_soft = target.min(lim.rlim_max);
        if lim.rlim_cur >= new_soft {
            tracing::debug!(
                current = lim.rlim_cur,
                requested = target,
                "ulimit: current soft limit suffices",
            );
            return Ok(lim.rlim_cur);
        }

        let previous = lim.rlim_cur;
        lim.rlim_cur = new_soft;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!(previous, applied = new_soft, "ulimit: raised open files soft limit");

        Ok(new_soft)
    }
}
