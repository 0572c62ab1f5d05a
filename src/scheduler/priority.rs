/// Drop the calling thread to idle CPU priority so analysis never competes
/// with playback. Best effort: failures are logged and ignored.
pub fn lower_current_thread() {
    #[cfg(target_os = "linux")]
    {
        // Linux applies nice values per thread.
        let rc = unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
            libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, 19)
        };
        if rc != 0 {
            log::debug!(
                "Could not lower worker priority: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
