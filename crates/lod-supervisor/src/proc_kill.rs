//! Platform seam for process-tree termination. Children are spawned into
//! their own process group (POSIX) so one signal reaches the whole tree;
//! Windows goes through `taskkill /T`. A target that is already gone counts
//! as success on both platforms.

use std::io;

#[cfg(unix)]
pub fn terminate_tree(pgid: i32) -> io::Result<()> {
    signal_group(pgid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn kill_tree(pgid: i32) -> io::Result<()> {
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: i32) -> io::Result<()> {
    // Negative pid addresses the whole process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(error)
}

#[cfg(windows)]
pub fn terminate_tree(pid: i32) -> io::Result<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
pub fn kill_tree(pid: i32) -> io::Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: i32, force: bool) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    let output = cmd.output()?;
    // 128: no process with that pid.
    if output.status.success() || output.status.code() == Some(128) {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("taskkill exited with {}", output.status),
    ))
}
