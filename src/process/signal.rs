use crate::errors::{AppError, AppResult};

/// Non-destructive liveness check.
///
/// EPERM means the pid exists under another owner, so it counts as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Graceful termination of a detached run. The whole session is signalled
/// when the pid leads its own group, so helpers spawned by the CLI stop too.
#[cfg(unix)]
pub fn terminate(pid: u32) -> AppResult<()> {
    send(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
pub fn kill(pid: u32) -> AppResult<()> {
    send(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send(pid: u32, signal: nix::sys::signal::Signal) -> AppResult<()> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    if pid == 0 {
        return Err(AppError::InvalidInput("pid 0 cannot be signalled".to_string()));
    }
    let target = Pid::from_raw(pid as i32);
    if killpg(target, signal).is_ok() {
        return Ok(());
    }
    kill(target, signal)
        .map_err(|error| AppError::execution(format!("Failed to send {:?} to {}: {}", signal, pid, error)))
}

/// Kills every process in the group led by `pgid`. Missing groups are fine.
#[cfg(unix)]
pub fn kill_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if pgid == 0 {
        return;
    }
    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
pub fn terminate(pid: u32) -> AppResult<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
pub fn kill(pid: u32) -> AppResult<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
pub fn kill_group(pgid: u32) {
    let _ = taskkill(pgid, true);
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> AppResult<()> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let status = std::process::Command::new("taskkill").args(&args).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::execution(format!("taskkill failed for {}", pid)))
    }
}
