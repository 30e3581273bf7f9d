//! Daemon lifecycle management (stop, status).
//!
//! There is no RPC protocol between the CLI and the daemon: the control
//! socket only proves liveness by accepting a connection. `stop` signals the
//! process directly by PID and polls the socket until it disappears.

use vendo_config::Paths;
use vendo_lifecycle::{read_pid_file, DaemonInfo};

/// Stop the daemon.
pub async fn stop_daemon(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let mut info = DaemonInfo::from_paths(paths);
    info.load_pid()?;

    if !info.is_running() {
        println!("vendod is not running");
        info.cleanup()?;
        return Ok(());
    }

    let Some(pid) = info.pid else {
        println!("vendod's control socket is live but no PID file was found, cannot signal it");
        return Ok(());
    };

    println!("stopping vendod (pid {pid})");
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result != 0 {
        return Err(format!("failed to signal pid {pid}: {}", std::io::Error::last_os_error()).into());
    }

    for _ in 0..30 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if !info.is_running() {
            println!("vendod stopped");
            return Ok(());
        }
    }

    println!("vendod did not stop within 3s, sending SIGKILL to pid {pid}");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    info.cleanup()?;
    println!("vendod killed");

    Ok(())
}

/// Check daemon status.
pub async fn check_status(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let info = DaemonInfo::from_paths(paths);

    if !info.is_running() {
        println!("vendod is not running");
        return Ok(());
    }

    println!("vendod is running");
    if let Some(pid) = read_pid_file(&paths.pid_file())? {
        println!("  PID:    {pid}");
    }
    println!("  Socket: {}", paths.socket_file().display());
    println!("  State:  {}", paths.base_dir().display());

    Ok(())
}
