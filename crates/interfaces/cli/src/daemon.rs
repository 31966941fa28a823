use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fs2::FileExt;

use soul_config::EngineConfig;
use soul_generator::OllamaGenerator;
use soul_impulse::NullDelivery;
use soul_runtime::EngineContext;

#[derive(Debug, Clone)]
struct DaemonPaths {
    runtime_dir: PathBuf,
    pid_file: PathBuf,
    log_file: PathBuf,
    lock_file: PathBuf,
}

fn daemon_paths(config: &EngineConfig) -> DaemonPaths {
    let runtime_dir = config.soul_root().join(".soul-runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

/// Fork the engine into the background: re-exec ourselves with the daemon
/// marker set and stdout/stderr routed to the log file.
pub fn daemon_start(config: &EngineConfig) -> Result<()> {
    let paths = daemon_paths(config);
    fs::create_dir_all(&paths.runtime_dir)?;

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            bail!("engine already running with pid {pid}; use `soul stop` first");
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;

    let child = Command::new(exe)
        .arg("start")
        .env("SOUL_DAEMON_PROCESS", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    fs::write(&paths.pid_file, child.id().to_string())?;
    println!("engine started");
    println!("- pid: {}", child.id());
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

/// The actual engine process: take the lock, wire the engine, run until a
/// termination signal, then shut down cleanly.
pub fn run_engine_process(config: EngineConfig) -> Result<()> {
    let paths = daemon_paths(&config);
    fs::create_dir_all(&paths.runtime_dir)?;
    let lock_file = File::create(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another engine instance already holds the lock"))?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let generator = Arc::new(OllamaGenerator::from_env()?);
        let engine =
            EngineContext::init(config, generator, Arc::new(NullDelivery)).await?;
        engine.spawn_loops();
        println!("soul engine running (pid {})", std::process::id());

        wait_for_terminate().await?;
        engine.shutdown().await;
        Ok::<(), anyhow::Error>(())
    });

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}

async fn wait_for_terminate() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

pub fn daemon_stop(config: &EngineConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("engine is not running");
        return Ok(());
    };

    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("engine was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    wait_for_pid_exit(pid, Duration::from_secs(10));
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("engine stopped (pid {pid})");
    Ok(())
}

pub fn daemon_status(config: &EngineConfig) -> Result<()> {
    let paths = daemon_paths(config);
    let root = config.soul_root();

    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) => {
            println!("engine status: running");
            println!("- pid: {pid}");
        }
        Some(pid) => {
            println!("engine status: stopped (stale pid {pid})");
        }
        None => println!("engine status: stopped"),
    }

    if let Ok(pulse) = fs::read_to_string(root.join(".soul-pulse")) {
        println!("- pulse: {}", pulse.trim());
    }
    if let Ok(mood) = fs::read_to_string(root.join(".soul-mood")) {
        println!("- mood: {}", mood.trim());
    }
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to terminate engine pid {pid}");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("stop is only implemented on unix in this build")
    }
}

fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::from_millis(0);
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}
