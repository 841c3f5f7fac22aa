use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the external audit script, killing it once `timeout` elapses.
///
/// Output is captured to anonymous temp files so a chatty script cannot block
/// on a full pipe.
pub fn run_audit(script: &Path, timeout: Duration) -> Result<()> {
    if !script.exists() {
        bail!("Audit script not found: {}", script.display());
    }
    info!("Running audit script: {}", script.display());

    let mut stdout_capture = tempfile::tempfile().context("failed to create stdout capture")?;
    let mut stderr_capture = tempfile::tempfile().context("failed to create stderr capture")?;
    let mut child = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::from(
            stdout_capture.try_clone().context("failed to clone stdout capture")?,
        ))
        .stderr(Stdio::from(
            stderr_capture.try_clone().context("failed to clone stderr capture")?,
        ))
        .spawn()
        .with_context(|| format!("failed to start audit script {}", script.display()))?;

    let started = Instant::now();
    let status = loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to wait for {}", script.display()))?
        {
            Some(status) => break status,
            None if started.elapsed() > timeout => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("Audit script timed out after {}s", timeout.as_secs());
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let stdout = read_capture(&mut stdout_capture)?;
    let stderr = read_capture(&mut stderr_capture)?;
    debug!(bytes = stdout.len(), "audit script stdout captured");
    if !status.success() {
        bail!("Audit script failed ({status}): {}", stderr.trim());
    }
    info!("Audit completed successfully");
    Ok(())
}

fn read_capture(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))
        .context("failed to rewind output capture")?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .context("failed to read output capture")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
