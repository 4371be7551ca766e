use anyhow::{Context, Result, bail};
use std::process::{Command, Stdio};

/// Instrumentation component that loads the server library and calls
/// `nativeRun`, forwarding its `port` argument.
const INSTRUMENTATION: &str = "io.uiautomator.server.test/io.uiautomator.server.Main";
const SERVER_PACKAGE: &str = "io.uiautomator.server";

pub fn start(local_port: u16, device_port: u16) -> Result<()> {
    let state = adb_output(&["get-state"]).context("no device connected")?;
    if state != "device" {
        bail!("adb reports device state '{state}'");
    }

    let local_spec = format!("tcp:{local_port}");
    let remote_spec = format!("tcp:{device_port}");

    let _ = Command::new("adb")
        .args(["forward", "--remove", &local_spec])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let _ = Command::new("adb")
        .args(["shell", "am", "force-stop", SERVER_PACKAGE])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    run(
        "adb",
        &["forward", &local_spec, &remote_spec],
        "configure adb forward",
    )?;

    // `am instrument -w` blocks for the lifetime of the server, so leave it running.
    let port = device_port.to_string();
    let args = instrument_args(&port);
    Command::new("adb")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("start server: failed to spawn {}", format_command("adb", &args)))?;

    eprintln!("debug: instrumentation launched, forwarding {local_spec} -> {remote_spec}");
    Ok(())
}

/// `am instrument` hands `-e` pairs to the instrumentation as its arguments bundle.
fn instrument_args(port: &str) -> [&str; 8] {
    ["shell", "am", "instrument", "-w", "-e", "port", port, INSTRUMENTATION]
}

fn run(cmd: &str, args: &[&str], label: &str) -> Result<()> {
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("{label}: failed to spawn {}", format_command(cmd, args)))?;
    if !status.success() {
        bail!(
            "{}: command failed with status {}: {}",
            label,
            status,
            format_command(cmd, args)
        );
    }
    Ok(())
}

fn adb_output(args: &[&str]) -> Result<String> {
    let output = Command::new("adb")
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", format_command("adb", args)))?;
    if !output.status.success() {
        bail!("{} failed (is a device connected?)", format_command("adb", args));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn format_command(cmd: &str, args: &[&str]) -> String {
    let mut out = String::from(cmd);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}
