//! Per-platform helpers: browser, clipboard, admin check.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};

/// Open the GUI URL in the default browser.
pub fn open_browser(url: &str) -> Result<()> {
    let mut cmd = match std::env::consts::OS {
        "macos" => {
            let mut cmd = Command::new("open");
            cmd.arg(url);
            cmd
        }
        "windows" => {
            let mut cmd = Command::new("cmd");
            cmd.args(["/c", "start", "", url]);
            cmd
        }
        _ => {
            if std::env::var("DISPLAY").unwrap_or_default().is_empty()
                && std::env::var("WAYLAND_DISPLAY").unwrap_or_default().is_empty()
            {
                bail!("DISPLAY/WAYLAND_DISPLAY is empty");
            }
            let mut cmd = Command::new("xdg-open");
            cmd.arg(url);
            cmd
        }
    };
    cmd.stdout(Stdio::null()).stderr(Stdio::null());
    cmd.spawn().context("launch browser")?;
    Ok(())
}

/// Copy text to the system clipboard, trying the platform's tools in order.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        bail!("empty text");
    }

    let candidates: &[(&str, &[&str])] = match std::env::consts::OS {
        "macos" => &[("pbcopy", &[])],
        "windows" => &[(
            "powershell",
            &["-NoProfile", "-Command", "Set-Clipboard -Value $input"],
        )],
        _ => &[
            ("wl-copy", &[]),
            ("xclip", &["-selection", "clipboard"]),
            ("xsel", &["--clipboard", "--input"]),
        ],
    };

    let mut last_err = anyhow!("no clipboard command available");
    for (name, args) in candidates {
        match run_clipboard_command(name, args, text) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn run_clipboard_command(name: &str, args: &[&str], input: &str) -> Result<()> {
    let mut child = Command::new(name)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {name}"))?;
    child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("{name}: no stdin"))?
        .write_all(input.as_bytes())?;
    let output = child.wait_with_output()?;
    if !output.status.success() {
        bail!(
            "{name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Whether the current Windows user holds the Administrator role.
///
/// Queried through PowerShell with a 3 second deadline; the overlay cannot
/// create its adapter without elevation, so a connect attempt is rejected
/// up front rather than left to fail half way in.
#[cfg(windows)]
pub fn is_current_user_admin() -> Result<bool> {
    use std::time::{Duration, Instant};

    let mut child = Command::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent()).IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn administrator check")?;

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match child.try_wait()? {
            Some(_) => break,
            None if Instant::now() > deadline => {
                let _ = child.kill();
                bail!("administrator check timed out");
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }

    let output = child.wait_with_output()?;
    let result = String::from_utf8_lossy(&output.stdout).trim().to_lowercase();
    match result.as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => bail!("unexpected administrator check output: {other:?}"),
    }
}

#[cfg(not(windows))]
pub fn is_current_user_admin() -> Result<bool> {
    Ok(true)
}
