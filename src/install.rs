use std::path::Path;
use std::process::Command;

const UNIT_PATH: &str = "/etc/systemd/system/gem.service";

/// Install the supervisor as a systemd service running `gem api start`.
pub fn install() -> anyhow::Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("failed to resolve executable path: {e}"))?;
    let exe = std::fs::canonicalize(&exe).unwrap_or(exe);

    let unit = render_unit(&exe.display().to_string());
    std::fs::write(UNIT_PATH, unit)
        .map_err(|e| anyhow::anyhow!("failed to write {UNIT_PATH} (are you root?): {e}"))?;

    for args in [
        &["daemon-reload"][..],
        &["enable", "gem.service"],
        &["start", "gem.service"],
    ] {
        let status = Command::new("systemctl")
            .args(args)
            .status()
            .map_err(|e| anyhow::anyhow!("failed to run systemctl {}: {e}", args.join(" ")))?;
        anyhow::ensure!(
            status.success(),
            "systemctl {} exited with {status}",
            args.join(" ")
        );
    }
    println!("installed and started gem.service");
    Ok(())
}

fn render_unit(exe: &str) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
    let workdir = Path::new(exe)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    format!(
        "[Unit]\n\
         Description=Gem Process Supervisor\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={exe} api start\n\
         Restart=always\n\
         RestartSec=5\n\
         User={user}\n\
         WorkingDirectory={workdir}\n\
         Environment=PATH=/usr/local/bin:/usr/bin:/bin\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_points_at_api_start() {
        let unit = render_unit("/usr/local/bin/gem");
        assert!(unit.contains("ExecStart=/usr/local/bin/gem api start"));
        assert!(unit.contains("WorkingDirectory=/usr/local/bin"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }
}
