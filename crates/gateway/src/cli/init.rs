//! `agent init` — scaffold a template agent.yaml.

use std::path::Path;

use pa_domain::config;

pub fn init(force: bool) -> anyhow::Result<()> {
    init_in(Path::new(config::DEFAULT_CONFIG_PATH), force)
}

fn init_in(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Re-run with --force to overwrite.",
            path.display()
        );
    }

    std::fs::write(path, config::template_yaml())?;

    eprintln!();
    eprintln!("  Wrote {}", path.display());
    eprintln!();
    eprintln!("  Next steps:");
    eprintln!("    1. Set the provider API key (e.g. export PA_OPENAI_API_KEY=...)");
    eprintln!("    2. Run `agent serve` to start the gateway");
    eprintln!("    3. Run `agent chat` in another terminal");
    eprintln!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");

        init_in(&path, false).unwrap();
        let original = std::fs::read_to_string(&path).unwrap();
        assert!(original.contains("agents:"));

        // Second run without --force fails and leaves the file alone.
        std::fs::write(&path, "customized: true\n").unwrap();
        assert!(init_in(&path, false).is_err());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "customized: true\n"
        );

        // --force overwrites.
        init_in(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }
}
