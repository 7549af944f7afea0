use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::Deserialize;

/// Knobs that live in `~/.config/duffel.toml` so they don't have to ride
/// along on every command line.
#[derive(Debug, Default, Deserialize)]
pub struct Configuration {
    /// Where the repository lives when `--repo` and `DUFFEL_DIR` don't say.
    pub repository: Option<Utf8PathBuf>,
    /// Default object compression level (0-9).
    pub compress: Option<i32>,
}

pub fn load() -> Result<Configuration> {
    // No home directory, no config file. That's fine.
    let Some(home) = home::home_dir() else {
        return Ok(Configuration::default());
    };
    let mut confpath: Utf8PathBuf = home.try_into().context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "duffel.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}

/// The repository to use, in falling priority: the `--repo` flag, the
/// `DUFFEL_DIR` environment variable, the config file, `~/.duffel`.
pub fn repository(flag: Option<Utf8PathBuf>, config: &Configuration) -> Result<Utf8PathBuf> {
    if let Some(repo) = flag {
        return Ok(repo);
    }
    if let Ok(dir) = std::env::var("DUFFEL_DIR") {
        return Ok(Utf8PathBuf::from(dir));
    }
    if let Some(repo) = &config.repository {
        return Ok(repo.clone());
    }
    let home: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    Ok(home.join(Utf8Path::new(".duffel")))
}
