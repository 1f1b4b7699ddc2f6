use std::{env, path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use courier::config::channel::ChannelDefinition;

fn parse_args() -> Result<Vec<PathBuf>> {
    let paths: Vec<PathBuf> = env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("Usage: channel_check <channel.yaml> [more channels...]");
    }
    Ok(paths)
}

fn run() -> Result<()> {
    let paths = parse_args()?;
    for path in paths {
        let definition = ChannelDefinition::from_path(&path)
            .with_context(|| format!("invalid channel definition {}", path.display()))?;
        eprintln!("{}", definition.summary());
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
