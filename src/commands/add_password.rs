//! `mobileshell add-password` — registers a new shared password.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;

use crate::auth::AuthStore;
use crate::config::Config;

pub struct AddPasswordArgs {
    pub state_dir: Option<PathBuf>,
    pub from_stdin: bool,
}

pub fn run(args: AddPasswordArgs) -> Result<()> {
    let state_dir = args.state_dir.unwrap_or_else(|| Config::default().state_dir);
    std::fs::create_dir_all(&state_dir).context("creating state directory")?;

    if !args.from_stdin {
        eprintln!("Enter new password (input is not hidden):");
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading password from stdin")?;
    let password = buf.trim_end_matches(['\n', '\r']).to_string();

    let store = AuthStore::new(&state_dir);
    store.add_password(&password)?;
    println!("Password registered.");
    Ok(())
}
