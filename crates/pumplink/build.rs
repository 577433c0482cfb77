// ── Build-time docs ──
//
// Renders man pages and shell completion scripts for the `pumplink`
// binary into OUT_DIR so packagers can pick them up without running it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_complete::Shell;

// cli.rs only depends on clap + clap_complete (both build-dependencies).
#[path = "src/cli.rs"]
mod cli;

const BIN: &str = "pumplink";
const SHELLS: [Shell; 3] = [Shell::Bash, Shell::Zsh, Shell::Fish];

fn main() -> io::Result<()> {
    println!("cargo::rerun-if-changed=src/cli.rs");

    let Some(out_dir) = std::env::var_os("OUT_DIR").map(PathBuf::from) else {
        return Err(io::Error::other("OUT_DIR not set by Cargo"));
    };

    let mut cmd = cli::Cli::command().name(BIN);
    cmd.build();

    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;
    write_page(&man_dir, BIN, &cmd)?;
    // Two levels deep: `pumplink profile show` becomes pumplink-profile-show.1
    for group in visible(&cmd) {
        let group_name = format!("{BIN}-{}", group.get_name());
        write_page(&man_dir, &group_name, group)?;
        for leaf in visible(group) {
            write_page(&man_dir, &format!("{group_name}-{}", leaf.get_name()), leaf)?;
        }
    }

    let completion_dir = out_dir.join("completions");
    fs::create_dir_all(&completion_dir)?;
    for shell in SHELLS {
        clap_complete::generate_to(shell, &mut cmd, BIN, &completion_dir)?;
    }
    Ok(())
}

fn visible(cmd: &clap::Command) -> impl Iterator<Item = &clap::Command> {
    cmd.get_subcommands()
        .filter(|sub| !sub.is_hide_set() && sub.get_name() != "help")
}

fn write_page(dir: &Path, name: &str, cmd: &clap::Command) -> io::Result<()> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd.clone().name(name.to_owned())).render(&mut buf)?;
    fs::write(dir.join(format!("{name}.1")), buf)
}
