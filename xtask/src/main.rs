//! Developer tasks for the specjit workspace.
//!
//! Usage: `cargo xtask <target> [args...]` where `<target>` is one of `build`, `check`, `clean`,
//! `clippy`, `fmt`, or `test`. Extra arguments are passed through to cargo unchanged.

use std::{
    env,
    path::PathBuf,
    process::{Command, exit},
};

/// A single invocation of cargo (or a cargo wrapper) against the workspace.
#[derive(Debug)]
struct WorkspaceAction<'a> {
    /// The tool we will invoke. Usually cargo.
    tool: String,
    /// Arguments to the above tool.
    tool_args: Vec<&'a str>,
    /// Arguments appended after `tool_args`.
    target_args: Vec<&'a str>,
    /// Actions to run first.
    forced_deps: Vec<Self>,
}

impl<'a> WorkspaceAction<'a> {
    fn new(target: &'a str) -> Result<Self, String> {
        let mut tool = env::var("CARGO").map_err(|_| "CARGO not set".to_owned())?;
        let mut tool_args = Vec::new();
        let mut target_args = vec![target];
        let mut forced_deps = Vec::new();

        match target {
            "build" | "check" | "clean" => (),
            "test" => {
                // The IR dumping code is only compiled with `sjd`: make sure it at least builds.
                target_args.extend(["--features", "specjit/sjd"]);
                forced_deps.push(WorkspaceAction::new("check")?);
            }
            "clippy" => target_args.extend(["--all-targets", "--", "-D", "warnings"]),
            "fmt" => {
                // `cargo fmt` doesn't work for linked toolchains, so go via rustup.
                tool = "rustup".to_owned();
                tool_args.extend(["run", "nightly", "cargo"]);
            }
            _ => return Err(format!("the build system does not support the {target} target")),
        }

        Ok(Self {
            tool,
            tool_args,
            target_args,
            forced_deps,
        })
    }

    fn run(self, extra_args: &[String]) -> Result<(), String> {
        for dep in self.forced_deps {
            dep.run(&[])?;
        }

        let status = Command::new(&self.tool)
            .current_dir(workspace_dir()?)
            .args(self.tool_args)
            .args(self.target_args)
            .args(extra_args)
            .spawn()
            .and_then(|mut x| x.wait())
            .map_err(|e| format!("couldn't run {}: {e}", self.tool))?;

        if !status.success() {
            let pb = PathBuf::from(&self.tool);
            let base = pb
                .iter()
                .next_back()
                .and_then(|x| x.to_str())
                .unwrap_or("cargo");
            return Err(format!("{base} failed with exit code {status}"));
        }
        Ok(())
    }
}

fn workspace_dir() -> Result<PathBuf, String> {
    let this_dir =
        env::var("CARGO_MANIFEST_DIR").map_err(|_| "CARGO_MANIFEST_DIR not set".to_owned())?;
    Ok([&this_dir, ".."].iter().collect::<PathBuf>())
}

fn bail(err_str: String) -> ! {
    eprintln!("xtask: {err_str}");
    exit(1);
}

fn main() {
    let mut args = env::args().skip(1);
    let Some(target) = args.next() else {
        bail("usage: cargo xtask <target> [args...]".to_owned());
    };
    let extra_args = args.collect::<Vec<_>>();
    let act = WorkspaceAction::new(&target).unwrap_or_else(|e| bail(e));
    act.run(&extra_args).unwrap_or_else(|e| bail(e));
}
