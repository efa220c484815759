//! Command line of `corral-init`.
//!
//! The same binary launches containers on the host, serves as the
//! resident init inside them, and runs commands through that init.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};

use crate::exec::ExecRequest;
use crate::exec::client;
use crate::namespace::{LaunchConfig, continue_as_init, launch};

/// Corral container init
#[derive(Parser)]
#[command(name = "corral-init")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Init commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a container and return once its init is up
    Launch {
        /// Run directory for barriers, pid file and control socket
        #[arg(long)]
        run: PathBuf,

        /// Root filesystem of the container
        #[arg(long)]
        root: PathBuf,

        /// Directory holding the lifecycle hooks
        #[arg(long)]
        lib: PathBuf,

        /// Process title of the resident init
        #[arg(long, default_value = "corral")]
        title: String,

        /// Init binary, as seen inside the new root
        #[arg(long, default_value = "/sbin/corral-init")]
        init: PathBuf,
    },

    /// Continue as the resident init after the root swap
    Continue {
        /// Run directory, as seen inside the new root
        #[arg(long)]
        run: PathBuf,

        /// Process title
        #[arg(long, default_value = "corral")]
        title: String,
    },

    /// Run a command inside a container
    Exec {
        /// Control socket of the container
        #[arg(long)]
        socket: PathBuf,

        /// User id to run as
        #[arg(long)]
        uid: Option<u32>,

        /// Environment variable (KEY=VALUE), repeatable
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Working directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
}

impl Cli {
    /// Execute the command. `exec` exits the process with the command's
    /// status; `continue` never returns on success.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub fn execute(self) -> Result<()> {
        match self.command {
            Commands::Launch {
                run,
                root,
                lib,
                title,
                init,
            } => {
                let pid = launch(LaunchConfig {
                    run,
                    root,
                    lib,
                    init,
                    title,
                })?;
                tracing::info!(pid, "Container is up");
                Ok(())
            }
            Commands::Continue { run, title } => match continue_as_init(&run, &title)? {},
            Commands::Exec {
                socket,
                uid,
                env,
                dir,
                argv,
            } => {
                let request = ExecRequest {
                    argv,
                    env: parse_env(&env)?,
                    dir,
                    uid,
                };
                let status = client::exec(
                    &socket,
                    &request,
                    std::io::stdin(),
                    &mut std::io::stdout(),
                    &mut std::io::stderr(),
                )?;
                std::process::exit(status);
            }
        }
    }
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| eyre!("invalid environment variable {pair:?}, expected KEY=VALUE"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_arguments() {
        let cli = Cli::try_parse_from([
            "corral-init",
            "exec",
            "--socket",
            "/run/ctl.sock",
            "--uid",
            "10000",
            "--env",
            "A=1",
            "--env",
            "B=x=y",
            "--",
            "/bin/sh",
            "-c",
            "echo --uid",
        ])
        .unwrap();

        let Commands::Exec { uid, env, argv, .. } = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(uid, Some(10_000));
        assert_eq!(argv, ["/bin/sh", "-c", "echo --uid"]);

        let env = parse_env(&env).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
    }

    #[test]
    fn launch_defaults() {
        let cli = Cli::try_parse_from([
            "corral-init",
            "launch",
            "--run",
            "/c/run",
            "--root",
            "/c/rootfs",
            "--lib",
            "/c/lib",
        ])
        .unwrap();

        let Commands::Launch { init, title, .. } = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(init, PathBuf::from("/sbin/corral-init"));
        assert_eq!(title, "corral");
    }

    #[test]
    fn exec_requires_a_command() {
        assert!(Cli::try_parse_from(["corral-init", "exec", "--socket", "/s"]).is_err());
        assert!(parse_env(&["NOEQUALS".to_string()]).is_err());
    }
}
