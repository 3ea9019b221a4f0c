//! Command-line surface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// trellis - deploy and interconnect trusted modules across TEE nodes
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(about = "Deployment orchestrator for networks of trusted modules")]
pub struct Cli {
    /// Verbose output
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Debug output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the binaries of the modules declared in the descriptor
    Build {
        /// Descriptor file describing the network
        config: PathBuf,
        /// Root directory containing the modules and the descriptor
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Build mode of modules, between "debug" and "release"
        #[arg(long, default_value = "debug")]
        mode: String,
        /// Module to build (default: all modules)
        #[arg(long)]
        module: Option<String>,
    },

    /// Deploy a network of modules
    Deploy {
        /// Descriptor file describing the network
        config: PathBuf,
        /// Root directory containing the modules and the descriptor
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Build mode of modules, between "debug" and "release"
        #[arg(long, default_value = "debug")]
        mode: String,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
        /// Output descriptor type, between JSON and YAML
        #[arg(long)]
        output: Option<String>,
        /// Deploy modules in the order they appear in the descriptor
        #[arg(long)]
        deploy_in_order: bool,
        /// Module to deploy (default: all modules not yet deployed)
        #[arg(long)]
        module: Option<String>,
    },

    /// Attest deployed modules
    Attest {
        /// Descriptor file to use
        config: PathBuf,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
        /// Output descriptor type, between JSON and YAML
        #[arg(long)]
        output: Option<String>,
        /// Module to attest (default: all modules not yet attested)
        #[arg(long)]
        module: Option<String>,
    },

    /// Connect deployed and attested modules
    Connect {
        /// Descriptor file to use
        config: PathBuf,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
        /// Output descriptor type, between JSON and YAML
        #[arg(long)]
        output: Option<String>,
        /// Connection to establish, by id or name (default: all not yet established)
        #[arg(long)]
        connection: Option<String>,
    },

    /// Register periodic events
    Register {
        /// Descriptor file to use
        config: PathBuf,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
        /// Output descriptor type, between JSON and YAML
        #[arg(long)]
        output: Option<String>,
        /// Event to register, by id or name (default: all not yet registered)
        #[arg(long)]
        event: Option<String>,
    },

    /// Call an entry point of a deployed module
    Call {
        /// Descriptor file to use
        config: PathBuf,
        /// Name of the module to call
        #[arg(long)]
        module: String,
        /// Name of the entry point to call
        #[arg(long)]
        entry: String,
        /// Argument to pass, as a hex byte array
        #[arg(long)]
        arg: Option<String>,
    },

    /// Trigger the output of a direct connection
    Output {
        /// Descriptor file to use
        config: PathBuf,
        /// Connection to trigger, by id or name
        #[arg(long)]
        connection: String,
        /// Argument to pass, as a hex byte array
        #[arg(long)]
        arg: Option<String>,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
    },

    /// Trigger the request of a direct connection and print the response
    Request {
        /// Descriptor file to use
        config: PathBuf,
        /// Connection to trigger, by id or name
        #[arg(long)]
        connection: String,
        /// Argument to pass, as a hex byte array
        #[arg(long)]
        arg: Option<String>,
        /// File to write the resulting descriptor to (default: overwrite the input)
        #[arg(long)]
        result: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_args() {
        let cli = Cli::parse_from([
            "trellis",
            "--verbose",
            "deploy",
            "network.json",
            "--mode",
            "release",
            "--deploy-in-order",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Deploy {
                config,
                mode,
                deploy_in_order,
                module,
                ..
            } => {
                assert_eq!(config, PathBuf::from("network.json"));
                assert_eq!(mode, "release");
                assert!(deploy_in_order);
                assert!(module.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_request_args() {
        let cli = Cli::parse_from([
            "trellis", "request", "net.yaml", "--connection", "conn3", "--arg", "deadbeef",
        ]);
        match cli.command {
            Command::Request { connection, arg, .. } => {
                assert_eq!(connection, "conn3");
                assert_eq!(arg.as_deref(), Some("deadbeef"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
