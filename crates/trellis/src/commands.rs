//! Subcommand handlers
//!
//! Every handler that mutates deployment state flushes the descriptor even
//! when the operation fails, so a subsequent run resumes from whatever the
//! remote side already observed.

use anyhow::{bail, Context};
use std::path::{Path, PathBuf};
use tracing::info;

use trellis_deploy::descriptor::DescriptorFormat;
use trellis_deploy::{BuildContext, BuildMode, Config};

use crate::cli::Command;

/// Build directory; artifacts are cache shared across invocations.
const BUILD_DIR: &str = "build";

pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Build {
            config,
            workspace,
            mode,
            module,
        } => {
            info!("Building {}", config.display());
            let ctx = enter_workspace(&workspace, &mode)?;
            let conf = Config::load(&config, None)?;

            let outcome = conf.build(&ctx, module.as_deref()).await;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Deploy {
            config,
            workspace,
            mode,
            result,
            output,
            deploy_in_order,
            module,
        } => {
            info!("Deploying {}", config.display());
            let ctx = enter_workspace(&workspace, &mode)?;
            let conf = Config::load(&config, parse_output(output)?)?;

            let outcome = conf.deploy(&ctx, deploy_in_order, module.as_deref()).await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Attest {
            config,
            result,
            output,
            module,
        } => {
            info!("Attesting modules");
            let ctx = default_context()?;
            let conf = Config::load(&config, parse_output(output)?)?;

            let outcome = conf.attest(&ctx, module.as_deref()).await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Connect {
            config,
            result,
            output,
            connection,
        } => {
            info!("Connecting modules");
            let ctx = default_context()?;
            let conf = Config::load(&config, parse_output(output)?)?;

            let outcome = conf.connect(&ctx, connection.as_deref()).await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Register {
            config,
            result,
            output,
            event,
        } => {
            info!("Registering periodic events");
            let ctx = default_context()?;
            let conf = Config::load(&config, parse_output(output)?)?;

            let outcome = conf.register(&ctx, event.as_deref()).await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Call {
            config,
            module,
            entry,
            arg,
        } => {
            info!("Calling {module}:{entry}");
            let ctx = default_context()?;
            let conf = Config::load(&config, None)?;
            let arg = parse_arg(arg)?;

            let target = conf.get_module(&module)?;
            let outcome = target
                .node()
                .call(target, &entry, arg.as_deref(), &ctx)
                .await;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Output {
            config,
            connection,
            arg,
            result,
        } => {
            info!("Triggering output of connection {connection}");
            let ctx = default_context()?;
            let conf = Config::load(&config, None)?;
            let arg = parse_arg(arg)?;

            let conn = conf.get_connection(&connection)?;
            if !conn.direct {
                bail!("connection {} is not direct", conn.name);
            }
            if conn.to_input.is_none() {
                bail!("connection {} is not an output-input connection", conn.name);
            }

            let outcome = conn
                .to_module
                .node()
                .output(conn, arg.as_deref(), &ctx)
                .await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;
            Ok(outcome?)
        }

        Command::Request {
            config,
            connection,
            arg,
            result,
        } => {
            info!("Triggering request of connection {connection}");
            let ctx = default_context()?;
            let conf = Config::load(&config, None)?;
            let arg = parse_arg(arg)?;

            let conn = conf.get_connection(&connection)?;
            if !conn.direct {
                bail!("connection {} is not direct", conn.name);
            }
            if conn.to_handler.is_none() {
                bail!("connection {} is not a request-handler connection", conn.name);
            }

            let outcome = conn
                .to_module
                .node()
                .request(conn, arg.as_deref(), &ctx)
                .await;
            checkpoint(&conf, result.as_deref(), &config)?;
            conf.cleanup(&ctx).await;

            let response = outcome?;
            println!("{}", hex::encode(response));
            Ok(())
        }
    }
}

fn enter_workspace(workspace: &Path, mode: &str) -> anyhow::Result<BuildContext> {
    std::env::set_current_dir(workspace)
        .with_context(|| format!("cannot enter workspace {}", workspace.display()))?;
    Ok(BuildContext::new(
        BuildMode::from_str_tag(mode)?,
        PathBuf::from(BUILD_DIR),
    )?)
}

fn default_context() -> anyhow::Result<BuildContext> {
    Ok(BuildContext::new(
        BuildMode::Debug,
        PathBuf::from(BUILD_DIR),
    )?)
}

fn parse_output(output: Option<String>) -> anyhow::Result<Option<DescriptorFormat>> {
    Ok(match output {
        Some(tag) => Some(DescriptorFormat::from_str_tag(&tag)?),
        None => None,
    })
}

fn parse_arg(arg: Option<String>) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(match arg {
        Some(hex_str) => Some(hex::decode(&hex_str).context("--arg must be a hex byte array")?),
        None => None,
    })
}

/// Write the descriptor back, even after a failed operation: partial progress
/// already took effect on the remote side and must not be lost.
fn checkpoint(conf: &Config, result: Option<&Path>, input: &Path) -> anyhow::Result<()> {
    let out = result.unwrap_or(input);
    info!("Writing post-deployment configuration to {}", out.display());
    conf.dump(out)?;
    Ok(())
}
