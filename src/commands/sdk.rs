//! SDK management commands

use anyhow::Result;
use clap::{ArgMatches, Args, Command, FromArgMatches, Subcommand};
use futures_util::future::BoxFuture;

use crate::cli::{CommandContext, ToolCommand};
use crate::sdk::SdkManager;

#[derive(Args, Debug)]
struct SdkArgs {
    #[command(subcommand)]
    action: Option<SdkAction>,
}

#[derive(Subcommand, Debug)]
enum SdkAction {
    /// List installed SDKs
    List,

    /// Select an installed SDK
    Activate { version: String },

    /// Show or set the release channel used for update checks
    Channel { channel: Option<String> },
}

pub struct SdkCommand;

impl ToolCommand for SdkCommand {
    fn name(&self) -> &'static str {
        "sdk"
    }

    fn about(&self) -> &'static str {
        "Manage installed SDKs"
    }

    fn configure(&self, command: Command) -> Command {
        SdkArgs::augment_args(command)
    }

    fn run<'a>(&'a self, ctx: &'a CommandContext, matches: &'a ArgMatches) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = SdkArgs::from_arg_matches(matches)?;
            cmd_sdk(ctx.sdk_manager()?, args.action.unwrap_or(SdkAction::List))
        })
    }
}

fn cmd_sdk(sdk: &SdkManager, action: SdkAction) -> Result<()> {
    match action {
        SdkAction::List => {
            let versions = sdk.list_local_sdk_versions()?;
            let current = sdk.get_current_sdk();

            println!("Installed SDKs:\n");
            if versions.is_empty() {
                println!("  No SDKs installed");
                return Ok(());
            }
            for version in versions {
                if current.as_deref() == Some(version.as_str()) {
                    println!("  {version} (active)");
                } else {
                    println!("  {version}");
                }
            }
        }
        SdkAction::Activate { version } => {
            sdk.set_current_sdk(&version)?;
            println!("Now using SDK {version}");
        }
        SdkAction::Channel { channel: None } => {
            let channel = sdk.get_channel();
            if channel.is_empty() {
                println!("Channel: (default)");
            } else {
                println!("Channel: {channel}");
            }
        }
        SdkAction::Channel {
            channel: Some(channel),
        } => {
            sdk.set_channel(&channel)?;
            println!("Channel set to: {channel}");
        }
    }

    Ok(())
}
