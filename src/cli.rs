//! CLI argument definitions and the command registry.
//!
//! Commands are plain descriptors collected into a `CommandRegistry` at
//! startup; the registry builds the clap command tree in registration order
//! and dispatches the parsed subcommand back to its descriptor.

use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, ArgMatches, Args, Command, FromArgMatches, ValueEnum};
use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::sdk::SdkManager;

/// Options accepted by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct SharedArgs {
    /// Degree of verbosity (use more v for more verbosity)
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// When using the developer connection, your phone's IP or hostname
    #[arg(long, global = true)]
    pub phone: Option<String>,

    /// Connect directly to a QEMU instance (host:port)
    #[arg(long, global = true)]
    pub qemu: Option<String>,

    /// Connect to a running emulator
    #[arg(long, value_enum, global = true)]
    pub emulator: Option<EmulatorPlatform>,
}

impl SharedArgs {
    /// Log filter for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum EmulatorPlatform {
    Aplite,
    Basalt,
}

impl EmulatorPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aplite => "aplite",
            Self::Basalt => "basalt",
        }
    }
}

/// State handed to a running command.
pub struct CommandContext {
    pub shared: SharedArgs,
    /// `None` when the persist directory could not be set up.
    pub sdk: Option<Arc<SdkManager>>,
}

impl CommandContext {
    pub fn sdk_manager(&self) -> Result<&SdkManager> {
        self.sdk
            .as_deref()
            .ok_or_else(|| anyhow!("The Pebble SDK directory is not available"))
    }
}

/// A subcommand of the `pebble` tool.
pub trait ToolCommand: Send + Sync {
    /// Invocation name, unique across the registry.
    fn name(&self) -> &'static str;

    fn about(&self) -> &'static str;

    /// Add command-specific arguments.
    fn configure(&self, command: Command) -> Command {
        command
    }

    fn run<'a>(&'a self, ctx: &'a CommandContext, matches: &'a ArgMatches) -> BoxFuture<'a, Result<()>>;
}

/// Ordered list of commands; order is the help listing order.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<Box<dyn ToolCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Box<dyn ToolCommand>) -> Result<()> {
        if self.find(command.name()).is_some() {
            bail!("Command '{}' is registered twice", command.name());
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.name()).collect()
    }

    fn find(&self, name: &str) -> Option<&dyn ToolCommand> {
        self.commands
            .iter()
            .find(|c| c.name() == name)
            .map(|c| &**c)
    }

    /// Build the clap command tree.
    pub fn cli(&self) -> Command {
        let mut root = Command::new("pebble")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Pebble SDK command line tool")
            .subcommand_required(true)
            .arg_required_else_help(true);

        for command in &self.commands {
            let sub = command.configure(Command::new(command.name()).about(command.about()));
            root = root.subcommand(SharedArgs::augment_args(sub));
        }

        root
    }

    /// Shared options of the chosen subcommand.
    pub fn shared_args(matches: &ArgMatches) -> Result<SharedArgs> {
        let (_, sub) = matches
            .subcommand()
            .ok_or_else(|| anyhow!("No command given"))?;
        Ok(SharedArgs::from_arg_matches(sub)?)
    }

    /// Run the chosen subcommand.
    pub async fn dispatch(&self, ctx: &CommandContext, matches: &ArgMatches) -> Result<()> {
        let (name, sub) = matches
            .subcommand()
            .ok_or_else(|| anyhow!("No command given"))?;
        let command = self
            .find(name)
            .ok_or_else(|| anyhow!("Unknown command '{name}' (available: {})", self.names().join(", ")))?;
        command.run(ctx, sub).await
    }
}
