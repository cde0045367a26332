// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::app::types::OperationClass;

pub mod format;

#[derive(Parser, Debug)]
#[command(
    name = "imm",
    version,
    about = "Validate and run bulk operations on inactive mailboxes",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < IMM_CONFIG_PATH < command-line flags.\n\
If --config is omitted, imm tries IMM_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Logging: IMM_LOG (filter), IMM_LOG_FORMAT (json|pretty|compact), IMM_LOG_SPAN_EVENTS, IMM_LOG_FILE. Logs go to stderr."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, imm uses IMM_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Check every manifest row without changing anything remotely
    Validate {
        #[command(flatten)]
        input: ManifestArgs,
        #[arg(long, help = "Print results as JSON instead of a table.")]
        json: bool,
    },
    /// Validate and execute every manifest row
    Run {
        #[command(flatten)]
        input: ManifestArgs,
        #[arg(
            long,
            value_name = "N",
            help = "Items processed at once. Overrides `batch.concurrency` from the config file."
        )]
        concurrency: Option<usize>,
        #[arg(
            long,
            value_name = "N",
            help = "Retries for transient failures per item. Overrides `batch.max_retries` from the config file."
        )]
        max_retries: Option<u32>,
        #[arg(
            long,
            action = clap::ArgAction::SetTrue,
            help = "Cancel the remaining items as soon as one item is blocked by validation."
        )]
        stop_on_first_blocker: bool,
        #[arg(long, help = "Print results as JSON instead of a table.")]
        json: bool,
    },
    /// Print a CSV manifest template
    Template {
        #[arg(long, value_name = "KIND", value_parser = parse_operation)]
        operation: OperationClass,
    },
}

#[derive(clap::Args, Debug)]
pub struct ManifestArgs {
    #[arg(long, value_name = "FILE", help = "CSV manifest with one operation per row.")]
    pub manifest: PathBuf,
    #[arg(
        long,
        value_name = "KIND",
        value_parser = parse_operation,
        help = "Operation for every row: inspect, recovery or restore."
    )]
    pub operation: OperationClass,
}

fn parse_operation(value: &str) -> Result<OperationClass, String> {
    value.parse()
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

const HELP_TEMPLATE: &str = r#"██╗███╗   ███╗███╗   ███╗
██║████╗ ████║████╗ ████║
██║██╔████╔██║██╔████╔██║
██║██║╚██╔╝██║██║╚██╔╝██║
██║██║ ╚═╝ ██║██║ ╚═╝ ██║
╚═╝╚═╝     ╚═╝╚═╝     ╚═╝

{before-help}{about-with-newline}{usage-heading} {usage}
{after-help}

{all-args}
"#;

fn apply_help_template_recursively(cmd: &mut clap::Command) {
    let mut owned = std::mem::take(cmd);
    owned = owned.help_template(HELP_TEMPLATE);
    for sub in owned.get_subcommands_mut() {
        apply_help_template_recursively(sub);
    }
    *cmd = owned;
}

pub fn cli_command() -> clap::Command {
    let mut cmd = Opts::command();
    apply_help_template_recursively(&mut cmd);
    cmd
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    let verbose_override = opts.verbose.then_some(true);
    ParsedOpts {
        opts,
        verbose_override,
    }
}
