// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use imm::adapters::cli::format::format_result;
use imm::adapters::cli::{Cmd, ManifestArgs};
use imm::adapters::credentials::TokenCredentials;
use imm::adapters::progress::TracingProgress;
use imm::adapters::shell::ShellTransport;
use imm::adapters::time::SystemClock;
use imm::adapters::{cli, manifest};
use imm::app::services::batch::{BatchConfig, BatchMode};
use imm::app::types::{BatchOperationItem, BatchOperationResult};
use imm::app::usecases::UseCases;
use imm::{config, logging};

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::info!(
            path = %path.display(),
            source = source.as_str(),
            present = report.config_file_present,
            "config path"
        ),
        (Some(path), None) => tracing::info!(
            path = %path.display(),
            present = report.config_file_present,
            "config path"
        ),
        (None, _) => tracing::info!("config path: (none)"),
    }
    tracing::info!(
        value = %report.shell_program.value.display(),
        source = report.shell_program.source.as_str(),
        "config shell.program"
    );
    tracing::info!(
        value = %report.token_source.value,
        source = report.token_source.source.as_str(),
        "config credentials"
    );
    tracing::info!(
        value = report.concurrency.value,
        source = report.concurrency.source.as_str(),
        "config batch.concurrency"
    );
    tracing::info!(
        value = report.max_retries.value,
        source = report.max_retries.source.as_str(),
        "config batch.max_retries"
    );
    tracing::info!(
        value = report.stop_on_first_blocker.value,
        source = report.stop_on_first_blocker.source.as_str(),
        "config batch.stop_on_first_blocker"
    );
    tracing::info!(
        value = report.verbose.value,
        source = report.verbose.source.as_str(),
        "config verbose"
    );
}

fn load_requests(input: &ManifestArgs) -> anyhow::Result<Option<Vec<BatchOperationItem>>> {
    match manifest::read_manifest(&input.manifest, input.operation) {
        Ok(requests) => Ok(Some(
            requests.into_iter().map(BatchOperationItem::new).collect(),
        )),
        Err(manifest::ManifestError::Invalid(problems)) => {
            eprintln!("{}: manifest is invalid", input.manifest.display());
            for problem in problems {
                eprintln!("  {problem}");
            }
            Ok(None)
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to load {}", input.manifest.display()))
        }
    }
}

fn print_result(result: &BatchOperationResult, json: bool, all_issues: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", format_result(result, all_issues));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let parsed = cli::parse_opts();
    let opts = parsed.opts;

    let overrides = match &opts.command {
        Cmd::Template { operation } => {
            print!("{}", manifest::template(*operation));
            return Ok(ExitCode::SUCCESS);
        }
        Cmd::Validate { .. } => config::Overrides {
            verbose: parsed.verbose_override,
            ..config::Overrides::default()
        },
        Cmd::Run {
            concurrency,
            max_retries,
            stop_on_first_blocker,
            ..
        } => config::Overrides {
            concurrency: *concurrency,
            max_retries: *max_retries,
            stop_on_first_blocker: stop_on_first_blocker.then_some(true),
            verbose: parsed.verbose_override,
        },
    };

    let config::LoadResult { config, report } =
        config::load_with_report(opts.config.clone(), overrides)?;
    logging::init(config.verbose);
    log_config_report(&report);

    let (input, json, mode) = match &opts.command {
        Cmd::Validate { input, json } => (input, *json, BatchMode::ValidateOnly),
        Cmd::Run { input, json, .. } => (input, *json, BatchMode::Execute),
        Cmd::Template { .. } => return Ok(ExitCode::SUCCESS),
    };
    let Some(items) = load_requests(input)? else {
        return Ok(ExitCode::from(2));
    };

    let clock = Arc::new(SystemClock);
    let credentials = Arc::new(TokenCredentials::new(&config.credentials, clock.clone()));
    let transport = Arc::new(ShellTransport::new(&config.shell));
    let core = UseCases::new(transport, credentials, clock, config.core_settings());

    if let Err(err) = core.connect().await {
        tracing::error!(code = err.code(), error = %err, "could not open the remote session");
        return Err(err).context("failed to connect");
    }

    let batch = BatchConfig {
        mode,
        ..config.batch
    };
    let id = core.submit_batch(items, batch)?;

    let canceller = core.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(batch = %id, "interrupt received, cancelling");
            if let Err(err) = canceller.cancel(id).await {
                tracing::warn!(batch = %id, error = %err, "cancel failed");
            }
        }
    });

    let outcome = core.run(id, Arc::new(TracingProgress)).await;
    interrupt.abort();
    core.disconnect().await;
    let result = outcome?;

    print_result(&result, json, mode == BatchMode::ValidateOnly)?;
    let clean = match mode {
        BatchMode::ValidateOnly => result.failed == 0 && result.skipped == 0,
        BatchMode::Execute => result.failed == 0,
    };
    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
