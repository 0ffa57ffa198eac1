use anyhow::{Context, Result};
use stepconf::cli::commands::{flag_values, CheckStepActiveCommand, GetConfigCommand};
use stepconf::cli::output::*;
use stepconf::cli::{Cli, Command};
use stepconf::conditions::{DocumentStepConfigs, RunConfig, StageDefinition};
use stepconf::core::{
    open_local_file, ConfigDocuments, ResolutionContext, StepConfig, StepConfigRequest, StepData,
};
use stepconf::secrets::kv::VAULT_TOKEN_ENV;
use stepconf::secrets::trust::TRUST_ENGINE_TOKEN_ENV;
use stepconf::secrets::{SecretResolver, TrustClient, TrustConfig, VaultClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // stdout carries JSON only
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::GetConfig(cmd) => get_config(&cli, cmd).await?,
        Command::CheckStepActive(cmd) => check_step_active(&cli, cmd)?,
    }

    Ok(())
}

fn read_metadata(path: &str) -> Result<StepData> {
    let reader = open_local_file(path).with_context(|| format!("Failed to open step metadata {}", path))?;
    StepData::from_reader(path, reader).with_context(|| format!("Failed to read step metadata {}", path))
}

fn load_documents(cli: &Cli) -> Result<ConfigDocuments> {
    ConfigDocuments::load(Some(cli.config.as_str()), &cli.defaults, &open_local_file)
        .context("Failed to load configuration")
}

async fn get_config(cli: &Cli, cmd: &GetConfigCommand) -> Result<()> {
    let metadata = read_metadata(&cmd.metadata)?;
    let documents = load_documents(cli)?;
    let ctx = ResolutionContext::from_process();

    let step_name = cmd
        .step_name
        .clone()
        .unwrap_or_else(|| metadata.metadata.name.clone());
    let flags = flag_values(&metadata, &cmd.param).context("Invalid --param value")?;
    let request = StepConfigRequest::new(&cmd.stage_name, &step_name)
        .with_metadata(&metadata)
        .with_param_json(&cmd.param_json)
        .with_flags(flags)
        .with_ignore_custom_defaults(cli.ignore_custom_defaults);

    let mut step_config = StepConfig::resolve(&documents, &request, &ctx)
        .with_context(|| format!("Failed to resolve configuration of step {}", step_name))?;

    if cmd.resolve_secrets {
        resolve_secrets(cmd, &mut step_config, &metadata, &ctx).await?;
    }

    let json = serde_json::to_string_pretty(&step_config.config)?;
    match &cmd.output_file {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {}", path))?;
            eprintln!("{} Configuration written to {}", INFO, style(path).bold());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn resolve_secrets(
    cmd: &GetConfigCommand,
    step_config: &mut StepConfig,
    metadata: &StepData,
    ctx: &ResolutionContext,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut resolver = SecretResolver::new(ctx.secrets.clone()).with_cancellation(cancel);

    let vault_token = ctx.env.get(VAULT_TOKEN_ENV).filter(|t| !t.is_empty());
    match vault_token.and_then(|token| VaultClient::from_config(&step_config.config, token)) {
        Some(client) => resolver = resolver.with_kv_store(Arc::new(client)),
        None => debug!("KV store not configured"),
    }

    let trust_token = ctx.env.get(TRUST_ENGINE_TOKEN_ENV).filter(|t| !t.is_empty());
    match trust_token.and_then(|token| TrustConfig::from_hook_config(&step_config.hook_config, token)) {
        Some(config) => resolver = resolver.with_token_issuer(Arc::new(TrustClient::new(config))),
        None => debug!("Trust engine not configured"),
    }

    let resolved = resolver
        .resolve(step_config, metadata.parameters())
        .await
        .context("Failed to resolve secrets")?;
    for secret in &resolved {
        eprintln!("{}", format_resolved_secret(secret));
    }
    // the printed configuration points into this directory
    if let Some(dir) = resolver.persist_secret_files() {
        eprintln!(
            "{} Secret files written to {}, remove them once the step has run",
            WARN,
            style(dir.display()).bold()
        );
    }

    let exports = resolver
        .credential_exports(&step_config.config)
        .await
        .context("Failed to read credentials")?;
    if let Some(path) = &cmd.credentials_env_file {
        let content: String = exports
            .iter()
            .map(|export| format!("{}={}\n", export.name, export.value))
            .collect();
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path))?;
        eprintln!(
            "{} {} credential variable(s) written to {}",
            INFO,
            style(exports.len()).cyan(),
            style(path).bold()
        );
    } else if !exports.is_empty() {
        eprintln!(
            "{} {} credential variable(s) found, use --credentials-env-file to export them",
            WARN,
            exports.len()
        );
    }
    Ok(())
}

fn check_step_active(cli: &Cli, cmd: &CheckStepActiveCommand) -> Result<()> {
    let reader = open_local_file(&cmd.stage_config)
        .with_context(|| format!("Failed to open stage configuration {}", cmd.stage_config))?;
    let definition = StageDefinition::from_reader(&cmd.stage_config, reader)
        .context("Failed to read stage configuration")?;

    let documents = load_documents(cli)?;
    let ctx = ResolutionContext::from_process();
    let mut provider = DocumentStepConfigs::new(&documents, &ctx);
    for path in &cmd.metadata {
        provider = provider.with_metadata(read_metadata(path)?);
    }

    let mut run = RunConfig::new(definition).with_environment_root(&cmd.env_root_path);
    run.evaluate(&provider)
        .context("Failed to evaluate stage conditions")?;

    if cli.verbose {
        for line in format_run_summary(&run) {
            eprintln!("{}", line);
        }
    }

    if let Some(path) = &cmd.stage_output_file {
        let json = serde_json::to_string_pretty(&run.run_stages)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path))?;
    }
    if let Some(path) = &cmd.step_output_file {
        let json = serde_json::to_string_pretty(&run.run_steps)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path))?;
    }

    let active = match &cmd.stage {
        Some(stage) => run.step_active(stage, &cmd.step),
        None => run
            .run_steps
            .values()
            .filter_map(|steps| steps.get(&cmd.step).copied())
            .reduce(|a, b| a || b),
    };

    match active {
        Some(true) => eprintln!("{} Step {} is active", CHECK, style(&cmd.step).bold()),
        Some(false) => {
            eprintln!("{} Step {} is not active", CROSS, style(&cmd.step).bold());
            std::process::exit(1);
        }
        None => eprintln!(
            "{} Step {} has no stage conditions and is active",
            INFO,
            style(&cmd.step).bold()
        ),
    }
    Ok(())
}
