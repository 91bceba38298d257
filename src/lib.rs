//! Mirror conda-forge packages to an anaconda.org channel and plan builds of
//! the ones that have to be built from source.
//!
//! The library is split the way a run flows: the package list is parsed in
//! [`package`], compared against the channels in [`reconcile`], turned into
//! recipes in [`planner`] and finally written to disk for the build jobs
//! ([`build_order`]). [`clone_feedstocks`] and [`check_built`] are the
//! helpers around that cycle.

pub mod build_order;
pub mod check_built;
pub mod clone_feedstocks;
pub mod console_utils;
pub mod consts;
pub mod feedstock;
pub mod generate;
pub mod inject;
pub mod opt;
pub mod package;
pub mod planner;
pub mod reconcile;
pub mod registry;
pub mod source;
pub mod template;
pub mod tool_configuration;

#[cfg(test)]
mod testing;

use comfy_table::Table;
use forge_mirror_recipe_generator::PyPiClient;
use miette::IntoDiagnostic;
use url::Url;

use crate::{
    clone_feedstocks::{CloneOutcome, GitCli, GitHubHost, SkipReason},
    console_utils::LoggingOutputHandler,
    consts::{FEEDSTOCK_ORGANISATION, GITHUB_API_URL, GITHUB_URL},
    feedstock::GitHubFeedstockSource,
    generate::PyPiRecipeGenerator,
    opt::{CheckBuiltOpts, CloneFeedstocksOpts, CopyOpts, PlanData, PlanOpts},
    package::read_desired_state,
    planner::{BuildPlanner, PlanError, RecipeOrigin, write_plan},
    reconcile::{
        BuildReason, CopyDecision, ReconcileError, check_builds, execute_copies, plan_copies,
    },
    registry::anaconda::AnacondaRegistry,
    source::{CachedSourceIndex, PyPiSourceIndex, download::fetch_source},
    template::MinijinjaRenderer,
    tool_configuration::Configuration,
};

fn summary_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL_CONDENSED)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn describe_copy(decision: &CopyDecision) -> (String, String) {
    match decision {
        CopyDecision::FullCopy { version } => (version.clone(), "copy".to_string()),
        CopyDecision::PartialCopy { version, filenames } => (
            version.clone(),
            format!("copy {} missing file(s)", filenames.len()),
        ),
        CopyDecision::NoAction => (String::new(), "up to date".to_string()),
    }
}

fn fail_on_errors(failed: usize, what: &str) -> miette::Result<()> {
    if failed > 0 {
        miette::bail!("{failed} package(s) could not be {what}, see the log above");
    }
    Ok(())
}

/// Copy the packages of the package list from the source channel to the
/// destination channel.
pub async fn run_copy(opts: CopyOpts, log_handler: LoggingOutputHandler) -> miette::Result<()> {
    let config = Configuration::from_network_opts(&opts.network, log_handler)?;
    let packages = read_desired_state(&opts.packages)?;
    let registry_url = opts.registry.registry_url.clone();
    let token = opts.api_token();
    let registry = AnacondaRegistry::new(
        config.client.for_host(&registry_url).clone(),
        registry_url,
        token.clone(),
    );
    let source_channel = opts.registry.source_channel.as_str();
    let dest_channel = opts.registry.dest_channel.as_str();

    let plan = plan_copies(&registry, &packages, source_channel, dest_channel).await?;

    let mut table = summary_table(vec!["Package", "Version", "Action"]);
    for (name, decision) in &plan.decisions {
        let (version, action) = describe_copy(decision);
        table.add_row(vec![name.clone(), version, action]);
    }
    for (name, err) in &plan.failures {
        table.add_row(vec![name.clone(), String::new(), format!("failed: {err}")]);
    }
    tracing::info!("\n{}", table);

    let mut failed = plan.failures.len();
    if plan.copy_count() == 0 {
        tracing::info!("Nothing to copy to {}", dest_channel);
    } else if opts.dry_run {
        tracing::info!(
            "Dry run: skipping {} copy request(s) to {}",
            plan.copy_count(),
            dest_channel
        );
    } else {
        if token.is_none() {
            return Err(ReconcileError::MissingToken.into());
        }
        failed += execute_copies(&registry, &plan, source_channel, dest_channel)
            .await?
            .len();
    }

    fail_on_errors(failed, "copied")
}

/// Decide which packages need a build and write their recipes.
pub async fn run_plan(opts: PlanOpts, log_handler: LoggingOutputHandler) -> miette::Result<()> {
    let config = Configuration::from_network_opts(&opts.network, log_handler)?;
    let registry_url = opts.registry.registry_url.clone();
    let data = PlanData::from(opts);
    let packages = read_desired_state(&data.packages)?;
    let client = &config.client;

    let registry = AnacondaRegistry::new(
        client.for_host(&registry_url).clone(),
        registry_url,
        None,
    );
    let pypi = PyPiClient::new(client.get_client().clone(), &data.pypi_index_urls)
        .into_diagnostic()?;
    let sources = CachedSourceIndex::new(PyPiSourceIndex::new(pypi.clone()));
    let generator = PyPiRecipeGenerator::new(pypi);
    let renderer = MinijinjaRenderer;
    let feedstocks = GitHubFeedstockSource::new(
        client.get_client().clone(),
        Url::parse(GITHUB_URL).into_diagnostic()?,
        FEEDSTOCK_ORGANISATION,
    );

    tracing::info!(
        "Checking {} package(s) on {} for {} / python {}",
        packages.len(),
        data.dest_channel,
        data.target_platform,
        data.python
    );
    let report = check_builds(
        &registry,
        &packages,
        &data.dest_channel,
        data.target_platform,
        data.python,
        &sources,
    )
    .await;
    let candidates = report.candidates();

    let mut planner = BuildPlanner::new(&registry, &sources, &renderer, &generator);
    if data.use_feedstocks {
        planner = planner.with_feedstocks(&feedstocks, data.upstream_channel.clone());
    }
    if let Some(baseline) = data.baseline_pythons.clone() {
        planner = planner.with_baseline_pythons(baseline);
    }
    let mut plan = planner
        .plan(
            &candidates,
            &data.template_dir,
            data.target_platform,
            data.python,
        )
        .await?;

    if let Some(sources_dir) = &data.fetch_sources {
        let ready: Vec<_> = plan
            .ready()
            .into_iter()
            .map(|recipe| (recipe.registry_name(), recipe.source.clone()))
            .collect();
        for (name, artifact) in ready {
            let http = client.for_host(&artifact.url);
            if let Err(source) =
                fetch_source(http, &artifact, sources_dir, &config.fancy_log_handler).await
            {
                tracing::error!("Failed to download the source of {}: {}", name, source);
                plan.fail(
                    &name,
                    PlanError::Download {
                        package: name.clone(),
                        source,
                    },
                );
            }
        }
    }

    let write_failures = write_plan(&plan, &data.output_dir).into_diagnostic()?;

    let mut table = summary_table(vec!["Package", "Version", "Status"]);
    for check in report.checks.iter().filter(|check| !check.needs_build()) {
        table.add_row(vec![
            check.package.registry_name(),
            check.version.clone(),
            "up to date".to_string(),
        ]);
    }
    for recipe in plan.ready() {
        let name = recipe.registry_name();
        let status = match write_failures.get(&name) {
            Some(err) => format!("failed: {err}"),
            None => match recipe.origin {
                RecipeOrigin::Template => "build from template",
                RecipeOrigin::UpstreamFeedstock => "build from feedstock",
                RecipeOrigin::AutoGeneration => "build from generated recipe",
            }
            .to_string(),
        };
        table.add_row(vec![name, recipe.version().to_string(), status]);
    }
    for (name, reason) in &plan.dropped {
        table.add_row(vec![name.clone(), String::new(), format!("skipped: {reason}")]);
    }
    let failures = report
        .failures
        .iter()
        .map(|(name, err)| (name, err.to_string()))
        .chain(plan.failed.iter().map(|(name, err)| (name, err.to_string())));
    for (name, err) in failures {
        table.add_row(vec![name.clone(), String::new(), format!("failed: {err}")]);
    }
    tracing::info!("\n{}", table);

    let not_on_channel = report
        .checks
        .iter()
        .filter(|check| check.reason == BuildReason::NotOnChannel)
        .count();
    if not_on_channel > 0 {
        tracing::info!("{} package(s) are new to {}", not_on_channel, data.dest_channel);
    }

    fail_on_errors(
        report.failures.len() + plan.failed.len() + write_failures.len(),
        "planned",
    )
}

/// Fork and clone the feedstocks of the packages in the package list.
pub async fn run_clone_feedstocks(
    opts: CloneFeedstocksOpts,
    log_handler: LoggingOutputHandler,
) -> miette::Result<()> {
    let config = Configuration::from_network_opts(&opts.network, log_handler)?;
    let packages = read_desired_state(&opts.packages)?;
    let api_url = Url::parse(GITHUB_API_URL).into_diagnostic()?;
    let host = GitHubHost::new(
        config.client.for_host(&api_url).clone(),
        api_url,
        opts.github_token,
        FEEDSTOCK_ORGANISATION,
    );

    let report = clone_feedstocks::clone_feedstocks(
        &host,
        &GitCli,
        &packages,
        &opts.github_user,
        &opts.dest_dir,
    )
    .await?;

    let mut table = summary_table(vec!["Package", "Result"]);
    for (name, outcome) in &report.outcomes {
        let result = match outcome {
            CloneOutcome::Cloned(path) => format!("cloned to {}", path.display()),
            CloneOutcome::Skipped(SkipReason::AlreadyCloned) => "already cloned".to_string(),
            CloneOutcome::Skipped(SkipReason::NoFeedstock) => "no feedstock".to_string(),
            CloneOutcome::Skipped(SkipReason::ForkRefused) => "fork refused".to_string(),
        };
        table.add_row(vec![name.clone(), result]);
    }
    for (name, err) in &report.failures {
        table.add_row(vec![name.clone(), format!("failed: {err}")]);
    }
    tracing::info!("\n{}", table);

    fail_on_errors(report.failures.len(), "cloned")
}

/// Fail unless every recipe in the recipes directory produced a package.
pub fn run_check_built(opts: CheckBuiltOpts) -> miette::Result<()> {
    check_built::check_built(&opts.recipes_dir, &opts.output_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_decisions_are_described() {
        assert_eq!(
            describe_copy(&CopyDecision::PartialCopy {
                version: "0.9".to_string(),
                filenames: vec!["a".to_string(), "b".to_string()],
            }),
            ("0.9".to_string(), "copy 2 missing file(s)".to_string())
        );
        assert_eq!(
            describe_copy(&CopyDecision::NoAction).1,
            "up to date".to_string()
        );
    }

    #[test]
    fn failures_fail_the_run() {
        assert!(fail_on_errors(0, "copied").is_ok());
        let err = fail_on_errors(2, "copied").unwrap_err();
        assert_eq!(
            err.to_string(),
            "2 package(s) could not be copied, see the log above"
        );
    }
}
