//! Command-line options.

use std::path::PathBuf;

use clap::{Parser, crate_version};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use forge_mirror_networking::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};
use rattler_conda_types::Platform;
use url::Url;

use crate::{
    consts::{
        DEFAULT_DEST_CHANNEL, DEFAULT_PYPI_INDEX_URL, DEFAULT_REGISTRY_API_URL, UPSTREAM_CHANNEL,
    },
    package::InterpreterTag,
};

/// Application subcommands.
#[derive(Parser)]
pub enum SubCommands {
    /// Copy packages from the upstream channel to the destination channel
    ///
    /// Every package in the list is compared between both channels. Missing
    /// or outdated versions are copied in full, versions that exist on both
    /// channels only get the files the destination lacks.
    Copy(CopyOpts),

    /// Work out which packages need a build and write their recipes
    ///
    /// Writes `recipes/<name>/` for every package to build, `build_order.txt`
    /// and `copy_from.yaml` (packages whose recipe came from a conda-forge
    /// feedstock) to the output directory.
    Plan(PlanOpts),

    /// Fork and clone the conda-forge feedstocks of the listed packages
    CloneFeedstocks(CloneFeedstocksOpts),

    /// Check that every recipe in a recipes directory was built
    CheckBuilt(CheckBuiltOpts),
}

#[allow(missing_docs)]
#[derive(Parser)]
#[clap(version = crate_version!())]
pub struct App {
    /// Subcommand.
    #[clap(subcommand)]
    pub subcommand: SubCommands,

    /// Enable verbose logging.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Network options shared by the subcommands that talk to remote services.
#[derive(Parser, Clone, Debug)]
pub struct NetworkOpts {
    /// Timeout for network requests, in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, help_heading = "Network")]
    pub timeout: u64,

    /// How often a failed request is retried
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, hide = true)]
    pub max_retries: u32,

    /// List of hosts for which SSL certificate verification should be skipped
    #[arg(long, value_delimiter = ',', help_heading = "Network")]
    pub allow_insecure_host: Option<Vec<String>>,
}

/// Package registry options.
#[derive(Parser, Clone, Debug)]
pub struct RegistryOpts {
    /// The package registry API
    #[arg(
        long,
        env = "FORGE_MIRROR_REGISTRY_URL",
        default_value = DEFAULT_REGISTRY_API_URL,
        help_heading = "Registry"
    )]
    pub registry_url: Url,

    /// The channel packages are mirrored to
    #[arg(short = 'c', long = "channel", default_value = DEFAULT_DEST_CHANNEL, help_heading = "Registry")]
    pub dest_channel: String,

    /// The channel packages come from
    #[arg(long, default_value = UPSTREAM_CHANNEL, help_heading = "Registry")]
    pub source_channel: String,
}

/// Options for the `copy` command.
#[derive(Parser, Clone, Debug)]
pub struct CopyOpts {
    /// The package list, either a list of entries or a `name: version` mapping
    pub packages: PathBuf,

    /// API token with write access to the destination channel
    #[arg(long, env = "ANACONDA_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Legacy name of the API token variable
    #[arg(long, env = "BINSTAR_TOKEN", hide_env_values = true, hide = true)]
    pub binstar_token: Option<String>,

    /// Only print what would be copied
    #[arg(long)]
    pub dry_run: bool,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub registry: RegistryOpts,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub network: NetworkOpts,
}

impl CopyOpts {
    /// The API token, preferring `ANACONDA_API_TOKEN` over `BINSTAR_TOKEN`.
    pub fn api_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| self.binstar_token.clone())
            .filter(|token| !token.trim().is_empty())
    }
}

/// Options for the `plan` command.
#[derive(Parser, Clone, Debug)]
pub struct PlanOpts {
    /// The package list
    pub packages: PathBuf,

    /// Directory with hand-maintained recipe templates, one subdirectory per
    /// package
    #[arg(long, default_value = "./templates")]
    pub template_dir: PathBuf,

    /// Where `recipes/`, `build_order.txt` and `copy_from.yaml` are written
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// The platform to plan for. Defaults to the current platform
    #[arg(long)]
    pub target_platform: Option<Platform>,

    /// The python version to plan for, e.g. 3.12 or 312
    #[arg(long, env = "CONDA_PY")]
    pub python: InterpreterTag,

    /// The python versions packages are built for unless they specify their own
    #[arg(long, value_delimiter = ',')]
    pub baseline_python: Option<Vec<InterpreterTag>>,

    /// Never reuse recipes from conda-forge feedstocks
    #[arg(long)]
    pub no_feedstocks: bool,

    /// PyPI JSON API endpoints, tried in order
    #[arg(
        long,
        env = "FORGE_MIRROR_PYPI_INDEX_URL",
        value_delimiter = ',',
        default_value = DEFAULT_PYPI_INDEX_URL
    )]
    pub pypi_index_url: Vec<String>,

    /// Download and verify the source distribution of every planned package
    /// into this directory
    #[arg(long)]
    pub fetch_sources: Option<PathBuf>,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub registry: RegistryOpts,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub network: NetworkOpts,
}

/// Options for the `clone-feedstocks` command.
#[derive(Parser, Clone, Debug)]
pub struct CloneFeedstocksOpts {
    /// The package list
    pub packages: PathBuf,

    /// The GitHub account the feedstocks are forked to
    #[arg(long)]
    pub github_user: String,

    /// GitHub token of that account
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: String,

    /// Directory the forks are cloned into
    #[arg(long, default_value = ".")]
    pub dest_dir: PathBuf,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub network: NetworkOpts,
}

/// Options for the `check-built` command.
#[derive(Parser, Clone, Debug)]
pub struct CheckBuiltOpts {
    /// Directory with one subdirectory per recipe
    #[arg(long, default_value = "./recipes")]
    pub recipes_dir: PathBuf,

    /// Directory the built packages were written to
    #[arg(long, env = "CONDA_BLD_PATH", default_value = "./output")]
    pub output_dir: PathBuf,
}

/// Everything `plan` needs once defaults are filled in.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub struct PlanData {
    pub packages: PathBuf,
    pub template_dir: PathBuf,
    pub output_dir: PathBuf,
    pub target_platform: Platform,
    pub python: InterpreterTag,
    pub baseline_pythons: Option<Vec<InterpreterTag>>,
    pub use_feedstocks: bool,
    pub pypi_index_urls: Vec<String>,
    pub fetch_sources: Option<PathBuf>,
    pub dest_channel: String,
    pub upstream_channel: String,
}

impl From<PlanOpts> for PlanData {
    fn from(opts: PlanOpts) -> Self {
        Self {
            packages: opts.packages,
            template_dir: opts.template_dir,
            output_dir: opts.output_dir,
            target_platform: opts.target_platform.unwrap_or_else(Platform::current),
            python: opts.python,
            baseline_pythons: opts.baseline_python,
            use_feedstocks: !opts.no_feedstocks,
            pypi_index_urls: opts.pypi_index_url,
            fetch_sources: opts.fetch_sources,
            dest_channel: opts.registry.dest_channel,
            upstream_channel: opts.registry.source_channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        App::command().debug_assert();
    }

    #[test]
    fn plan_defaults() {
        let app = App::try_parse_from([
            "forge-mirror",
            "plan",
            "packages.yaml",
            "--python",
            "312",
            "--target-platform",
            "osx-arm64",
        ])
        .unwrap();
        let SubCommands::Plan(opts) = app.subcommand else {
            panic!("expected the plan command");
        };

        let data = PlanData::from(opts);
        assert_eq!(data.python, InterpreterTag::new(3, 12));
        assert_eq!(data.target_platform, Platform::OsxArm64);
        assert_eq!(data.dest_channel, "astropy");
        assert_eq!(data.upstream_channel, "conda-forge");
        assert!(data.use_feedstocks);
        assert_eq!(data.pypi_index_urls, vec![DEFAULT_PYPI_INDEX_URL]);
    }

    #[test]
    fn copy_token_fallback() {
        let app = App::try_parse_from([
            "forge-mirror",
            "copy",
            "copy_from.yaml",
            "--binstar-token",
            "legacy",
            "--dry-run",
        ])
        .unwrap();
        let SubCommands::Copy(opts) = app.subcommand else {
            panic!("expected the copy command");
        };
        assert!(opts.dry_run);
        assert_eq!(opts.api_token().as_deref(), Some("legacy"));
    }
}
