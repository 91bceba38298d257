//! Configuration shared by the commands.

use forge_mirror_networking::BaseClient;
use miette::{Context, IntoDiagnostic};

use crate::{console_utils::LoggingOutputHandler, opt::NetworkOpts};

/// The user agent to use for the reqwest client
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Global configuration for a run
#[derive(Clone, Debug)]
pub struct Configuration {
    /// If set to a value, a progress bar will be shown
    pub fancy_log_handler: LoggingOutputHandler,

    /// The HTTP client every remote collaborator shares
    pub client: BaseClient,
}

impl Configuration {
    /// Build the configuration from the network options of a command.
    pub fn from_network_opts(
        opts: &NetworkOpts,
        fancy_log_handler: LoggingOutputHandler,
    ) -> miette::Result<Self> {
        let client = BaseClient::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(opts.timeout)
            .max_retries(opts.max_retries)
            .insecure_hosts(opts.allow_insecure_host.clone().unwrap_or_default())
            .build()
            .into_diagnostic()
            .context("failed to create the HTTP client")?;

        Ok(Self {
            fancy_log_handler,
            client,
        })
    }
}
