use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use phase2_contributor::{
    cli::{Command, Options},
    commands::{contribute_subcommand, login_subcommand, logout_subcommand},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Operator log goes to a file; the terminal stays reserved for the
    // status updates.
    let appender = tracing_appender::rolling::never(".", "phase2-contributor.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(non_blocking)
        .init();

    let opts = Options::from_args();

    match opts.subcommand {
        Command::Login(login_opts) => login_subcommand(&login_opts).await?,
        Command::Logout(logout_opts) => logout_subcommand(&logout_opts)?,
        Command::Contribute(contribute_opts) => contribute_subcommand(&contribute_opts).await?,
    }

    Ok(())
}
