//! Entry point of a contribution session: authentication, reputation
//! gating, participation check, then the participant state machine.

use crate::{
    attestation::GithubGistPublisher,
    cli::commands::contribute::ContributeOptions,
    coordination::{CoordinationClient, HttpCoordinator},
    errors::ContributeError,
    keystore::Keystore,
    reputation,
    session::ContributionSession,
    settings::Settings,
    snark::SnarkjsEngine,
    status::{ProgressBarSink, StatusSink, StatusUpdate},
    storage::StorageClient,
    utils::format_countdown,
};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub async fn contribute_subcommand(opts: &ContributeOptions) -> Result<()> {
    let settings = Settings::from_env()?;
    let sink = ProgressBarSink::new();
    run_contribute(opts, &settings, &sink).await
}

pub async fn run_contribute(opts: &ContributeOptions, settings: &Settings, sink: &dyn StatusSink) -> Result<()> {
    let keystore = Keystore::new(&opts.keystore);
    let token = match keystore.token() {
        Ok(token) => token,
        Err(error) => {
            sink.report(StatusUpdate::message(error.to_string()));
            return Ok(());
        }
    };

    let user = reputation::fetch_authenticated_user(&token).await?;
    if !reputation::check_github_reputation(&user, &settings.reputation) {
        let thresholds = settings.reputation;
        sink.report(StatusUpdate::message(
            ContributeError::ReputationTooLowError {
                repos: thresholds.repos,
                followers: thresholds.followers,
                following: thresholds.following,
            }
            .to_string(),
        ));
        return Ok(());
    }
    let participant_id = user.id.to_string();
    info!("Starting a contribution session as {} ({})", user.login, participant_id);

    let coordinator = Arc::new(HttpCoordinator::new(
        opts.coordinator_api_url.clone(),
        token.clone(),
        settings.terms.clone(),
    ));

    if !coordinator.check_participant_for_ceremony(&opts.ceremony_id).await? {
        let now = Utc::now().timestamp_millis();
        let active: Vec<_> = coordinator
            .get_timeouts(&opts.ceremony_id, &participant_id)
            .await?
            .into_iter()
            .filter(|timeout| timeout.end_date > now)
            .collect();
        match active.as_slice() {
            [timeout] => sink.report(StatusUpdate::message(format!(
                "You are in a cool-down period and can rejoin in {}",
                format_countdown(timeout.end_date - now)
            ))),
            _ => sink.report(StatusUpdate::message(
                ContributeError::CannotParticipateError(opts.ceremony_id.clone()).to_string(),
            )),
        }
        return Ok(());
    }

    let ceremony = coordinator.get_ceremony(&opts.ceremony_id).await?;
    sink.report(StatusUpdate::busy(format!("Joining {}", ceremony.title)));

    let storage = StorageClient::new(coordinator.clone());
    let engine = SnarkjsEngine::new(opts.zkey_tool.clone());
    let publisher = GithubGistPublisher::new(token);

    let session = ContributionSession::new(
        coordinator.as_ref(),
        &storage,
        &engine,
        sink,
        &publisher,
        settings,
        ceremony,
        participant_id,
        user.login,
        opts.working_dir.clone(),
    );
    session.run().await
}
