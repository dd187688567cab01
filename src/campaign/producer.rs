//! Campaign publish step.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::CampaignError;
use crate::results::ResultSink;
use crate::scheduler::{codec, Transport};

use super::generator::CampaignConfig;
use super::roster::AssetDirs;

/// What a publish step did.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    pub published: usize,
    pub one_vs_all: bool,
}

/// Checks every precondition, then publishes the whole campaign.
///
/// Nothing is published unless the rosters are valid, every asset exists
/// (when `assets` is given) and the result directory is empty. A missing
/// result directory is created.
pub async fn publish_campaign(
    transport: &dyn Transport,
    config: &CampaignConfig,
    assets: Option<&AssetDirs>,
    results: &ResultSink,
) -> Result<CampaignReport, CampaignError> {
    let jobs = config.generate()?;

    if let Some(assets) = assets {
        assets.check_bots(&config.all_bots())?;
        assets.check_maps(&config.maps)?;
    }

    if !results.is_empty().await? {
        return Err(CampaignError::CampaignConflict(results.dir().to_path_buf()));
    }
    results.ensure_dir().await?;

    let payloads = jobs
        .iter()
        .map(codec::encode)
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        jobs = payloads.len(),
        bots = config.all_bots().len(),
        maps = config.maps.len(),
        repeat = config.repeat_games,
        "Publishing campaign"
    );

    for (job, payload) in jobs.iter().zip(&payloads) {
        transport.publish(payload).await?;
        debug!(job_id = %job.job_id, "Published job");
    }

    info!(published = payloads.len(), "Campaign published");

    Ok(CampaignReport {
        published: payloads.len(),
        one_vs_all: config.test_bot.is_some(),
    })
}
