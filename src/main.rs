#![forbid(unsafe_code)]

// Stage poll - viewer-side diagnostic that follows the live stage list until Ctrl+C

use anyhow::Result;
use stagehand::api::{HttpStageApi, StageApi};
use stagehand::config::StageConfig;
use stagehand::metrics::OrchestratorMetrics;
use stagehand::preferences::{MemoryPreferences, PreferenceStore};
use stagehand::stage::list::StageList;
use stagehand::stage::MediaKind;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagehand=debug,stage_poll=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StageConfig::from_env();
    info!("Stage poll - watching {}", config.api_base_url);

    let preferences = Arc::new(MemoryPreferences::default());
    if let Ok(key) = std::env::var("STAGE_API_KEY") {
        preferences.set_api_key(Some(key));
    }
    let api = HttpStageApi::new(&config, preferences)?;
    let metrics = OrchestratorMetrics::new();
    let mut list = StageList::new();
    let delay = config.stage_refresh_delay;

    // Fixed delay after each fetch, so slow responses never overlap
    let poll = async {
        loop {
            metrics.inc_stage_refreshes();
            let started = Instant::now();
            let result = api.get_stages().await;
            metrics.observe_rest_call(started.elapsed());

            match result {
                Ok(snapshot) => {
                    let known: HashSet<String> =
                        list.stages().iter().map(|s| s.stage_id.clone()).collect();
                    let outcome = list.merge_snapshot(&snapshot);
                    for stage in list.stages().iter().filter(|s| !known.contains(&s.stage_id)) {
                        let kind = match stage.kind {
                            Some(MediaKind::Audio) => "audio",
                            Some(MediaKind::Video) => "video",
                            None => "unknown",
                        };
                        info!("Stage {} is live ({}, mode {})", stage.stage_id, kind, stage.mode.as_str());
                    }
                    for stage_id in &outcome.removed {
                        info!("Stage {} ended", stage_id);
                    }
                    debug!("{} stage(s) live", list.len());
                }
                Err(e) => {
                    metrics.inc_rest_failures();
                    warn!("Stage list fetch failed: {}", e);
                }
            }
            tokio::time::sleep(delay).await;
        }
    };

    tokio::select! {
        _ = poll => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    print!("{}", metrics.render_prometheus(list.len()));
    Ok(())
}
