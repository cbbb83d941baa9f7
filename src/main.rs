//! overseer - command line entry point
//!
//! Plans the request given on the command line, executes it with verified
//! steps and prints the execution report as JSON.

use std::sync::Arc;

use overseer::{
    agents::{Adjuster, Executor, Planner},
    capture::{NoCapture, ObservationCapture, ScreenshotCapture},
    config::{Config, OFFLINE_PROVIDER, PRIMARY_PROVIDER},
    llm::{CapabilityClient, OpenRouterClient},
    notify::{LogNotifier, Notifier},
    throttle::RequestThrottler,
    tools::{ToolInvoker, ToolRegistry},
    verify::{AttemptVerifier, ProbeVerifier, VerificationService, VerificationStrategySelector, VisionVerifier},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    // Screenshot shrinking and recursive probe checks run deep on worker stacks.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(8 * 1024 * 1024)
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overseer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let request = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if request.trim().is_empty() {
        anyhow::bail!("usage: overseer <request>");
    }

    let config = Config::from_env()?;
    info!(
        planner = %config.planner_tier.model,
        judge = %config.judge_tier.model,
        vision_tiers = config.vision_tiers.len(),
        "Loaded configuration"
    );

    // Capability stack
    let primary = match &config.base_url {
        Some(url) => OpenRouterClient::with_base_url(config.api_key.clone(), url.clone()),
        None => OpenRouterClient::new(config.api_key.clone()),
    };
    let mut capability = CapabilityClient::new(
        RequestThrottler::spawn(config.throttle.clone()),
        config.vision.max_image_bytes,
    )
    .with_provider(PRIMARY_PROVIDER, Arc::new(primary));
    if let Some(url) = &config.offline_url {
        info!(url = %url, "Offline vision tier enabled");
        capability = capability.with_provider(
            OFFLINE_PROVIDER,
            Arc::new(OpenRouterClient::with_base_url(String::new(), url.clone())),
        );
    }
    let capability = Arc::new(capability);

    let invoker: Arc<dyn ToolInvoker> = Arc::new(ToolRegistry::with_defaults(
        config.working_dir.clone(),
        config.executor.tool_timeout,
    ));

    let capture: Arc<dyn ObservationCapture> = match &config.display {
        Some(display) => Arc::new(ScreenshotCapture::new(
            display.clone(),
            std::env::temp_dir().join("overseer"),
            config.vision.max_image_bytes,
        )),
        None => {
            warn!("DESKTOP_DISPLAY not set, verification will rely on probes");
            Arc::new(NoCapture)
        }
    };

    // Verification
    let selector = VerificationStrategySelector::new(
        capability.clone(),
        config.judge_tier.clone(),
        config.selector.clone(),
    );
    let vision = VisionVerifier::new(
        capability.clone(),
        capture,
        config.vision_tiers.clone(),
        config.vision.clone(),
    );
    let probe = ProbeVerifier::new(
        invoker.clone(),
        config.working_dir.clone(),
        config.executor.tool_timeout,
    );
    let verifier: Arc<dyn AttemptVerifier> =
        Arc::new(VerificationService::new(selector, vision, probe));

    // Agents
    let planner = Arc::new(Planner::new(
        capability.clone(),
        invoker.clone(),
        config.planner_tier.clone(),
        config.planner.clone(),
        config.executor.max_attempts,
    ));
    let adjuster = Adjuster::new(
        capability.clone(),
        config.planner_tier.clone(),
        config.adjuster.clone(),
        config.executor.max_replans,
    );
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let executor = Executor::new(
        planner,
        invoker,
        verifier,
        adjuster,
        notifier,
        config.executor.clone(),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            on_interrupt.cancel();
        }
    });

    let report = executor.run_request(&request, cancel).await;
    if let Some(stats) = capability.throttler().stats().await {
        info!(
            submitted = stats.total_submitted,
            dispatched = stats.total_dispatched,
            merged = stats.total_merged,
            current_delay_ms = stats.current_delay_ms,
            "Throttler summary"
        );
    }

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(path) = &config.report_path {
        tokio::fs::write(path, &json).await?;
        info!(path = %path.display(), "Report written");
    }
    println!("{}", json);

    if report.succeeded() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
