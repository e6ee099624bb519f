use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, wait_for_update_count, wait_until, RecordingBot},
    mock_bot_api::{MockBotApi, MockBotApiServer, MockReply},
};
use anyhow::{Context, Result};
use tgpoll::{source_fn, FetchOutcome, FetchRequest, Runner, SessionConfig, Update, UpdateSource};
use tokio::time::{sleep, timeout};

/// Answers every poll with a single update whose id equals the requested offset.
fn counting_source(calls: Arc<AtomicI64>) -> Arc<dyn UpdateSource> {
    Arc::new(source_fn(move |request: FetchRequest| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            sleep(Duration::from_millis(5)).await;
            Ok(FetchOutcome::Updates(vec![Update::with_id(request.offset)]))
        }
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_stops_when_token_is_cancelled() -> Result<()> {
    init_tracing();
    let bot = RecordingBot::new("1:runner");
    let closings = bot.closings();
    let state = bot.state();
    let calls = Arc::new(AtomicI64::new(0));

    let mut runner = Runner::with_update_source(
        SessionConfig::default(),
        Arc::new(bot),
        counting_source(calls.clone()),
    )?;
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop after cancellation")??;

    assert!(!runner.session().is_running());
    assert!(!runner.session().has_active_loops());
    assert_eq!(closings.load(Ordering::SeqCst), 1);

    let ids = state.lock().expect("poisoned").ids();
    assert!(!ids.is_empty(), "updates should flow before shutdown");
    assert!(
        ids.windows(2).all(|pair| pair[1] == pair[0] + 1),
        "ids must arrive without gaps or duplicates: {ids:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_can_restart_after_stop() -> Result<()> {
    init_tracing();
    let bot = RecordingBot::new("1:runner");
    let state = bot.state();
    let closings = bot.closings();
    let calls = Arc::new(AtomicI64::new(0));

    let mut runner = Runner::with_update_source(
        SessionConfig::default(),
        Arc::new(bot),
        counting_source(calls.clone()),
    )?;

    runner.start()?;
    runner.start()?;
    wait_for_update_count(&state, 5, Duration::from_secs(5)).await?;
    runner.stop().await?;
    let first_run = state.lock().expect("poisoned").updates.len();

    runner.start()?;
    wait_for_update_count(&state, first_run + 5, Duration::from_secs(5)).await?;
    runner.stop().await?;
    runner.stop().await?;

    let ids = state.lock().expect("poisoned").ids();
    assert_eq!(ids[0], 1);
    assert_eq!(
        ids[first_run], 1,
        "a restarted session polls again from offset zero"
    );
    assert_eq!(closings.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_polls_the_http_api_with_the_bot_token() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([MockReply::Updates(vec![40, 41])]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let config = SessionConfig::builder()
        .base_url(server.base_url())
        .long_poll_timeout(Duration::from_secs(1))
        .idle_poll_delay(Duration::from_millis(20))
        .metrics_interval(Duration::from_millis(50))
        .build()?;
    let bot = RecordingBot::new("77:http");
    let state = bot.state();
    let mut runner = Runner::new(config, Arc::new(bot))?;

    runner.start()?;
    wait_for_update_count(&state, 2, Duration::from_secs(5)).await?;
    wait_until(|| api.requests().len() >= 2, Duration::from_secs(5), "second poll").await?;
    runner.stop().await?;

    assert_eq!(state.lock().expect("poisoned").ids(), vec![40, 41]);
    let requests = api.requests();
    assert!(requests.iter().all(|r| r.path == "/bot77:http/getUpdates"));
    assert_eq!(requests[1].offset(), Some(42));
    assert_eq!(runner.session().last_offset(), 41);
    let source = runner
        .session()
        .source_metrics()
        .context("HTTP runner should expose source counters")?;
    assert!(source.total_requests >= 2);
    assert_eq!(source.total_server_errors, 0);

    server.shutdown().await;
    Ok(())
}
