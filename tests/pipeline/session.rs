use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use crate::support::{
    helpers::{init_tracing, wait_for_update_count, wait_until, CapturedLogs, RecordingBot},
    mock_bot_api::{MockBotApi, MockBotApiServer, MockReply},
};
use anyhow::{Context, Result};
use tgpoll::{register_bot, BotSession, SessionConfig, SessionError};
use tokio::time::timeout;
use tracing::Dispatch;

const TOKEN: &str = "123456:test-token";

fn fast_config(server: &MockBotApiServer) -> Result<SessionConfig> {
    SessionConfig::builder()
        .base_url(server.base_url())
        .long_poll_timeout(Duration::from_secs(1))
        .idle_poll_delay(Duration::from_millis(20))
        .server_error_delay(Duration::from_millis(20))
        .backoff_initial(Duration::from_millis(20))
        .backoff_max(Duration::from_millis(200))
        .build()
}

fn http_session(config: SessionConfig, bot: RecordingBot) -> Result<BotSession> {
    let mut session = BotSession::new(config);
    session.set_token(TOKEN)?;
    session.set_callback(Arc::new(bot))?;
    Ok(session)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delivers_unsorted_batch_in_arrival_order() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([MockReply::Updates(vec![5, 7, 6])]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new(TOKEN);
    let state = bot.state();
    let mut session = http_session(fast_config(&server)?, bot)?;
    session.start()?;

    wait_for_update_count(&state, 3, Duration::from_secs(5)).await?;
    wait_until(|| api.requests().len() >= 2, Duration::from_secs(5), "follow-up poll").await?;
    session.stop()?;
    session.wait_stopped().await;

    {
        let guard = state.lock().expect("recording state poisoned");
        assert_eq!(guard.ids(), vec![5, 7, 6]);
        assert_eq!(guard.batches, vec![3], "one callback for the whole batch");
        let kind = guard.updates[0].kind();
        assert_eq!(kind, Some("message"));
    }
    assert_eq!(session.last_offset(), 7);

    let requests = api.requests();
    assert_eq!(requests[0].path, format!("/bot{TOKEN}/getUpdates"));
    assert_eq!(requests[0].offset(), Some(1));
    assert_eq!(requests[0].body["limit"], 100);
    assert_eq!(requests[0].body["timeout"], 1);
    assert!(requests[0].body.get("allowed_updates").is_none());
    assert_eq!(requests[1].offset(), Some(8));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_updates_are_dropped_before_delivery() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([
        MockReply::Updates(vec![5]),
        MockReply::Updates(vec![3, 6, 4]),
    ]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new(TOKEN);
    let state = bot.state();
    let mut session = http_session(fast_config(&server)?, bot)?;
    session.start()?;

    wait_for_update_count(&state, 2, Duration::from_secs(5)).await?;
    wait_until(|| api.requests().len() >= 3, Duration::from_secs(5), "third poll").await?;
    session.stop()?;
    session.wait_stopped().await;

    assert_eq!(state.lock().expect("poisoned").ids(), vec![5, 6]);
    assert_eq!(session.last_offset(), 6);
    let snapshot = session.telemetry().snapshot();
    assert_eq!(snapshot.fetched_updates, 4);
    assert_eq!(snapshot.discarded_updates, 2);
    assert_eq!(
        snapshot.delivered_updates,
        snapshot.fetched_updates - snapshot.discarded_updates
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovers_from_server_errors_and_bad_payloads() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([
        MockReply::Status(502, "Bad Gateway".to_owned()),
        MockReply::Status(200, "not json at all".to_owned()),
        MockReply::Rejected(409, "Conflict: terminated by other getUpdates request".to_owned()),
        MockReply::Updates(vec![1, 2]),
    ]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new(TOKEN);
    let state = bot.state();
    let mut session = http_session(fast_config(&server)?, bot)?;
    session.start()?;

    wait_for_update_count(&state, 2, Duration::from_secs(5)).await?;
    session.stop()?;
    session.wait_stopped().await;

    assert_eq!(state.lock().expect("poisoned").ids(), vec![1, 2]);
    let snapshot = session.telemetry().snapshot();
    assert_eq!(snapshot.server_errors, 1);
    assert_eq!(snapshot.undecodable_responses, 1);
    assert_eq!(snapshot.fetch_errors, 1);

    let source = session
        .source_metrics()
        .context("default HTTP source should expose its counters")?;
    assert!(source.total_requests >= 4);
    assert_eq!(source.total_server_errors, 1);
    assert!(source.total_errors >= 3);

    let offsets: Vec<Option<i64>> = api.requests().iter().take(4).map(|r| r.offset()).collect();
    assert_eq!(offsets, vec![Some(1); 4], "failed polls never move the offset");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_failure_does_not_stop_the_session() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([MockReply::Updates(vec![1])]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new(TOKEN).failing_on(1);
    let state = bot.state();
    let mut session = http_session(fast_config(&server)?, bot)?;
    session.start()?;

    wait_for_update_count(&state, 1, Duration::from_secs(5)).await?;
    api.push_reply(MockReply::Updates(vec![2]));
    wait_for_update_count(&state, 2, Duration::from_secs(5)).await?;
    session.stop()?;
    session.wait_stopped().await;

    assert_eq!(state.lock().expect("poisoned").ids(), vec![1, 2]);
    assert_eq!(session.telemetry().snapshot().callback_failures, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_interrupts_an_open_long_poll() -> Result<()> {
    init_tracing();
    let api = MockBotApi::default();
    api.set_idle_reply(MockReply::Hold(Duration::from_secs(30)));
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new(TOKEN);
    let closings = bot.closings();
    let config = SessionConfig::builder()
        .base_url(server.base_url())
        .long_poll_timeout(Duration::from_secs(50))
        .build()?;
    let mut session = http_session(config, bot)?;
    session.start()?;
    wait_until(|| !api.requests().is_empty(), Duration::from_secs(5), "first poll").await?;

    let started = Instant::now();
    session.stop()?;
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "stop must not wait for the loops"
    );
    assert_eq!(closings.load(Ordering::SeqCst), 1);
    assert_eq!(session.stop(), Err(SessionError::NotRunning));

    timeout(Duration::from_secs(2), session.wait_stopped())
        .await
        .context("loops should exit while the poll is still open")?;
    assert!(!session.has_active_loops());
    assert_eq!(closings.load(Ordering::SeqCst), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn register_bot_uses_the_bot_token() -> Result<()> {
    init_tracing();
    let api = MockBotApi::with_replies([MockReply::Updates(vec![10])]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let bot = RecordingBot::new("999:registered");
    let state = bot.state();
    let mut session = register_bot(Arc::new(bot), fast_config(&server)?)?;
    assert!(session.is_running());

    wait_for_update_count(&state, 1, Duration::from_secs(5)).await?;
    assert_eq!(session.start(), Err(SessionError::AlreadyRunning));
    session.stop()?;
    session.wait_stopped().await;

    assert_eq!(api.requests()[0].path, "/bot999:registered/getUpdates");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allowed_updates_are_sent_when_configured() -> Result<()> {
    init_tracing();
    let api = MockBotApi::default();
    let server = MockBotApiServer::start(api.clone()).await?;

    let config = SessionConfig::builder()
        .base_url(server.base_url())
        .long_poll_timeout(Duration::from_secs(1))
        .allowed_updates(["message", "callback_query"])
        .build()?;
    let mut session = http_session(config, RecordingBot::new(TOKEN))?;
    session.start()?;
    wait_until(|| !api.requests().is_empty(), Duration::from_secs(5), "first poll").await?;
    session.stop()?;
    session.wait_stopped().await;

    let body = &api.requests()[0].body;
    assert_eq!(
        body["allowed_updates"],
        serde_json::json!(["message", "callback_query"])
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn injected_logger_receives_session_events() -> Result<()> {
    let api = MockBotApi::with_replies([MockReply::Updates(vec![1])]);
    let server = MockBotApiServer::start(api.clone()).await?;

    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || writer.clone())
        .finish();

    let bot = RecordingBot::new(TOKEN);
    let state = bot.state();
    let mut session = http_session(fast_config(&server)?, bot)?;
    session.set_logger(Dispatch::new(subscriber));
    session.start()?;

    wait_for_update_count(&state, 1, Duration::from_secs(5)).await?;
    session.stop()?;
    session.wait_stopped().await;

    let output = logs.contents();
    assert!(output.contains("bot session started"), "missing start log: {output}");
    assert!(output.contains("poller started"), "missing poller log: {output}");
    assert!(output.contains("dispatcher stopped"), "missing dispatcher log: {output}");
    assert!(output.contains("recording_bot"), "missing bot span field: {output}");

    server.shutdown().await;
    Ok(())
}
