//! Pool behavior against a scripted server: login, channel claims,
//! command dispatch, message forwarding.

mod support;

use std::sync::Arc;
use std::time::Duration;

use seine_core::{Error, LogStatsSink, Pool};
use support::*;

const WAIT: Duration = Duration::from_secs(5);

fn build_pool(
    server: &ScriptedServer,
    store: Arc<MemStore>,
) -> (Arc<Pool>, Arc<CollectSink>) {
    let sink = Arc::new(CollectSink::default());
    let pool = Pool::new(
        fast_policy(&server.addr),
        store,
        sink.clone(),
        Arc::new(LogStatsSink),
    );
    (pool, sink)
}

#[tokio::test]
async fn two_sessions_split_five_channels() {
    let server = ScriptedServer::start().await;
    let channels: Vec<String> = (0..5).map(|i| format!("#chan{i}")).collect();
    let store = MemStore::with_account(account(1, "scout", 2), channels);
    let (pool, _sink) = build_pool(&server, store);

    assert_eq!(pool.start_from_store().unwrap(), 1);
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 2).await);
    assert!(wait_for(WAIT, || server.lines_matching("JOIN ").len() >= 5).await);

    // Every channel claimed exactly once, fair-share split 3 + 2.
    let joins = server.lines_matching("JOIN ");
    let mut names: Vec<String> = joins.iter().map(|(_, l)| l.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 5, "a channel was joined twice: {joins:?}");

    let per_conn: Vec<usize> = (0..2)
        .map(|c| joins.iter().filter(|(conn, _)| *conn == c).count())
        .collect();
    let mut sorted = per_conn.clone();
    sorted.sort();
    assert_eq!(sorted, vec![2, 3], "unexpected claim split: {per_conn:?}");

    // Registry agrees: everything attached.
    assert!(wait_for(WAIT, || {
        client
            .assignment_snapshot()
            .iter()
            .all(|(_, s)| s.is_some())
    })
    .await);

    pool.shutdown();
}

#[tokio::test]
async fn join_is_idempotent_and_leave_parts() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    pool.join_channel(1, "Lobby").unwrap();
    assert!(wait_for(WAIT, || !server.lines_matching("JOIN #lobby").is_empty()).await);

    // Second join of the same channel is a no-op.
    pool.join_channel(1, "#lobby").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.lines_matching("JOIN #lobby").len(), 1);

    pool.leave_channel("#lobby").unwrap();
    assert!(wait_for(WAIT, || !server.lines_matching("PART #lobby").is_empty()).await);
    assert!(!client.has_channel("#lobby"));

    pool.shutdown();
}

#[tokio::test]
async fn leave_unknown_channel_reports_not_found() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    let err = pool.leave_channel("#nowhere").unwrap_err();
    assert!(matches!(err, Error::ChannelNotFound(_)), "got {err:?}");
    // No side effects on the wire.
    assert!(server.lines_matching("PART ").is_empty());

    pool.shutdown();
}

#[tokio::test]
async fn join_beyond_capacity_is_rejected_without_a_join_line() {
    let server = ScriptedServer::start().await;
    let mut config = account(1, "scout", 1);
    config.channel_limit = 1;
    let store = MemStore::with_account(config, vec!["#only".into()]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);
    assert!(wait_for(WAIT, || !server.lines_matching("JOIN #only").is_empty()).await);

    let err = pool.join_channel(1, "#overflow").unwrap_err();
    assert!(matches!(err, Error::Capacity { limit: 1 }), "got {err:?}");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.lines_matching("JOIN #overflow").is_empty());

    pool.shutdown();
}

#[tokio::test]
async fn privmsg_and_action_reach_the_sink() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(7, "scout", 1), vec!["#lobby".into()]);
    let (pool, sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(7).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    server
        .send_to(0, ":alice!alice@host PRIVMSG #lobby :hello there")
        .await;
    server
        .send_to(0, ":bob!bob@host PRIVMSG #lobby :\u{1}ACTION waves\u{1}")
        .await;

    assert!(wait_for(WAIT, || sink.messages.lock().len() >= 2).await);
    let messages = sink.messages.lock().clone();
    assert_eq!(
        messages[0],
        (7, "#lobby".into(), "alice".into(), "hello there".into())
    );
    assert_eq!(
        messages[1],
        (7, "#lobby".into(), "bob".into(), "* waves".into())
    );

    pool.shutdown();
}

#[tokio::test]
async fn rate_limited_join_claims_are_retried_until_confirmed() {
    let server = ScriptedServer::start().await;
    let channels: Vec<String> = (0..5).map(|i| format!("#chan{i}")).collect();
    let mut config = account(1, "scout", 1);
    // Tighter than the claim batch, so some login JOINs are declined.
    config.rate.commands_per_sec = 2;
    let store = MemStore::with_account(config, channels);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    // All five are attached immediately; the declined JOINs are
    // re-issued until every one of them reaches the wire.
    assert!(wait_for(WAIT, || {
        client.assignment_snapshot().iter().all(|(_, s)| s.is_some())
    })
    .await);
    assert!(wait_for(WAIT, || {
        let mut names: Vec<String> = server
            .lines_matching("JOIN ")
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        names.sort();
        names.dedup();
        names.len() == 5
    })
    .await);

    pool.shutdown();
}

#[tokio::test]
async fn whisper_goes_straight_to_a_nick() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    pool.send_whisper(1, "alice", "psst").unwrap();
    assert!(wait_for(WAIT, || !server.lines_matching("PRIVMSG alice :psst").is_empty()).await);

    pool.shutdown();
}

#[tokio::test]
async fn burst_across_sessions_reaches_the_sink() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 2), vec![]);
    let (pool, sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 2).await);

    // Both connections have input pending at once; one readiness
    // wakeup must not starve the other session.
    server.send_to(0, ":a!a@host PRIVMSG #x :first").await;
    server.send_to(1, ":b!b@host PRIVMSG #y :second").await;
    assert!(wait_for(WAIT, || sink.messages.lock().len() >= 2).await);

    pool.shutdown();
}

#[tokio::test]
async fn leave_channel_spans_accounts() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec!["#shared".into()]);
    store.accounts.lock().push(account(2, "scout2", 1));
    store.set_channels(2, vec!["#shared".into()]);
    let (pool, _sink) = build_pool(&server, store);
    assert_eq!(pool.start_from_store().unwrap(), 2);
    let one = pool.account(1).unwrap();
    let two = pool.account(2).unwrap();
    assert!(wait_for(WAIT, || {
        one.logged_in_sessions() == 1 && two.logged_in_sessions() == 1
    })
    .await);
    assert!(wait_for(WAIT, || server.lines_matching("JOIN #shared").len() >= 2).await);

    pool.leave_channel("#shared").unwrap();
    assert!(!one.has_channel("#shared"));
    assert!(!two.has_channel("#shared"));
    assert!(wait_for(WAIT, || server.lines_matching("PART #shared").len() >= 2).await);

    pool.shutdown();
}

#[tokio::test]
async fn server_ping_gets_ponged() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    server.send_to(0, "PING :seine.test").await;
    assert!(wait_for(WAIT, || !server.lines_matching("PONG :seine.test").is_empty()).await);

    pool.shutdown();
}

#[tokio::test]
async fn outbound_message_prefers_the_attached_session() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec!["#lobby".into()]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);
    assert!(wait_for(WAIT, || !server.lines_matching("JOIN #lobby").is_empty()).await);

    pool.send_message(1, "#lobby", "greetings").unwrap();
    assert!(
        wait_for(WAIT, || !server
            .lines_matching("PRIVMSG #lobby :greetings")
            .is_empty())
        .await
    );

    pool.shutdown();
}

#[tokio::test]
async fn round_robin_degrades_to_a_session_when_all_are_down() {
    // Nothing listens on this address, so no session ever connects.
    let store = MemStore::with_account(account(1, "scout", 2), vec![]);
    let sink = Arc::new(CollectSink::default());
    let pool = Pool::new(
        fast_policy("127.0.0.1:1"),
        store,
        sink,
        Arc::new(LogStatsSink),
    );
    pool.start_from_store().unwrap();

    // A session is still selected — the transmit fails, it doesn't hang
    // and it doesn't report "no sessions".
    let err = pool.send_raw(1, "WHOIS someone").unwrap_err();
    match err {
        Error::Transport(msg) => assert!(msg.contains("transmit failed"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }

    pool.shutdown();
}

#[tokio::test]
async fn unknown_account_is_reported() {
    let server = ScriptedServer::start().await;
    let store = Arc::new(MemStore::default());
    let (pool, _sink) = build_pool(&server, store);
    assert!(matches!(
        pool.join_channel(99, "#x"),
        Err(Error::AccountNotFound(99))
    ));
    assert!(matches!(
        pool.remove_account(99),
        Err(Error::AccountNotFound(99))
    ));
    pool.shutdown();
}

#[tokio::test]
async fn duplicate_account_is_rejected() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store.clone());
    pool.add_account(account(1, "scout", 1)).unwrap();
    assert!(matches!(
        pool.add_account(account(1, "scout", 1)),
        Err(Error::AccountExists(1))
    ));
    pool.shutdown();
}

#[tokio::test]
async fn stats_snapshot_drains_counters() {
    let server = ScriptedServer::start().await;
    let store = MemStore::with_account(account(1, "scout", 1), vec![]);
    let (pool, _sink) = build_pool(&server, store);
    pool.start_from_store().unwrap();
    let client = pool.account(1).unwrap();
    assert!(wait_for(WAIT, || client.logged_in_sessions() == 1).await);

    let stats = pool.snapshot_stats(1).unwrap();
    assert_eq!(stats.len(), 1);
    let (_, snap) = &stats[0];
    assert_eq!(snap.connects_ok, 1);
    assert_eq!(snap.logins, 1);
    assert!(snap.lines_out >= 3, "login sequence counts as outbound");

    // Drained: an immediate second snapshot is empty.
    let again = pool.snapshot_stats(1).unwrap();
    assert_eq!(again[0].1.connects_ok, 0);
    assert_eq!(again[0].1.logins, 0);

    pool.shutdown();
}
