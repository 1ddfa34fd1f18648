//! End-to-end runs of the coordinator against a temporary database and an
//! in-memory archive

mod helpers;

use bytes::Bytes;
use helpers::*;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use paddock_common::SourceKind;
use paddock_ingest::archive::{fingerprint, RawArchive};
use paddock_ingest::coordinator::{RunState, UnitStage, UnitStatus};
use paddock_ingest::error::{ErrorClass, FetchError, RunError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_rerun_archives_once_and_leaves_rows_unchanged() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let archive = RawArchive::in_memory();
    let client = ScriptedClient::fixtures();
    let coordinator = coordinator(client.clone(), archive.clone(), &pool, 2);
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);

    let first = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    assert_eq!(first.state, RunState::Done);
    assert_eq!(first.payloads_archived, 1);
    assert_eq!(first.payloads_duplicate, 0);
    let laps_after_first = lap_rows(&pool).await;
    assert_eq!(laps_after_first.len(), 8);

    let second = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    assert_eq!(second.state, RunState::Done);
    assert_eq!(second.payloads_archived, 0);
    assert_eq!(second.payloads_duplicate, 1);

    assert_eq!(
        archive
            .list(date("2024-03-02"), SourceKind::Results)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(lap_rows(&pool).await, laps_after_first);
    assert_eq!(count(&pool, "drivers").await, 2);
    assert_eq!(count(&pool, "races").await, 1);
    assert_eq!(count(&pool, "aggregations").await, 2);
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn test_aggregations_follow_stored_laps() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let coordinator = coordinator(ScriptedClient::fixtures(), RawArchive::in_memory(), &pool, 2);
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);

    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.aggregations_recomputed, 2);

    // Lap 4 is slow and drops three places: counted as a pit lap
    assert_eq!(aggregation_for(&pool, "hamilton").await, Some((Some(91_234), Some(3), 1)));
    assert_eq!(
        aggregation_for(&pool, "max_verstappen").await,
        Some((Some(95_800), Some(3), 0))
    );
}

#[tokio::test]
async fn test_corrected_payload_replaces_lap_and_aggregation() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let archive = RawArchive::in_memory();
    let original = fixture("results_2024_1.json");
    let corrected = Bytes::from(
        String::from_utf8(original.to_vec())
            .unwrap()
            .replace("1:31.234", "1:30.500"),
    );
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);

    let first = coordinator(
        ScriptedClient::new(move |_, _| Ok(original.clone())),
        archive.clone(),
        &pool,
        1,
    );
    first.run(&req, CancellationToken::new()).await.unwrap();

    let second = coordinator(
        ScriptedClient::new(move |_, _| Ok(corrected.clone())),
        archive.clone(),
        &pool,
        1,
    );
    let summary = second.run(&req, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.payloads_archived, 1);

    let hamilton_lap_3: Vec<_> = lap_rows(&pool)
        .await
        .into_iter()
        .filter(|(driver, lap, _)| driver == "hamilton" && *lap == 3)
        .collect();
    assert_eq!(hamilton_lap_3, vec![("hamilton".to_string(), 3, Some(90_500))]);
    assert_eq!(
        aggregation_for(&pool, "hamilton").await.unwrap().0,
        Some(90_500)
    );
    assert_eq!(
        archive
            .list(date("2024-03-02"), SourceKind::Results)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_all_transient_failures_end_failed() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let client = ScriptedClient::new(|_, _| Err(transient("HTTP 503")));
    let coordinator = coordinator(client.clone(), RawArchive::in_memory(), &pool, 2);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results, SourceKind::Telemetry],
        &[round(2024, 1), round(2024, 2)],
    );

    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.units_attempted, 4);
    assert_eq!(summary.units_succeeded, 0);
    assert_eq!(summary.errors_by_class.get(&ErrorClass::TransientFetch), Some(&4));
    assert!(summary.outcomes.iter().all(|o| o.stage == UnitStage::Fetch));
    assert_eq!(count(&pool, "lap_times").await, 0);
    assert_eq!(
        summary.transitions.last().map(|t| t.new_state),
        Some(RunState::Failed)
    );
}

#[tokio::test]
async fn test_one_failing_unit_does_not_stop_the_others() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let results = fixture("results_2024_1.json");
    let client = ScriptedClient::new(move |kind, _| match kind {
        SourceKind::Results => Ok(results.clone()),
        SourceKind::Telemetry => Ok(Bytes::from_static(b"<html>maintenance</html>")),
    });
    let coordinator = coordinator(client, RawArchive::in_memory(), &pool, 2);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results, SourceKind::Telemetry],
        &[round(2024, 1)],
    );

    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.units_succeeded, 1);
    assert_eq!(summary.errors_by_class.get(&ErrorClass::Parse), Some(&1));
    // Unparseable payloads are still archived for later inspection
    assert_eq!(summary.payloads_archived, 2);
    assert_eq!(count(&pool, "lap_times").await, 8);
}

#[tokio::test]
async fn test_dropped_rows_are_counted_and_the_rest_written() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let coordinator = coordinator(ScriptedClient::fixtures(), RawArchive::in_memory(), &pool, 1);
    let req = request("2024-03-02", &[SourceKind::Telemetry], &[round(2024, 1)]);

    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();

    // BOT never appears in the session results
    assert_eq!(summary.rows_dropped, 1);
    assert_eq!(count(&pool, "lap_times").await, 8);
    let pits: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM lap_times WHERE pit_flag = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(pits, 1);
}

#[tokio::test]
async fn test_configuration_failure_aborts_remaining_units() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let client = ScriptedClient::new(|_, _| {
        Err(FetchError::Permanent {
            status: Some(401),
            message: "invalid token".to_string(),
            configuration: true,
        })
    });
    let coordinator = coordinator(client.clone(), RawArchive::in_memory(), &pool, 1);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results],
        &[round(2024, 1), round(2024, 2), round(2024, 3)],
    );

    let err = coordinator.run(&req, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RunError::Configuration(_)));
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_counted_separately() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let results = fixture("results_2024_1.json");
    let client = ScriptedClient::new(move |_, params| match params.race {
        paddock_ingest::clients::RaceSelector::Round { round: 1, .. } => Ok(results.clone()),
        _ => Err(FetchError::Permanent {
            status: Some(404),
            message: "no such race".to_string(),
            configuration: false,
        }),
    });
    let coordinator = coordinator(client, RawArchive::in_memory(), &pool, 2);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results],
        &[round(2024, 1), round(2024, 99)],
    );

    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.errors_by_class.get(&ErrorClass::PermanentFetch), Some(&1));
}

#[tokio::test]
async fn test_replay_renormalizes_archive_without_network() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let archive = RawArchive::in_memory();

    let fetching = coordinator(ScriptedClient::fixtures(), archive.clone(), &pool, 2);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results, SourceKind::Telemetry],
        &[round(2024, 1)],
    );
    fetching.run(&req, CancellationToken::new()).await.unwrap();
    sqlx::query("DELETE FROM aggregations").execute(&pool).await.unwrap();

    let offline = ScriptedClient::new(|_, _| Err(transient("network is off")));
    let replaying = coordinator(offline.clone(), archive, &pool, 2);
    let mut replay = req.clone();
    replay.replay = true;

    let summary = replaying.run(&replay, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.units_succeeded, 2);
    assert_eq!(summary.payloads_fetched, 0);
    assert_eq!(offline.calls(), 0);
    assert_eq!(count(&pool, "aggregations").await, 2);
    assert!(summary
        .transitions
        .iter()
        .all(|t| t.new_state != RunState::Fetching));
}

#[tokio::test]
async fn test_cancelled_run_starts_no_units() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let client = ScriptedClient::fixtures();
    let coordinator = coordinator(client.clone(), RawArchive::in_memory(), &pool, 2);
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = coordinator.run(&req, cancel).await.unwrap();

    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.units_cancelled, 1);
    assert!(matches!(summary.outcomes[0].status, UnitStatus::Cancelled));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_latest_is_used_when_no_race_is_given() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let client = ScriptedClient::fixtures();
    let coordinator = coordinator(client.clone(), RawArchive::in_memory(), &pool, 1);

    coordinator
        .run(
            &request("2024-03-02", &[SourceKind::Results], &[]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        client.seen(),
        vec![(SourceKind::Results, paddock_ingest::clients::RaceSelector::Latest)]
    );
}

#[tokio::test]
async fn test_mock_file_pipeline_end_to_end() {
    let temp = tempfile::TempDir::new().unwrap();
    let mut config =
        paddock_common::config::PipelineConfig::for_tests(temp.path().join("paddock.db"));
    config.archive = paddock_common::config::ArchiveBackend::Local {
        root: temp.path().join("archive"),
    };

    let coordinator = paddock_ingest::open_pipeline(
        &config,
        Some(fixture_path("results_2024_1.json")),
    )
    .await
    .unwrap();
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);
    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert!(temp.path().join("archive").join("raw").join("2024-03-02").exists());
}

#[tokio::test]
async fn test_configuration_abort_still_aggregates_committed_units() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let results = fixture("results_2024_1.json");
    let client = ScriptedClient::new(move |kind, _| match kind {
        SourceKind::Results => Ok(results.clone()),
        SourceKind::Telemetry => Err(FetchError::Permanent {
            status: Some(401),
            message: "token expired".to_string(),
            configuration: true,
        }),
    });
    // One worker: results runs and commits before telemetry aborts
    let coordinator = coordinator(client, RawArchive::in_memory(), &pool, 1);
    let req = request(
        "2024-03-02",
        &[SourceKind::Results, SourceKind::Telemetry],
        &[round(2024, 1)],
    );

    let err = coordinator.run(&req, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RunError::Configuration(_)));
    assert_eq!(count(&pool, "lap_times").await, 8);
    assert_eq!(count(&pool, "aggregations").await, 2);
    assert_eq!(
        aggregation_for(&pool, "hamilton").await,
        Some((Some(91_234), Some(3), 1))
    );
}

#[tokio::test]
async fn test_busy_database_is_retried_once() {
    let (dir, pool) = create_test_db_with_busy_timeout(Duration::from_millis(50))
        .await
        .unwrap();
    let mut blocker = lock_database(&dir).await.unwrap();
    let release = tokio::spawn(async move {
        // Past the first attempt, before the retry
        tokio::time::sleep(Duration::from_millis(150)).await;
        sqlx::query("COMMIT").execute(&mut blocker).await.unwrap();
    });

    let coordinator = coordinator(ScriptedClient::fixtures(), RawArchive::in_memory(), &pool, 1);
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);
    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    release.await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.units_succeeded, 1);
    assert!(summary.errors_by_class.is_empty());
    assert_eq!(count(&pool, "lap_times").await, 8);
    assert_eq!(count(&pool, "aggregations").await, 2);
}

#[tokio::test]
async fn test_database_busy_past_retry_fails_unit() {
    let (dir, pool) = create_test_db_with_busy_timeout(Duration::from_millis(50))
        .await
        .unwrap();
    let mut blocker = lock_database(&dir).await.unwrap();

    let coordinator = coordinator(ScriptedClient::fixtures(), RawArchive::in_memory(), &pool, 1);
    let req = request("2024-03-02", &[SourceKind::Results], &[round(2024, 1)]);
    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();
    sqlx::query("COMMIT").execute(&mut blocker).await.unwrap();

    assert_eq!(summary.state, RunState::Failed);
    assert_eq!(summary.errors_by_class.get(&ErrorClass::Persistence), Some(&1));
    assert_eq!(summary.outcomes[0].stage, UnitStage::Persist);
    // Archived before the write failed, so a replay can pick it up
    assert_eq!(summary.payloads_archived, 1);
    assert_eq!(count(&pool, "lap_times").await, 0);
}

#[tokio::test]
async fn test_integrity_failure_is_isolated_to_its_unit() {
    let (_dir, pool) = create_test_db().await.unwrap();
    let store = Arc::new(InMemory::new());
    let results = fixture("results_2024_1.json");
    let fp = fingerprint(&results);

    // An earlier copy under the same fingerprint whose bytes were altered
    let stored_at = format!("raw/2024-03-01/results/{}", fp);
    store
        .put(
            &Path::from(format!("raw/_index/results/{}", fp)),
            PutPayload::from(Bytes::from(stored_at.clone())),
        )
        .await
        .unwrap();
    store
        .put(
            &Path::from(stored_at),
            PutPayload::from(Bytes::from_static(b"{\"tampered\": true}")),
        )
        .await
        .unwrap();

    let coordinator = coordinator(
        ScriptedClient::fixtures(),
        RawArchive::new(store),
        &pool,
        2,
    );
    let req = request(
        "2024-03-02",
        &[SourceKind::Results, SourceKind::Telemetry],
        &[round(2024, 1)],
    );
    let summary = coordinator.run(&req, CancellationToken::new()).await.unwrap();

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.units_succeeded, 1);
    assert_eq!(summary.errors_by_class.get(&ErrorClass::Integrity), Some(&1));
    let failed = summary
        .outcomes
        .iter()
        .find(|o| o.unit.kind() == SourceKind::Results)
        .unwrap();
    assert_eq!(failed.stage, UnitStage::Archive);
    // Telemetry laps still landed
    assert_eq!(count(&pool, "lap_times").await, 8);
}

