use std::time::Duration;

use busysync::calendar::db::{get_calendar, list_calendars_for_account};
use busysync::calendar::lock::CalendarLease;
use busysync::correlation::{CorrelationId, CorrelationMetadata, EventKind, LifecycleState};
use busysync::provider::EventTime;

mod test_utils;
use test_utils::{at, seed_calendar, test_env, test_env_with};

#[tokio::test]
async fn it_reclaims_placeholders_left_pending() {
    let env = test_env_with(|config| config.pending_grace = Duration::ZERO).await;
    seed_calendar(&env.db, "me@work.test", "me", "work").await;
    let home = seed_calendar(&env.db, "me@home.test", "me", "home").await;

    // A pass crashed after the insert landed but before it was confirmed
    let source = CorrelationId::generate();
    let pending = env
        .service
        .correlations
        .begin_placeholder(
            &home,
            &source,
            "Busy",
            Some(EventTime::DateTime(at(1, 9))),
            Some(EventTime::DateTime(at(1, 10))),
        )
        .await
        .unwrap();
    env.api.add_event_with_properties(
        "home",
        "Busy",
        at(1, 9),
        at(1, 10),
        CorrelationMetadata::placeholder(pending.correlation_id.clone(), source).to_properties(),
    );
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = env.service.reconcile_orphans().await.unwrap();

    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed_cleaned, 1);
    assert_eq!(report.failed_retained, 0);
    assert!(env.api.events("home").is_empty());
    assert!(env.service.correlations.get(&pending.correlation_id).await.unwrap().is_none());
}

#[tokio::test]
async fn it_resyncs_cleanly_after_reclaiming_a_stuck_placeholder() {
    let env = test_env_with(|config| config.pending_grace = Duration::ZERO).await;
    let work = seed_calendar(&env.db, "me@work.test", "me", "work").await;
    let home = seed_calendar(&env.db, "me@home.test", "me", "home").await;
    env.api.add_event("work", "Standup", at(1, 9), at(1, 10));
    env.service.trigger_sync(work.id).await.unwrap();
    env.settle().await;

    // The confirmation of the create never made it to the store
    env.db
        .call(|conn| {
            conn.execute(
                "UPDATE event_correlation
                 SET lifecycle_state = 'Pending', provider_event_id = NULL
                 WHERE kind = 'PlaceholderBlock'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = env.service.reconcile_orphans().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed_cleaned, 1);
    assert!(env.api.events_of_kind("home", "PlaceholderBlock").is_empty());

    let report = env.service.trigger_full_resync(work.id).await.unwrap();
    assert_eq!(report.placeholders_created, 1);
    assert_eq!(env.api.events_of_kind("home", "PlaceholderBlock").len(), 1);
    let placeholders: Vec<_> = env
        .service
        .correlations
        .records_for_calendar(home.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == EventKind::PlaceholderBlock)
        .collect();
    assert_eq!(placeholders.len(), 1);
    assert_eq!(placeholders[0].lifecycle_state, LifecycleState::Materialized);
}

#[tokio::test]
async fn it_gives_up_on_placeholders_never_found() {
    let env = test_env_with(|config| {
        config.pending_grace = Duration::ZERO;
        config.failed_search_window = Duration::ZERO;
    })
    .await;
    seed_calendar(&env.db, "me@work.test", "me", "work").await;
    let home = seed_calendar(&env.db, "me@home.test", "me", "home").await;
    let pending = env
        .service
        .correlations
        .begin_placeholder(&home, &CorrelationId::generate(), "Busy", None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = env.service.reconcile_orphans().await.unwrap();

    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed_cleaned, 1);
    assert!(env.service.correlations.get(&pending.correlation_id).await.unwrap().is_none());
}

#[tokio::test]
async fn it_keeps_recent_pending_placeholders() {
    let env = test_env().await;
    seed_calendar(&env.db, "me@work.test", "me", "work").await;
    let home = seed_calendar(&env.db, "me@home.test", "me", "home").await;
    let source = CorrelationId::generate();
    let pending = env
        .service
        .correlations
        .begin_placeholder(&home, &source, "Busy", None, None)
        .await
        .unwrap();

    let report = env.service.reconcile_orphans().await.unwrap();

    assert_eq!(report.reclaimed, 0);
    let record = env.service.correlations.get(&pending.correlation_id).await.unwrap().unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::Pending);
}

#[tokio::test]
async fn it_purges_placeholders_whose_source_is_gone() {
    let env = test_env().await;
    let work = seed_calendar(&env.db, "me@work.test", "me", "work").await;
    seed_calendar(&env.db, "me@home.test", "me", "home").await;
    env.api.add_event("work", "Standup", at(1, 9), at(1, 10));
    env.service.trigger_sync(work.id).await.unwrap();
    env.settle().await;

    let source = env
        .service
        .correlations
        .records_for_calendar(work.id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.kind == EventKind::UserEvent)
        .unwrap();
    env.service.correlations.forget(&source.correlation_id).await.unwrap();

    let report = env.service.reconcile_orphans().await.unwrap();
    assert_eq!(report.dangling_purged, 1);
    assert!(env.api.events("home").is_empty());
}

#[tokio::test]
async fn it_clears_expired_leases() {
    let env = test_env().await;
    let work = seed_calendar(&env.db, "me@work.test", "me", "work").await;
    CalendarLease::acquire(&env.db, work.id, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = env.service.reconcile_orphans().await.unwrap();
    assert_eq!(report.leases_cleared, 1);
}

#[tokio::test]
async fn it_discovers_calendars_and_disables_missing_ones() {
    let env = test_env().await;
    let work = seed_calendar(&env.db, "me@work.test", "me", "work").await;
    seed_calendar(&env.db, "me@home.test", "me", "home").await;
    env.api.add_account_calendar("me@work.test", "work", "Work");
    env.api.add_account_calendar("me@work.test", "projects", "Projects");

    let found = env.service.discover_calendars("me@work.test").await.unwrap();
    assert_eq!(found.len(), 2);
    let work = get_calendar(&env.db, work.id).await.unwrap().unwrap();
    assert_eq!(work.name, "Work");

    // Busy time from "projects" is mirrored, then the calendar disappears
    let projects = found.iter().find(|c| c.provider_calendar_id == "projects").unwrap();
    env.api.add_event("projects", "Sprint review", at(2, 10), at(2, 11));
    env.service.trigger_sync(projects.id).await.unwrap();
    assert_eq!(env.api.events_of_kind("home", "PlaceholderBlock").len(), 1);

    env.api.remove_account_calendar("me@work.test", "projects");
    env.service.discover_calendars("me@work.test").await.unwrap();

    let calendars = list_calendars_for_account(&env.db, "me@work.test").await.unwrap();
    let projects = calendars.iter().find(|c| c.provider_calendar_id == "projects").unwrap();
    assert!(!projects.sync_enabled);
    assert!(env.api.events_of_kind("home", "PlaceholderBlock").is_empty());
    assert!(env.api.events_of_kind("work", "PlaceholderBlock").is_empty());
}

#[tokio::test]
async fn it_undoes_everything_when_a_calendar_is_deleted() {
    let env = test_env().await;
    let work = seed_calendar(&env.db, "me@work.test", "me", "work").await;
    let home = seed_calendar(&env.db, "me@home.test", "me", "home").await;
    env.api.add_event("work", "Standup", at(1, 9), at(1, 10));
    env.api.add_event("home", "Dentist", at(1, 15), at(1, 16));
    env.service.trigger_sync(work.id).await.unwrap();
    env.service.trigger_sync(home.id).await.unwrap();
    env.settle().await;
    assert_eq!(env.api.events_of_kind("work", "PlaceholderBlock").len(), 1);
    assert_eq!(env.api.events_of_kind("home", "PlaceholderBlock").len(), 1);

    let report = env.service.delete_calendar(home.id).await.unwrap();

    assert_eq!(report.placeholders_deleted, 2);
    assert!(env.api.events_of_kind("work", "PlaceholderBlock").is_empty());
    assert!(env.api.events_of_kind("home", "PlaceholderBlock").is_empty());
    assert!(get_calendar(&env.db, home.id).await.unwrap().is_none());
    assert!(env.service.correlations.records_for_calendar(work.id).await.unwrap().len() == 1);
}
