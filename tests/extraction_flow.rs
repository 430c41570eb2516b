//! End-to-end extraction scenarios against a scripted upstream.

mod common;

use std::time::Duration;

use common::{seed_documents, Harness, LinkBehavior, PROCESS, TENANT};
use conectasei::models::{
    AccessType, CategoryStatus, DocumentStatus, LinkStatus, TaskStatus, RESTRICTED_CATEGORY,
};
use conectasei::services::BeginExtraction;

#[tokio::test]
async fn fresh_extraction_with_integral_access() {
    let harness = Harness::new();
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );
    harness.script.set_authority("Dr. Silva");

    let task = harness.extractor().run(TENANT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.new_processes, 1);
    assert_eq!(summary.updated_processes, 0);
    assert_eq!(summary.new_documents, 2);
    assert_eq!(summary.failures, 0);

    let process = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(process.access_type, Some(AccessType::Integral));
    assert_eq!(process.category.as_deref(), Some(RESTRICTED_CATEGORY));
    assert_eq!(process.category_status, Some(CategoryStatus::Categorized));
    assert_eq!(process.authority.as_deref(), Some("Dr. Silva"));
    assert_eq!(process.best_current_link.as_deref(), Some("ABC"));
    assert!(!process.no_valid_links);
    assert_eq!(process.documents.len(), 2);
    assert_eq!(
        process.documents["10000001"].status,
        DocumentStatus::NotDownloaded
    );
    assert_eq!(
        process.documents["10000002"].status,
        DocumentStatus::NotDownloaded
    );

    // New documents are reported grouped by signer.
    let digests = harness.sink.digests.lock().unwrap();
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[0].process_number, PROCESS);
    assert_eq!(
        digests[0].documents_by_signer["Dr. Silva"],
        vec!["10000001"]
    );
}

#[tokio::test]
async fn partial_access_flips_to_integral_on_second_link() {
    let harness = Harness::new();

    // First run: the process is known through ABC with integral access.
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );
    harness.extractor().run(TENANT).await.unwrap();

    // Second run: listed twice; ABC degraded to partial, DEF is integral.
    harness
        .script
        .set_listings(vec![(PROCESS, "ABC"), (PROCESS, "DEF")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Partial, vec![]),
    );
    harness.script.set_link(
        "DEF",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );

    let task = harness.extractor().run(TENANT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.new_processes, 0);
    assert_eq!(summary.updated_processes, 1);

    let process = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(process.access_type, Some(AccessType::Integral));
    assert_eq!(process.best_current_link.as_deref(), Some("DEF"));
    assert_eq!(process.category_status, Some(CategoryStatus::Categorized));

    // Two more link-history entries landed in this run (one per link).
    assert_eq!(process.links["ABC"].history.len(), 2);
    assert_eq!(process.links["DEF"].history.len(), 1);
}

#[tokio::test]
async fn dead_links_disable_the_process_without_failures() {
    let harness = Harness::new();

    // Make the process known through two links.
    harness
        .script
        .set_listings(vec![(PROCESS, "ABC"), (PROCESS, "DEF")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );
    harness.script.set_link(
        "DEF",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );
    harness.extractor().run(TENANT).await.unwrap();

    // Both links now error out.
    harness.script.set_link("ABC", LinkBehavior::NavError);
    harness.script.set_link("DEF", LinkBehavior::NavError);

    let task = harness.extractor().run(TENANT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.failures, 0);
    assert_eq!(summary.new_documents, 0);

    let process = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();
    assert!(process.no_valid_links);
    assert!(process
        .links
        .values()
        .all(|l| l.status == LinkStatus::Inactive));
    // The documents map is untouched by a disabled run.
    assert_eq!(process.documents.len(), 2);
}

#[tokio::test]
async fn partial_access_on_new_process_skips_documents() {
    let harness = Harness::new();
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Partial, seed_documents()),
    );

    let task = harness.extractor().run(TENANT).await.unwrap();
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.new_processes, 1);
    assert_eq!(summary.new_documents, 0);

    let process = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(process.category_status, Some(CategoryStatus::Pending));
    assert!(process.documents.is_empty());

    // The pending process shows up in the categorization digest.
    let pending = harness.sink.pending.lock().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].process_number, PROCESS);
}

#[tokio::test]
async fn zero_process_tenant_completes_with_empty_summary() {
    let harness = Harness::new();
    harness.script.set_listings(vec![]);

    let task = harness.extractor().run(TENANT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.new_processes, 0);
    assert_eq!(summary.new_documents, 0);
    assert_eq!(summary.failures, 0);
}

#[tokio::test]
async fn second_run_against_unchanged_upstream_is_idempotent() {
    let harness = Harness::new();
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Access(AccessType::Integral, seed_documents()),
    );
    harness.script.set_authority("Dr. Silva");

    harness.extractor().run(TENANT).await.unwrap();
    let first = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();

    let task = harness.extractor().run(TENANT).await.unwrap();
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.new_processes, 0);
    assert_eq!(summary.new_documents, 0);

    let second = harness
        .processes
        .get_by_number(TENANT, PROCESS)
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.access_type, first.access_type);
    assert_eq!(second.category, first.category);
    assert_eq!(second.authority, first.authority);
    assert_eq!(
        second.documents.keys().collect::<Vec<_>>(),
        first.documents.keys().collect::<Vec<_>>()
    );
    // Only the link history grows.
    assert_eq!(
        second.links["ABC"].history.len(),
        first.links["ABC"].history.len() + 1
    );
}

#[tokio::test]
async fn malformed_process_numbers_are_discarded_at_discovery() {
    let harness = Harness::new();
    harness
        .script
        .set_listings(vec![(PROCESS, "ABC"), ("12345.1234/2024-56", "XYZ")]);
    harness
        .script
        .set_link("ABC", LinkBehavior::Access(AccessType::Integral, vec![]));

    let task = harness.extractor().run(TENANT).await.unwrap();
    let summary = task.result_summary.unwrap();
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.new_processes, 1);
    assert!(harness
        .processes
        .get_by_number(TENANT, "12345.1234/2024-56")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unreachable_upstream_fails_the_run() {
    let harness = Harness::new();
    harness
        .provider
        .fail_acquire
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let task = harness.extractor().run(TENANT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.is_some());
    assert!(task.result_summary.is_none());

    // The tenant slot was released: a later run starts fresh.
    assert!(matches!(
        harness.control.begin_extraction(TENANT).unwrap(),
        BeginExtraction::Started(_)
    ));
}

#[tokio::test]
async fn missing_scraper_version_is_fatal() {
    let harness = Harness::new();
    let mut tenant = harness.tenants.get(TENANT).unwrap().unwrap();
    tenant.scraper_version = "9.9.9".to_string();
    harness.tenants.save(&tenant).unwrap();

    let task = harness.extractor().run(TENANT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .error_message
        .unwrap()
        .contains("no scraper plugin registered"));
}

#[tokio::test]
async fn cancellation_fails_the_task_with_reason() {
    let harness = Harness::new();
    // A slow link keeps the worker busy long enough to cancel mid-run.
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Slow(Duration::from_millis(800), AccessType::Integral),
    );

    let extractor = harness.extractor();
    let control = harness.control.clone();
    let runner = tokio::spawn(async move { extractor.run(TENANT).await });

    // Wait for the task row to go live, then cancel it.
    let task_id = loop {
        if let Ok(Some(row)) = harness.control.live_extraction(TENANT) {
            break row.id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    control.cancel(&task_id);

    let task = runner.await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn concurrent_requests_coalesce_onto_one_task() {
    let harness = Harness::new();
    harness.script.set_listings(vec![(PROCESS, "ABC")]);
    harness.script.set_link(
        "ABC",
        LinkBehavior::Slow(Duration::from_millis(500), AccessType::Integral),
    );

    let extractor = harness.extractor();
    let first = {
        let extractor = extractor.clone();
        tokio::spawn(async move { extractor.run(TENANT).await })
    };

    // Wait until the first run is live, then ask again.
    while !harness.control.extraction_running(TENANT) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let second = extractor.run(TENANT).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.id, second.id);
}
