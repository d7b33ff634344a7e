mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ingest, spawn_stub, wait_for_terminal, CountingMailer, StubBehavior};
use docket_core::{
    AuditLog, BatchNotifier, BatchStatus, Mailer, NewDocument, NotificationBatch, Pipeline,
    ProcessingStatus, Storage, TemplateSet,
};
use futures::future::join_all;

async fn terminal_document(storage: &Storage, bytes: &[u8], status: ProcessingStatus) -> uuid::Uuid {
    let (doc, _) = storage
        .upsert_document(&NewDocument::from_bytes(bytes, "doc.txt", "text/plain", "text".into()))
        .await
        .unwrap();
    storage
        .transition_status(doc.id, ProcessingStatus::Pending, status, None)
        .await
        .unwrap();
    doc.id
}

async fn wait_for_batch(storage: &Storage, id: uuid::Uuid) -> NotificationBatch {
    for _ in 0..500 {
        let batch = storage.get_batch(id).await.unwrap();
        if batch.status.is_terminal() {
            return batch;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {id} never finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_terminal_triggers_dispatch_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("docket.db");
    let storage = Storage::open(path.to_str().unwrap()).await.unwrap();

    let a = terminal_document(&storage, b"a", ProcessingStatus::Completed).await;
    let b = terminal_document(&storage, b"b", ProcessingStatus::Failed).await;
    let batch = NotificationBatch::new("ops@example.com", vec![a, b]);
    storage.insert_batch(&batch).await.unwrap();

    let mailer = Arc::new(CountingMailer {
        delay: Some(Duration::from_millis(50)),
        ..CountingMailer::default()
    });
    let notifier = BatchNotifier::new(
        storage.clone(),
        AuditLog::new(storage.clone()),
        Some(mailer.clone() as Arc<dyn Mailer>),
        "docket@test",
    );

    let triggers = (0..16).map(|i| {
        let notifier = notifier.clone();
        let id = if i % 2 == 0 { a } else { b };
        tokio::spawn(async move { notifier.on_document_terminal(id).await })
    });
    for joined in join_all(triggers).await {
        joined.unwrap();
    }

    assert_eq!(mailer.count(), 1);
    let stored = storage.get_batch(batch.id).await.unwrap();
    assert_eq!(stored.status, BatchStatus::Completed);

    let notification = mailer.last.lock().unwrap().clone().unwrap();
    assert!(notification.body.contains("1 completed, 1 failed"));
}

#[tokio::test]
async fn batch_of_processed_documents_is_delivered_once() {
    let stub = spawn_stub(StubBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("docket.db");
    let storage = Storage::open(path.to_str().unwrap()).await.unwrap();

    let mailer = Arc::new(CountingMailer::default());
    let pipeline = Pipeline::with_mailer(
        storage,
        &common::config(&stub.url),
        Some(mailer.clone() as Arc<dyn Mailer>),
    )
    .unwrap();

    let first = ingest(&pipeline, b"first").await;
    let second = ingest(&pipeline, b"second").await;
    let batch = pipeline
        .notifier()
        .create_batch("ops@example.com", [first.id.to_string(), second.id.to_string()])
        .await
        .unwrap();

    pipeline.orchestrator.start(first.id, &TemplateSet::default()).await.unwrap();
    pipeline.orchestrator.start(second.id, &TemplateSet::default()).await.unwrap();
    wait_for_terminal(&pipeline.storage, first.id).await;
    wait_for_terminal(&pipeline.storage, second.id).await;

    let finished = wait_for_batch(&pipeline.storage, batch.id).await;
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(mailer.count(), 1);

    let notification = mailer.last.lock().unwrap().clone().unwrap();
    assert_eq!(notification.to, "ops@example.com");
    let export: serde_json::Value =
        serde_json::from_str(&notification.attachments[0].content).unwrap();
    assert_eq!(export["documents"].as_array().unwrap().len(), 2);
    assert_eq!(export["documents"][0]["status"], "COMPLETED");
}

#[tokio::test]
async fn batch_of_finished_documents_is_delivered_on_creation() {
    let storage = Storage::open_memory().await.unwrap();
    let a = terminal_document(&storage, b"a", ProcessingStatus::Completed).await;

    let mailer = Arc::new(CountingMailer::default());
    let notifier = BatchNotifier::new(
        storage.clone(),
        AuditLog::new(storage.clone()),
        Some(mailer.clone() as Arc<dyn Mailer>),
        "docket@test",
    );

    let batch = notifier
        .create_batch("ops@example.com", [a.to_string()])
        .await
        .unwrap();

    let finished = wait_for_batch(&storage, batch.id).await;
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(mailer.count(), 1);
}

#[tokio::test]
async fn completed_batch_is_never_sent_again() {
    let storage = Storage::open_memory().await.unwrap();
    let a = terminal_document(&storage, b"a", ProcessingStatus::Completed).await;
    let batch = NotificationBatch::new("ops@example.com", vec![a]);
    storage.insert_batch(&batch).await.unwrap();

    let mailer = Arc::new(CountingMailer::default());
    let notifier = BatchNotifier::new(
        storage.clone(),
        AuditLog::new(storage.clone()),
        Some(mailer.clone() as Arc<dyn Mailer>),
        "docket@test",
    );

    notifier.on_document_terminal(a).await;
    notifier.on_document_terminal(a).await;
    notifier.try_deliver(batch.id).await;

    assert_eq!(mailer.count(), 1);
}
