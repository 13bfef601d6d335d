//! End-to-end batch runs against the stub ComfyUI server.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use comfybatch_core::batch::{from_images, from_prompts};
use comfybatch_core::job::{JobStatus, REPORT_FILE_NAME};
use comfybatch_pipeline::batch::BatchRunner;
use comfybatch_pipeline::events::BatchEvent;
use comfybatch_pipeline::translate::{PromptTranslator, TranslateError, Translator};

use common::{context, options, spawn_stub, write_png, FLAKY_FAILURES};

#[tokio::test]
async fn image_batch_substitutes_fields_and_saves_outputs() {
    let (url, stub) = spawn_stub(false).await;
    let inputs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let cat = write_png(inputs.path(), "cat.png");
    let dog = write_png(inputs.path(), "dog.png");

    let mut opts = options(out.path());
    opts.overrides.insert("cfg".into(), "5.5".into());
    let runner = BatchRunner::new(context(&url, opts));
    let mut events = runner.subscribe();

    let items = from_images(
        vec![cat, dog],
        &["a cat".to_string(), "a dog pair".to_string()],
        Some("blurry"),
    )
    .unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert!(report.all_succeeded(), "{:?}", report.results);
    assert_eq!(report.results[0].outputs, vec![out.path().join("0001_cat.png")]);
    assert_eq!(
        report.results[1].outputs,
        vec![out.path().join("0002_dog.png"), out.path().join("0002_dog_2.png")]
    );
    assert_eq!(
        std::fs::read_to_string(out.path().join("0001_cat.png")).unwrap(),
        "image:p-1_00001_.png"
    );
    assert!(out.path().join(REPORT_FILE_NAME).is_file());

    let submitted = stub.submitted.lock().unwrap();
    let first = &submitted[0]["prompt"];
    assert_eq!(first["6"]["inputs"]["text"], "a cat");
    assert_eq!(first["7"]["inputs"]["text"], "blurry");
    assert_eq!(first["10"]["inputs"]["image"], "batch/cat.png");
    assert_eq!(first["3"]["inputs"]["steps"], 30);
    assert_eq!(first["3"]["inputs"]["cfg"], 5.5);
    assert_eq!(first["3"]["inputs"]["seed"], 100);
    assert_eq!(submitted[1]["prompt"]["3"]["inputs"]["seed"], 101);
    assert!(submitted[0]["client_id"].as_str().is_some_and(|c| !c.is_empty()));
    assert_eq!(*stub.uploads.lock().unwrap(), vec!["cat.png", "dog.png"]);

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let BatchEvent::BatchFinished { succeeded, failed, .. } = event {
            finished = Some((succeeded, failed));
        }
    }
    assert_eq!(finished, Some((2, 0)));
}

#[tokio::test]
async fn failing_item_does_not_stop_the_batch() {
    let (url, _stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let runner = BatchRunner::new(context(&url, options(out.path())));

    let items = from_prompts(
        vec!["first".into(), "this will fail".into(), "third".into()],
        None,
    )
    .unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, [JobStatus::Success, JobStatus::Failed, JobStatus::Success]);
    assert_eq!(report.results[1].prompt_id.as_deref(), Some("p-2"));
    assert_matches!(&report.results[1].error, Some(e) if e.contains("KSampler: boom"));
    // Text-only items are named by number alone.
    assert_eq!(report.results[2].outputs, vec![out.path().join("0003.png")]);
    assert!(!report.all_succeeded());
}

#[tokio::test]
async fn missing_input_image_fails_only_that_item() {
    let (url, stub) = spawn_stub(false).await;
    let inputs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let good = write_png(inputs.path(), "good.png");
    let missing = inputs.path().join("missing.png");

    let runner = BatchRunner::new(context(&url, options(out.path())));
    let items = from_images(vec![missing, good], &["shared".to_string()], None).unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.results[0].status, JobStatus::Failed);
    assert_eq!(report.results[0].prompt_id, None);
    assert_eq!(report.results[1].status, JobStatus::Success);
    assert_eq!(stub.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_before_start_skips_everything() {
    let (url, stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let runner = BatchRunner::new(context(&url, options(out.path())));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let items = from_prompts(vec!["a".into(), "b".into()], None).unwrap();
    let report = runner.run(&items, &cancel).await.unwrap();

    assert_eq!(report.count(JobStatus::Skipped), 2);
    assert!(stub.submitted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_while_waiting_interrupts_and_skips_the_rest() {
    let (url, stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let runner = BatchRunner::new(context(&url, options(out.path())));
    let mut events = runner.subscribe();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, BatchEvent::ItemSubmitted { .. }) {
                trigger.cancel();
                break;
            }
        }
    });

    let items = from_prompts(vec!["hang here".into(), "never runs".into()], None).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), runner.run(&items, &cancel))
        .await
        .expect("cancellation ends the batch")
        .unwrap();

    assert_eq!(report.results[0].status, JobStatus::Cancelled);
    assert_eq!(report.results[0].prompt_id.as_deref(), Some("p-1"));
    assert_eq!(report.results[1].status, JobStatus::Skipped);
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 1);
    assert_eq!(stub.submitted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn prompt_that_never_finishes_times_out() {
    let (url, stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let mut opts = options(out.path());
    opts.timeout = Duration::from_millis(300);
    opts.write_report = false;
    let runner = BatchRunner::new(context(&url, opts));

    let items = from_prompts(vec!["hang forever".into()], None).unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.results[0].status, JobStatus::Failed);
    assert_matches!(&report.results[0].error, Some(e) if e.contains("did not finish"));
    assert!(!out.path().join(REPORT_FILE_NAME).exists());
    // Running on the server, so it is interrupted rather than dequeued.
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 1);
    assert_eq!(stub.deletes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timed_out_pending_prompt_is_removed_from_the_queue() {
    let (url, stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let mut opts = options(out.path());
    opts.timeout = Duration::from_millis(300);
    let runner = BatchRunner::new(context(&url, opts));

    let items = from_prompts(vec!["stuck behind others".into()], None).unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.results[0].status, JobStatus::Failed);
    assert_eq!(stub.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn history_errors_do_not_abandon_a_running_prompt() {
    let (url, stub) = spawn_stub(false).await;
    let out = tempfile::tempdir().unwrap();
    let runner = BatchRunner::new(context(&url, options(out.path())));

    let items = from_prompts(vec!["flaky server".into()], None).unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert!(report.all_succeeded(), "{:?}", report.results);
    assert_eq!(report.results[0].outputs, vec![out.path().join("0001.png")]);
    assert!(*stub.polls.lock().unwrap().get("p-1").unwrap() > FLAKY_FAILURES);
    assert_eq!(stub.interrupts.load(Ordering::SeqCst), 0);
    assert_eq!(stub.deletes.load(Ordering::SeqCst), 0);
}

struct CountingTranslator(Arc<AtomicU32>);

#[async_trait]
impl Translator for CountingTranslator {
    fn name(&self) -> &str {
        "counting"
    }

    async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(format!("translated {text}"))
    }
}

#[tokio::test]
async fn bad_input_image_fails_before_translation() {
    let (url, stub) = spawn_stub(false).await;
    let inputs = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let not_an_image = inputs.path().join("notes.png");
    std::fs::write(&not_an_image, "plain text").unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let mut ctx = context(&url, options(out.path()));
    let backend: Box<dyn Translator> = Box::new(CountingTranslator(Arc::clone(&calls)));
    ctx.translator = PromptTranslator::new(vec![backend]);
    let runner = BatchRunner::new(ctx);

    let items = from_images(vec![not_an_image], &["一只猫".to_string()], None).unwrap();
    let report = runner.run(&items, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.results[0].status, JobStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(stub.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn websocket_completion_wakes_the_waiter() {
    let (url, _stub) = spawn_stub(true).await;
    let out = tempfile::tempdir().unwrap();
    let mut opts = options(out.path());
    // Polling alone would take a minute per item.
    opts.poll_interval = Duration::from_secs(60);
    opts.websocket = true;
    let runner = BatchRunner::new(context(&url, opts));

    let items = from_prompts(vec!["one".into(), "two".into()], None).unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(15),
        runner.run(&items, &CancellationToken::new()),
    )
    .await
    .expect("websocket events end the wait early")
    .unwrap();

    assert!(report.all_succeeded(), "{:?}", report.results);
}
