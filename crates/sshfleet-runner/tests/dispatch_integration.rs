//! End-to-end dispatch through the public runner API over the in-memory
//! transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use sshfleet_core::model::{HostDescriptor, JobDescriptor};
use sshfleet_core::Manifest;
use sshfleet_runner::testing::MemoryConnector;
use sshfleet_runner::{ExecOutput, JobDispatcher, ProgressCounter, ScratchLayout, WorkerPool};

fn word_count(remote: MemoryConnector) -> MemoryConnector {
    remote.with_script(|ctx| {
        let input = ctx.read("input.txt").unwrap_or_default();
        let words = String::from_utf8_lossy(&input).split_whitespace().count();
        ctx.write("count.txt", words.to_string());
        ExecOutput {
            stdout: format!("{words}\n").into_bytes(),
            exit_code: Some(0),
            ..ExecOutput::default()
        }
    })
}

#[tokio::test]
async fn stage_run_and_retrieve_across_pool() {
    let local = tempfile::tempdir().unwrap();
    let remote = word_count(MemoryConnector::new()).with_exec_delay(Duration::from_millis(5));

    let mut jobs = Vec::new();
    for i in 0..6 {
        let input = local.path().join(format!("in{i}.txt"));
        std::fs::write(&input, "word ".repeat(i + 1)).unwrap();
        jobs.push(
            JobDescriptor::new("wc -w < input.txt > count.txt")
                .with_id(format!("job{i}"))
                .require(&input, "input.txt")
                .retrieve("count.txt", local.path().join("out").join(format!("count{i}.txt"))),
        );
    }

    let hosts = vec![
        HostDescriptor::new("alpha", 2).with_username("runner"),
        HostDescriptor::new("beta", 1).with_username("runner"),
    ];
    let pool = Arc::new(
        WorkerPool::build(Arc::new(remote.clone()), &hosts)
            .await
            .unwrap(),
    );
    let dispatcher = JobDispatcher::new(Arc::clone(&pool), ScratchLayout::new("/scratch"));
    let counter = Arc::new(ProgressCounter::new());

    let results = dispatcher.run(jobs, counter.clone()).await;

    assert_eq!(results.len(), 6);
    assert_eq!(counter.finished(), 6);
    for (i, result) in results.iter().enumerate() {
        assert!(result.succeeded(), "{result:?}");
        assert_eq!(result.id.as_deref(), Some(format!("job{i}").as_str()));
        assert_eq!(result.stdout_lossy().trim(), (i + 1).to_string());
        assert!(result.scratch_dir.starts_with("/scratch/cluster_instance_"));
        let count =
            std::fs::read_to_string(local.path().join("out").join(format!("count{i}.txt"))).unwrap();
        assert_eq!(count, (i + 1).to_string());
    }

    assert!(remote.dirs().is_empty());
    assert!(remote.max_concurrency() <= 3);
    assert_eq!(pool.free_count(), 3);
    assert_eq!(remote.transfers_opened(), remote.transfers_closed());
}

#[tokio::test]
async fn manifest_drives_a_run() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "one two three").unwrap();
    let manifest_path = dir.path().join("fleet.toml");
    std::fs::write(
        &manifest_path,
        r#"
scratch_root = "/var/tmp"

[[hosts]]
hostname = "alpha"
username = "runner"
cpu_slots = 1

[[jobs]]
id = "count"
command = "wc -w < input.txt > count.txt"
required_files = [{ local = "input.txt", remote = "input.txt" }]
return_files = [{ local = "results/count.txt", remote = "count.txt" }]
"#,
    )
    .unwrap();

    let manifest = Manifest::load(&manifest_path).unwrap();
    let remote = word_count(MemoryConnector::new());
    let pool = WorkerPool::build(Arc::new(remote.clone()), &manifest.host_descriptors())
        .await
        .unwrap();
    let dispatcher = JobDispatcher::new(Arc::new(pool), ScratchLayout::new(&manifest.scratch_root));

    let results = dispatcher
        .run(manifest.jobs.clone(), Arc::new(ProgressCounter::new()))
        .await;

    assert_eq!(results.len(), 1);
    assert!(results[0].succeeded(), "{:?}", results[0]);
    assert!(results[0].scratch_dir.starts_with("/var/tmp/"));
    let count = std::fs::read_to_string(dir.path().join("results/count.txt")).unwrap();
    assert_eq!(count, "3");
}

#[tokio::test]
async fn pool_construction_failure_is_fatal() {
    let remote = MemoryConnector::new();
    remote.fail_connect_attempt(1);
    let hosts = vec![HostDescriptor::new("alpha", 2).with_username("runner")];
    assert!(WorkerPool::build(Arc::new(remote), &hosts).await.is_err());
}
