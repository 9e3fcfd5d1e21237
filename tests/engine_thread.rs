mod common;

use std::time::Duration;

use common::{client_config, start_server};
use mechbridge::adapters::background::ENGINE_THREAD_NAME;
use mechbridge::core::{CallArgs, PostError, on_engine_thread};
use mechbridge::rpc::Client;
use tokio::task::JoinSet;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_call_runs_on_the_engine_thread() {
    let server = start_server().await;

    let mut tasks = JoinSet::new();
    for _ in 0..4 {
        let config = client_config(&server.handle);
        tasks.spawn(async move {
            let client = Client::connect(config).await.unwrap();
            let mut threads = Vec::new();
            for _ in 0..5 {
                let thread: String = client
                    .call("engine_thread", CallArgs::new())
                    .await
                    .unwrap();
                threads.push(thread);
            }
            threads
        });
    }

    let threads: Vec<String> = timeout(Duration::from_secs(30), tasks.join_all())
        .await
        .expect("calls should finish")
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(threads.len(), 20);
    assert!(threads.iter().all(|t| t == ENGINE_THREAD_NAME));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_calls_on_one_connection_keep_their_order() {
    let server = start_server().await;
    let client = server.client().await;

    for value in 0..50u64 {
        let len: usize = client
            .call("record", CallArgs::new().with(value))
            .await
            .unwrap();
        assert_eq!(len as u64, value + 1);
    }

    let recorded: Vec<u64> = client.call("recorded", CallArgs::new()).await.unwrap();
    assert_eq!(recorded, (0..50).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_interleave() {
    let server = start_server().await;

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let config = client_config(&server.handle);
        tasks.spawn(async move {
            let client = Client::connect(config).await.unwrap();
            for _ in 0..25 {
                client
                    .call_raw("bump", CallArgs::new())
                    .await
                    .unwrap();
            }
        });
    }
    timeout(Duration::from_secs(60), tasks.join_all())
        .await
        .expect("calls should finish");

    let client = server.client().await;
    let counter: u64 = client.get("counter").await.unwrap();
    assert_eq!(counter, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submit_from_the_engine_thread_fails_fast() {
    let server = start_server().await;
    let adapter = server.handle.poster().clone();

    assert!(!on_engine_thread());
    let marked = adapter.submit(|_host| on_engine_thread()).await.unwrap();
    assert!(marked);

    let inner = adapter.clone();
    let nested = timeout(
        Duration::from_secs(5),
        adapter.submit(move |_host| inner.submit_blocking(|_host| 1)),
    )
    .await
    .expect("nested submit must not deadlock")
    .unwrap();
    assert!(matches!(nested, Err(PostError::Reentrant)));

    // The engine keeps serving afterwards.
    let client = server.client().await;
    assert!(client.is_alive().await);
    let name: String = client.get("name").await.unwrap();
    assert_eq!(name, "UnsavedProject");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_host_code_can_post_alongside_clients() {
    let server = start_server().await;
    let client = server.client().await;

    let project = server
        .handle
        .poster()
        .submit(|host| {
            use mechbridge::core::Engine;
            host.engine().project_directory().map(|p| p.display().to_string())
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project, client.project_directory().await.unwrap());
}
