mod common;

use std::fs;
use std::path::Path;

use common::start_server;
use mechbridge::rpc::ClientError;
use mechbridge::rpc::protocol::IO_ERROR;

fn binary_blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn seed_project(project: &Path) {
    fs::create_dir_all(project.join("sub/c")).unwrap();
    fs::write(project.join("a.txt"), b"alpha").unwrap();
    fs::write(project.join("sub/b.txt"), b"bravo").unwrap();
    fs::write(project.join("sub/c/d.bin"), binary_blob(4096)).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_then_list() {
    let server = start_server().await;
    let client = server.client().await;

    let local_dir = tempfile::tempdir().unwrap();
    let local = local_dir.path().join("hello.x_t");
    fs::write(&local, binary_blob(1024)).unwrap();

    let project_dir = client.project_directory().await.unwrap();
    let remote = client.upload(&local, &project_dir).await.unwrap();
    assert!(remote.ends_with("hello.x_t"));

    let files = client.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    let listed = Path::new(&files[0]);
    assert_eq!(listed.file_name().unwrap(), "hello.x_t");
    assert_eq!(fs::metadata(listed).unwrap().len(), 1024);
    assert_eq!(fs::read(listed).unwrap(), binary_blob(1024));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_creates_directories_and_overwrites() {
    let server = start_server().await;
    let client = server.client().await;

    let local_dir = tempfile::tempdir().unwrap();
    let local = local_dir.path().join("mesh.dat");
    fs::write(&local, b"v1").unwrap();

    let remote_dir = server.project.join("deep/nested").display().to_string();
    client.upload(&local, &remote_dir).await.unwrap();
    fs::write(&local, b"version two").unwrap();
    client.upload(&local, &remote_dir).await.unwrap();

    assert_eq!(
        fs::read(server.project.join("deep/nested/mesh.dat")).unwrap(),
        b"version two"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_project_preserves_layout() {
    let server = start_server().await;
    seed_project(&server.project);
    let client = server.client().await;

    let out = tempfile::tempdir().unwrap();
    let written = client.download_project(out.path(), &[], true).await.unwrap();
    assert_eq!(written.len(), 3);

    let root = out.path().join("proj_files");
    assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(root.join("sub/b.txt")).unwrap(), b"bravo");
    assert_eq!(fs::read(root.join("sub/c/d.bin")).unwrap(), binary_blob(4096));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_project_with_manifest_and_filter() {
    let server = start_server().await;
    seed_project(&server.project);
    let client = server.client().await;
    client
        .call_raw(
            "run_python_script",
            mechbridge::core::CallArgs::new().with("save()"),
        )
        .await
        .unwrap();

    let out = tempfile::tempdir().unwrap();
    let written = client.download_project(out.path(), &[], true).await.unwrap();
    assert_eq!(written.len(), 4);
    assert!(out.path().join("proj_files.mechdb").is_file());

    let filtered = tempfile::tempdir().unwrap();
    let written = client
        .download_project(filtered.path(), &["txt".to_string()], true)
        .await
        .unwrap();
    assert_eq!(written.len(), 2);
    assert!(!filtered.path().join("proj_files/sub/c/d.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_file_and_directory() {
    let server = start_server().await;
    seed_project(&server.project);
    let client = server.client().await;
    let out = tempfile::tempdir().unwrap();

    let remote_file = server.project.join("sub/c/d.bin").display().to_string();
    let written = client.download(&remote_file, out.path(), true).await.unwrap();
    assert_eq!(written, vec![out.path().join("d.bin")]);
    assert_eq!(fs::read(out.path().join("d.bin")).unwrap(), binary_blob(4096));

    let tree = out.path().join("tree");
    let remote_dir = server.project.join("sub").display().to_string();
    let written = client.download(&remote_dir, &tree, true).await.unwrap();
    assert_eq!(written.len(), 2);
    assert_eq!(fs::read(tree.join("b.txt")).unwrap(), b"bravo");
    assert_eq!(fs::read(tree.join("c/d.bin")).unwrap(), binary_blob(4096));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_respects_no_overwrite() {
    let server = start_server().await;
    seed_project(&server.project);
    let client = server.client().await;
    let out = tempfile::tempdir().unwrap();

    fs::write(out.path().join("a.txt"), b"local edits").unwrap();
    let remote = server.project.join("a.txt").display().to_string();

    let written = client.download(&remote, out.path(), false).await.unwrap();
    assert!(written.is_empty());
    assert_eq!(fs::read(out.path().join("a.txt")).unwrap(), b"local edits");

    let written = client.download(&remote, out.path(), true).await.unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(fs::read(out.path().join("a.txt")).unwrap(), b"alpha");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_missing_reports_path() {
    let server = start_server().await;
    let client = server.client().await;
    let out = tempfile::tempdir().unwrap();

    let missing = server.project.join("ghost.txt").display().to_string();
    let err = client.download(&missing, out.path(), true).await.unwrap_err();
    match &err {
        ClientError::Remote { code, kind, message } => {
            assert_eq!(*code, IO_ERROR);
            assert_eq!(kind, "FileNotFoundError");
            assert!(message.contains("ghost.txt"));
        }
        other => panic!("expected an IO error, got {other:?}"),
    }

    // A missing local file fails before anything is sent.
    let err = client
        .upload(&out.path().join("absent.bin"), "remote")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::LocalIo { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_empty_directory_creates_target() {
    let server = start_server().await;
    fs::create_dir_all(server.project.join("empty")).unwrap();
    let client = server.client().await;
    let out = tempfile::tempdir().unwrap();

    let target = out.path().join("fresh/target");
    let remote = server.project.join("empty").display().to_string();
    let written = client.download(&remote, &target, true).await.unwrap();
    assert!(written.is_empty());
    assert!(target.is_dir());
}
