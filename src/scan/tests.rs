use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::*;
use crate::error::ErrorKind;
use crate::procmanager::{DryRunExecutor, ProcessOutput};
use crate::scan::archive::tests::{gzip, tar_of};

const MULTI_STAGE: &str = "\
FROM golang:1.21 AS build
WORKDIR /src
COPY . .
RUN go build -o /app

FROM alpine:3.19
COPY --from=build /app /app
ENTRYPOINT [\"/app\"]
";

/// Records every command and plays the part of git by writing files into the
/// clone destination.
#[derive(Default)]
struct FakeExecutor {
    files: Vec<(&'static str, &'static str)>,
    exit_code: i32,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ProcessExecutor for FakeExecutor {
    async fn run(&self, cmd: &str, args: &[String], _cwd: Option<&Path>) -> crate::error::Result<ProcessOutput> {
        self.calls.lock().unwrap().push(command_line(cmd, args));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if cmd == "git" && args.first().map(String::as_str) == Some("clone") {
            let dest = Path::new(args.last().unwrap());
            for (path, contents) in &self.files {
                let file = dest.join(path);
                fs::create_dir_all(file.parent().unwrap()).unwrap();
                fs::write(file, contents).unwrap();
            }
        }
        Ok(ProcessOutput {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "check failed: 1 warning".to_string()
            },
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    context: String,
    destination: PathBuf,
}

fn local_context(files: &[(&str, &str)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let context = dir.path().join("ctx");
    for (path, contents) in files {
        let file = context.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, contents).unwrap();
    }
    Fixture {
        context: context.to_string_lossy().into_owned(),
        destination: dir.path().join("dest"),
        _dir: dir,
    }
}

fn scanner(executor: Arc<dyn ProcessExecutor>, destination: &Path) -> Scanner {
    Scanner::new(
        executor,
        ScannerSettings {
            destination: destination.to_path_buf(),
            ..ScannerSettings::default()
        },
    )
}

fn request(context: &str) -> ScanRequest {
    ScanRequest {
        context: context.to_string(),
        definition: PathBuf::from("Dockerfile"),
        ..ScanRequest::default()
    }
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(30))
}

fn raw(images: &[ImageReference]) -> Vec<&str> {
    images.iter().map(|i| i.raw.as_str()).collect()
}

#[tokio::test]
async fn test_multi_stage_local_context() {
    let fx = local_context(&[("Dockerfile", MULTI_STAGE)]);
    let result = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&request(&fx.context), deadline())
        .await
        .unwrap();

    assert_eq!(raw(&result.build_time_images), vec!["golang:1.21"]);
    assert_eq!(raw(&result.runtime_images), vec!["alpine:3.19"]);
    assert_eq!(result.definition_path, "Dockerfile");
    assert!(fx.destination.join("Dockerfile").is_file());
}

#[tokio::test]
async fn test_single_stage_and_json_shape() {
    let fx = local_context(&[("Dockerfile", "FROM ubuntu:22.04\nRUN echo hi\n")]);
    let mut req = request(&fx.context);
    req.tags = vec!["registry.example.com/app:v1".into()];

    let result = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&req, deadline())
        .await
        .unwrap();

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["buildTimeImages"], serde_json::json!([]));
    assert_eq!(json["runtimeImages"], serde_json::json!(["ubuntu:22.04"]));
    assert_eq!(json["definitionPath"], "Dockerfile");
    assert_eq!(json["outputImages"], serde_json::json!(["registry.example.com/app:v1"]));
    assert_eq!(json["contextSource"], fx.context.as_str());
}

#[tokio::test]
async fn test_output_images_omitted_without_tags() {
    let fx = local_context(&[("Dockerfile", "FROM ubuntu:22.04\n")]);
    let result = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&request(&fx.context), deadline())
        .await
        .unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("outputImages").is_none());
}

#[tokio::test]
async fn test_build_arg_override_changes_runtime_image() {
    let content = "ARG VERSION=3.18\nFROM alpine:${VERSION}\n";
    let fx = local_context(&[("Dockerfile", content)]);
    let scan = scanner(Arc::new(DryRunExecutor), &fx.destination);

    let result = scan.scan(&request(&fx.context), deadline()).await.unwrap();
    assert_eq!(raw(&result.runtime_images), vec!["alpine:3.18"]);

    let fx = local_context(&[("Dockerfile", content)]);
    let mut req = request(&fx.context);
    req.build_args.insert("VERSION".into(), "3.19".into());
    let result = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&req, deadline())
        .await
        .unwrap();
    assert_eq!(raw(&result.runtime_images), vec!["alpine:3.19"]);
}

#[tokio::test]
async fn test_definition_in_subdirectory() {
    let fx = local_context(&[("docker/app.Dockerfile", "FROM python:3.12-slim\n")]);
    let mut req = request(&fx.context);
    req.definition = PathBuf::from("docker/app.Dockerfile");

    let result = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&req, deadline())
        .await
        .unwrap();
    assert_eq!(raw(&result.runtime_images), vec!["python:3.12-slim"]);
    assert_eq!(result.definition_path, "docker/app.Dockerfile");
}

#[tokio::test]
async fn test_missing_definition() {
    let fx = local_context(&[("README.md", "nothing to build\n")]);
    let err = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&request(&fx.context), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
}

#[tokio::test]
async fn test_definition_outside_context_is_rejected() {
    let outside: [fn(&Fixture) -> PathBuf; 2] = [
        // The acquired copy sits next to the source directory, so this path exists.
        |_| PathBuf::from("../ctx/Dockerfile"),
        |fx| Path::new(&fx.context).join("Dockerfile"),
    ];
    for definition in outside {
        let fx = local_context(&[("Dockerfile", MULTI_STAGE)]);
        let mut req = request(&fx.context);
        req.definition = definition(&fx);
        let err = scanner(Arc::new(DryRunExecutor), &fx.destination)
            .scan(&req, deadline())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
    }
}

#[tokio::test]
async fn test_cyclic_definition_fails_whole_scan() {
    let content = "FROM b AS a\nFROM a AS b\n";
    let fx = local_context(&[("Dockerfile", content)]);
    let err = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&request(&fx.context), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicStageReference);
}

#[tokio::test]
async fn test_unknown_target() {
    let fx = local_context(&[("Dockerfile", MULTI_STAGE)]);
    let mut req = request(&fx.context);
    req.target = Some("release".into());
    let err = scanner(Arc::new(DryRunExecutor), &fx.destination)
        .scan(&req, deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TargetNotFound);
}

#[tokio::test]
async fn test_zero_deadline_fails_before_fetching() {
    let executor = Arc::new(FakeExecutor::default());
    let dir = tempfile::tempdir().unwrap();
    let err = scanner(executor.clone(), &dir.path().join("dest"))
        .scan(
            &request("https://github.com/org/app.git"),
            Deadline::after(Duration::ZERO),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(executor.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_clone_hits_deadline() {
    let executor = Arc::new(FakeExecutor {
        delay: Some(Duration::from_secs(10)),
        ..FakeExecutor::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let err = scanner(executor, &dir.path().join("dest"))
        .scan(
            &request("https://github.com/org/app.git"),
            Deadline::after(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ScanError::DeadlineExceeded {
            during: "fetching the git context"
        }
    ));
}

#[tokio::test]
async fn test_git_context_clones_and_checks_out() {
    let executor = Arc::new(FakeExecutor {
        files: vec![("build/Dockerfile", "FROM node:20 AS deps\nFROM nginx:1.25\nCOPY --from=deps /app /usr/share/nginx/html\n")],
        ..FakeExecutor::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("dest");

    let result = scanner(executor.clone(), &dest)
        .scan(&request("https://github.com/org/app.git#v2:build"), deadline())
        .await
        .unwrap();

    assert_eq!(raw(&result.build_time_images), vec!["node:20"]);
    assert_eq!(raw(&result.runtime_images), vec!["nginx:1.25"]);
    assert_eq!(result.context_source, "https://github.com/org/app.git#v2:build");

    let calls = executor.calls.lock().unwrap();
    assert_eq!(
        calls[0],
        format!(
            "git clone --recurse-submodules https://github.com/org/app.git {}",
            dest.display()
        )
    );
    assert_eq!(calls[1], "git checkout v2");
}

#[tokio::test]
async fn test_failed_clone_is_unavailable() {
    let executor = Arc::new(FakeExecutor {
        exit_code: 128,
        ..FakeExecutor::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let err = scanner(executor, &dir.path().join("dest"))
        .scan(&request("git@github.com:org/private.git"), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextUnavailable);
}

#[tokio::test]
async fn test_dry_run_git_has_no_definition() {
    let dir = tempfile::tempdir().unwrap();
    let err = scanner(Arc::new(DryRunExecutor), &dir.path().join("dest"))
        .scan(&request("https://github.com/org/app.git"), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
}

#[tokio::test]
async fn test_validation_runs_builder_check() {
    let fx = local_context(&[("Dockerfile", MULTI_STAGE)]);
    let executor = Arc::new(FakeExecutor::default());
    let scan = Scanner::new(
        executor.clone(),
        ScannerSettings {
            destination: fx.destination.clone(),
            validate: true,
            ..ScannerSettings::default()
        },
    );
    let mut req = request(&fx.context);
    req.build_args.insert("MODE".into(), "release".into());

    scan.scan(&req, deadline()).await.unwrap();

    let calls = executor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("docker buildx build --check -f "));
    assert!(calls[0].contains("--build-arg MODE=release"));
}

#[tokio::test]
async fn test_validation_failure_is_process_error() {
    let fx = local_context(&[("Dockerfile", MULTI_STAGE)]);
    let scan = Scanner::new(
        Arc::new(FakeExecutor {
            exit_code: 1,
            ..FakeExecutor::default()
        }),
        ScannerSettings {
            destination: fx.destination.clone(),
            validate: true,
            ..ScannerSettings::default()
        },
    );

    let err = scan.scan(&request(&fx.context), deadline()).await.unwrap_err();
    match err {
        ScanError::ProcessExecutionFailed {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "check failed: 1 warning");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_identical_scans_are_identical() {
    let content = "\
ARG BASE=debian:bookworm
FROM ${BASE} AS a
FROM rust:1.79 AS b
COPY --from=busybox:1.36 /bin/sh /sh
FROM a
COPY --from=b /out /out
";
    let first = {
        let fx = local_context(&[("Dockerfile", content)]);
        scanner(Arc::new(DryRunExecutor), &fx.destination)
            .scan(&request(&fx.context), deadline())
            .await
            .unwrap()
    };
    let second = {
        let fx = local_context(&[("Dockerfile", content)]);
        scanner(Arc::new(DryRunExecutor), &fx.destination)
            .scan(&request(&fx.context), deadline())
            .await
            .unwrap()
    };

    assert_eq!(raw(&first.runtime_images), vec!["debian:bookworm"]);
    assert_eq!(raw(&first.build_time_images), vec!["rust:1.79", "busybox:1.36"]);
    assert_eq!(
        serde_json::to_string(&first.build_time_images).unwrap(),
        serde_json::to_string(&second.build_time_images).unwrap()
    );
    assert_eq!(first.runtime_images, second.runtime_images);
}

/// Serves one HTTP response on a loopback port and returns the archive URL.
async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}/ctx.tar.gz")
}

fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_remote_archive_context() {
    let url = serve_once("200 OK", gzip(&tar_of(&[("Dockerfile", MULTI_STAGE)]))).await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("dest");

    let result = scanner(Arc::new(DryRunExecutor), &destination)
        .with_http_client(direct_client())
        .scan(&request(&url), deadline())
        .await
        .unwrap();

    assert_eq!(raw(&result.build_time_images), vec!["golang:1.21"]);
    assert_eq!(raw(&result.runtime_images), vec!["alpine:3.19"]);
    assert_eq!(result.context_source, url);
    assert!(destination.join("Dockerfile").is_file());
}

#[tokio::test]
async fn test_remote_archive_not_found_is_unavailable() {
    let url = serve_once("404 Not Found", b"no such archive".to_vec()).await;
    let dir = tempfile::tempdir().unwrap();

    let err = scanner(Arc::new(DryRunExecutor), &dir.path().join("dest"))
        .with_http_client(direct_client())
        .scan(&request(&url), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextUnavailable);
}

#[tokio::test]
async fn test_remote_archive_refused_connection_is_unavailable() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("http://{addr}/ctx.tar.gz");
    let dir = tempfile::tempdir().unwrap();

    let err = scanner(Arc::new(DryRunExecutor), &dir.path().join("dest"))
        .with_http_client(direct_client())
        .scan(&request(&url), deadline())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextUnavailable);
}
