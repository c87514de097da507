/// Docker Sandbox - Local Execution Backend
///
/// **Docker Execution Rules:**
/// 1. Pulls the language's image if it is not present
/// 2. Creates one container per run with:
///    - Network disabled
///    - Memory (no swap), CPU quota and process-count limits
///    - `ulimit fsize` set to the disk limit
/// 3. Uploads the program, support files and stdin as a tar archive
/// 4. Runs the optional compile step; a failure is a compilation error
/// 5. Runs the program under `ulimit -t` and a wall-clock timeout
/// 6. Classifies the exit status (signals, SIGXCPU, output overflow)
/// 7. Removes the container through a drop guard on every path

use super::{RunRequest, RunResponse, RunResult, Sandbox, SandboxError, SandboxErrorKind, SandboxSession};
use crate::config::{LanguageConfig, LanguageConfigManager};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use coderunner_common::types::SandboxLimits;
use futures_util::stream::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Safety limits to prevent pathological inputs from reaching Docker
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

const WORK_DIR: &str = "/code";
const STDIN_PATH: &str = "/tmp/coderunner.stdin";

const SIGXCPU: i32 = 24;

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Best-effort cleanup - cannot be async in Drop
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

/// What one exec inside the container produced.
#[derive(Debug, Default)]
struct ExecOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i64>,
    overflowed: bool,
}

/// Map how a program ended onto a run classification and signal number.
///
/// `sh` reports death by signal N as exit status 128 + N.
pub fn classify_exit(exit_code: Option<i64>, timed_out: bool, overflowed: bool) -> (RunResult, i32) {
    if timed_out {
        return (RunResult::TimeLimitExceeded, 0);
    }
    if overflowed {
        return (RunResult::OutputLimitExceeded, 0);
    }
    match exit_code {
        Some(0) => (RunResult::Success, 0),
        Some(code) if code > 128 && code < 128 + 64 => {
            let signal = (code - 128) as i32;
            if signal == SIGXCPU {
                (RunResult::TimeLimitExceeded, signal)
            } else {
                (RunResult::RuntimeError, signal)
            }
        }
        Some(_) => (RunResult::RuntimeError, 0),
        None => (RunResult::AbnormalTermination, 0),
    }
}

/// Build the tar archive uploaded at `/`: the work directory, the program,
/// support files and the stdin file.
fn build_archive(request: &RunRequest, source_filename: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o777);
    builder.append_data(&mut dir, "code/", std::io::empty())?;

    let mut append = |path: String, data: &[u8]| -> std::io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data)
    };
    for (name, contents) in &request.files {
        append(format!("code/{}", name), contents.as_slice())?;
    }
    append(format!("code/{}", source_filename), request.source.as_bytes())?;
    append(STDIN_PATH.trim_start_matches('/').to_string(), request.stdin.as_bytes())?;

    builder.into_inner()
}

fn valid_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

fn host_config(limits: &SandboxLimits, language: &LanguageConfig) -> HostConfig {
    let memory = limits.memory_mb.map(|mb| (mb as i64) * 1024 * 1024);
    let ulimits = limits.disk_kb.map(|kb| {
        let bytes = (kb as i64) * 1024;
        vec![ResourcesUlimits {
            name: Some("fsize".to_string()),
            soft: Some(bytes),
            hard: Some(bytes),
        }]
    });
    HostConfig {
        memory,
        memory_swap: memory,
        nano_cpus: Some((language.cpu_limit as f64 * 1_000_000_000.0) as i64),
        pids_limit: limits.max_processes.map(i64::from),
        ulimits,
        readonly_rootfs: Some(false),
        ..Default::default()
    }
}

/// Docker-backed sandbox sharing one daemon connection across sessions.
#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
    languages: Arc<LanguageConfigManager>,
}

impl DockerSandbox {
    pub fn new(languages: LanguageConfigManager) -> Result<Self, SandboxError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| SandboxError::Unavailable("docker", e.to_string()))?;
        Ok(Self {
            docker,
            languages: Arc::new(languages),
        })
    }

    /// Check the daemon answers.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable("docker", e.to_string()))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn open_session(&self) -> Result<Box<dyn SandboxSession>, SandboxError> {
        Ok(Box::new(DockerSession {
            docker: self.docker.clone(),
            languages: Arc::clone(&self.languages),
            runs: 0,
        }))
    }
}

pub struct DockerSession {
    docker: Docker,
    languages: Arc<LanguageConfigManager>,
    runs: usize,
}

impl DockerSession {
    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), bollard::errors::Error> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Run a shell command in the container and collect its output.
    async fn exec(&self, container_id: &str, command: String) -> Result<ExecOutput, bollard::errors::Error> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORK_DIR.to_string()),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let mut out = ExecOutput::default();
        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, Some(start_config)).await? {
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => out.stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => out.stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
                if out.stdout.len() + out.stderr.len() > MAX_OUTPUT_BYTES {
                    out.overflowed = true;
                    break;
                }
            }
        }

        if !out.overflowed {
            out.exit_code = self.docker.inspect_exec(&exec.id).await?.exit_code;
        }
        Ok(out)
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        language: &LanguageConfig,
        request: &RunRequest,
        wall: Duration,
    ) -> Result<RunResponse, bollard::errors::Error> {
        if let Some(compile) = &language.compile_command {
            match tokio::time::timeout(wall, self.exec(container_id, compile.clone())).await {
                Ok(out) => {
                    let out = out?;
                    if out.exit_code != Some(0) {
                        let mut cmpinfo = out.stdout;
                        cmpinfo.push_str(&out.stderr);
                        return Ok(RunResponse::compile_error(cmpinfo));
                    }
                }
                Err(_) => return Ok(RunResponse::compile_error("Compilation timed out")),
            }
        }

        let cpu_secs = request.limits.cpu_time_secs.map(|s| s.ceil().max(1.0) as u64);
        let command = match cpu_secs {
            Some(secs) => format!("ulimit -t {}; {} < {}", secs, language.run_command, STDIN_PATH),
            None => format!("{} < {}", language.run_command, STDIN_PATH),
        };

        let (out, timed_out) = match tokio::time::timeout(wall, self.exec(container_id, command)).await {
            Ok(out) => (out?, false),
            Err(_) => (ExecOutput::default(), true),
        };
        let (result, signal) = classify_exit(out.exit_code, timed_out, out.overflowed);
        let mut response = RunResponse::ok(result, out.stdout, out.stderr);
        response.signal = signal;
        Ok(response)
    }
}

#[async_trait]
impl SandboxSession for DockerSession {
    #[tracing::instrument(skip(self, request), fields(sandbox = "docker", language = %request.language))]
    async fn execute(&mut self, request: &RunRequest) -> RunResponse {
        self.runs += 1;
        if request.source.len() > MAX_SOURCE_CODE_BYTES {
            return RunResponse::failed(
                SandboxErrorKind::Other,
                format!("Source code exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES),
            );
        }
        if let Some(bad) = request.files.keys().find(|name| !valid_file_name(name)) {
            return RunResponse::failed(SandboxErrorKind::MisconfiguredSandbox, format!("Invalid file name '{}'", bad));
        }
        let Some(language) = self.languages.get_config(&request.language) else {
            return RunResponse::failed(
                SandboxErrorKind::UnsupportedLanguage,
                format!("No Docker configuration for language '{}'", request.language),
            );
        };

        if let Err(e) = self.ensure_image(&language.image).await {
            return RunResponse::failed(SandboxErrorKind::MisconfiguredSandbox, format!("Image '{}': {}", language.image, e));
        }

        let source_filename = request
            .params
            .get("sourcefilename")
            .and_then(|v| v.as_str())
            .unwrap_or(language.source_filename.as_str())
            .to_string();
        let archive = match build_archive(request, &source_filename) {
            Ok(a) => a,
            Err(e) => return RunResponse::failed(SandboxErrorKind::Other, e.to_string()),
        };

        let wall = Duration::from_secs_f64(request.limits.wall_time_secs.unwrap_or(30.0).max(1.0));
        let config = Config {
            image: Some(language.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("sleep {}", wall.as_secs() * 2 + 60),
            ]),
            entrypoint: Some(vec![]),
            working_dir: Some(WORK_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(host_config(&request.limits, language)),
            ..Default::default()
        };

        let container_name = format!("coderunner-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = match self.docker.create_container(Some(create_options), config).await {
            Ok(c) => c,
            Err(e) => return RunResponse::failed(SandboxErrorKind::Other, format!("Container creation failed: {}", e)),
        };
        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let upload = UploadToContainerOptions {
            path: "/",
            ..Default::default()
        };
        if let Err(e) = self.docker.upload_to_container(&container_id, Some(upload), archive.into()).await {
            return RunResponse::failed(SandboxErrorKind::Other, format!("File upload failed: {}", e));
        }
        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            return RunResponse::failed(SandboxErrorKind::Other, format!("Container start failed: {}", e));
        }

        let start_time = Instant::now();
        let response = match self.run_in_container(&container_id, language, request, wall).await {
            Ok(response) => response,
            Err(e) => RunResponse::failed(SandboxErrorKind::Other, format!("Execution failed: {}", e)),
        };
        debug!(
            run = self.runs,
            result = ?response.result,
            signal = response.signal,
            execution_ms = start_time.elapsed().as_millis() as u64,
            "Docker run finished"
        );
        response
    }

    async fn close(&mut self) {
        debug!(runs = self.runs, "Docker session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn make_language() -> LanguageConfig {
        LanguageConfig {
            name: "python3".to_string(),
            image: "python:3.12-slim".to_string(),
            source_filename: "__tester__.py".to_string(),
            compile_command: None,
            run_command: "python3 __tester__.py".to_string(),
            cpu_limit: 0.5,
        }
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0), false, false), (RunResult::Success, 0));
        assert_eq!(classify_exit(Some(1), false, false), (RunResult::RuntimeError, 0));
        assert_eq!(classify_exit(Some(139), false, false), (RunResult::RuntimeError, 11));
        assert_eq!(classify_exit(Some(152), false, false), (RunResult::TimeLimitExceeded, 24));
        assert_eq!(classify_exit(None, true, false), (RunResult::TimeLimitExceeded, 0));
        assert_eq!(classify_exit(Some(0), false, true), (RunResult::OutputLimitExceeded, 0));
        assert_eq!(classify_exit(None, false, false), (RunResult::AbnormalTermination, 0));
    }

    #[test]
    fn test_host_config_forwards_limits() {
        let limits = SandboxLimits {
            cpu_time_secs: Some(3.0),
            wall_time_secs: Some(30.0),
            memory_mb: Some(64),
            disk_kb: Some(10240),
            max_processes: Some(20),
        };
        let hc = host_config(&limits, &make_language());
        assert_eq!(hc.memory, Some(64 * 1024 * 1024));
        assert_eq!(hc.memory_swap, hc.memory);
        assert_eq!(hc.pids_limit, Some(20));
        assert_eq!(hc.nano_cpus, Some(500_000_000));
        let ulimits = hc.ulimits.unwrap();
        assert_eq!(ulimits[0].name.as_deref(), Some("fsize"));
        assert_eq!(ulimits[0].hard, Some(10240 * 1024));
    }

    #[test]
    fn test_archive_layout() {
        let mut files = BTreeMap::new();
        files.insert("data.txt".to_string(), b"42".to_vec());
        let request = RunRequest {
            source: "print(input())".to_string(),
            language: "python3".to_string(),
            stdin: "hello\n".to_string(),
            files,
            ..Default::default()
        };
        let bytes = build_archive(&request, "__tester__.py").unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut found = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            found.insert(path, contents);
        }
        assert_eq!(found["code/__tester__.py"], "print(input())");
        assert_eq!(found["code/data.txt"], "42");
        assert_eq!(found["tmp/coderunner.stdin"], "hello\n");
    }

    #[test]
    fn test_file_names_are_checked() {
        assert!(valid_file_name("data.txt"));
        assert!(!valid_file_name("../etc/passwd"));
        assert!(!valid_file_name(".."));
        assert!(!valid_file_name(""));
    }

    /// Requires a running Docker daemon and the python image
    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_python_run() {
        let manager = LanguageConfigManager::from_json(include_str!("../../../../config/languages.json")).unwrap();
        let sandbox = DockerSandbox::new(manager).unwrap();
        let mut session = sandbox.open_session().await.unwrap();

        let request = RunRequest {
            source: "print(int(input()) * 2)".to_string(),
            language: "python3".to_string(),
            stdin: "21\n".to_string(),
            limits: SandboxLimits {
                cpu_time_secs: Some(3.0),
                wall_time_secs: Some(30.0),
                memory_mb: Some(256),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = session.execute(&request).await;
        session.close().await;

        assert!(response.is_ok(), "{:?}", response);
        assert_eq!(response.result, RunResult::Success);
        assert_eq!(response.stdout.trim(), "42");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_timeout() {
        let manager = LanguageConfigManager::from_json(include_str!("../../../../config/languages.json")).unwrap();
        let sandbox = DockerSandbox::new(manager).unwrap();
        let mut session = sandbox.open_session().await.unwrap();

        let request = RunRequest {
            source: "while True: pass".to_string(),
            language: "python3".to_string(),
            limits: SandboxLimits {
                cpu_time_secs: Some(1.0),
                wall_time_secs: Some(5.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = session.execute(&request).await;
        assert_eq!(response.result, RunResult::TimeLimitExceeded);
    }
}
