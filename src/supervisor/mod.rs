//! Process supervisor for the worker cohort.
//!
//! Each configured service gets its own task that gates the spawn on its
//! predicates, pipes child stdout/stderr into the log stream, optionally
//! probes an HTTP health URL, and restarts crashed children with an
//! exponentially growing delay. A process-wide stop signal terminates every
//! child with SIGTERM, escalating to SIGKILL after a grace period.

pub mod predicates;

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use predicates::{combine, Predicate};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Ceiling for the crash-restart delay.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

/// HTTP health probe settings for one service.
#[derive(Debug, Clone)]
pub struct HealthCheckSpec {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// One managed child process.
pub struct ServiceSpec {
    pub name: String,
    pub command: Vec<String>,
    pub restart: bool,
    pub restart_delay: Duration,
    pub env_overrides: HashMap<String, String>,
    pub predicate: Option<Predicate>,
    pub health_check: Option<HealthCheckSpec>,
}

impl ServiceSpec {
    /// Compile a configured service into a runnable spec, building the
    /// predicate chain from its `require_*` fields.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut checks: Vec<Predicate> = Vec::new();
        if let Some(spec) = &config.require_port {
            checks.push(match parse_host_port(spec) {
                Some((host, port)) => predicates::port_predicate(host, port),
                None => {
                    let spec = spec.clone();
                    Box::new(move || (false, Some(format!("invalid require_port: {spec}"))))
                }
            });
        }
        if let Some(binary) = &config.require_binary {
            checks.push(predicates::binary_predicate(binary.clone()));
        }
        if let Some(endpoint) = &config.require_endpoint {
            checks.push(predicates::endpoint_predicate(endpoint.clone()));
        }
        if !config.require_env.is_empty() {
            checks.push(predicates::env_predicate(config.require_env.clone()));
        }

        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            restart: config.restart,
            restart_delay: Duration::from_secs_f64(config.restart_delay_seconds.max(0.0)),
            env_overrides: config.env.clone(),
            predicate: if checks.is_empty() {
                None
            } else {
                Some(combine(checks))
            },
            health_check: config.health_url.as_ref().map(|url| HealthCheckSpec {
                url: url.clone(),
                interval: Duration::from_secs_f64(config.health_interval_seconds.max(0.1)),
                timeout: Duration::from_secs_f64(config.health_timeout_seconds.max(0.1)),
                retries: config.health_retries.max(1),
            }),
        }
    }
}

fn parse_host_port(spec: &str) -> Option<(String, u16)> {
    let (host, port) = spec.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Some((host.to_string(), port))
}

/// Crash-restart delay: doubles per consecutive crash, capped at 30 s.
pub fn backoff_delay(base: Duration, consecutive_crashes: u32) -> Duration {
    let exponent = consecutive_crashes.saturating_sub(1).min(20);
    let seconds = base.as_secs_f64() * (1u64 << exponent) as f64;
    Duration::from_secs_f64(seconds.min(MAX_RESTART_DELAY.as_secs_f64()))
}

/// Services disabled through the environment: `PIPELINE_DISABLE` carries a
/// comma list; `PIPELINE_DISABLE_<NAME>` toggles one service unless set to a
/// falsy value.
pub fn disabled_services() -> HashSet<String> {
    disabled_from(std::env::vars())
}

fn disabled_from(vars: impl Iterator<Item = (String, String)>) -> HashSet<String> {
    let mut disabled = HashSet::new();
    const PREFIX: &str = "PIPELINE_DISABLE_";
    for (key, value) in vars {
        if key == "PIPELINE_DISABLE" {
            disabled.extend(
                value
                    .split(',')
                    .map(|name| name.trim().to_lowercase())
                    .filter(|name| !name.is_empty()),
            );
        } else if let Some(service) = key.strip_prefix(PREFIX) {
            let service = service.trim().to_lowercase();
            if service.is_empty() {
                continue;
            }
            let value = value.trim().to_lowercase();
            if !matches!(value.as_str(), "0" | "false" | "no" | "off") {
                disabled.insert(service);
            }
        }
    }
    disabled
}

/// Run every configured service until the stop signal fires, then reap them.
pub async fn run(specs: Vec<ServiceSpec>, stop: watch::Receiver<bool>) {
    let disabled = disabled_services();
    let specs: Vec<ServiceSpec> = specs
        .into_iter()
        .filter(|spec| {
            if disabled.contains(&spec.name.to_lowercase()) {
                tracing::info!("Skipping {} (disabled via environment)", spec.name);
                false
            } else {
                true
            }
        })
        .collect();
    if specs.is_empty() {
        tracing::warn!("No services selected; exiting.");
        return;
    }

    tracing::info!(
        "Supervisor started with services: {}",
        specs
            .iter()
            .map(|spec| spec.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let handles: Vec<JoinHandle<()>> = specs
        .into_iter()
        .map(|spec| {
            let stop = stop.clone();
            tokio::spawn(run_service(spec, stop))
        })
        .collect();
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Supervisor stopped.");
}

/// Supervise one service: predicate gate, spawn, demux, probe, restart.
pub async fn run_service(spec: ServiceSpec, mut stop: watch::Receiver<bool>) {
    if let Some(predicate) = &spec.predicate {
        let (should_start, reason) = predicate();
        if !should_start {
            match reason {
                Some(reason) => tracing::warn!("Skipping {}: {reason}", spec.name),
                None => tracing::info!("Skipping {} (predicate declined start)", spec.name),
            }
            return;
        }
    }
    if spec.command.is_empty() {
        tracing::error!("Service {} has an empty command", spec.name);
        return;
    }

    let mut attempt: u64 = 0;
    let mut consecutive_crashes: u32 = 0;

    while !*stop.borrow() {
        attempt += 1;
        tracing::info!("Starting {} (attempt {attempt})", spec.name);

        let mut command = Command::new(&spec.command[0]);
        command
            .args(&spec.command[1..])
            .envs(&spec.env_overrides)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracing::error!("Unable to start {}: {error}", spec.name);
                return;
            }
        };
        let pid = child.id();
        tracing::debug!("{} spawned pid={pid:?}", spec.name);

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(pipe_stream(spec.name.clone(), stream, false)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(pipe_stream(spec.name.clone(), stream, true)));
        let health_task = spec.health_check.as_ref().map(|check| {
            tokio::spawn(monitor_health(
                spec.name.clone(),
                check.clone(),
                pid,
                stop.clone(),
            ))
        });

        // The wait future borrows the child, so resolve the race first and
        // only then touch the child again.
        let exit_code = tokio::select! {
            status = child.wait() => Some(status.ok().and_then(|status| status.code())),
            _ = stop.wait_for(|stopped| *stopped) => None,
        };

        let Some(exit_code) = exit_code else {
            tracing::info!("Stopping {}...", spec.name);
            terminate_child(&spec.name, &mut child).await;
            reap_io_tasks(stdout_task, stderr_task, health_task).await;
            break;
        };

        reap_io_tasks(stdout_task, stderr_task, health_task).await;
        tracing::info!("{} exited with code {exit_code:?}", spec.name);

        if !spec.restart || exit_code == Some(0) {
            break;
        }
        consecutive_crashes += 1;
        let delay = backoff_delay(spec.restart_delay, consecutive_crashes);
        tracing::warn!(
            "{} crashed (code {exit_code:?}); restarting in {:.1}s (next attempt {})",
            spec.name,
            delay.as_secs_f64(),
            attempt + 1,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
}

/// SIGTERM, wait up to the grace period, then SIGKILL.
async fn terminate_child(name: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Polite request first; Child::kill would go straight to SIGKILL.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("{name} did not exit after terminate; killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

async fn reap_io_tasks(
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
) {
    if let Some(task) = health_task {
        task.abort();
        let _ = task.await;
    }
    // Pipe readers end on their own once the child's fds close.
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let _ = task.await;
    }
}

/// Forward one child stream into the log, prefixed with the service name.
async fn pipe_stream<R: AsyncRead + Unpin>(service: String, stream: R, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            tracing::error!("[{service}] {line}");
        } else {
            tracing::info!("[{service}] {line}");
        }
    }
}

/// Probe the health URL every interval; after `retries` consecutive
/// failures, terminate the child and let the restart loop take over.
async fn monitor_health(
    service: String,
    spec: HealthCheckSpec,
    pid: Option<u32>,
    mut stop: watch::Receiver<bool>,
) {
    tokio::time::sleep(spec.interval).await;
    let client = match reqwest::Client::builder().timeout(spec.timeout).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::error!("{service} health probe disabled: {error}");
            return;
        }
    };

    let mut failures = 0u32;
    loop {
        if *stop.borrow() {
            return;
        }
        let failure = match client.get(&spec.url).send().await {
            Ok(response) if response.status().as_u16() < 500 => None,
            Ok(response) => Some(format!("HTTP {}", response.status())),
            Err(error) => Some(error.to_string()),
        };
        match failure {
            None => failures = 0,
            Some(reason) => {
                failures += 1;
                tracing::warn!(
                    "{service} health check failed ({failures}/{}): {reason}",
                    spec.retries
                );
                if failures >= spec.retries {
                    tracing::error!(
                        "{service} deemed unhealthy after {failures} failures; terminating process"
                    );
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        unsafe {
                            libc::kill(pid as i32, libc::SIGTERM);
                        }
                    }
                    #[cfg(not(unix))]
                    let _ = pid;
                    return;
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(spec.interval) => {}
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let delays: Vec<f64> = (1..=5)
            .map(|k| backoff_delay(base, k).as_secs_f64())
            .collect();
        assert_eq!(delays, vec![0.1, 0.2, 0.4, 0.8, 1.6]);

        assert_eq!(backoff_delay(Duration::from_secs(5), 10), MAX_RESTART_DELAY);
        assert_eq!(backoff_delay(Duration::from_secs(40), 1), MAX_RESTART_DELAY);
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
    }

    #[test]
    fn disable_set_honours_both_env_forms() {
        let vars = vec![
            ("PIPELINE_DISABLE".to_string(), "Obs_Controller, ,tts_worker".to_string()),
            ("PIPELINE_DISABLE_TWITCH_INGEST".to_string(), "1".to_string()),
            ("PIPELINE_DISABLE_ASR_WORKER".to_string(), "false".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let disabled = disabled_from(vars.into_iter());
        assert!(disabled.contains("obs_controller"));
        assert!(disabled.contains("tts_worker"));
        assert!(disabled.contains("twitch_ingest"));
        assert!(!disabled.contains("asr_worker"));
        assert_eq!(disabled.len(), 3);
    }

    #[test]
    fn host_port_parsing_defaults_the_host() {
        assert_eq!(
            parse_host_port("0.0.0.0:8000"),
            Some(("0.0.0.0".into(), 8000))
        );
        assert_eq!(parse_host_port(":9000"), Some(("127.0.0.1".into(), 9000)));
        assert_eq!(parse_host_port("nonsense"), None);
        assert_eq!(parse_host_port("host:notaport"), None);
    }

    #[test]
    fn from_config_wires_predicates_and_health() {
        let config = ServiceConfig {
            name: "tts_worker".into(),
            command: vec!["python".into(), "-m".into(), "tts_worker".into()],
            restart: true,
            restart_delay_seconds: 2.0,
            env: HashMap::new(),
            health_url: Some("http://127.0.0.1:8082/health".into()),
            health_interval_seconds: 20.0,
            health_timeout_seconds: 5.0,
            health_retries: 3,
            require_port: Some("127.0.0.1:8082".into()),
            require_binary: None,
            require_endpoint: None,
            require_env: vec![],
        };
        let spec = ServiceSpec::from_config(&config);
        assert!(spec.predicate.is_some());
        let health = spec.health_check.unwrap();
        assert_eq!(health.retries, 3);
        assert_eq!(health.interval, Duration::from_secs(20));
        assert_eq!(spec.restart_delay, Duration::from_secs(2));
    }

    fn plain_spec(name: &str, command: Vec<String>, restart: bool, delay_ms: u64) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            command,
            restart,
            restart_delay: Duration::from_millis(delay_ms),
            env_overrides: HashMap::new(),
            predicate: None,
            health_check: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let spec = plain_spec(
            "oneshot",
            vec!["sh".into(), "-c".into(), "exit 0".into()],
            true,
            10,
        );
        // Returns promptly because a zero exit breaks the restart loop.
        tokio::time::timeout(Duration::from_secs(5), run_service(spec, stop_rx))
            .await
            .expect("service loop should finish");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashing_child_is_respawned_with_growing_delays() {
        let marker = std::env::temp_dir().join(format!(
            "suzu-supervisor-test-{}-{}",
            std::process::id(),
            crate::util::unix_now() as u64,
        ));
        let script = format!("date +%s.%N >> {}; exit 1", marker.display());
        let (stop_tx, stop_rx) = watch::channel(false);
        let spec = plain_spec(
            "crasher",
            vec!["sh".into(), "-c".into(), script],
            true,
            20,
        );

        let service = tokio::spawn(run_service(spec, stop_rx));
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = stop_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), service).await;

        let spawns = std::fs::read_to_string(&marker).unwrap_or_default();
        let _ = std::fs::remove_file(&marker);
        let timestamps: Vec<f64> = spawns
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        assert!(
            timestamps.len() >= 3,
            "expected several respawns, saw {}",
            timestamps.len()
        );
        // Gaps between consecutive spawns must not shrink (scheduler jitter
        // aside, the backoff doubles every crash).
        let gaps: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(
                pair[1] >= pair[0] * 0.8,
                "restart gaps shrank: {gaps:?}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn disabled_restart_runs_the_child_once() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let spec = plain_spec(
            "failing-oneshot",
            vec!["sh".into(), "-c".into(), "exit 7".into()],
            false,
            10,
        );
        tokio::time::timeout(Duration::from_secs(5), run_service(spec, stop_rx))
            .await
            .expect("service loop should finish without restarting");
    }
}
