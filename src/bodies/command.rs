//! External collaborator stage backed by a user-configured command.
//!
//! Geocoding, LLM analysis, style transfer and upload all live outside this
//! crate. Each is wrapped as a program that is run once per entry.
//!
//! # Protocol
//!
//! The command receives one JSON object on stdin:
//!
//! ```text
//! {"stage": "geocode", "key": "/photos/a.jpg", "record": {...entry...}}
//! ```
//!
//! and prints a JSON object on stdout. When the object has a `sections` map,
//! each member patches the section of the same name; otherwise the whole
//! object patches the stage's configured section. Markdown code fences around
//! the JSON are tolerated.
//!
//! # Exit status
//!
//! - `0`: success, stdout is the patch
//! - the configured fatal code (default 3): abort the stage and the run
//! - anything else, a spawn error, a timeout, or unparsable output: retry on
//!   the next run
use crate::stage::{Patch, StageBody, StageContext, StageFailure};
use crate::util::truncate_bytes;
use serde_json::{json, Value};
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_FATAL_EXIT_CODE: i32 = 3;

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_STDERR_LOG_BYTES: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandBody {
    argv: Vec<String>,
    section: String,
    healthcheck_url: Option<String>,
    timeout: Option<Duration>,
    fatal_exit_code: i32,
}

impl CommandBody {
    /// Parse `command` with shell quoting rules.
    pub fn new(command: &str, section: impl Into<String>) -> Result<Self, StageFailure> {
        let argv = shell_words::split(command)
            .map_err(|err| StageFailure::fatal(format!("parse command {command:?}: {err}")))?;
        if argv.is_empty() {
            return Err(StageFailure::fatal("command is empty"));
        }
        Ok(Self {
            argv,
            section: section.into(),
            healthcheck_url: None,
            timeout: None,
            fatal_exit_code: DEFAULT_FATAL_EXIT_CODE,
        })
    }

    pub fn with_healthcheck(mut self, url: Option<String>) -> Self {
        self.healthcheck_url = url;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fatal_exit_code(mut self, code: i32) -> Self {
        self.fatal_exit_code = code;
        self
    }

    fn invoke(&self, input: Vec<u8>) -> Result<Vec<u8>, StageFailure> {
        let start = Instant::now();
        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout also reaches anything the command spawned.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|err| StageFailure::recoverable(format!("spawn {}: {err}", self.argv[0])))?;

        // Pipes are drained on their own threads so a chatty command cannot
        // block on a full pipe while we wait for it.
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input)?;
            }
            Ok(())
        });
        let stdout = read_pipe(child.stdout.take());
        let stderr = read_pipe(child.stderr.take());

        let status = wait_with_timeout(&mut child, self.timeout)
            .map_err(|err| StageFailure::recoverable(format!("wait for {}: {err}", self.argv[0])))?;
        let elapsed_ms = start.elapsed().as_millis();
        let Some(status) = status else {
            // A straggler may still hold the pipes; leave the reader threads detached.
            return Err(StageFailure::recoverable(format!(
                "{} timed out after {elapsed_ms} ms",
                self.argv[0]
            )));
        };
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if let Ok(Err(err)) = writer.join() {
            if err.kind() != io::ErrorKind::BrokenPipe {
                return Err(StageFailure::recoverable(format!("write stdin: {err}")));
            }
        }

        tracing::debug!(
            command = %self.argv[0],
            elapsed_ms,
            response_bytes = stdout.len(),
            "command finished"
        );
        if !stderr.is_empty() {
            tracing::debug!(
                command = %self.argv[0],
                stderr = %truncate_bytes(&stderr, MAX_STDERR_LOG_BYTES),
                "command stderr"
            );
        }
        if status.success() {
            return Ok(stdout);
        }
        let message = format!(
            "{} exited with {status}: {}",
            self.argv[0],
            truncate_bytes(&stderr, MAX_STDERR_LOG_BYTES).trim()
        );
        if status.code() == Some(self.fatal_exit_code) {
            Err(StageFailure::fatal(message))
        } else {
            Err(StageFailure::recoverable(message))
        }
    }

    fn parse_patch(&self, stdout: &[u8]) -> Result<Patch, StageFailure> {
        let text = String::from_utf8_lossy(stdout);
        let value: Value = serde_json::from_str(extract_json(&text)).map_err(|err| {
            StageFailure::recoverable(format!("parse {} output as JSON: {err}", self.argv[0]))
        })?;
        let Value::Object(mut object) = value else {
            return Err(StageFailure::recoverable(format!(
                "{} must print a JSON object",
                self.argv[0]
            )));
        };
        match object.remove("sections") {
            Some(Value::Object(sections)) => Ok(sections
                .into_iter()
                .fold(Patch::new(), |patch, (name, value)| patch.with(name, value))),
            Some(_) => Err(StageFailure::recoverable(format!(
                "{} printed a non-object `sections` member",
                self.argv[0]
            ))),
            None => Ok(Patch::section(self.section.clone(), Value::Object(object))),
        }
    }
}

impl StageBody for CommandBody {
    fn preflight(&mut self) -> Result<(), StageFailure> {
        which::which(&self.argv[0]).map_err(|err| {
            StageFailure::fatal(format!("command {} is not available: {err}", self.argv[0]))
        })?;
        if let Some(url) = self.healthcheck_url.as_deref() {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(HEALTHCHECK_TIMEOUT))
                .build()
                .into();
            agent
                .get(url)
                .call()
                .map_err(|err| StageFailure::fatal(format!("health check {url} failed: {err}")))?;
            tracing::info!(%url, "health check passed");
        }
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext<'_>) -> Result<Patch, StageFailure> {
        let record = ctx
            .entry
            .to_value()
            .map_err(|err| StageFailure::fatal(format!("serialize record for {}: {err}", ctx.key)))?;
        let request = json!({
            "stage": ctx.stage,
            "key": ctx.key,
            "record": record,
        });
        let input = serde_json::to_vec(&request)
            .map_err(|err| StageFailure::fatal(format!("serialize request: {err}")))?;
        let stdout = self.invoke(input)?;
        self.parse_patch(&stdout)
    }
}

fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Wait for the child, killing it once `timeout` elapses. `None` means the
/// command timed out.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_tree(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    match libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; the group was created at spawn.
        Ok(pgid) => unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        },
        Err(_) => {
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    text
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn run(body: &mut CommandBody, key: &str) -> Result<Patch, StageFailure> {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut catalog = Catalog::empty(dir.path().join("master.json"));
        catalog
            .upsert_section(key, "file", &json!({"file_name": "a.jpg"}))
            .expect("seed");
        body.process(&StageContext {
            stage: "geocode",
            key,
            entry: catalog.get(key).expect("entry"),
        })
    }

    #[test]
    fn plain_object_patches_configured_section() {
        let mut body =
            CommandBody::new(r#"sh -c 'cat >/dev/null; echo "{\"city\": \"Reno\"}"'"#, "location")
                .expect("command");
        let patch = run(&mut body, "/p/a.jpg").expect("patch");
        assert_eq!(patch, Patch::section("location", json!({"city": "Reno"})));
    }

    #[test]
    fn sections_member_patches_several_sections() {
        let script = r#"sh -c 'cat >/dev/null; printf "%s\n" "\`\`\`json" "{\"sections\": {\"location\": {\"city\": \"Reno\"}, \"pois\": {\"count\": 2}}}" "\`\`\`"'"#;
        let mut body = CommandBody::new(script, "location").expect("command");
        let patch = run(&mut body, "/p/a.jpg").expect("patch");
        assert_eq!(
            patch,
            Patch::section("location", json!({"city": "Reno"})).with("pois", json!({"count": 2}))
        );
    }

    #[test]
    fn command_sees_key_and_record_on_stdin() {
        let mut body = CommandBody::new("cat", "echo").expect("command");
        let patch = run(&mut body, "/p/a.jpg").expect("patch");
        let (_, value) = patch.iter().next().expect("section");
        assert_eq!(value["key"], "/p/a.jpg");
        assert_eq!(value["stage"], "geocode");
        assert_eq!(value["record"]["file"]["file_name"], "a.jpg");
    }

    #[test]
    fn exit_codes_map_to_failure_kinds() {
        let mut transient = CommandBody::new("sh -c 'exit 1'", "x").expect("command");
        assert!(!run(&mut transient, "k").expect_err("exit 1").is_fatal());

        let mut fatal = CommandBody::new("sh -c 'exit 3'", "x").expect("command");
        assert!(run(&mut fatal, "k").expect_err("exit 3").is_fatal());

        let mut custom = CommandBody::new("sh -c 'exit 7'", "x")
            .expect("command")
            .with_fatal_exit_code(7);
        assert!(run(&mut custom, "k").expect_err("exit 7").is_fatal());
    }

    #[test]
    fn garbage_output_is_recoverable() {
        let mut body = CommandBody::new("sh -c 'echo not json'", "x").expect("command");
        assert!(!run(&mut body, "k").expect_err("bad output").is_fatal());
    }

    #[test]
    fn timeout_kills_the_command() {
        let mut body = CommandBody::new("sleep 5", "x")
            .expect("command")
            .with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = run(&mut body, "k").expect_err("timeout");
        assert!(!err.is_fatal());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_reaches_commands_started_by_a_wrapper() {
        let mut body = CommandBody::new("sh -c 'cat >/dev/null; sleep 6; echo done'", "x")
            .expect("command")
            .with_timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let err = run(&mut body, "k").expect_err("timeout");
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn missing_program_fails_preflight() {
        let mut body =
            CommandBody::new("definitely-not-a-real-program-xyz", "x").expect("command");
        assert!(body.preflight().expect_err("missing").is_fatal());
        assert!(CommandBody::new("   ", "x").is_err());
    }
}
