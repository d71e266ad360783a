//! Delegated-external backend: every invocation runs an external command

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Runner, RunnerKind};
use crate::context::LambdaContext;
use crate::function::FunctionDefinition;
use crate::invocation::{HandlerError, InvocationError};

/// Start of the JSON result object in the command's output
static RESULT_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{[\r\n]?\s*"(isBase64Encoded|statusCode|headers|body|principalId)""#)
        .expect("static regex")
});

pub struct ExternalRunner {
    function: Arc<FunctionDefinition>,
    code_dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    command: Vec<String>,
}

impl ExternalRunner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        command: Vec<String>,
    ) -> Self {
        Self {
            function,
            code_dir,
            env,
            command,
        }
    }
}

#[async_trait]
impl Runner for ExternalRunner {
    async fn run(&self, event: Value, _context: LambdaContext) -> Result<Value, InvocationError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(InvocationError::transport("Invoke command is empty"));
        };

        debug!(function = %self.function.key, program = %program, "Running invoke command");
        let mut child = Command::new(program)
            .args(args)
            .args(["-f", self.function.name()])
            .current_dir(&self.code_dir)
            .envs(self.env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvocationError::transport(format!("Failed to spawn {program}: {e}")))?;

        let mut input = serde_json::to_vec(&event)
            .map_err(|e| InvocationError::transport(format!("Failed to encode event: {e}")))?;
        input.push(b'\n');
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| InvocationError::transport(format!("Failed to write event: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| InvocationError::transport(format!("Invoke command failed: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(HandlerError::new("Error", stderr.trim()).into());
        }
        parse_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn cleanup(&self) {}

    fn kind(&self) -> RunnerKind {
        RunnerKind::External
    }
}

/// Parse the result object out of mixed command output
fn parse_output(stdout: &str) -> Result<Value, InvocationError> {
    let Some(found) = RESULT_BOUNDARY.find(stdout) else {
        return Err(InvocationError::transport(format!(
            "Invoke command produced no result: {}",
            stdout.trim()
        )));
    };
    serde_json::Deserializer::from_str(&stdout[found.start()..])
        .into_iter::<Value>()
        .next()
        .unwrap_or_else(|| Ok(Value::Null))
        .map_err(|e| InvocationError::transport(format!("Invalid result from invoke command: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Runtime;
    use serde_json::json;

    #[test]
    fn test_parse_output_skips_log_lines() {
        let stdout = "Serverless: Running...\nhello from handler\n{\n  \"statusCode\": 200,\n  \"body\": \"ok\"\n}\ntrailing";
        assert_eq!(parse_output(stdout).unwrap(), json!({"statusCode": 200, "body": "ok"}));
    }

    #[test]
    fn test_parse_output_authorizer_result() {
        let stdout = r#"{"principalId":"user","policyDocument":{}}"#;
        assert_eq!(parse_output(stdout).unwrap()["principalId"], "user");
    }

    #[test]
    fn test_parse_output_without_boundary() {
        assert!(parse_output("{\"foo\": 1}").unwrap_err().is_transport());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_appends_function_flag() {
        let function = Arc::new(FunctionDefinition::new("hello", "handler.hello", Runtime::Nodejs20));
        // `sh -c '<script>' <name> -f hello` sees the flag as $1 and $2
        let runner = ExternalRunner::new(
            function.clone(),
            PathBuf::from("."),
            Arc::new(HashMap::new()),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '{"statusCode":200,"body":"%s %s"}' "$1" "$2""#.to_string(),
                "invoke".to_string(),
            ],
        );
        let def = FunctionDefinition::new("hello", "handler.hello", Runtime::Nodejs20);
        let result = runner
            .run(json!({"a": 1}), LambdaContext::starting_now(&def, "req-1"))
            .await
            .unwrap();
        assert_eq!(result["body"], "-f hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_fails_invocation() {
        let function = Arc::new(FunctionDefinition::new("hello", "handler.hello", Runtime::Nodejs20));
        let runner = ExternalRunner::new(
            function.clone(),
            PathBuf::from("."),
            Arc::new(HashMap::new()),
            vec!["sh".to_string(), "-c".to_string(), "echo broken >&2".to_string()],
        );
        let error = runner
            .run(Value::Null, LambdaContext::starting_now(&function, "req-1"))
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "broken");
    }
}
