// SPDX-License-Identifier: Apache-2.0

//! The scripted-callback seam.
//!
//! Scripted pipeline kinds (`transform`, `grep`, `aggregate`) evaluate user
//! logic through the narrow [`ScriptHost`] trait. The core never sees the
//! host's own types or failure detail beyond [`ScriptError`].
//!
//! The shipped implementation, [`CommandHost`], keeps one long-lived
//! subprocess per file and speaks a JSON-lines protocol over its
//! stdin/stdout:
//!
//! ```text
//! > {"kind":"transform","line":"..."}          < {"result":"..."} | {"result":null}
//! > {"kind":"grep","fields":["a","b"]}         < {"fields":["b"]} | {"fields":null}
//! > {"kind":"aggregate","fields":["a","b"]}    < {"key":"k","deltas":{"x":1}}
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script host i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("script host protocol: {0}")]
    Protocol(String),
    #[error("script evaluation: {0}")]
    Eval(String),
}

/// One evaluation request.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScriptCall<'a> {
    Transform { line: &'a str },
    Grep { fields: &'a [String] },
    Aggregate { fields: &'a [String] },
}

/// What an evaluation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReturn {
    /// The callback elected to drop the line.
    Drop,
    /// Replacement line from a transform callback.
    Line(String),
    /// Ordered, non-empty field list from a grep callback.
    Fields(Vec<String>),
    /// Aggregation deltas under a primary key.
    Deltas {
        key: String,
        deltas: Vec<(String, i64)>,
    },
}

pub trait ScriptHost: Send {
    fn evaluate(&mut self, call: ScriptCall<'_>) -> Result<ScriptReturn, ScriptError>;
}

#[derive(Debug, Deserialize)]
struct WireReturn {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    fields: Option<Vec<String>>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    deltas: Option<BTreeMap<String, i64>>,
    #[serde(default)]
    error: Option<String>,
}

/// Subprocess-backed script host.
pub struct CommandHost {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    command: String,
}

impl CommandHost {
    /// Spawn `command` through the shell. The process stays up for the life
    /// of the host and answers one JSON line per request line.
    pub fn spawn(command: &str) -> Result<Self, ScriptError> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScriptError::Protocol("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| ScriptError::Protocol("no stdout handle".into()))?;

        Ok(Self {
            child,
            stdin,
            stdout,
            command: command.to_string(),
        })
    }

    fn roundtrip(&mut self, call: &ScriptCall<'_>) -> Result<WireReturn, ScriptError> {
        let mut line = serde_json::to_string(call)
            .map_err(|e| ScriptError::Protocol(format!("encode request: {e}")))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;

        let mut reply = String::new();
        let n = self.stdout.read_line(&mut reply)?;
        if n == 0 {
            return Err(ScriptError::Protocol(format!(
                "{}: host exited",
                self.command
            )));
        }
        serde_json::from_str(&reply)
            .map_err(|e| ScriptError::Protocol(format!("decode reply: {e}")))
    }
}

impl ScriptHost for CommandHost {
    fn evaluate(&mut self, call: ScriptCall<'_>) -> Result<ScriptReturn, ScriptError> {
        let reply = self.roundtrip(&call)?;
        if let Some(msg) = reply.error {
            return Err(ScriptError::Eval(msg));
        }

        match call {
            ScriptCall::Transform { .. } => Ok(match reply.result {
                Some(line) => ScriptReturn::Line(line),
                None => ScriptReturn::Drop,
            }),
            ScriptCall::Grep { .. } => match reply.fields {
                Some(fields) if fields.is_empty() => {
                    Err(ScriptError::Eval("grep returned an empty field list".into()))
                }
                Some(fields) => Ok(ScriptReturn::Fields(fields)),
                None => Ok(ScriptReturn::Drop),
            },
            ScriptCall::Aggregate { .. } => {
                let key = reply
                    .key
                    .ok_or_else(|| ScriptError::Eval("aggregate reply missing key".into()))?;
                let deltas = reply
                    .deltas
                    .ok_or_else(|| ScriptError::Eval("aggregate reply missing deltas".into()))?;
                Ok(ScriptReturn::Deltas {
                    key,
                    deltas: deltas.into_iter().collect(),
                })
            }
        }
    }
}

impl Drop for CommandHost {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
