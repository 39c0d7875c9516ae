//! Command requests and their outcomes.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Value;

/// Number of outputs requested from a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Nout {
    /// Exactly this many outputs, or fewer if the function produces fewer.
    Count(usize),
    /// Every output the function declares for this call.
    Max,
}

impl Default for Nout {
    fn default() -> Self {
        Self::Count(1)
    }
}

impl From<usize> for Nout {
    fn from(n: usize) -> Self {
        Self::Count(n)
    }
}

/// What the engine is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    /// Call a function by (possibly dotted) name or by `.m` file path.
    Call { name: String },
    /// Evaluate source text in the base workspace.
    Eval { code: String },
}

/// One call into the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    kind: RequestKind,
    args: Vec<Value>,
    nout: Nout,
    timeout: Option<Duration>,
    store_as: Option<String>,
}

impl CommandRequest {
    /// Call the named function.
    #[must_use]
    pub fn call(name: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Call { name: name.into() },
            args: Vec::new(),
            nout: Nout::default(),
            timeout: None,
            store_as: None,
        }
    }

    /// Evaluate source text; the engine's `ans`, if produced, is the single output.
    #[must_use]
    pub fn eval(code: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Eval { code: code.into() },
            args: Vec::new(),
            nout: Nout::Count(1),
            timeout: None,
            store_as: None,
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append positional arguments.
    #[must_use]
    pub fn args<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Append a `'key', value` pair.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push(Value::Char(key.into()));
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn nout(mut self, nout: impl Into<Nout>) -> Self {
        self.nout = nout.into();
        self
    }

    /// Override the session timeout for this call only.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Store the first output in an engine variable instead of returning it.
    #[must_use]
    pub fn store_as(mut self, variable: impl Into<String>) -> Self {
        self.store_as = Some(variable.into());
        self
    }

    #[must_use]
    pub const fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Function name for calls, `"eval"` for evaluations.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            RequestKind::Call { name } => name,
            RequestKind::Eval { .. } => "eval",
        }
    }

    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.args
    }

    #[must_use]
    pub const fn requested_nout(&self) -> Nout {
        self.nout
    }

    #[must_use]
    pub const fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn store_target(&self) -> Option<&str> {
        self.store_as.as_deref()
    }

    /// Directory and stem when the name is a path to an `.m` file.
    ///
    /// Returns `Ok(None)` for plain function names and `Err` with the offending
    /// extension for paths to anything other than an `.m` file.
    pub fn script_path(&self) -> Result<Option<(PathBuf, String)>, String> {
        let RequestKind::Call { name } = &self.kind else {
            return Ok(None);
        };
        if !name.contains(['/', '\\']) && !name.ends_with(".m") {
            return Ok(None);
        }
        let path = PathBuf::from(name);
        match path.extension().and_then(|e| e.to_str()) {
            Some("m") => {}
            Some(other) => return Err(other.to_string()),
            None => return Err(String::new()),
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(String::new)?;
        let dir = path.parent().map(PathBuf::from).unwrap_or_default();
        Ok(Some((dir, stem)))
    }
}

/// Successful result of one command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandOutcome {
    /// Output values, at most the requested count.
    pub values: Vec<Value>,
    /// Engine output printed while the command ran.
    pub output: Vec<String>,
}

impl CommandOutcome {
    /// First value, or the empty placeholder when nothing was produced.
    #[must_use]
    pub fn first(&self) -> Value {
        self.values.first().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kwargs_are_flattened() {
        let req = CommandRequest::call("plot")
            .arg(vec![1.0, 2.0])
            .kwarg("LineWidth", 2.0)
            .nout(0);
        assert_eq!(req.arguments().len(), 3);
        assert_eq!(req.arguments()[1], Value::Char("LineWidth".into()));
        assert_eq!(req.requested_nout(), Nout::Count(0));
    }

    #[test]
    fn test_script_path() {
        let plain = CommandRequest::call("zeros");
        assert_eq!(plain.script_path(), Ok(None));

        let script = CommandRequest::call("/tmp/scripts/roundtrip.m");
        assert_eq!(
            script.script_path(),
            Ok(Some((PathBuf::from("/tmp/scripts"), "roundtrip".to_string())))
        );

        let bad = CommandRequest::call("/tmp/scripts/roundtrip.py");
        assert_eq!(bad.script_path(), Err("py".to_string()));
    }

    #[test]
    fn test_default_nout_is_one() {
        assert_eq!(CommandRequest::call("ones").requested_nout(), Nout::Count(1));
        assert_eq!(CommandRequest::eval("x = 1").name(), "eval");
    }
}
