//! Engine functions resolved by name.
//!
//! [`Session::resolve`] first checks the table of built-in session methods
//! and otherwise builds a [`ProxyFunction`] for the name. Nothing is cached:
//! a function that did not exist at one call (say, before its directory was
//! added to the path) works on the next. A trailing underscore (`exit_`)
//! skips the built-in table so engine functions that share a name with a
//! session method stay reachable.

use async_trait::async_trait;
use octbridge_core::{CommandRequest, Nout, Value};

use crate::{Session, SessionError};

/// Something that can be called with engine values.
#[async_trait]
pub trait Callable: Send + Sync {
    /// The name this callable was resolved from.
    fn name(&self) -> &str;

    /// The built-in session method behind this callable, if any.
    fn builtin(&self) -> Option<BuiltinMethod> {
        None
    }

    /// Call with positional arguments, keeping up to `nout` outputs.
    async fn call(&self, args: Vec<Value>, nout: Nout) -> Result<Vec<Value>, SessionError>;
}

/// Session methods that are never proxied to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethod {
    Eval,
    Feval,
    Push,
    Pull,
    GetRef,
    AddPath,
    RemovePath,
    Cd,
    Run,
    Exists,
    Start,
    Restart,
    Close,
    Exit,
}

impl BuiltinMethod {
    pub const ALL: [Self; 14] = [
        Self::Eval,
        Self::Feval,
        Self::Push,
        Self::Pull,
        Self::GetRef,
        Self::AddPath,
        Self::RemovePath,
        Self::Cd,
        Self::Run,
        Self::Exists,
        Self::Start,
        Self::Restart,
        Self::Close,
        Self::Exit,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eval => "eval",
            Self::Feval => "feval",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::GetRef => "get_ref",
            Self::AddPath => "addpath",
            Self::RemovePath => "rmpath",
            Self::Cd => "cd",
            Self::Run => "run",
            Self::Exists => "exists",
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Close => "close",
            Self::Exit => "exit",
        }
    }

    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// An engine function bound to a session.
#[derive(Debug, Clone)]
pub struct ProxyFunction<'a> {
    session: &'a Session,
    name: String,
}

impl ProxyFunction<'_> {
    /// A request for this function, for adding keyword arguments, a timeout
    /// or `store_as` before passing it to [`Session::execute`].
    #[must_use]
    pub fn request(&self) -> CommandRequest {
        CommandRequest::call(self.name.as_str())
    }

    /// Call for the first output only.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub async fn call_one(&self, args: Vec<Value>) -> Result<Value, SessionError> {
        self.session.call(&self.name, args).await
    }
}

#[async_trait]
impl Callable for ProxyFunction<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>, nout: Nout) -> Result<Vec<Value>, SessionError> {
        self.session.feval(&self.name, args, nout).await
    }
}

struct Builtin<'a> {
    session: &'a Session,
    method: BuiltinMethod,
}

impl Builtin<'_> {
    fn text(&self, args: &[Value], index: usize) -> Result<String, SessionError> {
        args.get(index)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SessionError::InvalidArguments {
                method: self.method.name(),
                reason: format!("argument {} must be text", index + 1),
            })
    }

    fn expect_len(&self, args: &[Value], len: usize) -> Result<(), SessionError> {
        if args.len() == len {
            Ok(())
        } else {
            Err(SessionError::InvalidArguments {
                method: self.method.name(),
                reason: format!("expected {len} arguments, got {}", args.len()),
            })
        }
    }
}

#[async_trait]
impl Callable for Builtin<'_> {
    fn name(&self) -> &str {
        self.method.name()
    }

    fn builtin(&self) -> Option<BuiltinMethod> {
        Some(self.method)
    }

    async fn call(&self, mut args: Vec<Value>, nout: Nout) -> Result<Vec<Value>, SessionError> {
        let session = self.session;
        match self.method {
            BuiltinMethod::Eval => {
                self.expect_len(&args, 1)?;
                Ok(session.eval(&self.text(&args, 0)?).await?.into_iter().collect())
            }
            BuiltinMethod::Feval => {
                let name = self.text(&args, 0)?;
                args.remove(0);
                session.feval(&name, args, nout).await
            }
            BuiltinMethod::Push => {
                self.expect_len(&args, 2)?;
                let name = self.text(&args, 0)?;
                let value = args.pop().unwrap_or_default();
                session.push(&name, value).await.map(|()| Vec::new())
            }
            BuiltinMethod::Pull => {
                self.expect_len(&args, 1)?;
                Ok(vec![session.pull(&self.text(&args, 0)?).await?])
            }
            BuiltinMethod::GetRef => {
                self.expect_len(&args, 1)?;
                Ok(vec![session.get_ref(&self.text(&args, 0)?).await?.into()])
            }
            BuiltinMethod::AddPath
            | BuiltinMethod::RemovePath
            | BuiltinMethod::Cd
            | BuiltinMethod::Run => {
                self.expect_len(&args, 1)?;
                let target = self.text(&args, 0)?;
                match self.method {
                    BuiltinMethod::AddPath => session.add_path(&target).await?,
                    BuiltinMethod::RemovePath => session.remove_path(&target).await?,
                    BuiltinMethod::Cd => session.cd(&target).await?,
                    _ => session.run_script(&target).await?,
                }
                Ok(Vec::new())
            }
            BuiltinMethod::Exists => {
                self.expect_len(&args, 1)?;
                let code = session.exists(&self.text(&args, 0)?).await?;
                Ok(vec![Value::from(code)])
            }
            BuiltinMethod::Start
            | BuiltinMethod::Restart
            | BuiltinMethod::Close
            | BuiltinMethod::Exit => {
                self.expect_len(&args, 0)?;
                match self.method {
                    BuiltinMethod::Start => session.start().await?,
                    BuiltinMethod::Restart => session.restart().await?,
                    _ => session.close().await?,
                }
                Ok(Vec::new())
            }
        }
    }
}

impl Session {
    /// Resolve `name` to a built-in method or an engine function.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidName`] for empty names.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Callable + '_>, SessionError> {
        if let Some(escaped) = name.strip_suffix('_') {
            return Ok(Box::new(self.proxy(escaped)?));
        }
        if let Some(method) = BuiltinMethod::lookup(name) {
            return Ok(Box::new(Builtin {
                session: self,
                method,
            }));
        }
        Ok(Box::new(self.proxy(name)?))
    }

    /// The engine function `name`, bypassing the built-in table.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidName`] for empty names.
    pub fn function(&self, name: &str) -> Result<ProxyFunction<'_>, SessionError> {
        self.proxy(name)
    }

    fn proxy(&self, name: &str) -> Result<ProxyFunction<'_>, SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        Ok(ProxyFunction {
            session: self,
            name: name.to_string(),
        })
    }
}
