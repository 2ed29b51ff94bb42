//! Exceptions are ordinary values.
//!
//! Control flow that unwinds (`return`, `yield`, `exit`) travels as an
//! exception with one of the control codes; ordinary errors use the rest.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use super::types::{TypeDescr, TypeId, VTable};
use super::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    Syntax,
    ArgCount,
    MaxStackDepthExceeded,
    InternalError,
    Type,
    Name,
    NotCallable,
    Range,
    ZeroDivision,
    IOError,
    SysError,
    NotIterable,
    Exhausted,
    NotIterator,
    Throwable,
    Leave,
    Return,
    Yield,
    Exit,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 19] = [
        ErrorCode::Syntax,
        ErrorCode::ArgCount,
        ErrorCode::MaxStackDepthExceeded,
        ErrorCode::InternalError,
        ErrorCode::Type,
        ErrorCode::Name,
        ErrorCode::NotCallable,
        ErrorCode::Range,
        ErrorCode::ZeroDivision,
        ErrorCode::IOError,
        ErrorCode::SysError,
        ErrorCode::NotIterable,
        ErrorCode::Exhausted,
        ErrorCode::NotIterator,
        ErrorCode::Throwable,
        ErrorCode::Leave,
        ErrorCode::Return,
        ErrorCode::Yield,
        ErrorCode::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Syntax => "ErrorSyntax",
            ErrorCode::ArgCount => "ErrorArgCount",
            ErrorCode::MaxStackDepthExceeded => "ErrorMaxStackDepthExceeded",
            ErrorCode::InternalError => "ErrorInternalError",
            ErrorCode::Type => "ErrorType",
            ErrorCode::Name => "ErrorName",
            ErrorCode::NotCallable => "ErrorNotCallable",
            ErrorCode::Range => "ErrorRange",
            ErrorCode::ZeroDivision => "ErrorZeroDivision",
            ErrorCode::IOError => "ErrorIOError",
            ErrorCode::SysError => "ErrorSysError",
            ErrorCode::NotIterable => "ErrorNotIterable",
            ErrorCode::Exhausted => "ErrorExhausted",
            ErrorCode::NotIterator => "ErrorNotIterator",
            ErrorCode::Throwable => "ErrorThrowable",
            ErrorCode::Leave => "ErrorLeave",
            ErrorCode::Return => "ErrorReturn",
            ErrorCode::Yield => "ErrorYield",
            ErrorCode::Exit => "ErrorExit",
        }
    }

    pub fn from_name(name: &str) -> Option<ErrorCode> {
        let wanted = name.strip_prefix("Error").unwrap_or(name);
        ErrorCode::ALL
            .into_iter()
            .find(|c| c.name().strip_prefix("Error") == Some(wanted))
    }

    /// Codes that carry control flow rather than an error.
    pub fn is_control(self) -> bool {
        matches!(self, ErrorCode::Return | ErrorCode::Yield | ErrorCode::Exit)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of a stack trace, innermost last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub function: String,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackTrace {
    pub frames: Vec<TraceFrame>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} [{}]", self.function, line),
            None => f.write_str(&self.function),
        }
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in self.frames.iter().rev() {
            writeln!(f, "  {}", frame)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Exception {
    pub code: ErrorCode,
    pub message: String,
    /// Value carried by `throw`, `return`, `yield` and `exit`.
    pub throwable: Option<Value>,
    trace: OnceLock<StackTrace>,
    handled: AtomicBool,
}

impl Exception {
    pub fn new(code: ErrorCode, message: impl Into<String>, throwable: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            throwable,
            trace: OnceLock::new(),
            handled: AtomicBool::new(false),
        }
    }

    pub fn trace(&self) -> Option<&StackTrace> {
        self.trace.get()
    }

    /// Attach a trace. The first trace attached wins.
    pub fn set_trace(&self, trace: StackTrace) {
        let _ = self.trace.set(trace);
    }

    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn mark_handled(&self) {
        self.handled.store(true, Ordering::SeqCst);
    }
}

impl Value {
    pub fn exception(code: ErrorCode, message: impl Into<String>) -> Value {
        Value::object(TypeId::EXCEPTION, Exception::new(code, message, None))
    }

    /// Exception carrying a value, as used by `return`, `yield` and `exit`.
    pub fn exception_with(code: ErrorCode, message: impl Into<String>, payload: Value) -> Value {
        Value::object(TypeId::EXCEPTION, Exception::new(code, message, Some(payload)))
    }

    /// Wrap anything that is not already an exception as a `Throwable`.
    pub fn throwable(value: Value) -> Value {
        if value.is_exception() {
            return value;
        }
        let message = value.to_str().into_owned();
        Value::exception_with(ErrorCode::Throwable, message, value)
    }

    pub fn as_exception(&self) -> Option<&Exception> {
        self.downcast::<Exception>()
    }

    pub fn is_exception(&self) -> bool {
        self.type_id() == TypeId::EXCEPTION
    }

    /// The error code, if this is an exception.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.as_exception().map(|e| e.code)
    }
}

fn exception_new(_: TypeId, args: &[Value]) -> Value {
    let (code, rest) = match args.first().and_then(|a| a.as_str()).and_then(ErrorCode::from_name) {
        Some(code) => (code, &args[1..]),
        None => (ErrorCode::Throwable, args),
    };
    let message: Vec<String> = rest.iter().map(|a| a.to_str().into_owned()).collect();
    Value::exception(code, message.join(" "))
}

fn exception_to_string(v: &Value) -> String {
    match v.as_exception() {
        Some(e) if e.message.is_empty() => e.code.name().to_string(),
        Some(e) => format!("{}: {}", e.code.name(), e.message),
        None => "exception".to_string(),
    }
}

fn exception_resolve(v: &Value, name: &str) -> Option<Value> {
    let e = v.as_exception()?;
    match name {
        "code" => Some(Value::int(e.code as i64)),
        "name" => Some(Value::string(e.code.name())),
        "message" => Some(Value::string(e.message.clone())),
        "throwable" => Some(e.throwable.clone().unwrap_or_else(Value::null)),
        "stacktrace" => Some(Value::string(
            e.trace().map(|t| t.to_string()).unwrap_or_default(),
        )),
        _ => None,
    }
}

fn exception_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_exception(), b.as_exception()) {
        (Some(x), Some(y)) => (x.code as u32)
            .cmp(&(y.code as u32))
            .then_with(|| x.message.cmp(&y.message)),
        _ => std::cmp::Ordering::Less,
    }
}

pub(crate) fn exception_type() -> TypeDescr {
    TypeDescr::new(TypeId::EXCEPTION, "exception")
        .with_vtable(VTable {
            new: Some(exception_new),
            to_string: Some(exception_to_string),
            resolve: Some(exception_resolve),
            cmp: Some(exception_cmp),
            ..Default::default()
        })
        .immutable()
}
