use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::closure::Closure;
use crate::error::FatalError;
use crate::value::native::builtins;
use crate::value::{Kwargs, Value};
use crate::vm::{Bytecode, Debugger, VmOptions};

/// How calling a script's closure runs its bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Run to completion on the calling thread.
    #[default]
    Sync,
    /// Run on a new thread; the call returns a thread handle.
    Async,
    /// The call returns a generator; each `next` resumes the body.
    Generator,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptKind::Sync => "sync",
            ScriptKind::Async => "async",
            ScriptKind::Generator => "generator",
        };
        f.write_str(s)
    }
}

impl FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(ScriptKind::Sync),
            "async" => Ok(ScriptKind::Async),
            "generator" => Ok(ScriptKind::Generator),
            _ => Err(format!("unknown script kind '{}'", s)),
        }
    }
}

/// A compiled function body and the functions nested in it.
#[derive(Debug)]
pub struct Script {
    pub name: String,
    pub params: Vec<String>,
    pub kind: ScriptKind,
    pub bytecode: Arc<Bytecode>,
    pub functions: IndexMap<String, Arc<Script>>,
}

impl Script {
    pub fn new(bytecode: Bytecode) -> Self {
        Self {
            name: bytecode.name().to_string(),
            params: Vec::new(),
            kind: ScriptKind::Sync,
            bytecode: Arc::new(bytecode),
            functions: IndexMap::new(),
        }
    }

    pub fn with_params<S: Into<String>>(mut self, params: impl IntoIterator<Item = S>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kind(mut self, kind: ScriptKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn add_function(&mut self, script: Script) {
        self.functions.insert(script.name.clone(), Arc::new(script));
    }

    pub fn function(&self, name: &str) -> Option<&Arc<Script>> {
        self.functions.get(name)
    }

    /// All scripts reachable from this one, depth first, this one included.
    pub fn walk(&self) -> Vec<&Script> {
        let mut out = vec![self];
        for f in self.functions.values() {
            out.extend(f.walk());
        }
        out
    }

    fn entry(self: &Arc<Self>, options: VmOptions) -> Closure {
        let globals = globals(&options);
        Closure::new(Arc::clone(self), None, globals, options)
    }

    /// A top-level closure over a fresh global scope.
    pub fn closure(self: &Arc<Self>, options: VmOptions) -> Value {
        self.entry(options).value()
    }

    /// Call this script as a program's entry point.
    pub fn run(self: &Arc<Self>, options: VmOptions) -> Result<Value, FatalError> {
        self.entry(options).execute(&[], &Kwargs::new())
    }

    /// Like [`Script::run`], stepping through `debugger`.
    pub fn debug(self: &Arc<Self>, options: VmOptions, debugger: Box<dyn Debugger>) -> Result<Value, FatalError> {
        self.entry(options).execute_debug(debugger)
    }
}

/// The builtins plus the functions that talk to the host: `print` and
/// `exit`, which requests an exit on the signal in `options`.
fn globals(options: &VmOptions) -> Value {
    let mut globals = builtins();
    globals.insert(
        "print".to_string(),
        Value::native("print", 0, None, |args, _| {
            let parts: Vec<String> = args.iter().map(|a| a.to_str().into_owned()).collect();
            println!("{}", parts.join(" "));
            Value::null()
        }),
    );
    let signal = options.exit_signal.clone();
    globals.insert(
        "exit".to_string(),
        Value::native("exit", 0, Some(1), move |args, _| {
            let code = args.first().cloned().unwrap_or_else(|| Value::int(0));
            signal.request(code.clone());
            code
        }),
    );
    Value::dict(globals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ExitSignal, Instruction, Op};

    fn script(name: &str) -> Script {
        Script::new(Bytecode::from_instructions(name, vec![Instruction::new(Op::Nop)]))
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("generator".parse::<ScriptKind>(), Ok(ScriptKind::Generator));
        assert!("lazy".parse::<ScriptKind>().is_err());
        assert_eq!(ScriptKind::Async.to_string(), "async");
    }

    #[test]
    fn test_exit_builtin_uses_own_signal() {
        let signal = ExitSignal::new();
        let options = VmOptions {
            exit_signal: signal.clone(),
            ..Default::default()
        };
        let g = globals(&options);
        let exit = g.resolve("exit").unwrap();
        exit.call(&[Value::int(4)], &Kwargs::new());
        assert_eq!(signal.code().unwrap().as_int(), Some(4));
        assert!(g.resolve("len").is_some());
        assert!(g.resolve("print").is_some());
    }

    #[test]
    fn test_walk() {
        let mut main = script("main");
        let mut outer = script("outer");
        outer.add_function(script("inner"));
        main.add_function(outer);
        let names: Vec<&str> = main.walk().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["main", "outer", "inner"]);
        assert!(main.function("outer").is_some());
        assert!(main.function("inner").is_none());
    }
}
