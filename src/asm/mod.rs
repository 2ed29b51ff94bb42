//! Program documents.
//!
//! A program is a TOML or JSON document describing a `main` script and the
//! functions nested in it. Each script lists its code as entries that are
//! either an instruction (`op`) or a builder directive (`directive`):
//!
//! ```toml
//! [main]
//! code = [
//!   { op = "PushVal", value = 3, line = 1 },
//!   { op = "Assign", name = "x" },
//!   { op = "PushVar", name = "x", line = 2, label = "again" },
//!   { op = "Return" },
//! ]
//!
//! [[functions]]
//! name = "double"
//! params = ["n"]
//! code = [...]
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AssemblyError, BuildError, LoadError};
use crate::runtime::{Script, ScriptKind};
use crate::value::{Name, Value};
use crate::vm::{BytecodeBuilder, CallSpec, Instruction, Op, VmStatus};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub main: ScriptDef,
    /// Functions nested directly in `main`.
    #[serde(default)]
    pub functions: Vec<ScriptDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub kind: ScriptKind,
    #[serde(default)]
    pub code: Vec<CodeEntry>,
    #[serde(default)]
    pub functions: Vec<ScriptDef>,
}

/// Steers the [`BytecodeBuilder`] instead of emitting an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Bookmark,
    DiscardBookmark,
    /// Move everything since the last bookmark into a deferred block.
    Defer,
    DeferredBegin,
    DeferredEnd,
    PopDeferred,
}

/// One line of a script's code.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeEntry {
    pub op: Option<String>,
    pub directive: Option<Directive>,
    /// Label for this instruction.
    pub label: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub line: Option<u32>,
    /// Variable, attribute or callee name.
    pub name: Option<String>,
    /// Literal for `PushVal`; absent or `null` pushes null.
    pub value: Option<serde_json::Value>,
    /// Jump target.
    pub target: Option<String>,
    pub argc: Option<usize>,
    #[serde(default)]
    pub kwargs: Vec<String>,
    #[serde(default)]
    pub infix: bool,
    #[serde(default)]
    pub varargs: bool,
    /// Stash register.
    pub index: Option<usize>,
    pub status: Option<String>,
}

fn literal(v: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match v {
        Json::Null => Value::null(),
        Json::Bool(b) => Value::bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::int(i),
            None => Value::float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::string(s.as_str()),
        Json::Array(items) => Value::list(items.iter().map(literal).collect()),
        Json::Object(map) => Value::dict(map.iter().map(|(k, v)| (k.clone(), literal(v))).collect()),
    }
}

impl CodeEntry {
    fn to_op(&self, script: &str, index: usize, mnemonic: &str) -> Result<Op, AssemblyError> {
        let missing = |what: &'static str| AssemblyError::MissingOperand {
            script: script.to_string(),
            index,
            op: mnemonic.to_string(),
            what,
        };
        let bad = |reason: String| AssemblyError::BadOperand {
            script: script.to_string(),
            index,
            op: mnemonic.to_string(),
            reason,
        };
        let name = || -> Result<Name, AssemblyError> {
            let text = self.name.as_deref().ok_or_else(|| missing("a name"))?;
            text.parse().map_err(bad)
        };
        let target = || self.target.clone().ok_or_else(|| missing("a target label"));
        let index_operand = || self.index.ok_or_else(|| missing("a stash index"));

        let op = match mnemonic {
            "Assign" => Op::Assign(name()?),
            "PushVal" => Op::PushVal(self.value.as_ref().map(literal).unwrap_or_else(Value::null)),
            "PushVar" => Op::PushVar(name()?),
            "PushScope" => Op::PushScope,
            "PushCtx" => Op::PushCtx,
            "Deref" => Op::Deref(name()?),
            "Subscript" => Op::Subscript,
            "FunctionCall" => Op::FunctionCall(CallSpec {
                name: name()?,
                arg_count: self.argc.unwrap_or(0),
                kwargs: self.kwargs.clone(),
                infix: self.infix,
                varargs: self.varargs,
            }),
            "Test" => Op::Test(target()?),
            "Jump" => Op::Jump(target()?),
            "EnterContext" => Op::EnterContext {
                label: target()?,
                var: match &self.name {
                    Some(_) => name()?,
                    None => Name::default(),
                },
            },
            "LeaveContext" => Op::LeaveContext,
            "Pop" => Op::Pop,
            "Dup" => Op::Dup,
            "Swap" => Op::Swap,
            "Stash" => Op::Stash(index_operand()?),
            "Unstash" => Op::Unstash(index_operand()?),
            "Incr" => Op::Incr,
            "Decr" => Op::Decr,
            "Return" => Op::Return,
            "Throw" => Op::Throw,
            "Yield" => Op::Yield,
            "Nop" => Op::Nop,
            "EndLoop" => Op::EndLoop(target()?),
            "VMStatus" => {
                let status = self.status.as_deref().ok_or_else(|| missing("a status"))?;
                Op::VMStatus(status.parse::<VmStatus>().map_err(bad)?)
            }
            "Iter" => Op::Iter,
            "Next" => Op::Next(target()?),
            _ => {
                return Err(AssemblyError::UnknownOp {
                    script: script.to_string(),
                    index,
                    op: mnemonic.to_string(),
                });
            }
        };
        Ok(op)
    }
}

fn apply(builder: &mut BytecodeBuilder, directive: Directive) -> Result<(), BuildError> {
    match directive {
        Directive::Bookmark => {
            builder.bookmark();
        }
        Directive::DiscardBookmark => {
            builder.discard_bookmark()?;
        }
        Directive::Defer => {
            builder.defer_bookmarked_block()?;
        }
        Directive::DeferredBegin => {
            builder.start_deferred_block();
        }
        Directive::DeferredEnd => {
            builder.end_deferred_block()?;
        }
        Directive::PopDeferred => {
            builder.pop_deferred_block()?;
        }
    }
    Ok(())
}

fn add_function(parent: &mut Script, function: Script) -> Result<(), AssemblyError> {
    if parent.function(&function.name).is_some() {
        return Err(AssemblyError::DuplicateFunction(function.name));
    }
    parent.add_function(function);
    Ok(())
}

impl ScriptDef {
    pub fn assemble(&self) -> Result<Script, AssemblyError> {
        let name = if self.name.is_empty() { "main" } else { self.name.as_str() };
        let build_error = |source: BuildError| AssemblyError::Build {
            script: name.to_string(),
            source,
        };
        let mut builder = BytecodeBuilder::new(name);
        for (index, entry) in self.code.iter().enumerate() {
            if let Some(line) = entry.line {
                builder.set_line(line);
            }
            for label in entry.label.iter().chain(&entry.labels) {
                builder.label(label.clone());
            }
            match (&entry.op, entry.directive) {
                (Some(mnemonic), None) => {
                    let op = entry.to_op(name, index, mnemonic)?;
                    builder.push_instruction(Instruction::new(op));
                }
                (None, Some(directive)) => apply(&mut builder, directive).map_err(build_error)?,
                (None, None) => {
                    return Err(AssemblyError::MissingOperand {
                        script: name.to_string(),
                        index,
                        op: String::new(),
                        what: "an op or a directive",
                    });
                }
                (Some(mnemonic), Some(_)) => {
                    return Err(AssemblyError::BadOperand {
                        script: name.to_string(),
                        index,
                        op: mnemonic.clone(),
                        reason: "an entry is either an op or a directive".to_string(),
                    });
                }
            }
        }
        let bytecode = builder.finish().map_err(build_error)?;
        let mut script = Script::new(bytecode)
            .with_params(self.params.iter().cloned())
            .with_kind(self.kind);
        for def in &self.functions {
            add_function(&mut script, def.assemble()?)?;
        }
        Ok(script)
    }
}

impl Program {
    pub fn from_toml(text: &str) -> Result<Program, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn from_json(text: &str) -> Result<Program, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Read a program, choosing the format by file extension.
    pub fn load(path: &Path) -> Result<Program, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Program::from_toml(&text).map_err(|source| LoadError::Toml {
                path: path.to_path_buf(),
                source,
            }),
            Some("json") => Program::from_json(&text).map_err(|source| LoadError::Json {
                path: path.to_path_buf(),
                source,
            }),
            _ => Err(LoadError::UnknownFormat(path.to_path_buf())),
        }
    }

    /// Assemble `main` with the top-level functions nested in it.
    pub fn assemble(&self) -> Result<Script, AssemblyError> {
        let mut main = self.main.assemble()?;
        for def in &self.functions {
            add_function(&mut main, def.assemble()?)?;
        }
        Ok(main)
    }
}

/// Load and assemble a program file.
pub fn load(path: &Path) -> Result<Script, LoadError> {
    Ok(Program::load(path)?.assemble()?)
}
