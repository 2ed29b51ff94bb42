pub mod closure;
pub mod generator;
pub mod script;

pub use closure::{Closure, Thread};
pub use generator::Generator;
pub use script::{Script, ScriptKind};
