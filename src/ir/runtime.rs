//! Resolved handles to the runtime primitives the detector models.
//! Mirrors the bootstrap of the analyzed runtime: every name must resolve
//! before any walking begins, and a missing member is fatal.

use std::error::Error;
use std::fmt;

use super::{FuncId, Program};

/// Runtime functions the detector needs handles for. `presystemstack`,
/// `postsystemstack` and `morestack` are synthetic: embedders insert them
/// while lowering stack switches and function prologues.
#[derive(Debug)]
pub struct RuntimeFns {
    pub lock: FuncId,
    pub unlock: FuncId,

    pub newobject: FuncId,
    pub newarray: FuncId,
    pub makemap: FuncId,
    pub makechan: FuncId,

    pub growslice: FuncId,
    pub slicecopy: FuncId,
    pub slicestringcopy: FuncId,

    pub mapaccess1: FuncId,
    pub mapaccess2: FuncId,
    pub mapassign1: FuncId,
    pub mapdelete: FuncId,

    pub chansend1: FuncId,
    pub closechan: FuncId,

    pub gopanic: FuncId,

    pub presystemstack: FuncId,
    pub postsystemstack: FuncId,
    pub morestack: FuncId,

    /// Optional: when present, `getg()` is modeled as reading the current
    /// goroutine pointer.
    pub getg: Option<FuncId>,
}

const REQUIRED: &[&str] = &[
    "lock",
    "unlock",
    "newobject",
    "newarray",
    "makemap",
    "makechan",
    "growslice",
    "slicecopy",
    "slicestringcopy",
    "mapaccess1",
    "mapaccess2",
    "mapassign1",
    "mapdelete",
    "chansend1",
    "closechan",
    "gopanic",
    "presystemstack",
    "postsystemstack",
    "morestack",
];

/// A runtime member failed to resolve during bootstrap.
#[derive(Debug)]
pub struct RuntimeLookupError {
    pub package: String,
    pub member: String,
}

impl fmt::Display for RuntimeLookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} not found", self.package, self.member)
    }
}

impl Error for RuntimeLookupError {}

impl RuntimeFns {
    /// Resolve every required member as `<package>.<name>` in `program`.
    pub fn lookup(program: &Program, package: &str) -> Result<Self, RuntimeLookupError> {
        let get = |member: &str| -> Result<FuncId, RuntimeLookupError> {
            program
                .func_by_name(&format!("{}.{}", package, member))
                .ok_or_else(|| RuntimeLookupError {
                    package: package.to_owned(),
                    member: member.to_owned(),
                })
        };
        Ok(Self {
            lock: get("lock")?,
            unlock: get("unlock")?,
            newobject: get("newobject")?,
            newarray: get("newarray")?,
            makemap: get("makemap")?,
            makechan: get("makechan")?,
            growslice: get("growslice")?,
            slicecopy: get("slicecopy")?,
            slicestringcopy: get("slicestringcopy")?,
            mapaccess1: get("mapaccess1")?,
            mapaccess2: get("mapaccess2")?,
            mapassign1: get("mapassign1")?,
            mapdelete: get("mapdelete")?,
            chansend1: get("chansend1")?,
            closechan: get("closechan")?,
            gopanic: get("gopanic")?,
            presystemstack: get("presystemstack")?,
            postsystemstack: get("postsystemstack")?,
            morestack: get("morestack")?,
            getg: program.func_by_name(&format!("{}.getg", package)),
        })
    }

    /// Declare every required member as an external function and resolve the
    /// handles. Convenience for embedders whose input lacks a runtime
    /// package, and for tests.
    pub fn declare_all(program: &mut Program, package: &str) -> Self {
        for member in REQUIRED {
            program.declare_func(&format!("{}.{}", package, member));
        }
        program.declare_func(&format!("{}.getg", package));
        Self::lookup(program, package).expect("just declared")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_member_is_fatal() {
        let mut program = Program::new();
        program.declare_func("runtime.lock");
        let err = RuntimeFns::lookup(&program, "runtime").unwrap_err();
        assert_eq!(err.to_string(), "runtime.unlock not found");
    }

    #[test]
    fn declare_all_resolves() {
        let mut program = Program::new();
        let fns = RuntimeFns::declare_all(&mut program, "runtime");
        assert_eq!(program.func_name(fns.lock), "runtime.lock");
        assert_eq!(program.func_name(fns.gopanic), "runtime.gopanic");
        assert!(fns.getg.is_some());
    }
}
