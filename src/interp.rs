use std::sync::atomic::{AtomicU64, Ordering};

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, Scope, AST};

use crate::error::ScriptError;
use crate::page::{Page, WindowId};
use crate::watchdog::{Watchdog, HALT_TOKEN, TIMEOUT_TOKEN};

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

pub struct InterpreterFactory {
    id: u64,
}

impl InterpreterFactory {
    pub(crate) fn new() -> Self {
        Self { id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn build(&self, watchdog: &Watchdog) -> Interpreter {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        watchdog.install(&mut engine);
        Interpreter { engine }
    }
}

/// The reusable compiled form of one script unit.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub(crate) name: String,
    pub(crate) start_line: usize,
    pub(crate) ast: AST,
}

impl CompiledUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based line of the containing document where this unit begins.
    pub fn start_line(&self) -> usize {
        self.start_line
    }
}

#[derive(Debug, Clone)]
pub enum ScriptCallback {
    Function(FnPtr),
    Named(String),
    Source(String),
}

/// A callable frozen together with its creation-time window and page binding.
#[derive(Debug, Clone)]
pub struct BoundCallback {
    pub(crate) window: WindowId,
    pub(crate) page: Page,
    pub(crate) callable: ScriptCallback,
}

impl BoundCallback {
    pub fn new(page: &Page, callable: ScriptCallback) -> Self {
        Self { window: page.window(), page: page.clone(), callable }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }
}

pub(crate) enum EvalFailure {
    Halted,
    Error(ScriptError),
}

pub(crate) struct Interpreter {
    engine: Engine,
}

impl Interpreter {
    pub(crate) fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub(crate) fn compile(
        &self,
        source: &str,
        name: &str,
        start_line: usize,
    ) -> Result<CompiledUnit, ScriptError> {
        match self.engine.compile(source) {
            Ok(mut ast) => {
                ast.set_source(name);
                Ok(CompiledUnit { name: name.to_string(), start_line, ast })
            }
            Err(err) => Err(ScriptError::parse(name, start_line, &err)),
        }
    }

    pub(crate) fn eval(
        &self,
        scope: &mut Scope<'static>,
        program: &AST,
        unit: &str,
        start_line: usize,
    ) -> Result<Dynamic, EvalFailure> {
        self.engine
            .eval_ast_with_scope::<Dynamic>(scope, program)
            .map_err(|err| classify(&err, unit, start_line))
    }

    pub(crate) fn call_named(
        &self,
        scope: &mut Scope<'static>,
        lib: &AST,
        fn_name: &str,
        this: &mut Dynamic,
        args: Vec<Dynamic>,
        unit: &str,
    ) -> Result<Dynamic, EvalFailure> {
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(this);
        self.engine
            .call_fn_with_options::<Dynamic>(options, scope, lib, fn_name, args)
            .map_err(|err| classify(&err, unit, 1))
    }

    pub(crate) fn call_fn_ptr(
        &self,
        fn_ptr: &FnPtr,
        lib: &AST,
        args: Vec<Dynamic>,
        unit: &str,
    ) -> Result<Dynamic, EvalFailure> {
        fn_ptr.call::<Dynamic>(&self.engine, lib, args).map_err(|err| classify(&err, unit, 1))
    }
}

fn classify(err: &EvalAltResult, unit: &str, start_line: usize) -> EvalFailure {
    if let EvalAltResult::ErrorTerminated(token, position) = err {
        let token = token.to_string();
        if token == HALT_TOKEN {
            return EvalFailure::Halted;
        }
        if token == TIMEOUT_TOKEN {
            return EvalFailure::Error(ScriptError::timeout(unit, start_line, *position));
        }
    }
    EvalFailure::Error(ScriptError::runtime(unit, start_line, err))
}
