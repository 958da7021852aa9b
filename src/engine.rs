use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use rhai::{Dynamic, FnPtr, Scope, AST, INT};

use crate::actions::{ActionBuffer, PostponedAction};
use crate::cache::{CacheKey, CompileCache};
use crate::config::ScriptConfig;
use crate::error::{ErrorReporter, LogReporter, ScriptError};
use crate::interp::{
    BoundCallback, CompiledUnit, EvalFailure, Interpreter, InterpreterFactory, ScriptCallback,
};
use crate::page::{LivenessTracker, Page, WindowId};
use crate::scheduler::{Job, JobId, WindowScheduler, STOP_GRACE};
use crate::watchdog::Watchdog;

const CALLBACK_UNIT: &str = "<callback>";

/// Embedder hook run once per window when its interpreter is built; applies
/// to windows created after it is set.
pub type HostBinder = Arc<dyn Fn(&mut rhai::Engine, &WindowContext) + Send + Sync>;

/// Sink for script-raised alerts.
pub trait AlertHandler: Send + Sync {
    fn alert(&self, page: &Page, message: &str);
}

pub struct LogAlertHandler;

impl AlertHandler for LogAlertHandler {
    fn alert(&self, page: &Page, message: &str) {
        eprintln!("[script] alert from {}: {message}", page.url());
    }
}

#[derive(Clone, Default)]
pub struct CollectingAlertHandler {
    messages: Arc<Mutex<Vec<String>>>,
}

impl CollectingAlertHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AlertHandler for CollectingAlertHandler {
    fn alert(&self, _page: &Page, message: &str) {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).push(message.to_string());
    }
}

/// Window-scoped view of the engine handed to host functions; everything it
/// exposes is keyed to the window's current page.
#[derive(Clone)]
pub struct WindowContext {
    core: Weak<EngineCore>,
    window: WindowId,
}

impl WindowContext {
    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn current_page(&self) -> Option<Page> {
        self.core.upgrade().and_then(|core| core.liveness.current_page(self.window))
    }

    /// `None` when the engine is gone, shut down, or the window has no live page.
    pub fn schedule(
        &self,
        callback: ScriptCallback,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Option<JobId> {
        let core = self.core.upgrade()?;
        let page = core.liveness.current_page(self.window)?;
        core.schedule_job(&page, callback, delay, interval)
    }

    pub fn cancel(&self, id: JobId) -> bool {
        match self.core.upgrade() {
            Some(core) => core.cancel_job(self.window, id),
            None => false,
        }
    }

    /// Defers host work until the script call on this window's stack returns.
    pub fn postpone(&self, action: impl FnOnce() + Send + 'static) -> Result<(), ScriptError> {
        let Some(core) = self.core.upgrade() else { return Ok(()) };
        let Some(page) = core.liveness.current_page(self.window) else { return Ok(()) };
        core.postpone(&page, Box::new(action))
    }

    pub fn alert(&self, message: &str) {
        let Some(core) = self.core.upgrade() else { return };
        let Some(page) = core.liveness.current_page(self.window) else { return };
        let handler = core.alerts.read().unwrap_or_else(PoisonError::into_inner).clone();
        handler.alert(&page, message);
    }
}

struct WindowState {
    interp: Interpreter,
    scope: Scope<'static>,
    // fn definitions from evaluated units; never statements
    lib: AST,
}

struct WindowEntry {
    watchdog: Watchdog,
    state: Mutex<WindowState>,
    actions: ActionBuffer,
    scheduler: Mutex<Option<Arc<WindowScheduler>>>,
}

pub(crate) struct EngineCore {
    me: Weak<EngineCore>,
    factory: InterpreterFactory,
    // parse-only; never evaluates
    compiler: Interpreter,
    windows: RwLock<HashMap<WindowId, Arc<WindowEntry>>>,
    next_window: AtomicU64,
    liveness: LivenessTracker,
    cache: CompileCache,
    timeout_millis: AtomicU64,
    throw_on_error: AtomicBool,
    inert: AtomicBool,
    reporter: RwLock<Arc<dyn ErrorReporter>>,
    alerts: RwLock<Arc<dyn AlertHandler>>,
    binder: RwLock<Option<HostBinder>>,
}

impl EngineCore {
    fn new(config: &ScriptConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let factory = InterpreterFactory::new();
            let compiler = factory.build(&Watchdog::new());
            let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);
            let alerts: Arc<dyn AlertHandler> = Arc::new(LogAlertHandler);
            Self {
                me: me.clone(),
                factory,
                compiler,
                windows: RwLock::new(HashMap::new()),
                next_window: AtomicU64::new(1),
                liveness: LivenessTracker::new(),
                cache: CompileCache::new(),
                timeout_millis: AtomicU64::new(config.timeout_millis),
                throw_on_error: AtomicBool::new(config.throw_on_error),
                inert: AtomicBool::new(false),
                reporter: RwLock::new(reporter),
                alerts: RwLock::new(alerts),
                binder: RwLock::new(None),
            }
        })
    }

    fn inert(&self) -> bool {
        self.inert.load(Ordering::Relaxed)
    }

    fn timeout(&self) -> Option<Duration> {
        match self.timeout_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    fn throws(&self) -> bool {
        self.throw_on_error.load(Ordering::Relaxed)
    }

    fn report(&self, error: &ScriptError) {
        let reporter = self.reporter.read().unwrap_or_else(PoisonError::into_inner).clone();
        reporter.report(error);
    }

    fn window_entry(&self, window: WindowId) -> Option<Arc<WindowEntry>> {
        self.windows.read().unwrap_or_else(PoisonError::into_inner).get(&window).cloned()
    }

    fn create_window(&self) -> WindowId {
        let window = WindowId::new(self.next_window.fetch_add(1, Ordering::Relaxed));
        if self.inert() {
            return window;
        }
        let watchdog = Watchdog::new();
        let mut interp = self.factory.build(&watchdog);
        let ctx = WindowContext { core: self.me.clone(), window };
        register_window_api(interp.engine_mut(), &ctx);
        let binder = self.binder.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(binder) = binder {
            binder(interp.engine_mut(), &ctx);
        }
        let entry = Arc::new(WindowEntry {
            watchdog,
            state: Mutex::new(WindowState {
                interp,
                scope: Scope::new(),
                lib: AST::empty(),
            }),
            actions: ActionBuffer::new(),
            scheduler: Mutex::new(None),
        });
        self.windows.write().unwrap_or_else(PoisonError::into_inner).insert(window, entry);
        window
    }

    fn navigate(&self, window: WindowId, url: &str) -> Page {
        let page = Page::new(window, url);
        if !self.inert() && self.window_entry(window).is_some() {
            self.liveness.navigate(window, &page);
        }
        page
    }

    fn close_window(&self, window: WindowId) {
        let entry = self.windows.write().unwrap_or_else(PoisonError::into_inner).remove(&window);
        self.liveness.close(window);
        let Some(entry) = entry else { return };
        entry.watchdog.halt();
        entry.actions.clear();
        let scheduler = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(scheduler) = scheduler {
            scheduler.stop(STOP_GRACE);
        }
    }

    fn execute(
        &self,
        page: &Page,
        source: &str,
        name: &str,
        start_line: usize,
    ) -> Result<Dynamic, ScriptError> {
        if self.inert() || !self.liveness.is_live(page) {
            return Ok(Dynamic::UNIT);
        }
        let Some(entry) = self.window_entry(page.window()) else { return Ok(Dynamic::UNIT) };
        let unit = match self.compiler.compile(source, name, start_line) {
            Ok(unit) => unit,
            Err(error) => return self.finish_failure(error, page),
        };
        self.run_unit(&entry, page, &unit)
    }

    fn execute_cached(
        &self,
        page: &Page,
        url: &str,
        validator: &str,
        source: &str,
        start_line: usize,
    ) -> Result<Dynamic, ScriptError> {
        if self.inert() || !self.liveness.is_live(page) {
            return Ok(Dynamic::UNIT);
        }
        let Some(entry) = self.window_entry(page.window()) else { return Ok(Dynamic::UNIT) };
        let key = CacheKey::new(url, validator);
        let unit = match self.cache.get_or_compile(key, || self.compiler.compile(source, url, start_line))
        {
            Ok(unit) => unit,
            Err(error) => return self.finish_failure(error, page),
        };
        self.run_unit(&entry, page, &unit)
    }

    fn compile(
        &self,
        page: &Page,
        source: &str,
        name: &str,
        start_line: usize,
    ) -> Result<CompiledUnit, ScriptError> {
        self.compiler.compile(source, name, start_line).map_err(|mut error| {
            error.url = Some(page.url().to_string());
            error
        })
    }

    fn call_function(
        &self,
        page: &Page,
        callback: &BoundCallback,
        this: Option<Dynamic>,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, ScriptError> {
        if self.inert() || !self.liveness.is_live(callback.page()) {
            return Ok(Dynamic::UNIT);
        }
        let Some(entry) = self.window_entry(callback.window) else { return Ok(Dynamic::UNIT) };
        match self.eval_callback(&entry, callback, this, args) {
            Ok(value) => Ok(value),
            Err(EvalFailure::Halted) => Ok(Dynamic::UNIT),
            Err(EvalFailure::Error(error)) => self.finish_failure(error, page),
        }
    }

    fn run_unit(
        &self,
        entry: &WindowEntry,
        page: &Page,
        unit: &CompiledUnit,
    ) -> Result<Dynamic, ScriptError> {
        let (result, finished) = {
            let mut state = entry.state.lock().unwrap_or_else(PoisonError::into_inner);
            if self.liveness.is_live(page) {
                let _deadline = entry.watchdog.arm(self.timeout());
                entry.actions.begin();
                let WindowState { interp, scope, lib } = &mut *state;
                let program = lib.merge(&unit.ast);
                let outcome = interp.eval(scope, &program, unit.name(), unit.start_line());
                if outcome.is_ok() {
                    lib.combine(unit.ast.clone_functions_only());
                }
                // drain while still holding the state lock
                (outcome, entry.actions.take_finished())
            } else {
                (Ok(Dynamic::UNIT), Vec::new())
            }
        };
        self.run_actions(finished);
        match result {
            Ok(value) => Ok(value),
            Err(EvalFailure::Halted) => Ok(Dynamic::UNIT),
            Err(EvalFailure::Error(error)) => self.finish_failure(error, page),
        }
    }

    fn eval_callback(
        &self,
        entry: &WindowEntry,
        callback: &BoundCallback,
        this: Option<Dynamic>,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, EvalFailure> {
        let (result, finished) = {
            let mut state = entry.state.lock().unwrap_or_else(PoisonError::into_inner);
            if self.liveness.is_live(callback.page()) {
                let _deadline = entry.watchdog.arm(self.timeout());
                entry.actions.begin();
                let WindowState { interp, scope, lib } = &mut *state;
                let outcome = match &callback.callable {
                    ScriptCallback::Function(fn_ptr) => {
                        interp.call_fn_ptr(fn_ptr, lib, args, fn_ptr.fn_name())
                    }
                    ScriptCallback::Named(name) => {
                        let mut this = this.unwrap_or(Dynamic::UNIT);
                        interp.call_named(scope, lib, name, &mut this, args, name)
                    }
                    ScriptCallback::Source(source) => match interp.compile(source, CALLBACK_UNIT, 1) {
                        Ok(unit) => {
                            let program = lib.merge(&unit.ast);
                            let outcome = interp.eval(scope, &program, CALLBACK_UNIT, 1);
                            if outcome.is_ok() {
                                lib.combine(unit.ast.clone_functions_only());
                            }
                            outcome
                        }
                        Err(error) => Err(EvalFailure::Error(error)),
                    },
                };
                // drain while still holding the state lock
                (outcome, entry.actions.take_finished())
            } else {
                (Ok(Dynamic::UNIT), Vec::new())
            }
        };
        self.run_actions(finished);
        result
    }

    fn run_actions(&self, finished: Vec<PostponedAction>) {
        for action in finished {
            if self.inert() {
                return;
            }
            if self.liveness.is_live(&action.page) {
                (action.run)();
            }
        }
    }

    fn finish_failure(&self, mut error: ScriptError, page: &Page) -> Result<Dynamic, ScriptError> {
        error.url = Some(page.url().to_string());
        self.report(&error);
        if self.throws() {
            Err(error)
        } else {
            Ok(Dynamic::UNIT)
        }
    }

    fn schedule_job(
        &self,
        page: &Page,
        callback: ScriptCallback,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Option<JobId> {
        if self.inert() || !self.liveness.is_live(page) {
            return None;
        }
        let entry = self.window_entry(page.window())?;
        let scheduler = self.ensure_scheduler(page.window(), &entry)?;
        Some(scheduler.enqueue(BoundCallback::new(page, callback), delay, interval))
    }

    fn cancel_job(&self, window: WindowId, id: JobId) -> bool {
        let Some(entry) = self.window_entry(window) else { return false };
        let scheduler = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match scheduler {
            Some(scheduler) => scheduler.cancel(id),
            None => false,
        }
    }

    fn job_count(&self, window: WindowId) -> usize {
        let Some(entry) = self.window_entry(window) else { return 0 };
        let scheduler = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match scheduler {
            Some(scheduler) => scheduler.pending(),
            None => 0,
        }
    }

    fn wait_for_jobs(&self, window: WindowId, max_wait: Duration) -> usize {
        let Some(entry) = self.window_entry(window) else { return 0 };
        let scheduler = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match scheduler {
            Some(scheduler) => scheduler.wait_until_idle(max_wait),
            None => 0,
        }
    }

    fn start_event_loop(&self, window: WindowId) {
        if self.inert() {
            return;
        }
        if let Some(entry) = self.window_entry(window) {
            let _ = self.ensure_scheduler(window, &entry);
        }
    }

    fn ensure_scheduler(&self, window: WindowId, entry: &WindowEntry) -> Option<Arc<WindowScheduler>> {
        let mut slot = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            if self.inert() {
                return None;
            }
            *slot = WindowScheduler::spawn(window, self.me.clone()).map(Arc::new);
        }
        slot.clone()
    }

    fn postpone(&self, page: &Page, action: Box<dyn FnOnce() + Send>) -> Result<(), ScriptError> {
        if self.inert() {
            return Ok(());
        }
        let Some(entry) = self.window_entry(page.window()) else {
            return Err(ScriptError::contract(format!(
                "no script call is in flight on {}",
                page.window()
            )));
        };
        if entry.actions.push(PostponedAction { page: page.clone(), run: action }) {
            Ok(())
        } else {
            Err(ScriptError::contract(format!("no script call is in flight on {}", page.window())))
        }
    }

    pub(crate) fn fire_job(&self, job: &Job) -> bool {
        if self.inert() || !self.liveness.is_live(job.callback.page()) {
            return false;
        }
        let Some(entry) = self.window_entry(job.callback.window) else { return false };
        match self.eval_callback(&entry, &job.callback, None, Vec::new()) {
            Ok(_) => true,
            Err(EvalFailure::Halted) => false,
            Err(EvalFailure::Error(mut error)) => {
                error.url = Some(job.callback.page().url().to_string());
                self.report(&error);
                true
            }
        }
    }

    fn shutdown(&self) {
        if self.inert.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
    }

    fn teardown(&self) {
        // binder closures may capture the engine handle
        self.binder.write().unwrap_or_else(PoisonError::into_inner).take();
        let entries: Vec<(WindowId, Arc<WindowEntry>)> = {
            let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
            windows.drain().collect()
        };
        for (_, entry) in &entries {
            entry.watchdog.halt();
            entry.actions.clear();
        }
        for (window, entry) in entries {
            self.liveness.close(window);
            let scheduler = entry.scheduler.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(scheduler) = scheduler {
                scheduler.stop(STOP_GRACE);
            }
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        if !self.inert() {
            self.teardown();
        }
    }
}

fn register_window_api(engine: &mut rhai::Engine, ctx: &WindowContext) {
    let timers = ctx.clone();
    engine.register_fn("set_timeout", move |callback: FnPtr, millis: INT| -> INT {
        job_handle(timers.schedule(ScriptCallback::Function(callback), delay_from(millis), None))
    });
    let timers = ctx.clone();
    engine.register_fn("set_timeout", move |source: &str, millis: INT| -> INT {
        job_handle(timers.schedule(ScriptCallback::Source(source.to_string()), delay_from(millis), None))
    });
    let timers = ctx.clone();
    engine.register_fn("set_interval", move |callback: FnPtr, millis: INT| -> INT {
        let period = delay_from(millis);
        job_handle(timers.schedule(ScriptCallback::Function(callback), period, Some(period)))
    });
    let timers = ctx.clone();
    engine.register_fn("set_interval", move |source: &str, millis: INT| -> INT {
        let period = delay_from(millis);
        job_handle(timers.schedule(ScriptCallback::Source(source.to_string()), period, Some(period)))
    });
    let timers = ctx.clone();
    engine.register_fn("clear_timeout", move |id: INT| {
        timers.cancel(JobId(id.max(0) as u64));
    });
    let timers = ctx.clone();
    engine.register_fn("clear_interval", move |id: INT| {
        timers.cancel(JobId(id.max(0) as u64));
    });
    let alerts = ctx.clone();
    engine.register_fn("alert", move |message: Dynamic| {
        alerts.alert(&message.to_string());
    });
    engine.register_fn("log", |message: Dynamic| {
        println!("[script] {message}");
    });
}

fn delay_from(millis: INT) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

fn job_handle(id: Option<JobId>) -> INT {
    id.map(|id| id.as_u64() as INT).unwrap_or(0)
}

/// Client-scoped script runtime; cheap to clone, all clones share one engine.
/// Engines for different emulated clients never share state.
#[derive(Clone)]
pub struct ScriptEngine {
    core: Arc<EngineCore>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_config(&ScriptConfig::default())
    }

    pub fn with_config(config: &ScriptConfig) -> Self {
        Self { core: EngineCore::new(config) }
    }

    /// Identity of this engine's interpreter factory.
    pub fn factory_id(&self) -> u64 {
        self.core.factory.id()
    }

    pub fn create_window(&self) -> WindowId {
        self.core.create_window()
    }

    /// Replaces the window's current page with a fresh one for `url`. Pages
    /// returned after shutdown or for an unknown window are stale from birth.
    pub fn navigate(&self, window: WindowId, url: &str) -> Page {
        self.core.navigate(window, url)
    }

    pub fn close_window(&self, window: WindowId) {
        self.core.close_window(window);
    }

    /// Compiles and evaluates a script unit in the page's window scope.
    /// Failures are reported and, unless `throw_on_error` is set, swallowed.
    pub fn execute(
        &self,
        page: &Page,
        source: &str,
        name: &str,
        start_line: usize,
    ) -> Result<Dynamic, ScriptError> {
        self.core.execute(page, source, name, start_line)
    }

    /// As `execute`, but reuses the compiled form of an external resource:
    /// at most one compile per `(url, validator)` for this engine's lifetime.
    pub fn execute_cached(
        &self,
        page: &Page,
        url: &str,
        validator: &str,
        source: &str,
        start_line: usize,
    ) -> Result<Dynamic, ScriptError> {
        self.core.execute_cached(page, url, validator, source, start_line)
    }

    /// Compiles without evaluating. Never consults or fills the cache.
    pub fn compile(
        &self,
        page: &Page,
        source: &str,
        name: &str,
        start_line: usize,
    ) -> Result<CompiledUnit, ScriptError> {
        self.core.compile(page, source, name, start_line)
    }

    /// Invokes a callback against its creation-time window and scope. The
    /// callback's own page decides liveness; `this` binds for named callbacks.
    pub fn call_function(
        &self,
        page: &Page,
        callback: &BoundCallback,
        this: Option<Dynamic>,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, ScriptError> {
        self.core.call_function(page, callback, this, args)
    }

    /// `None` when the page is stale or the engine has shut down.
    pub fn schedule_job(
        &self,
        page: &Page,
        callback: ScriptCallback,
        delay: Duration,
        interval: Option<Duration>,
    ) -> Option<JobId> {
        self.core.schedule_job(page, callback, delay, interval)
    }

    pub fn cancel_job(&self, window: WindowId, id: JobId) -> bool {
        self.core.cancel_job(window, id)
    }

    /// Jobs registered or firing on the window right now.
    pub fn job_count(&self, window: WindowId) -> usize {
        self.core.job_count(window)
    }

    /// Waits up to `max_wait` for the window's job queue to drain; returns
    /// how many jobs are still pending.
    pub fn wait_for_jobs(&self, window: WindowId, max_wait: Duration) -> usize {
        self.core.wait_for_jobs(window, max_wait)
    }

    /// Ensures the window's job worker is running; a no-op after shutdown.
    pub fn start_event_loop(&self, window: WindowId) {
        self.core.start_event_loop(window);
    }

    /// Defers host work until the call in flight on the page's window
    /// returns; errors if none is.
    pub fn postpone(
        &self,
        page: &Page,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<(), ScriptError> {
        self.core.postpone(page, Box::new(action))
    }

    /// Stops all workers and interrupts in-flight evaluations. Idempotent and
    /// bounded in time; every engine entry point is a no-op afterwards.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.inert()
    }

    pub fn timeout_millis(&self) -> u64 {
        self.core.timeout_millis.load(Ordering::Relaxed)
    }

    /// Deadline for each top-level evaluation; 0 disables it. Takes effect
    /// for calls started after the store.
    pub fn set_timeout_millis(&self, millis: u64) {
        self.core.timeout_millis.store(millis, Ordering::Relaxed);
    }

    pub fn throw_on_error(&self) -> bool {
        self.core.throws()
    }

    pub fn set_throw_on_error(&self, throw: bool) {
        self.core.throw_on_error.store(throw, Ordering::Relaxed);
    }

    pub fn set_error_reporter(&self, reporter: Arc<dyn ErrorReporter>) {
        *self.core.reporter.write().unwrap_or_else(PoisonError::into_inner) = reporter;
    }

    pub fn set_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        *self.core.alerts.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn set_host_binder(&self, binder: HostBinder) {
        *self.core.binder.write().unwrap_or_else(PoisonError::into_inner) = Some(binder);
    }

    /// Cache-miss compiles performed by `execute_cached` so far.
    pub fn compile_count(&self) -> u64 {
        self.core.cache.compile_count()
    }

    pub fn cached_unit_count(&self) -> usize {
        self.core.cache.len()
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}
